//! Hardware layer: capability traits, device drivers, and mocks.
//!
//! The scan engine never names a concrete device; it sees
//! [`capabilities::Movable`], [`capabilities::Streamable`], and
//! [`capabilities::CountReadout`] trait objects. [`build_bench`] assembles
//! those from the configuration, wiring mock devices to one shared
//! [`mock::SimCarriage`] so a hardware-free run still behaves like the
//! physical bench.

pub mod capabilities;
pub mod mock;

#[cfg(feature = "instrument_serial")]
pub mod encoder;
#[cfg(feature = "instrument_serial")]
pub mod sr865;
#[cfg(feature = "instrument_serial")]
pub mod zaber;

pub mod toptica;

use crate::config::{EncoderKind, FtsConfig, MotorKind, SensorKindConfig};
use crate::error::AppResult;
use crate::scan::sample::SensorKind;
use anyhow::{bail, Result};
use capabilities::{CountReadout, Movable, Streamable};
use mock::{MockEncoder, MockFrequencySource, MockLockin, MockStage, SimCarriage};
use std::sync::Arc;

/// Convert a length to mm. `None` means the value is already in mm.
pub fn length_to_mm(value: f64, unit: Option<&str>) -> Result<f64> {
    match unit.unwrap_or("mm") {
        "mm" => Ok(value),
        "um" | "µm" => Ok(value / 1000.0),
        "cm" => Ok(value * 10.0),
        other => bail!("Unsupported length unit '{other}'"),
    }
}

/// Convert a velocity to mm/s. `None` means the value is already in mm/s.
pub fn velocity_to_mm_s(value: f64, unit: Option<&str>) -> Result<f64> {
    match unit.unwrap_or("mm/s") {
        "mm/s" => Ok(value),
        "um/s" | "µm/s" => Ok(value / 1000.0),
        "cm/s" => Ok(value * 10.0),
        other => bail!("Unsupported velocity unit '{other}'"),
    }
}

/// The assembled instrument bench the scan engine runs against.
pub struct Bench {
    /// Carriage motion control
    pub motor: Arc<dyn Movable>,
    /// Encoder in streaming mode, for the scan's encoder reader
    pub encoder_stream: Arc<dyn Streamable>,
    /// Encoder point readout, for calibration and position queries
    pub encoder_count: Arc<dyn CountReadout>,
    /// The active sensor stream
    pub sensor: Arc<dyn Streamable>,
    /// Which record layout the sensor produces
    pub sensor_kind: SensorKind,
}

#[cfg(feature = "instrument_serial")]
async fn build_zaber(config: &FtsConfig) -> AppResult<Arc<dyn Movable>> {
    let stage = zaber::ZaberStage::connect(&config.motor.port, 1, 1)?;
    stage.init().await?;
    Ok(Arc::new(stage))
}

#[cfg(not(feature = "instrument_serial"))]
async fn build_zaber(_config: &FtsConfig) -> AppResult<Arc<dyn Movable>> {
    Err(crate::error::FtsError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

#[cfg(feature = "instrument_serial")]
async fn build_serial_encoder(
    config: &FtsConfig,
) -> AppResult<(Arc<dyn Streamable>, Arc<dyn CountReadout>)> {
    let counter = Arc::new(encoder::EncoderCounter::connect(
        &config.encoder.port,
        config.encoder.baud,
    )?);
    counter.init().await?;
    Ok((counter.clone(), counter))
}

#[cfg(not(feature = "instrument_serial"))]
async fn build_serial_encoder(
    _config: &FtsConfig,
) -> AppResult<(Arc<dyn Streamable>, Arc<dyn CountReadout>)> {
    Err(crate::error::FtsError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

#[cfg(feature = "instrument_serial")]
fn build_sr865(config: &FtsConfig) -> AppResult<Arc<dyn Streamable>> {
    let lockin = sr865::Sr865Lockin::connect(&config.sensor.port, config.sensor.gpib_address)?;
    Ok(Arc::new(lockin))
}

#[cfg(not(feature = "instrument_serial"))]
fn build_sr865(_config: &FtsConfig) -> AppResult<Arc<dyn Streamable>> {
    Err(crate::error::FtsError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

async fn build_toptica(config: &FtsConfig) -> AppResult<Arc<dyn Streamable>> {
    let dlc = toptica::TopticaDlc::connect(
        &config.sensor.host,
        config.sensor.tcp_port,
        config.sensor.emission_ghz,
        toptica::LockinSetup {
            frequency_hz: config.sensor.lockin_freq_hz,
            integration_time_ms: config.sensor.integration_time_ms,
            amplifier_gain: config.sensor.amplifier_gain,
            phase_deg: 0.0,
        },
    )
    .await?;
    Ok(Arc::new(dlc))
}

/// Build the instrument bench described by the configuration.
///
/// Serial-attached devices require the `instrument_serial` feature; mock
/// devices and the Toptica TCP driver are always available.
pub async fn build_bench(config: &FtsConfig) -> AppResult<Bench> {
    // One simulated carriage shared by whichever devices are mocked. Cheap
    // enough to build unconditionally.
    let carriage = SimCarriage::new((0.0, config.motor.mock_track_mm));

    let motor: Arc<dyn Movable> = match config.motor.kind {
        MotorKind::Mock => Arc::new(MockStage::new(carriage.clone())),
        MotorKind::Zaber => build_zaber(config).await?,
    };

    let (encoder_stream, encoder_count): (Arc<dyn Streamable>, Arc<dyn CountReadout>) =
        match config.encoder.kind {
            EncoderKind::Mock => {
                let encoder = Arc::new(MockEncoder::new(
                    carriage.clone(),
                    config.encoder.resolution_mm,
                ));
                (encoder.clone() as Arc<dyn Streamable>, encoder)
            }
            EncoderKind::Serial => build_serial_encoder(config).await?,
        };

    let (sensor, sensor_kind): (Arc<dyn Streamable>, SensorKind) = match config.sensor.kind {
        SensorKindConfig::MockLockin => {
            let wavelength_mm = crate::optics::wavelength_mm(config.sensor.emission_ghz);
            (
                Arc::new(MockLockin::new().with_carriage(carriage.clone(), wavelength_mm)),
                SensorKind::Quadrature,
            )
        }
        SensorKindConfig::MockFrequency => (
            Arc::new(MockFrequencySource::new(config.sensor.emission_ghz)),
            SensorKind::Frequency,
        ),
        SensorKindConfig::Lockin => (build_sr865(config)?, SensorKind::Quadrature),
        SensorKindConfig::Frequency => (build_toptica(config).await?, SensorKind::Frequency),
    };

    Ok(Bench {
        motor,
        encoder_stream,
        encoder_count,
        sensor,
        sensor_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions() {
        assert_eq!(length_to_mm(1.5, None).unwrap(), 1.5);
        assert_eq!(length_to_mm(1500.0, Some("um")).unwrap(), 1.5);
        assert_eq!(length_to_mm(0.15, Some("cm")).unwrap(), 1.5);
        assert!(length_to_mm(1.0, Some("furlong")).is_err());

        assert_eq!(velocity_to_mm_s(2.0, Some("mm/s")).unwrap(), 2.0);
        assert_eq!(velocity_to_mm_s(500.0, Some("um/s")).unwrap(), 0.5);
        assert!(velocity_to_mm_s(1.0, Some("mph")).is_err());
    }

    #[tokio::test]
    async fn mock_bench_builds_from_defaults() {
        let config = FtsConfig::default();
        let bench = build_bench(&config).await.unwrap();
        assert_eq!(bench.sensor_kind, SensorKind::Quadrature);
        assert_eq!(bench.motor.travel_limits(), (0.0, 50.0));
        assert!(bench.encoder_count.read_count().await.unwrap() >= 1000);
    }
}
