//! Sample and record types shared across the scan engine.
//!
//! A [`Sample`] is produced by a stream reader the moment a device read
//! completes and is immutable from then on. Timestamps are monotonic seconds
//! from a process-wide epoch so that samples from independently clocked
//! devices can be compared without wall-clock jumps.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since the process-wide epoch.
///
/// The epoch is fixed the first time any component asks for a timestamp, so
/// values are comparable across readers and the orchestrator within one run.
pub fn monotonic_seconds() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// A quadrature-demodulated lock-in reading.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quadrature {
    /// In-phase component
    pub x: f64,
    /// Quadrature component
    pub y: f64,
    /// Magnitude
    pub r: f64,
    /// Phase, in degrees
    pub theta: f64,
}

/// A reading from the laser frequency source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrequencyReading {
    /// Actual emission frequency, in GHz
    pub frequency_ghz: f64,
    /// Lock-in photocurrent, in nA
    pub photocurrent_na: f64,
    /// Whether the device reported the value as settled
    pub valid: bool,
}

/// What a single device read produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Raw encoder count
    RawCount(i64),
    /// Lock-in quadrature snapshot
    Quadrature(Quadrature),
    /// Frequency source reading
    Frequency(FrequencyReading),
}

impl Payload {
    /// The raw encoder count, if this payload carries one.
    pub fn raw_count(&self) -> Option<i64> {
        match self {
            Payload::RawCount(count) => Some(*count),
            _ => None,
        }
    }

    /// The sensor-side view of this payload, if it is not an encoder count.
    pub fn sensor_reading(&self) -> Option<SensorReading> {
        match self {
            Payload::RawCount(_) => None,
            Payload::Quadrature(q) => Some(SensorReading::Quadrature(*q)),
            Payload::Frequency(f) => Some(SensorReading::Frequency(*f)),
        }
    }
}

/// A timestamped device reading. Immutable once constructed.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Monotonic seconds at read completion
    pub timestamp: f64,
    /// The parsed device reading
    pub payload: Payload,
}

impl Sample {
    /// Stamp a payload with the current monotonic time.
    pub fn now(payload: Payload) -> Self {
        Self {
            timestamp: monotonic_seconds(),
            payload,
        }
    }
}

/// An encoder sample converted to a physical position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionSample {
    /// Timestamp of the underlying encoder sample, monotonic seconds
    pub timestamp: f64,
    /// Calibrated position, in the working length unit
    pub position: f64,
}

/// Which family of sensor feeds the scan, selecting record layout and the
/// output file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorKind {
    /// Lock-in amplifier producing (x, y, r, theta)
    Quadrature,
    /// Laser frequency source producing (frequency, photocurrent)
    Frequency,
}

/// A sensor value joined onto a scan record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SensorReading {
    /// Lock-in quadrature snapshot
    Quadrature(Quadrature),
    /// Frequency source reading
    Frequency(FrequencyReading),
}

/// One joined row of the scan: the encoder tick, the calibrated position,
/// and the nearest-in-time sensor reading. Fields are `None` when the
/// corresponding stream had nothing to offer on that tick. Created exactly
/// once per orchestrator tick and never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanRecord {
    /// Timestamp of the encoder sample backing this tick, monotonic seconds
    pub timestamp: Option<f64>,
    /// Calibrated carriage position, in the configured length unit
    pub position: Option<f64>,
    /// Nearest sensor reading, if the backlog held any candidates
    pub sensor: Option<SensorReading>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_seconds_is_nondecreasing() {
        let a = monotonic_seconds();
        let b = monotonic_seconds();
        assert!(b >= a);
    }

    #[test]
    fn payload_accessors() {
        assert_eq!(Payload::RawCount(42).raw_count(), Some(42));
        assert!(Payload::RawCount(42).sensor_reading().is_none());

        let quad = Payload::Quadrature(Quadrature {
            x: 1.0,
            y: 0.0,
            r: 1.0,
            theta: 0.0,
        });
        assert!(quad.raw_count().is_none());
        assert!(matches!(
            quad.sensor_reading(),
            Some(SensorReading::Quadrature(_))
        ));
    }
}
