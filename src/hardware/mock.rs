//! Mock hardware implementations.
//!
//! Simulated devices for running the scan engine without the spectrometer.
//! A [`SimCarriage`] holds the shared kinematic state; the mock stage writes
//! to it and the mock encoder derives counts from it, so a mock scan behaves
//! like the real bench: command a velocity, watch the counts climb, hit the
//! end of the track.
//!
//! All mocks use `tokio::time::sleep` (never `std::thread::sleep`) and keep
//! call counters so tests can assert teardown behavior. The encoder and the
//! sensors support failure injection (`failing_after`) to exercise the
//! reader health path.

use crate::hardware::capabilities::{CountReadout, Movable, Streamable};
use crate::hardware::{length_to_mm, velocity_to_mm_s};
use crate::scan::sample::{FrequencyReading, Payload, Quadrature};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

// =============================================================================
// SimCarriage - shared simulated axis state
// =============================================================================

struct CarriageMotion {
    anchor_mm: f64,
    velocity_mm_s: f64,
    since: Instant,
}

/// Kinematic state of the simulated carriage, shared between the mock stage
/// and the mock encoder.
pub struct SimCarriage {
    motion: Mutex<CarriageMotion>,
    limits: (f64, f64),
}

impl SimCarriage {
    /// Create a carriage at rest at the lower travel limit.
    pub fn new(limits: (f64, f64)) -> Arc<Self> {
        Arc::new(Self {
            motion: Mutex::new(CarriageMotion {
                anchor_mm: limits.0,
                velocity_mm_s: 0.0,
                since: Instant::now(),
            }),
            limits,
        })
    }

    /// Current position, clamped to the travel limits.
    pub fn position_mm(&self) -> f64 {
        let motion = self.motion.lock().unwrap();
        let travelled = motion.velocity_mm_s * motion.since.elapsed().as_secs_f64();
        (motion.anchor_mm + travelled).clamp(self.limits.0, self.limits.1)
    }

    /// Travel limits, in mm.
    pub fn limits(&self) -> (f64, f64) {
        self.limits
    }

    fn set_velocity(&self, velocity_mm_s: f64) {
        let position = self.position_mm();
        let mut motion = self.motion.lock().unwrap();
        motion.anchor_mm = position;
        motion.velocity_mm_s = velocity_mm_s;
        motion.since = Instant::now();
    }

    fn jump_to(&self, position_mm: f64) {
        let mut motion = self.motion.lock().unwrap();
        motion.anchor_mm = position_mm.clamp(self.limits.0, self.limits.1);
        motion.velocity_mm_s = 0.0;
        motion.since = Instant::now();
    }
}

// =============================================================================
// MockStage
// =============================================================================

/// Simulated carriage stage.
pub struct MockStage {
    carriage: Arc<SimCarriage>,
    settle: Duration,
    stop_calls: AtomicUsize,
}

impl MockStage {
    /// Create a stage driving the given carriage.
    pub fn new(carriage: Arc<SimCarriage>) -> Self {
        Self {
            carriage,
            settle: Duration::from_millis(10),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// How many times `stop` has been called.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, position: f64, unit: Option<&str>) -> Result<()> {
        let target = length_to_mm(position, unit)?;
        sleep(self.settle).await;
        self.carriage.jump_to(target);
        Ok(())
    }

    async fn move_velocity(&self, velocity: f64, unit: Option<&str>) -> Result<()> {
        let mm_s = velocity_to_mm_s(velocity, unit)?;
        self.carriage.set_velocity(mm_s);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.carriage.set_velocity(0.0);
        Ok(())
    }

    async fn wait_settled(&self) -> Result<()> {
        sleep(self.settle).await;
        Ok(())
    }

    fn travel_limits(&self) -> (f64, f64) {
        self.carriage.limits()
    }
}

// =============================================================================
// MockEncoder
// =============================================================================

/// Simulated quadrature counter deriving counts from the carriage position.
pub struct MockEncoder {
    carriage: Arc<SimCarriage>,
    resolution_mm: f64,
    zero_count: i64,
    interval: Duration,
    fail_after: Option<usize>,
    reads: AtomicUsize,
    stream_starts: AtomicUsize,
    stream_stops: AtomicUsize,
}

impl MockEncoder {
    /// Create an encoder watching the given carriage.
    pub fn new(carriage: Arc<SimCarriage>, resolution_mm: f64) -> Self {
        Self {
            carriage,
            resolution_mm,
            // Arbitrary nonzero count at the physical zero, like a real
            // counter that was powered on mid-track.
            zero_count: 1000,
            interval: Duration::from_millis(5),
            fail_after: None,
            reads: AtomicUsize::new(0),
            stream_starts: AtomicUsize::new(0),
            stream_stops: AtomicUsize::new(0),
        }
    }

    /// Override the pacing between streamed samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Make every streamed read after the first `n` fail.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// How many times `stop_stream` has been called.
    pub fn stream_stops(&self) -> usize {
        self.stream_stops.load(Ordering::SeqCst)
    }

    fn count(&self) -> i64 {
        self.zero_count + (self.carriage.position_mm() / self.resolution_mm).round() as i64
    }
}

#[async_trait]
impl CountReadout for MockEncoder {
    async fn read_count(&self) -> Result<i64> {
        Ok(self.count())
    }
}

#[async_trait]
impl Streamable for MockEncoder {
    async fn start_stream(&self) -> Result<()> {
        self.stream_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        self.stream_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_sample(&self) -> Result<Payload> {
        sleep(self.interval).await;
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if n >= limit {
                bail!("injected encoder fault");
            }
        }
        Ok(Payload::RawCount(self.count()))
    }
}

// =============================================================================
// MockLockin
// =============================================================================

/// Simulated lock-in amplifier.
///
/// When given a carriage, the magnitude traces an interferogram fringe of
/// the configured wavelength; otherwise it is a noisy constant.
pub struct MockLockin {
    carriage: Option<Arc<SimCarriage>>,
    wavelength_mm: f64,
    interval: Duration,
    fail_after: Option<usize>,
    reads: AtomicUsize,
    stream_stops: AtomicUsize,
}

impl MockLockin {
    /// Create a lock-in with no position dependence.
    pub fn new() -> Self {
        Self {
            carriage: None,
            wavelength_mm: 1.0,
            interval: Duration::from_millis(5),
            fail_after: None,
            reads: AtomicUsize::new(0),
            stream_stops: AtomicUsize::new(0),
        }
    }

    /// Tie the signal to the carriage position with the given fringe
    /// wavelength.
    pub fn with_carriage(mut self, carriage: Arc<SimCarriage>, wavelength_mm: f64) -> Self {
        self.carriage = Some(carriage);
        self.wavelength_mm = wavelength_mm;
        self
    }

    /// Override the pacing between streamed samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Make every streamed read after the first `n` fail.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// How many times `stop_stream` has been called.
    pub fn stream_stops(&self) -> usize {
        self.stream_stops.load(Ordering::SeqCst)
    }
}

impl Default for MockLockin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Streamable for MockLockin {
    async fn start_stream(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        self.stream_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_sample(&self) -> Result<Payload> {
        sleep(self.interval).await;
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if n >= limit {
                bail!("injected lock-in fault");
            }
        }

        // Two fringes per wavelength of carriage travel (double-pass OPD)
        let base = match &self.carriage {
            Some(carriage) => {
                let x = carriage.position_mm();
                0.5 * (1.0 + (4.0 * std::f64::consts::PI * x / self.wavelength_mm).cos())
            }
            None => 1.0,
        };
        let (noise, phase_deg) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-0.01..0.01), rng.gen_range(-5.0..5.0))
        };
        let r = (base + noise).max(0.0);
        let theta_rad = phase_deg * std::f64::consts::PI / 180.0;
        Ok(Payload::Quadrature(Quadrature {
            x: r * theta_rad.cos(),
            y: r * theta_rad.sin(),
            r,
            theta: phase_deg,
        }))
    }
}

// =============================================================================
// MockFrequencySource
// =============================================================================

/// Simulated laser frequency source.
pub struct MockFrequencySource {
    frequency_ghz: f64,
    interval: Duration,
    fail_after: Option<usize>,
    reads: AtomicUsize,
    stream_stops: AtomicUsize,
}

impl MockFrequencySource {
    /// Create a source emitting at the given frequency.
    pub fn new(frequency_ghz: f64) -> Self {
        Self {
            frequency_ghz,
            interval: Duration::from_millis(5),
            fail_after: None,
            reads: AtomicUsize::new(0),
            stream_stops: AtomicUsize::new(0),
        }
    }

    /// Override the pacing between streamed samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Make every streamed read after the first `n` fail.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// How many times `stop_stream` has been called.
    pub fn stream_stops(&self) -> usize {
        self.stream_stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Streamable for MockFrequencySource {
    async fn start_stream(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        self.stream_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_sample(&self) -> Result<Payload> {
        sleep(self.interval).await;
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if n >= limit {
                bail!("injected frequency source fault");
            }
        }

        let (freq_jitter, current_noise) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-0.005..0.005), rng.gen_range(-2.0..2.0))
        };
        Ok(Payload::Frequency(FrequencyReading {
            frequency_ghz: self.frequency_ghz + freq_jitter,
            photocurrent_na: 50.0 + current_noise,
            valid: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn carriage_integrates_velocity() {
        let carriage = SimCarriage::new((0.0, 50.0));
        let stage = MockStage::new(carriage.clone());

        stage.move_velocity(100.0, None).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        stage.stop().await.unwrap();

        let pos = carriage.position_mm();
        assert!(pos > 1.0, "carriage should have moved, got {pos} mm");
        assert!(pos < 50.0);
        assert_eq!(stage.stop_calls(), 1);

        // Stopped carriage stays put
        sleep(Duration::from_millis(20)).await;
        assert!((carriage.position_mm() - pos).abs() < 1e-6);
    }

    #[tokio::test]
    async fn carriage_respects_limits() {
        let carriage = SimCarriage::new((0.0, 5.0));
        let stage = MockStage::new(carriage.clone());

        stage.move_abs(100.0, None).await.unwrap();
        assert_eq!(carriage.position_mm(), 5.0);

        stage.move_abs(2.0, Some("mm")).await.unwrap();
        assert_eq!(carriage.position_mm(), 2.0);
    }

    #[tokio::test]
    async fn encoder_tracks_the_carriage() {
        let carriage = SimCarriage::new((0.0, 50.0));
        let encoder = MockEncoder::new(carriage.clone(), 0.001);

        assert_eq!(encoder.read_count().await.unwrap(), 1000);
        carriage.jump_to(1.0);
        assert_eq!(encoder.read_count().await.unwrap(), 2000);
    }

    #[tokio::test]
    async fn encoder_failure_injection() {
        let carriage = SimCarriage::new((0.0, 50.0));
        let encoder = MockEncoder::new(carriage, 0.001)
            .with_interval(Duration::from_millis(1))
            .failing_after(2);

        assert!(encoder.read_sample().await.is_ok());
        assert!(encoder.read_sample().await.is_ok());
        assert!(encoder.read_sample().await.is_err());
        assert!(encoder.read_sample().await.is_err());
    }

    #[tokio::test]
    async fn lockin_fringe_is_bounded() {
        let carriage = SimCarriage::new((0.0, 50.0));
        let lockin = MockLockin::new()
            .with_carriage(carriage, 0.5)
            .with_interval(Duration::from_millis(1));

        for _ in 0..5 {
            let payload = lockin.read_sample().await.unwrap();
            let Payload::Quadrature(q) = payload else {
                panic!("expected quadrature payload");
            };
            assert!((-0.02..=1.02).contains(&q.r));
        }
    }
}
