//! Axis calibration: zero-reference offset and count-to-distance scale.
//!
//! The encoder reports raw counts from wherever it was powered on; physical
//! positions only exist relative to a calibrated zero. [`PositionAxis`]
//! establishes that zero once per session by driving the carriage to its
//! reference position and latching the count found there.

use crate::error::{AppResult, FtsError};
use crate::hardware::capabilities::{CountReadout, Movable};
use crate::scan::sample::{PositionSample, Sample};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{info, warn};

/// The set-once calibration of one axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    /// Raw count at the physical zero position
    pub offset: i64,
    /// Physical distance per count, in mm
    pub resolution_mm: f64,
}

impl Calibration {
    /// Convert a raw count to a position in mm.
    pub fn position_mm(&self, raw_count: i64) -> f64 {
        (raw_count - self.offset) as f64 * self.resolution_mm
    }

    /// Derive a position sample from an encoder sample, if it carries a
    /// raw count.
    pub fn position_sample(&self, sample: &Sample) -> Option<PositionSample> {
        sample.payload.raw_count().map(|raw| PositionSample {
            timestamp: sample.timestamp,
            position: self.position_mm(raw),
        })
    }
}

/// A motor/encoder pair with a calibrated zero.
///
/// Point queries through [`PositionAxis::position`] read the encoder
/// synchronously and are meant for use outside an active scan; the scan
/// engine itself converts streamed counts with a [`Calibration`] copy.
pub struct PositionAxis {
    motor: Arc<dyn Movable>,
    counter: Arc<dyn CountReadout>,
    resolution_mm: f64,
    calibration: OnceCell<Calibration>,
}

impl PositionAxis {
    /// Create an uncalibrated axis.
    pub fn new(
        motor: Arc<dyn Movable>,
        counter: Arc<dyn CountReadout>,
        resolution_mm: f64,
    ) -> Self {
        Self {
            motor,
            counter,
            resolution_mm,
            calibration: OnceCell::new(),
        }
    }

    /// Drive the carriage to its physical zero and latch the raw count
    /// found there as the offset.
    ///
    /// Calibration is set-once: a repeated call keeps the existing offset
    /// and only logs a warning.
    pub async fn find_offset(&self) -> AppResult<Calibration> {
        if let Some(existing) = self.calibration.get() {
            warn!("axis already calibrated; keeping existing offset");
            return Ok(*existing);
        }

        self.motor.move_abs(0.0, None).await?;
        self.motor.wait_settled().await?;
        let offset = self.counter.read_count().await?;

        let calibration = Calibration {
            offset,
            resolution_mm: self.resolution_mm,
        };
        info!(offset, resolution_mm = self.resolution_mm, "axis calibrated");
        Ok(*self.calibration.get_or_init(|| calibration))
    }

    /// The calibration, if `find_offset` has completed.
    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration.get().copied()
    }

    /// Read one encoder count and convert it to a position in mm.
    ///
    /// Fails with [`FtsError::NotCalibrated`] before `find_offset`.
    pub async fn position(&self) -> AppResult<f64> {
        let calibration = self.calibration.get().ok_or(FtsError::NotCalibrated)?;
        let raw = self.counter.read_count().await?;
        Ok(calibration.position_mm(raw))
    }
}
