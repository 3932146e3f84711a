//! Atomic hardware capabilities.
//!
//! Fine-grained capability traits that the spectrometer's devices implement.
//! Instead of one monolithic instrument trait, each device implements only
//! what it can actually do:
//!
//! - the Zaber carriage stage implements [`Movable`]
//! - the encoder counter implements [`CountReadout`] + [`Streamable`]
//! - the lock-in amplifier and the frequency source implement [`Streamable`]
//!
//! The scan engine is written entirely against these traits, so the whole
//! system runs against the mocks in [`crate::hardware::mock`] with no code
//! changes.
//!
//! Each capability trait is async (`#[async_trait]`), thread-safe
//! (`Send + Sync`, `&self` methods with interior mutability in the
//! implementations), and uses `anyhow::Result` for errors. A failed call is
//! a device-level fault; policy about retrying or giving up belongs to the
//! caller.

use crate::scan::sample::Payload;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: motion control.
///
/// Positions and distances are in the working length unit (mm) unless a
/// unit string ("mm", "um", "mm/s", "um/s") is supplied with the call.
///
/// # Contract
/// - `move_abs` and `move_velocity` initiate motion and may return before
///   the carriage arrives
/// - `wait_settled` blocks (with an internal timeout) until motion ends
/// - `travel_limits` is cached at connect time and cheap to call
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to an absolute position along the track.
    async fn move_abs(&self, position: f64, unit: Option<&str>) -> Result<()>;

    /// Move at a constant velocity from the current position until the end
    /// of the track or a `stop`.
    async fn move_velocity(&self, velocity: f64, unit: Option<&str>) -> Result<()>;

    /// Halt motion in progress.
    async fn stop(&self) -> Result<()>;

    /// Block until the device reports motion complete.
    async fn wait_settled(&self) -> Result<()>;

    /// Lower and upper travel limits of the axis, in mm.
    fn travel_limits(&self) -> (f64, f64);
}

/// Capability: continuous sample stream.
///
/// Devices that can be put into a transmission mode and then polled for one
/// reading at a time. `read_sample` must bound its own wait (serial/TCP
/// timeout) so a silent device cannot wedge a poll task; a timeout is an
/// ordinary `Err`.
#[async_trait]
pub trait Streamable: Send + Sync {
    /// Put the device into transmission mode.
    async fn start_stream(&self) -> Result<()>;

    /// Release transmission mode. Must be safe to call when not streaming.
    async fn stop_stream(&self) -> Result<()>;

    /// Read one fully-formed sample, or fail within the device timeout.
    async fn read_sample(&self) -> Result<Payload>;
}

/// Capability: single position count readout.
///
/// One-shot query of the encoder's raw count, used for calibration and for
/// point position queries outside a scan.
#[async_trait]
pub trait CountReadout: Send + Sync {
    /// Read the current raw count.
    async fn read_count(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedCounter {
        count: Mutex<i64>,
    }

    #[async_trait]
    impl CountReadout for FixedCounter {
        async fn read_count(&self) -> Result<i64> {
            Ok(*self.count.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn count_readout_trait_object() {
        let counter: std::sync::Arc<dyn CountReadout> = std::sync::Arc::new(FixedCounter {
            count: Mutex::new(1234),
        });
        assert_eq!(counter.read_count().await.unwrap(), 1234);
    }
}
