//! Background stream readers.
//!
//! A [`StreamReader`] owns one device's sample stream: it puts the device
//! into transmission mode, polls it from a dedicated tokio task, and
//! publishes timestamped samples through two views:
//!
//! - a latest-value slot, overwritten on every successful read
//! - a backlog queue, drained atomically by the orchestrator once per tick
//!
//! The orchestrator only ever receives copies; the cache and the queue are
//! owned here, which keeps the hot path free of shared mutable device
//! state. Per-sample faults (malformed frame, one timed-out read) are
//! absorbed and counted; once `failure_threshold` consecutive reads fail
//! the reader marks itself unhealthy and the poll task exits. Health is
//! observable at any time via [`StreamReader::is_healthy`].

use crate::error::{AppResult, FtsError};
use crate::hardware::capabilities::Streamable;
use crate::scan::sample::Sample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop` waits for the poll task before declaring it stuck.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

struct ReaderShared {
    latest: StdMutex<Option<Sample>>,
    backlog: StdMutex<Vec<Sample>>,
    stopping: AtomicBool,
    healthy: AtomicBool,
}

/// Polls one streaming device from a background task.
pub struct StreamReader {
    label: String,
    device: Arc<dyn Streamable>,
    /// Pacing between polls for query-style devices; zero polls as fast as
    /// the device delivers
    poll_interval: Duration,
    failure_threshold: u32,
    shared: Arc<ReaderShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamReader {
    /// Create a reader for the given device. `label` names the stream in
    /// logs.
    pub fn new(label: impl Into<String>, device: Arc<dyn Streamable>) -> Self {
        Self {
            label: label.into(),
            device,
            poll_interval: Duration::ZERO,
            failure_threshold: 10,
            shared: Arc::new(ReaderShared {
                latest: StdMutex::new(None),
                backlog: StdMutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
            }),
            task: Mutex::new(None),
        }
    }

    /// Set the pacing between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how many consecutive read failures make the reader unhealthy.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Start transmission mode and spawn the poll task.
    ///
    /// Fails with [`FtsError::AlreadyActive`] if the reader is already
    /// polling.
    pub async fn start(&self) -> AppResult<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(FtsError::AlreadyActive);
        }

        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.healthy.store(true, Ordering::SeqCst);
        *self.shared.latest.lock().unwrap() = None;
        self.shared.backlog.lock().unwrap().clear();

        self.device.start_stream().await?;
        info!(reader = %self.label, "stream reader started");

        let device = self.device.clone();
        let shared = self.shared.clone();
        let label = self.label.clone();
        let poll_interval = self.poll_interval;
        let failure_threshold = self.failure_threshold;
        *task = Some(tokio::spawn(async move {
            poll_loop(device, shared, label, poll_interval, failure_threshold).await;
        }));

        Ok(())
    }

    /// Stop the poll task and release the device's transmission mode.
    ///
    /// Idempotent: stopping a reader that never started, or was already
    /// stopped, is a no-op. The task join is bounded; a task that does not
    /// exit in time is aborted and reported as
    /// [`FtsError::ReaderUnresponsive`] (the transmission toggle is still
    /// released).
    pub async fn stop(&self) -> AppResult<()> {
        let mut task = self.task.lock().await;
        let Some(mut handle) = task.take() else {
            return Ok(());
        };

        self.shared.stopping.store(true, Ordering::SeqCst);

        let joined = tokio::time::timeout(STOP_TIMEOUT, &mut handle).await;
        let stuck = joined.is_err();
        if stuck {
            warn!(reader = %self.label, "poll task did not exit in time; aborting");
            handle.abort();
        }

        if let Err(e) = self.device.stop_stream().await {
            warn!(reader = %self.label, error = %e, "failed to release transmission mode");
        }
        info!(reader = %self.label, "stream reader stopped");

        if stuck {
            return Err(FtsError::ReaderUnresponsive);
        }
        Ok(())
    }

    /// The most recent sample, without consuming the backlog. Never blocks.
    pub fn latest(&self) -> Option<Sample> {
        self.shared.latest.lock().unwrap().clone()
    }

    /// Atomically take every sample buffered since the previous call.
    ///
    /// The window between two calls bounds both memory use and the
    /// candidate set available for time-joining.
    pub fn drain(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.shared.backlog.lock().unwrap())
    }

    /// False once the device has failed `failure_threshold` reads in a row
    /// and the poll task has given up.
    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }
}

async fn poll_loop(
    device: Arc<dyn Streamable>,
    shared: Arc<ReaderShared>,
    label: String,
    poll_interval: Duration,
    failure_threshold: u32,
) {
    let mut consecutive_failures = 0u32;

    while !shared.stopping.load(Ordering::SeqCst) {
        match device.read_sample().await {
            Ok(payload) => {
                consecutive_failures = 0;
                let sample = Sample::now(payload);
                *shared.latest.lock().unwrap() = Some(sample.clone());
                shared.backlog.lock().unwrap().push(sample);
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(
                    reader = %label,
                    failures = consecutive_failures,
                    error = %e,
                    "dropped sample"
                );
                if consecutive_failures >= failure_threshold {
                    warn!(
                        reader = %label,
                        failures = consecutive_failures,
                        "marking reader unhealthy"
                    );
                    shared.healthy.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        if !poll_interval.is_zero() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockEncoder, SimCarriage};

    fn test_reader(fail_after: Option<usize>) -> StreamReader {
        let carriage = SimCarriage::new((0.0, 50.0));
        let mut encoder =
            MockEncoder::new(carriage, 0.001).with_interval(Duration::from_millis(2));
        if let Some(n) = fail_after {
            encoder = encoder.failing_after(n);
        }
        StreamReader::new("encoder", Arc::new(encoder))
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let reader = test_reader(None);
        reader.start().await.unwrap();
        assert!(matches!(
            reader.start().await,
            Err(FtsError::AlreadyActive)
        ));
        reader.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop_is_allowed() {
        let reader = test_reader(None);
        reader.start().await.unwrap();
        reader.stop().await.unwrap();
        reader.start().await.unwrap();
        reader.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_after_consecutive_failures() {
        let reader = test_reader(Some(2)).with_failure_threshold(3);
        reader.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_healthy());

        // Samples read before the fault are still visible
        assert!(reader.latest().is_some());
        reader.stop().await.unwrap();
    }
}
