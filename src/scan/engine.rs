//! Scan orchestration.
//!
//! [`ScanEngine`] owns the scan lifecycle:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Stopped(outcome)
//! ```
//!
//! `start` is single-flight: it is accepted only from `Idle` or `Stopped`,
//! checked atomically under the state lock, and rejected with
//! `AlreadyRunning` otherwise. On success it opens the incremental output
//! file, starts both stream readers, commands the carriage to scan
//! velocity, and spawns the tick-loop task; it returns as soon as the loop
//! is running.
//!
//! Each tick the loop reads the latest encoder sample, converts it through
//! the calibration, evaluates the termination policy, joins the drained
//! sensor backlog by nearest timestamp, and appends one record to both the
//! in-memory store and the flushed output file. The tick period is
//! best-effort: processing overruns are not corrected, the loop just skips
//! its sleep.
//!
//! Teardown (carriage stop, both reader stops, file close, finalized
//! dataset) runs exactly once on every exit path, including errors and
//! cancellation, guarded by an atomic flag.

use crate::data::{finalized_path, write_finalized_dataset, ScanFileWriter};
use crate::error::{AppResult, FtsError};
use crate::hardware::capabilities::Movable;
use crate::scan::calibration::{Calibration, PositionAxis};
use crate::scan::policy::{MotionTracker, StopPolicy, Verdict};
use crate::scan::reader::StreamReader;
use crate::scan::sample::{Sample, ScanRecord, SensorKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Why a completed scan stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopCause {
    /// Carriage reached 98% of the track
    EndOfTrack,
    /// Carriage stopped moving
    Stationary,
}

/// Terminal result of a scan session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The termination policy ended the scan
    Completed(StopCause),
    /// An external stop request ended the scan; not an error
    Cancelled,
    /// The session died on a fault (reader lost, storage failure, ...)
    Error(String),
}

/// Lifecycle state of the scan engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// No scan has run yet
    Idle,
    /// `start` is bringing the session up
    Starting,
    /// The tick loop is running
    Running,
    /// The tick loop has exited; teardown in progress
    Stopping,
    /// Terminal state; a new `start` is accepted from here
    Stopped(ScanOutcome),
}

/// Per-scan parameters passed to [`ScanEngine::start`].
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Carriage velocity (required)
    pub velocity: f64,
    /// Unit of `velocity`; `None` means the configured default (mm/s)
    pub velocity_unit: Option<String>,
    /// Tick rate of the sampling loop, in Hz
    pub sample_rate_hz: f64,
    /// Incremental output file; `None` derives a timestamped path
    pub output_path: Option<PathBuf>,
}

impl ScanConfig {
    /// Scan at `velocity` with the default 10 Hz sample rate and a
    /// timestamp-derived output path.
    pub fn new(velocity: f64) -> Self {
        Self {
            velocity,
            velocity_unit: None,
            sample_rate_hz: 10.0,
            output_path: None,
        }
    }
}

/// Station-level settings the engine keeps across scans.
#[derive(Clone, Debug)]
pub struct ScanSettings {
    /// Directory for derived output paths
    pub output_dir: PathBuf,
    /// Position column header, e.g. `position_mm`
    pub position_label: String,
    /// Stationary detection epsilon, in mm
    pub stationary_epsilon_mm: f64,
    /// Consecutive stationary ticks before stopping
    pub stationary_threshold: u32,
    /// Fraction of the track at which the scan ends
    pub end_of_track_fraction: f64,
    /// How long `stop` waits for the tick task before declaring the
    /// session unresponsive
    pub stop_grace: Duration,
}

impl ScanSettings {
    /// Derive engine settings from the application configuration.
    pub fn from_config(config: &crate::config::FtsConfig) -> Self {
        Self {
            output_dir: config.storage.output_dir.clone(),
            position_label: format!("position_{}", config.motor.length_unit),
            stationary_epsilon_mm: config.scan.stationary_epsilon_mm,
            stationary_threshold: config.scan.stationary_threshold,
            end_of_track_fraction: config.scan.end_of_track_fraction,
            stop_grace: Duration::from_secs_f64(config.scan.stop_grace_s),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(&crate::config::FtsConfig::default())
    }
}

struct EngineShared {
    state: StdMutex<ScanState>,
    cancel: AtomicBool,
    teardown_done: AtomicBool,
    records: StdMutex<Vec<ScanRecord>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The scan orchestrator. One instance per bench; at most one scan may be
/// running at any time.
pub struct ScanEngine {
    motor: Arc<dyn Movable>,
    encoder: Arc<StreamReader>,
    sensor: Arc<StreamReader>,
    sensor_kind: SensorKind,
    axis: Arc<PositionAxis>,
    settings: ScanSettings,
    shared: Arc<EngineShared>,
}

impl ScanEngine {
    /// Assemble an engine from its collaborators.
    pub fn new(
        motor: Arc<dyn Movable>,
        encoder: Arc<StreamReader>,
        sensor: Arc<StreamReader>,
        sensor_kind: SensorKind,
        axis: Arc<PositionAxis>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            motor,
            encoder,
            sensor,
            sensor_kind,
            axis,
            settings,
            shared: Arc::new(EngineShared {
                state: StdMutex::new(ScanState::Idle),
                cancel: AtomicBool::new(false),
                teardown_done: AtomicBool::new(false),
                records: StdMutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        self.shared.state.lock().unwrap().clone()
    }

    /// The record store, readable only after the session reached a
    /// terminal state.
    pub fn records(&self) -> Option<Vec<ScanRecord>> {
        let state = self.shared.state.lock().unwrap();
        if matches!(&*state, ScanState::Stopped(_)) {
            Some(self.shared.records.lock().unwrap().clone())
        } else {
            None
        }
    }

    fn set_state(&self, state: ScanState) {
        *self.shared.state.lock().unwrap() = state;
    }

    /// Start a scan. Returns the path of the incremental output file as
    /// soon as the tick loop is running; it does not wait for completion.
    ///
    /// Fails with [`FtsError::AlreadyRunning`] unless the engine is `Idle`
    /// or `Stopped`, and with [`FtsError::NotCalibrated`] before
    /// `find_offset` has completed on the axis.
    pub async fn start(&self, config: ScanConfig) -> AppResult<PathBuf> {
        let previous = {
            let mut state = self.shared.state.lock().unwrap();
            match &*state {
                ScanState::Idle | ScanState::Stopped(_) => {
                    let previous = state.clone();
                    *state = ScanState::Starting;
                    previous
                }
                _ => return Err(FtsError::AlreadyRunning),
            }
        };

        // Reject bad parameters before any side effect, restoring the
        // previous state so the engine stays startable.
        if let Err(e) = self.check_config(&config) {
            self.set_state(previous);
            return Err(e);
        }
        let Some(calibration) = self.axis.calibration() else {
            self.set_state(previous);
            return Err(FtsError::NotCalibrated);
        };

        let path = config.output_path.clone().unwrap_or_else(|| {
            let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
            self.settings.output_dir.join(format!("scan_{stamp}.csv"))
        });
        let writer = match ScanFileWriter::create(
            &path,
            self.sensor_kind,
            &self.settings.position_label,
        ) {
            Ok(writer) => writer,
            Err(e) => {
                self.set_state(previous);
                return Err(e);
            }
        };

        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.teardown_done.store(false, Ordering::SeqCst);
        self.shared.records.lock().unwrap().clear();

        // Side effects begin here; any failure now runs full teardown and
        // surfaces as the session's terminal state as well as the returned
        // error.
        if let Err(e) = self.bring_up(&config).await {
            teardown_devices(&self.shared, &self.motor, &self.encoder, &self.sensor).await;
            self.set_state(ScanState::Stopped(ScanOutcome::Error(e.to_string())));
            return Err(e);
        }

        let worker = ScanWorker {
            motor: self.motor.clone(),
            encoder: self.encoder.clone(),
            sensor: self.sensor.clone(),
            sensor_kind: self.sensor_kind,
            calibration,
            policy: StopPolicy {
                axis_max: self.motor.travel_limits().1,
                end_fraction: self.settings.end_of_track_fraction,
                stationary_epsilon: self.settings.stationary_epsilon_mm,
                stationary_threshold: self.settings.stationary_threshold,
            },
            period: Duration::from_secs_f64(1.0 / config.sample_rate_hz),
            final_path: finalized_path(&path),
            shared: self.shared.clone(),
        };

        self.set_state(ScanState::Running);
        info!(
            velocity = config.velocity,
            sample_rate_hz = config.sample_rate_hz,
            output = %path.display(),
            "scan started"
        );
        *self.shared.task.lock().await = Some(tokio::spawn(worker.run(writer)));

        Ok(path)
    }

    fn check_config(&self, config: &ScanConfig) -> AppResult<()> {
        if !(config.velocity.is_finite() && config.velocity > 0.0) {
            return Err(FtsError::Configuration(format!(
                "scan velocity must be positive, got {}",
                config.velocity
            )));
        }
        if !(config.sample_rate_hz.is_finite() && config.sample_rate_hz > 0.0) {
            return Err(FtsError::Configuration(format!(
                "sample rate must be positive, got {}",
                config.sample_rate_hz
            )));
        }
        Ok(())
    }

    async fn bring_up(&self, config: &ScanConfig) -> AppResult<()> {
        self.encoder.start().await?;
        self.sensor.start().await?;
        self.motor
            .move_velocity(config.velocity, config.velocity_unit.as_deref())
            .await?;
        Ok(())
    }

    /// Request cancellation and wait (bounded) for the session to reach a
    /// terminal state.
    ///
    /// Idempotent: calling before `start`, or after the session already
    /// stopped, is a no-op. If the tick task fails to exit within the
    /// grace period it is aborted, the session is marked
    /// `Error("reader_unresponsive")`, and device teardown is attempted
    /// from here.
    pub async fn stop(&self) -> AppResult<()> {
        {
            let state = self.shared.state.lock().unwrap();
            if matches!(&*state, ScanState::Idle | ScanState::Stopped(_)) {
                return Ok(());
            }
        }

        self.shared.cancel.store(true, Ordering::SeqCst);

        let handle = self.shared.task.lock().await.take();
        match handle {
            Some(mut handle) => {
                if tokio::time::timeout(self.settings.stop_grace, &mut handle)
                    .await
                    .is_err()
                {
                    warn!("scan task did not exit within grace period; aborting");
                    handle.abort();
                    self.set_state(ScanState::Stopped(ScanOutcome::Error(
                        "reader_unresponsive".to_string(),
                    )));
                    teardown_devices(&self.shared, &self.motor, &self.encoder, &self.sensor)
                        .await;
                    return Err(FtsError::ReaderUnresponsive);
                }
            }
            None => {
                // start() may still be bringing the session up, or another
                // stop already holds the handle; wait for the terminal
                // state the cancel flag will force.
                let deadline = Instant::now() + self.settings.stop_grace;
                while Instant::now() < deadline {
                    if matches!(self.state(), ScanState::Stopped(_)) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }

        Ok(())
    }

    /// Wait for the running session (if any) to reach a terminal state
    /// without cancelling it, and return that state.
    pub async fn wait(&self) -> ScanState {
        let handle = self.shared.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scan task join failed");
            }
        }
        self.state()
    }
}

/// Everything the tick-loop task owns.
struct ScanWorker {
    motor: Arc<dyn Movable>,
    encoder: Arc<StreamReader>,
    sensor: Arc<StreamReader>,
    sensor_kind: SensorKind,
    calibration: Calibration,
    policy: StopPolicy,
    period: Duration,
    final_path: PathBuf,
    shared: Arc<EngineShared>,
}

impl ScanWorker {
    async fn run(self, mut writer: ScanFileWriter) {
        let outcome = match self.tick_loop(&mut writer).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "scan aborted");
                ScanOutcome::Error(e.to_string())
            }
        };

        *self.shared.state.lock().unwrap() = ScanState::Stopping;
        teardown_devices(&self.shared, &self.motor, &self.encoder, &self.sensor).await;

        if let Err(e) = writer.finish() {
            warn!(error = %e, "failed to close incremental scan file");
        }
        let records = self.shared.records.lock().unwrap().clone();
        if let Err(e) = write_finalized_dataset(&self.final_path, self.sensor_kind, &records) {
            error!(error = %e, "failed to write finalized dataset");
        }

        info!(outcome = ?outcome, records = records.len(), "scan finished");
        *self.shared.state.lock().unwrap() = ScanState::Stopped(outcome);
    }

    async fn tick_loop(&self, writer: &mut ScanFileWriter) -> AppResult<ScanOutcome> {
        let mut tracker = MotionTracker::default();

        loop {
            let tick_start = Instant::now();
            let cancelled = self.shared.cancel.load(Ordering::SeqCst);

            // A lost required reader is fatal, but an explicit cancel
            // request still terminates as Cancelled.
            if !cancelled {
                if !self.encoder.is_healthy() {
                    return Err(FtsError::Instrument(
                        "encoder stream reader failed".to_string(),
                    ));
                }
                if !self.sensor.is_healthy() {
                    return Err(FtsError::Instrument(
                        "sensor stream reader failed".to_string(),
                    ));
                }
            }

            let encoder_sample = self.encoder.latest();
            let position_sample = encoder_sample
                .as_ref()
                .and_then(|s| self.calibration.position_sample(s));
            let position = position_sample.map(|p| p.position);

            let verdict = self.policy.evaluate(cancelled, position, &mut tracker);

            // Nearest-timestamp join against the backlog accumulated since
            // the previous tick. Without an encoder sample there is no
            // join target; the backlog is left to the next tick.
            let sensor_reading = match &encoder_sample {
                Some(enc) => {
                    let candidates = self.sensor.drain();
                    nearest_sample(enc.timestamp, &candidates)
                        .and_then(|s| s.payload.sensor_reading())
                }
                None => None,
            };

            let record = ScanRecord {
                timestamp: encoder_sample.as_ref().map(|s| s.timestamp),
                position,
                sensor: sensor_reading,
            };
            self.shared.records.lock().unwrap().push(record.clone());
            writer.append(&record)?;

            match verdict {
                Verdict::Continue => {}
                Verdict::Cancelled => return Ok(ScanOutcome::Cancelled),
                Verdict::EndOfTrack => {
                    return Ok(ScanOutcome::Completed(StopCause::EndOfTrack))
                }
                Verdict::Stationary => {
                    return Ok(ScanOutcome::Completed(StopCause::Stationary))
                }
            }

            // Best-effort pacing; overruns drift rather than catch up
            let elapsed = tick_start.elapsed();
            if elapsed < self.period {
                tokio::time::sleep(self.period - elapsed).await;
            }
        }
    }
}

/// Stop the carriage and both readers, exactly once per session.
async fn teardown_devices(
    shared: &EngineShared,
    motor: &Arc<dyn Movable>,
    encoder: &Arc<StreamReader>,
    sensor: &Arc<StreamReader>,
) {
    if shared
        .teardown_done
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    if let Err(e) = motor.stop().await {
        error!(error = %e, "failed to stop carriage during teardown");
    }
    if let Err(e) = encoder.stop().await {
        error!(error = %e, "failed to stop encoder reader during teardown");
    }
    if let Err(e) = sensor.stop().await {
        error!(error = %e, "failed to stop sensor reader during teardown");
    }
}

/// The candidate minimizing `|candidate.timestamp - target|`; ties resolve
/// to the earliest-produced candidate.
fn nearest_sample(target: f64, candidates: &[Sample]) -> Option<&Sample> {
    let mut best: Option<(&Sample, f64)> = None;
    for candidate in candidates {
        let distance = (candidate.timestamp - target).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((candidate, distance)),
        }
    }
    best.map(|(sample, _)| sample)
}
