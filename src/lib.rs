//! # Cryogenic FTS Control Library
//!
//! This crate drives the scanning mirror carriage of a cryogenic Fourier
//! transform spectrometer while fusing readings from two independently
//! clocked devices (a position encoder plus either a lock-in amplifier or a
//! laser frequency source) into time-aligned records that are persisted
//! durably while the scan is still running.
//!
//! ## Crate Structure
//!
//! - **`config`**: strongly-typed configuration loaded from TOML files and
//!   `CRYO_FTS_`-prefixed environment variables. See [`config::FtsConfig`].
//! - **`error`**: the crate-wide [`error::FtsError`] enum and the
//!   [`error::AppResult`] alias.
//! - **`logging`**: `tracing` subscriber setup driven by the configuration.
//! - **`hardware`**: capability traits ([`hardware::capabilities`]) plus the
//!   concrete device drivers (Zaber stage, quadrature encoder counter,
//!   SR865A lock-in behind a Prologix GPIB adapter, Toptica frequency
//!   source) and mock implementations for running without hardware.
//! - **`scan`**: the synchronized scan engine. Background stream readers,
//!   the termination policy, axis calibration, and the orchestrator state
//!   machine live here; this is the only part of the crate with real
//!   concurrency and failure-handling design.
//! - **`data`**: scan record storage writers (incremental crash-safe CSV and
//!   the finalized dataset).
//! - **`optics`**: stateless scan-planning and Fresnel/beamsplitter math.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod optics;
pub mod scan;
