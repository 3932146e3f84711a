//! Integration tests for the scan orchestrator, run against the mock bench.

use cryo_fts::error::FtsError;
use cryo_fts::hardware::capabilities::{Movable, Streamable};
use cryo_fts::hardware::mock::{MockEncoder, MockLockin, MockStage, SimCarriage};
use cryo_fts::scan::{
    PositionAxis, ScanConfig, ScanEngine, ScanOutcome, ScanSettings, ScanState, StopCause,
    StreamReader,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const RESOLUTION_MM: f64 = 0.001;

struct TestBench {
    engine: ScanEngine,
    stage: Arc<MockStage>,
    encoder: Arc<MockEncoder>,
    lockin: Arc<MockLockin>,
    axis: Arc<PositionAxis>,
    _output_dir: tempfile::TempDir,
    output_path: std::path::PathBuf,
}

fn build_bench(track_mm: f64, encoder_fail_after: Option<usize>) -> TestBench {
    let carriage = SimCarriage::new((0.0, track_mm));
    let stage = Arc::new(MockStage::new(carriage.clone()));

    let mut encoder =
        MockEncoder::new(carriage.clone(), RESOLUTION_MM).with_interval(Duration::from_millis(2));
    if let Some(n) = encoder_fail_after {
        encoder = encoder.failing_after(n);
    }
    let encoder = Arc::new(encoder);
    let lockin = Arc::new(
        MockLockin::new()
            .with_carriage(carriage, 0.5)
            .with_interval(Duration::from_millis(2)),
    );

    let encoder_reader = Arc::new(
        StreamReader::new("encoder", encoder.clone() as Arc<dyn Streamable>)
            .with_failure_threshold(2),
    );
    let sensor_reader =
        Arc::new(StreamReader::new("lockin", lockin.clone() as Arc<dyn Streamable>));

    let axis = Arc::new(PositionAxis::new(
        stage.clone() as Arc<dyn Movable>,
        encoder.clone(),
        RESOLUTION_MM,
    ));

    let output_dir = tempfile::tempdir().unwrap();
    let output_path = output_dir.path().join("scan.csv");
    let settings = ScanSettings {
        output_dir: output_dir.path().to_path_buf(),
        ..ScanSettings::default()
    };

    let engine = ScanEngine::new(
        stage.clone() as Arc<dyn Movable>,
        encoder_reader,
        sensor_reader,
        cryo_fts::scan::SensorKind::Quadrature,
        axis.clone(),
        settings,
    );

    TestBench {
        engine,
        stage,
        encoder,
        lockin,
        axis,
        _output_dir: output_dir,
        output_path,
    }
}

fn scan_config(bench: &TestBench, velocity: f64, sample_rate_hz: f64) -> ScanConfig {
    let mut config = ScanConfig::new(velocity);
    config.sample_rate_hz = sample_rate_hz;
    config.output_path = Some(bench.output_path.clone());
    config
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn assert_teardown_ran_once(bench: &TestBench) {
    assert_eq!(bench.stage.stop_calls(), 1, "actuator stop count");
    assert_eq!(bench.encoder.stream_stops(), 1, "encoder reader stop count");
    assert_eq!(bench.lockin.stream_stops(), 1, "sensor reader stop count");
}

#[tokio::test]
async fn scan_runs_to_end_of_track() {
    let bench = build_bench(5.0, None);
    bench.axis.find_offset().await.unwrap();

    bench
        .engine
        .start(scan_config(&bench, 100.0, 100.0))
        .await
        .unwrap();

    let state = bench.engine.wait().await;
    assert_eq!(
        state,
        ScanState::Stopped(ScanOutcome::Completed(StopCause::EndOfTrack))
    );

    let records = bench.engine.records().unwrap();
    assert!(!records.is_empty());
    // The terminal tick saw the carriage at or past 98% of the track
    let last_position = records.last().unwrap().position.unwrap();
    assert!(last_position >= 0.98 * 5.0, "got {last_position}");

    // Incremental file: header plus one complete row per record
    let lines = read_lines(&bench.output_path);
    assert_eq!(lines[0], "timestamp,position_mm,x,y,r,theta");
    assert_eq!(lines.len(), records.len() + 1);
    for line in &lines[1..] {
        assert_eq!(line.matches(',').count(), 5, "incomplete row: {line}");
    }

    // Finalized dataset: same rows with the derived column appended
    let final_lines = read_lines(&bench.output_path.with_file_name("scan_final.csv"));
    assert_eq!(
        final_lines[0],
        "timestamp,position_mm,x,y,r,theta,position_um"
    );
    assert_eq!(final_lines.len(), records.len() + 1);

    assert_teardown_ran_once(&bench);
}

#[tokio::test]
async fn sensor_fields_come_from_the_joined_stream() {
    let bench = build_bench(5.0, None);
    bench.axis.find_offset().await.unwrap();

    bench
        .engine
        .start(scan_config(&bench, 50.0, 50.0))
        .await
        .unwrap();
    bench.engine.wait().await;

    let records = bench.engine.records().unwrap();
    let joined: Vec<_> = records.iter().filter(|r| r.sensor.is_some()).collect();
    assert!(
        !joined.is_empty(),
        "a 500 Hz sensor stream should join onto most ticks"
    );
}

#[tokio::test]
async fn start_is_single_flight() {
    let bench = build_bench(50.0, None);
    bench.axis.find_offset().await.unwrap();

    bench
        .engine
        .start(scan_config(&bench, 1.0, 50.0))
        .await
        .unwrap();
    assert!(matches!(
        bench.engine.start(scan_config(&bench, 1.0, 50.0)).await,
        Err(FtsError::AlreadyRunning)
    ));
    // The running session is unaffected
    assert_eq!(bench.engine.state(), ScanState::Running);

    bench.engine.stop().await.unwrap();
    assert_eq!(
        bench.engine.state(),
        ScanState::Stopped(ScanOutcome::Cancelled)
    );
}

#[tokio::test]
async fn stop_is_idempotent() {
    let bench = build_bench(50.0, None);
    bench.axis.find_offset().await.unwrap();

    // Stop before any start is a no-op
    bench.engine.stop().await.unwrap();
    assert_eq!(bench.engine.state(), ScanState::Idle);

    bench
        .engine
        .start(scan_config(&bench, 1.0, 50.0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    bench.engine.stop().await.unwrap();
    let state_after_first = bench.engine.state();
    assert_eq!(state_after_first, ScanState::Stopped(ScanOutcome::Cancelled));
    let lines_after_first = read_lines(&bench.output_path);

    // A second stop changes nothing and writes nothing
    bench.engine.stop().await.unwrap();
    assert_eq!(bench.engine.state(), state_after_first);
    assert_eq!(read_lines(&bench.output_path), lines_after_first);

    assert_teardown_ran_once(&bench);
}

#[tokio::test]
async fn slow_carriage_stops_as_stationary() {
    let bench = build_bench(50.0, None);
    bench.axis.find_offset().await.unwrap();

    // 0.001 mm/s at 50 Hz moves ~20 nm per tick, far below the 1 um epsilon
    bench
        .engine
        .start(scan_config(&bench, 0.001, 50.0))
        .await
        .unwrap();

    let state = bench.engine.wait().await;
    assert_eq!(
        state,
        ScanState::Stopped(ScanOutcome::Completed(StopCause::Stationary))
    );

    // The default threshold is five consecutive stationary positions
    let with_position = bench
        .engine
        .records()
        .unwrap()
        .iter()
        .filter(|r| r.position.is_some())
        .count();
    assert!(with_position >= 5, "got {with_position} positioned ticks");

    assert_teardown_ran_once(&bench);
}

#[tokio::test]
async fn lost_encoder_reader_is_fatal_but_torn_down() {
    // Encoder delivers three samples, then fails permanently; the reader
    // gives up after two consecutive failures
    let bench = build_bench(50.0, Some(3));
    bench.axis.find_offset().await.unwrap();

    bench
        .engine
        .start(scan_config(&bench, 1.0, 100.0))
        .await
        .unwrap();

    let state = bench.engine.wait().await;
    let ScanState::Stopped(ScanOutcome::Error(reason)) = state else {
        panic!("expected an error outcome, got {state:?}");
    };
    assert!(reason.contains("encoder"), "unexpected reason: {reason}");

    // Full teardown still ran, exactly once
    assert_teardown_ran_once(&bench);

    // Every row flushed before the fault is complete
    let lines = read_lines(&bench.output_path);
    let records = bench.engine.records().unwrap();
    assert_eq!(lines.len(), records.len() + 1);
    for line in &lines[1..] {
        assert_eq!(line.matches(',').count(), 5, "incomplete row: {line}");
    }
}

#[tokio::test]
async fn frequency_sensor_uses_its_own_record_layout() {
    use cryo_fts::hardware::mock::MockFrequencySource;
    use cryo_fts::scan::{SensorKind, SensorReading};

    let carriage = SimCarriage::new((0.0, 5.0));
    let stage = Arc::new(MockStage::new(carriage.clone()));
    let encoder = Arc::new(
        MockEncoder::new(carriage.clone(), RESOLUTION_MM).with_interval(Duration::from_millis(2)),
    );
    let source = Arc::new(
        MockFrequencySource::new(100.0).with_interval(Duration::from_millis(2)),
    );

    let axis = Arc::new(PositionAxis::new(
        stage.clone() as Arc<dyn Movable>,
        encoder.clone(),
        RESOLUTION_MM,
    ));
    let output_dir = tempfile::tempdir().unwrap();
    let output_path = output_dir.path().join("thz_scan.csv");

    let engine = ScanEngine::new(
        stage.clone() as Arc<dyn Movable>,
        Arc::new(StreamReader::new(
            "encoder",
            encoder.clone() as Arc<dyn Streamable>,
        )),
        Arc::new(StreamReader::new(
            "frequency",
            source.clone() as Arc<dyn Streamable>,
        )),
        SensorKind::Frequency,
        axis.clone(),
        ScanSettings {
            output_dir: output_dir.path().to_path_buf(),
            ..ScanSettings::default()
        },
    );

    axis.find_offset().await.unwrap();
    let mut config = ScanConfig::new(100.0);
    config.sample_rate_hz = 100.0;
    config.output_path = Some(output_path.clone());
    engine.start(config).await.unwrap();

    let state = engine.wait().await;
    assert_eq!(
        state,
        ScanState::Stopped(ScanOutcome::Completed(StopCause::EndOfTrack))
    );

    let lines = read_lines(&output_path);
    assert_eq!(lines[0], "timestamp,position_mm,frequency_ghz,photocurrent_na");
    for line in &lines[1..] {
        assert_eq!(line.matches(',').count(), 3, "incomplete row: {line}");
    }

    let records = engine.records().unwrap();
    let joined = records
        .iter()
        .filter_map(|r| match r.sensor {
            Some(SensorReading::Frequency(f)) => Some(f),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(!joined.is_empty());
    for reading in joined {
        assert!((reading.frequency_ghz - 100.0).abs() < 0.1);
        assert!(reading.valid);
    }
}

#[tokio::test]
async fn start_requires_calibration() {
    let bench = build_bench(50.0, None);

    let result = bench.engine.start(scan_config(&bench, 1.0, 50.0)).await;
    assert!(matches!(result, Err(FtsError::NotCalibrated)));

    // The engine stays startable once calibration completes
    assert_eq!(bench.engine.state(), ScanState::Idle);
    bench.axis.find_offset().await.unwrap();
    bench
        .engine
        .start(scan_config(&bench, 1.0, 50.0))
        .await
        .unwrap();
    bench.engine.stop().await.unwrap();
}

#[tokio::test]
async fn rejects_nonsense_scan_parameters() {
    let bench = build_bench(50.0, None);
    bench.axis.find_offset().await.unwrap();

    let mut config = scan_config(&bench, 0.0, 50.0);
    assert!(matches!(
        bench.engine.start(config.clone()).await,
        Err(FtsError::Configuration(_))
    ));

    config.velocity = 1.0;
    config.sample_rate_hz = 0.0;
    assert!(matches!(
        bench.engine.start(config).await,
        Err(FtsError::Configuration(_))
    ));

    // Rejections leave the engine startable
    assert_eq!(bench.engine.state(), ScanState::Idle);
}
