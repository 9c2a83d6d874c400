use chrono::NaiveDateTime;
use tempfile::TempDir;

use taktoor::config::Config;
use taktoor::feed::parse_feed;
use taktoor::metrics::aggregate_window;
use taktoor::pulse::PulseEstimator;
use taktoor::scan::EquipmentKind;
use taktoor::shift::ShiftWindow;
use taktoor::store::Store;

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("timestamp")
}

fn row(serial: &str, status: &str, stamp: &str) -> String {
    format!("{serial},GP5,MDL-A,COVERPRESS,STA2,{status},{stamp}")
}

fn feed_page(rows: &[String]) -> String {
    format!(
        "<html><body><XMP>{}</XMP></body></html>",
        rows.join("\n")
    )
}

fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path().join("pipeline.db")).expect("open store")
}

#[tokio::test]
async fn test_feed_page_to_persisted_window_metrics() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    // Three full request/completion cycles, the last one rejected.
    let page = feed_page(&[
        row("S1", "BREQ", "02/10/2026 08:00:00"),
        row("S1", "BCMP OK", "02/10/2026 08:00:45"),
        row("S2", "BREQ", "02/10/2026 08:01:00"),
        row("S2", "BCMP OK", "02/10/2026 08:01:50"),
        row("S3", "BREQ", "02/10/2026 08:02:00"),
        row("S3", "BCMP NG", "02/10/2026 08:02:40"),
    ]);

    let events = parse_feed("COVER-01", &page, None);
    assert_eq!(events.len(), 6);
    assert_eq!(events[0].serial_number, "S1");
    assert_eq!(events[0].timestamp, ts("2026-02-10 08:00:00"));

    let outcome = store.insert_batch(events).await.expect("insert");
    assert_eq!(outcome.inserted, 6);
    assert_eq!(outcome.duplicates, 0);

    let scans = store
        .scans_since("COVER-01", ts("2026-02-10 00:00:00"))
        .await
        .expect("scans");
    assert_eq!(scans.len(), 6);

    let metrics = aggregate_window(&scans, EquipmentKind::PairedStage);

    // Paired durations 45/50/40 all survive the sigma band.
    assert_eq!(metrics.equipment_ct, Some(45.0));
    assert_eq!(metrics.valid_samples, 3);
    assert_eq!(metrics.outliers_removed, 0);
    assert!((metrics.std_dev - (50.0f64 / 3.0).sqrt()).abs() < 1e-9);

    // Completion-to-completion deltas are 65 and 50.
    assert_eq!(metrics.process_ct, Some(57.5));

    assert_eq!(metrics.pieces_ok, 2);
    assert_eq!(metrics.pieces_ng, 1);

    let shift = ShiftWindow {
        name: "1st Shift".to_string(),
        start: ts("2026-02-10 07:00:00"),
    };
    store
        .update_window_metrics(
            "COVER-01",
            metrics.clone(),
            metrics,
            shift,
            ts("2026-02-10 08:03:00"),
        )
        .await
        .expect("persist");

    let persisted = store
        .metrics_row("COVER-01")
        .await
        .expect("read row")
        .expect("row exists");
    assert_eq!(persisted.ct_equipo_hour, Some(45.0));
    assert_eq!(persisted.ct_proceso_hour, Some(57.5));
    assert_eq!(persisted.samples_hour, 3);
    assert_eq!(persisted.outliers_hour, 0);
    assert_eq!(persisted.pieces_ok_hour, 2);
    assert_eq!(persisted.pieces_ng_hour, 1);
    assert_eq!(persisted.ct_equipo_shift, Some(45.0));
    assert_eq!(persisted.shift_name.as_deref(), Some("1st Shift"));
    assert_eq!(persisted.shift_start, Some(ts("2026-02-10 07:00:00")));
}

#[tokio::test]
async fn test_pulse_path_from_growing_tail() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    let mut estimator = PulseEstimator::new("COVER-01", EquipmentKind::PairedStage);

    let first_rows = vec![
        row("S1", "BREQ", "02/10/2026 08:00:00"),
        row("S1", "BCMP OK", "02/10/2026 08:00:30"),
    ];
    let tail = parse_feed("COVER-01", &feed_page(&first_rows), Some(50));
    let pulse = estimator.ingest(&tail).expect("first completion pulses");

    // One completion: paired cycle known, throughput not yet.
    assert_eq!(pulse.equipment_ct, Some(30.0));
    assert_eq!(pulse.process_ct, None);
    assert_eq!(pulse.last_serial, "S1");

    // The same tail again is a no-op.
    assert!(estimator.ingest(&tail).is_none());

    let mut second_rows = first_rows;
    second_rows.push(row("S2", "BREQ", "02/10/2026 08:00:58"));
    second_rows.push(row("S2", "BCMP OK", "02/10/2026 08:01:18"));
    let tail = parse_feed("COVER-01", &feed_page(&second_rows), Some(50));
    let pulse = estimator.ingest(&tail).expect("second completion pulses");

    assert_eq!(pulse.equipment_ct, Some(25.0));
    assert_eq!(pulse.process_ct, Some(48.0));
    assert_eq!(pulse.last_serial, "S2");

    store.update_pulse(pulse).await.expect("persist pulse");

    let persisted = store
        .metrics_row("COVER-01")
        .await
        .expect("read row")
        .expect("row exists");
    assert_eq!(persisted.ct_equipo_realtime, Some(25.0));
    assert_eq!(persisted.ct_proceso_realtime, Some(48.0));
    assert_eq!(persisted.last_serial.as_deref(), Some("S2"));
    assert_eq!(persisted.last_scan_at, Some(ts("2026-02-10 08:01:18")));

    // The window column groups stay untouched by the pulse path.
    assert_eq!(persisted.ct_equipo_hour, None);
    assert_eq!(persisted.pieces_ok_hour, 0);
}

#[tokio::test]
async fn test_shift_window_narrower_than_rolling_hour() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    let page = feed_page(&[
        row("A1", "BCMP OK", "02/10/2026 06:59:55"),
        row("A2", "BCMP OK", "02/10/2026 07:00:10"),
        row("A3", "BCMP OK", "02/10/2026 07:00:20"),
        row("A4", "BCMP OK", "02/10/2026 07:00:30"),
    ]);
    let events = parse_feed("PRESS-07", &page, None);
    store.insert_batch(events).await.expect("insert");

    let now = ts("2026-02-10 07:30:00");
    let calendar = Config::default().shift_calendar().expect("calendar");
    let shift = calendar.resolve(now);
    assert_eq!(shift.name, "1st Shift");
    assert_eq!(shift.start, ts("2026-02-10 07:00:00"));

    // Rolling hour reaches back past the shift boundary.
    let hour_scans = store
        .scans_since("PRESS-07", ts("2026-02-10 06:30:00"))
        .await
        .expect("hour scans");
    let shift_scans = store
        .scans_since("PRESS-07", shift.start)
        .await
        .expect("shift scans");
    assert_eq!(hour_scans.len(), 4);
    assert_eq!(shift_scans.len(), 3);

    let hour = aggregate_window(&hour_scans, EquipmentKind::SingleStage);
    let shift_metrics = aggregate_window(&shift_scans, EquipmentKind::SingleStage);

    // Hour deltas 15/10/10 against shift deltas 10/10.
    let hour_ct = hour.equipment_ct.expect("hour ct");
    assert!((hour_ct - 35.0 / 3.0).abs() < 1e-9);
    assert_eq!(hour.valid_samples, 3);
    assert_eq!(shift_metrics.equipment_ct, Some(10.0));
    assert_eq!(shift_metrics.valid_samples, 2);
}

#[tokio::test]
async fn test_degenerate_windows_never_error() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    // Two completions on the same second: the delta is rejected, the
    // pieces still count, nothing errors.
    let page = feed_page(&[
        row("Z1", "BCMP OK", "02/10/2026 09:00:00"),
        row("Z2", "BCMP OK", "02/10/2026 09:00:00"),
    ]);
    let events = parse_feed("PRESS-07", &page, None);
    store.insert_batch(events).await.expect("insert");

    let scans = store
        .scans_since("PRESS-07", ts("2026-02-10 00:00:00"))
        .await
        .expect("scans");
    let metrics = aggregate_window(&scans, EquipmentKind::SingleStage);

    assert_eq!(metrics.equipment_ct, None);
    assert_eq!(metrics.process_ct, None);
    assert_eq!(metrics.valid_samples, 0);
    assert_eq!(metrics.pieces_ok, 2);
    assert_eq!(metrics.pieces_ng, 0);
}

#[tokio::test]
async fn test_agent_lifecycle_with_empty_registry() {
    use taktoor::agent::Agent;

    let dir = TempDir::new().expect("tempdir");
    let mut cfg = Config::default();
    cfg.storage.path = dir
        .path()
        .join("agent.db")
        .to_string_lossy()
        .into_owned();

    let mut agent = Agent::new(cfg).expect("agent");
    let mut pulses = agent.subscribe_pulses();

    agent.start().await.expect("start");
    agent.stop().await;

    // No equipment is polled, so the stream closes without a pulse.
    assert!(pulses.try_recv().is_err());
}
