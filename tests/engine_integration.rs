//! End-to-end behaviour of the engine against a throwaway SQLite file

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use feid::db::{NewEvent, NewGenericColumn};
use feid::engine::{Deleted, RECOMPUTE_ALL};
use feid::generic::ColumnRef;
use feid::overrides::{EditOutcome, ManualEdit};
use feid::scheduler::JobStatus;
use feid::series::{HourlySeries, SeriesInfo, HOUR};
use feid::{
    Config, Database, Engine, EntityGraph, FeidError, GenericParams, MemorySeries, Operation, ReferencePoint,
    SeriesCatalogue, SeriesSource, ValueType,
};

struct Setup {
    _dir: tempfile::TempDir,
    engine: Arc<Engine>,
    series: Arc<MemorySeries>,
}

fn setup() -> Setup {
    let series = Arc::new(MemorySeries::new());
    setup_with(series.clone(), series)
}

fn setup_with(source: Arc<dyn SeriesSource>, series: Arc<MemorySeries>) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let graph = EntityGraph::feid();
    let catalogue = SeriesCatalogue::feid();
    let config = Config {
        db_path: dir.path().join("feid.db"),
        ..Config::default()
    };
    let db = Database::open_with(&config.db_path, &graph, &catalogue).unwrap();
    let engine = Engine::new(db, source, graph, catalogue, config).unwrap();
    Setup {
        _dir: dir,
        engine: Arc::new(engine),
        series,
    }
}

/// In-memory series that takes a while to answer and counts its readers
struct SlowSeries {
    inner: Arc<MemorySeries>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowSeries {
    fn new(inner: Arc<MemorySeries>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl SeriesSource for SlowSeries {
    fn fetch_series(&self, series: &SeriesInfo, from_hour: i64, to_hour: i64) -> feid::Result<HourlySeries> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let result = self.inner.fetch_series(series, from_hour, to_hour);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn slow_setup(delay: Duration) -> (Setup, Arc<SlowSeries>) {
    let memory = Arc::new(MemorySeries::new());
    let slow = Arc::new(SlowSeries::new(memory.clone(), delay));
    (setup_with(slow.clone(), memory), slow)
}

fn wait_until(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

impl Setup {
    fn fe(&self, hour: i64, duration: Option<f64>) -> i64 {
        let event = NewEvent {
            time: hour * HOUR,
            duration,
            ..Default::default()
        };
        let def = self.engine.graph().entity("forbush_effects").unwrap();
        self.engine.db().insert_event(def, &event).unwrap()
    }

    fn cell(&self, column: &str, id: i64) -> Option<f64> {
        let values = self.engine.db().select_real("forbush_effects", &[], column).unwrap();
        values.get(&id).copied().flatten()
    }

    fn edit(&self, id: i64, column: &str, value: Option<&str>) -> feid::Result<EditOutcome> {
        self.engine.set_value(&ManualEdit {
            author: 1,
            entity: "forbush_effects".into(),
            event_id: id,
            column: column.into(),
            value: value.map(str::to_string),
            silent: false,
        })
    }
}

fn max_speed() -> GenericParams {
    GenericParams::new(Operation::Max).with_series("sw_speed")
}

fn finished(status: JobStatus) -> feid::scheduler::RecomputeReport {
    match status {
        JobStatus::Finished { report, .. } => report,
        other => panic!("expected a finished job, got {:?}", other),
    }
}

// ==========================================================================
// COLUMN LIFECYCLE
// ==========================================================================

#[test]
fn test_define_computes_immediately() {
    let s = setup();
    let first = s.fe(100, None);
    let second = s.fe(130, None);
    s.series.insert_hourly("sw_speed", 100, &[1.0, 5.0, 2.0, 9.0, 3.0].map(Some));

    let defined = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap();
    assert!(defined.created);
    assert_eq!(defined.column.pretty_name, "max V");
    assert!(defined.initial.unwrap().error.is_none());

    assert_eq!(s.cell(&defined.column.name, first), Some(9.0));
    assert_eq!(s.cell(&defined.column.name, second), None);
}

#[test]
fn test_duplicate_definition_joins_existing() {
    let s = setup();
    let a = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap();
    let b = s.engine.define_column(2, "forbush_effects", max_speed(), false).unwrap();

    assert!(!b.created);
    assert_eq!(a.column.id, b.column.id);
    assert_eq!(b.column.owners, vec![1, 2]);
    assert_eq!(s.engine.generics().unwrap().len(), 1);

    let physical = s.engine.db().table_columns("forbush_effects").unwrap();
    assert_eq!(physical.iter().filter(|c| **c == a.column.name).count(), 1);
}

#[test]
fn test_invalid_definition_has_no_side_effects() {
    let s = setup();
    let params = GenericParams::new(Operation::Max).with_series("no_such_series");
    let err = s.engine.define_column(1, "forbush_effects", params.clone(), false).unwrap_err();
    assert!(matches!(err, FeidError::Validation { ref field, .. } if field == "series"));

    assert!(s.engine.generics().unwrap().is_empty());
    let physical = s.engine.db().table_columns("forbush_effects").unwrap();
    assert!(!physical.contains(&params.physical_name()));
}

#[test]
fn test_diff_of_windowed_columns_has_a_valid_name() {
    let s = setup();
    let mut event = NewEvent {
        time: 100 * HOUR,
        duration: Some(10.0),
        ..Default::default()
    };
    event.values.insert("mc_time".into(), serde_json::json!(101 * HOUR));
    event.values.insert("mc_end".into(), serde_json::json!(104 * HOUR));
    let def = s.engine.graph().entity("forbush_effects").unwrap();
    let id = s.engine.db().insert_event(def, &event).unwrap();
    s.series.insert_hourly("imf_scalar", 100, &[Some(10.0); 6]);
    s.series.insert_hourly("sw_speed", 100, &[Some(400.0); 6]);

    let mc = |end| ReferencePoint::Structure {
        structure: "mc".into(),
        end,
        hours_offset: 0,
    };
    let mean = |series: &str| {
        let params = GenericParams::new(Operation::Mean)
            .with_series(series)
            .with_reference(mc(false))
            .with_boundary(mc(true));
        s.engine.define_column(1, "forbush_effects", params, false).unwrap().column.name
    };
    let b = mean("imf_scalar");
    let v = mean("sw_speed");

    let diff = GenericParams::new(Operation::Diff)
        .with_column(ColumnRef::new("forbush_effects", &b))
        .with_other_column(ColumnRef::new("forbush_effects", &v));
    let defined = s.engine.define_column(1, "forbush_effects", diff, false).unwrap();
    assert!(defined.initial.unwrap().error.is_none());

    let name = defined.column.name;
    assert!(name.len() <= 64, "{} is {} long", name, name.len());
    assert!(s.engine.db().table_columns("forbush_effects").unwrap().contains(&name));
    assert_eq!(s.cell(&name, id).map(f64::abs), Some(390.0));
}

#[test]
fn test_failed_define_keeps_column_it_did_not_add() {
    let s = setup();
    let name = max_speed().physical_name();

    // another definition already owns the physical name
    let other = GenericParams::new(Operation::Min).with_series("sw_speed");
    let params_json = serde_json::to_string(&other).unwrap();
    s.engine.db().add_column("forbush_effects", &name, ValueType::Real).unwrap();
    let other_id = s
        .engine
        .db()
        .insert_generic(
            &NewGenericColumn {
                entity: "forbush_effects",
                name: &name,
                pretty_name: "min V",
                description: "",
                value_type: "real",
                params_json: &params_json,
                is_public: false,
                created_at: "2024-01-01T00:00:00Z",
            },
            9,
        )
        .unwrap();

    let err = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap_err();
    assert!(matches!(err, FeidError::Db(_)));

    assert!(s.engine.db().table_columns("forbush_effects").unwrap().contains(&name));
    let generics = s.engine.generics().unwrap();
    assert_eq!(generics.len(), 1);
    assert_eq!(generics[0].id, other_id);
    assert_eq!(generics[0].owners, vec![9]);
}

#[test]
fn test_concurrent_identical_definitions_share_one_column() {
    let s = setup();
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [1, 2]
        .into_iter()
        .map(|owner| {
            let engine = Arc::clone(&s.engine);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                engine.define_column(owner, "forbush_effects", max_speed(), false)
            })
        })
        .collect();
    let defined: Vec<_> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();

    assert_eq!(defined[0].column.id, defined[1].column.id);
    assert_eq!(defined.iter().filter(|d| d.created).count(), 1);
    let generics = s.engine.generics().unwrap();
    assert_eq!(generics.len(), 1);
    assert_eq!(generics[0].owners, vec![1, 2]);

    let name = max_speed().physical_name();
    assert!(s.engine.db().table_columns("forbush_effects").unwrap().contains(&name));
}

#[test]
fn test_last_owner_drops_column() {
    let s = setup();
    let id = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.id;
    s.engine.define_column(2, "forbush_effects", max_speed(), false).unwrap();
    let name = max_speed().physical_name();

    assert_eq!(s.engine.delete_column(1, id, false).unwrap(), Deleted::Unowned);
    assert!(s.engine.list_columns(1).unwrap().is_empty());
    assert_eq!(s.engine.list_columns(2).unwrap().len(), 1);

    assert_eq!(s.engine.delete_column(2, id, false).unwrap(), Deleted::Dropped);
    assert!(s.engine.generics().unwrap().is_empty());
    assert!(!s.engine.db().table_columns("forbush_effects").unwrap().contains(&name));
}

#[test]
fn test_public_column_rules() {
    let s = setup();
    let id = s.engine.define_column(1, "forbush_effects", max_speed(), true).unwrap().column.id;

    let listed = s.engine.list_columns(7).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].is_own);

    let err = s.engine.delete_column(7, id, false).unwrap_err();
    assert!(matches!(err, FeidError::Validation { .. }));
    assert_eq!(s.engine.delete_column(7, id, true).unwrap(), Deleted::Dropped);
}

#[test]
fn test_cannot_drop_column_read_by_another() {
    let s = setup();
    let base = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column;
    let clone = GenericParams::new(Operation::Clone)
        .with_column(ColumnRef::new("forbush_effects", &base.name))
        .with_shift(-1);
    s.engine.define_column(1, "forbush_effects", clone, false).unwrap();

    let err = s.engine.delete_column(1, base.id, false).unwrap_err();
    assert!(matches!(err, FeidError::Validation { ref field, .. } if field == "column"));
    assert_eq!(s.engine.generics().unwrap().len(), 2);
}

// ==========================================================================
// MANUAL EDITS
// ==========================================================================
//
// Setting "auto" after a manual value must leave exactly the value the
// engine computes when no edit was ever made.
// ==========================================================================

#[test]
fn test_auto_round_trip() {
    let s = setup();
    let id = s.fe(100, Some(10.0));
    s.series.insert_hourly("sw_speed", 100, &[1.0, 5.0, 2.0, 9.0, 3.0].map(Some));
    let name = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.name;
    assert_eq!(s.cell(&name, id), Some(9.0));

    let stored = s.edit(id, &name, Some("12.5")).unwrap();
    assert!(matches!(stored, EditOutcome::Stored { .. }));
    assert_eq!(s.cell(&name, id), Some(12.5));

    // recomputation keeps the manual value
    let report = finished(s.engine.recompute_column(&name).unwrap());
    assert!(report.error.is_none());
    assert_eq!(s.cell(&name, id), Some(12.5));

    assert!(matches!(s.edit(id, &name, Some("auto")).unwrap(), EditOutcome::Released { .. }));
    assert_eq!(s.cell(&name, id), Some(9.0));

    finished(s.engine.recompute_column(&name).unwrap());
    assert_eq!(s.cell(&name, id), Some(9.0));

    let log = s.engine.changelog("forbush_effects", id).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].new_value.as_deref(), Some("12.5"));
    assert_eq!(log[1].new_value.as_deref(), Some("auto"));
}

#[test]
fn test_rejected_edits() {
    let s = setup();
    let id = s.fe(100, Some(10.0));
    s.series.insert_hourly("sw_speed", 100, &[Some(4.0)]);
    let name = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.name;

    // unchanged
    assert!(matches!(s.edit(id, &name, Some("4")), Err(FeidError::Validation { .. })));
    // nothing to release
    assert!(matches!(s.edit(id, &name, Some("auto")), Err(FeidError::Validation { .. })));
    // static columns have no computed value to go back to
    assert!(matches!(s.edit(id, "magnitude", Some("auto")), Err(FeidError::Validation { .. })));
    // unknown event
    assert!(matches!(s.edit(id + 100, "magnitude", Some("1")), Err(FeidError::NotFound { .. })));

    let diff = GenericParams::new(Operation::Diff)
        .with_column(ColumnRef::new("forbush_effects", "magnitude"))
        .with_other_column(ColumnRef::new("forbush_effects", "vmax"));
    let diff = s.engine.define_column(1, "forbush_effects", diff, false).unwrap().column.name;
    let err = s.edit(id, &diff, Some("3")).unwrap_err();
    assert!(matches!(err, FeidError::Validation { ref field, .. } if field == "column"));
}

#[test]
fn test_silent_edit_skips_changelog() {
    let s = setup();
    let id = s.fe(100, None);
    s.engine
        .set_value(&ManualEdit {
            author: 3,
            entity: "forbush_effects".into(),
            event_id: id,
            column: "magnitude".into(),
            value: Some("2.4".into()),
            silent: true,
        })
        .unwrap();
    assert_eq!(s.cell("magnitude", id), Some(2.4));
    assert!(s.engine.changelog("forbush_effects", id).unwrap().is_empty());
}

#[test]
fn test_silent_release_is_still_recorded() {
    let s = setup();
    let id = s.fe(100, Some(10.0));
    s.series.insert_hourly("sw_speed", 100, &[1.0, 5.0, 2.0, 9.0, 3.0].map(Some));
    let name = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.name;
    s.edit(id, &name, Some("12.5")).unwrap();

    let released = s
        .engine
        .set_value(&ManualEdit {
            author: 1,
            entity: "forbush_effects".into(),
            event_id: id,
            column: name.clone(),
            value: Some("auto".into()),
            silent: true,
        })
        .unwrap();
    assert!(matches!(released, EditOutcome::Released { .. }));
    assert_eq!(s.cell(&name, id), Some(9.0));

    // a later recompute must not bring the manual value back
    finished(s.engine.recompute_column(&name).unwrap());
    assert_eq!(s.cell(&name, id), Some(9.0));

    let log = s.engine.changelog("forbush_effects", id).unwrap();
    assert_eq!(log.last().and_then(|e| e.new_value.as_deref()), Some("auto"));
}

// ==========================================================================
// RECOMPUTATION JOBS
// ==========================================================================

#[test]
fn test_recompute_row_finishes_within_timeout() {
    let s = setup();
    let id = s.fe(100, Some(5.0));
    let name = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.name;
    assert_eq!(s.cell(&name, id), None);

    s.series.insert_hourly("sw_speed", 100, &[Some(3.0), Some(8.0)]);
    let report = finished(s.engine.recompute_row("forbush_effects", id).unwrap());
    assert_eq!(report.computed, vec![name.clone()]);
    assert_eq!(s.cell(&name, id), Some(8.0));

    assert!(matches!(
        s.engine.recompute_row("forbush_effects", id + 1),
        Err(FeidError::NotFound { .. })
    ));
}

#[test]
fn test_recompute_all_reports_once() {
    let s = setup();
    let id = s.fe(100, Some(5.0));
    s.series.insert_hourly("sw_speed", 100, &[Some(3.0), Some(8.0)]);
    let base = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column;
    let diff = GenericParams::new(Operation::Diff)
        .with_column(ColumnRef::new("forbush_effects", &base.name))
        .with_other_column(ColumnRef::new("forbush_effects", "vmax"));
    let diff = s.engine.define_column(1, "forbush_effects", diff, false).unwrap().column;

    s.edit(id, "vmax", Some("2")).unwrap();
    s.engine.recompute_all();

    let deadline = Instant::now() + Duration::from_secs(30);
    while s.engine.is_running(RECOMPUTE_ALL) {
        assert!(Instant::now() < deadline, "recompute_all did not finish");
        std::thread::sleep(Duration::from_millis(10));
    }
    let report = finished(s.engine.job_status(RECOMPUTE_ALL));
    assert_eq!(report.computed.len(), 2);
    assert_eq!(s.cell(&diff.name, id), Some(6.0));

    // the report was handed out; the slot is idle again
    assert_eq!(s.engine.job_status(RECOMPUTE_ALL), JobStatus::Idle);
}

#[test]
fn test_column_is_never_computed_twice_at_once() {
    let (s, slow) = slow_setup(Duration::from_millis(400));
    let id = s.fe(100, Some(5.0));
    s.series.insert_hourly("sw_speed", 100, &[Some(3.0), Some(8.0)]);
    let name = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.name;

    assert!(matches!(s.engine.recompute_all(), JobStatus::Busy { .. }));
    wait_until("the batch to start reading", || slow.active.load(Ordering::SeqCst) >= 1);

    let report = finished(s.engine.recompute_column(&name).unwrap());
    assert_eq!(report.busy, vec![name.clone()]);
    assert!(report.computed.is_empty());
    assert!(report.error.is_none());

    wait_until("recompute_all", || !s.engine.is_running(RECOMPUTE_ALL));
    assert_eq!(finished(s.engine.job_status(RECOMPUTE_ALL)).computed, vec![name.clone()]);
    assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
    assert_eq!(s.cell(&name, id), Some(8.0));
}

#[test]
fn test_recompute_all_twice_runs_one_batch() {
    let (s, slow) = slow_setup(Duration::from_millis(200));
    s.fe(100, Some(5.0));
    s.series.insert_hourly("sw_speed", 100, &[Some(3.0), Some(8.0)]);
    s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap();
    let per_batch = slow.calls.load(Ordering::SeqCst);
    assert!(per_batch > 0);

    let first = s.engine.recompute_all();
    let second = s.engine.recompute_all();
    assert!(matches!(first, JobStatus::Busy { .. }));
    assert!(matches!(second, JobStatus::Busy { .. }));

    wait_until("recompute_all", || !s.engine.is_running(RECOMPUTE_ALL));
    let report = finished(s.engine.job_status(RECOMPUTE_ALL));
    assert_eq!(report.computed.len(), 1);
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2 * per_batch);
    assert_eq!(s.engine.job_status(RECOMPUTE_ALL), JobStatus::Idle);
}

#[test]
fn test_release_waits_for_running_batch() {
    let (s, slow) = slow_setup(Duration::from_millis(300));
    let id = s.fe(100, Some(5.0));
    s.series.insert_hourly("sw_speed", 100, &[Some(3.0), Some(8.0)]);
    let name = s.engine.define_column(1, "forbush_effects", max_speed(), false).unwrap().column.name;
    s.edit(id, &name, Some("12")).unwrap();

    s.engine.recompute_all();
    wait_until("the batch to start reading", || slow.active.load(Ordering::SeqCst) >= 1);
    assert!(matches!(s.edit(id, &name, Some("auto")).unwrap(), EditOutcome::Released { .. }));
    assert_eq!(s.cell(&name, id), Some(8.0));
    assert_eq!(slow.peak.load(Ordering::SeqCst), 1);

    wait_until("recompute_all", || !s.engine.is_running(RECOMPUTE_ALL));
    assert_eq!(s.cell(&name, id), Some(8.0));
}

// ==========================================================================
// READ PATH AND IMPORT
// ==========================================================================

#[test]
fn test_read_events_with_related_columns() {
    let s = setup();
    let fe = s.fe(100, Some(5.0));
    let mut erupt = NewEvent {
        time: 90 * HOUR,
        parent_id: Some(fe),
        ..Default::default()
    };
    erupt.values.insert("cme_speed".into(), serde_json::json!(1500.0));
    let def = s.engine.graph().entity("sources_erupt").unwrap();
    s.engine.db().insert_event(def, &erupt).unwrap();

    let columns = [
        ColumnRef::new("forbush_effects", "time"),
        ColumnRef::new("sources_erupt", "cme_speed"),
    ];
    let table = s.engine.read_events(1, "forbush_effects", &columns).unwrap();
    assert_eq!(table.columns, vec!["id", "time", "sources_erupt.cme_speed"]);
    assert_eq!(table.rows, vec![vec![serde_json::json!(fe), serde_json::json!(100 * HOUR), serde_json::json!(1500.0)]]);
}

#[test]
fn test_import_series_into_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        db_path: dir.path().join("feid.db"),
        ..Config::default()
    };
    let engine = Engine::open(config).unwrap();

    let events = format!("{{\"time\": {}, \"duration\": 3}}\n", 200 * HOUR);
    let ids = engine.import_events("forbush_effects", events.as_bytes()).unwrap();

    let lines: String = (0..3)
        .map(|i| format!("{{\"time\": {}, \"imf_scalar\": {}, \"dst_index\": null}}\n", (200 + i) * HOUR, 10 + i))
        .collect();
    assert_eq!(engine.import_series(lines.as_bytes()).unwrap(), 6);

    let params = GenericParams::new(Operation::Mean).with_series("imf_scalar");
    let name = engine.define_column(1, "forbush_effects", params, false).unwrap().column.name;
    let values = engine.db().select_real("forbush_effects", &[], &name).unwrap();
    assert_eq!(values[&ids[0]], Some(11.0));
}
