mod common;

use common::*;
use runbroker::assets::handler::{factory, Handler};
use runbroker::assets::handlers::JSON_SPEC;
use runbroker::core::types::Filled;
use runbroker::{FillMode, FillSelector, StreamOptions, TableOptions};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

struct Constant(&'static str);

impl Handler for Constant {
    fn retrieve(&self, _datum_kwargs: &Map<String, Value>) -> runbroker::Result<Value> {
        Ok(json!(self.0))
    }

    fn get_file_list(&self, _datum_kwargs: &[Map<String, Value>]) -> runbroker::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Event filling
// ============================================================================

#[test]
fn test_events_fill_only_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    let (_, datum_ids) = image_run(&db, 1, 1.0, 3);
    let header = db.get(-1).unwrap();

    let raw: Vec<_> = db
        .get_events(header.clone(), StreamOptions::new())
        .unwrap()
        .collect::<runbroker::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(raw[0].data["image"], json!(datum_ids[0]));
    assert_eq!(raw[0].filled["image"], Filled::Flag(false));

    let mut events = db
        .get_events(header, StreamOptions::new().fill(FillSelector::All))
        .unwrap();
    let filled: Vec<_> = events.by_ref().collect::<runbroker::Result<Vec<_>>>().unwrap();
    assert_eq!(filled[2].data["image"], json!([2, 20]));
    assert_eq!(filled[2].filled["image"], Filled::Datum(datum_ids[2].clone()));
    assert_eq!(events.fill_stats().fields_filled, 3);
}

#[test]
fn test_fill_selector_ignores_non_external_names() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    image_run(&db, 1, 1.0, 1);
    let header = db.get(-1).unwrap();

    let event = db
        .get_events(header, StreamOptions::new().fill(["motor", "image"]))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(event.data["image"], json!([0, 0]));
    assert_eq!(event.data["motor"], json!(0.0));
}

#[test]
fn test_fill_event_copy_leaves_original_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    image_run(&db, 1, 1.0, 2);
    let header = db.get(-1).unwrap();
    let original = db
        .get_events(header, StreamOptions::new())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();

    let copy = db
        .fill_event(original.clone(), FillMode::Copy, Default::default())
        .unwrap();
    assert_eq!(copy.data["image"], json!([0, 0]));
    assert!(original.data["image"].is_string());

    let again = db.fill_event(copy.clone(), FillMode::InPlace, Default::default()).unwrap();
    assert_eq!(again, copy);
}

#[test]
fn test_fill_events_over_foreign_descriptor_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    image_run(&db, 1, 1.0, 1);
    image_run(&db, 2, 2.0, 1);
    let first = db.get(-2).unwrap().one().unwrap();
    let second = db.get(-1).unwrap().one().unwrap();

    let events: Vec<_> = db
        .get_events(&second, StreamOptions::new())
        .unwrap()
        .collect::<runbroker::Result<Vec<_>>>()
        .unwrap();
    let descriptors: Vec<_> = first.descriptors().unwrap().to_vec();
    let mut filled = db.fill_events(
        events,
        descriptors.iter().map(|d| &**d),
        FillSelector::All,
        FillMode::InPlace,
    );
    let err = filled.next().unwrap().unwrap_err();
    assert!(err.is(runbroker::ErrorKind::NoEventDescriptors));
}

// ============================================================================
// Handler scopes
// ============================================================================

#[test]
fn test_handler_overrides_are_scoped_to_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    let (_, datum_ids) = image_run(&db, 1, 1.0, 3);
    let header = db.get(-1).unwrap();

    let options = StreamOptions::new()
        .fill(FillSelector::All)
        .handler(JSON_SPEC, factory(|_: &Path, _: &Map<String, Value>| Ok(Constant("override"))));
    let mut events = db.get_events(header.clone(), options).unwrap();
    let first = events.next().unwrap().unwrap();
    assert_eq!(first.data["image"], json!("override"));
    drop(events);

    // Dropping the partially consumed stream restored the builtin handler
    assert_eq!(db.registry().retrieve(&datum_ids[1]).unwrap(), json!([1, 10]));
    let event = db
        .get_events(header, StreamOptions::new().fill(true))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(event.data["image"], json!([0, 0]));
}

#[test]
fn test_concurrent_streams_restore_handlers_in_any_drop_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    let (_, datum_ids) = image_run(&db, 1, 1.0, 2);
    let header = db.get(-1).unwrap();

    let first = db
        .get_events(
            header.clone(),
            StreamOptions::new()
                .fill(true)
                .handler(JSON_SPEC, factory(|_: &Path, _: &Map<String, Value>| Ok(Constant("A")))),
        )
        .unwrap();
    let mut second = db
        .get_events(
            header,
            StreamOptions::new()
                .fill(true)
                .handler(JSON_SPEC, factory(|_: &Path, _: &Map<String, Value>| Ok(Constant("B")))),
        )
        .unwrap();
    assert_eq!(second.next().unwrap().unwrap().data["image"], json!("B"));

    drop(first);
    drop(second);
    assert_eq!(db.registry().retrieve(&datum_ids[0]).unwrap(), json!([0, 0]));
}

#[test]
fn test_missing_handler_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    let (_, datum_ids) = image_run(&db, 1, 1.0, 1);
    db.registry().deregister_handler(JSON_SPEC);

    let err = db.registry().retrieve(&datum_ids[0]).unwrap_err();
    assert!(err.is(runbroker::ErrorKind::HandlerNotFound));
}

// ============================================================================
// Tables
// ============================================================================

#[test]
fn test_table_fills_external_columns() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    let (_, datum_ids) = image_run(&db, 1, 1.0, 3);
    let header = db.get(-1).unwrap();

    let raw = db
        .get_table(header.clone(), StreamOptions::new(), &TableOptions::raw_times())
        .unwrap();
    assert_eq!(raw.len(), 3);
    assert_eq!(raw.seq_num, vec![1, 2, 3]);
    assert_eq!(raw.column("image").unwrap().values[1], json!(datum_ids[1]));
    assert_eq!(raw.column("time").unwrap().values[0], json!(2.0));

    let filled = db
        .get_table(header, StreamOptions::new().fill(true), &TableOptions::raw_times())
        .unwrap();
    assert_eq!(filled.column("image").unwrap().values[2], json!([2, 20]));
    assert_eq!(filled.column("motor").unwrap().values[2], json!(0.5));
}

#[test]
fn test_table_concatenates_runs() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    image_run(&db, 1, 1.0, 2);
    image_run(&db, 2, 50.0, 3);
    let headers = db.get(runbroker::query::key::SearchKey::slice(Some(-2), None, None)).unwrap();

    let table = db
        .get_table(headers, StreamOptions::new().fields(["motor"]), &TableOptions::default())
        .unwrap();
    assert_eq!(table.len(), 5);
    assert!(table.column("image").is_none());
    assert!(table.column("time").unwrap().values[0].is_string());
}
