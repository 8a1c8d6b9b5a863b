mod common;

use common::*;
use runbroker::assets::CopyOptions;
use runbroker::core::config::{AssetsConfig, Config, StoreConfig};
use runbroker::core::types::{DocumentKind, Filled};
use runbroker::{Broker, StreamOptions};
use serde_json::json;
use std::collections::HashMap;

fn persistent_config(dir: &std::path::Path) -> Config {
    Config {
        metadatastore: StoreConfig {
            directory: Some(dir.join("metadatastore")),
            ..StoreConfig::default()
        },
        assets: AssetsConfig {
            root: Some(dir.join("assets")),
            ..AssetsConfig::default()
        },
        auto_register: true,
    }
}

/// Documents of run `uid` counted by kind, plus the number of baseline events
fn document_counts(db: &Broker, uid: &str) -> (HashMap<DocumentKind, usize>, usize) {
    let header = db.get(uid).unwrap().one().unwrap();
    let mut counts = HashMap::new();
    for item in db.get_documents(&header, StreamOptions::new()).unwrap() {
        let (kind, _) = item.unwrap();
        *counts.entry(kind).or_insert(0) += 1;
    }
    let baseline = db
        .get_events(&header, StreamOptions::new().stream("baseline"))
        .unwrap()
        .count();
    (counts, baseline)
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_journal_replay_restores_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = persistent_config(dir.path());
    let uid = {
        let db = Broker::from_config(&config).unwrap();
        let start = scalar_run(&db, runbroker::RunStart::new(3, 10.0).with_field("sample", "quartz"), 4);
        db.alias("quartz", query(json!({"sample": "quartz"}))).unwrap();
        start.uid
    };

    let db = Broker::from_config(&config).unwrap();
    let header = db.get(3).unwrap().one().unwrap();
    assert_eq!(header.uid(), uid);
    assert!(!header.is_open());
    let events = db.get_events(&header, StreamOptions::new()).unwrap().count();
    assert_eq!(events, 4);

    // Aliases belong to the broker, not the store
    assert!(db.query_alias("quartz").is_err());
}

#[test]
fn test_store_directory_is_locked_while_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = persistent_config(dir.path());
    let db = Broker::from_config(&config).unwrap();
    assert!(Broker::from_config(&config).is_err());
    drop(db);
    assert!(Broker::from_config(&config).is_ok());
}

// ============================================================================
// Export
// ============================================================================

#[test]
fn test_export_copies_documents_and_files() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();
    let source = broker_with_assets(source_dir.path());
    let target = broker_with_assets(target_dir.path());
    let (start, datum_ids) = image_run(&source, 1, 1.0, 3);
    let header = source.get(-1).unwrap().one().unwrap();

    let old_resource = source.registry().resource_given_datum_id(&datum_ids[0]).unwrap();
    let size = source.export_size(&header).unwrap();
    assert!(size > 0.0);

    let pairs = source
        .export(&header, &target, Some(target_dir.path()), &CopyOptions { verify: true })
        .unwrap();
    assert_eq!(pairs.len(), 1);
    let (old, new) = &pairs[0];
    assert!(old.starts_with(source_dir.path()));
    assert!(new.starts_with(target_dir.path()));
    assert!(new.exists());

    // Datum ids are kept, the resource is new
    let new_resource = target.registry().resource_given_datum_id(&datum_ids[0]).unwrap();
    assert_ne!(new_resource.uid, old_resource.uid);
    assert_eq!(new_resource.resource_path, old_resource.resource_path);

    let copied = target.get(start.uid.as_str()).unwrap().one().unwrap();
    assert_eq!(copied.descriptors().unwrap().len(), 2);
    let events: Vec<_> = target
        .get_events(&copied, StreamOptions::new().fill(true))
        .unwrap()
        .collect::<runbroker::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].data["image"], json!([1, 10]));
    assert_eq!(events[1].filled["image"], Filled::Datum(datum_ids[1].clone()));
}

#[test]
fn test_export_round_trips_every_document_kind() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();
    let source = broker_with_assets(source_dir.path());
    let target = broker_with_assets(target_dir.path());
    let (start, _) = image_run(&source, 4, 1.0, 3);
    let header = source.get(start.uid.as_str()).unwrap().one().unwrap();

    source
        .export(&header, &target, Some(target_dir.path()), &CopyOptions::default())
        .unwrap();

    let (before, baseline_before) = document_counts(&source, &start.uid);
    let (after, baseline_after) = document_counts(&target, &start.uid);
    assert_eq!(before, after);
    assert_eq!(after[&DocumentKind::Start], 1);
    assert_eq!(after[&DocumentKind::Descriptor], 2);
    // three primary frames and one baseline reading
    assert_eq!(after[&DocumentKind::Event], 4);
    assert_eq!(after[&DocumentKind::Stop], 1);
    assert_eq!((baseline_before, baseline_after), (1, 1));
    assert!(target.get(start.uid.as_str()).unwrap().one().unwrap().stop().is_some());
}

#[test]
fn test_exported_events_start_unfilled() {
    let source_dir = tempfile::tempdir().unwrap();
    let target_dir = tempfile::tempdir().unwrap();
    let source = broker_with_assets(source_dir.path());
    let target = broker_with_assets(target_dir.path());
    image_run(&source, 1, 1.0, 2);
    let header = source.get(-1).unwrap();

    source
        .export(header, &target, None, &CopyOptions::default())
        .unwrap();
    let event = target
        .get_events(target.get(-1).unwrap(), StreamOptions::new())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(event.filled["image"], Filled::Flag(false));
    assert!(event.data["image"].is_string());
}

#[test]
fn test_resource_uids_cover_every_referenced_resource() {
    let dir = tempfile::tempdir().unwrap();
    let db = broker_with_assets(dir.path());
    let (_, datum_ids) = image_run(&db, 1, 1.0, 2);
    scalar_run(&db, runbroker::RunStart::new(2, 5.0), 2);

    let imaged = db.get(1).unwrap().one().unwrap();
    let uids = db.get_resource_uids(&imaged).unwrap();
    let expected = db.registry().resource_given_datum_id(&datum_ids[0]).unwrap().uid.clone();
    assert_eq!(uids.into_iter().collect::<Vec<_>>(), vec![expected]);

    let plain = db.get(2).unwrap().one().unwrap();
    assert!(db.get_resource_uids(&plain).unwrap().is_empty());
    assert_eq!(db.export_size(&plain).unwrap(), 0.0);
}
