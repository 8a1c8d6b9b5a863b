#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use runbroker::assets::handlers::{register_builtin_handlers, JSON_SPEC};
use runbroker::core::types::{DataKey, Document, Event, EventDescriptor, RunStart, RunStop};
use runbroker::{Broker, MetadataStore, Registry};
use serde_json::{json, Map, Value};

pub fn memory_broker() -> Broker {
    Broker::new(Arc::new(MetadataStore::in_memory()), Arc::new(Registry::default()))
}

/// Broker whose assets live under `root`, with builtin handlers
pub fn broker_with_assets(root: &Path) -> Broker {
    let registry = Arc::new(Registry::new(Some(root.to_path_buf()), 16));
    register_builtin_handlers(&registry).unwrap();
    Broker::new(Arc::new(MetadataStore::in_memory()), registry)
}

pub fn query(value: Value) -> runbroker::Query {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

/// Run start with a hand-picked uid
pub fn start_with_uid(uid: &str, scan_id: i64, time: f64) -> RunStart {
    let mut start = RunStart::new(scan_id, time);
    start.uid = uid.to_string();
    start
}

/// Insert a finished run with `count` events of a scalar `x` in the primary stream
pub fn scalar_run(db: &Broker, start: RunStart, count: u64) -> RunStart {
    let descriptor = EventDescriptor::new(&start, "primary", start.time)
        .with_key("x", DataKey::scalar("number"));
    db.insert(Document::Start(start.clone())).unwrap();
    db.insert(Document::Descriptor(descriptor.clone())).unwrap();
    for seq in 1..=count {
        let event = Event::new(&descriptor, seq, start.time + seq as f64).with_value("x", seq);
        db.insert(Document::Event(event)).unwrap();
    }
    db.insert(Document::Stop(RunStop::new(&start, start.time + 100.0))).unwrap();
    start
}

/// Insert a finished run whose `image` field lives in a JSON file under the registry root.
///
/// Returns the start and the datum ids in event order; datum `i` holds `[i, i * 10]`.
pub fn image_run(db: &Broker, scan_id: i64, time: f64, frames: usize) -> (RunStart, Vec<String>) {
    let root = db.registry().root().unwrap().to_path_buf();
    let start = RunStart::new(scan_id, time).with_field("sample", "running measurements");
    let relative = format!("run_{}/images.json", &start.uid[..8]);
    let path = root.join(&relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let payloads: Vec<Value> = (0..frames).map(|i| json!([i, i * 10])).collect();
    fs::write(&path, serde_json::to_string(&payloads).unwrap()).unwrap();

    let resource = db
        .registry()
        .insert_resource(JSON_SPEC, &relative, Map::new(), None)
        .unwrap();

    let primary = EventDescriptor::new(&start, "primary", time)
        .with_key("motor", DataKey::scalar("number"))
        .with_key("image", DataKey::external("array", JSON_SPEC));
    let baseline = EventDescriptor::new(&start, "baseline", time)
        .with_key("temperature", DataKey::scalar("number"));
    db.insert(Document::Start(start.clone())).unwrap();
    db.insert(Document::Descriptor(primary.clone())).unwrap();
    db.insert(Document::Descriptor(baseline.clone())).unwrap();
    db.insert(Document::Event(
        Event::new(&baseline, 1, time + 0.5).with_value("temperature", 293.0),
    ))
    .unwrap();

    let mut datum_ids = Vec::new();
    for i in 0..frames {
        let datum_id = format!("{}-{}", &start.uid[..8], i);
        let mut kwargs = Map::new();
        kwargs.insert("index".to_string(), json!(i));
        db.registry().insert_datum(&resource.uid, &datum_id, kwargs).unwrap();
        let event = Event::new(&primary, i as u64 + 1, time + 1.0 + i as f64)
            .with_value("motor", i as f64 * 0.25)
            .with_value("image", datum_id.clone());
        db.insert(Document::Event(event)).unwrap();
        datum_ids.push(datum_id);
    }
    db.insert(Document::Stop(RunStop::new(&start, time + 100.0))).unwrap();
    (start, datum_ids)
}
