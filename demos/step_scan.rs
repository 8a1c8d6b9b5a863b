/// Example: record a small step scan and read it back through a Broker
///
/// Run with `RUST_LOG=runbroker=debug` to see resolution and fill logging.

use runbroker::assets::handlers::{Lz4FrameWriter, LZ4_FRAMES_SPEC};
use runbroker::core::types::{DataKey, Document, Event, EventDescriptor, RunStart, RunStop};
use runbroker::{Broker, FillSelector, StreamOptions, TableOptions};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. Scratch broker with the builtin handlers registered
    let db = Broker::temporary()?;
    let root = db
        .registry()
        .root()
        .map(|p| p.to_path_buf())
        .ok_or("temporary broker has no asset root")?;

    // 2. Detector frames live in an external LZ4 frame file
    let mut writer = Lz4FrameWriter::create(&root.join("scan_1/frames.lz4"))?;
    let mut kwargs = Map::new();
    kwargs.insert("dtype".to_string(), json!("f64"));
    let resource = db.registry().insert_resource(
        LZ4_FRAMES_SPEC,
        "scan_1/frames.lz4",
        kwargs,
        root.to_str(),
    )?;

    // 3. Record the run
    let start = RunStart::new(1, 1_700_000_000.0)
        .with_field("plan_name", "step_scan")
        .with_field("sample", "silicon wafer");
    let descriptor = EventDescriptor::new(&start, "primary", start.time)
        .with_key("motor", DataKey::scalar("number"))
        .with_key("image", DataKey::external("array", LZ4_FRAMES_SPEC));
    db.insert(Document::Start(start.clone()))?;
    db.insert(Document::Descriptor(descriptor.clone()))?;

    for step in 0..5u64 {
        let pixels: Vec<f64> = (0..4).map(|i| (step * 4 + i) as f64).collect();
        let datum_id = format!("{}/{}", resource.uid, step);
        db.registry()
            .insert_datum(&resource.uid, &datum_id, writer.append_f64(&pixels)?)?;
        let event = Event::new(&descriptor, step + 1, start.time + step as f64)
            .with_value("motor", step as f64 * 0.5)
            .with_value("image", datum_id);
        db.insert(Document::Event(event))?;
    }
    writer.flush()?;
    db.insert(Document::Stop(RunStop::new(&start, start.time + 10.0)))?;

    // 4. Find it again
    let results = db.search(Some("wafer"), Map::new())?;
    for header in &results {
        let header = header?;
        println!("found run {} (scan {:?})", header.uid(), header.scan_id());
    }

    // 5. Stream filled events
    let header = db.get(-1)?;
    let options = StreamOptions::new().fill(FillSelector::All);
    for event in db.get_events(header.clone(), options)? {
        let event = event?;
        let image = event.data.get("image").cloned().unwrap_or(Value::Null);
        println!("seq {} motor={} image={}", event.seq_num, event.data["motor"], image);
    }

    // 6. Same data as a table, raw images left as datum ids
    let table = db.get_table(header, StreamOptions::new(), &TableOptions::default())?;
    println!("table columns: {:?} rows: {}", table.column_names(), table.len());

    Ok(())
}
