use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use runbroker::core::types::{Document, RunStart, RunStop};
use runbroker::query::key::{resolve, SearchKey};
use runbroker::storage::MetadataStore;
use runbroker::Query;
use serde_json::json;

/// Store with `runs` finished runs and random scan ids
fn populated_store(runs: usize) -> (MetadataStore, Vec<String>) {
    let store = MetadataStore::in_memory();
    let mut rng = rand::thread_rng();
    let mut uids = Vec::with_capacity(runs);
    for i in 0..runs {
        let start = RunStart::new(rng.gen_range(0..runs as i64), i as f64)
            .with_field("plan_name", if i % 2 == 0 { "count" } else { "scan" })
            .with_field("sample", format!("sample {} of batch {}", i, i % 7));
        store.insert_document(Document::Start(start.clone())).unwrap();
        store.insert_document(Document::Stop(RunStop::new(&start, i as f64 + 0.5))).unwrap();
        uids.push(start.uid);
    }
    (store, uids)
}

/// Benchmark each key shape against stores of growing size
fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for runs in [100, 1000, 10000].iter() {
        let (store, uids) = populated_store(*runs);
        let prefix = SearchKey::Uid(uids[runs / 2][..8].to_string());
        let full = SearchKey::Uid(uids[runs / 3].clone());
        let recent = SearchKey::Int(-10);
        let slice = SearchKey::slice(Some(-50), None, Some(2));

        for (name, key) in [("prefix", prefix), ("full_uid", full), ("recent", recent), ("slice", slice)] {
            group.bench_with_input(BenchmarkId::new(name, runs), &key, |b, key| {
                b.iter(|| black_box(resolve(key, &store).unwrap()));
            });
        }
    }
    group.finish();
}

/// Benchmark query matching over every run
fn bench_search(c: &mut Criterion) {
    use runbroker::storage::HeaderSource;

    let (store, _) = populated_store(5000);
    let mut query = Query::new();
    query.insert("plan_name".to_string(), json!("scan"));
    query.insert("time".to_string(), json!({"$gte": 1000.0, "$lt": 4000.0}));

    c.bench_function("search_query", |b| {
        b.iter(|| black_box(store.search(None, &query, &[]).unwrap()));
    });
    c.bench_function("search_text", |b| {
        b.iter(|| black_box(store.search(Some("batch 3"), &Query::new(), &[]).unwrap()));
    });
}

/// Benchmark parsing textual keys
fn bench_parse_key(c: &mut Criterion) {
    c.bench_function("parse_key", |b| {
        b.iter(|| {
            for text in ["-1", "-10:-2:2", "[1, 7, 13]", "f26efc1d"] {
                black_box(text.parse::<SearchKey>().unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_resolve, bench_search, bench_parse_key);
criterion_main!(benches);
