use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use chrono::{FixedOffset, Offset, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};
use crate::analysis::analyzer::TextAnalyzer;
use crate::core::config::StoreConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::header::Header;
use crate::core::types::{Document, Event, EventDescriptor, Filled, RunStart, RunStop};
use crate::query::Query;
use crate::query::matcher::DocumentMatcher;
use crate::query::time::{parse_timezone, render_timestamp};
use crate::search::prefix::UidPrefixIndex;
use crate::storage::file_lock::FileLock;
use crate::storage::journal::{Journal, SyncMode};
use crate::storage::layout::StoreLayout;
use crate::storage::source::{DocIter, EventSource, HeaderSource, RunPair};
use crate::stream::StreamName;
use crate::stream::table::{Table, TableOptions, TIME_COLUMN};

struct StartEntry {
    doc: Arc<RunStart>,
    /// JSON form used for query matching
    value: Value,
    /// Analyzed terms of every string in the document
    terms: HashSet<String>,
}

#[derive(Default)]
struct StoreState {
    /// Insertion order, which is recency order
    starts: Vec<StartEntry>,
    start_positions: HashMap<String, usize>,
    /// Keyed by run start uid
    stops: HashMap<String, Arc<RunStop>>,
    /// Keyed by run start uid, arrival order
    descriptors: HashMap<String, Vec<Arc<EventDescriptor>>>,
    descriptor_index: HashMap<String, Arc<EventDescriptor>>,
    /// Keyed by descriptor uid, sorted by (time, seq_num)
    events: HashMap<String, Vec<Arc<Event>>>,
    event_uids: HashSet<String>,
    uid_index: UidPrefixIndex,
}

fn event_order(a: &Event, b: &Event) -> Ordering {
    a.time.total_cmp(&b.time).then(a.seq_num.cmp(&b.seq_num))
}

fn duplicate(kind: &str, uid: &str) -> Error {
    Error::invalid_argument(format!("{} with uid {} already exists", kind, uid))
}

impl StoreState {
    /// Reject documents that would break referential integrity
    fn validate(&self, doc: &Document) -> Result<()> {
        match doc {
            Document::Start(start) => {
                if self.start_positions.contains_key(&start.uid) {
                    return Err(duplicate("Run start", &start.uid));
                }
            }
            Document::Stop(stop) => {
                if !self.start_positions.contains_key(&stop.run_start) {
                    return Err(Error::not_found(format!(
                        "Run stop {} refers to unknown run start {}",
                        stop.uid, stop.run_start
                    )));
                }
                if self.stops.contains_key(&stop.run_start) {
                    return Err(duplicate("Run stop for run", &stop.run_start));
                }
            }
            Document::Descriptor(descriptor) => {
                if !self.start_positions.contains_key(&descriptor.run_start) {
                    return Err(Error::not_found(format!(
                        "Descriptor {} refers to unknown run start {}",
                        descriptor.uid, descriptor.run_start
                    )));
                }
                if self.descriptor_index.contains_key(&descriptor.uid) {
                    return Err(duplicate("Descriptor", &descriptor.uid));
                }
            }
            Document::Event(event) => {
                if !self.descriptor_index.contains_key(&event.descriptor) {
                    return Err(Error::new(
                        ErrorKind::NoEventDescriptors,
                        format!("Event {} refers to unknown descriptor {}", event.uid, event.descriptor),
                    ));
                }
                if self.event_uids.contains(&event.uid) {
                    return Err(duplicate("Event", &event.uid));
                }
            }
            Document::Resource(_) | Document::Datum(_) => {
                return Err(Error::invalid_argument(format!(
                    "The metadata store does not hold {} documents",
                    doc.kind()
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, doc: Document, analyzer: &TextAnalyzer) -> Result<()> {
        match doc {
            Document::Start(start) => {
                let value = serde_json::to_value(&start)?;
                let mut terms = HashSet::new();
                analyzer.analyze_value(&value, &mut terms);
                self.uid_index.insert(&start.uid)?;
                self.start_positions.insert(start.uid.clone(), self.starts.len());
                self.starts.push(StartEntry {
                    doc: Arc::new(start),
                    value,
                    terms,
                });
            }
            Document::Stop(stop) => {
                self.stops.insert(stop.run_start.clone(), Arc::new(stop));
            }
            Document::Descriptor(descriptor) => {
                let descriptor = Arc::new(descriptor);
                self.descriptor_index
                    .insert(descriptor.uid.clone(), Arc::clone(&descriptor));
                self.descriptors
                    .entry(descriptor.run_start.clone())
                    .or_default()
                    .push(descriptor);
            }
            Document::Event(mut event) => {
                if let Some(descriptor) = self.descriptor_index.get(&event.descriptor) {
                    for key in descriptor.external_keys() {
                        if event.data.contains_key(key) && !event.filled.contains_key(key) {
                            event.filled.insert(key.to_string(), Filled::Flag(false));
                        }
                    }
                }
                self.event_uids.insert(event.uid.clone());
                let events = self.events.entry(event.descriptor.clone()).or_default();
                let position = events.partition_point(|e| event_order(e, &event) != Ordering::Greater);
                events.insert(position, Arc::new(event));
            }
            Document::Resource(_) | Document::Datum(_) => {}
        }
        Ok(())
    }

    fn stream_descriptors(&self, start_uid: &str, stream: &StreamName) -> Vec<Arc<EventDescriptor>> {
        self.descriptors
            .get(start_uid)
            .map(|all| {
                all.iter()
                    .filter(|d| stream.matches(&d.name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory run store, optionally persisted to an append-only journal.
///
/// Serves both run starts/stops and descriptors/events.
pub struct MetadataStore {
    state: RwLock<StoreState>,
    journal: Option<Mutex<Journal>>,
    _lock: Option<FileLock>,
    timezone: FixedOffset,
    matcher: DocumentMatcher,
    analyzer: TextAnalyzer,
}

impl MetadataStore {
    fn with_parts(timezone: FixedOffset, journal: Option<Journal>, lock: Option<FileLock>) -> Self {
        MetadataStore {
            state: RwLock::new(StoreState::default()),
            journal: journal.map(Mutex::new),
            _lock: lock,
            timezone,
            matcher: DocumentMatcher::new(),
            analyzer: TextAnalyzer::english(),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_parts(Utc.fix(), None, None)
    }

    pub fn with_timezone(timezone: FixedOffset) -> Self {
        Self::with_parts(timezone, None, None)
    }

    /// Open (or create) a journaled store in `directory`, replaying its history.
    pub fn open(directory: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let timezone = parse_timezone(&config.timezone)?;
        let layout = StoreLayout::new(directory)?;
        let lock = FileLock::acquire(&layout)?;
        let (mut journal, history) = Journal::open(layout.clone(), config.compress_journal)?;
        if config.sync_journal {
            journal.set_sync_mode(SyncMode::Immediate);
        }

        let store = Self::with_parts(timezone, Some(journal), Some(lock));
        {
            let mut state = store.state.write();
            for doc in history {
                state.validate(&doc)?;
                state.apply(doc, &store.analyzer)?;
            }
            info!(
                runs = state.starts.len(),
                path = %layout.base_dir.display(),
                "opened metadata store"
            );
        }
        Ok(store)
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.directory {
            Some(directory) => Self::open(directory, config),
            None => Ok(Self::with_timezone(parse_timezone(&config.timezone)?)),
        }
    }

    /// Validate, journal, then apply one document
    pub fn insert_document(&self, doc: Document) -> Result<()> {
        let mut state = self.state.write();
        state.validate(&doc)?;
        if let Some(journal) = &self.journal {
            journal.lock().append(&doc)?;
        }
        debug!(kind = %doc.kind(), "inserted document");
        state.apply(doc, &self.analyzer)
    }

    pub fn run_count(&self) -> usize {
        self.state.read().starts.len()
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.lock().sync()?;
        }
        Ok(())
    }

    fn pairs(&self, starts: Vec<Arc<RunStart>>) -> Vec<RunPair> {
        let state = self.state.read();
        starts
            .into_iter()
            .map(|start| {
                let stop = state.stops.get(&start.uid).cloned();
                (start, stop)
            })
            .collect()
    }

    fn render_time(&self, seconds: f64, options: &TableOptions) -> Result<Value> {
        if !options.convert_times && !options.localize_times {
            return Ok(Value::from(seconds));
        }
        let tz = if options.localize_times {
            match &options.timezone {
                Some(name) => parse_timezone(name)?,
                None => self.timezone,
            }
        } else {
            Utc.fix()
        };
        Ok(render_timestamp(seconds, &tz)
            .map(Value::String)
            .unwrap_or(Value::from(seconds)))
    }
}

impl HeaderSource for MetadataStore {
    fn find_run_starts(&self, query: &Query) -> Result<Vec<Arc<RunStart>>> {
        let state = self.state.read();
        let mut found = Vec::new();
        for entry in state.starts.iter().rev() {
            if self.matcher.matches(&entry.value, query)? {
                found.push(Arc::clone(&entry.doc));
            }
        }
        Ok(found)
    }

    fn find_last(&self, n: usize) -> Result<Vec<Arc<RunStart>>> {
        let state = self.state.read();
        Ok(state
            .starts
            .iter()
            .rev()
            .take(n)
            .map(|entry| Arc::clone(&entry.doc))
            .collect())
    }

    fn stop_given_start(&self, start_uid: &str) -> Result<Option<Arc<RunStop>>> {
        Ok(self.state.read().stops.get(start_uid).cloned())
    }

    fn search(&self, text: Option<&str>, query: &Query, filters: &[Query]) -> Result<Vec<RunPair>> {
        let mut starts = Vec::new();
        {
            let state = self.state.read();
            'runs: for entry in state.starts.iter().rev() {
                if let Some(text) = text {
                    if !self.analyzer.matches(text, &entry.terms) {
                        continue;
                    }
                }
                for clause in std::iter::once(query).chain(filters) {
                    if !self.matcher.matches(&entry.value, clause)? {
                        continue 'runs;
                    }
                }
                starts.push(Arc::clone(&entry.doc));
            }
        }
        debug!(runs = starts.len(), ?text, "search matched");
        Ok(self.pairs(starts))
    }

    fn insert(&self, doc: Document) -> Result<()> {
        self.insert_document(doc)
    }

    fn timezone(&self) -> FixedOffset {
        self.timezone
    }

    fn find_by_uid_prefix(&self, prefix: &str) -> Result<Vec<Arc<RunStart>>> {
        let state = self.state.read();
        let mut positions: Vec<usize> = state
            .uid_index
            .search_prefix(prefix)
            .iter()
            .filter_map(|uid| state.start_positions.get(uid).copied())
            .collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(positions
            .into_iter()
            .map(|i| Arc::clone(&state.starts[i].doc))
            .collect())
    }
}

impl EventSource for MetadataStore {
    fn descriptors_given_header(&self, start_uid: &str) -> Result<Vec<Arc<EventDescriptor>>> {
        Ok(self
            .state
            .read()
            .descriptors
            .get(start_uid)
            .cloned()
            .unwrap_or_default())
    }

    fn stream_names_given_header(&self, header: &Header) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for descriptor in self.descriptors_given_header(header.uid())? {
            if !names.contains(&descriptor.name) {
                names.push(descriptor.name.clone());
            }
        }
        Ok(names)
    }

    fn docs_given_header(
        &self,
        header: &Header,
        stream: &StreamName,
        fields: Option<&[String]>,
    ) -> Result<DocIter> {
        let state = self.state.read();
        let fields: Option<BTreeSet<String>> = fields.map(|f| f.iter().cloned().collect());

        let descriptors: Vec<Arc<EventDescriptor>> = state
            .stream_descriptors(header.uid(), stream)
            .into_iter()
            .filter(|d| match &fields {
                Some(wanted) => d.data_keys.keys().any(|k| wanted.contains(k)),
                None => true,
            })
            .collect();
        let cursors = descriptors
            .iter()
            .map(|d| EventCursor {
                events: state.events.get(&d.uid).cloned().unwrap_or_default(),
                next: 0,
            })
            .collect();
        let stop = state
            .stops
            .get(header.uid())
            .map(|stop| (**stop).clone())
            .or_else(|| header.stop().cloned());

        Ok(Box::new(RunDocuments {
            start: Some(header.start().clone()),
            descriptors: descriptors.into_iter(),
            cursors,
            stop,
            fields,
        }))
    }

    fn descriptor_given_uid(&self, uid: &str) -> Result<Arc<EventDescriptor>> {
        self.state
            .read()
            .descriptor_index
            .get(uid)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NoEventDescriptors,
                    format!("No descriptor with uid {}", uid),
                )
            })
    }

    fn table_given_header(
        &self,
        header: &Header,
        stream: &StreamName,
        fields: Option<&[String]>,
        options: &TableOptions,
    ) -> Result<Table> {
        let state = self.state.read();
        let mut tables = Vec::new();
        for descriptor in state.stream_descriptors(header.uid(), stream) {
            let mut table = Table::new();
            for event in state.events.get(&descriptor.uid).into_iter().flatten() {
                let mut row: BTreeMap<String, Value> = event
                    .data
                    .iter()
                    .filter(|(k, _)| fields.is_none_or(|f| f.contains(*k)))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                row.insert(TIME_COLUMN.to_string(), self.render_time(event.time, options)?);
                table.push_row(event.seq_num, &row);
            }
            tables.push(table);
        }
        Ok(Table::concat(tables))
    }

    fn insert(&self, doc: Document) -> Result<()> {
        self.insert_document(doc)
    }
}

struct EventCursor {
    events: Vec<Arc<Event>>,
    next: usize,
}

impl EventCursor {
    fn peek(&self) -> Option<&Arc<Event>> {
        self.events.get(self.next)
    }
}

/// Documents of one run, produced on demand: start, descriptors,
/// events merged across descriptors by time, stop.
struct RunDocuments {
    start: Option<RunStart>,
    descriptors: std::vec::IntoIter<Arc<EventDescriptor>>,
    cursors: Vec<EventCursor>,
    stop: Option<RunStop>,
    fields: Option<BTreeSet<String>>,
}

impl RunDocuments {
    fn next_event(&mut self) -> Option<Event> {
        let mut earliest: Option<usize> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(candidate) = cursor.peek() else { continue };
            let better = match earliest.and_then(|e| self.cursors[e].peek()) {
                Some(best) => event_order(candidate, best) == Ordering::Less,
                None => true,
            };
            if better {
                earliest = Some(i);
            }
        }
        let cursor = &mut self.cursors[earliest?];
        let mut event = Event::clone(cursor.peek()?);
        cursor.next += 1;

        if let Some(fields) = &self.fields {
            event.data.retain(|k, _| fields.contains(k));
            event.timestamps.retain(|k, _| fields.contains(k));
            event.filled.retain(|k, _| fields.contains(k));
        }
        Some(event)
    }
}

impl Iterator for RunDocuments {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(start) = self.start.take() {
            return Some(Ok(Document::Start(start)));
        }
        if let Some(descriptor) = self.descriptors.next() {
            return Some(Ok(Document::Descriptor((*descriptor).clone())));
        }
        if let Some(event) = self.next_event() {
            return Some(Ok(Document::Event(event)));
        }
        self.stop.take().map(|stop| Ok(Document::Stop(stop)))
    }
}
