use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};
use crate::assets::handler::HandlerOverrides;
use crate::assets::handlers::register_builtin_handlers;
use crate::assets::registry::{CopyOptions, Registry};
use crate::core::config::{lookup_config, temp_config, Config};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::header::{Header, IntoHeaders};
use crate::core::results::ResultsView;
use crate::core::types::{wrap_document, Document, DocumentKind, Event, EventDescriptor, PrepareHook};
use crate::fill::pipeline::{fill_table, FillMode, FillPipeline, FillSelector, FilledEvents};
use crate::query::Query;
use crate::query::key::{resolve, SearchKey};
use crate::query::time::format_time;
use crate::storage::memory::MetadataStore;
use crate::storage::source::{EventSource, HeaderSource, Sources};
use crate::stream::documents::{DocumentStream, Events, StreamOptions};
use crate::stream::table::{Table, TableOptions};
use crate::stream::StreamName;

/// Operation names that cannot be used as aliases
const RESERVED_NAMES: &[&str] = &[
    "add_event_source", "add_filter", "alias", "clear_filters", "dynamic_alias",
    "export", "export_size", "fill_event", "fill_events", "fill_table", "filters",
    "get", "get_documents", "get_events", "get_resource_uids", "get_table",
    "insert", "named", "process", "query_alias", "registry", "restream", "search",
    "set_filters", "stream_names_given_header", "temporary",
];

/// A saved query
#[derive(Clone)]
pub enum Alias {
    Static(Query),
    /// Rebuilt on every use, e.g. "the last 24 hours"
    Dynamic(Arc<dyn Fn() -> Query + Send + Sync>),
}

impl Alias {
    fn query(&self) -> Query {
        match self {
            Alias::Static(query) => query.clone(),
            Alias::Dynamic(build) => build(),
        }
    }
}

/// Result of `Broker::get`: one run, or a list for slice and collection keys
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    One(Header),
    Many(Vec<Header>),
}

impl Lookup {
    pub fn len(&self) -> usize {
        match self {
            Lookup::One(_) => 1,
            Lookup::Many(headers) => headers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn one(self) -> Option<Header> {
        match self {
            Lookup::One(header) => Some(header),
            Lookup::Many(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<Header> {
        match self {
            Lookup::One(header) => vec![header],
            Lookup::Many(headers) => headers,
        }
    }
}

impl IntoHeaders for Lookup {
    fn into_headers(self) -> Result<Vec<Header>> {
        Ok(self.into_vec())
    }
}

/// Unified read interface over run metadata, event data and external assets.
///
/// Clones share sources, filters and aliases.
#[derive(Clone)]
pub struct Broker {
    sources: Arc<Sources>,
    filters: Arc<RwLock<Vec<Query>>>,
    aliases: Arc<RwLock<BTreeMap<String, Alias>>>,
    prepare_hook: PrepareHook,
}

impl Broker {
    /// Broker over one store serving both headers and events
    pub fn new(store: Arc<MetadataStore>, registry: Arc<Registry>) -> Self {
        Self::with_sources(store.clone(), vec![store as Arc<dyn EventSource>], registry)
    }

    pub fn with_sources(
        header_source: Arc<dyn HeaderSource>,
        event_sources: Vec<Arc<dyn EventSource>>,
        registry: Arc<Registry>,
    ) -> Self {
        Broker {
            sources: Arc::new(Sources::new(header_source, event_sources, registry)),
            filters: Arc::new(RwLock::new(Vec::new())),
            aliases: Arc::new(RwLock::new(BTreeMap::new())),
            prepare_hook: wrap_document,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(MetadataStore::from_config(&config.metadatastore)?);
        let registry = Arc::new(Registry::new(
            config.assets.root.clone(),
            config.assets.handler_cache_size,
        ));
        if let Some(root) = &config.assets.root {
            fs::create_dir_all(root)?;
        }
        if config.auto_register {
            register_builtin_handlers(&registry)?;
        }
        info!(
            persisted = config.metadatastore.directory.is_some(),
            timezone = %config.metadatastore.timezone,
            "broker ready"
        );
        Ok(Self::new(store, registry))
    }

    /// Broker built from the named configuration on the search path
    pub fn named(name: &str) -> Result<Self> {
        Self::from_config(&lookup_config(name)?)
    }

    /// Broker backed by a fresh scratch directory
    pub fn temporary() -> Result<Self> {
        Self::from_config(&temp_config()?)
    }

    pub fn with_prepare_hook(mut self, hook: PrepareHook) -> Self {
        self.prepare_hook = hook;
        self
    }

    pub fn prepare_hook(&self) -> PrepareHook {
        self.prepare_hook
    }

    pub fn header_source(&self) -> &Arc<dyn HeaderSource> {
        self.sources.header_source()
    }

    pub fn event_sources(&self) -> Vec<Arc<dyn EventSource>> {
        self.sources.event_sources()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.sources.registry()
    }

    pub fn add_event_source(&self, source: Arc<dyn EventSource>) {
        self.sources.add_event_source(source);
    }

    /// Route a document to the store that owns its kind
    pub fn insert(&self, doc: Document) -> Result<()> {
        let doc = doc.sanitize();
        match doc {
            Document::Start(_) | Document::Stop(_) => self.header_source().insert(doc),
            Document::Descriptor(_) | Document::Event(_) => {
                let sources = self.event_sources();
                let target = sources.first().ok_or_else(|| {
                    Error::invalid_argument("No event source to insert into")
                })?;
                target.insert(doc)
            }
            Document::Resource(resource) => self.registry().add_resource(resource).map(|_| ()),
            Document::Datum(datum) => self.registry().add_datum(datum).map(|_| ()),
        }
    }

    // Filters

    pub fn filters(&self) -> Vec<Query> {
        self.filters.read().clone()
    }

    /// Replace every filter; `start_time` / `stop_time` become `time` ranges.
    pub fn set_filters(&self, filters: Vec<Query>) -> Result<()> {
        let tz = self.header_source().timezone();
        let mut normalized = Vec::with_capacity(filters.len());
        for mut filter in filters {
            format_time(&mut filter, &tz)?;
            normalized.push(filter);
        }
        *self.filters.write() = normalized;
        Ok(())
    }

    /// Append a filter; fails if any of its keys is already filtered on.
    pub fn add_filter(&self, mut filter: Query) -> Result<()> {
        format_time(&mut filter, &self.header_source().timezone())?;
        let mut filters = self.filters.write();
        for existing in filters.iter() {
            if let Some(key) = filter.keys().find(|k| existing.contains_key(*k)) {
                return Err(Error::new(
                    ErrorKind::DuplicateFilterKey,
                    format!("Filter key '{}' already exists", key),
                ));
            }
        }
        filters.push(filter);
        Ok(())
    }

    pub fn clear_filters(&self) {
        self.filters.write().clear();
    }

    // Aliases

    fn check_alias_name(&self, name: &str) -> Result<()> {
        let mut chars = name.chars();
        let identifier = chars
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_');
        if !identifier || RESERVED_NAMES.contains(&name) {
            return Err(Error::new(
                ErrorKind::IllegalAliasName,
                format!("'{}' is not a legal alias", name),
            ));
        }
        Ok(())
    }

    pub fn alias(&self, name: &str, query: Query) -> Result<()> {
        self.check_alias_name(name)?;
        self.aliases.write().insert(name.to_string(), Alias::Static(query));
        Ok(())
    }

    pub fn dynamic_alias<F>(&self, name: &str, build: F) -> Result<()>
    where
        F: Fn() -> Query + Send + Sync + 'static,
    {
        self.check_alias_name(name)?;
        self.aliases
            .write()
            .insert(name.to_string(), Alias::Dynamic(Arc::new(build)));
        Ok(())
    }

    pub fn alias_names(&self) -> Vec<String> {
        self.aliases.read().keys().cloned().collect()
    }

    /// Run the query saved under `name`
    pub fn query_alias(&self, name: &str) -> Result<ResultsView> {
        let alias = self
            .aliases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No alias named '{}'", name)))?;
        self.search(None, alias.query())
    }

    // Lookup and search

    /// Resolve a key into one header, or a list for slice and collection keys.
    pub fn get(&self, key: impl Into<SearchKey>) -> Result<Lookup> {
        let key = key.into();
        let pairs = resolve(&key, self.header_source().as_ref())?;
        let mut headers: Vec<Header> = pairs
            .into_iter()
            .map(|pair| Header::new(pair, Arc::clone(&self.sources)))
            .collect();
        if !key.is_multi() && headers.len() == 1 {
            if let Some(header) = headers.pop() {
                return Ok(Lookup::One(header));
            }
        }
        Ok(Lookup::Many(headers))
    }

    /// Runs matching a text search, a keyword query and the broker's filters.
    ///
    /// `data_key` in `query` restricts results to runs with that field;
    /// `start_time` / `stop_time` become a range on `time`.
    pub fn search(&self, text: Option<&str>, mut query: Query) -> Result<ResultsView> {
        let data_key = match query.remove("data_key") {
            Some(Value::String(field)) => Some(field),
            Some(other) => {
                return Err(Error::invalid_argument(format!("data_key must be a string, got {}", other)));
            }
            None => None,
        };
        format_time(&mut query, &self.header_source().timezone())?;

        let source = Arc::clone(self.header_source());
        let filters = self.filters();
        let text = text.map(str::to_string);
        debug!(?text, ?query, filters = filters.len(), "search");
        Ok(ResultsView::new(
            Arc::clone(&self.sources),
            move || source.search(text.as_deref(), &query, &filters),
            data_key,
        ))
    }

    pub fn stream_names_given_header(&self, header: &Header) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for source in self.event_sources() {
            names.extend(source.stream_names_given_header(header)?);
        }
        Ok(names)
    }

    // Documents

    fn stream(&self, headers: Vec<Header>, default: StreamName, options: StreamOptions) -> Result<DocumentStream> {
        let stream = options.stream_or(default);
        DocumentStream::new(
            headers,
            self.event_sources(),
            stream,
            options,
            Arc::clone(self.registry()),
            self.prepare_hook,
        )
    }

    /// Every document of the given runs; all streams unless `options` names one.
    pub fn get_documents(&self, headers: impl IntoHeaders, options: StreamOptions) -> Result<DocumentStream> {
        self.stream(headers.into_headers()?, StreamName::All, options)
    }

    /// Events of the given runs; the "primary" stream unless `options` names one.
    pub fn get_events(&self, headers: impl IntoHeaders, options: StreamOptions) -> Result<Events> {
        Ok(self
            .stream(headers.into_headers()?, StreamName::primary(), options)?
            .events())
    }

    /// Every document of the given runs across all streams, for replaying into a consumer
    pub fn restream(&self, headers: impl IntoHeaders, options: StreamOptions) -> Result<DocumentStream> {
        self.get_documents(headers, options.all_streams())
    }

    /// Feed every document of the given runs to `func`
    pub fn process<F>(&self, headers: impl IntoHeaders, mut func: F, options: StreamOptions) -> Result<()>
    where
        F: FnMut(DocumentKind, Document) -> Result<()>,
    {
        for item in self.restream(headers, options)? {
            let (kind, doc) = item?;
            func(kind, doc)?;
        }
        Ok(())
    }

    /// Table of one stream per run, concatenated; "primary" unless `options` names one.
    pub fn get_table(
        &self,
        headers: impl IntoHeaders,
        options: StreamOptions,
        table_options: &TableOptions,
    ) -> Result<Table> {
        let stream = options.stream_or(StreamName::primary());
        let headers = headers.into_headers()?;
        let registry = Arc::clone(self.registry());
        let _scope = registry.handler_context(options.handler_overrides);

        let mut tables = Vec::new();
        for header in &headers {
            let Some(descriptor) = header
                .descriptors()?
                .iter()
                .find(|d| stream.matches(&d.name))
                .cloned()
            else {
                continue;
            };
            for source in self.event_sources() {
                let mut table = source.table_given_header(
                    header,
                    &stream,
                    options.fields.as_deref(),
                    table_options,
                )?;
                if table.is_empty() {
                    continue;
                }
                fill_table(&registry, &mut table, &descriptor, &options.fill)?;
                tables.push(table);
            }
        }
        info!(runs = headers.len(), tables = tables.len(), "built table");
        Ok(Table::concat(tables))
    }

    // Filling

    /// Fill every external field of one event, looking its descriptor up in the event sources.
    pub fn fill_event(&self, event: Event, mode: FillMode, overrides: HandlerOverrides) -> Result<Event> {
        let mut descriptors = Vec::new();
        for source in self.event_sources() {
            match source.descriptor_given_uid(&event.descriptor) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) if e.is(ErrorKind::NoEventDescriptors) => continue,
                Err(e) => return Err(e),
            }
        }
        let _scope = self.registry().handler_context(overrides);
        let mut pipeline = FillPipeline::new(
            Arc::clone(self.registry()),
            descriptors.iter().map(Arc::as_ref),
            FillSelector::All,
            mode,
            self.prepare_hook,
        );
        let filled = pipeline.push(event)?;
        pipeline.close();
        Ok(filled)
    }

    /// Lazily fill a sequence of events described by `descriptors`
    pub fn fill_events<'a, I>(
        &self,
        events: I,
        descriptors: impl IntoIterator<Item = &'a EventDescriptor>,
        fill: FillSelector,
        mode: FillMode,
    ) -> FilledEvents<I::IntoIter>
    where
        I: IntoIterator<Item = Event>,
    {
        let pipeline = FillPipeline::new(
            Arc::clone(self.registry()),
            descriptors,
            fill,
            mode,
            self.prepare_hook,
        );
        FilledEvents::new(events.into_iter(), pipeline)
    }

    /// Replace datum-id columns of `table` with payloads
    pub fn fill_table(&self, mut table: Table, descriptor: &EventDescriptor, fill: &FillSelector) -> Result<Table> {
        fill_table(self.registry(), &mut table, descriptor, fill)?;
        Ok(table)
    }

    // Assets and export

    /// Uids of every resource referenced by the run's events
    pub fn get_resource_uids(&self, header: &Header) -> Result<BTreeSet<String>> {
        let external = header.external_fields()?;
        let mut resources = BTreeSet::new();
        if external.is_empty() {
            return Ok(resources);
        }
        let options = StreamOptions::new().all_streams().fields(external.iter().cloned());
        for event in self.get_events(header, options)? {
            let event = event?;
            for field in &external {
                if let Some(datum_id) = event.data.get(field).and_then(Value::as_str) {
                    resources.insert(self.registry().resource_given_datum_id(datum_id)?.uid.clone());
                }
            }
        }
        Ok(resources)
    }

    /// Copy runs, and the files they reference, into another broker.
    ///
    /// Resources get new uids in `target` (rooted at `new_root` when given);
    /// datum ids are kept. Returns `(old, new)` file path pairs. Not
    /// transactional: a failure leaves whatever was already copied.
    pub fn export(
        &self,
        headers: impl IntoHeaders,
        target: &Broker,
        new_root: Option<&Path>,
        copy: &CopyOptions,
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mut file_pairs = Vec::new();
        for header in headers.into_headers()? {
            info!(run = %header.uid(), "exporting run");
            target.insert(Document::Start(header.start().clone()))?;
            for descriptor in header.descriptors()? {
                target.insert(Document::Descriptor((**descriptor).clone()))?;
            }
            for event in self.get_events(&header, StreamOptions::new().all_streams())? {
                let mut event = event?;
                event.filled.clear();
                target.insert(Document::Event(event))?;
            }
            match header.stop() {
                Some(stop) => target.insert(Document::Stop(stop.clone()))?,
                None => warn!(run = %header.uid(), "exporting a run without a stop document"),
            }

            for uid in self.get_resource_uids(&header)? {
                let resource = self.registry().resource_given_uid(&uid)?;
                let root = match new_root {
                    Some(new_root) => {
                        file_pairs.extend(self.registry().copy_files(&uid, new_root, copy)?);
                        new_root.to_string_lossy().into_owned()
                    }
                    None if resource.root.is_empty() => self
                        .registry()
                        .root()
                        .map(|root| root.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    None => resource.root.clone(),
                };
                let new_resource = target.registry().insert_resource(
                    &resource.spec,
                    &resource.resource_path,
                    resource.resource_kwargs.clone(),
                    Some(&root),
                )?;
                for datum in self.registry().datum_gen_given_resource(&uid)? {
                    target.registry().insert_datum(
                        &new_resource.uid,
                        &datum.datum_id,
                        datum.datum_kwargs.clone(),
                    )?;
                }
                debug!(old = %uid, new = %new_resource.uid, "exported resource");
            }
        }
        Ok(file_pairs)
    }

    /// Total size in GB of the files referenced by the given runs
    pub fn export_size(&self, headers: impl IntoHeaders) -> Result<f64> {
        let mut total: u64 = 0;
        for header in headers.into_headers()? {
            for uid in self.get_resource_uids(&header)? {
                for file in self.registry().get_file_list(&uid)? {
                    total += fs::metadata(&file)?.len();
                }
            }
        }
        Ok(total as f64 * 1e-9)
    }
}
