use std::sync::Arc;
use chrono::FixedOffset;
use parking_lot::RwLock;
use crate::assets::registry::Registry;
use crate::core::error::Result;
use crate::core::header::Header;
use crate::core::types::{Document, EventDescriptor, RunStart, RunStop};
use crate::query::Query;
use crate::stream::StreamName;
use crate::stream::table::{Table, TableOptions};

/// A run start paired with its stop document, if the run has finished
pub type RunPair = (Arc<RunStart>, Option<Arc<RunStop>>);

/// Lazy sequence of documents produced by an event source
pub type DocIter = Box<dyn Iterator<Item = Result<Document>> + Send>;

/// Store of RunStart / RunStop documents.
///
/// Every method returning several run starts orders them most recent first.
pub trait HeaderSource: Send + Sync {
    fn find_run_starts(&self, query: &Query) -> Result<Vec<Arc<RunStart>>>;

    fn find_last(&self, n: usize) -> Result<Vec<Arc<RunStart>>>;

    fn stop_given_start(&self, start_uid: &str) -> Result<Option<Arc<RunStop>>>;

    /// Combined text search, keyword query and filter fragments (ANDed).
    fn search(&self, text: Option<&str>, query: &Query, filters: &[Query]) -> Result<Vec<RunPair>>;

    fn insert(&self, doc: Document) -> Result<()>;

    /// Timezone human-friendly times are interpreted in
    fn timezone(&self) -> FixedOffset;

    fn find_by_uid_prefix(&self, prefix: &str) -> Result<Vec<Arc<RunStart>>> {
        let mut query = Query::new();
        query.insert(
            "uid".to_string(),
            serde_json::json!({ "$regex": format!("^{}", regex::escape(prefix)) }),
        );
        self.find_run_starts(&query)
    }
}

/// Store of descriptors and events for runs.
pub trait EventSource: Send + Sync {
    /// Descriptors of one run in arrival order
    fn descriptors_given_header(&self, start_uid: &str) -> Result<Vec<Arc<EventDescriptor>>>;

    fn stream_names_given_header(&self, header: &Header) -> Result<Vec<String>>;

    /// Documents of one run: start, descriptors, events, stop.
    ///
    /// `fields` restricts event payloads to the named fields and drops
    /// descriptors that carry none of them.
    fn docs_given_header(
        &self,
        header: &Header,
        stream: &StreamName,
        fields: Option<&[String]>,
    ) -> Result<DocIter>;

    /// Fails with `NoEventDescriptors` if this source does not know `uid`.
    fn descriptor_given_uid(&self, uid: &str) -> Result<Arc<EventDescriptor>>;

    fn table_given_header(
        &self,
        header: &Header,
        stream: &StreamName,
        fields: Option<&[String]>,
        options: &TableOptions,
    ) -> Result<Table>;

    fn insert(&self, doc: Document) -> Result<()>;
}

/// The collaborators a broker reads through, shared with every header it hands out
pub struct Sources {
    header_source: Arc<dyn HeaderSource>,
    event_sources: RwLock<Vec<Arc<dyn EventSource>>>,
    registry: Arc<Registry>,
}

impl Sources {
    pub fn new(
        header_source: Arc<dyn HeaderSource>,
        event_sources: Vec<Arc<dyn EventSource>>,
        registry: Arc<Registry>,
    ) -> Self {
        Sources {
            header_source,
            event_sources: RwLock::new(event_sources),
            registry,
        }
    }

    pub fn header_source(&self) -> &Arc<dyn HeaderSource> {
        &self.header_source
    }

    /// Event sources in registration order
    pub fn event_sources(&self) -> Vec<Arc<dyn EventSource>> {
        self.event_sources.read().clone()
    }

    pub fn add_event_source(&self, source: Arc<dyn EventSource>) {
        self.event_sources.write().push(source);
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
