use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use serde_json::{json, Value};
use crate::core::error::Result;
use crate::core::types::{EventDescriptor, RunStart, RunStop};
use crate::storage::source::{RunPair, Sources};
use crate::stream::StreamName;

/// One run: its start document, its stop document if finished, and
/// descriptors fetched lazily from every event source.
///
/// Clones share the descriptor cache. Two headers are equal when their
/// run starts have the same uid.
#[derive(Clone)]
pub struct Header {
    start: Arc<RunStart>,
    stop: Option<Arc<RunStop>>,
    sources: Arc<Sources>,
    descriptors: Arc<OnceLock<Vec<Arc<EventDescriptor>>>>,
}

impl Header {
    pub fn new(pair: RunPair, sources: Arc<Sources>) -> Self {
        let (start, stop) = pair;
        Header {
            start,
            stop,
            sources,
            descriptors: Arc::new(OnceLock::new()),
        }
    }

    pub fn start(&self) -> &RunStart {
        &self.start
    }

    pub fn stop(&self) -> Option<&RunStop> {
        self.stop.as_deref()
    }

    pub fn uid(&self) -> &str {
        &self.start.uid
    }

    pub fn scan_id(&self) -> Option<i64> {
        self.start.scan_id
    }

    /// True while the run has no stop document
    pub fn is_open(&self) -> bool {
        self.stop.is_none()
    }

    /// Descriptors from every event source, in registration then arrival order.
    ///
    /// Fetched on first use and cached for the life of the header.
    pub fn descriptors(&self) -> Result<&[Arc<EventDescriptor>]> {
        if let Some(cached) = self.descriptors.get() {
            return Ok(cached);
        }
        let mut fetched = Vec::new();
        for source in self.sources.event_sources() {
            fetched.extend(source.descriptors_given_header(self.uid())?);
        }
        Ok(self.descriptors.get_or_init(move || fetched))
    }

    /// Distinct stream names in first-seen order
    pub fn stream_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for descriptor in self.descriptors()? {
            if !names.contains(&descriptor.name) {
                names.push(descriptor.name.clone());
            }
        }
        Ok(names)
    }

    /// Union of data keys across the descriptors of `stream`
    pub fn fields(&self, stream: &StreamName) -> Result<BTreeSet<String>> {
        Ok(self
            .descriptors()?
            .iter()
            .filter(|d| stream.matches(&d.name))
            .flat_map(|d| d.data_keys.keys().cloned())
            .collect())
    }

    /// Fields stored outside the documents, across all streams
    pub fn external_fields(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .descriptors()?
            .iter()
            .flat_map(|d| d.external_keys().map(str::to_string))
            .collect())
    }

    /// `{"start": .., "stop": .., "descriptors": [..]}`
    pub fn to_json(&self) -> Result<Value> {
        let descriptors = self
            .descriptors()?
            .iter()
            .map(|d| serde_json::to_value(&**d))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(json!({
            "start": serde_json::to_value(&*self.start)?,
            "stop": serde_json::to_value(self.stop.as_deref())?,
            "descriptors": descriptors,
        }))
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.start.uid == other.start.uid
    }
}

impl Eq for Header {}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Header")
            .field("uid", &self.start.uid)
            .field("scan_id", &self.start.scan_id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Anything naming one or several runs
pub trait IntoHeaders {
    fn into_headers(self) -> Result<Vec<Header>>;
}

impl IntoHeaders for Header {
    fn into_headers(self) -> Result<Vec<Header>> {
        Ok(vec![self])
    }
}

impl IntoHeaders for &Header {
    fn into_headers(self) -> Result<Vec<Header>> {
        Ok(vec![self.clone()])
    }
}

impl IntoHeaders for Vec<Header> {
    fn into_headers(self) -> Result<Vec<Header>> {
        Ok(self)
    }
}

impl IntoHeaders for &[Header] {
    fn into_headers(self) -> Result<Vec<Header>> {
        Ok(self.to_vec())
    }
}

impl IntoHeaders for &Vec<Header> {
    fn into_headers(self) -> Result<Vec<Header>> {
        Ok(self.clone())
    }
}
