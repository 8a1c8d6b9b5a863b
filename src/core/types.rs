use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use crate::core::error::{Error, ErrorKind, Result};

/// Field added by the prepare hook to mark a wrapped document.
pub const BOOKKEEPING_FIELD: &str = "_name";

/// Length of a canonical hyphenated uid.
pub const UID_LENGTH: usize = 36;

pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

fn default_stream_name() -> String {
    "primary".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    pub uid: String,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunStart {
    pub fn new(scan_id: i64, time: f64) -> Self {
        RunStart {
            uid: new_uid(),
            time,
            scan_id: Some(scan_id),
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    pub uid: String,
    pub run_start: String,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunStop {
    pub fn new(start: &RunStart, time: f64) -> Self {
        RunStop {
            uid: new_uid(),
            run_start: start.uid.clone(),
            time,
            exit_status: Some("success".to_string()),
            extra: Map::new(),
        }
    }
}

/// Schema entry for one field of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataKey {
    pub fn scalar(dtype: &str) -> Self {
        DataKey {
            dtype: dtype.to_string(),
            source: None,
            shape: None,
            external: None,
            extra: Map::new(),
        }
    }

    pub fn external(dtype: &str, spec: &str) -> Self {
        DataKey {
            external: Some(spec.to_string()),
            ..DataKey::scalar(dtype)
        }
    }

    /// A data key is external when its `external` marker is non-empty.
    pub fn is_external(&self) -> bool {
        self.external.as_deref().is_some_and(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub uid: String,
    pub run_start: String,
    #[serde(default = "default_stream_name")]
    pub name: String,
    pub time: f64,
    pub data_keys: BTreeMap<String, DataKey>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventDescriptor {
    pub fn new(start: &RunStart, name: &str, time: f64) -> Self {
        EventDescriptor {
            uid: new_uid(),
            run_start: start.uid.clone(),
            name: name.to_string(),
            time,
            data_keys: BTreeMap::new(),
            configuration: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_key(mut self, field: &str, key: DataKey) -> Self {
        self.data_keys.insert(field.to_string(), key);
        self
    }

    pub fn external_keys(&self) -> impl Iterator<Item = &str> {
        self.data_keys
            .iter()
            .filter(|(_, key)| key.is_external())
            .map(|(name, _)| name.as_str())
    }
}

/// Fill state of one event field: a flag, or the datum id it was filled from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filled {
    Flag(bool),
    Datum(String),
}

impl Filled {
    pub fn is_filled(&self) -> bool {
        match self {
            Filled::Flag(flag) => *flag,
            Filled::Datum(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uid: String,
    pub descriptor: String,
    pub seq_num: u64,
    pub time: f64,
    pub data: BTreeMap<String, Value>,
    pub timestamps: BTreeMap<String, f64>,
    #[serde(default)]
    pub filled: BTreeMap<String, Filled>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn new(descriptor: &EventDescriptor, seq_num: u64, time: f64) -> Self {
        Event {
            uid: new_uid(),
            descriptor: descriptor.uid.clone(),
            seq_num,
            time,
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            filled: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_value(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.timestamps.insert(field.to_string(), self.time);
        self.data.insert(field.to_string(), value.into());
        self
    }
}

/// One external storage location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uid: String,
    pub spec: String,
    pub resource_path: String,
    #[serde(default)]
    pub resource_kwargs: Map<String, Value>,
    #[serde(default)]
    pub root: String,
}

/// One resolvable unit inside a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub datum_id: String,
    pub resource: String,
    #[serde(default)]
    pub datum_kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Start,
    Descriptor,
    Event,
    Stop,
    Resource,
    Datum,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::Stop => "stop",
            DocumentKind::Resource => "resource",
            DocumentKind::Datum => "datum",
        }
    }

    /// Human-readable name carried by wrapped documents
    pub fn display_name(&self) -> &'static str {
        match self {
            DocumentKind::Start => "Run Start",
            DocumentKind::Descriptor => "Event Descriptor",
            DocumentKind::Event => "Event",
            DocumentKind::Stop => "Run Stop",
            DocumentKind::Resource => "Resource",
            DocumentKind::Datum => "Datum",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(DocumentKind::Start),
            "descriptor" => Ok(DocumentKind::Descriptor),
            "event" => Ok(DocumentKind::Event),
            "stop" => Ok(DocumentKind::Stop),
            "resource" => Ok(DocumentKind::Resource),
            "datum" => Ok(DocumentKind::Datum),
            other => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("Unknown document kind '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "doc", rename_all = "lowercase")]
pub enum Document {
    Start(RunStart),
    Descriptor(EventDescriptor),
    Event(Event),
    Stop(RunStop),
    Resource(Resource),
    Datum(Datum),
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::Event(_) => DocumentKind::Event,
            Document::Stop(_) => DocumentKind::Stop,
            Document::Resource(_) => DocumentKind::Resource,
            Document::Datum(_) => DocumentKind::Datum,
        }
    }

    pub fn from_value(kind: DocumentKind, value: Value) -> Result<Self> {
        Ok(match kind {
            DocumentKind::Start => Document::Start(serde_json::from_value(value)?),
            DocumentKind::Descriptor => Document::Descriptor(serde_json::from_value(value)?),
            DocumentKind::Event => Document::Event(serde_json::from_value(value)?),
            DocumentKind::Stop => Document::Stop(serde_json::from_value(value)?),
            DocumentKind::Resource => Document::Resource(serde_json::from_value(value)?),
            DocumentKind::Datum => Document::Datum(serde_json::from_value(value)?),
        })
    }

    /// The document body as a plain JSON object
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Document::Start(doc) => serde_json::to_value(doc)?,
            Document::Descriptor(doc) => serde_json::to_value(doc)?,
            Document::Event(doc) => serde_json::to_value(doc)?,
            Document::Stop(doc) => serde_json::to_value(doc)?,
            Document::Resource(doc) => serde_json::to_value(doc)?,
            Document::Datum(doc) => serde_json::to_value(doc)?,
        })
    }

    fn extra_mut(&mut self) -> Option<&mut Map<String, Value>> {
        match self {
            Document::Start(doc) => Some(&mut doc.extra),
            Document::Descriptor(doc) => Some(&mut doc.extra),
            Document::Event(doc) => Some(&mut doc.extra),
            Document::Stop(doc) => Some(&mut doc.extra),
            Document::Resource(_) | Document::Datum(_) => None,
        }
    }

    fn extra(&self) -> Option<&Map<String, Value>> {
        match self {
            Document::Start(doc) => Some(&doc.extra),
            Document::Descriptor(doc) => Some(&doc.extra),
            Document::Event(doc) => Some(&doc.extra),
            Document::Stop(doc) => Some(&doc.extra),
            Document::Resource(_) | Document::Datum(_) => None,
        }
    }

    pub fn is_wrapped(&self) -> bool {
        self.extra().is_some_and(|extra| extra.contains_key(BOOKKEEPING_FIELD))
    }

    /// Strip wrapper bookkeeping, leaving the plain document
    pub fn sanitize(mut self) -> Self {
        if let Some(extra) = self.extra_mut() {
            extra.remove(BOOKKEEPING_FIELD);
        }
        self
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            Document::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// Transformation applied to every document the broker hands out
pub type PrepareHook = fn(DocumentKind, Document) -> Document;

/// Default hook: tag the document with its human-readable kind name.
pub fn wrap_document(kind: DocumentKind, mut doc: Document) -> Document {
    if let Some(extra) = doc.extra_mut() {
        extra.insert(
            BOOKKEEPING_FIELD.to_string(),
            Value::String(kind.display_name().to_string()),
        );
    }
    doc
}

pub fn plain_document(_kind: DocumentKind, doc: Document) -> Document {
    doc
}
