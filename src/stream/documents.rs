use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use crate::assets::handler::{HandlerFactory, HandlerOverrides};
use crate::assets::registry::{HandlerScope, Registry};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::header::Header;
use crate::core::types::{Document, DocumentKind, Event, PrepareHook};
use crate::fill::pipeline::{FillMode, FillPipeline, FillSelector, FillStats};
use crate::storage::source::{DocIter, EventSource};
use crate::stream::StreamName;

/// What to read from a set of runs, shared by the document, event and table calls
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// `None` uses the calling operation's default stream
    pub stream: Option<StreamName>,
    /// Whitelist of field names; `None` returns every field
    pub fields: Option<Vec<String>>,
    pub fill: FillSelector,
    /// Handlers installed for the duration of the call
    pub handler_overrides: HandlerOverrides,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream: impl Into<StreamName>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn all_streams(mut self) -> Self {
        self.stream = Some(StreamName::All);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn fill(mut self, fill: impl Into<FillSelector>) -> Self {
        self.fill = fill.into();
        self
    }

    pub fn handler(mut self, spec: &str, factory: HandlerFactory) -> Self {
        self.handler_overrides.insert(spec.to_string(), factory);
        self
    }

    pub(crate) fn stream_or(&self, default: StreamName) -> StreamName {
        self.stream.clone().unwrap_or(default)
    }
}

/// Fail with `FieldNotFound` unless every field is a data key of some descriptor of `headers`
pub fn check_fields_exist(fields: &[String], headers: &[Header]) -> Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let mut known = BTreeSet::new();
    for header in headers {
        known.extend(header.fields(&StreamName::All)?);
    }
    let missing: Vec<&str> = fields
        .iter()
        .filter(|f| !known.contains(*f))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::FieldNotFound,
            format!("Fields {:?} are not in any descriptor of the given runs", missing),
        ))
    }
}

/// Lazy `(kind, document)` sequence over several runs and event sources.
///
/// Runs are visited in order; within a run every event source is drained
/// in registration order. Events are filled on the way out and every
/// document passes through the prepare hook. Handler overrides stay
/// installed until the stream is dropped. After an error the stream ends.
pub struct DocumentStream {
    headers: Vec<Header>,
    sources: Vec<Arc<dyn EventSource>>,
    stream: StreamName,
    fields: Option<Vec<String>>,
    selector: FillSelector,
    registry: Arc<Registry>,
    hook: PrepareHook,
    header_index: usize,
    source_index: usize,
    current: Option<DocIter>,
    pipeline: Option<FillPipeline>,
    stats: FillStats,
    done: bool,
    _scope: HandlerScope,
}

impl DocumentStream {
    pub fn new(
        headers: Vec<Header>,
        sources: Vec<Arc<dyn EventSource>>,
        stream: StreamName,
        options: StreamOptions,
        registry: Arc<Registry>,
        hook: PrepareHook,
    ) -> Result<Self> {
        if let Some(fields) = &options.fields {
            check_fields_exist(fields, &headers)?;
        }
        let scope = registry.handler_context(options.handler_overrides);
        info!(
            runs = headers.len(),
            sources = sources.len(),
            stream = %stream,
            "streaming documents"
        );
        Ok(DocumentStream {
            headers,
            sources,
            stream,
            fields: options.fields,
            selector: options.fill,
            registry,
            hook,
            header_index: 0,
            source_index: 0,
            current: None,
            pipeline: None,
            stats: FillStats::default(),
            done: false,
            _scope: scope,
        })
    }

    /// Only the events, filled and prepared
    pub fn events(self) -> Events {
        Events { inner: self }
    }

    /// Fill counters accumulated so far
    pub fn fill_stats(&self) -> FillStats {
        match &self.pipeline {
            Some(pipeline) => self.stats.merge(pipeline.stats()),
            None => self.stats,
        }
    }

    fn close_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.stats = self.stats.merge(pipeline.close());
        }
    }

    /// Move to the next (run, source) pair; false once everything is consumed.
    fn advance(&mut self) -> Result<bool> {
        loop {
            let Some(header) = self.headers.get(self.header_index) else {
                self.close_pipeline();
                return Ok(false);
            };
            if self.source_index == 0 && self.pipeline.is_none() {
                let descriptors = header.descriptors()?;
                self.pipeline = Some(FillPipeline::new(
                    Arc::clone(&self.registry),
                    descriptors.iter().map(Arc::as_ref),
                    self.selector.clone(),
                    FillMode::InPlace,
                    self.hook,
                ));
            }
            if let Some(source) = self.sources.get(self.source_index) {
                self.current = Some(source.docs_given_header(header, &self.stream, self.fields.as_deref())?);
                self.source_index += 1;
                return Ok(true);
            }
            debug!(run = %header.uid(), "run exhausted");
            self.close_pipeline();
            self.header_index += 1;
            self.source_index = 0;
        }
    }

    fn prepare(&mut self, doc: Document) -> Result<(DocumentKind, Document)> {
        let doc = match doc {
            Document::Event(event) => {
                let pipeline = self.pipeline.as_mut().ok_or_else(|| {
                    Error::new(ErrorKind::Internal, "Event emitted outside of a run".to_string())
                })?;
                Document::Event(pipeline.push(event)?)
            }
            other => other,
        };
        let kind = doc.kind();
        Ok((kind, (self.hook)(kind, doc)))
    }

    fn next_document(&mut self) -> Result<Option<(DocumentKind, Document)>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Some(doc) => return self.prepare(doc?).map(Some),
                    None => self.current = None,
                }
            }
            if !self.advance()? {
                return Ok(None);
            }
        }
    }
}

impl Iterator for DocumentStream {
    type Item = Result<(DocumentKind, Document)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_document() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Event documents of a `DocumentStream`
pub struct Events {
    inner: DocumentStream,
}

impl Events {
    pub fn fill_stats(&self) -> FillStats {
        self.inner.fill_stats()
    }
}

impl Iterator for Events {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((DocumentKind::Event, doc)) => {
                    if let Some(event) = doc.into_event() {
                        return Some(Ok(event));
                    }
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
