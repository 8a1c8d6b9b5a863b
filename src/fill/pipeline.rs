use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use serde_json::Value;
use tracing::{debug, trace};
use crate::assets::registry::Registry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, DocumentKind, Event, EventDescriptor, Filled, PrepareHook};
use crate::stream::table::Table;

/// Which external fields to fill
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FillSelector {
    /// Every external field
    All,
    /// Nothing; events pass through untouched
    #[default]
    Nothing,
    /// External fields with these names; other names are ignored
    Fields(BTreeSet<String>),
}

impl FillSelector {
    pub fn is_nothing(&self) -> bool {
        match self {
            FillSelector::Nothing => true,
            FillSelector::Fields(fields) => fields.is_empty(),
            FillSelector::All => false,
        }
    }

    /// External keys of `descriptor` this selector asks for
    pub fn keys_for(&self, descriptor: &EventDescriptor) -> BTreeSet<String> {
        descriptor
            .external_keys()
            .filter(|key| match self {
                FillSelector::All => true,
                FillSelector::Nothing => false,
                FillSelector::Fields(fields) => fields.contains(*key),
            })
            .map(str::to_string)
            .collect()
    }
}

impl From<bool> for FillSelector {
    fn from(fill: bool) -> Self {
        if fill {
            FillSelector::All
        } else {
            FillSelector::Nothing
        }
    }
}

impl From<&[&str]> for FillSelector {
    fn from(fields: &[&str]) -> Self {
        FillSelector::Fields(fields.iter().map(|f| f.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for FillSelector {
    fn from(fields: [&str; N]) -> Self {
        FillSelector::Fields(fields.iter().map(|f| f.to_string()).collect())
    }
}

impl From<Vec<String>> for FillSelector {
    fn from(fields: Vec<String>) -> Self {
        FillSelector::Fields(fields.into_iter().collect())
    }
}

/// How events handed to the pipeline are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Fill the given event itself
    #[default]
    InPlace,
    /// Sanitize, re-wrap with the prepare hook, then fill the copy
    Copy,
}

/// Counters reported by `FillPipeline::close`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillStats {
    pub events: usize,
    pub fields_filled: usize,
    pub fields_skipped: usize,
}

impl FillStats {
    pub fn merge(self, other: FillStats) -> FillStats {
        FillStats {
            events: self.events + other.events,
            fields_filled: self.fields_filled + other.fields_filled,
            fields_skipped: self.fields_skipped + other.fields_skipped,
        }
    }
}

/// Rewrites external-reference fields of events into their payloads.
///
/// Built once from the descriptors of the events it will see; every
/// event is then pushed through `push` and the pipeline is `close`d.
pub struct FillPipeline {
    registry: Arc<Registry>,
    /// descriptor uid -> fields to fill
    fill_map: HashMap<String, BTreeSet<String>>,
    selector: FillSelector,
    mode: FillMode,
    hook: PrepareHook,
    stats: FillStats,
}

impl FillPipeline {
    pub fn new<'a>(
        registry: Arc<Registry>,
        descriptors: impl IntoIterator<Item = &'a EventDescriptor>,
        selector: FillSelector,
        mode: FillMode,
        hook: PrepareHook,
    ) -> Self {
        let fill_map: HashMap<String, BTreeSet<String>> = descriptors
            .into_iter()
            .map(|d| (d.uid.clone(), selector.keys_for(d)))
            .collect();
        debug!(descriptors = fill_map.len(), ?selector, "fill pipeline ready");
        FillPipeline {
            registry,
            fill_map,
            selector,
            mode,
            hook,
            stats: FillStats::default(),
        }
    }

    pub fn mode(&self) -> FillMode {
        self.mode
    }

    pub fn stats(&self) -> FillStats {
        self.stats
    }

    /// Transform one event according to the pipeline's mode
    pub fn push(&mut self, event: Event) -> Result<Event> {
        match self.mode {
            FillMode::InPlace => {
                let mut event = event;
                self.fill_in_place(&mut event)?;
                Ok(event)
            }
            FillMode::Copy => self.fill_copy(&event),
        }
    }

    /// Fill a fresh, re-wrapped copy; `event` is left untouched
    pub fn fill_copy(&mut self, event: &Event) -> Result<Event> {
        let plain = Document::Event(event.clone()).sanitize();
        let mut copy = (self.hook)(DocumentKind::Event, plain)
            .into_event()
            .ok_or_else(|| {
                Error::new(ErrorKind::Internal, "Prepare hook changed the document kind".to_string())
            })?;
        self.fill_in_place(&mut copy)?;
        Ok(copy)
    }

    pub fn fill_in_place(&mut self, event: &mut Event) -> Result<()> {
        self.stats.events += 1;
        if self.selector.is_nothing() {
            return Ok(());
        }
        let keys = self.fill_map.get(&event.descriptor).ok_or_else(|| {
            Error::new(
                ErrorKind::NoEventDescriptors,
                format!(
                    "Event {} belongs to descriptor {} which was not given to the fill pipeline",
                    event.uid, event.descriptor
                ),
            )
        })?;

        for key in keys {
            let Some(current) = event.data.get_mut(key) else {
                continue;
            };
            if event.filled.get(key).is_some_and(Filled::is_filled) {
                self.stats.fields_skipped += 1;
                continue;
            }
            let datum_id = datum_id_of(current, key)?;
            trace!(field = %key, datum = %datum_id, "filling");
            *current = self.registry.retrieve(&datum_id)?;
            event.filled.insert(key.clone(), Filled::Datum(datum_id));
            self.stats.fields_filled += 1;
        }
        Ok(())
    }

    pub fn close(self) -> FillStats {
        debug!(
            events = self.stats.events,
            filled = self.stats.fields_filled,
            "fill pipeline closed"
        );
        self.stats
    }
}

/// Lazily pushes every event of `events` through a pipeline
pub struct FilledEvents<I> {
    events: I,
    pipeline: FillPipeline,
}

impl<I> FilledEvents<I> {
    pub fn new(events: I, pipeline: FillPipeline) -> Self {
        FilledEvents { events, pipeline }
    }

    pub fn close(self) -> FillStats {
        self.pipeline.close()
    }
}

impl<I: Iterator<Item = Event>> Iterator for FilledEvents<I> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.next()?;
        Some(self.pipeline.push(event))
    }
}

fn datum_id_of(value: &Value, field: &str) -> Result<String> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        Error::invalid_argument(format!(
            "Field {} should hold a datum id before filling, found {}",
            field, value
        ))
    })
}

/// Replace whole columns of datum ids with their payloads.
///
/// Null cells are left alone. Returns the number of columns filled.
pub fn fill_table(
    registry: &Registry,
    table: &mut Table,
    descriptor: &EventDescriptor,
    selector: &FillSelector,
) -> Result<usize> {
    let mut filled = 0;
    for key in selector.keys_for(descriptor) {
        let Some(column) = table.column_mut(&key) else {
            continue;
        };
        for cell in column.values.iter_mut() {
            if cell.is_null() {
                continue;
            }
            let datum_id = datum_id_of(cell, &key)?;
            *cell = registry.retrieve(&datum_id)?;
        }
        filled += 1;
    }
    debug!(columns = filled, descriptor = %descriptor.uid, "filled table");
    Ok(filled)
}
