use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, info};
use crate::assets::handler::{Handler, HandlerFactory, HandlerOverrides};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{new_uid, Datum, Resource};

const DEFAULT_HANDLER_CACHE_SIZE: usize = 64;

#[derive(Default)]
struct AssetState {
    resources: HashMap<String, Arc<Resource>>,
    datums: HashMap<String, Arc<Datum>>,
    datums_by_resource: HashMap<String, Vec<String>>,
}

struct HandlerTable {
    factories: HashMap<String, HandlerFactory>,
    /// Override layers of live scopes, innermost last
    layers: Vec<(u64, HandlerOverrides)>,
    next_scope: u64,
    /// Built handlers keyed by resource uid
    cache: LruCache<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    /// Newest live override for `spec`, else the registered factory
    fn resolve(&self, spec: &str) -> Option<&HandlerFactory> {
        self.layers
            .iter()
            .rev()
            .find_map(|(_, layer)| layer.get(spec))
            .or_else(|| self.factories.get(spec))
    }
}

/// Options for `Registry::copy_files`
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Compare CRC32 checksums of source and destination after copying
    pub verify: bool,
}

/// In-memory asset registry: resources, datums and the handlers that read them.
pub struct Registry {
    state: RwLock<AssetState>,
    handlers: Mutex<HandlerTable>,
    root: Option<PathBuf>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(None, DEFAULT_HANDLER_CACHE_SIZE)
    }
}

impl Registry {
    pub fn new(root: Option<PathBuf>, handler_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(handler_cache_size).unwrap_or(NonZeroUsize::MIN);
        Registry {
            state: RwLock::new(AssetState::default()),
            handlers: Mutex::new(HandlerTable {
                factories: HashMap::new(),
                layers: Vec::new(),
                next_scope: 0,
                cache: LruCache::new(capacity),
            }),
            root,
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Register a resource document as-is
    pub fn add_resource(&self, resource: Resource) -> Result<Arc<Resource>> {
        let mut state = self.state.write();
        if state.resources.contains_key(&resource.uid) {
            return Err(Error::invalid_argument(format!(
                "Resource {} already exists",
                resource.uid
            )));
        }
        let resource = Arc::new(resource);
        state.resources.insert(resource.uid.clone(), Arc::clone(&resource));
        state.datums_by_resource.entry(resource.uid.clone()).or_default();
        Ok(resource)
    }

    /// Create and register a resource with a fresh uid
    pub fn insert_resource(
        &self,
        spec: &str,
        resource_path: &str,
        resource_kwargs: Map<String, Value>,
        root: Option<&str>,
    ) -> Result<Arc<Resource>> {
        self.add_resource(Resource {
            uid: new_uid(),
            spec: spec.to_string(),
            resource_path: resource_path.to_string(),
            resource_kwargs,
            root: root.unwrap_or_default().to_string(),
        })
    }

    /// Register a datum document as-is; its resource must already exist.
    pub fn add_datum(&self, datum: Datum) -> Result<Arc<Datum>> {
        let mut state = self.state.write();
        if !state.resources.contains_key(&datum.resource) {
            return Err(Error::not_found(format!(
                "Datum {} refers to unknown resource {}",
                datum.datum_id, datum.resource
            )));
        }
        if state.datums.contains_key(&datum.datum_id) {
            return Err(Error::invalid_argument(format!(
                "Datum {} already exists",
                datum.datum_id
            )));
        }
        let datum = Arc::new(datum);
        state
            .datums_by_resource
            .entry(datum.resource.clone())
            .or_default()
            .push(datum.datum_id.clone());
        state.datums.insert(datum.datum_id.clone(), Arc::clone(&datum));
        Ok(datum)
    }

    pub fn insert_datum(
        &self,
        resource_uid: &str,
        datum_id: &str,
        datum_kwargs: Map<String, Value>,
    ) -> Result<Arc<Datum>> {
        self.add_datum(Datum {
            datum_id: datum_id.to_string(),
            resource: resource_uid.to_string(),
            datum_kwargs,
        })
    }

    pub fn resource_given_uid(&self, uid: &str) -> Result<Arc<Resource>> {
        self.state
            .read()
            .resources
            .get(uid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No resource with uid {}", uid)))
    }

    fn datum(&self, datum_id: &str) -> Result<Arc<Datum>> {
        self.state
            .read()
            .datums
            .get(datum_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No datum with id {}", datum_id)))
    }

    pub fn resource_given_datum_id(&self, datum_id: &str) -> Result<Arc<Resource>> {
        let datum = self.datum(datum_id)?;
        self.resource_given_uid(&datum.resource)
    }

    /// Datums of one resource in insertion order
    pub fn datum_gen_given_resource(&self, resource_uid: &str) -> Result<Vec<Arc<Datum>>> {
        let state = self.state.read();
        let ids = state
            .datums_by_resource
            .get(resource_uid)
            .ok_or_else(|| Error::not_found(format!("No resource with uid {}", resource_uid)))?;
        Ok(ids
            .iter()
            .filter_map(|id| state.datums.get(id).cloned())
            .collect())
    }

    /// Full on-disk path of a resource
    pub fn resource_path(&self, resource: &Resource) -> PathBuf {
        if !resource.root.is_empty() {
            Path::new(&resource.root).join(&resource.resource_path)
        } else if let Some(root) = &self.root {
            root.join(&resource.resource_path)
        } else {
            PathBuf::from(&resource.resource_path)
        }
    }

    pub fn register_handler(&self, spec: &str, factory: HandlerFactory, overwrite: bool) -> Result<()> {
        let mut table = self.handlers.lock();
        if !overwrite && table.factories.contains_key(spec) {
            return Err(Error::invalid_argument(format!(
                "A handler for spec {} is already registered",
                spec
            )));
        }
        table.factories.insert(spec.to_string(), factory);
        table.cache.clear();
        Ok(())
    }

    pub fn deregister_handler(&self, spec: &str) -> Option<HandlerFactory> {
        let mut table = self.handlers.lock();
        table.cache.clear();
        table.factories.remove(spec)
    }

    /// Specs with a handler, counting live overrides
    pub fn registered_specs(&self) -> Vec<String> {
        let table = self.handlers.lock();
        let mut specs: Vec<String> = table
            .factories
            .keys()
            .chain(table.layers.iter().flat_map(|(_, layer)| layer.keys()))
            .cloned()
            .collect();
        specs.sort();
        specs.dedup();
        specs
    }

    fn handler_for(&self, resource: &Resource) -> Result<Arc<dyn Handler>> {
        let factory = {
            let mut table = self.handlers.lock();
            if let Some(handler) = table.cache.get(&resource.uid) {
                return Ok(Arc::clone(handler));
            }
            table.resolve(&resource.spec).cloned().ok_or_else(|| {
                Error::new(
                    ErrorKind::HandlerNotFound,
                    format!("No handler registered for spec {}", resource.spec),
                )
            })?
        };

        let path = self.resource_path(resource);
        debug!(spec = %resource.spec, path = %path.display(), "building handler");
        let handler: Arc<dyn Handler> = Arc::from(factory(&path, &resource.resource_kwargs)?);
        self.handlers
            .lock()
            .cache
            .put(resource.uid.clone(), Arc::clone(&handler));
        Ok(handler)
    }

    /// Payload addressed by `datum_id`
    pub fn retrieve(&self, datum_id: &str) -> Result<Value> {
        let datum = self.datum(datum_id)?;
        let resource = self.resource_given_uid(&datum.resource)?;
        let handler = self.handler_for(&resource)?;
        handler.retrieve(&datum.datum_kwargs)
    }

    /// Files backing every datum of a resource
    pub fn get_file_list(&self, resource_uid: &str) -> Result<Vec<PathBuf>> {
        let resource = self.resource_given_uid(resource_uid)?;
        let kwargs: Vec<Map<String, Value>> = self
            .datum_gen_given_resource(resource_uid)?
            .iter()
            .map(|datum| datum.datum_kwargs.clone())
            .collect();
        self.handler_for(&resource)?.get_file_list(&kwargs)
    }

    /// Copy a resource's files under `new_root`, keeping paths relative to its root.
    ///
    /// Returns `(old, new)` path pairs.
    pub fn copy_files(
        &self,
        resource_uid: &str,
        new_root: &Path,
        options: &CopyOptions,
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        let resource = self.resource_given_uid(resource_uid)?;
        let root = if !resource.root.is_empty() {
            PathBuf::from(&resource.root)
        } else {
            self.root.clone().ok_or_else(|| {
                Error::invalid_argument(format!(
                    "Cannot move files of resource {} which has an empty root",
                    resource.uid
                ))
            })?
        };

        let mut moved = Vec::new();
        for old in self.get_file_list(resource_uid)? {
            let relative = old.strip_prefix(&root).map_err(|_| {
                Error::invalid_argument(format!(
                    "File {} is not under resource root {}",
                    old.display(),
                    root.display()
                ))
            })?;
            let new = new_root.join(relative);
            if let Some(parent) = new.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&old, &new)?;
            if options.verify && checksum(&old)? != checksum(&new)? {
                return Err(Error::new(
                    ErrorKind::Io,
                    format!("Checksum mismatch copying {} to {}", old.display(), new.display()),
                ));
            }
            debug!(from = %old.display(), to = %new.display(), "copied file");
            moved.push((old, new));
        }
        Ok(moved)
    }

    /// Install `overrides` until the returned scope is dropped.
    ///
    /// Scopes may be dropped in any order; each removes only its own layer.
    pub fn handler_context(self: &Arc<Self>, overrides: HandlerOverrides) -> HandlerScope {
        if overrides.is_empty() {
            return HandlerScope {
                registry: Arc::clone(self),
                id: None,
            };
        }
        let mut table = self.handlers.lock();
        let id = table.next_scope;
        table.next_scope += 1;
        info!(scope = id, specs = overrides.len(), "entering handler override scope");
        table.layers.push((id, overrides));
        table.cache.clear();
        HandlerScope {
            registry: Arc::clone(self),
            id: Some(id),
        }
    }
}

fn checksum(path: &Path) -> Result<u32> {
    Ok(crc32fast::hash(&fs::read(path)?))
}

/// Removes its override layer from the handler registry when dropped
pub struct HandlerScope {
    registry: Arc<Registry>,
    id: Option<u64>,
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let mut table = self.registry.handlers.lock();
        table.layers.retain(|(scope, _)| *scope != id);
        table.cache.clear();
        debug!(scope = id, "left handler override scope");
    }
}
