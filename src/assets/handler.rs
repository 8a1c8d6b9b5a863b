use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde_json::{Map, Value};
use crate::core::error::Result;

/// Reads payloads out of one resource.
///
/// A handler is built once per resource from its full path and
/// `resource_kwargs`, then asked for individual datums.
pub trait Handler: Send + Sync {
    /// Payload addressed by one datum's `datum_kwargs`
    fn retrieve(&self, datum_kwargs: &Map<String, Value>) -> Result<Value>;

    /// Files backing the given datums
    fn get_file_list(&self, datum_kwargs: &[Map<String, Value>]) -> Result<Vec<PathBuf>>;
}

/// Builds a handler for a resource: `(full_path, resource_kwargs)`
pub type HandlerFactory =
    Arc<dyn Fn(&Path, &Map<String, Value>) -> Result<Box<dyn Handler>> + Send + Sync>;

/// Temporary spec -> factory overrides for one call
pub type HandlerOverrides = HashMap<String, HandlerFactory>;

/// Wrap a plain constructor function as a factory
pub fn factory<F, H>(build: F) -> HandlerFactory
where
    F: Fn(&Path, &Map<String, Value>) -> Result<H> + Send + Sync + 'static,
    H: Handler + 'static,
{
    Arc::new(move |path: &Path, kwargs: &Map<String, Value>| -> Result<Box<dyn Handler>> {
        Ok(Box::new(build(path, kwargs)?))
    })
}
