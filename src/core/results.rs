use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use crate::core::error::Result;
use crate::core::header::{Header, IntoHeaders};
use crate::storage::source::{RunPair, Sources};

type PairQuery = Box<dyn Fn() -> Result<Vec<RunPair>> + Send + Sync>;

/// Lazy, restartable view over the runs matched by a search.
///
/// The underlying query runs on the first pass and is cached; every
/// `iter()` starts a fresh pass producing `Header`s.
pub struct ResultsView {
    query: PairQuery,
    pairs: OnceLock<Vec<RunPair>>,
    sources: Arc<Sources>,
    data_key: Option<String>,
}

impl ResultsView {
    pub fn new<F>(sources: Arc<Sources>, query: F, data_key: Option<String>) -> Self
    where
        F: Fn() -> Result<Vec<RunPair>> + Send + Sync + 'static,
    {
        ResultsView {
            query: Box::new(query),
            pairs: OnceLock::new(),
            sources,
            data_key,
        }
    }

    /// Only runs with a descriptor containing this field are produced
    pub fn data_key(&self) -> Option<&str> {
        self.data_key.as_deref()
    }

    fn pairs(&self) -> Result<&[RunPair]> {
        if let Some(cached) = self.pairs.get() {
            return Ok(cached);
        }
        let fetched = (self.query)()?;
        debug!(runs = fetched.len(), "search results loaded");
        Ok(self.pairs.get_or_init(move || fetched))
    }

    pub fn iter(&self) -> ResultsIter<'_> {
        ResultsIter {
            view: self,
            index: 0,
            done: false,
        }
    }

    /// Number of matched runs before the `data_key` filter
    pub fn len_hint(&self) -> Result<usize> {
        Ok(self.pairs()?.len())
    }

    pub fn collect_headers(&self) -> Result<Vec<Header>> {
        self.iter().collect()
    }

    fn accepts(&self, header: &Header) -> Result<bool> {
        let Some(field) = &self.data_key else {
            return Ok(true);
        };
        Ok(header
            .descriptors()?
            .iter()
            .any(|d| d.data_keys.contains_key(field)))
    }
}

impl fmt::Debug for ResultsView {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResultsView")
            .field("loaded", &self.pairs.get().map(Vec::len))
            .field("data_key", &self.data_key)
            .finish()
    }
}

pub struct ResultsIter<'a> {
    view: &'a ResultsView,
    index: usize,
    done: bool,
}

impl Iterator for ResultsIter<'_> {
    type Item = Result<Header>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let pairs = match self.view.pairs() {
            Ok(pairs) => pairs,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        while let Some(pair) = pairs.get(self.index) {
            self.index += 1;
            let header = Header::new(pair.clone(), Arc::clone(&self.view.sources));
            match self.view.accepts(&header) {
                Ok(true) => return Some(Ok(header)),
                Ok(false) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        None
    }
}

impl<'a> IntoIterator for &'a ResultsView {
    type Item = Result<Header>;
    type IntoIter = ResultsIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoHeaders for &ResultsView {
    fn into_headers(self) -> Result<Vec<Header>> {
        self.collect_headers()
    }
}

impl IntoHeaders for ResultsView {
    fn into_headers(self) -> Result<Vec<Header>> {
        self.collect_headers()
    }
}
