use std::sync::Arc;
use serde_json::{json, Value};
use tracing::{debug, info};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{RunStart, UID_LENGTH};
use crate::query::Query;
use crate::storage::source::{HeaderSource, RunPair};

/// Shape of a key accepted by `Broker::get`
#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    /// `n > -1` is a scan id, `n <= -1` the n-th most recent run
    Int(i64),
    /// Slice into past runs, e.g. `-5:` or `-5:-2:1`
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    /// Full uid or uid prefix
    Uid(String),
    /// Set or sequence of keys, resolved one by one
    Many(Vec<SearchKey>),
}

impl SearchKey {
    pub fn slice(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        SearchKey::Slice { start, stop, step }
    }

    /// Keys that always produce a list, even with a single match
    pub fn is_multi(&self) -> bool {
        matches!(self, SearchKey::Slice { .. } | SearchKey::Many(_))
    }

    /// Interpret a JSON value as a key: integers, strings and arrays of keys.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(SearchKey::Int).ok_or_else(|| unsupported(value)),
            Value::String(s) => Ok(SearchKey::Uid(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(SearchKey::from_value)
                .collect::<Result<Vec<_>>>()
                .map(SearchKey::Many),
            _ => Err(unsupported(value)),
        }
    }
}

fn unsupported(value: &Value) -> Error {
    Error::new(
        ErrorKind::UnsupportedKeyType,
        format!(
            "Must give an integer scan ID like [6], a slice into past scans like [-5], [-5:], \
             or [-5:-9:2], a list like [1, 7, 13], a (partial) uid like ['a23jslk'] or a full \
             uid like ['f26efc1d-8263-46c8-a560-7bf73d2786e1']; got {}",
            value
        ),
    )
}

impl From<i64> for SearchKey {
    fn from(n: i64) -> Self {
        SearchKey::Int(n)
    }
}

impl From<i32> for SearchKey {
    fn from(n: i32) -> Self {
        SearchKey::Int(n as i64)
    }
}

impl From<&str> for SearchKey {
    fn from(uid: &str) -> Self {
        SearchKey::Uid(uid.to_string())
    }
}

impl From<String> for SearchKey {
    fn from(uid: String) -> Self {
        SearchKey::Uid(uid)
    }
}

impl<T: Into<SearchKey>> From<Vec<T>> for SearchKey {
    fn from(keys: Vec<T>) -> Self {
        SearchKey::Many(keys.into_iter().map(Into::into).collect())
    }
}

/// Resolve a key into `(start, stop)` pairs.
pub fn resolve(key: &SearchKey, source: &dyn HeaderSource) -> Result<Vec<RunPair>> {
    match key {
        SearchKey::Int(n) => resolve_int(*n, source),
        SearchKey::Slice { start, stop, step } => resolve_slice(*start, *stop, *step, source),
        SearchKey::Uid(uid) => resolve_uid(uid, source),
        SearchKey::Many(keys) => {
            info!(count = keys.len(), "interpreting key as a collection");
            let mut pairs = Vec::new();
            for key in keys {
                pairs.extend(resolve(key, source)?);
            }
            Ok(pairs)
        }
    }
}

fn with_stops(starts: Vec<Arc<RunStart>>, source: &dyn HeaderSource) -> Result<Vec<RunPair>> {
    starts
        .into_iter()
        .map(|start| {
            let stop = source.stop_given_start(&start.uid)?;
            Ok((start, stop))
        })
        .collect()
}

fn resolve_int(n: i64, source: &dyn HeaderSource) -> Result<Vec<RunPair>> {
    info!(key = n, "interpreting key as an integer");
    let start = if n > -1 {
        let mut query = Query::new();
        query.insert("scan_id".to_string(), json!(n));
        source.find_run_starts(&query)?.into_iter().next().ok_or_else(|| {
            Error::not_found(format!(
                "No such run found for key={} which is being interpreted as a scan id.",
                n
            ))
        })?
    } else {
        let wanted = n.unsigned_abs() as usize;
        let recent = source.find_last(wanted)?;
        if recent.len() < wanted {
            return Err(Error::new(
                ErrorKind::IndexOutOfRange,
                format!("There are only {} runs.", recent.len()),
            ));
        }
        recent[wanted - 1].clone()
    };
    with_stops(vec![start], source)
}

fn resolve_slice(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    source: &dyn HeaderSource,
) -> Result<Vec<RunPair>> {
    info!(?start, ?stop, ?step, "interpreting key as a slice");
    if let Some(start) = start.filter(|s| *s > -1) {
        return Err(Error::new(
            ErrorKind::InvalidRange,
            format!("slice start must be negative; the offending part is start={}", start),
        ));
    }
    if let Some(stop) = stop.filter(|s| *s > 0) {
        return Err(Error::new(
            ErrorKind::InvalidRange,
            format!("slice stop must be <= 0; the offending part is stop={}", stop),
        ));
    }
    let start = start.ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidRange,
            "slice start cannot be open because slicing infinitely into the past \
             would give an unbounded result"
                .to_string(),
        )
    })?;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Error::new(ErrorKind::InvalidRange, "slice step cannot be zero".to_string()));
    }

    let window = source.find_last(start.unsigned_abs() as usize)?;
    let offset = stop.map(|s| s.unsigned_abs() as usize);
    let picked = slice_from(window, offset, step);
    debug!(count = picked.len(), "slice resolved");
    with_stops(picked, source)
}

/// Sequence slicing `items[offset::step]` with a non-negative offset.
fn slice_from<T: Clone>(items: Vec<T>, offset: Option<usize>, step: i64) -> Vec<T> {
    let len = items.len();
    if len == 0 {
        return Vec::new();
    }
    let stride = step.unsigned_abs() as usize;
    if step > 0 {
        let first = offset.unwrap_or(0);
        items.into_iter().skip(first).step_by(stride).collect()
    } else {
        let first = offset.map_or(len - 1, |o| o.min(len - 1));
        (0..=first).rev().step_by(stride).map(|i| items[i].clone()).collect()
    }
}

fn resolve_uid(key: &str, source: &dyn HeaderSource) -> Result<Vec<RunPair>> {
    info!(key, "interpreting key as a uid");
    let mut results = Vec::new();
    if key.len() == UID_LENGTH {
        debug!(key, "treating key as a full uid");
        let mut query = Query::new();
        query.insert("uid".to_string(), json!(key));
        results = source.find_run_starts(&query)?;
    }
    if results.is_empty() {
        debug!(key, "treating key as a partial uid");
        results = source.find_by_uid_prefix(key)?;
    }
    match results.len() {
        0 => Err(Error::not_found(format!("No such run found for key={:?}", key))),
        1 => with_stops(results, source),
        n => Err(Error::new(
            ErrorKind::AmbiguousKey,
            format!("key={:?} matches {} runs. Provide more characters.", key, n),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_from_positive_steps() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(slice_from(items.clone(), None, 1), vec![1, 2, 3, 4, 5]);
        assert_eq!(slice_from(items.clone(), Some(2), 1), vec![3, 4, 5]);
        assert_eq!(slice_from(items.clone(), Some(0), 2), vec![1, 3, 5]);
        assert_eq!(slice_from(items, Some(9), 1), Vec::<i32>::new());
    }

    #[test]
    fn test_slice_from_negative_steps() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(slice_from(items.clone(), None, -1), vec![5, 4, 3, 2, 1]);
        assert_eq!(slice_from(items.clone(), Some(2), -1), vec![3, 2, 1]);
        assert_eq!(slice_from(items, Some(9), -2), vec![5, 3, 1]);
    }

    #[test]
    fn test_multi_keys() {
        assert!(SearchKey::slice(Some(-1), None, None).is_multi());
        assert!(SearchKey::from(vec![1, 2]).is_multi());
        assert!(!SearchKey::from(-1).is_multi());
        assert!(!SearchKey::from("abc").is_multi());
    }

    #[test]
    fn test_key_from_json_value() {
        let key = SearchKey::from_value(&json!([3, "abc", [-1]])).unwrap();
        assert_eq!(
            key,
            SearchKey::Many(vec![
                SearchKey::Int(3),
                SearchKey::Uid("abc".to_string()),
                SearchKey::Many(vec![SearchKey::Int(-1)]),
            ])
        );

        for bad in [json!(1.5), json!(true), json!(null), json!({"a": 1})] {
            let err = SearchKey::from_value(&bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::UnsupportedKeyType);
        }
    }
}
