use std::cmp::Ordering;
use std::num::NonZeroUsize;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use crate::core::error::{Error, ErrorKind, Result};
use crate::query::Query;

/// Compiled `$regex` patterns kept per matcher
const REGEX_CACHE_SIZE: usize = 256;

/// Evaluates mongo-style queries against JSON documents.
///
/// Supported: equality (arrays match on membership), `$and`, `$or`,
/// `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`,
/// `$regex`, and dotted paths into nested objects.
pub struct DocumentMatcher {
    regex_cache: Mutex<LruCache<String, Regex>>,
}

impl Default for DocumentMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentMatcher {
    pub fn new() -> Self {
        Self::with_regex_cache_size(REGEX_CACHE_SIZE)
    }

    pub fn with_regex_cache_size(size: usize) -> Self {
        let capacity = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN);
        DocumentMatcher {
            regex_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn matches(&self, doc: &Value, query: &Query) -> Result<bool> {
        for (key, condition) in query {
            let matched = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for clause in clauses(condition, "$and")? {
                        if !self.matches(doc, clause)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" => {
                    let mut any = false;
                    for clause in clauses(condition, "$or")? {
                        if self.matches(doc, clause)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                op if op.starts_with('$') => {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("Unsupported top-level operator '{}'", op),
                    ));
                }
                path => self.matches_field(lookup(doc, path), condition)?,
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matches_field(&self, value: Option<&Value>, condition: &Value) -> Result<bool> {
        match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                for (op, operand) in ops {
                    if !self.apply_operator(value, op, operand)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            expected => Ok(value.is_some_and(|v| equals_or_contains(v, expected))),
        }
    }

    fn apply_operator(&self, value: Option<&Value>, op: &str, operand: &Value) -> Result<bool> {
        Ok(match op {
            "$eq" => value.is_some_and(|v| equals_or_contains(v, operand)),
            "$ne" => !value.is_some_and(|v| equals_or_contains(v, operand)),
            "$gt" => compare(value, operand).is_some_and(|o| o == Ordering::Greater),
            "$gte" => compare(value, operand).is_some_and(|o| o != Ordering::Less),
            "$lt" => compare(value, operand).is_some_and(|o| o == Ordering::Less),
            "$lte" => compare(value, operand).is_some_and(|o| o != Ordering::Greater),
            "$in" => {
                let options = operand.as_array().ok_or_else(|| bad_operand(op, operand))?;
                value.is_some_and(|v| options.iter().any(|o| equals_or_contains(v, o)))
            }
            "$nin" => {
                let options = operand.as_array().ok_or_else(|| bad_operand(op, operand))?;
                !value.is_some_and(|v| options.iter().any(|o| equals_or_contains(v, o)))
            }
            "$exists" => {
                let wanted = operand.as_bool().ok_or_else(|| bad_operand(op, operand))?;
                value.is_some() == wanted
            }
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| bad_operand(op, operand))?;
                match value.and_then(Value::as_str) {
                    Some(text) => self.regex(pattern)?.is_match(text),
                    None => false,
                }
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("Unsupported query operator '{}'", other),
                ));
            }
        })
    }

    fn regex(&self, pattern: &str) -> Result<Regex> {
        let mut cache = self.regex_cache.lock();
        if let Some(regex) = cache.get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern)?;
        cache.put(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

fn clauses<'a>(condition: &'a Value, op: &str) -> Result<Vec<&'a Query>> {
    let list = condition.as_array().ok_or_else(|| bad_operand(op, condition))?;
    list.iter()
        .map(|clause| clause.as_object().ok_or_else(|| bad_operand(op, clause)))
        .collect()
}

fn bad_operand(op: &str, operand: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidArgument,
        format!("Invalid operand for {}: {}", op, operand),
    )
}

/// Resolve a dotted path such as `"sample.name"`
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, part| current.as_object()?.get(part))
}

fn equals_or_contains(value: &Value, expected: &Value) -> bool {
    if values_equal(value, expected) {
        return true;
    }
    match value {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (value?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
