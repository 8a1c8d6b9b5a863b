pub mod key;
pub mod parser;
pub mod matcher;
pub mod time;

/// Mongo-style query document: field names or operators mapped to values
pub type Query = serde_json::Map<String, serde_json::Value>;
