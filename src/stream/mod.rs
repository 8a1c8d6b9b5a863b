pub mod documents;
pub mod table;

use std::fmt;

pub use documents::DocumentStream;
pub use table::{Column, Table, TableOptions};

/// Selects which event streams of a run are read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamName {
    /// Every stream
    All,
    Named(String),
}

impl StreamName {
    pub fn primary() -> Self {
        StreamName::Named("primary".to_string())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            StreamName::All => true,
            StreamName::Named(wanted) => wanted == name,
        }
    }
}

impl Default for StreamName {
    fn default() -> Self {
        Self::primary()
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        StreamName::Named(name.to_string())
    }
}

impl From<String> for StreamName {
    fn from(name: String) -> Self {
        StreamName::Named(name)
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamName::All => f.write_str("ALL"),
            StreamName::Named(name) => f.write_str(name),
        }
    }
}
