pub mod source;
pub mod memory;
pub mod journal;
pub mod layout;
pub mod file_lock;

pub use memory::MetadataStore;
pub use source::{DocIter, EventSource, HeaderSource, RunPair, Sources};
