pub mod core;
pub mod query;
pub mod storage;
pub mod analysis;
pub mod search;
pub mod assets;
pub mod stream;
pub mod fill;

pub use crate::assets::{CopyOptions, Handler, HandlerFactory, Registry};
pub use crate::core::broker::{Broker, Lookup};
pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::header::Header;
pub use crate::core::results::ResultsView;
pub use crate::core::types::{Document, DocumentKind, Event, EventDescriptor, RunStart, RunStop};
pub use crate::fill::{FillMode, FillSelector};
pub use crate::query::Query;
pub use crate::query::key::SearchKey;
pub use crate::storage::memory::MetadataStore;
pub use crate::stream::{DocumentStream, StreamName, Table, TableOptions};
pub use crate::stream::documents::StreamOptions;
