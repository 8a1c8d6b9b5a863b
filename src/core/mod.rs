pub mod types;
pub mod config;
pub mod error;
pub mod header;
pub mod results;
pub mod broker;

pub use broker::{Alias, Broker, Lookup};
pub use error::{Error, ErrorKind, Result};
pub use header::{Header, IntoHeaders};
pub use results::ResultsView;
