pub mod handler;
pub mod handlers;
pub mod registry;

pub use handler::{Handler, HandlerFactory, HandlerOverrides};
pub use registry::{CopyOptions, HandlerScope, Registry};
