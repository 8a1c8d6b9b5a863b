pub mod pipeline;

pub use pipeline::{fill_table, FillMode, FillPipeline, FillSelector, FillStats, FilledEvents};
