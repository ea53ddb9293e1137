// Library exports for stock_seq

pub mod batch;
pub mod batcher;
pub mod collection;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod normalizer;
pub mod pipeline;
pub mod records;
pub mod rolling;
pub mod source;
pub mod split;
pub mod window;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineReport, PreparedDataset};
