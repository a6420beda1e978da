pub mod config;
pub mod handle;
pub mod pipeline;
pub mod report;

pub use config::{DatasetSource, GenerationConfig, ModelSection, PipelineConfig};
pub use handle::ModelHandle;
pub use pipeline::{Pipeline, RunReport};
