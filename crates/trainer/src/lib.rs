pub mod dataset;
pub mod error;
pub mod train;

pub use dataset::{SftDataset, TrainingExample};
pub use error::{Result, TrainError};
pub use train::{AdapterTrainer, TrainingSummary};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingRunConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Optimizer steps of linear warmup before the linear decay.
    pub warmup_steps: usize,
    /// Gradient-norm clipping; 0 disables it.
    pub max_grad_norm: f64,
    /// Log the running loss every this many optimizer steps.
    pub logging_steps: usize,
    /// Write an adapter checkpoint every this many optimizer steps; 0 disables.
    pub save_steps: usize,
    /// Training sequences are truncated to this many tokens.
    pub max_seq_len: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for TrainingRunConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 4,
            gradient_accumulation_steps: 4,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            warmup_steps: 0,
            max_grad_norm: 1.0,
            logging_steps: 3,
            save_steps: 0,
            max_seq_len: 256,
            seed: 42,
            output_dir: PathBuf::from("./validation_output"),
        }
    }
}

impl TrainingRunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TrainError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TrainError::InvalidConfig("gradient_accumulation_steps must be at least 1".into()));
        }
        if self.max_seq_len < 2 {
            return Err(TrainError::InvalidConfig("max_seq_len must be at least 2".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(TrainError::InvalidConfig(format!("learning_rate must be positive, got {}", self.learning_rate)));
        }
        Ok(())
    }
}
