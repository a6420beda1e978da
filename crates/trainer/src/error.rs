use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Training set is empty")]
    EmptyDataset,

    #[error("Training example {index} has an empty {field}")]
    InvalidExample { index: usize, field: &'static str },

    #[error("Invalid training config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Model(#[from] lm_core::LmError),

    #[error(transparent)]
    Tokenizer(#[from] tokenizer::TokenizerError),
}

pub type Result<T> = std::result::Result<T, TrainError>;
