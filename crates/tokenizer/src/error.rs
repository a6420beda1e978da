use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Malformed merges file at line {line}: {content:?}")]
    MalformedMerge { line: usize, content: String },

    #[error("Tokens {first:?} and {second:?} share id {id}")]
    DuplicateId { id: u32, first: String, second: String },

    #[error("Failed to load {path:?}: {message}")]
    Pretrained { path: PathBuf, message: String },

    #[error("Tokenizer error: {0}")]
    Codec(String),

    #[error("Training corpus is empty")]
    EmptyCorpus,
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
