use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Invalid model id {0:?}: expected an existing directory or `org/name`")]
    InvalidModelId(String),

    #[error("{file} not found for {model}")]
    FileNotFound { model: String, file: String },

    #[error("{file} for {model} is not cached and the hub is offline")]
    NotCached { model: String, file: String },

    #[error("Hub API error: {0}")]
    Api(#[from] hf_hub::api::sync::ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HubError>;
