use thiserror::Error;

#[derive(Error, Debug)]
pub enum LmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("Weights missing from checkpoint: {}", .0.join(", "))]
    MissingWeights(Vec<String>),

    #[error("Target module `{0}` matches no sublayer of the base model")]
    TargetModuleNotFound(String),

    #[error("Adapter config lists no target modules")]
    NoTargetModules,

    #[error("An adapter is already attached")]
    AdapterAlreadyAttached,

    #[error("Invalid adapter config: {0}")]
    InvalidAdapterConfig(String),
}

pub type Result<T> = std::result::Result<T, LmError>;
