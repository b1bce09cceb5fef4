use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model load failed: {0}")]
    ModelLoadError(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Image fetch failed: {0}")]
    FetchError(String),

    #[error("Image decode failed: {0}")]
    DecodeError(String),

    #[error("Inference failed: {0}")]
    InferenceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;

impl From<anyhow::Error> for FilterError {
    fn from(err: anyhow::Error) -> Self {
        FilterError::InternalError(err.to_string())
    }
}
