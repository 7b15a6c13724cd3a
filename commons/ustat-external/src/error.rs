#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session inactive")]
    SessionInactive,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExternalError {
    pub fn not_found<T: ToString>(what: T) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn api_error<T: ToString>(status: u16, message: T) -> Self {
        Self::Api {
            status,
            message: message.to_string(),
        }
    }
}

pub type ExternalResult<T> = Result<T, ExternalError>;
