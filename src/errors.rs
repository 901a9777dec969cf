use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    #[error("No audio match found: {0}")]
    Resolve(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Fatal IO error: {0}")]
    FatalIo(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl AppError {
    /// Transient errors are retried up to the attempt ceiling; anything
    /// else aborts the item (or the whole job) immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::RateLimit { .. }
                | AppError::Resolve(_)
                | AppError::Fetch(_)
                | AppError::Validation(_)
                | AppError::Http(_)
                | AppError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AppError::Fetch("timeout".to_string()).is_transient());
        assert!(AppError::Validation("too small".to_string()).is_transient());
        assert!(AppError::Resolve("no match".to_string()).is_transient());
        assert!(AppError::RateLimit { retry_after_secs: 5 }.is_transient());
        assert!(!AppError::Auth("bad credentials".to_string()).is_transient());
        assert!(!AppError::FatalIo("cannot write output dir".to_string()).is_transient());
        assert!(!AppError::Config("missing".to_string()).is_transient());
    }
}
