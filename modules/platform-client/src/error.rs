use thiserror::Error;

use relay_common::RelayError;

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Call budget exhausted for route {0}")]
    RetriesExhausted(String),
}

impl From<PlatformError> for RelayError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::Auth(msg) => RelayError::FatalProtocol(msg),
            PlatformError::Http(err) => RelayError::TransientIo(err.to_string()),
            PlatformError::Api { status, message } if status >= 500 => {
                RelayError::TransientIo(format!("platform {status}: {message}"))
            }
            PlatformError::Api { status, message } => {
                RelayError::Validation(format!("platform {status}: {message}"))
            }
            PlatformError::RetriesExhausted(route) => {
                RelayError::TransientIo(format!("platform call budget exhausted for {route}"))
            }
        }
    }
}
