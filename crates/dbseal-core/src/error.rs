use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Encryption config unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("OS secret storage is not available")]
    CustodyUnavailable,

    #[error("Secret custody failure: {0}")]
    Custody(String),

    #[error("Not a recognized encrypted database container: {0}")]
    Format(&'static str),

    /// Wrong PIN and a damaged container are reported identically.
    #[error("Container authentication failed")]
    Integrity,

    #[error("PIN must be at least {min} characters", min = crate::lifecycle::MIN_PIN_LEN)]
    InvalidPin,

    #[error("Encryption state is unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, EncryptionError>;
