use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum FacadeError {
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Attribute is not writable: {0}")]
    NotWritable(String),

    #[error("No value available for attribute: {0}")]
    Unavailable(String),

    #[error("Cannot derive {attribute}: input {input} is unavailable")]
    DerivationUnavailable { attribute: String, input: String },

    #[error("Type mismatch on {attribute}: expected {expected}, found {found}")]
    TypeMismatch {
        attribute: String,
        expected: String,
        found: String,
    },

    #[error("Invalid binding on {attribute}: input {input} is not registered")]
    InvalidBinding { attribute: String, input: String },

    #[error("Attribute registered twice: {0}")]
    DuplicateAttribute(String),

    #[error("Remote source for {attribute} failed: {message}")]
    Remote { attribute: String, message: String },

    #[error("Facade has been shut down")]
    ShutDown,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FacadeError>;
