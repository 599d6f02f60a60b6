//! Error taxonomy for the relay core.

use thiserror::Error;

/// Errors the Event Validator can return. Each variant maps to a specific
/// `OK false <reason>` reply in the session layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("malformed field: {0}")]
    MalformedField(&'static str),
    #[error("id does not match computed hash")]
    IdMismatch,
    #[error("invalid signature")]
    BadSignature,
}

impl ValidationError {
    /// Short diagnostic used in `["OK", id, false, "invalid: <reason>"]`.
    pub fn reason(&self) -> String {
        match self {
            ValidationError::MissingField(f) => format!("invalid: missing field {f}"),
            ValidationError::MalformedField(f) => format!("invalid: malformed field {f}"),
            ValidationError::IdMismatch => "invalid: id mismatch".to_string(),
            ValidationError::BadSignature => "invalid: bad signature".to_string(),
        }
    }
}

/// Errors surfaced by the Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transaction failed: {0}")]
    Transaction(String),
}

impl StoreError {
    pub fn reason(&self) -> &'static str {
        "Something went wrong"
    }
}

/// Errors a Relay Session can hit while dispatching a frame.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame is not valid JSON or not an array")]
    MalformedFrame,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pubkey not authorized")]
    NotAuthorized,
    #[error("subscription requires an authors filter")]
    NoAuthors,
    #[error("authentication required")]
    AuthRequired,
}
