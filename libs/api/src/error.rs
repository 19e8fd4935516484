//! Error types for desired-state snapshots.

use thiserror::Error;

/// Errors that can occur when decoding or validating a snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The snapshot could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A service or endpoints entry has an empty name.
    #[error("empty name in {0} entry")]
    EmptyName(&'static str),

    /// The same port name appears twice within one entry.
    #[error("duplicate port name {port:?} in {name}")]
    DuplicatePort { name: String, port: String },

    /// The same entry name appears twice within one snapshot.
    #[error("duplicate {kind} entry {name}")]
    DuplicateEntry { kind: &'static str, name: String },
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serialization(err.to_string())
    }
}
