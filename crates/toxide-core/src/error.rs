//! Error types for toxics and toxic chains.

use thiserror::Error;

use crate::direction::Direction;

/// Toxic error type.
#[derive(Debug, Error)]
pub enum ToxicError {
    /// A toxic with the same name already exists in the chain.
    #[error("toxic already exists: {0}")]
    Conflict(String),

    /// No toxic with this name exists in the chain.
    #[error("toxic not found: {0}")]
    NotFound(String),

    /// The toxic type is not one we know how to run.
    #[error("unknown toxic type: {0}")]
    UnknownType(String),

    /// The stream direction could not be parsed.
    #[error("invalid stream direction: {0}")]
    InvalidDirection(String),

    /// Attributes do not match the toxic type.
    #[error("invalid toxic attributes: {0}")]
    InvalidAttributes(String),

    /// Toxicity outside of `0.0..=1.0`.
    #[error("toxicity must be between 0.0 and 1.0, got {0}")]
    InvalidToxicity(f32),

    /// The toxic was sent to the chain of the other direction.
    #[error("toxic {name} targets the {stream} stream, not {chain}")]
    WrongStream {
        name: String,
        stream: Direction,
        chain: Direction,
    },

    /// Attempted to change the type of an existing toxic.
    #[error("cannot change type of toxic {name} from {from} to {to}")]
    TypeChange {
        name: String,
        from: String,
        to: String,
    },
}

impl ToxicError {
    /// Returns true if the error was caused by a malformed toxic definition.
    pub fn is_invalid(&self) -> bool {
        !matches!(self, ToxicError::Conflict(_) | ToxicError::NotFound(_))
    }
}

/// Result type for toxic operations.
pub type Result<T> = std::result::Result<T, ToxicError>;
