//! Error type shared by the data plane and the execution engine
//!
//! Every failure surfaced by the public API is one of these kinds carrying a
//! human-readable message. Library code propagates them with `?`; nothing in
//! the libraries exits the process.

use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Things that can go wrong while configuring or running a solution
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Contradictory or illegal sizes and settings
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was issued in the wrong lifecycle phase
    #[error("preparation error: {0}")]
    Preparation(String),

    /// Incompatible dimension lists or fold layouts
    #[error("dimension mismatch: {0}")]
    DimMismatch(String),

    /// Strict element access outside the allocated range
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    /// The allocation planner could not place an object
    #[error("allocation failure: {0}")]
    Allocation(String),

    /// Non-zero status from the underlying transport
    #[error("transport error: {0}")]
    Comm(String),
}
//
impl Error {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for a preparation error
    pub fn preparation(msg: impl Into<String>) -> Self {
        Self::Preparation(msg.into())
    }
}
