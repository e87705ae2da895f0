//! Error types for funnel-inbound

use thiserror::Error;

/// Result type alias using funnel-inbound Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur around the inbound engine
#[derive(Error, Debug)]
pub enum Error {
    /// The turn handler reported a failure
    #[error("Turn handler failed: {0}")]
    Handler(String),

    /// The turn handler panicked while processing a turn
    #[error("Turn handler panicked")]
    HandlerPanicked,

    /// A configuration update could not be understood
    #[error("Invalid config: {0}")]
    Config(String),

    /// A generic error
    #[error("{0}")]
    Other(String),
}
