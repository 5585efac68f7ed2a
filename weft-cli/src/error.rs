//! Centralized CLI error handling.

/// Errors surfaced to the CLI user with a friendly message.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad arguments or configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime operation failure.
    #[error(transparent)]
    Status(#[from] weft::Status),
}
