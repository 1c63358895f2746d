//! Error types for ReserveL

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReservationError {
    #[error("Reservation not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A concurrent writer changed the document since it was read.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Settlement error: {0}")]
    Settlement(String),

    #[error("Settlement is disabled")]
    SettlementDisabled,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ReservationError {
    fn from(err: std::io::Error) -> Self {
        ReservationError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for ReservationError {
    fn from(err: rusqlite::Error) -> Self {
        ReservationError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ReservationError {
    fn from(err: serde_json::Error) -> Self {
        ReservationError::Database(format!("Document encoding failed: {}", err))
    }
}

impl From<reqwest::Error> for ReservationError {
    fn from(err: reqwest::Error) -> Self {
        ReservationError::Settlement(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ReservationError>;
