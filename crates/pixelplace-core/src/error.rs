//! Error types.

use thiserror::Error;

/// Errors returned synchronously by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanvasError {
    #[error("Coordinate ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
    #[error("Invalid color: {0}")]
    InvalidColor(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type CanvasResult<T> = Result<T, CanvasError>;

/// Malformed or inconsistent traffic from the authority.
///
/// Never surfaced to callers; the sync channel logs it and reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Snapshot is {got_width}x{got_height}, local grid is {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("Authority addressed ({x}, {y}) outside the grid")]
    OutOfBounds { x: u32, y: u32 },
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    SendFailed(String),
}
