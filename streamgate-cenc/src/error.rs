//! Error types for subsample layout and clear-key decryption.

use thiserror::Error;

/// Errors raised while reading encryption side metadata or decrypting a sample.
#[derive(Debug, Error)]
pub enum CencError {
    /// Invalid key size (must be 16 bytes for AES-128).
    #[error("invalid key size: expected 16 bytes for AES-128, got {0} bytes")]
    InvalidKeySize(usize),

    /// Invalid IV size.
    #[error("invalid IV size: expected 8 or 16 bytes, got {0} bytes")]
    InvalidIvSize(usize),

    /// Invalid hex string.
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Hex string has wrong length.
    #[error("hex string has wrong length: expected 16 bytes (32 hex chars), got {0} bytes")]
    HexWrongLength(usize),

    /// Malformed subsample map or ranges that do not cover the payload.
    #[error("subsample data error: {0}")]
    Subsample(String),

    /// Unsupported protection scheme.
    #[error("unsupported protection scheme: {0} (supported: cenc, cbc1)")]
    UnsupportedScheme(String),

    /// Malformed `pssh` box.
    #[error("invalid pssh box: {0}")]
    Pssh(String),

    /// Unknown protection system id or name.
    #[error("unknown protection system: {0}")]
    UnknownSystem(String),

    /// I/O error while reading packed metadata.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `Result` alias where the `Err` case is [`CencError`].
pub type Result<T> = std::result::Result<T, CencError>;
