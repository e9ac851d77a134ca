//! Error type for core value parsing and gas arithmetic.

use thiserror::Error;

/// Errors produced by the core types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("intrinsic gas computation overflowed")]
    IntrinsicGasOverflow,
}
