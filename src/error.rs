//! ## Error Module
//!
//! Defines [`TpError`], the main error type used across the Template Provider.
//!
//! Centralizes errors from:
//! - Wire message construction (`binary_sv2`)
//! - Bitcoin consensus (de)serialization
//! - Locking (PoisonError)

use std::{
    fmt,
    sync::{MutexGuard, PoisonError},
};

use stratum_common::bitcoin::consensus::encode;

/// Represents the errors that can occur while distributing templates.
#[derive(Debug)]
pub enum TpError {
    /// Error from the `binary_sv2` crate while building a wire message.
    BinarySv2(binary_sv2::Error),
    /// A client submitted a bitcoin payload that does not deserialize.
    BitcoinEncode(encode::Error),
    /// Error due to a poisoned lock, typically from a failed mutex operation.
    PoisonLock(String),
    /// Custom error message.
    Custom(String),
}

impl fmt::Display for TpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TpError::*;
        match self {
            BinarySv2(ref e) => write!(f, "Binary SV2 error: `{:?}`", e),
            BitcoinEncode(ref e) => write!(f, "Bitcoin encoding error: `{:?}`", e),
            PoisonLock(ref e) => write!(f, "Poison lock: {:?}", e),
            Custom(ref e) => write!(f, "Custom SV2 error: `{:?}`", e),
        }
    }
}

pub type TpResult<T> = Result<T, TpError>;

impl From<binary_sv2::Error> for TpError {
    fn from(e: binary_sv2::Error) -> TpError {
        TpError::BinarySv2(e)
    }
}

impl From<encode::Error> for TpError {
    fn from(e: encode::Error) -> TpError {
        TpError::BitcoinEncode(e)
    }
}

impl From<String> for TpError {
    fn from(e: String) -> TpError {
        TpError::Custom(e)
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for TpError {
    fn from(e: PoisonError<MutexGuard<T>>) -> TpError {
        TpError::PoisonLock(e.to_string())
    }
}
