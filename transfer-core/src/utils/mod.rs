//! Shared error type and logging setup.

pub mod errors;
pub mod logger;

pub use errors::{Result, TransferError};
