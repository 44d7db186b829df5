//! # Error Types
//!
//! Error handling for the binding layer.
//!
//! The native engine speaks in sentinels: null pointers for failed
//! allocations and negative integers for failed calls. Every sentinel that
//! crosses into this crate is turned into one of the variants below, so a
//! failure can never be mistaken for a live handle.
//!
//! ## Error Categories
//! - **Validation**: malformed addresses rejected before reaching the engine
//! - **Bootstrap**: the engine could not be located, extracted or loaded
//! - **Engine sentinels**: allocation failures, service failures, rejected sends
//! - **Resource model**: handles that were destroyed, transferred or never issued
//!
//! ## Example Usage
//! ```rust
//! use enet_bridge::core::address::Address;
//! use enet_bridge::error::{BridgeError, Result};
//! use tracing::{error, info};
//!
//! fn parse_host(bytes: &[u8]) -> Result<Address> {
//!     Address::from_raw_host(bytes, 7777, 0)
//! }
//!
//! match parse_host(&[0u8; 4]) {
//!     Ok(address) => info!(%address, "Parsed address"),
//!     Err(BridgeError::InvalidAddressLength(len)) => error!(len, "Wrong host length"),
//!     Err(e) => error!(error = %e, "Unexpected error"),
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::handle::ResourceKind;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Address validation
    pub const ERR_MISSING_PORT: &str = "Address text is missing a ':port' suffix";

    /// Bootstrap
    pub const ERR_ARTIFACT_MISSING: &str = "Native library not found";
    pub const ERR_FALLBACK_DISABLED: &str = "System load failed and resource fallback is disabled";
    pub const ERR_NO_ARTIFACT_SOURCE: &str = "No native artifact source configured";
    pub const ERR_MISSING_SYMBOL: &str = "Native library is missing a required symbol";
}

/// BridgeError is the primary error type for all binding operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid address length: {0} bytes (expected 16)")]
    InvalidAddressLength(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Native engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Native engine initialization failed with code {0}")]
    InitializationFailed(i32),

    #[error("Allocation failed: engine returned a null {0} handle")]
    AllocationFailure(ResourceKind),

    #[error("Host service failed with code {0}")]
    ServiceError(i32),

    #[error("Send rejected with code {0}; packet remains owned by the caller")]
    SendRejected(i32),

    #[error("Stale or unknown {0} handle")]
    StaleHandle(ResourceKind),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl BridgeError {
    /// Whether the error leaves the whole transport unusable for this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::EngineUnavailable(_))
    }
}

/// Type alias for Results using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
