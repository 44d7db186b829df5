//! # Core Value Types
//!
//! Plain values shared by every other layer of the bridge.
//!
//! ## Components
//! - **Address**: canonical 16-byte endpoint with IPv4-mapped encoding
//! - **Constants**: packet flags, peer states and event types fixed by the engine ABI
//! - **Event**: a single dispatched event, returned by value from each poll
//!
//! ## Address Layout
//! ```text
//! [host(16)] [port(2, host order)] [scope_id(2)]
//! IPv4: 00 00 00 00 00 00 00 00 00 00 FF FF a b c d
//! ```

pub mod address;
pub mod constants;
pub mod event;
