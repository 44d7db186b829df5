//! # enet-bridge
//!
//! Safe, handle-based bindings to the ENet reliable-UDP engine, loaded at
//! runtime.
//!
//! The crate does not implement a transport. It locates the native engine,
//! loads it once per process, and exposes its host, peer and packet objects
//! through generational handles so that use-after-destroy is reported as an
//! error instead of reaching freed memory.
//!
//! ## Layers
//! - **Core**: [`Address`] codec, ABI constants and the [`Event`] value
//! - **Loader**: platform detection, system load and bundled-artifact fallback
//! - **Engine**: the fixed boundary to the native library, plus an
//!   in-process loopback engine
//! - **Bridge**: handle registries, ownership rules and event dispatch
//!
//! ## Example Usage
//! ```rust,no_run
//! use std::time::Duration;
//! use enet_bridge::{Address, Bridge, BridgeConfig, PacketFlags};
//!
//! # fn main() -> enet_bridge::Result<()> {
//! let bridge = Bridge::open(&BridgeConfig::default())?;
//! let client = bridge.host_create(None, 1, 2, 0, 0)?;
//! let peer = bridge.host_connect(client, &"127.0.0.1:7777".parse::<Address>()?, 2, 0)?;
//!
//! while let Some(event) = bridge.host_service(client, Duration::from_millis(100))?.event() {
//!     if event.is_connect() {
//!         let packet = bridge.packet_create(b"hello", PacketFlags::RELIABLE)?;
//!         if bridge.peer_send(peer, 0, packet).is_err() {
//!             bridge.packet_destroy(packet)?;
//!         }
//!     }
//! }
//! bridge.host_destroy(client)?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod handle;
pub mod loader;
pub mod utils;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use crate::core::address::Address;
pub use crate::core::constants::{EventType, PacketFlags, PeerState};
pub use crate::core::event::{Event, ServiceOutcome};
pub use error::{BridgeError, Result};
pub use handle::{HostHandle, PacketHandle, PeerHandle};
