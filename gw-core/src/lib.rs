//! Protocol core for the dual-MCU portable-power-station BLE gateway.
//!
//! This crate implements the parts of the system that are hard to re-derive
//! from scratch: the custom-curve ECDH handshake and session-key derivation
//! ([`crypto`]), the inner/outer packet framing ([`codec`]), fragmented
//! notification reassembly ([`reassembly`]), the per-device authentication
//! state machine ([`session`]), the four-slot device manager ([`manager`]),
//! the four device protocol adaptors ([`devices`]), and the inter-MCU binary
//! transport with OTA streaming ([`transport`]).
//!
//! The crate does not talk to any radio or UART directly. Call sites supply
//! a BLE central and a UART port through the trait seams defined in the
//! `gw-gateway` binary crate; this keeps the hard protocol logic testable
//! without hardware.

pub mod codec;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod manager;
pub mod reassembly;
pub mod session;
pub mod transport;
mod utils;

pub use error::Error;
