#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # aromatech-ble
//!
//! A Rust library for controlling AromaTech scent diffusers via Bluetooth Low Energy.
//!
//! Two firmware generations are in the field. V2.0 devices drive power and
//! intensity entirely through schedule slot 1; V3.0 devices add a quick power
//! toggle, a pairing suffix on login and feature bits describing battery,
//! oil and multi-aroma support. The generation is detected from the login
//! reply, so callers never choose it.
//!
//! ## Layers
//!
//! - [`protocol`]: frame encoding and decoding for both generations
//! - [`negotiator`]: turning the login reply into a [`DeviceIdentity`]
//! - [`auth`]: the two-form login state machine
//! - [`state`]: merging telemetry into a [`DeviceState`]
//! - [`device`]: the [`DiffuserSession`] tying them to a [`Transport`]
//! - [`ble`]: the btleplug [`Transport`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use aromatech_ble::{DeviceConfig, DiffuserSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = DeviceConfig::new("C8:FD:19:3A:55:10");
//!     let session = DiffuserSession::open(&device, SessionConfig::default()).await?;
//!
//!     session.set_intensity(2).await?;
//!     session.set_power(true).await?;
//!
//!     for (key, value) in session.snapshot().attributes() {
//!         println!("{key}: {value:?}");
//!     }
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Login handshake
pub mod auth;
/// Bluetooth Low Energy transport
pub mod ble;
/// Diffuser session
pub mod device;
/// Error types and handling
pub mod error;
/// Protocol generation and capability detection
pub mod negotiator;
/// Frame codec
pub mod protocol;
/// Live device state
pub mod state;
/// Type definitions and configuration
pub mod types;

#[cfg(test)]
mod mock;

// Re-export the main types for convenient usage
pub use ble::{BleTransport, DiscoveryFilter, Link, Transport};
pub use device::DiffuserSession;
pub use error::{AromaTechError, Result};
pub use state::{AttributeValue, DeviceSnapshot, DeviceState};
pub use types::{
    Capabilities, Classification, ConnectionParams, Credential, DeviceConfig, DeviceIdentity,
    DiscoveredDevice, OilRecord, ProtocolVersion, ReconnectPolicy, Schedule, SessionConfig,
    SessionState, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Diffuser GATT service
pub const SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// Characteristic used for both writes and notifications
pub const CHARACTERISTIC_UUID: &str = "0000fff6-0000-1000-8000-00805f9b34fb";

/// Manufacturer id carried in AromaTech advertisements
pub const MANUFACTURER_ID: u16 = 0x5943;

/// Product names recognized in advertised device names
///
/// Ordered longest first, so the most specific pattern a name starts with
/// wins once any vendor prefix is stripped.
pub const DEVICE_NAME_PATTERNS: [&str; 17] = [
    "AROMINI BT PLUS",
    "Air Stream",
    "AroMini BT",
    "SB-600 BT",
    "SB-400 BT",
    "AromaPro",
    "SE8150D",
    "SE8150B",
    "SB-1500",
    "AroMini",
    "AT-600",
    "8150D",
    "AT600",
    "SE005",
    "AE103",
    "A313",
    "A1",
];
