use crate::error::{AromaTechError, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Password the firmware ships with
pub const DEFAULT_PASSWORD: &str = "8888";

/// Intensity used when nothing better is known
pub const DEFAULT_INTENSITY: u8 = 1;

/// Maximum intensity assumed until the device reports its limits
pub const DEFAULT_MAX_INTENSITY: u8 = 5;

/// Number of digits in a device password
pub const CREDENTIAL_LEN: usize = 4;

/// Frame format generation spoken by a diffuser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Legacy generation, schedule-driven power control
    V2,
    /// Current generation with quick power and feature bits
    V3,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 => write!(f, "2.0"),
            Self::V3 => write!(f, "3.0"),
        }
    }
}

/// A validated 4-digit device password
///
/// The value is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    digits: [u8; CREDENTIAL_LEN],
}

impl Credential {
    /// Validate a password entered by the user
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::InvalidCredential`] unless `password` is exactly
    /// four ASCII digits.
    pub fn new(password: &str) -> Result<Self> {
        let bytes = password.as_bytes();
        if bytes.len() != CREDENTIAL_LEN {
            return Err(AromaTechError::InvalidCredential(format!(
                "expected {CREDENTIAL_LEN} digits, got {} characters",
                password.chars().count()
            )));
        }
        if !bytes.iter().all(u8::is_ascii_digit) {
            return Err(AromaTechError::InvalidCredential(
                "password must contain digits only".to_string(),
            ));
        }

        let mut digits = [0u8; CREDENTIAL_LEN];
        digits.copy_from_slice(bytes);
        Ok(Self { digits })
    }

    /// ASCII digits as sent on the wire
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.digits
    }
}

impl FromStr for Credential {
    type Err = AromaTechError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// Feature bits reported by V3.0 firmware in its login reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Reservoir level tracking
    pub oil_support: bool,
    /// Battery level reporting
    pub battery_support: bool,
    /// Custom on/off intensity cycles
    pub custom_intensity_support: bool,
    /// More than one reservoir
    pub multi_aroma: bool,
    /// Independent fan control
    pub fan_control_support: bool,
}

impl Capabilities {
    /// Decode the feature byte: bit 0 oil, 1 battery, 2 custom, 3 multi-aroma, 4 fan
    #[must_use]
    pub const fn from_feature_bits(bits: u8) -> Self {
        Self {
            oil_support: bits & 0x01 != 0,
            battery_support: bits & 0x02 != 0,
            custom_intensity_support: bits & 0x04 != 0,
            multi_aroma: bits & 0x08 != 0,
            fan_control_support: bits & 0x10 != 0,
        }
    }
}

/// How the protocol generation was determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Login signature matched a known layout
    Signature,
    /// Unknown signature, conservative defaults applied
    Fallback,
}

/// Custom cycle ranges reported with the intensity limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTimeLimits {
    /// Shortest on period
    pub on_min: u16,
    /// Longest on period
    pub on_max: u16,
    /// Shortest off period
    pub off_min: u16,
    /// Longest off period
    pub off_max: u16,
}

/// What a connected diffuser is, frozen once the handshake completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Bluetooth device name
    pub device_name: String,
    /// Product/model name, e.g. `AROMINI BT PLUS`
    pub product_name: String,
    /// User-assigned label, if any
    pub label: Option<String>,
    /// Factory identifier, e.g. `001`
    pub identifier: Option<String>,
    /// Frame format generation
    pub protocol_version: ProtocolVersion,
    /// Whether the generation came from a known signature
    pub classification: Classification,
    /// Feature flags
    pub capabilities: Capabilities,
    /// Number of reservoirs
    pub reservoir_count: u8,
    /// Highest accepted intensity
    pub max_intensity: u8,
    /// Custom cycle ranges, when reported
    pub custom_limits: Option<CustomTimeLimits>,
}

impl DeviceIdentity {
    /// Identity with conservative defaults for the given generation
    #[must_use]
    pub const fn new(protocol_version: ProtocolVersion, classification: Classification) -> Self {
        Self {
            device_name: String::new(),
            product_name: String::new(),
            label: None,
            identifier: None,
            protocol_version,
            classification,
            capabilities: Capabilities {
                oil_support: false,
                battery_support: false,
                custom_intensity_support: false,
                multi_aroma: false,
                fan_control_support: false,
            },
            reservoir_count: 1,
            max_intensity: DEFAULT_MAX_INTENSITY,
            custom_limits: None,
        }
    }

    /// Check whether `level` is a valid intensity for this device
    #[must_use]
    pub const fn accepts_intensity(&self, level: u8) -> bool {
        level >= 1 && level <= self.max_intensity
    }
}

/// A fragrance reservoir
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OilRecord {
    /// Fragrance name
    pub name: String,
    /// Capacity, 0 when the firmware does not report it
    pub total: u16,
    /// Amount left
    pub remaining: u16,
}

impl OilRecord {
    /// Placeholder name for the reservoir at zero-based `index`
    #[must_use]
    pub fn default_name(index: usize) -> String {
        format!("Oil {}", index + 1)
    }

    /// Remaining share in whole percent, rounded down and clamped to 100
    ///
    /// `None` when the capacity is unknown.
    #[must_use]
    pub fn percentage(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let pct = (u32::from(self.remaining) * 100) / u32::from(self.total);
        Some(u8::try_from(pct.min(100)).unwrap_or(100))
    }
}

/// A schedule slot as stored by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Slot number, starting at 1
    pub index: u8,
    /// Slot active
    pub enabled: bool,
    /// Start hour
    pub hour_on: u8,
    /// Start minute
    pub minute_on: u8,
    /// End hour
    pub hour_off: u8,
    /// End minute
    pub minute_off: u8,
    /// Weekday mask, Sunday in bit 6 down to Saturday in bit 0
    pub repeat_days: u8,
    /// Intensity while active
    pub intensity: u8,
    /// Reservoir used (V3.0)
    pub aroma: Option<u8>,
    /// Fan runs during the slot (V3.0)
    pub fan_enabled: Option<bool>,
}

/// Lifecycle of one BLE association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport held
    Disconnected,
    /// Establishing the GATT link
    Connecting,
    /// Login handshake and identification in progress
    Authenticating,
    /// Commands accepted
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// A diffuser seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Advertised local name
    pub name: String,
    /// BLE address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// GATT connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Scan window in milliseconds
    pub scan_timeout_ms: u64,
    /// Depth of the per-session notification queue
    pub notification_queue: usize,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            scan_timeout_ms: 10_000,
            notification_queue: 64,
        }
    }
}

/// Timeouts for the handshake and commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Wait for a reply to each login form
    pub login_timeout_ms: u64,
    /// Wait for a command acknowledgment
    pub command_timeout_ms: u64,
    /// How long to collect the post-login data burst
    pub data_burst_ms: u64,
    /// Wait for replies to identity reads
    pub identity_read_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: 2_000,
            command_timeout_ms: 5_000,
            data_burst_ms: 1_500,
            identity_read_timeout_ms: 2_000,
        }
    }
}

/// Automatic reconnection after an unexpected drop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Reconnect at all
    pub enabled: bool,
    /// First backoff step in milliseconds
    pub min_interval_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_interval_ms: u64,
    /// Consecutive failures before giving up
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.min_interval_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_interval_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: 5_000,
            max_interval_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// Everything a session needs besides the transport and the address
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Connection parameters
    #[serde(default)]
    pub connection: ConnectionParams,
    /// Handshake and command timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Automatic reconnection
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Per-device configuration as entered by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// BLE address of the diffuser
    pub address: String,
    /// 4-digit password
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_password() -> String {
    DEFAULT_PASSWORD.to_string()
}

impl DeviceConfig {
    /// Create a configuration using the factory password
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: default_password(),
        }
    }

    /// Validated credential
    ///
    /// # Errors
    ///
    /// Returns [`AromaTechError::InvalidCredential`] if the password is malformed.
    pub fn credential(&self) -> Result<Credential> {
        Credential::new(&self.password)
    }
}
