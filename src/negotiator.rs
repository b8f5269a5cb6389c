//! Protocol generation and capability detection
//!
//! The login reply is the only frame every firmware sends before it knows
//! which framing the host speaks, so it doubles as the identity signature.
//! Fields pushed afterwards (name, product, limits) refine the identity until
//! the session freezes it.

use crate::error::{AromaTechError, Result};
use crate::protocol::{IdentityField, IdentityReport};
use crate::types::{Capabilities, Classification, DeviceIdentity, ProtocolVersion};
use crate::DEVICE_NAME_PATTERNS;
use tracing::{debug, warn};

/// Advertising prefixes some firmware puts in front of the product name
const VENDOR_PREFIXES: [&str; 2] = ["SA_", "SE_"];

/// Build the initial identity from a login reply's identification
///
/// # Errors
///
/// Returns [`AromaTechError::IdentityUnavailable`] if the reply carried no
/// decodable identification.
pub fn negotiate(report: Option<&IdentityReport>) -> Result<DeviceIdentity> {
    let report = report.ok_or_else(|| {
        AromaTechError::IdentityUnavailable("login reply carried no readable signature".into())
    })?;

    let identity = if report.is_legacy() {
        let mut identity = DeviceIdentity::new(ProtocolVersion::V2, Classification::Signature);
        // legacy frames carry reservoir level and battery in fixed positions
        identity.capabilities = Capabilities {
            oil_support: true,
            battery_support: true,
            ..Capabilities::default()
        };
        identity
    } else {
        match report.version_text.as_deref() {
            Some("3.0") => {
                let mut identity =
                    DeviceIdentity::new(ProtocolVersion::V3, Classification::Signature);
                if let Some(bits) = report.feature_bits {
                    identity.capabilities = Capabilities::from_feature_bits(bits);
                }
                identity
            }
            Some("2.0") => {
                let mut identity =
                    DeviceIdentity::new(ProtocolVersion::V2, Classification::Signature);
                identity.capabilities.oil_support = true;
                identity.capabilities.battery_support = true;
                identity
            }
            other => {
                warn!(
                    "Unknown firmware signature {:?}, falling back to V2.0 framing",
                    other
                );
                DeviceIdentity::new(ProtocolVersion::V2, Classification::Fallback)
            }
        }
    };

    debug!(
        "Negotiated protocol {} ({:?}), capabilities {:?}",
        identity.protocol_version, identity.classification, identity.capabilities
    );

    Ok(identity)
}

/// Fold an identity field pushed or read after login into `identity`
pub fn refine(identity: &mut DeviceIdentity, field: &IdentityField) {
    match field {
        IdentityField::DeviceName(name) => {
            identity.device_name.clone_from(name);
            if identity.product_name.is_empty() {
                if let Some(product) = known_product(name) {
                    identity.product_name = product.to_string();
                }
            }
        }
        IdentityField::ProductName(name) => identity.product_name.clone_from(name),
        IdentityField::Label(label) => identity.label = Some(label.clone()),
        IdentityField::Identifier(id) => identity.identifier = Some(id.clone()),
        IdentityField::Limits {
            max_intensity,
            custom,
        } => {
            identity.max_intensity = *max_intensity;
            if custom.is_some() {
                identity.custom_limits = *custom;
            }
        }
        IdentityField::LegacyLimits => {}
    }
}

/// Set the reservoir count from the number of reservoirs the device reported
pub fn settle_reservoirs(identity: &mut DeviceIdentity, reported: usize) {
    identity.reservoir_count = if identity.capabilities.multi_aroma {
        u8::try_from(reported.max(1)).unwrap_or(u8::MAX)
    } else {
        1
    };
}

/// Strip a vendor advertising prefix, if any
#[must_use]
pub fn strip_vendor_prefix(name: &str) -> &str {
    VENDOR_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
}

/// Match a device name against the known product names
#[must_use]
pub fn known_product(name: &str) -> Option<&'static str> {
    let name = strip_vendor_prefix(name);
    DEVICE_NAME_PATTERNS
        .iter()
        .copied()
        .find(|pattern| name.starts_with(pattern))
}
