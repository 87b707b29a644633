//! Device identity as registered with the cloud broker.
//!
//! Provides the immutable identity tuple a device authenticates with and the
//! private key material its credentials are signed with.

use crate::error::{IdentityError, IdentityResult};
use cloudlink_core::DeviceConfig;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a P-256 private scalar in bytes.
pub const PRIVATE_KEY_LEN: usize = 32;

/// Secret signing key bytes. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKeyMaterial {
    bytes: [u8; PRIVATE_KEY_LEN],
}

impl PrivateKeyMaterial {
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a hex key, ignoring `:` separators and whitespace as found in
    /// `openssl` dumps.
    pub fn from_hex(encoded: &str) -> IdentityResult<Self> {
        let mut cleaned: String = encoded
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .collect();

        let decoded = hex::decode(&cleaned);
        cleaned.zeroize();
        let mut decoded = decoded.map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;

        if decoded.len() != PRIVATE_KEY_LEN {
            let actual = decoded.len();
            decoded.zeroize();
            return Err(IdentityError::KeyLength {
                expected: PRIVATE_KEY_LEN,
                actual,
            });
        }

        let mut bytes = [0u8; PRIVATE_KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();

        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyMaterial(<redacted>)")
    }
}

/// Identity of one device in a cloud registry.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    project_id: String,
    location: String,
    registry_id: String,
    device_id: String,
    private_key: PrivateKeyMaterial,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        location: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
        private_key: PrivateKeyMaterial,
    ) -> IdentityResult<Self> {
        let identity = Self {
            project_id: project_id.into(),
            location: location.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
            private_key,
        };

        for (field, value) in [
            ("project_id", &identity.project_id),
            ("location", &identity.location),
            ("registry_id", &identity.registry_id),
            ("device_id", &identity.device_id),
        ] {
            validate_segment(field, value)?;
        }

        Ok(identity)
    }

    /// Build the identity from the `[device]` configuration section.
    pub fn from_config(config: &DeviceConfig) -> IdentityResult<Self> {
        let private_key = PrivateKeyMaterial::from_hex(&config.private_key)?;
        Self::new(
            config.project_id.trim(),
            config.location.trim(),
            config.registry_id.trim(),
            config.device_id.trim(),
            private_key,
        )
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn private_key(&self) -> &PrivateKeyMaterial {
        &self.private_key
    }

    /// Fully-qualified device path the broker expects as client id.
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.location, self.registry_id, self.device_id
        )
    }
}

fn validate_segment(field: &'static str, value: &str) -> IdentityResult<()> {
    if value.is_empty() {
        return Err(IdentityError::EmptyField { field });
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '#' || c == '+' || c.is_whitespace() || c.is_control())
    {
        return Err(IdentityError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
