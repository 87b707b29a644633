//! Time-bound device credentials.
//!
//! This module issues the short-lived signed tokens a device presents to the
//! broker as its password. It provides:
//!
//! - A fixed validity window (`expires_at = issued_at + validity`)
//! - A refresh policy that fires a safety margin before hard expiry
//! - Verification of the issuer's own tokens for diagnostics
//!
//! # Token format
//!
//! Compact JWT signed with ES256 (ECDSA over P-256 with SHA-256):
//!
//! ```text
//! header  {"typ":"JWT","alg":"ES256","kid":<key id>}
//! claims  {"iat":<issued_at>,"exp":<expires_at>,"aud":<project_id>}
//! ```
//!
//! # Security Model
//!
//! - Tokens are only issued against a trusted clock
//! - A refresh always issues a new token; old tokens are never reused
//! - Private key bytes and tokens never appear in `Debug` output or logs

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cloudlink_core::{CredentialConfig, DeviceClock};
use cloudlink_identity::DeviceIdentity;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroize;

/// JOSE algorithm of issued tokens.
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::ES256;

/// Errors that can occur while issuing or checking credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Cannot issue credential: clock is not trusted")]
    UntrustedClock,

    #[error("Invalid credential policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid P-256 private key: {0}")]
    InvalidKey(String),

    #[error("Expiry overflows for issue time {issued_at}")]
    TimeOverflow { issued_at: u64 },

    #[error("Token encoding failed: {0}")]
    Encoding(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token signed by unknown key: {0}")]
    KeyMismatch(String),

    #[error("Token signature verification failed")]
    SignatureInvalid,

    #[error("Token audience is not {expected}")]
    AudienceMismatch { expected: String },
}

/// Result type for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Validity window and refresh margin for issued credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    validity_secs: u64,
    refresh_margin_secs: u64,
}

impl CredentialPolicy {
    pub fn new(validity_secs: u64, refresh_margin_secs: u64) -> CredentialResult<Self> {
        if validity_secs == 0 {
            return Err(CredentialError::InvalidPolicy(
                "validity must be positive".to_string(),
            ));
        }
        if refresh_margin_secs >= validity_secs {
            return Err(CredentialError::InvalidPolicy(format!(
                "refresh margin {refresh_margin_secs}s must be below validity {validity_secs}s"
            )));
        }

        Ok(Self {
            validity_secs,
            refresh_margin_secs,
        })
    }

    pub fn from_config(config: &CredentialConfig) -> CredentialResult<Self> {
        Self::new(config.validity_secs, config.refresh_margin_secs)
    }

    pub fn validity_secs(&self) -> u64 {
        self.validity_secs
    }

    pub fn refresh_margin_secs(&self) -> u64 {
        self.refresh_margin_secs
    }

    /// True once `now` is within the refresh margin of expiry.
    pub fn needs_refresh(&self, credential: &Credential, now: u64) -> bool {
        now >= credential
            .expires_at
            .saturating_sub(self.refresh_margin_secs)
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            validity_secs: 3600,
            refresh_margin_secs: 300,
        }
    }
}

/// A signed token with its validity window.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    issued_at: u64,
    expires_at: u64,
    token: String,
}

impl Credential {
    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Signed representation presented to the broker.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

/// Claims carried by a device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iat: u64,
    pub exp: u64,
    pub aud: String,
}

/// Issues credentials for a single device identity.
pub struct CredentialIssuer {
    identity: DeviceIdentity,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key: PublicKey,
    key_id: String,
    policy: CredentialPolicy,
}

impl CredentialIssuer {
    /// Fails if the identity's key bytes are not a valid P-256 scalar.
    pub fn new(identity: DeviceIdentity, policy: CredentialPolicy) -> CredentialResult<Self> {
        let secret_key = SecretKey::from_slice(identity.private_key().as_bytes())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        let pkcs8 = secret_key
            .to_pkcs8_der()
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_der(pkcs8.as_bytes());

        let public_key = secret_key.public_key();
        let decoding_key = Self::decoding_key(&public_key)?;
        let key_id = Self::generate_key_id(&public_key);

        Ok(Self {
            identity,
            encoding_key,
            decoding_key,
            public_key,
            key_id,
            policy,
        })
    }

    fn decoding_key(public_key: &PublicKey) -> CredentialResult<DecodingKey> {
        let point = public_key.to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(CredentialError::InvalidKey(
                "public key is the identity point".to_string(),
            ));
        };

        DecodingKey::from_ec_components(&URL_SAFE_NO_PAD.encode(x), &URL_SAFE_NO_PAD.encode(y))
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))
    }

    /// Generates a stable public key identifier from a public key.
    fn generate_key_id(public_key: &PublicKey) -> String {
        let hash = blake3::hash(public_key.to_encoded_point(true).as_bytes());
        // Use first 16 bytes as hex string
        hex::encode(&hash.as_bytes()[..16])
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Issue a credential valid from `now` for the policy's validity window.
    pub fn issue(&self, now: u64) -> CredentialResult<Credential> {
        let expires_at = now
            .checked_add(self.policy.validity_secs)
            .ok_or(CredentialError::TimeOverflow { issued_at: now })?;

        let mut header = Header::new(TOKEN_ALGORITHM);
        header.kid = Some(self.key_id.clone());
        let claims = TokenClaims {
            iat: now,
            exp: expires_at,
            aud: self.identity.project_id().to_string(),
        };

        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| CredentialError::Encoding(e.to_string()))?;

        info!(
            device_id = self.identity.device_id(),
            issued_at = now,
            expires_at,
            "Issued device credential"
        );

        Ok(Credential {
            issued_at: now,
            expires_at,
            token,
        })
    }

    /// Issue a credential at the clock's current time.
    pub fn issue_from(&self, clock: &DeviceClock) -> CredentialResult<Credential> {
        let now = clock.now().ok_or(CredentialError::UntrustedClock)?;
        self.issue(now)
    }

    pub fn needs_refresh(&self, credential: &Credential, now: u64) -> bool {
        self.policy.needs_refresh(credential, now)
    }

    /// Check a token's algorithm, key id, signature and audience, returning
    /// its claims. Expiry is judged against the device clock, not here.
    pub fn verify_token(&self, token: &str) -> CredentialResult<TokenClaims> {
        let header =
            decode_header(token).map_err(|e| CredentialError::MalformedToken(e.to_string()))?;
        if header.alg != TOKEN_ALGORITHM {
            return Err(CredentialError::MalformedToken(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }
        match header.kid {
            Some(kid) if kid == self.key_id => {}
            other => return Err(CredentialError::KeyMismatch(other.unwrap_or_default())),
        }

        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_audience(&[self.identity.project_id()]);
        validation.set_required_spec_claims(&["exp", "aud"]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => CredentialError::SignatureInvalid,
                ErrorKind::InvalidAudience => CredentialError::AudienceMismatch {
                    expected: self.identity.project_id().to_string(),
                },
                _ => CredentialError::MalformedToken(e.to_string()),
            })
    }
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("device_id", &self.identity.device_id())
            .field("key_id", &self.key_id)
            .field("policy", &self.policy)
            .finish()
    }
}
