//! Credential issuance for cloudlink devices.
//!
//! This crate turns a device identity and a trusted time into the
//! short-lived signed tokens the broker accepts as authentication, and
//! decides when an issued token must be replaced.
//!
//! # Supported Algorithms
//!
//! - **Signatures**: ECDSA P-256 with SHA-256 (`ES256` in the token header)
//! - **Key identifiers**: BLAKE3 of the compressed public key
//!
//! # Security Principles
//!
//! - Never issue a credential without trusted time
//! - Secrets must never be logged
//! - Refresh strictly before hard expiry

pub mod credential;

pub use credential::{
    Credential, CredentialError, CredentialIssuer, CredentialPolicy, CredentialResult,
    TokenClaims, TOKEN_ALGORITHM,
};
