//! Device identity for cloudlink nodes.
//!
//! A device is known to the broker by the tuple
//! `{project, location, registry, device}` and proves possession of that
//! identity with credentials signed by its private key. The identity is
//! created once from configuration and never mutated.

pub mod device;
pub mod error;

pub use device::{DeviceIdentity, PrivateKeyMaterial, PRIVATE_KEY_LEN};
pub use error::{IdentityError, IdentityResult};
