//! Authentication mechanisms for connection negotiation
//!
//! This crate provides the mechanism side of the connection handshake: the
//! [`MechanismAdapter`] contract that a SASL-style mechanism implements, a
//! registry of mechanism factories, username canonicalization, and two
//! concrete mechanisms:
//!
//! - `HMAC-SHA256`: keyring-backed mutual challenge-response, usable
//!   without a Kerberos realm
//! - a scripted mechanism with a fixed number of rounds, used by tests and
//!   dry runs
//!
//! GSSAPI itself is provided by an external adapter implementing the same
//! traits.
//!
//! # Example
//!
//! ```rust
//! use auth::{Keyring, MechanismRegistry, Role, SharedKeyFactory};
//! use std::sync::Arc;
//!
//! let keyring = Keyring::from_string("[client.admin]\nkey = c2VjcmV0LWtleS0xMjM0NTY=\n")?;
//! let mut registry = MechanismRegistry::new();
//! registry.register(Arc::new(SharedKeyFactory::new(Arc::new(keyring), "client.admin")));
//!
//! let mut mechanism = registry.init("HMAC-SHA256", Role::Client)?;
//! let step = mechanism.start("HMAC-SHA256", None)?;
//! assert!(!step.is_complete());
//! # Ok::<(), auth::MechanismError>(())
//! ```

pub mod error;
pub mod keyring;
pub mod mechanism;
pub mod principal;
pub mod registry;
pub mod scripted;
pub mod shared_key;

pub use error::*;
pub use keyring::{Keyring, SecretKey};
pub use mechanism::{ActiveMechanism, MechanismAdapter, MechanismFactory, MechanismStatus, MechanismStep, Role};
pub use principal::{canonicalize_username, UNKNOWN_USER};
pub use registry::MechanismRegistry;
pub use scripted::{Script, ScriptedFactory};
pub use shared_key::{SharedKeyFactory, SHARED_KEY_MECHANISM};

/// Name of the Kerberos mechanism preferred by default
pub const GSSAPI_MECHANISM: &str = "GSSAPI";
