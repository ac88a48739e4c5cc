//! Keyring file parsing
//!
//! A keyring holds the shared secrets used by the `HMAC-SHA256` mechanism:
//!
//! ```text
//! [client.admin]
//!     key = c2VjcmV0LWtleS0xMjM0NTY=
//!     expires = 1767225600
//! ```
//!
//! `expires` is optional and given in seconds since the Unix epoch.

use crate::error::{MechanismError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Shared secret of one entity
#[derive(Clone)]
pub struct SecretKey {
    secret: Bytes,
    expires: Option<SystemTime>,
}

impl SecretKey {
    pub fn new(secret: Bytes) -> Self {
        Self {
            secret,
            expires: None,
        }
    }

    pub fn from_base64(base64_str: &str) -> Result<Self> {
        let secret = STANDARD
            .decode(base64_str)
            .map_err(|e| MechanismError::InvalidKey(format!("Invalid base64 key: {}", e)))?;
        if secret.is_empty() {
            return Err(MechanismError::InvalidKey("empty key".to_string()));
        }
        Ok(Self::new(Bytes::from(secret)))
    }

    pub fn with_expiry(mut self, expires: SystemTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|t| now >= t)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// HMAC-SHA256 over the concatenation of `parts`
    pub fn sign(&self, parts: &[&[u8]]) -> Result<Bytes> {
        let mac = self.mac(parts)?;
        Ok(Bytes::from(mac.finalize().into_bytes().to_vec()))
    }

    /// Constant-time check of a signature produced by [`SecretKey::sign`]
    pub fn verify(&self, parts: &[&[u8]], signature: &[u8]) -> Result<bool> {
        let mac = self.mac(parts)?;
        Ok(mac.verify_slice(signature).is_ok())
    }

    fn mac(&self, parts: &[&[u8]]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| MechanismError::InvalidKey(format!("HMAC key error: {}", e)))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the secret itself
        f.debug_struct("SecretKey")
            .field("len", &self.secret.len())
            .field("expires", &self.expires)
            .finish()
    }
}

/// Represents a parsed keyring file
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: HashMap<String, SecretKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load keyring from file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            MechanismError::InvalidKey(format!(
                "Failed to read keyring file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_string(&content)
    }

    /// Parse keyring from string content
    pub fn from_string(content: &str) -> Result<Self> {
        let mut keyring = Keyring::new();
        let mut current_entity: Option<String> = None;
        let mut pending_expiry: HashMap<String, SystemTime> = HashMap::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let entity = line[1..line.len() - 1].trim().to_string();
                debug!("Found entity: {}", entity);
                current_entity = Some(entity);
                continue;
            }

            let Some(entity) = &current_entity else {
                warn!("Ignoring keyring line outside of any entity: {}", line);
                continue;
            };

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                match key {
                    "key" => {
                        debug!("Loading key for entity: {}", entity);
                        keyring
                            .keys
                            .insert(entity.clone(), SecretKey::from_base64(value)?);
                    }
                    "expires" => {
                        let secs: u64 = value.parse().map_err(|_| {
                            MechanismError::InvalidKey(format!(
                                "Invalid expiry for {}: {}",
                                entity, value
                            ))
                        })?;
                        pending_expiry
                            .insert(entity.clone(), UNIX_EPOCH + Duration::from_secs(secs));
                    }
                    _ => {
                        warn!("Unknown keyring field: {} = {}", key, value);
                    }
                }
            }
        }

        for (entity, expires) in pending_expiry {
            match keyring.keys.remove(&entity) {
                Some(key) => {
                    keyring.keys.insert(entity, key.with_expiry(expires));
                }
                None => warn!("Expiry given for {} which has no key", entity),
            }
        }

        debug!("Loaded {} keys from keyring", keyring.keys.len());
        Ok(keyring)
    }

    pub fn add_key(&mut self, entity: impl Into<String>, key: SecretKey) {
        self.keys.insert(entity.into(), key);
    }

    pub fn get_key(&self, entity: &str) -> Option<&SecretKey> {
        self.keys.get(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &String> {
        self.keys.keys()
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.keys.contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
