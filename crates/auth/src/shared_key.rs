//! `HMAC-SHA256` shared-key mechanism
//!
//! Mutual challenge-response over a secret both ends find in their keyring:
//!
//! ```text
//! client start   -> entity \0 client_nonce                      (Incomplete)
//! server start   -> server_nonce | HMAC(k, "server" cn sn)      (Incomplete)
//! client step    -> HMAC(k, "client" sn cn)                     (Ok)
//! server step    -> verifies the client proof                   (Ok)
//! ```
//!
//! The client checks the server proof before answering, so a server that
//! does not hold the key cannot complete the exchange.

use crate::error::{MechanismError, Result};
use crate::keyring::{Keyring, SecretKey};
use crate::mechanism::{MechanismAdapter, MechanismFactory, MechanismStep, Role};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SHARED_KEY_MECHANISM: &str = "HMAC-SHA256";

const NONCE_LEN: usize = 16;
const PROOF_LEN: usize = 32;
const SERVER_LABEL: &[u8] = b"server";
const CLIENT_LABEL: &[u8] = b"client";

fn new_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn check_expiry(entity: &str, key: &SecretKey) -> Result<()> {
    if key.is_expired() {
        return Err(MechanismError::TicketExpired(format!(
            "key for {} is past its expiry",
            entity
        )));
    }
    Ok(())
}

/// Factory for `HMAC-SHA256` mechanism instances
///
/// Clients authenticate as `entity`; servers accept any entity in the
/// keyring.
#[derive(Debug, Clone)]
pub struct SharedKeyFactory {
    keyring: Arc<Keyring>,
    entity: String,
}

impl SharedKeyFactory {
    pub fn new(keyring: Arc<Keyring>, entity: impl Into<String>) -> Self {
        Self {
            keyring,
            entity: entity.into(),
        }
    }
}

impl MechanismFactory for SharedKeyFactory {
    fn mechanism(&self) -> &str {
        SHARED_KEY_MECHANISM
    }

    fn init(&self, role: Role) -> Result<Box<dyn MechanismAdapter>> {
        match role {
            Role::Client => {
                let key = self.keyring.get_key(&self.entity).ok_or_else(|| {
                    MechanismError::InitFailed(format!("no key for {} in keyring", self.entity))
                })?;
                Ok(Box::new(SharedKeyClient {
                    entity: self.entity.clone(),
                    key: key.clone(),
                    state: ClientState::Fresh,
                }))
            }
            Role::Server => {
                if self.keyring.is_empty() {
                    return Err(MechanismError::InitFailed("keyring is empty".to_string()));
                }
                Ok(Box::new(SharedKeyServer {
                    keyring: self.keyring.clone(),
                    state: ServerState::Fresh,
                }))
            }
        }
    }
}

#[derive(Debug)]
enum ClientState {
    Fresh,
    AwaitingServerProof { client_nonce: [u8; NONCE_LEN] },
    Done,
}

#[derive(Debug)]
pub struct SharedKeyClient {
    entity: String,
    key: SecretKey,
    state: ClientState,
}

impl MechanismAdapter for SharedKeyClient {
    fn mechanism(&self) -> &str {
        SHARED_KEY_MECHANISM
    }

    fn role(&self) -> Role {
        Role::Client
    }

    fn start(&mut self, mechanism: &str, _input: Option<&[u8]>) -> Result<MechanismStep> {
        if mechanism != SHARED_KEY_MECHANISM {
            return Err(MechanismError::UnknownMechanism(mechanism.to_string()));
        }
        if !matches!(self.state, ClientState::Fresh) {
            return Err(MechanismError::InvalidState("start called twice".to_string()));
        }
        check_expiry(&self.entity, &self.key)?;

        let client_nonce = new_nonce();
        let mut token = BytesMut::with_capacity(self.entity.len() + 1 + NONCE_LEN);
        token.put_slice(self.entity.as_bytes());
        token.put_u8(0);
        token.put_slice(&client_nonce);

        debug!(
            "shared-key client {} sent nonce {}",
            self.entity,
            hex::encode(client_nonce)
        );
        self.state = ClientState::AwaitingServerProof { client_nonce };
        Ok(MechanismStep::incomplete(token.freeze()))
    }

    fn step(&mut self, input: &[u8]) -> Result<MechanismStep> {
        let ClientState::AwaitingServerProof { client_nonce } = self.state else {
            return Err(MechanismError::InvalidState(format!(
                "unexpected token in state {:?}",
                self.state
            )));
        };
        if input.len() != NONCE_LEN + PROOF_LEN {
            return Err(MechanismError::StepFailed(format!(
                "server token has {} bytes, expected {}",
                input.len(),
                NONCE_LEN + PROOF_LEN
            )));
        }
        let (server_nonce, server_proof) = input.split_at(NONCE_LEN);

        if !self
            .key
            .verify(&[SERVER_LABEL, &client_nonce, server_nonce], server_proof)?
        {
            warn!("shared-key client {}: server proof mismatch", self.entity);
            return Err(MechanismError::StepFailed(
                "server failed to prove knowledge of the shared key".to_string(),
            ));
        }

        let proof = self.key.sign(&[CLIENT_LABEL, server_nonce, &client_nonce])?;
        self.state = ClientState::Done;
        Ok(MechanismStep::ok(proof))
    }

    fn retrieve_principal(&self) -> Result<String> {
        match self.state {
            ClientState::Done => Ok(self.entity.clone()),
            _ => Err(MechanismError::NoPrincipal(
                "exchange not complete".to_string(),
            )),
        }
    }
}

#[derive(Debug)]
enum ServerState {
    Fresh,
    AwaitingClientProof {
        entity: String,
        key: SecretKey,
        client_nonce: Bytes,
        server_nonce: [u8; NONCE_LEN],
    },
    Done {
        entity: String,
    },
}

#[derive(Debug)]
pub struct SharedKeyServer {
    keyring: Arc<Keyring>,
    state: ServerState,
}

impl MechanismAdapter for SharedKeyServer {
    fn mechanism(&self) -> &str {
        SHARED_KEY_MECHANISM
    }

    fn role(&self) -> Role {
        Role::Server
    }

    fn start(&mut self, mechanism: &str, input: Option<&[u8]>) -> Result<MechanismStep> {
        if mechanism != SHARED_KEY_MECHANISM {
            return Err(MechanismError::UnknownMechanism(mechanism.to_string()));
        }
        if !matches!(self.state, ServerState::Fresh) {
            return Err(MechanismError::InvalidState("start called twice".to_string()));
        }
        let input = input.unwrap_or_default();
        let sep = input
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MechanismError::StepFailed("malformed client token".to_string()))?;
        let (name, rest) = input.split_at(sep);
        let client_nonce = &rest[1..];
        if client_nonce.len() != NONCE_LEN {
            return Err(MechanismError::StepFailed(format!(
                "client nonce has {} bytes, expected {}",
                client_nonce.len(),
                NONCE_LEN
            )));
        }
        let entity = std::str::from_utf8(name)
            .map_err(|_| MechanismError::StepFailed("entity name is not utf-8".to_string()))?
            .to_string();
        let key = self
            .keyring
            .get_key(&entity)
            .ok_or_else(|| MechanismError::StepFailed(format!("unknown entity {}", entity)))?
            .clone();
        check_expiry(&entity, &key)?;

        let server_nonce = new_nonce();
        let proof = key.sign(&[SERVER_LABEL, client_nonce, &server_nonce])?;
        let mut token = BytesMut::with_capacity(NONCE_LEN + PROOF_LEN);
        token.put_slice(&server_nonce);
        token.put_slice(&proof);

        debug!("shared-key server challenging {}", entity);
        self.state = ServerState::AwaitingClientProof {
            entity,
            key,
            client_nonce: Bytes::copy_from_slice(client_nonce),
            server_nonce,
        };
        Ok(MechanismStep::incomplete(token.freeze()))
    }

    fn step(&mut self, input: &[u8]) -> Result<MechanismStep> {
        let ServerState::AwaitingClientProof {
            entity,
            key,
            client_nonce,
            server_nonce,
        } = &self.state
        else {
            return Err(MechanismError::InvalidState(
                "no challenge outstanding".to_string(),
            ));
        };
        if !key.verify(&[CLIENT_LABEL, server_nonce, client_nonce], input)? {
            warn!("shared-key server: proof from {} rejected", entity);
            return Err(MechanismError::StepFailed(format!(
                "invalid proof from {}",
                entity
            )));
        }
        self.state = ServerState::Done {
            entity: entity.clone(),
        };
        Ok(MechanismStep::ok(Bytes::new()))
    }

    fn retrieve_principal(&self) -> Result<String> {
        match &self.state {
            ServerState::Done { entity } => Ok(entity.clone()),
            _ => Err(MechanismError::NoPrincipal(
                "exchange not complete".to_string(),
            )),
        }
    }
}
