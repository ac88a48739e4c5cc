//! Inbound RPC routing
//!
//! [`HandlerRegistry`] maps RPC codes to handlers. [`NegotiationDispatcher`]
//! is the handler for `RPC_NEGOTIATION` on servers: it only accepts requests
//! from sessions that registered a server negotiation at connect time.

use crate::error::{Error, Result};
use crate::rpc::{rpc_code_name, RpcCode, RpcMessage, RpcStatus};
use crate::session::{RpcSession, SessionId};
use crate::state_machine::NegotiationSession;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Implement this to receive admitted messages of a code
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, session: &Arc<RpcSession>, msg: RpcMessage) -> Result<()>;
}

/// RPC code -> handler
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<RpcCode, Arc<dyn RpcHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `code`, replacing any previous one
    pub async fn register(&self, code: RpcCode, handler: Arc<dyn RpcHandler>) {
        self.handlers.write().await.insert(code, handler);
    }

    pub async fn unregister(&self, code: RpcCode) -> bool {
        self.handlers.write().await.remove(&code).is_some()
    }

    pub async fn has_handler(&self, code: RpcCode) -> bool {
        self.handlers.read().await.contains_key(&code)
    }

    /// Hand `msg` to its handler
    ///
    /// A request nobody handles is answered with `HandlerNotFound` under the
    /// request's own code; an unhandled response is dropped.
    pub async fn dispatch(&self, session: &Arc<RpcSession>, msg: RpcMessage) -> Result<()> {
        let handler = self.handlers.read().await.get(&msg.code).cloned();
        match handler {
            Some(handler) => handler.handle(session, msg).await,
            None if msg.is_response => {
                debug!(
                    "{}: dropping response {} seq {} without handler",
                    session.remote(),
                    rpc_code_name(msg.code),
                    msg.seq
                );
                Ok(())
            }
            None => {
                debug!(
                    "{}: no handler for {} (0x{:04x})",
                    session.remote(),
                    rpc_code_name(msg.code),
                    msg.code
                );
                let reply = msg.response(msg.code, RpcStatus::HandlerNotFound, Bytes::new());
                session.send(reply).await.map(|_| ())
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes `RPC_NEGOTIATION` requests to the per-session server negotiation
#[derive(Debug, Default)]
pub struct NegotiationDispatcher {
    sessions: Mutex<HashMap<SessionId, Weak<RpcSession>>>,
}

impl NegotiationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: &Arc<RpcSession>) {
        debug!("register negotiation for session {}", session.id());
        self.lock().insert(session.id(), Arc::downgrade(session));
    }

    pub fn unregister(&self, id: SessionId) {
        if self.lock().remove(&id).is_some() {
            debug!("unregister negotiation for session {}", id);
        }
    }

    pub fn is_registered(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Weak<RpcSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, session: &Arc<RpcSession>) -> Option<Arc<RpcSession>> {
        self.lock()
            .get(&session.id())
            .and_then(Weak::upgrade)
            .filter(|registered| Arc::ptr_eq(registered, session))
    }
}

#[async_trait]
impl RpcHandler for NegotiationDispatcher {
    async fn handle(&self, session: &Arc<RpcSession>, msg: RpcMessage) -> Result<()> {
        let Some(session) = self.lookup(session) else {
            let err = Error::NoNegotiation(session.id().to_string());
            warn!(
                "{}: negotiation request without a registered negotiation: {}",
                session.remote(),
                err
            );
            session.on_protocol_violation(err.clone()).await;
            return Err(err);
        };
        session.handle_negotiation_request(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RPC_NEGOTIATION;

    #[tokio::test]
    async fn test_register_replaces() {
        let registry = HandlerRegistry::new();
        assert!(!registry.has_handler(RPC_NEGOTIATION).await);

        registry
            .register(RPC_NEGOTIATION, Arc::new(NegotiationDispatcher::new()))
            .await;
        registry
            .register(RPC_NEGOTIATION, Arc::new(NegotiationDispatcher::new()))
            .await;
        assert!(registry.has_handler(RPC_NEGOTIATION).await);

        assert!(registry.unregister(RPC_NEGOTIATION).await);
        assert!(!registry.unregister(RPC_NEGOTIATION).await);
    }

    #[test]
    fn test_empty_dispatcher() {
        let dispatcher = NegotiationDispatcher::new();
        assert!(dispatcher.is_empty());
        assert!(!dispatcher.is_registered(SessionId::new()));
        dispatcher.unregister(SessionId::new());
        assert_eq!(dispatcher.len(), 0);
    }
}
