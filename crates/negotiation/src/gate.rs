//! Session lifecycle hooks that bind a negotiation to each session

use crate::client::ClientNegotiation;
use crate::dispatcher::NegotiationDispatcher;
use crate::error::Result;
use crate::rpc::{RpcCode, Whitelist};
use crate::server::ServerNegotiation;
use crate::session::{RpcSession, SessionId};
use crate::state_machine::{apply_result, Negotiation, Outcome};
use crate::status::NegotiationStatus;
use crate::NegotiationConfig;
use auth::{MechanismRegistry, Role};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates, starts, and tears down the negotiation of every session
#[derive(Debug)]
pub struct AuthenticationGate {
    config: Arc<NegotiationConfig>,
    mechanisms: Arc<MechanismRegistry>,
    whitelist: Whitelist,
    dispatcher: Option<Arc<NegotiationDispatcher>>,
}

impl AuthenticationGate {
    /// `dispatcher` is `None` for a process without the negotiation
    /// service; its server sessions are never gated.
    pub fn new(
        config: Arc<NegotiationConfig>,
        mechanisms: Arc<MechanismRegistry>,
        whitelist: Whitelist,
        dispatcher: Option<Arc<NegotiationDispatcher>>,
    ) -> Self {
        Self {
            config,
            mechanisms,
            whitelist,
            dispatcher,
        }
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Whether a message with `code` may pass a session in `status`
    pub fn admits(&self, status: NegotiationStatus, code: RpcCode) -> bool {
        status.is_open() || self.whitelist.allows(code)
    }

    fn create_negotiation(&self, role: Role, remote: &str) -> Negotiation {
        match role {
            Role::Client => Negotiation::Client(ClientNegotiation::new(
                remote,
                self.config.clone(),
                self.mechanisms.clone(),
            )),
            Role::Server => Negotiation::Server(ServerNegotiation::new(
                remote,
                self.config.clone(),
                self.mechanisms.clone(),
            )),
        }
    }

    /// Bind a fresh negotiation to `session` and run its first step
    pub async fn on_session_connected(&self, session: &Arc<RpcSession>) -> Result<()> {
        let skip = match session.role() {
            Role::Server if self.dispatcher.is_none() => Some("no negotiation service"),
            Role::Client if !self.config.enable_auth => Some("authentication disabled locally"),
            _ => None,
        };
        if let Some(reason) = skip {
            info!("{}: {}, session is unauthenticated", session.remote(), reason);
            session.complete_negotiation(Outcome::Disabled).await;
            return Ok(());
        }

        let mut negotiation = self.create_negotiation(session.role(), session.remote());
        let first = negotiation.start();
        session.install_negotiation(negotiation);
        if let Some(dispatcher) = &self.dispatcher {
            if session.role() == Role::Server {
                dispatcher.register(session);
            }
        }
        debug!("{}: {} negotiation installed", session.remote(), session.role());
        apply_result(session.as_ref(), first).await
    }

    pub fn on_session_destroyed(&self, id: SessionId) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RPC_FD_FAILURE_DETECTOR_PING, RPC_NEGOTIATION};

    #[test]
    fn test_admits() {
        let gate = AuthenticationGate::new(
            Arc::new(NegotiationConfig::default()),
            Arc::new(MechanismRegistry::new()),
            Whitelist::default(),
            None,
        );
        let app_code = 0x1001;
        for status in [
            NegotiationStatus::Invalid,
            NegotiationStatus::ListMechanisms,
            NegotiationStatus::Challenge,
            NegotiationStatus::AuthFailed,
        ] {
            assert!(!gate.admits(status, app_code), "{}", status);
            assert!(gate.admits(status, RPC_NEGOTIATION));
            assert!(gate.admits(status, RPC_FD_FAILURE_DETECTOR_PING));
        }
        assert!(gate.admits(NegotiationStatus::Succeeded, app_code));
        assert!(gate.admits(NegotiationStatus::AuthDisabled, app_code));
    }
}
