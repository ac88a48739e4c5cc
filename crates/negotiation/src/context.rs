//! Process-wide security context
//!
//! Built once at startup and handed to whatever code creates sessions. It
//! owns the negotiation policy, the mechanism registry, the inbound handler
//! table, and the gate shared by every session of the process.

use crate::dispatcher::{HandlerRegistry, NegotiationDispatcher, RpcHandler};
use crate::error::{Error, Result};
use crate::gate::AuthenticationGate;
use crate::rpc::{RpcCode, Whitelist, RPC_NEGOTIATION};
use crate::session::RpcSession;
use crate::transport::{spawn_reader, ChannelTransport, Transport};
use crate::NegotiationConfig;
use auth::{Keyring, MechanismRegistry, Role, SharedKeyFactory};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SecurityContext {
    config: Arc<NegotiationConfig>,
    mechanisms: Arc<MechanismRegistry>,
    handlers: Arc<HandlerRegistry>,
    gate: Arc<AuthenticationGate>,
}

impl SecurityContext {
    pub async fn new(config: NegotiationConfig, mechanisms: MechanismRegistry) -> Self {
        Self::with_whitelist(config, mechanisms, Whitelist::default()).await
    }

    pub async fn with_whitelist(
        config: NegotiationConfig,
        mechanisms: MechanismRegistry,
        whitelist: Whitelist,
    ) -> Self {
        let dispatcher = Arc::new(NegotiationDispatcher::new());
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(RPC_NEGOTIATION, dispatcher.clone()).await;
        Self::build(config, mechanisms, whitelist, Some(dispatcher), handlers)
    }

    /// A process that predates negotiation: no `RPC_NEGOTIATION` handler
    /// and no gate on its server sessions
    pub fn without_negotiation_service(
        config: NegotiationConfig,
        mechanisms: MechanismRegistry,
    ) -> Self {
        Self::build(
            config,
            mechanisms,
            Whitelist::default(),
            None,
            Arc::new(HandlerRegistry::new()),
        )
    }

    fn build(
        config: NegotiationConfig,
        mechanisms: MechanismRegistry,
        whitelist: Whitelist,
        dispatcher: Option<Arc<NegotiationDispatcher>>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let mechanisms = Arc::new(mechanisms);
        let gate = Arc::new(AuthenticationGate::new(
            config.clone(),
            mechanisms.clone(),
            whitelist,
            dispatcher,
        ));
        Self {
            config,
            mechanisms,
            handlers,
            gate,
        }
    }

    /// Build a context from configuration, registering the shared-key
    /// mechanism for `entity` when a keyring is configured
    pub async fn from_config(config: NegotiationConfig, entity: &str) -> Result<Self> {
        config.validate().map_err(|e| Error::config_error(&e))?;
        let mut mechanisms = MechanismRegistry::new();
        if let Some(path) = &config.keyring {
            let keyring = Keyring::from_file(path).map_err(|e| {
                Error::config_error(&format!("Failed to load keyring {}: {}", path.display(), e))
            })?;
            info!(
                "loaded keyring {} with {} entities",
                path.display(),
                keyring.len()
            );
            mechanisms.register(Arc::new(SharedKeyFactory::new(Arc::new(keyring), entity)));
        }
        Ok(Self::new(config, mechanisms).await)
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn mechanisms(&self) -> &MechanismRegistry {
        &self.mechanisms
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn gate(&self) -> &Arc<AuthenticationGate> {
        &self.gate
    }

    pub async fn register_handler(&self, code: RpcCode, handler: Arc<dyn RpcHandler>) {
        self.handlers.register(code, handler).await;
    }

    /// Create a session over `transport` and start its negotiation
    pub async fn connect(
        &self,
        role: Role,
        remote: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<RpcSession>> {
        let session = RpcSession::new(
            role,
            remote,
            transport,
            self.gate.clone(),
            self.handlers.clone(),
        );
        debug!("{}: new {} session {}", remote, role, session.id());
        self.gate.on_session_connected(&session).await?;
        Ok(session)
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("config", &self.config)
            .field("mechanisms", &self.mechanisms.names())
            .finish_non_exhaustive()
    }
}

/// Connect a client context to a server context over in-process channels
///
/// Returns `(client_session, server_session)`; the client has already sent
/// its first round.
pub async fn loopback(
    client: &SecurityContext,
    server: &SecurityContext,
) -> Result<(Arc<RpcSession>, Arc<RpcSession>)> {
    const CLIENT_ADDR: &str = "127.0.0.1:34801";
    const SERVER_ADDR: &str = "127.0.0.1:34601";

    let (to_server, server_rx) = ChannelTransport::channel(SERVER_ADDR);
    let (to_client, client_rx) = ChannelTransport::channel(CLIENT_ADDR);

    let server_session = server
        .connect(Role::Server, CLIENT_ADDR, Arc::new(to_client))
        .await?;
    spawn_reader(&server_session, server_rx);

    let client_session = client
        .connect(Role::Client, SERVER_ADDR, Arc::new(to_server))
        .await?;
    spawn_reader(&client_session, client_rx);

    Ok((client_session, server_session))
}
