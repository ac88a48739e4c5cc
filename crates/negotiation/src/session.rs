//! An RPC session gated on its negotiation
//!
//! The session owns its negotiation and a pending queue. Both the delivery
//! path and application senders go through one lock over the trust status
//! and the queue; that lock is never held across a transport send.
//!
//! Completion is one-shot. On success the queue is swapped out and replayed
//! in order while new sends keep queueing behind the replay; on failure the
//! queue is released and the session is closed.

use crate::dispatcher::HandlerRegistry;
use crate::error::{Error, Result};
use crate::gate::AuthenticationGate;
use crate::message::NegotiationMessage;
use crate::pending::PendingMessageQueue;
use crate::rpc::{
    rpc_code_name, RpcMessage, RpcStatus, RPC_NEGOTIATION, RPC_NEGOTIATION_ACK,
};
use crate::state_machine::{apply_result, Negotiation, NegotiationSession, Outcome, StateResult};
use crate::status::NegotiationStatus;
use crate::transport::Transport;
use async_trait::async_trait;
use auth::Role;
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Process-unique session identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to an application message handed to [`RpcSession::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Passed to the transport
    Sent,
    /// Held in the pending queue; the session owns it now
    Queued,
}

#[derive(Debug)]
struct AuthState {
    status: NegotiationStatus,
    user_name: Option<String>,
    pending: PendingMessageQueue<RpcMessage>,
    completed: bool,
    replaying: bool,
    closed: bool,
}

pub struct RpcSession {
    id: SessionId,
    role: Role,
    remote: String,
    transport: Arc<dyn Transport>,
    gate: Arc<AuthenticationGate>,
    handlers: Arc<HandlerRegistry>,
    auth: Mutex<AuthState>,
    negotiation: Mutex<Option<Negotiation>>,
    outcome: Mutex<Option<Outcome>>,
    negotiated: Notify,
    next_seq: AtomicU64,
    /// seq of the negotiation request being answered (server)
    negotiation_seq: AtomicU64,
}

impl RpcSession {
    pub fn new(
        role: Role,
        remote: &str,
        transport: Arc<dyn Transport>,
        gate: Arc<AuthenticationGate>,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            role,
            remote: remote.to_string(),
            transport,
            gate,
            handlers,
            auth: Mutex::new(AuthState {
                status: NegotiationStatus::Invalid,
                user_name: None,
                pending: PendingMessageQueue::new(),
                completed: false,
                replaying: false,
                closed: false,
            }),
            negotiation: Mutex::new(None),
            outcome: Mutex::new(None),
            negotiated: Notify::new(),
            next_seq: AtomicU64::new(0),
            negotiation_seq: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Trust status of the session
    pub fn status(&self) -> NegotiationStatus {
        self.state().status
    }

    /// Canonical user once the gate is open, `unknown` for an
    /// unauthenticated session
    pub fn user_name(&self) -> Option<String> {
        self.state().user_name.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().status == NegotiationStatus::Succeeded
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// Status of the negotiation driver, `None` once the session is closed
    pub fn negotiation_status(&self) -> Option<NegotiationStatus> {
        self.slot().as_ref().map(Negotiation::status)
    }

    pub fn selected_mechanism(&self) -> Option<String> {
        self.slot()
            .as_ref()
            .and_then(|n| n.selected_mechanism().map(str::to_string))
    }

    /// Outcome of the handshake if it already finished
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the handshake to finish
    pub async fn wait_negotiated(&self) -> Outcome {
        loop {
            let notified = self.negotiated.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    fn publish_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.negotiated.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, AuthState> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self) -> MutexGuard<'_, Option<Negotiation>> {
        self.negotiation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn install_negotiation(&self, negotiation: Negotiation) {
        *self.slot() = Some(negotiation);
    }

    /// Run one driver step against the owned negotiation
    fn drive(&self, f: impl FnOnce(&mut Negotiation) -> StateResult) -> Result<StateResult> {
        let mut slot = self.slot();
        match slot.as_mut() {
            Some(negotiation) => Ok(f(negotiation)),
            None => Err(Error::NoNegotiation(self.id.to_string())),
        }
    }

    /// Send an application message
    ///
    /// Whitelisted codes always go straight to the transport. Anything else
    /// is queued until the gate opens and every earlier queued message has
    /// been replayed.
    pub async fn send(&self, mut msg: RpcMessage) -> Result<SendStatus> {
        if !msg.is_response {
            msg.seq = self.next_seq();
        }
        {
            let mut state = self.state();
            if state.closed {
                return Err(Error::disconnected(&format!(
                    "session to {} is closed",
                    self.remote
                )));
            }
            if !self.gate.whitelist().allows(msg.code)
                && (!state.status.is_open() || state.replaying)
            {
                trace!(
                    "{}: queue {} seq {} while {}",
                    self.remote,
                    rpc_code_name(msg.code),
                    msg.seq,
                    state.status
                );
                state.pending.push(msg);
                return Ok(SendStatus::Queued);
            }
        }
        self.transport.send(msg).await?;
        Ok(SendStatus::Sent)
    }

    /// Handle one inbound message
    ///
    /// Callers deliver the messages of a session one at a time.
    pub async fn deliver(self: &Arc<Self>, mut msg: RpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::disconnected(&format!(
                "session to {} is closed",
                self.remote
            )));
        }

        if self.role == Role::Client
            && msg.is_response
            && matches!(msg.code, RPC_NEGOTIATION | RPC_NEGOTIATION_ACK)
        {
            return self.handle_negotiation_response(msg).await;
        }

        let mut status = self.status();
        if !self.gate.admits(status, msg.code) && self.role == Role::Server && !msg.is_response {
            self.try_legacy_fallback().await;
            status = self.status();
        }

        if !self.gate.admits(status, msg.code) {
            let err = Error::Unauthenticated(format!(
                "{} from {} while {}",
                rpc_code_name(msg.code),
                self.remote,
                status
            ));
            warn!("{}", err);
            if !msg.is_response {
                let reply = msg.response(msg.code, RpcStatus::Rejected, Bytes::new());
                if let Err(e) = self.transport.send(reply).await {
                    debug!("{}: failed to send rejection: {}", self.remote, e);
                }
            }
            return Err(err);
        }

        if status.is_open() {
            msg.user_name = self.user_name();
        }
        self.handlers.dispatch(self, msg).await
    }

    async fn try_legacy_fallback(&self) {
        let result = self.drive(|negotiation| match negotiation {
            Negotiation::Server(server) => server.on_legacy_traffic(),
            Negotiation::Client(_) => StateResult::Continue,
        });
        if let Ok(result) = result {
            if let Err(e) = apply_result(self, result).await {
                debug!("{}: legacy fallback failed: {}", self.remote, e);
            }
        }
    }

    async fn handle_negotiation_response(&self, msg: RpcMessage) -> Result<()> {
        let result = if msg.status != RpcStatus::Ok {
            debug!(
                "{}: negotiation rpc returned {:?}",
                self.remote, msg.status
            );
            let status = msg.status;
            self.drive(|negotiation| negotiation.handle_rpc_error(status))
        } else {
            match NegotiationMessage::decode(msg.body) {
                Ok(reply) => self.drive(|negotiation| negotiation.handle_message(reply)),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(result) => apply_result(self, result).await,
            Err(e) => {
                self.on_protocol_violation(e.clone()).await;
                Err(e)
            }
        }
    }

    /// Feed a negotiation request to the server negotiation
    pub(crate) async fn handle_negotiation_request(&self, msg: RpcMessage) -> Result<()> {
        self.negotiation_seq.store(msg.seq, Ordering::SeqCst);
        let result = NegotiationMessage::decode(msg.body)
            .and_then(|request| self.drive(|negotiation| negotiation.handle_message(request)));
        match result {
            Ok(result) => apply_result(self, result).await,
            Err(e) => {
                self.on_protocol_violation(e.clone()).await;
                Err(e)
            }
        }
    }

    /// Record the handshake result; only the first call has any effect
    pub(crate) async fn complete_negotiation(&self, outcome: Outcome) {
        let replay = {
            let mut state = self.state();
            if state.completed {
                debug!(
                    "{}: negotiation already completed with {}, ignoring {}",
                    self.remote,
                    state.status,
                    outcome.status()
                );
                return;
            }
            state.completed = true;
            state.status = outcome.status();
            if outcome.is_success() {
                state.user_name = Some(outcome.user_name().to_string());
                state.replaying = true;
                Some(state.pending.take_all())
            } else {
                None
            }
        };

        match replay {
            Some(batch) => {
                info!(
                    "{}: session open as {} ({}), replaying {} pending messages",
                    self.remote,
                    outcome.user_name(),
                    outcome.status(),
                    batch.len()
                );
                self.replay(batch).await;
            }
            None => {
                if let Some(err) = outcome.error() {
                    warn!("{}: negotiation failed ({}): {}", self.remote, err.category(), err);
                }
                self.close().await;
            }
        }
        self.publish_outcome(outcome);
    }

    async fn replay(&self, mut batch: VecDeque<RpcMessage>) {
        let mut replayed = 0usize;
        loop {
            while let Some(msg) = batch.pop_front() {
                if let Err(e) = self.transport.send(msg).await {
                    warn!(
                        "{}: replay stopped after {} messages: {}",
                        self.remote, replayed, e
                    );
                    drop(batch);
                    self.close().await;
                    return;
                }
                replayed += 1;
            }
            let next = {
                let mut state = self.state();
                if state.pending.is_empty() || state.closed {
                    state.replaying = false;
                    None
                } else {
                    Some(state.pending.take_all())
                }
            };
            match next {
                Some(more) => batch = more,
                None => break,
            }
        }
        debug!("{}: replayed {} pending messages", self.remote, replayed);
    }

    /// The transport went away
    pub async fn on_disconnected(&self) {
        let completed = self.state().completed;
        if !completed {
            self.complete_negotiation(Outcome::Failed(Error::disconnected(&format!(
                "{} disconnected during negotiation",
                self.remote
            ))))
            .await;
        }
        self.close().await;
    }

    /// Tear the session down
    ///
    /// Drops the negotiation, releases queued messages without sending them,
    /// and closes the transport. Safe to call more than once.
    pub async fn close(&self) {
        let (released, interrupted) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.replaying = false;
            let interrupted = !state.completed;
            if interrupted {
                state.completed = true;
                state.status = NegotiationStatus::AuthFailed;
            }
            (state.pending.take_all(), interrupted)
        };

        {
            let negotiation = self.slot().take();
            if let Some(negotiation) = negotiation {
                trace!(
                    "{}: dropping {} negotiation in {}",
                    self.remote,
                    negotiation.role(),
                    negotiation.status()
                );
            }
        }
        if !released.is_empty() {
            info!(
                "{}: released {} pending messages without sending",
                self.remote,
                released.len()
            );
        }
        drop(released);

        self.gate.on_session_destroyed(self.id);
        self.transport.close().await;
        debug!("{}: session {} closed", self.remote, self.id);

        if interrupted {
            self.publish_outcome(Outcome::Failed(Error::disconnected(
                "session closed before negotiation completed",
            )));
        }
    }
}

#[async_trait]
impl NegotiationSession for RpcSession {
    fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    fn remote_identity(&self) -> &str {
        &self.remote
    }

    async fn send_negotiation(&self, msg: NegotiationMessage) -> Result<()> {
        let rpc = match self.role {
            Role::Client => {
                let mut rpc = RpcMessage::negotiation_request(&msg);
                rpc.seq = self.next_seq();
                rpc
            }
            Role::Server => RpcMessage {
                code: RPC_NEGOTIATION_ACK,
                seq: self.negotiation_seq.load(Ordering::SeqCst),
                is_response: true,
                status: RpcStatus::Ok,
                body: msg.encode(),
                user_name: None,
            },
        };
        trace!(
            "{}: send {} ({} bytes)",
            self.remote,
            msg.status,
            msg.payload.len()
        );
        self.transport.send(rpc).await
    }

    async fn on_negotiation_complete(&self, outcome: Outcome) {
        self.complete_negotiation(outcome).await;
    }

    async fn on_protocol_violation(&self, err: Error) {
        warn!("{}: closing session: {}", self.remote, err);
        let completed = self.state().completed;
        if !completed {
            self.complete_negotiation(Outcome::Failed(err)).await;
        }
        self.close().await;
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("RpcSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("status", &state.status)
            .field("user_name", &state.user_name)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Whitelist;
    use crate::transport::ChannelTransport;
    use crate::NegotiationConfig;
    use auth::MechanismRegistry;
    use tokio::sync::mpsc;

    const APP_WRITE: u16 = 0x1001;

    fn session(role: Role) -> (Arc<RpcSession>, mpsc::UnboundedReceiver<RpcMessage>) {
        let gate = Arc::new(AuthenticationGate::new(
            Arc::new(NegotiationConfig::default()),
            Arc::new(MechanismRegistry::new()),
            Whitelist::default(),
            None,
        ));
        let (transport, rx) = ChannelTransport::channel("127.0.0.1:34601");
        let session = RpcSession::new(
            role,
            "127.0.0.1:34601",
            Arc::new(transport),
            gate,
            Arc::new(HandlerRegistry::new()),
        );
        (session, rx)
    }

    fn write(n: u8) -> RpcMessage {
        RpcMessage::request(APP_WRITE, vec![n])
    }

    #[tokio::test]
    async fn test_second_completion_is_noop() {
        let (session, mut rx) = session(Role::Client);
        for n in 0..3 {
            assert_eq!(session.send(write(n)).await.unwrap(), SendStatus::Queued);
        }
        assert_eq!(session.pending_len(), 3);

        let outcome = Outcome::Authenticated {
            user_name: "alice".into(),
        };
        session.complete_negotiation(outcome.clone()).await;
        session.complete_negotiation(outcome.clone()).await;
        session
            .complete_negotiation(Outcome::Failed(Error::disconnected("late")))
            .await;

        let mut replayed = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            replayed.push(msg.body[0]);
        }
        assert_eq!(replayed, vec![0, 1, 2]);
        assert_eq!(session.status(), NegotiationStatus::Succeeded);
        assert_eq!(session.user_name().as_deref(), Some("alice"));
        assert_eq!(session.outcome(), Some(outcome));
        assert!(!session.is_closed());

        assert_eq!(session.send(write(3)).await.unwrap(), SendStatus::Sent);
        assert_eq!(rx.try_recv().unwrap().body[0], 3);
    }

    #[tokio::test]
    async fn test_failure_releases_queue() {
        let (session, mut rx) = session(Role::Client);
        session.send(write(0)).await.unwrap();
        session.send(write(1)).await.unwrap();

        session
            .complete_negotiation(Outcome::Failed(Error::StepFailed("bad proof".into())))
            .await;
        session
            .complete_negotiation(Outcome::Authenticated {
                user_name: "mallory".into(),
            })
            .await;

        assert!(session.is_closed());
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.status(), NegotiationStatus::AuthFailed);
        assert_eq!(session.user_name(), None);
        // nothing was sent and the transport is closed
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_whitelisted_codes_bypass_queue() {
        let (session, mut rx) = session(Role::Client);
        let ping = RpcMessage::request(crate::rpc::RPC_FD_FAILURE_DETECTOR_PING, "ping");
        assert_eq!(session.send(ping).await.unwrap(), SendStatus::Sent);
        assert_eq!(session.send(write(0)).await.unwrap(), SendStatus::Queued);

        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.code, crate::rpc::RPC_FD_FAILURE_DETECTOR_PING);
        assert_eq!(sent.seq, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _rx) = session(Role::Server);
        session.send(write(0)).await.unwrap();
        session.close().await;
        session.close().await;

        assert!(session.is_closed());
        assert_eq!(session.pending_len(), 0);
        assert!(matches!(
            session.wait_negotiated().await,
            Outcome::Failed(Error::Disconnected(_))
        ));
        assert!(session.send(write(1)).await.is_err());
    }
}
