//! Shared pieces of the negotiation state machine
//!
//! Both drivers are sans-IO: they consume one [`NegotiationMessage`] and
//! return a [`StateResult`] describing what the owning session has to do.
//! [`apply_result`] performs that work against a [`NegotiationSession`].

use crate::client::ClientNegotiation;
use crate::error::{Error, Result};
use crate::message::NegotiationMessage;
use crate::rpc::RpcStatus;
use crate::server::ServerNegotiation;
use crate::status::NegotiationStatus;
use async_trait::async_trait;
use auth::{Role, UNKNOWN_USER};
use tracing::{trace, warn};

/// Terminal result of a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Mechanism finished; `user_name` is the canonical user
    Authenticated { user_name: String },
    /// No authentication took place and the session is untrusted
    Disabled,
    Failed(Error),
}

impl Outcome {
    pub fn status(&self) -> NegotiationStatus {
        match self {
            Outcome::Authenticated { .. } => NegotiationStatus::Succeeded,
            Outcome::Disabled => NegotiationStatus::AuthDisabled,
            Outcome::Failed(_) => NegotiationStatus::AuthFailed,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    /// User name to stamp on inbound traffic
    pub fn user_name(&self) -> &str {
        match self {
            Outcome::Authenticated { user_name } => user_name,
            _ => UNKNOWN_USER,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// What the session must do after a driver consumed a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateResult {
    /// Nothing to send, keep waiting
    Continue,
    /// Send the next round
    Send(NegotiationMessage),
    /// The handshake reached a terminal status; send `reply` first if set
    Complete {
        reply: Option<NegotiationMessage>,
        outcome: Outcome,
    },
    /// The message was refused and the status is unchanged; the session
    /// must not trust the peer any further
    Reject(Error),
}

/// Session operations the negotiation needs
#[async_trait]
pub trait NegotiationSession: Send + Sync {
    fn is_client(&self) -> bool;

    fn remote_identity(&self) -> &str;

    async fn send_negotiation(&self, msg: NegotiationMessage) -> Result<()>;

    async fn on_negotiation_complete(&self, outcome: Outcome);

    async fn on_protocol_violation(&self, err: Error);
}

/// Carry out a driver result
///
/// A failed send ends the handshake as `Disconnected`.
pub async fn apply_result(session: &dyn NegotiationSession, result: StateResult) -> Result<()> {
    match result {
        StateResult::Continue => Ok(()),
        StateResult::Send(msg) => {
            if let Err(e) = session.send_negotiation(msg).await {
                warn!(
                    "negotiation with {} lost its transport: {}",
                    session.remote_identity(),
                    e
                );
                session.on_negotiation_complete(Outcome::Failed(e.clone())).await;
                return Err(e);
            }
            Ok(())
        }
        StateResult::Complete { reply, outcome } => {
            if let Some(msg) = reply {
                if let Err(e) = session.send_negotiation(msg).await {
                    // still complete: a success here is already final locally
                    warn!(
                        "failed to send final negotiation reply to {}: {}",
                        session.remote_identity(),
                        e
                    );
                }
            }
            session.on_negotiation_complete(outcome).await;
            Ok(())
        }
        StateResult::Reject(err) => {
            session.on_protocol_violation(err.clone()).await;
            Err(err)
        }
    }
}

/// Move `status` to `next` if the transition table allows it
pub(crate) fn advance(
    name: &str,
    status: &mut NegotiationStatus,
    next: NegotiationStatus,
) -> Result<()> {
    if !status.can_transition(next) {
        return Err(Error::violation(next, &successors(*status)));
    }
    trace!("{}: {} -> {}", name, status, next);
    *status = next;
    Ok(())
}

fn successors(status: NegotiationStatus) -> Vec<NegotiationStatus> {
    (0u32..=10)
        .filter_map(|raw| NegotiationStatus::try_from(raw).ok())
        .filter(|next| status.can_transition(*next) && *next != NegotiationStatus::AuthFailed)
        .collect()
}

/// Role-tagged negotiation owned by a session
#[derive(Debug)]
pub enum Negotiation {
    Client(ClientNegotiation),
    Server(ServerNegotiation),
}

impl Negotiation {
    pub fn role(&self) -> Role {
        match self {
            Negotiation::Client(_) => Role::Client,
            Negotiation::Server(_) => Role::Server,
        }
    }

    pub fn status(&self) -> NegotiationStatus {
        match self {
            Negotiation::Client(c) => c.status(),
            Negotiation::Server(s) => s.status(),
        }
    }

    pub fn selected_mechanism(&self) -> Option<&str> {
        match self {
            Negotiation::Client(c) => c.selected_mechanism(),
            Negotiation::Server(s) => s.selected_mechanism(),
        }
    }

    pub fn user_name(&self) -> Option<&str> {
        match self {
            Negotiation::Client(c) => c.user_name(),
            Negotiation::Server(s) => s.user_name(),
        }
    }

    /// First action after the session connects
    pub fn start(&mut self) -> StateResult {
        match self {
            Negotiation::Client(c) => c.start(),
            Negotiation::Server(s) => s.start(),
        }
    }

    pub fn handle_message(&mut self, msg: NegotiationMessage) -> StateResult {
        match self {
            Negotiation::Client(c) => c.handle_message(msg),
            Negotiation::Server(s) => s.handle_message(msg),
        }
    }

    /// The negotiation RPC itself failed at the transport level
    pub fn handle_rpc_error(&mut self, status: RpcStatus) -> StateResult {
        match self {
            Negotiation::Client(c) => c.handle_rpc_error(status),
            Negotiation::Server(_) => StateResult::Reject(Error::Codec(format!(
                "server negotiation received rpc error {:?}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSession {
        sent: Mutex<Vec<NegotiationMessage>>,
        outcomes: Mutex<Vec<Outcome>>,
        violations: Mutex<Vec<Error>>,
        broken: bool,
    }

    #[async_trait]
    impl NegotiationSession for RecordingSession {
        fn is_client(&self) -> bool {
            true
        }

        fn remote_identity(&self) -> &str {
            "127.0.0.1:34801"
        }

        async fn send_negotiation(&self, msg: NegotiationMessage) -> Result<()> {
            if self.broken {
                return Err(Error::disconnected("peer closed"));
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        async fn on_negotiation_complete(&self, outcome: Outcome) {
            self.outcomes.lock().unwrap().push(outcome);
        }

        async fn on_protocol_violation(&self, err: Error) {
            self.violations.lock().unwrap().push(err);
        }
    }

    #[tokio::test]
    async fn test_apply_send_and_complete() {
        let session = RecordingSession::default();
        apply_result(&session, StateResult::Continue).await.unwrap();
        apply_result(
            &session,
            StateResult::Send(NegotiationMessage::empty(NegotiationStatus::ListMechanisms)),
        )
        .await
        .unwrap();
        apply_result(
            &session,
            StateResult::Complete {
                reply: Some(NegotiationMessage::new(NegotiationStatus::ChallengeResp, "t")),
                outcome: Outcome::Authenticated {
                    user_name: "bob".into(),
                },
            },
        )
        .await
        .unwrap();

        let sent = session.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].status, NegotiationStatus::ChallengeResp);
        let outcomes = session.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].user_name(), "bob");
    }

    #[tokio::test]
    async fn test_apply_send_failure_completes_as_disconnected() {
        let session = RecordingSession {
            broken: true,
            ..Default::default()
        };
        let err = apply_result(
            &session,
            StateResult::Send(NegotiationMessage::empty(NegotiationStatus::ListMechanisms)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
        let outcomes = session.outcomes.lock().unwrap();
        assert_eq!(outcomes[0].status(), NegotiationStatus::AuthFailed);
    }

    #[tokio::test]
    async fn test_apply_reject() {
        let session = RecordingSession::default();
        let err = Error::violation(NegotiationStatus::Challenge, &[]);
        assert!(apply_result(&session, StateResult::Reject(err.clone()))
            .await
            .is_err());
        assert_eq!(session.violations.lock().unwrap().as_slice(), &[err]);
        assert!(session.outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_advance() {
        let mut status = NegotiationStatus::Invalid;
        advance("test", &mut status, NegotiationStatus::ListMechanisms).unwrap();
        assert_eq!(status, NegotiationStatus::ListMechanisms);

        let err = advance("test", &mut status, NegotiationStatus::Challenge).unwrap_err();
        assert_eq!(
            err,
            Error::violation(
                NegotiationStatus::Challenge,
                &[NegotiationStatus::SelectMechanisms, NegotiationStatus::AuthDisabled]
            )
        );
        assert_eq!(status, NegotiationStatus::ListMechanisms);
    }

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(Outcome::Disabled.user_name(), UNKNOWN_USER);
        assert!(Outcome::Disabled.is_success());
        let failed = Outcome::Failed(Error::disconnected("eof"));
        assert!(!failed.is_success());
        assert_eq!(failed.status(), NegotiationStatus::AuthFailed);
        assert!(failed.error().is_some());
    }
}
