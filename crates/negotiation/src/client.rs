//! Client side of the negotiation

use crate::error::{Error, MechanismPhase};
use crate::message::NegotiationMessage;
use crate::rpc::RpcStatus;
use crate::selection::{join_mechanism_list, parse_mechanism_list, select_mechanism};
use crate::state_machine::{advance, Outcome, StateResult};
use crate::status::NegotiationStatus;
use crate::NegotiationConfig;
use auth::{canonicalize_username, ActiveMechanism, MechanismRegistry, Role};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Client negotiation driver
///
/// `status` is the last status the client sent, or the terminal status.
#[derive(Debug)]
pub struct ClientNegotiation {
    name: String,
    config: Arc<NegotiationConfig>,
    mechanisms: Arc<MechanismRegistry>,
    status: NegotiationStatus,
    selected_mechanism: Option<String>,
    mechanism: Option<ActiveMechanism>,
    mechanism_complete: bool,
    user_name: Option<String>,
    server_confirmed: bool,
}

impl ClientNegotiation {
    pub fn new(
        remote: &str,
        config: Arc<NegotiationConfig>,
        mechanisms: Arc<MechanismRegistry>,
    ) -> Self {
        Self {
            name: format!("CLIENT_NEGOTIATION(SERVER={})", remote),
            config,
            mechanisms,
            status: NegotiationStatus::Invalid,
            selected_mechanism: None,
            mechanism: None,
            mechanism_complete: false,
            user_name: None,
            server_confirmed: false,
        }
    }

    pub fn status(&self) -> NegotiationStatus {
        self.status
    }

    pub fn selected_mechanism(&self) -> Option<&str> {
        self.selected_mechanism.as_deref()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Send round one
    pub fn start(&mut self) -> StateResult {
        info!("{}: start negotiation", self.name);
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::ListMechanisms) {
            return StateResult::Reject(e);
        }
        StateResult::Send(NegotiationMessage::empty(NegotiationStatus::ListMechanisms))
    }

    pub fn handle_message(&mut self, msg: NegotiationMessage) -> StateResult {
        debug!(
            "{}: received {} ({} bytes) in {}",
            self.name,
            msg.status,
            msg.payload.len(),
            self.status
        );

        if self.status.is_terminal() {
            return self.handle_after_terminal(msg);
        }

        match (self.status, msg.status) {
            (_, NegotiationStatus::AuthFailed) => {
                let reason = msg.payload_str().unwrap_or("<undecodable reason>");
                self.fail(Error::from_peer_reason(reason))
            }
            (NegotiationStatus::ListMechanisms, NegotiationStatus::AuthDisabled) => {
                self.on_auth_disabled()
            }
            (NegotiationStatus::ListMechanisms, NegotiationStatus::ListMechanismsResp) => {
                self.on_list_mechanisms_resp(msg)
            }
            (NegotiationStatus::SelectMechanisms, NegotiationStatus::SelectMechanismsOk) => {
                self.on_select_mechanisms_ok()
            }
            (
                NegotiationStatus::Initiate | NegotiationStatus::ChallengeResp,
                NegotiationStatus::Challenge,
            ) => self.on_challenge(msg),
            (
                NegotiationStatus::Initiate | NegotiationStatus::ChallengeResp,
                NegotiationStatus::Succeeded,
            ) => self.on_succeeded(msg),
            (_, actual) => {
                let expected = self.expected();
                self.fail(Error::violation(actual, &expected))
            }
        }
    }

    /// The negotiation RPC came back with an error instead of a reply
    pub fn handle_rpc_error(&mut self, rpc_status: RpcStatus) -> StateResult {
        if self.status.is_terminal() {
            return StateResult::Reject(Error::Disconnected(format!(
                "negotiation rpc error {:?} after {}",
                rpc_status, self.status
            )));
        }

        match rpc_status {
            RpcStatus::HandlerNotFound
                if self.status == NegotiationStatus::ListMechanisms
                    && !self.config.mandatory_auth
                    && self.config.legacy_peer_fallback =>
            {
                warn!(
                    "{}: server has no negotiation handler, continuing UNAUTHENTICATED \
                     (auth_legacy_peer_fallback is on)",
                    self.name
                );
                self.finish_disabled()
            }
            RpcStatus::HandlerNotFound => self.fail(Error::PolicyDisabled(
                "server does not support authentication negotiation".to_string(),
            )),
            other => self.fail(Error::Disconnected(format!(
                "negotiation rpc failed with {:?}",
                other
            ))),
        }
    }

    fn expected(&self) -> Vec<NegotiationStatus> {
        match self.status {
            NegotiationStatus::ListMechanisms => vec![
                NegotiationStatus::ListMechanismsResp,
                NegotiationStatus::AuthDisabled,
            ],
            NegotiationStatus::SelectMechanisms => vec![NegotiationStatus::SelectMechanismsOk],
            NegotiationStatus::Initiate | NegotiationStatus::ChallengeResp => {
                vec![NegotiationStatus::Challenge, NegotiationStatus::Succeeded]
            }
            NegotiationStatus::Succeeded if !self.server_confirmed => {
                vec![NegotiationStatus::Succeeded]
            }
            _ => vec![],
        }
    }

    fn handle_after_terminal(&mut self, msg: NegotiationMessage) -> StateResult {
        if self.status == NegotiationStatus::Succeeded
            && msg.status == NegotiationStatus::Succeeded
            && !self.server_confirmed
        {
            debug!("{}: server confirmed success", self.name);
            self.server_confirmed = true;
            return StateResult::Continue;
        }
        let err = Error::violation(msg.status, &self.expected());
        warn!(
            "{}: rejecting message after negotiation finished with {}: {}",
            self.name, self.status, err
        );
        StateResult::Reject(err)
    }

    fn on_auth_disabled(&mut self) -> StateResult {
        if self.config.mandatory_auth {
            return self.fail(Error::PolicyDisabled(
                "server has authentication disabled but mandatory_auth is set".to_string(),
            ));
        }
        info!("{}: server has authentication disabled", self.name);
        self.finish_disabled()
    }

    fn finish_disabled(&mut self) -> StateResult {
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::AuthDisabled) {
            return self.fail(e);
        }
        StateResult::Complete {
            reply: None,
            outcome: Outcome::Disabled,
        }
    }

    fn on_list_mechanisms_resp(&mut self, msg: NegotiationMessage) -> StateResult {
        let list = match msg.payload_str() {
            Ok(list) => list,
            Err(e) => return self.fail(e),
        };
        let advertised = parse_mechanism_list(list);

        let Some(mechanism) = select_mechanism(&self.config.client_mechanisms, &advertised)
        else {
            return self.fail(Error::MechanismUnsupported(format!(
                "no common mechanism: client supports [{}], server offers [{}]",
                join_mechanism_list(&self.config.client_mechanisms),
                join_mechanism_list(&advertised)
            )));
        };
        let mechanism = mechanism.to_string();

        info!("{}: selected mechanism {}", self.name, mechanism);
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::SelectMechanisms) {
            return self.fail(e);
        }
        self.selected_mechanism = Some(mechanism.clone());
        StateResult::Send(NegotiationMessage::new(
            NegotiationStatus::SelectMechanisms,
            mechanism,
        ))
    }

    fn on_select_mechanisms_ok(&mut self) -> StateResult {
        let Some(name) = self.selected_mechanism.clone() else {
            return self.fail(Error::MechanismInitFailed(
                "no mechanism was selected".to_string(),
            ));
        };

        let mut mechanism = match self.mechanisms.init(&name, Role::Client) {
            Ok(m) => m,
            Err(e) => return self.fail(Error::from_mechanism(e, MechanismPhase::Init)),
        };
        let step = match mechanism.start(&name, None) {
            Ok(step) => step,
            Err(e) => return self.fail(Error::from_mechanism(e, MechanismPhase::Step)),
        };
        self.mechanism_complete = step.is_complete();
        self.mechanism = Some(mechanism);

        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::Initiate) {
            return self.fail(e);
        }
        StateResult::Send(NegotiationMessage::new(
            NegotiationStatus::Initiate,
            step.token,
        ))
    }

    fn on_challenge(&mut self, msg: NegotiationMessage) -> StateResult {
        let step = match self.mechanism.as_mut() {
            Some(mechanism) => mechanism.step(&msg.payload),
            None => {
                return self.fail(Error::StepFailed(
                    "challenge received without an active mechanism".to_string(),
                ))
            }
        };
        let step = match step {
            Ok(step) => step,
            Err(e) => return self.fail(Error::from_mechanism(e, MechanismPhase::Step)),
        };

        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::ChallengeResp) {
            return self.fail(e);
        }
        let complete = step.is_complete();
        let reply = NegotiationMessage::new(NegotiationStatus::ChallengeResp, step.token);

        if complete {
            // the mechanism is done on our side; the server's Succeeded is
            // only a confirmation from here on
            self.mechanism_complete = true;
            return self.succeed(Some(reply));
        }
        StateResult::Send(reply)
    }

    fn on_succeeded(&mut self, msg: NegotiationMessage) -> StateResult {
        if !self.mechanism_complete {
            // mutual authentication: the final server token must verify
            let step = match self.mechanism.as_mut() {
                Some(mechanism) if !msg.payload.is_empty() => mechanism.step(&msg.payload),
                _ => {
                    return self.fail(Error::StepFailed(
                        "server reported success before the mechanism completed".to_string(),
                    ))
                }
            };
            match step {
                Ok(step) if step.is_complete() => self.mechanism_complete = true,
                Ok(_) => {
                    return self.fail(Error::StepFailed(
                        "mechanism still incomplete after the server's final token".to_string(),
                    ))
                }
                Err(e) => return self.fail(Error::from_mechanism(e, MechanismPhase::Step)),
            }
        }
        self.server_confirmed = true;
        self.succeed(None)
    }

    fn succeed(&mut self, reply: Option<NegotiationMessage>) -> StateResult {
        let principal = match self.mechanism.as_ref().map(|m| m.retrieve_principal()) {
            Some(Ok(principal)) => principal,
            Some(Err(e)) => return self.fail(Error::from_mechanism(e, MechanismPhase::Step)),
            None => {
                return self.fail(Error::StepFailed("no active mechanism".to_string()));
            }
        };
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::Succeeded) {
            return self.fail(e);
        }
        let user_name = canonicalize_username(&principal).to_string();
        info!(
            "{}: negotiation succeeded with {} as {}",
            self.name,
            self.selected_mechanism.as_deref().unwrap_or("?"),
            user_name
        );
        self.user_name = Some(user_name.clone());
        if let Some(mut mechanism) = self.mechanism.take() {
            mechanism.dispose();
        }
        StateResult::Complete {
            reply,
            outcome: Outcome::Authenticated { user_name },
        }
    }

    fn fail(&mut self, err: Error) -> StateResult {
        if err.is_credential_expired() {
            error!(
                "{}: credential needs renewal before authenticating: {}",
                self.name, err
            );
        } else {
            warn!("{}: negotiation failed in {}: {}", self.name, self.status, err);
        }
        self.status = NegotiationStatus::AuthFailed;
        if let Some(mut mechanism) = self.mechanism.take() {
            mechanism.dispose();
        }
        StateResult::Complete {
            reply: None,
            outcome: Outcome::Failed(err),
        }
    }
}
