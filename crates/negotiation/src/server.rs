//! Server side of the negotiation

use crate::error::{Error, MechanismPhase};
use crate::message::NegotiationMessage;
use crate::selection::join_mechanism_list;
use crate::state_machine::{advance, Outcome, StateResult};
use crate::status::NegotiationStatus;
use crate::NegotiationConfig;
use auth::{canonicalize_username, ActiveMechanism, MechanismError, MechanismRegistry, MechanismStep, Role};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Server negotiation driver
///
/// `status` is the last status the server replied with, or the terminal
/// status.
#[derive(Debug)]
pub struct ServerNegotiation {
    name: String,
    config: Arc<NegotiationConfig>,
    mechanisms: Arc<MechanismRegistry>,
    advertised: Vec<String>,
    status: NegotiationStatus,
    selected_mechanism: Option<String>,
    mechanism: Option<ActiveMechanism>,
    user_name: Option<String>,
}

impl ServerNegotiation {
    pub fn new(
        remote: &str,
        config: Arc<NegotiationConfig>,
        mechanisms: Arc<MechanismRegistry>,
    ) -> Self {
        let advertised = config
            .server_mechanisms
            .iter()
            .filter(|name| mechanisms.supports(name))
            .cloned()
            .collect();
        Self {
            name: format!("SERVER_NEGOTIATION(CLIENT={})", remote),
            config,
            mechanisms,
            advertised,
            status: NegotiationStatus::Invalid,
            selected_mechanism: None,
            mechanism: None,
            user_name: None,
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

    /// Mechanisms offered in `ListMechanismsResp`
    pub fn advertised(&self) -> &[String] {
        &self.advertised
    }

    /// The server waits for the client's first round
    pub fn start(&mut self) -> StateResult {
        debug!("{}: waiting for client", self.name);
        StateResult::Continue
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
            let err = Error::violation(msg.status, &[]);
            warn!(
                "{}: rejecting message after negotiation finished with {}: {}",
                self.name, self.status, err
            );
            return StateResult::Reject(err);
        }

        match (self.status, msg.status) {
            (NegotiationStatus::Invalid, NegotiationStatus::ListMechanisms) => {
                self.on_list_mechanisms()
            }
            (NegotiationStatus::ListMechanismsResp, NegotiationStatus::SelectMechanisms) => {
                self.on_select_mechanisms(msg)
            }
            (NegotiationStatus::SelectMechanismsOk, NegotiationStatus::Initiate) => {
                self.on_initiate(msg)
            }
            (NegotiationStatus::Challenge, NegotiationStatus::ChallengeResp) => {
                self.on_challenge_resp(msg)
            }
            (_, actual) => {
                let expected = self.expected();
                self.fail(Error::violation(actual, &expected))
            }
        }
    }

    /// Non-negotiation traffic arrived before the client sent anything
    ///
    /// A client that predates negotiation never sends `ListMechanisms`. With
    /// `mandatory_auth` off and the legacy fallback on, the session becomes
    /// an unauthenticated one; otherwise nothing changes and the traffic
    /// stays rejected.
    pub fn on_legacy_traffic(&mut self) -> StateResult {
        if self.status != NegotiationStatus::Invalid
            || self.config.mandatory_auth
            || !self.config.legacy_peer_fallback
        {
            return StateResult::Continue;
        }
        warn!(
            "{}: client sent traffic without negotiating, accepting it UNAUTHENTICATED \
             (auth_legacy_peer_fallback is on)",
            self.name
        );
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::AuthDisabled) {
            return StateResult::Reject(e);
        }
        StateResult::Complete {
            reply: None,
            outcome: Outcome::Disabled,
        }
    }

    fn expected(&self) -> Vec<NegotiationStatus> {
        match self.status {
            NegotiationStatus::Invalid => vec![NegotiationStatus::ListMechanisms],
            NegotiationStatus::ListMechanismsResp => vec![NegotiationStatus::SelectMechanisms],
            NegotiationStatus::SelectMechanismsOk => vec![NegotiationStatus::Initiate],
            NegotiationStatus::Challenge => vec![NegotiationStatus::ChallengeResp],
            _ => vec![],
        }
    }

    fn on_list_mechanisms(&mut self) -> StateResult {
        if !self.config.enable_auth {
            info!("{}: authentication disabled, telling client", self.name);
            if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::AuthDisabled) {
                return self.fail(e);
            }
            return StateResult::Complete {
                reply: Some(NegotiationMessage::empty(NegotiationStatus::AuthDisabled)),
                outcome: Outcome::Disabled,
            };
        }

        if self.advertised.is_empty() {
            warn!(
                "{}: none of the configured mechanisms [{}] is registered",
                self.name,
                join_mechanism_list(&self.config.server_mechanisms)
            );
        }
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::ListMechanismsResp) {
            return self.fail(e);
        }
        StateResult::Send(NegotiationMessage::new(
            NegotiationStatus::ListMechanismsResp,
            join_mechanism_list(&self.advertised),
        ))
    }

    fn on_select_mechanisms(&mut self, msg: NegotiationMessage) -> StateResult {
        let name = match msg.payload_str() {
            Ok(name) => name.to_string(),
            Err(e) => return self.fail(e),
        };

        if !self.advertised.iter().any(|m| *m == name) {
            return self.fail(Error::MechanismUnsupported(format!(
                "client selected {:?}, server offers [{}]",
                name,
                join_mechanism_list(&self.advertised)
            )));
        }

        let mechanism = match self.mechanisms.init(&name, Role::Server) {
            Ok(m) => m,
            Err(e) => return self.fail(Error::from_mechanism(e, MechanismPhase::Init)),
        };

        info!("{}: client selected mechanism {}", self.name, name);
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::SelectMechanismsOk) {
            return self.fail(e);
        }
        self.mechanism = Some(mechanism);
        self.selected_mechanism = Some(name);
        StateResult::Send(NegotiationMessage::empty(
            NegotiationStatus::SelectMechanismsOk,
        ))
    }

    fn on_initiate(&mut self, msg: NegotiationMessage) -> StateResult {
        let name = self.selected_mechanism.clone().unwrap_or_default();
        let step = match self.mechanism.as_mut() {
            Some(mechanism) => mechanism.start(&name, Some(&msg.payload[..])),
            None => return self.fail(Error::StepFailed("no active mechanism".to_string())),
        };
        self.on_mechanism_step(step)
    }

    fn on_challenge_resp(&mut self, msg: NegotiationMessage) -> StateResult {
        let step = match self.mechanism.as_mut() {
            Some(mechanism) => mechanism.step(&msg.payload),
            None => return self.fail(Error::StepFailed("no active mechanism".to_string())),
        };
        self.on_mechanism_step(step)
    }

    fn on_mechanism_step(&mut self, step: Result<MechanismStep, MechanismError>) -> StateResult {
        let step = match step {
            Ok(step) => step,
            Err(e) => return self.fail(Error::from_mechanism(e, MechanismPhase::Step)),
        };

        if !step.is_complete() {
            if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::Challenge) {
                return self.fail(e);
            }
            return StateResult::Send(NegotiationMessage::new(
                NegotiationStatus::Challenge,
                step.token,
            ));
        }

        let principal = match self.mechanism.as_ref().map(|m| m.retrieve_principal()) {
            Some(Ok(principal)) => principal,
            Some(Err(e)) => return self.fail(Error::from_mechanism(e, MechanismPhase::Step)),
            None => return self.fail(Error::StepFailed("no active mechanism".to_string())),
        };
        if let Err(e) = advance(&self.name, &mut self.status, NegotiationStatus::Succeeded) {
            return self.fail(e);
        }
        let user_name = canonicalize_username(&principal).to_string();
        info!(
            "{}: authenticated {} as {} with {}",
            self.name,
            principal,
            user_name,
            self.selected_mechanism.as_deref().unwrap_or("?")
        );
        self.user_name = Some(user_name.clone());
        if let Some(mut mechanism) = self.mechanism.take() {
            mechanism.dispose();
        }
        StateResult::Complete {
            reply: Some(NegotiationMessage::new(
                NegotiationStatus::Succeeded,
                step.token,
            )),
            outcome: Outcome::Authenticated { user_name },
        }
    }

    fn fail(&mut self, err: Error) -> StateResult {
        if err.is_credential_expired() {
            error!("{}: client credential expired: {}", self.name, err);
        } else {
            warn!("{}: negotiation failed in {}: {}", self.name, self.status, err);
        }
        self.status = NegotiationStatus::AuthFailed;
        if let Some(mut mechanism) = self.mechanism.take() {
            mechanism.dispose();
        }
        StateResult::Complete {
            reply: Some(NegotiationMessage::new(
                NegotiationStatus::AuthFailed,
                err.to_string(),
            )),
            outcome: Outcome::Failed(err),
        }
    }
}
