use crate::status::NegotiationStatus;
use auth::MechanismError;
use thiserror::Error;

/// Negotiation and session errors
///
/// Every variant that ends a handshake is reported to the session through
/// [`crate::Outcome::Failed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Protocol violation: received {actual} while expecting {}", expected_names(.expected))]
    ProtocolViolation {
        actual: NegotiationStatus,
        expected: Vec<NegotiationStatus>,
    },
    #[error("Mechanism unsupported: {0}")]
    MechanismUnsupported(String),
    #[error("Mechanism initialization failed: {0}")]
    MechanismInitFailed(String),
    #[error("Authentication step failed: {0}")]
    StepFailed(String),
    #[error("Credential expired: {0}")]
    CredentialExpired(String),
    #[error("Authentication disabled: {0}")]
    PolicyDisabled(String),
    #[error("Disconnected: {0}")]
    Disconnected(String),
    #[error("No negotiation registered for session {0}")]
    NoNegotiation(String),
    #[error("Unauthenticated message rejected: {0}")]
    Unauthenticated(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

fn expected_names(expected: &[NegotiationStatus]) -> String {
    if expected.is_empty() {
        return "nothing".to_string();
    }
    expected
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Parse `received <status> while expecting <status> or <status>`
fn parse_violation(text: &str) -> Option<Error> {
    let (actual, expected) = text.strip_prefix("received ")?.split_once(" while expecting ")?;
    let actual = NegotiationStatus::from_name(actual)?;
    let expected = if expected == "nothing" {
        Vec::new()
    } else {
        expected
            .split(" or ")
            .map(NegotiationStatus::from_name)
            .collect::<Option<Vec<_>>>()?
    };
    Some(Error::ProtocolViolation { actual, expected })
}

/// Which adapter call produced a mechanism error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismPhase {
    Init,
    Step,
}

impl Error {
    pub fn violation(actual: NegotiationStatus, expected: &[NegotiationStatus]) -> Self {
        Self::ProtocolViolation {
            actual,
            expected: expected.to_vec(),
        }
    }

    pub fn disconnected(msg: &str) -> Self {
        Self::Disconnected(msg.to_string())
    }

    pub fn codec_error(msg: &str) -> Self {
        Self::Codec(msg.to_string())
    }

    pub fn config_error(msg: &str) -> Self {
        Self::Config(msg.to_string())
    }

    /// Map an adapter failure, keeping credential expiry distinct
    pub fn from_mechanism(err: MechanismError, phase: MechanismPhase) -> Self {
        if err.is_ticket_expired() {
            return Self::CredentialExpired(err.to_string());
        }
        match (err, phase) {
            (MechanismError::UnknownMechanism(name), _) => Self::MechanismUnsupported(name),
            (err, MechanismPhase::Init) => Self::MechanismInitFailed(err.to_string()),
            (err, MechanismPhase::Step) => Self::StepFailed(err.to_string()),
        }
    }

    /// Map the reason string of a peer's `AuthFailed`
    ///
    /// The peer sends the `Display` form of its own error, so the variant is
    /// recovered from the message prefix. Unrecognized reasons become
    /// `StepFailed`.
    pub fn from_peer_reason(reason: &str) -> Self {
        if let Some(rest) = reason.strip_prefix("Protocol violation: ") {
            if let Some(err) = parse_violation(rest) {
                return err;
            }
        }
        let prefixed: [(&str, fn(String) -> Self); 5] = [
            ("Credential expired: ", Self::CredentialExpired),
            ("Mechanism unsupported: ", Self::MechanismUnsupported),
            ("Mechanism initialization failed: ", Self::MechanismInitFailed),
            ("Authentication step failed: ", Self::StepFailed),
            ("Authentication disabled: ", Self::PolicyDisabled),
        ];
        for (prefix, variant) in prefixed {
            if let Some(rest) = reason.strip_prefix(prefix) {
                return variant(rest.to_string());
            }
        }
        if auth::is_ticket_expired_message(reason) {
            Self::CredentialExpired(reason.to_string())
        } else {
            Self::StepFailed(format!("rejected by peer: {}", reason))
        }
    }

    pub fn is_credential_expired(&self) -> bool {
        matches!(self, Error::CredentialExpired(_))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation { .. })
    }

    /// Get a human-readable category for this error
    pub fn category(&self) -> &'static str {
        match self {
            Error::ProtocolViolation { .. } | Error::NoNegotiation(_) => "Protocol",
            Error::MechanismUnsupported(_) | Error::MechanismInitFailed(_) => "Mechanism",
            Error::StepFailed(_) | Error::Unauthenticated(_) => "Authentication",
            Error::CredentialExpired(_) => "Credential",
            Error::PolicyDisabled(_) => "Policy",
            Error::Disconnected(_) => "Connection",
            Error::Codec(_) => "Serialization",
            Error::Config(_) => "Configuration",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_message() {
        let err = Error::violation(
            NegotiationStatus::Challenge,
            &[NegotiationStatus::Initiate],
        );
        assert_eq!(
            err.to_string(),
            "Protocol violation: received negotiation_challenge while expecting negotiation_initiate"
        );
        assert!(err.is_protocol_violation());
        assert_eq!(err.category(), "Protocol");

        let err = Error::violation(
            NegotiationStatus::Initiate,
            &[NegotiationStatus::Challenge, NegotiationStatus::Succeeded],
        );
        assert!(err
            .to_string()
            .ends_with("expecting negotiation_challenge or negotiation_succ"));
    }

    #[test]
    fn test_from_mechanism() {
        let err = Error::from_mechanism(
            MechanismError::StepFailed("Ticket expired while verifying".into()),
            MechanismPhase::Step,
        );
        assert!(err.is_credential_expired());

        let err = Error::from_mechanism(
            MechanismError::InitFailed("no keytab".into()),
            MechanismPhase::Init,
        );
        assert!(matches!(err, Error::MechanismInitFailed(_)));

        let err = Error::from_mechanism(
            MechanismError::StepFailed("bad proof".into()),
            MechanismPhase::Step,
        );
        assert!(matches!(err, Error::StepFailed(_)));

        let err = Error::from_mechanism(
            MechanismError::UnknownMechanism("PLAIN".into()),
            MechanismPhase::Init,
        );
        assert_eq!(err, Error::MechanismUnsupported("PLAIN".into()));
    }

    #[test]
    fn test_from_peer_reason() {
        assert!(Error::from_peer_reason("Credential expired: Ticket expired").is_credential_expired());
        assert!(Error::from_peer_reason("kerberos: Ticket expired").is_credential_expired());
        assert_eq!(
            Error::from_peer_reason("bad proof"),
            Error::StepFailed("rejected by peer: bad proof".into())
        );
        assert_eq!(
            Error::from_peer_reason("Authentication step failed: bad token"),
            Error::StepFailed("bad token".into())
        );
        assert_eq!(
            Error::from_peer_reason("Mechanism unsupported: PLAIN"),
            Error::MechanismUnsupported("PLAIN".into())
        );
        assert_eq!(
            Error::from_peer_reason("Mechanism initialization failed: no keytab"),
            Error::MechanismInitFailed("no keytab".into())
        );
        assert_eq!(
            Error::from_peer_reason("Authentication disabled: off").category(),
            "Policy"
        );
    }

    #[test]
    fn test_peer_reason_keeps_every_category() {
        let sent = [
            Error::violation(NegotiationStatus::Challenge, &[NegotiationStatus::Initiate]),
            Error::violation(
                NegotiationStatus::Initiate,
                &[NegotiationStatus::Challenge, NegotiationStatus::Succeeded],
            ),
            Error::violation(NegotiationStatus::AuthDisabled, &[]),
            Error::MechanismUnsupported("GSSAPI".into()),
            Error::MechanismInitFailed("no keytab".into()),
            Error::StepFailed("bad proof".into()),
            Error::CredentialExpired("Ticket expired".into()),
        ];
        for err in sent {
            assert_eq!(Error::from_peer_reason(&err.to_string()), err);
        }

        // a garbled violation still fails the handshake
        assert!(matches!(
            Error::from_peer_reason("Protocol violation: received junk while expecting more"),
            Error::StepFailed(_)
        ));
    }
}
