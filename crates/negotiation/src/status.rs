//! Negotiation status codes and the legal transitions between them

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt;

/// Status carried by every negotiation message and tracked by each side
///
/// Variants are ordered by protocol round; the numeric values are what goes
/// on the wire.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
)]
#[repr(u32)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Invalid = 0,
    ListMechanisms = 1,
    ListMechanismsResp = 2,
    SelectMechanisms = 3,
    SelectMechanismsOk = 4,
    Initiate = 5,
    Challenge = 6,
    ChallengeResp = 7,
    Succeeded = 8,
    AuthFailed = 9,
    AuthDisabled = 10,
}

impl NegotiationStatus {
    /// Get the status name as a string (for logging)
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationStatus::Invalid => "negotiation_invalid",
            NegotiationStatus::ListMechanisms => "negotiation_list_mechanisms",
            NegotiationStatus::ListMechanismsResp => "negotiation_list_mechanisms_resp",
            NegotiationStatus::SelectMechanisms => "negotiation_select_mechanisms",
            NegotiationStatus::SelectMechanismsOk => "negotiation_select_mechanisms_resp",
            NegotiationStatus::Initiate => "negotiation_initiate",
            NegotiationStatus::Challenge => "negotiation_challenge",
            NegotiationStatus::ChallengeResp => "negotiation_challenge_resp",
            NegotiationStatus::Succeeded => "negotiation_succ",
            NegotiationStatus::AuthFailed => "negotiation_fail",
            NegotiationStatus::AuthDisabled => "negotiation_auth_disabled",
        }
    }

    /// Inverse of [`as_str`](Self::as_str)
    pub fn from_name(name: &str) -> Option<Self> {
        (0u32..=10)
            .filter_map(|raw| Self::try_from(raw).ok())
            .find(|status| status.as_str() == name)
    }

    /// No further messages are legal once a terminal status is reached
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationStatus::Succeeded | NegotiationStatus::AuthFailed | NegotiationStatus::AuthDisabled
        )
    }

    /// Terminal and lets application traffic through
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            NegotiationStatus::Succeeded | NegotiationStatus::AuthDisabled
        )
    }

    /// Whether a negotiation may move from `self` to `next`
    ///
    /// The table covers both roles: the client walks the request statuses
    /// and the server walks the response statuses.
    pub fn can_transition(&self, next: NegotiationStatus) -> bool {
        use NegotiationStatus::*;

        if next == AuthFailed {
            return !self.is_terminal();
        }
        matches!(
            (*self, next),
            (Invalid, ListMechanisms)
                | (Invalid, ListMechanismsResp)
                | (Invalid, AuthDisabled)
                | (ListMechanisms, SelectMechanisms)
                | (ListMechanisms, AuthDisabled)
                | (ListMechanismsResp, SelectMechanismsOk)
                | (SelectMechanisms, Initiate)
                | (SelectMechanismsOk, Challenge)
                | (SelectMechanismsOk, Succeeded)
                | (Initiate, ChallengeResp)
                | (Initiate, Succeeded)
                | (Challenge, Challenge)
                | (Challenge, Succeeded)
                | (ChallengeResp, ChallengeResp)
                | (ChallengeResp, Succeeded)
        )
    }
}

impl fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for NegotiationStatus {
    fn default() -> Self {
        NegotiationStatus::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationStatus::*;

    const ALL: [NegotiationStatus; 11] = [
        Invalid,
        ListMechanisms,
        ListMechanismsResp,
        SelectMechanisms,
        SelectMechanismsOk,
        Initiate,
        Challenge,
        ChallengeResp,
        Succeeded,
        AuthFailed,
        AuthDisabled,
    ];

    #[test]
    fn test_from_name() {
        for status in ALL {
            assert_eq!(NegotiationStatus::from_name(status.as_str()), Some(status));
        }
        assert_eq!(NegotiationStatus::from_name("negotiation_bogus"), None);
    }

    #[test]
    fn test_wire_values_roundtrip() {
        for status in ALL {
            let raw: u32 = status.into();
            assert_eq!(NegotiationStatus::try_from(raw).unwrap(), status);
        }
        assert!(NegotiationStatus::try_from(11u32).is_err());
        assert_eq!(u32::from(Succeeded), 8);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_failure_reachable_from_every_live_state() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition(AuthFailed), "{}", from);
        }
    }

    #[test]
    fn test_client_path() {
        let path = [
            Invalid,
            ListMechanisms,
            SelectMechanisms,
            Initiate,
            ChallengeResp,
            ChallengeResp,
            Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_server_path() {
        let path = [
            Invalid,
            ListMechanismsResp,
            SelectMechanismsOk,
            Challenge,
            Challenge,
            Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rounds_cannot_be_skipped() {
        assert!(!Invalid.can_transition(Initiate));
        assert!(!ListMechanisms.can_transition(Initiate));
        assert!(!SelectMechanisms.can_transition(Succeeded));
        assert!(!ListMechanismsResp.can_transition(Challenge));
        assert!(!Initiate.can_transition(AuthDisabled));
    }

    #[test]
    fn test_open_states() {
        assert!(Succeeded.is_open());
        assert!(AuthDisabled.is_open());
        assert!(!AuthFailed.is_open());
        assert!(!Challenge.is_open());
        assert_eq!(NegotiationStatus::default(), Invalid);
    }
}
