//! Error types for mechanism adapters

use thiserror::Error;

/// Marker that Kerberos (and our keyring mechanism) put in the error text
/// when the credential has to be renewed before authenticating again.
pub const TICKET_EXPIRED_MARKER: &str = "Ticket expired";

/// Mechanism adapter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MechanismError {
    #[error("Unknown mechanism: {0}")]
    UnknownMechanism(String),

    #[error("Mechanism initialization failed: {0}")]
    InitFailed(String),

    #[error("Authentication step failed: {0}")]
    StepFailed(String),

    #[error("Ticket expired: {0}")]
    TicketExpired(String),

    #[error("No authenticated principal: {0}")]
    NoPrincipal(String),

    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    #[error("Mechanism used out of order: {0}")]
    InvalidState(String),
}

impl MechanismError {
    /// Whether the failure means the local credential needs renewal
    ///
    /// Adapters backed by external libraries only hand us a message, so the
    /// text is checked as well as the variant.
    pub fn is_ticket_expired(&self) -> bool {
        matches!(self, MechanismError::TicketExpired(_)) || is_ticket_expired_message(&self.to_string())
    }
}

/// Check a raw failure message (e.g. an `AuthFailed` reason from the peer)
pub fn is_ticket_expired_message(msg: &str) -> bool {
    msg.contains(TICKET_EXPIRED_MARKER)
}

/// Result type for mechanism operations
pub type Result<T> = std::result::Result<T, MechanismError>;
