//! Connection authentication negotiation
//!
//! Runs a mechanism-based mutual authentication handshake over an existing
//! connection and gates all other traffic on that connection until the
//! handshake completes:
//!
//! ```text
//! client                                   server
//!   ListMechanisms             ->
//!                              <-  ListMechanismsResp "GSSAPI,..."  (or AuthDisabled)
//!   SelectMechanisms "GSSAPI"  ->
//!                              <-  SelectMechanismsOk
//!   Initiate <token>           ->
//!                              <-  Challenge <token>     (repeat while Incomplete)
//!   ChallengeResp <token>      ->
//!                              <-  Succeeded <token>
//! ```
//!
//! Messages sent by the application while the handshake is in flight are
//! queued on the session and replayed in order on success, or released on
//! failure. The [`SecurityContext`] holds everything a process needs and is
//! passed explicitly to each session.

pub mod client;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod message;
pub mod pending;
pub mod rpc;
pub mod selection;
pub mod server;
pub mod session;
pub mod state_machine;
pub mod status;
pub mod transport;

pub use client::ClientNegotiation;
pub use context::{loopback, SecurityContext};
pub use dispatcher::{HandlerRegistry, NegotiationDispatcher, RpcHandler};
pub use error::*;
pub use gate::AuthenticationGate;
pub use message::NegotiationMessage;
pub use pending::PendingMessageQueue;
pub use rpc::*;
pub use server::ServerNegotiation;
pub use session::{RpcSession, SendStatus, SessionId};
pub use state_machine::{apply_result, Negotiation, NegotiationSession, Outcome, StateResult};
pub use status::NegotiationStatus;
pub use transport::{spawn_reader, ChannelTransport, Transport};

use dsnconfig::StringList;
use std::path::PathBuf;

/// Sections consulted for security options, in order
pub const SECURITY_SECTIONS: &[&str] = &["security", "global"];

dsnconfig::define_options! {
    /// Security options from the process configuration file
    pub struct SecurityOptions {
        /// Run the handshake at all; a server with this off answers
        /// `AuthDisabled`
        enable_auth: bool = true,

        /// Refuse peers that cannot authenticate
        mandatory_auth: bool = false,

        /// Users granted superuser rights by later authorization layers
        super_users: StringList = StringList::default(),

        /// Mechanisms a server advertises
        sasl_mechanisms: StringList = StringList::from_strs(&[auth::GSSAPI_MECHANISM]),

        /// Mechanisms a client tries, most preferred first
        client_mechanisms: StringList = StringList::from_strs(&[auth::GSSAPI_MECHANISM]),

        /// Accept peers that predate negotiation as unauthenticated when
        /// `mandatory_auth` is off; only for rolling upgrades
        auth_legacy_peer_fallback: bool = false,

        /// Keyring for the shared-key mechanism
        keyring: String = String::new(),
    }
}

/// Negotiation policy for one process
///
/// # Example
///
/// ```rust
/// use negotiation::NegotiationConfig;
///
/// let config = NegotiationConfig::default()
///     .with_mechanisms(&["HMAC-SHA256"])
///     .mandatory();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub enable_auth: bool,

    pub mandatory_auth: bool,

    /// Exposed for authorization layers; the handshake does not use it
    pub super_users: Vec<String>,

    /// Advertised by servers, in order
    pub server_mechanisms: Vec<String>,

    /// Client preference order
    pub client_mechanisms: Vec<String>,

    /// Downgrade to an unauthenticated session when the peer has no
    /// negotiation support and `mandatory_auth` is off. Off by default.
    ///
    /// This keeps mixed-version clusters working during an upgrade. It also
    /// means an attacker who can make the negotiation RPC fail with "handler
    /// not found" gets an untrusted session, so only turn it on while older
    /// nodes are still in the cluster.
    pub legacy_peer_fallback: bool,

    pub keyring: Option<PathBuf>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self::from_options(&SecurityOptions::default())
    }
}

impl NegotiationConfig {
    pub fn from_options(opts: &SecurityOptions) -> Self {
        Self {
            enable_auth: opts.enable_auth,
            mandatory_auth: opts.mandatory_auth,
            super_users: opts.super_users.0.clone(),
            server_mechanisms: opts.sasl_mechanisms.0.clone(),
            client_mechanisms: opts.client_mechanisms.0.clone(),
            legacy_peer_fallback: opts.auth_legacy_peer_fallback,
            keyring: (!opts.keyring.is_empty()).then(|| PathBuf::from(&opts.keyring)),
        }
    }

    /// Authentication turned off entirely
    pub fn disabled() -> Self {
        Self {
            enable_auth: false,
            mandatory_auth: false,
            ..Default::default()
        }
    }

    /// Use the same mechanism list for both roles
    pub fn with_mechanisms(mut self, names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        self.server_mechanisms = names.clone();
        self.client_mechanisms = names;
        self
    }

    pub fn with_client_mechanisms(mut self, names: &[&str]) -> Self {
        self.client_mechanisms = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_server_mechanisms(mut self, names: &[&str]) -> Self {
        self.server_mechanisms = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.enable_auth = true;
        self.mandatory_auth = true;
        self
    }

    /// Accept peers without negotiation support as unauthenticated
    pub fn with_legacy_fallback(mut self) -> Self {
        self.legacy_peer_fallback = true;
        self
    }

    pub fn is_superuser(&self, user_name: &str) -> bool {
        self.super_users.iter().any(|u| u == user_name)
    }

    /// Validate configuration for semantic correctness
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.mandatory_auth && !self.enable_auth {
            return Err("mandatory_auth requires enable_auth".to_string());
        }

        if self.enable_auth {
            if self.server_mechanisms.is_empty() {
                return Err("sasl_mechanisms cannot be empty when auth is enabled".to_string());
            }
            if self.client_mechanisms.is_empty() {
                return Err("client_mechanisms cannot be empty when auth is enabled".to_string());
            }
        }

        for name in self.server_mechanisms.iter().chain(&self.client_mechanisms) {
            if name.is_empty() || name.contains(',') || name.chars().any(char::is_whitespace) {
                return Err(format!("invalid mechanism name {:?}", name));
            }
        }

        if self.super_users.iter().any(|u| u.is_empty()) {
            return Err("super_users contains an empty name".to_string());
        }

        Ok(())
    }

    /// Create config from a configuration file
    ///
    /// # Example
    /// ```no_run
    /// use negotiation::NegotiationConfig;
    ///
    /// let config = NegotiationConfig::from_conf("/etc/dsn/config.ini")
    ///     .expect("Failed to read config");
    /// ```
    pub fn from_conf(path: &str) -> Result<Self> {
        let dsn_config = dsnconfig::DsnConfig::from_file(path)
            .map_err(|e| Error::config_error(&format!("Failed to read {}: {}", path, e)))?;
        let config = Self::from_dsn_config(&dsn_config);
        config.validate().map_err(|e| Error::config_error(&e))?;
        Ok(config)
    }

    pub fn from_dsn_config(dsn_config: &dsnconfig::DsnConfig) -> Self {
        let opts = SecurityOptions::from_dsn_config(dsn_config, SECURITY_SECTIONS);
        tracing::debug!(
            "security options: enable_auth={} mandatory_auth={} mechanisms=[{}]",
            opts.enable_auth,
            opts.mandatory_auth,
            opts.sasl_mechanisms.join()
        );
        Self::from_options(&opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NegotiationConfig::default();
        assert!(config.enable_auth);
        assert!(!config.mandatory_auth);
        assert!(!config.legacy_peer_fallback);
        assert_eq!(config.server_mechanisms, vec!["GSSAPI".to_string()]);
        assert_eq!(config.client_mechanisms, vec!["GSSAPI".to_string()]);
        assert!(config.super_users.is_empty());
        assert!(config.keyring.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let config = NegotiationConfig::disabled();
        assert!(!config.enable_auth);
        assert!(config.validate().is_ok());

        let config = NegotiationConfig::default()
            .with_mechanisms(&["HMAC-SHA256", "GSSAPI"])
            .mandatory()
            .with_legacy_fallback();
        assert!(config.mandatory_auth);
        assert!(config.legacy_peer_fallback);
        assert_eq!(config.client_mechanisms[0], "HMAC-SHA256");
        assert!(config.validate().is_ok());

        let config = NegotiationConfig::default()
            .with_client_mechanisms(&["PLAIN"])
            .with_server_mechanisms(&["GSSAPI"]);
        assert_eq!(config.client_mechanisms, vec!["PLAIN".to_string()]);
        assert_eq!(config.server_mechanisms, vec!["GSSAPI".to_string()]);
    }

    #[test]
    fn test_validate_rejects_inconsistent_config() {
        let mut config = NegotiationConfig::disabled();
        config.mandatory_auth = true;
        assert!(config.validate().is_err());

        let config = NegotiationConfig::default().with_server_mechanisms(&[]);
        assert!(config.validate().unwrap_err().contains("sasl_mechanisms"));

        let config = NegotiationConfig::default().with_client_mechanisms(&[]);
        assert!(config.validate().unwrap_err().contains("client_mechanisms"));

        let config = NegotiationConfig::default().with_mechanisms(&["GSS API"]);
        assert!(config.validate().is_err());

        // an empty list is fine when auth is off
        let config = NegotiationConfig::disabled().with_mechanisms(&[]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_dsn_config() {
        let dsn = dsnconfig::DsnConfig::parse(
            r#"
[global]
mandatory_auth = true

[security]
super_users = admin, pegasus
sasl_mechanisms = HMAC-SHA256,GSSAPI
client_mechanisms = HMAC-SHA256
keyring = /etc/dsn/keyring
"#,
        )
        .unwrap();
        let config = NegotiationConfig::from_dsn_config(&dsn);
        assert!(config.enable_auth);
        assert!(config.mandatory_auth);
        assert!(config.is_superuser("pegasus"));
        assert!(!config.is_superuser("bob"));
        assert_eq!(config.server_mechanisms.len(), 2);
        assert_eq!(config.client_mechanisms, vec!["HMAC-SHA256".to_string()]);
        assert_eq!(config.keyring, Some(PathBuf::from("/etc/dsn/keyring")));
    }

    #[test]
    fn test_security_option_names() {
        let names = SecurityOptions::option_names();
        assert!(names.contains(&"enable_auth"));
        assert!(names.contains(&"mandatory_auth"));
        assert!(names.contains(&"auth_legacy_peer_fallback"));
    }
}
