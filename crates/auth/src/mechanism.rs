//! Mechanism adapter contract
//!
//! A negotiation drives exactly one mechanism instance per session. The
//! mechanism is created by a [`MechanismFactory`] for a fixed [`Role`] and
//! then fed opaque tokens until it reports [`MechanismStatus::Ok`] or fails.

use crate::error::{MechanismError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use tracing::trace;

/// Which end of the connection a mechanism instance authenticates for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported by a successful `start`/`step`
///
/// Failures are the `Err` arm of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismStatus {
    /// Authentication finished on this side
    Ok,
    /// More tokens must be exchanged
    Incomplete,
}

/// Output token plus progress of one mechanism call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MechanismStep {
    pub token: Bytes,
    pub status: MechanismStatus,
}

impl MechanismStep {
    pub fn ok(token: impl Into<Bytes>) -> Self {
        Self {
            token: token.into(),
            status: MechanismStatus::Ok,
        }
    }

    pub fn incomplete(token: impl Into<Bytes>) -> Self {
        Self {
            token: token.into(),
            status: MechanismStatus::Incomplete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == MechanismStatus::Ok
    }
}

/// One side of a pluggable authentication mechanism
pub trait MechanismAdapter: Send + fmt::Debug {
    /// Mechanism name, e.g. `GSSAPI`
    fn mechanism(&self) -> &str;

    fn role(&self) -> Role;

    /// Begin the exchange
    ///
    /// The client passes no input; the server passes the client's initial
    /// token.
    fn start(&mut self, mechanism: &str, input: Option<&[u8]>) -> Result<MechanismStep>;

    /// Continue the exchange with the peer's latest token
    fn step(&mut self, input: &[u8]) -> Result<MechanismStep>;

    /// Raw authenticated principal, only valid after `Ok`
    fn retrieve_principal(&self) -> Result<String>;

    /// Release mechanism resources
    fn dispose(&mut self) {}
}

/// Creates mechanism instances for a role
pub trait MechanismFactory: Send + Sync + fmt::Debug {
    fn mechanism(&self) -> &str;

    fn init(&self, role: Role) -> Result<Box<dyn MechanismAdapter>>;
}

/// An owned mechanism instance that is disposed exactly once, at the latest
/// when it is dropped.
pub struct ActiveMechanism {
    inner: Box<dyn MechanismAdapter>,
    disposed: bool,
}

impl ActiveMechanism {
    pub fn new(inner: Box<dyn MechanismAdapter>) -> Self {
        Self {
            inner,
            disposed: false,
        }
    }

    pub fn dispose(&mut self) {
        if !self.disposed {
            trace!(
                "disposing {} mechanism {}",
                self.inner.role(),
                self.inner.mechanism()
            );
            self.inner.dispose();
            self.disposed = true;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn mechanism(&self) -> &str {
        self.inner.mechanism()
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub fn start(&mut self, mechanism: &str, input: Option<&[u8]>) -> Result<MechanismStep> {
        self.check_live("start")?;
        self.inner.start(mechanism, input)
    }

    pub fn step(&mut self, input: &[u8]) -> Result<MechanismStep> {
        self.check_live("step")?;
        self.inner.step(input)
    }

    pub fn retrieve_principal(&self) -> Result<String> {
        self.check_live("retrieve_principal")?;
        self.inner.retrieve_principal()
    }

    fn check_live(&self, call: &str) -> Result<()> {
        if self.disposed {
            return Err(MechanismError::InvalidState(format!(
                "{} on disposed {} mechanism {}",
                call,
                self.inner.role(),
                self.inner.mechanism()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ActiveMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveMechanism")
            .field("mechanism", &self.inner.mechanism())
            .field("role", &self.inner.role())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for ActiveMechanism {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingAdapter {
        disposals: Arc<AtomicUsize>,
    }

    impl MechanismAdapter for CountingAdapter {
        fn mechanism(&self) -> &str {
            "COUNTING"
        }

        fn role(&self) -> Role {
            Role::Client
        }

        fn start(&mut self, _mechanism: &str, _input: Option<&[u8]>) -> Result<MechanismStep> {
            Ok(MechanismStep::incomplete(Bytes::new()))
        }

        fn step(&mut self, _input: &[u8]) -> Result<MechanismStep> {
            Ok(MechanismStep::ok(Bytes::new()))
        }

        fn retrieve_principal(&self) -> Result<String> {
            Err(MechanismError::NoPrincipal("never".into()))
        }

        fn dispose(&mut self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispose_runs_once() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let mut mechanism = ActiveMechanism::new(Box::new(CountingAdapter {
            disposals: disposals.clone(),
        }));

        assert!(!mechanism.start("COUNTING", None).unwrap().is_complete());
        assert!(mechanism.step(b"x").unwrap().is_complete());

        mechanism.dispose();
        mechanism.dispose();
        assert!(mechanism.is_disposed());
        drop(mechanism);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposed_mechanism_refuses_calls() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let mut mechanism = ActiveMechanism::new(Box::new(CountingAdapter {
            disposals: disposals.clone(),
        }));
        mechanism.dispose();

        assert!(matches!(
            mechanism.start("COUNTING", None),
            Err(MechanismError::InvalidState(_))
        ));
        assert!(matches!(
            mechanism.step(b"x"),
            Err(MechanismError::InvalidState(_))
        ));
        assert!(matches!(
            mechanism.retrieve_principal(),
            Err(MechanismError::InvalidState(_))
        ));
        assert_eq!(mechanism.mechanism(), "COUNTING");
        assert_eq!(mechanism.role(), Role::Client);

        drop(mechanism);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_disposes() {
        let disposals = Arc::new(AtomicUsize::new(0));
        {
            let _mechanism = ActiveMechanism::new(Box::new(CountingAdapter {
                disposals: disposals.clone(),
            }));
        }
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::Client.as_str(), "client");
        assert_eq!(Role::Server.to_string(), "server");
    }
}
