//! Mechanism factories known to this process

use crate::error::{MechanismError, Result};
use crate::mechanism::{ActiveMechanism, MechanismFactory, Role};
use std::sync::Arc;
use tracing::debug;

/// Ordered set of mechanism factories, keyed by mechanism name
#[derive(Debug, Clone, Default)]
pub struct MechanismRegistry {
    factories: Vec<Arc<dyn MechanismFactory>>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any factory with the same name
    pub fn register(&mut self, factory: Arc<dyn MechanismFactory>) {
        let name = factory.mechanism().to_string();
        if let Some(slot) = self.factories.iter_mut().find(|f| f.mechanism() == name) {
            debug!("replacing mechanism factory {}", name);
            *slot = factory;
        } else {
            debug!("registering mechanism factory {}", name);
            self.factories.push(factory);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn MechanismFactory>> {
        self.factories.iter().find(|f| f.mechanism() == name)
    }

    pub fn supports(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.mechanism()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Create a mechanism instance for `role`
    pub fn init(&self, name: &str, role: Role) -> Result<ActiveMechanism> {
        let factory = self
            .get(name)
            .ok_or_else(|| MechanismError::UnknownMechanism(name.to_string()))?;
        let adapter = factory.init(role)?;
        debug!("initialized {} mechanism {}", role, name);
        Ok(ActiveMechanism::new(adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{Script, ScriptedFactory};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = MechanismRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(ScriptedFactory::new("GSSAPI", Script::default())));
        registry.register(Arc::new(ScriptedFactory::new("PLAIN", Script::default())));
        assert_eq!(registry.names(), vec!["GSSAPI", "PLAIN"]);
        assert!(registry.supports("PLAIN"));
        assert!(!registry.supports("SCRAM"));

        // same name replaces in place, order unchanged
        registry.register(Arc::new(ScriptedFactory::new(
            "GSSAPI",
            Script::default().with_rounds(2),
        )));
        assert_eq!(registry.names(), vec!["GSSAPI", "PLAIN"]);
    }

    #[test]
    fn test_init_unknown_mechanism() {
        let registry = MechanismRegistry::new();
        let err = registry.init("GSSAPI", Role::Client).unwrap_err();
        assert_eq!(err, MechanismError::UnknownMechanism("GSSAPI".into()));
    }

    #[test]
    fn test_init_failure_propagates() {
        let mut registry = MechanismRegistry::new();
        registry.register(Arc::new(ScriptedFactory::new(
            "GSSAPI",
            Script::default().fail_init("keytab missing"),
        )));
        let err = registry.init("GSSAPI", Role::Server).unwrap_err();
        assert!(matches!(err, MechanismError::InitFailed(_)));
    }
}
