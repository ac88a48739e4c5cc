//! Deterministic mechanism with a configurable number of rounds
//!
//! The server side answers the client's initial token with `rounds`
//! challenges before reporting `Ok`; the client answers each challenge and
//! finishes when it sees the server's final token. Tokens are plain text
//! (`initiate`, `challenge-N`, `response-N`, `done`) so traces are readable.

use crate::error::{MechanismError, Result};
use crate::mechanism::{MechanismAdapter, MechanismFactory, MechanismStep, Role};
use bytes::Bytes;
use tracing::trace;

const INITIATE: &[u8] = b"initiate";
const DONE: &[u8] = b"done";

/// Behaviour of a scripted mechanism
#[derive(Debug, Clone)]
pub struct Script {
    /// Challenges the server issues before `Ok`
    pub rounds: u32,
    /// Principal both sides report once finished
    pub principal: String,
    /// Client reports `Ok` while answering the last challenge instead of
    /// waiting for the server's final token
    pub client_completes_early: bool,
    /// `init` fails with this message
    pub init_failure: Option<String>,
    /// `start`/`step` fail with this message on the given call (0 = start)
    pub step_failure: Option<(u32, String)>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            rounds: 1,
            principal: "user".to_string(),
            client_completes_early: false,
            init_failure: None,
            step_failure: None,
        }
    }
}

impl Script {
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn completes_early(mut self) -> Self {
        self.client_completes_early = true;
        self
    }

    pub fn fail_init(mut self, msg: impl Into<String>) -> Self {
        self.init_failure = Some(msg.into());
        self
    }

    pub fn fail_at(mut self, call: u32, msg: impl Into<String>) -> Self {
        self.step_failure = Some((call, msg.into()));
        self
    }
}

/// Factory for scripted mechanism instances under a chosen name
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    name: String,
    script: Script,
}

impl ScriptedFactory {
    pub fn new(name: impl Into<String>, script: Script) -> Self {
        Self {
            name: name.into(),
            script,
        }
    }
}

impl MechanismFactory for ScriptedFactory {
    fn mechanism(&self) -> &str {
        &self.name
    }

    fn init(&self, role: Role) -> Result<Box<dyn MechanismAdapter>> {
        if let Some(msg) = &self.script.init_failure {
            return Err(MechanismError::InitFailed(msg.clone()));
        }
        Ok(Box::new(ScriptedMechanism {
            name: self.name.clone(),
            role,
            script: self.script.clone(),
            calls: 0,
            challenges: 0,
            complete: false,
        }))
    }
}

#[derive(Debug)]
pub struct ScriptedMechanism {
    name: String,
    role: Role,
    script: Script,
    calls: u32,
    challenges: u32,
    complete: bool,
}

impl ScriptedMechanism {
    fn check_failure(&mut self) -> Result<()> {
        let call = self.calls;
        self.calls += 1;
        match &self.script.step_failure {
            Some((at, msg)) if *at == call => Err(MechanismError::StepFailed(msg.clone())),
            _ => Ok(()),
        }
    }

    /// Server: issue the next challenge or finish
    fn server_advance(&mut self) -> MechanismStep {
        if self.challenges < self.script.rounds {
            self.challenges += 1;
            MechanismStep::incomplete(format!("challenge-{}", self.challenges))
        } else {
            self.complete = true;
            MechanismStep::ok(Bytes::from_static(DONE))
        }
    }

    fn expect_token(&self, input: &[u8], expected: &[u8]) -> Result<()> {
        if input != expected {
            return Err(MechanismError::StepFailed(format!(
                "unexpected token {:?}, wanted {:?}",
                String::from_utf8_lossy(input),
                String::from_utf8_lossy(expected)
            )));
        }
        Ok(())
    }
}

impl MechanismAdapter for ScriptedMechanism {
    fn mechanism(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        self.role
    }

    fn start(&mut self, mechanism: &str, input: Option<&[u8]>) -> Result<MechanismStep> {
        if mechanism != self.name {
            return Err(MechanismError::UnknownMechanism(mechanism.to_string()));
        }
        self.check_failure()?;
        trace!("scripted {} start", self.role);
        match self.role {
            Role::Client => Ok(MechanismStep::incomplete(Bytes::from_static(INITIATE))),
            Role::Server => {
                self.expect_token(input.unwrap_or_default(), INITIATE)?;
                Ok(self.server_advance())
            }
        }
    }

    fn step(&mut self, input: &[u8]) -> Result<MechanismStep> {
        self.check_failure()?;
        if self.complete {
            return Err(MechanismError::InvalidState("already complete".to_string()));
        }
        match self.role {
            Role::Client => {
                if input == DONE {
                    self.complete = true;
                    return Ok(MechanismStep::ok(Bytes::new()));
                }
                self.challenges += 1;
                self.expect_token(input, format!("challenge-{}", self.challenges).as_bytes())?;
                let response = format!("response-{}", self.challenges);
                if self.script.client_completes_early && self.challenges == self.script.rounds {
                    self.complete = true;
                    Ok(MechanismStep::ok(response))
                } else {
                    Ok(MechanismStep::incomplete(response))
                }
            }
            Role::Server => {
                self.expect_token(input, format!("response-{}", self.challenges).as_bytes())?;
                Ok(self.server_advance())
            }
        }
    }

    fn retrieve_principal(&self) -> Result<String> {
        if self.complete {
            Ok(self.script.principal.clone())
        } else {
            Err(MechanismError::NoPrincipal("exchange not complete".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(script: Script) -> (Box<dyn MechanismAdapter>, Box<dyn MechanismAdapter>) {
        let factory = ScriptedFactory::new("GSSAPI", script);
        (
            factory.init(Role::Client).unwrap(),
            factory.init(Role::Server).unwrap(),
        )
    }

    #[test]
    fn test_three_rounds() {
        let (mut client, mut server) = pair(Script::default().with_rounds(3));

        let mut token = client.start("GSSAPI", None).unwrap().token;
        let mut reply = server.start("GSSAPI", Some(&token[..])).unwrap();
        let mut challenges = 0;
        while !reply.is_complete() {
            challenges += 1;
            token = client.step(&reply.token).unwrap().token;
            reply = server.step(&token).unwrap();
        }
        assert_eq!(challenges, 3);
        assert!(client.retrieve_principal().is_err());

        assert!(client.step(&reply.token).unwrap().is_complete());
        assert_eq!(client.retrieve_principal().unwrap(), "user");
        assert_eq!(server.retrieve_principal().unwrap(), "user");
    }

    #[test]
    fn test_zero_rounds() {
        let (mut client, mut server) = pair(Script::default().with_rounds(0));
        let token = client.start("GSSAPI", None).unwrap().token;
        let reply = server.start("GSSAPI", Some(&token[..])).unwrap();
        assert!(reply.is_complete());
        assert_eq!(reply.token, Bytes::from_static(DONE));
    }

    #[test]
    fn test_client_completes_early() {
        let (mut client, mut server) = pair(Script::default().with_rounds(1).completes_early());
        let token = client.start("GSSAPI", None).unwrap().token;
        let challenge = server.start("GSSAPI", Some(&token[..])).unwrap();
        let response = client.step(&challenge.token).unwrap();
        assert!(response.is_complete());
        assert!(server.step(&response.token).unwrap().is_complete());
    }

    #[test]
    fn test_scripted_failures() {
        let factory = ScriptedFactory::new("GSSAPI", Script::default().fail_init("no keytab"));
        assert!(factory.init(Role::Server).is_err());

        let (mut client, _) = pair(Script::default().fail_at(0, "Ticket expired"));
        let err = client.start("GSSAPI", None).unwrap_err();
        assert!(err.is_ticket_expired());

        let (mut client, mut server) = pair(Script::default());
        client.start("GSSAPI", None).unwrap();
        assert!(server.start("GSSAPI", Some(&b"garbage"[..])).is_err());
        assert!(client.start("PLAIN", None).is_err());
    }
}
