//! Guest login credentials.
//!
//! Stored credential strings carry a backend prefix:
//!
//! - `raw::secret` keeps the password inline in the document.
//! - `env::VAR` reads the password from `$VAR` when a session is opened.
//! - `ssh::HOST` authenticates through the host's ssh-agent with the keys configured for `HOST`.
//!
//! A string without a prefix is treated as an inline password.

use crate::machine::config::MachineError;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

const INLINE_PREFIX: &str = "raw::";
const ENV_PREFIX: &str = "env::";
const AGENT_PREFIX: &str = "ssh::";

#[derive(Debug)]
pub enum Credential {
    Inline(SecretString),
    EnvIndirect(String),
    AgentHost(String),
}

/// A credential after its backend has been consulted.
pub enum ResolvedAuth {
    Password(SecretString),
    Agent { host: String },
}

impl Credential {
    pub fn parse(raw: &str) -> Credential {
        if let Some(secret) = raw.strip_prefix(INLINE_PREFIX) {
            Credential::Inline(SecretString::from(secret.to_string()))
        } else if let Some(var) = raw.strip_prefix(ENV_PREFIX) {
            Credential::EnvIndirect(var.to_string())
        } else if let Some(host) = raw.strip_prefix(AGENT_PREFIX) {
            Credential::AgentHost(host.to_string())
        } else {
            Credential::Inline(SecretString::from(raw.to_string()))
        }
    }

    pub fn resolve(&self) -> Result<ResolvedAuth, MachineError> {
        match self {
            Credential::Inline(secret) => Ok(ResolvedAuth::Password(SecretString::from(
                secret.expose_secret().to_string(),
            ))),
            Credential::EnvIndirect(var) => match std::env::var(var) {
                Ok(value) => Ok(ResolvedAuth::Password(SecretString::from(value))),
                Err(_) => Err(MachineError::CredentialUnavailable(format!(
                    "configuration names environment variable {} but it is not set",
                    var
                ))),
            },
            Credential::AgentHost(host) => Ok(ResolvedAuth::Agent { host: host.clone() }),
        }
    }
}

impl Clone for ResolvedAuth {
    fn clone(&self) -> Self {
        match self {
            ResolvedAuth::Password(secret) => {
                ResolvedAuth::Password(SecretString::from(secret.expose_secret().to_string()))
            }
            ResolvedAuth::Agent { host } => ResolvedAuth::Agent { host: host.clone() },
        }
    }
}

impl fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAuth::Password(_) => write!(f, "Password([REDACTED])"),
            ResolvedAuth::Agent { host } => write!(f, "Agent({})", host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixes() {
        assert!(matches!(
            Credential::parse("raw::root"),
            Credential::Inline(s) if s.expose_secret() == "root"
        ));
        assert!(matches!(
            Credential::parse("env::GUEST_PASS"),
            Credential::EnvIndirect(v) if v == "GUEST_PASS"
        ));
        assert!(matches!(
            Credential::parse("ssh::alpine-box"),
            Credential::AgentHost(h) if h == "alpine-box"
        ));
        assert!(matches!(
            Credential::parse("legacy"),
            Credential::Inline(s) if s.expose_secret() == "legacy"
        ));
    }

    #[test]
    fn test_resolve_env() {
        let expected = std::env::var("PATH").unwrap();
        match Credential::parse("env::PATH").resolve().unwrap() {
            ResolvedAuth::Password(secret) => assert_eq!(secret.expose_secret(), expected),
            other => panic!("unexpected {:?}", other),
        }

        let missing = Credential::parse("env::PINEVM_TEST_SURELY_UNSET_VARIABLE").resolve();
        assert!(matches!(missing, Err(MachineError::CredentialUnavailable(_))));
    }

    #[test]
    fn test_debug_redacts() {
        let auth = Credential::parse("raw::hunter2").resolve().unwrap();
        assert!(!format!("{:?}", auth).contains("hunter2"));
        assert!(!format!("{:?}", Credential::parse("raw::hunter2")).contains("hunter2"));
    }
}
