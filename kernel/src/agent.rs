// Agent Signatures
//
// Every source records who committed it. Providers produce the signature
// envelope once per commit.

use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::envelope::{DataType, Envelope, EnvelopeError, Payload};

pub const SYSTEM_AGENT_TYPE: &str = "sourcelog.agent.system";

/// Produces the signature stamped on each committed source.
pub trait AgentSignatureProvider: Send + Sync {
    fn sign(&self) -> Result<Envelope, EnvelopeError>;
}

/// Signature of a process acting on behalf of a configured system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAgent {
    pub system: String,
    pub instance: Option<String>,
    pub user: Option<String>,
    pub process_id: u32,
}

impl Payload for SystemAgent {
    fn data_type(&self) -> DataType {
        DataType::rust(SYSTEM_AGENT_TYPE)
    }
}

impl AgentSignatureProvider for AgentConfig {
    fn sign(&self) -> Result<Envelope, EnvelopeError> {
        Envelope::seal(&SystemAgent {
            system: self.system.clone(),
            instance: self.instance.clone(),
            user: self.user.clone(),
            process_id: std::process::id(),
        })
    }
}

/// Stamps the same pre-built signature on every source.
impl AgentSignatureProvider for Envelope {
    fn sign(&self) -> Result<Envelope, EnvelopeError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_agent_signs_with_its_system() {
        let config = AgentConfig {
            system: "checkout".into(),
            instance: Some("eu-1".into()),
            user: None,
        };

        let envelope = config.sign().unwrap();
        let agent: SystemAgent = envelope
            .open_expecting(&DataType::rust(SYSTEM_AGENT_TYPE))
            .unwrap();

        assert_eq!(agent.system, "checkout");
        assert_eq!(agent.instance.as_deref(), Some("eu-1"));
        assert_eq!(agent.process_id, std::process::id());
    }
}
