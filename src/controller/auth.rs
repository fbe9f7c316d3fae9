//! Handshake authentication seam
//!
//! The channel only needs a verdict and a machine identity. Real deployments
//! plug their own [`Authenticator`]; the shipped [`StaticKeyAuthenticator`]
//! maps configured API keys to machine ids.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

/// Credentials presented in the `handshake` frame
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub api_key: String,
    pub client_version: String,
    pub system_info: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Authenticated { machine_id: String },
    Rejected { reason: String },
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &HandshakeRequest) -> AuthVerdict;
}

/// API key → machine id table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, String>,
}

impl StaticKeyAuthenticator {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(&self, request: &HandshakeRequest) -> AuthVerdict {
        if request.api_key.is_empty() {
            return AuthVerdict::Rejected {
                reason: "missing api key".to_string(),
            };
        }
        match self.keys.get(&request.api_key) {
            Some(machine_id) => AuthVerdict::Authenticated {
                machine_id: machine_id.clone(),
            },
            None => AuthVerdict::Rejected {
                reason: "invalid api key".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str) -> HandshakeRequest {
        HandshakeRequest {
            api_key: key.to_string(),
            client_version: "0.1.0".to_string(),
            system_info: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_static_keys() {
        let auth = StaticKeyAuthenticator::new(HashMap::from([(
            "secret".to_string(),
            "desk-1".to_string(),
        )]));

        assert_eq!(
            auth.authenticate(&request("secret")).await,
            AuthVerdict::Authenticated {
                machine_id: "desk-1".to_string()
            }
        );
        assert!(matches!(
            auth.authenticate(&request("wrong")).await,
            AuthVerdict::Rejected { .. }
        ));
        assert!(matches!(
            auth.authenticate(&request("")).await,
            AuthVerdict::Rejected { .. }
        ));
    }
}
