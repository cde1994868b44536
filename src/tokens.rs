//! Bearer-token collaborator.
//!
//! Token refresh internals live outside this daemon; the broker only
//! answers "is there a usable bearer right now". Absence aborts the
//! candidate for the cycle, it is never an error.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::registry::CredentialRegistry;

/// Margin under which a token is treated as already expired, so a probe
/// never races the expiry.
const EXPIRY_MARGIN_SECS: i64 = 30;

#[async_trait]
pub trait TokenBroker: Send + Sync {
    /// A currently valid bearer token for the credential, or `None`.
    async fn valid_bearer(&self, credential_id: &str) -> Result<Option<String>>;
}

/// Broker backed by the token fields the registry already stores.
pub struct RegistryTokenBroker {
    registry: Arc<dyn CredentialRegistry>,
}

impl RegistryTokenBroker {
    pub fn new(registry: Arc<dyn CredentialRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TokenBroker for RegistryTokenBroker {
    async fn valid_bearer(&self, credential_id: &str) -> Result<Option<String>> {
        let Some(cred) = self.registry.get_credential(credential_id).await? else {
            return Ok(None);
        };
        let Some(token) = cred.access_token else {
            return Ok(None);
        };
        match cred.token_expires_at {
            Some(expires_at)
                if expires_at > Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) =>
            {
                Ok(Some(token))
            }
            Some(_) => Ok(None),
            // No recorded expiry: trust the stored token.
            None => Ok(Some(token)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testutil::{credential, MockRegistry};

    #[tokio::test]
    async fn expired_token_is_absent() {
        let mut cred = credential("c1");
        cred.token_expires_at = Some(Utc::now() - Duration::minutes(5));
        let registry = Arc::new(MockRegistry::with(vec![cred]));
        let broker = RegistryTokenBroker::new(registry);
        assert!(broker.valid_bearer("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_token_is_returned() {
        let registry = Arc::new(MockRegistry::with(vec![credential("c1")]));
        let broker = RegistryTokenBroker::new(registry);
        assert_eq!(broker.valid_bearer("c1").await.unwrap().as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn unknown_credential_is_absent() {
        let registry = Arc::new(MockRegistry::with(vec![]));
        let broker = RegistryTokenBroker::new(registry);
        assert!(broker.valid_bearer("nope").await.unwrap().is_none());
    }
}
