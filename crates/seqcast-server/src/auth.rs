// ABOUTME: Static bearer-token authenticator built from SEQCAST_AUTH_TOKENS.
// ABOUTME: Maps each configured token to an identity; anything else is rejected as an invalid credential.

use std::collections::HashMap;

use async_trait::async_trait;
use seqcast_core::{AuthError, Authenticator, Identity};

use crate::config::TokenGrant;

/// Authenticator over a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    pub fn new(grants: &[TokenGrant]) -> Self {
        let tokens = grants
            .iter()
            .map(|g| (g.token.clone(), Identity::new(g.identity.clone())))
            .collect();
        Self { tokens }
    }

    /// Convenience for tests and embedders: a single identity with one token.
    pub fn single(identity: &str, token: &str) -> Self {
        Self::new(&[TokenGrant {
            identity: identity.to_string(),
            token: token.to_string(),
        }])
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}
