// ABOUTME: Authentication seam: a credential is exchanged for an identity or a typed rejection.
// ABOUTME: Verification mechanics live behind the Authenticator trait and are supplied by the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The authenticated principal behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed rejection reasons returned by an authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credential is invalid")]
    InvalidCredential,

    #[error("credential has expired")]
    Expired,

    #[error("credential was revoked")]
    Revoked,

    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Short machine-readable code sent back in `auth-result`.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredential => "invalid_credential",
            AuthError::Expired => "expired",
            AuthError::Revoked => "revoked",
            AuthError::Unavailable(_) => "unavailable",
        }
    }
}

/// Verifies client credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}
