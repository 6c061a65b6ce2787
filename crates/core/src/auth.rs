//! Credential seam for the transport.
//!
//! Acquiring and refreshing credentials happens outside this workspace; the
//! transport only asks for a bearer token before each request.

use async_trait::async_trait;

use crate::error::AuthError;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A currently valid bearer token.
    async fn bearer_token(&self) -> std::result::Result<String, AuthError>;
}

/// A fixed token, typically an API key from config or the environment.
#[derive(Clone)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Credentials that always fail with [`AuthError::Missing`].
    pub fn none() -> Self {
        Self { token: None }
    }
}

impl From<Option<String>> for StaticCredentials {
    fn from(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn bearer_token(&self) -> std::result::Result<String, AuthError> {
        self.token.clone().ok_or(AuthError::Missing)
    }
}
