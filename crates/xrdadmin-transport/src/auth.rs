//! Credential boundary.
//!
//! Credentials are produced outside this crate and attached to each
//! `ProtocolSession` when it logs in. No negotiation happens here.

use crate::session::ServerAddr;

/// Credentials presented at session login.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// User name, if any.
    pub user: Option<String>,
    /// Opaque token, if any.
    pub token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies credentials for a server when a session to it is opened.
pub trait CredentialProvider: Send + Sync {
    /// Credentials to present to `server`; `None` logs in anonymously.
    fn credentials_for(&self, server: &ServerAddr) -> Option<Credentials>;
}

/// Presents the same credentials to every server.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Creates a provider returning `credentials` for every server.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials_for(&self, _server: &ServerAddr) -> Option<Credentials> {
        Some(self.credentials.clone())
    }
}
