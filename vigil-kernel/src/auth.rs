//! Client token verification.
//!
//! Observer clients must present `identity:key` at the websocket
//! handshake; the key half is checked against `VIGIL_API_KEY`.

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("no API key configured")]
    Unconfigured,
}

pub trait TokenVerifier: Send + Sync {
    /// Returns the authenticated identity, or why the token was rejected.
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

pub struct ApiKeyVerifier {
    key: String,
}

impl ApiKeyVerifier {
    pub fn from_env() -> Self {
        let key = std::env::var("VIGIL_API_KEY").unwrap_or_default();
        if key.is_empty() {
            warn!("VIGIL_API_KEY not set - client sessions will be rejected");
        }
        Self { key }
    }

    #[cfg(test)]
    pub fn with_key(key: &str) -> Self {
        Self { key: key.to_string() }
    }
}

impl TokenVerifier for ApiKeyVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        if self.key.is_empty() {
            return Err(AuthError::Unconfigured);
        }
        let (identity, key) = token.split_once(':').ok_or(AuthError::Missing)?;
        if identity.is_empty() || key != self.key {
            return Err(AuthError::Invalid);
        }
        Ok(identity.to_string())
    }
}
