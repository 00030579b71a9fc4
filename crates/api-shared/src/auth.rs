use sha2::{Digest, Sha256};

/// Reasons a request fails shared-secret authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("shared secret must not be empty")]
    EmptySecret,
    #[error("missing API key header")]
    Missing,
    #[error("invalid API key")]
    Invalid,
}

/// The pre-shared key both tiers are configured with.
///
/// The secret is resolved once at startup and passed in, never read from the environment
/// per request. Only its SHA-256 digest is kept.
#[derive(Clone)]
pub struct ApiKey {
    digest: [u8; 32],
}

impl ApiKey {
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError::EmptySecret);
        }
        Ok(Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        })
    }

    /// Validates the key presented by a caller.
    ///
    /// Digests are compared without early exit so timing does not reveal how much of the
    /// key matched.
    pub fn validate(&self, provided: Option<&str>) -> Result<(), AuthError> {
        let provided = provided.ok_or(AuthError::Missing)?;
        let candidate: [u8; 32] = Sha256::digest(provided.as_bytes()).into();

        let diff = self
            .digest
            .iter()
            .zip(candidate.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));

        if diff == 0 {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}
