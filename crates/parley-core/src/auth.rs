//! Bearer token verification.
//!
//! The relay treats token issuance as an external concern; all it needs
//! is a verifier that resolves an opaque token string to an identity or
//! rejects it.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Identity resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Username the token was issued to.
    pub username: String,
}

/// Verifies opaque bearer tokens.
///
/// Verification may involve I/O (key lookup, introspection endpoint),
/// so the trait is async even though the JWT implementation is not.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a token to an identity.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AuthFailure`] for any invalid, expired, or
    /// otherwise unacceptable token.
    async fn verify(&self, token: &str) -> Result<Identity>;
}

/// JWT claims issued by the login endpoint.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    username: String,
    exp: u64,
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier from the shared signing secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| {
                tracing::debug!(error = %err, "Token verification failed");
                RelayError::AuthFailure
            })?;

        Ok(Identity {
            username: data.claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn mint(username: &str, secret: &str, exp_offset_secs: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = Claims {
            username: username.to_string(),
            exp: (now + exp_offset_secs).max(0) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let token = mint("alice", SECRET, 3600);

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        let token = mint("alice", "other-secret", 3600);

        assert!(matches!(
            verifier.verify(&token).await,
            Err(RelayError::AuthFailure)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        // Past the default validation leeway.
        let token = mint("alice", SECRET, -3600);

        assert!(matches!(
            verifier.verify(&token).await,
            Err(RelayError::AuthFailure)
        ));
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify("not-a-jwt").await,
            Err(RelayError::AuthFailure)
        ));
    }
}
