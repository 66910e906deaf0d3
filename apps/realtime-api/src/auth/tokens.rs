//! Bearer credential resolution: token → `{user_id, role}`.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::models::role::Role;

/// The authenticated principal behind a connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

/// Resolves an opaque bearer credential into an [`Identity`].
///
/// This is the only seam to the identity provider.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Identity, GatewayError>;
}

/// Claims carried by identity-provider access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Validates HS256 access tokens signed with a shared secret.
pub struct JwtResolver {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token the way the identity provider does. Used by tests and
    /// local tooling.
    pub fn issue(
        &self,
        user_id: &str,
        role: Role,
        ttl: chrono::Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = chrono::Utc::now();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            role: role.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[async_trait]
impl CredentialResolver for JwtResolver {
    async fn resolve(&self, credential: &str) -> Result<Identity, GatewayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;

        let data = jsonwebtoken::decode::<AccessClaims>(credential, &self.decoding, &validation)
            .map_err(|e| {
                tracing::debug!(?e, "access token validation failed");
                GatewayError::Authentication("Invalid or expired token")
            })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(GatewayError::Authentication("Token has no subject"));
        }
        let role = claims
            .role
            .parse::<Role>()
            .map_err(|_| GatewayError::Authentication("Token carries an unknown role"))?;

        Ok(Identity {
            user_id: claims.sub,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_token_resolves() {
        let resolver = JwtResolver::new("secret");
        let token = resolver
            .issue("usr_1", Role::Employee, chrono::Duration::minutes(5))
            .unwrap();
        let identity = resolver.resolve(&token).await.unwrap();
        assert_eq!(identity.user_id, "usr_1");
        assert_eq!(identity.role, Role::Employee);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let resolver = JwtResolver::new("secret");
        let token = resolver
            .issue("usr_1", Role::Admin, chrono::Duration::minutes(-10))
            .unwrap();
        assert!(matches!(
            resolver.resolve(&token).await,
            Err(GatewayError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn token_from_another_secret_is_rejected() {
        let token = JwtResolver::new("other")
            .issue("usr_1", Role::Admin, chrono::Duration::minutes(5))
            .unwrap();
        let resolver = JwtResolver::new("secret");
        assert!(resolver.resolve(&token).await.is_err());
        assert!(resolver.resolve("not-a-jwt").await.is_err());
    }
}
