use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::UserId;
use crate::error::AuthError;
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,      // User ID
    pub username: String, // Display name shown to the room
    pub exp: i64,         // Expiration time
    pub iat: i64,         // Issued at
}

/// Who is on the other end of a connection, as vouched for by a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

pub struct AuthService {
    jwt_secret: String,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(jwt_secret: String) -> Self {
        Self {
            jwt_secret,
            token_ttl: Duration::hours(24),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn issue_token(&self, user_id: UserId, username: &str) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            exp: (now + self.token_ttl).timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }

    pub fn validate_token(&self, token: &str) -> Result<Identity> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )?
        .claims;

        let user_id = claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::InvalidToken)?;

        Ok(Identity {
            user_id,
            username: claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;

    #[test]
    fn test_issue_and_validate() {
        let auth = AuthService::new("test_secret".to_string());
        let token = auth.issue_token(7, "alice").unwrap();

        let identity = auth.validate_token(&token).unwrap();
        assert_eq!(identity, Identity { user_id: 7, username: "alice".to_string() });
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = AuthService::new("one".to_string()).issue_token(7, "alice").unwrap();
        let result = AuthService::new("two".to_string()).validate_token(&token);
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidToken))));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Well past the default 60s leeway.
        let auth = AuthService::new("test_secret".to_string()).with_ttl(Duration::minutes(-5));
        let token = auth.issue_token(7, "alice").unwrap();
        let result = auth.validate_token(&token);
        assert!(matches!(result, Err(AppError::AuthError(AuthError::TokenExpired))));
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        let secret = "test_secret";
        let claims = Claims {
            sub: "not-a-number".to_string(),
            username: "mallory".to_string(),
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
            iat: Utc::now().timestamp(),
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap();

        let result = AuthService::new(secret.to_string()).validate_token(&token);
        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidToken))));
    }
}
