//! JWT authentication
//!
//! Provides JWT-based authentication for the client gateway and its
//! surrounding HTTP surface. Supports access tokens and refresh tokens with
//! configurable expiration, argon2 password hashing, and Google ID token
//! verification for "sign in with Google" (spec.md §6, §1 "password/Google
//! auth ... are external collaborators").

use anyhow::{bail, Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user email)
    pub sub: String,
    /// Issued at
    pub iat: i64,
    /// Expiration time
    pub exp: i64,
    /// Token type (access or refresh)
    pub token_type: TokenType,
    /// Session ID for revocation
    pub jti: String,
}

/// Token type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT secret key (should be 256-bit for HS256)
    pub jwt_secret: String,
    /// Access token expiration (minutes)
    pub access_token_expiry_minutes: i64,
    /// Refresh token expiration (days)
    pub refresh_token_expiry_days: i64,
    /// Maximum failed login attempts before lockout
    pub max_login_attempts: u32,
    /// Lockout duration (minutes)
    pub lockout_duration_minutes: i64,
    /// Google OAuth client ID the `aud` claim of an ID token must match.
    /// `None` disables Google sign-in entirely.
    #[serde(default)]
    pub google_client_id: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_jwt_secret(),
            access_token_expiry_minutes: 60,
            refresh_token_expiry_days: 7,
            max_login_attempts: 5,
            lockout_duration_minutes: 30,
            google_client_id: None,
        }
    }
}

/// Authentication state
pub struct AuthState {
    config: AuthConfig,
    http: Client,
    /// Revoked token IDs (for logout)
    revoked_tokens: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Failed login attempts
    login_attempts: RwLock<HashMap<String, (u32, DateTime<Utc>)>>,
    /// Active sessions
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

/// Session information
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AuthState {
    /// Create new auth state with config
    pub fn new(config: AuthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            http: Client::new(),
            revoked_tokens: RwLock::new(HashMap::new()),
            login_attempts: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Generate access token for user
    pub fn generate_access_token(&self, user_id: &str) -> Result<String> {
        let now = Utc::now();
        let expiry = now + Duration::minutes(self.config.access_token_expiry_minutes);
        let jti = uuid::Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expiry.timestamp(),
            token_type: TokenType::Access,
            jti: jti.clone(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .context("failed to encode JWT")?;

        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(
            jti,
            SessionInfo {
                user_id: user_id.to_string(),
                created_at: now,
                last_active: now,
            },
        );

        Ok(token)
    }

    /// Generate refresh token
    pub fn generate_refresh_token(&self, user_id: &str) -> Result<String> {
        let now = Utc::now();
        let expiry = now + Duration::days(self.config.refresh_token_expiry_days);
        let jti = uuid::Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expiry.timestamp(),
            token_type: TokenType::Refresh,
            jti,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .context("failed to encode refresh token")
    }

    /// Validate and decode one of this service's own tokens.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let jti = self.extract_jti(token)?;
        if self.is_token_revoked(&jti) {
            bail!("token has been revoked");
        }

        let validation = Validation::new(Algorithm::HS256);
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .context("invalid token")?;

        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(session) = sessions.get_mut(&token_data.claims.jti) {
                session.last_active = Utc::now();
            }
        }

        Ok(token_data.claims)
    }

    fn extract_jti(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .context("failed to decode token")?;

        Ok(token_data.claims.jti)
    }

    pub fn revoke_token(&self, jti: &str) -> Result<()> {
        self.revoked_tokens.write().unwrap().insert(jti.to_string(), Utc::now());
        self.sessions.write().unwrap().remove(jti);
        Ok(())
    }

    fn is_token_revoked(&self, jti: &str) -> bool {
        self.revoked_tokens.read().unwrap().contains_key(jti)
    }

    pub fn record_failed_login(&self, identifier: &str) {
        let mut attempts = self.login_attempts.write().unwrap();
        let entry = attempts.entry(identifier.to_string()).or_insert((0, Utc::now()));
        entry.0 += 1;
        entry.1 = Utc::now();
    }

    pub fn is_locked(&self, identifier: &str) -> Option<Duration> {
        let attempts = self.login_attempts.read().unwrap();
        if let Some((count, last_attempt)) = attempts.get(identifier) {
            if *count >= self.config.max_login_attempts {
                let lockout_end = *last_attempt + Duration::minutes(self.config.lockout_duration_minutes);
                let now = Utc::now();
                if now < lockout_end {
                    return Some(lockout_end - now);
                }
            }
        }
        None
    }

    pub fn clear_login_attempts(&self, identifier: &str) {
        self.login_attempts.write().unwrap().remove(identifier);
    }

    /// Verify a Google-issued ID token against the tokeninfo endpoint and
    /// return the verified email, enforcing the configured `aud`.
    pub async fn verify_google_id_token(&self, id_token: &str) -> Result<String> {
        let client_id = self
            .config
            .google_client_id
            .as_deref()
            .context("Google sign-in is not configured")?;

        let info: GoogleTokenInfo = self
            .http
            .get("https://oauth2.googleapis.com/tokeninfo")
            .query(&[("id_token", id_token)])
            .send()
            .await
            .context("failed to reach Google tokeninfo endpoint")?
            .error_for_status()
            .context("Google rejected the ID token")?
            .json()
            .await
            .context("malformed tokeninfo response")?;

        if info.aud != client_id {
            bail!("ID token audience does not match configured client id");
        }
        if info.email_verified != "true" {
            bail!("Google account email is not verified");
        }
        Ok(info.email)
    }

    pub fn access_token_expiry_minutes(&self) -> i64 {
        self.config.access_token_expiry_minutes
    }

    /// Clean up expired sessions and long-revoked tokens.
    pub fn cleanup(&self) {
        let now = Utc::now();
        {
            let mut sessions = self.sessions.write().unwrap();
            sessions.retain(|_, info| {
                now <= info.created_at + Duration::days(self.config.refresh_token_expiry_days)
            });
        }
        {
            let mut revoked = self.revoked_tokens.write().unwrap();
            revoked.retain(|_, revoked_at| now - *revoked_at <= Duration::days(7));
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleTokenInfo {
    aud: String,
    email: String,
    email_verified: String,
}

/// Generate a secure JWT secret
pub fn generate_jwt_secret() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes)
}

/// Hash a password with argon2id and a freshly generated salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("argon2 hashing failed: {e}"))
}

/// Verify a password against an argon2 hash produced by [`hash_password`].
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

/// Axum middleware for JWT authentication on the HTTP surface (the
/// WebSocket gateway authenticates via subprotocol instead, see
/// `server::gateway`).
pub async fn auth_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state.validate_token(token).map_err(|_| StatusCode::UNAUTHORIZED)?;
    if claims.token_type != TokenType::Access {
        return Err(StatusCode::UNAUTHORIZED);
    }

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

pub fn extract_claims(request: &Request) -> Option<&Claims> {
    request.extensions().get::<Claims>()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleLoginRequest {
    pub id_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_generation_and_validation_round_trips() {
        let state = AuthState::new(AuthConfig::default());
        let token = state.generate_access_token("person@example.com").unwrap();
        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "person@example.com");
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn revoked_token_fails_validation() {
        let state = AuthState::new(AuthConfig::default());
        let token = state.generate_access_token("person@example.com").unwrap();
        let claims = state.validate_token(&token).unwrap();
        state.revoke_token(&claims.jti).unwrap();
        assert!(state.validate_token(&token).is_err());
    }

    #[test]
    fn refresh_token_has_refresh_type() {
        let state = AuthState::new(AuthConfig::default());
        let token = state.generate_refresh_token("person@example.com").unwrap();
        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.token_type, TokenType::Refresh);
    }

    #[test]
    fn argon2_password_hash_round_trips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("wrong password", &hash).unwrap());
    }

    #[test]
    fn lockout_trips_after_max_attempts() {
        let state = AuthState::new(AuthConfig::default());
        for _ in 0..5 {
            state.record_failed_login("person@example.com");
        }
        assert!(state.is_locked("person@example.com").is_some());
    }
}
