//! Authentication module.
//!
//! Users live in the database; issued tokens live in an in-memory store and
//! expire after 24 hours. Handlers only ever see the resolved
//! `(user id, username)` pair; everything downstream of token
//! verification is role/membership logic in `policy`.

#![allow(dead_code)] // Token maintenance methods are part of the public API but not yet used internally

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::Response,
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::AppState;
use crate::db::entities::user;
use crate::db::now_ts;
use crate::error::{Result, ServerError};

/// Hash a password with salt
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"devsync-server-salt:");
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate a random-enough token
fn generate_token() -> String {
    let mut hasher = Sha256::new();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(timestamp.to_le_bytes());

    let thread_id = std::thread::current().id();
    hasher.update(format!("{:?}", thread_id).as_bytes());

    let stack_addr = &timestamp as *const _ as usize;
    hasher.update(stack_addr.to_le_bytes());

    let result = hasher.finalize();
    BASE64.encode(&result[..24])
}

/// An issued access token
#[derive(Clone, Debug)]
pub struct Token {
    pub token: String,
    pub user_id: i32,
    pub username: String,
    pub expires_at: SystemTime,
}

impl Token {
    fn new(user_id: i32, username: String, duration: Duration) -> Self {
        Self {
            token: generate_token(),
            user_id,
            username,
            expires_at: SystemTime::now() + duration,
        }
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.expires_at
    }
}

/// Token issuance and validation
pub struct AuthManager {
    tokens: DashMap<String, Token>,
    token_duration: Duration,
}

impl AuthManager {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            token_duration: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Verify credentials against the users table and issue a token
    pub async fn authenticate(
        &self,
        db: &DatabaseConnection,
        username: &str,
        password: &str,
    ) -> Result<Token> {
        let account = user::Entity::find()
            .filter(user::Column::Username.eq(username))
            .one(db)
            .await?
            .ok_or(ServerError::AuthFailed)?;

        if account.password_hash != hash_password(password) {
            return Err(ServerError::AuthFailed);
        }

        let token = Token::new(account.id, account.username, self.token_duration);
        self.tokens.insert(token.token.clone(), token.clone());
        Ok(token)
    }

    /// Issue a token directly for a known user (registration)
    pub fn issue_for(&self, user_id: i32, username: &str) -> Token {
        let token = Token::new(user_id, username.to_string(), self.token_duration);
        self.tokens.insert(token.token.clone(), token.clone());
        token
    }

    /// Validate a raw token string
    pub fn validate_token(&self, token_str: &str) -> Result<Token> {
        let token = self
            .tokens
            .get(token_str)
            .map(|entry| entry.value().clone())
            .ok_or(ServerError::AuthFailed)?;

        if token.is_expired() {
            self.tokens.remove(token_str);
            return Err(ServerError::AuthFailed);
        }

        Ok(token)
    }

    /// Parse an `Authorization: Bearer ...` header and validate
    pub fn validate_bearer(&self, auth_header: &str) -> Result<Token> {
        let token_str = auth_header
            .strip_prefix("Bearer ")
            .ok_or(ServerError::AuthFailed)?;
        self.validate_token(token_str)
    }

    /// Revoke a token
    pub fn revoke_token(&self, token_str: &str) {
        self.tokens.remove(token_str);
    }

    /// Cleanup expired tokens
    pub fn cleanup_expired_tokens(&self) {
        self.tokens.retain(|_, t| !t.is_expired());
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the calling user from request headers
pub fn extract_auth(headers: &HeaderMap, auth: &AuthManager) -> Option<Token> {
    let auth_header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    auth.validate_bearer(auth_header).ok()
}

/// Like [`extract_auth`], but missing/invalid credentials are an error
pub fn require_auth(headers: &HeaderMap, auth: &AuthManager) -> Result<Token> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .ok_or(ServerError::AuthRequired)?
        .to_str()
        .map_err(|_| ServerError::AuthRequired)?;
    auth.validate_bearer(header_value)
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Response> {
    let username = req.username.trim();
    if username.len() < 2 {
        return Err(ServerError::Validation(
            "Username must be at least 2 characters".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ServerError::Validation(
            "Username can only contain letters, numbers, dashes, and underscores".to_string(),
        ));
    }
    if req.password.len() < 6 {
        return Err(ServerError::Validation(
            "Password must be at least 6 characters".to_string(),
        ));
    }

    let existing = user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .one(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ServerError::Conflict("Username is already taken".to_string()));
    }

    let account = user::ActiveModel {
        username: Set(username.to_string()),
        password_hash: Set(hash_password(&req.password)),
        display_name: Set(req.display_name),
        email: Set(req.email),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    let token = state.auth.issue_for(account.id, &account.username);
    tracing::info!(user_id = account.id, username = %account.username, "user registered");

    Ok(super::created(
        "User registered",
        json!({ "token": token.token, "user": account }),
    ))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Response> {
    let token = state
        .auth
        .authenticate(&state.db, &req.username, &req.password)
        .await?;

    Ok(super::ok(
        "Logged in",
        json!({
            "token": token.token,
            "userId": token.user_id,
            "username": token.username,
            "expiresAt": token.expires_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }),
    ))
}
