//! Bearer token authentication for connection attempts.
//!
//! Token issuance lives elsewhere; the acceptor only needs a validated
//! `(user, device)` pair. [`TokenValidator`] is that seam, and
//! [`StaticTokens`] serves tokens provisioned in the config file.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Authentication failures. Each maps to a 401 response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid token type")]
    WrongTokenType,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Token purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Identity carried by a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: String,
    pub device_id: String,
    pub kind: TokenKind,
}

/// Validates bearer tokens.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Resolve a token to its claims.
    async fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// A provisioned token, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    pub device_id: String,
    #[serde(default = "default_kind")]
    pub kind: TokenKind,
}

fn default_kind() -> TokenKind {
    TokenKind::Access
}

/// In-memory token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Claims>,
}

impl StaticTokens {
    #[must_use]
    pub fn new(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|entry| {
                let claims = Claims {
                    user_id: entry.user_id.clone(),
                    device_id: entry.device_id.clone(),
                    kind: entry.kind,
                };
                (entry.token.clone(), claims)
            })
            .collect();
        Self { tokens }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Pick the bearer token from `?token=` or `Authorization: Bearer`.
///
/// The query parameter wins when both are present.
#[must_use]
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Some(token.to_string()),
        _ => None,
    }
}

/// Authenticate a connection attempt. Only access tokens are accepted.
///
/// # Errors
///
/// Returns an error if the token is missing, unknown, or not an access token.
pub async fn authenticate(
    validator: &dyn TokenValidator,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<Claims, AuthError> {
    let token = extract_token(query_token, headers).ok_or(AuthError::MissingToken)?;
    let claims = validator.validate(&token).await?;
    if claims.kind != TokenKind::Access {
        return Err(AuthError::WrongTokenType);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn validator() -> StaticTokens {
        StaticTokens::new(&[
            TokenEntry {
                token: "access-1".into(),
                user_id: "u1".into(),
                device_id: "d1".into(),
                kind: TokenKind::Access,
            },
            TokenEntry {
                token: "refresh-1".into(),
                user_id: "u1".into(),
                device_id: "d1".into(),
                kind: TokenKind::Refresh,
            },
        ])
    }

    fn bearer(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            extract_token(Some("q"), &bearer("Bearer h")),
            Some("q".to_string())
        );
        assert_eq!(extract_token(None, &bearer("Bearer h")), Some("h".to_string()));
        assert_eq!(extract_token(Some(""), &bearer("Bearer h")), Some("h".to_string()));
        assert_eq!(extract_token(None, &bearer("Basic h")), None);
        assert_eq!(extract_token(None, &bearer("Bearer a b")), None);
        assert_eq!(extract_token(None, &HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_authenticate() {
        let tokens = validator();
        let claims = authenticate(&tokens, Some("access-1"), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.device_id, "d1");

        assert_eq!(
            authenticate(&tokens, None, &HeaderMap::new()).await,
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            authenticate(&tokens, Some("nope"), &HeaderMap::new()).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            authenticate(&tokens, None, &bearer("Bearer refresh-1")).await,
            Err(AuthError::WrongTokenType)
        );
    }

    #[test]
    fn test_rejection_is_unauthorized() {
        let response = AuthError::InvalidToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
