use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// API keys accepted by the control surface.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Accepted keys. Empty = no auth required.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Empty `api_keys` disables auth.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn accepts(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key)
    }
}

/// Query-string form of the API key.
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// Key passed as `?api_key=`.
    pub api_key: Option<String>,
}

/// Validates the API key from the `Authorization: Bearer <key>` header, then
/// the `?api_key=<key>` query parameter.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let key_from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let key = key_from_header.or_else(|| query.api_key.clone());

    match key {
        Some(k) if auth.accepts(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_disabled() {
        assert!(!AuthConfig::default().is_enabled());
    }

    #[test]
    fn test_auth_config_enabled() {
        let config = AuthConfig::new(vec!["key123".to_string()]);
        assert!(config.is_enabled());
        assert!(config.accepts("key123"));
        assert!(!config.accepts("key12"));
    }
}
