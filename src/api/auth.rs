//! Bearer-token authentication for protected routes.

use axum::{
    Json,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct AuthState {
    pub token: SecretString,
}

impl AuthState {
    fn accepts(&self, provided: &str) -> bool {
        bool::from(
            provided
                .as_bytes()
                .ct_eq(self.token.expose_secret().as_bytes()),
        )
    }
}

/// Reject requests without `Authorization: Bearer <token>`.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(token) if auth.accepts(token.trim()) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "kind": "unauthorized",
                "code": "auth.invalid_token",
                "retryable": false,
                "message": "missing or invalid bearer token",
            })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_is_exact() {
        let auth = AuthState {
            token: SecretString::from("s3cret".to_string()),
        };
        assert!(auth.accepts("s3cret"));
        assert!(!auth.accepts("s3cre"));
        assert!(!auth.accepts("s3cret!"));
        assert!(!auth.accepts(""));
    }
}
