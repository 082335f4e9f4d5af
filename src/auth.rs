use axum::{
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub name: String,
}

#[derive(Serialize)]
struct AuthError {
    success: bool,
    error: String,
}

/// Constant-time lookup of the caller a presented key belongs to.
fn identify<'a>(config: &'a AuthConfig, presented: &str) -> Option<&'a str> {
    config
        .api_keys
        .iter()
        .find(|entry| entry.key.as_bytes().ct_eq(presented.as_bytes()).into())
        .map(|entry| entry.name.as_str())
}

pub async fn auth_middleware<B>(
    Extension(config): Extension<std::sync::Arc<AuthConfig>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !config.enabled {
        req.extensions_mut().insert(CallerIdentity {
            name: "anonymous".to_string(),
        });
        return next.run(req).await;
    }

    let api_key = req
        .headers()
        .get("X-API-Key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match api_key {
        Some(key) => match identify(&config, key) {
            Some(name) => {
                tracing::debug!(caller = %name, "Authenticated request");
                req.extensions_mut().insert(CallerIdentity {
                    name: name.to_string(),
                });
                next.run(req).await
            }
            None => {
                tracing::warn!("Invalid API key presented");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(AuthError {
                        success: false,
                        error: "Invalid API key".to_string(),
                    }),
                )
                    .into_response()
            }
        },
        None => (
            StatusCode::UNAUTHORIZED,
            Json(AuthError {
                success: false,
                error: "Missing API key. Provide X-API-Key header or Authorization: Bearer <key>"
                    .to_string(),
            }),
        )
            .into_response(),
    }
}
