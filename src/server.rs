//! Dashboard API server.
//!
//! Serves the same read surface the CLI uses, as JSON. Every view carries
//! its freshness markers so a dashboard can flag degraded data; provider
//! outages surface as warnings inside a 200, not as HTTP errors. A browser
//! shell layered on top must fetch navigations network-first (cached shell
//! only on network failure) and other assets cache-first; reversing that
//! would silently render stale balances while online.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use bankfeed_core::{Error, ProviderError, VaultError};

use crate::auth;
use crate::config::Config;
use crate::sync::SyncService;

pub async fn run(config: &Config, service: Arc<SyncService>) -> bankfeed_core::Result<()> {
    let auth_config = Arc::new(config.auth.clone());

    let api = Router::new()
        .route("/accounts", get(accounts))
        .route("/transactions", get(transactions))
        .route("/setup", post(setup))
        .route("/sync", post(force_sync))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(Extension(auth_config));

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(service);

    let addr = config.listen_addr();
    tracing::info!(%addr, "dashboard API listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::Config(format!("server error: {e}")))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn accounts(State(service): State<Arc<SyncService>>) -> Response {
    match service.get_accounts(false).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct TransactionsParams {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn transactions(
    State(service): State<Arc<SyncService>>,
    Query(params): Query<TransactionsParams>,
) -> Response {
    match service.get_transactions(params.days, false).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct SetupRequest {
    #[serde(default = "default_provider_name")]
    provider: String,
    token: String,
}

fn default_provider_name() -> String {
    "simplefin".to_string()
}

async fn setup(
    State(service): State<Arc<SyncService>>,
    Json(request): Json<SetupRequest>,
) -> Response {
    if request.provider != service.provider_name() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "error": format!("unsupported provider {:?}", request.provider),
            })),
        )
            .into_response();
    }
    match service.setup(&request.token).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn force_sync(State(service): State<Arc<SyncService>>) -> Response {
    match service.get_accounts(true).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

/// Actionable failures (setup required, secret mismatch, rejected token) map
/// to client-side statuses; everything else is a gateway or server error.
fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Vault(VaultError::NotConfigured) => StatusCode::CONFLICT,
        Error::Vault(VaultError::Locked) => StatusCode::CONFLICT,
        Error::Provider(ProviderError::InvalidToken(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Provider(ProviderError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}
