//! HTTP boundary: three form-encoded endpoints over the broker service.
//!
//! | Path               | Fields                    | Success            |
//! |--------------------|---------------------------|--------------------|
//! | `/RequestResource` | `poolID`, `client` (JSON) | 200 + JSON resource|
//! | `/GetResource`     | `poolID`, `id`            | 200 + JSON resource|
//! | `/Heartbeat`       | `poolID`, `id`, `client`  | 200, empty body    |
//!
//! Errors: 422 for an unparsable `client` field, 429 when the pool lock is
//! busy, 404 for unknown resources, 500 for everything else.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::debug;
use vend_core::{Client, Resource};

use crate::service::BrokerError;
use crate::state::AppState;

/// An error reply: plain status plus the error text as the body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let status = if err.is_acquire_later() {
            StatusCode::TOO_MANY_REQUESTS
        } else if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = %self.status, message = %self.message, "request failed");
        (self.status, self.message).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ResourceForm {
    #[serde(rename = "poolID")]
    pool_id: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    client: String,
}

fn parse_client(raw: &str) -> Result<Client, ApiError> {
    serde_json::from_str(raw)
        .map_err(|err| ApiError::unprocessable(format!("fail to parse the client field: {err}")))
}

async fn request_resource(
    State(state): State<AppState>,
    Form(form): Form<ResourceForm>,
) -> Result<Json<Resource>, ApiError> {
    let client = parse_client(&form.client)?;
    let resource = state.broker().request_resource(&form.pool_id, client).await?;
    Ok(Json(resource))
}

async fn get_resource(
    State(state): State<AppState>,
    Form(form): Form<ResourceForm>,
) -> Result<Json<Resource>, ApiError> {
    let resource = state.broker().get_resource(&form.pool_id, &form.id).await?;
    Ok(Json(resource))
}

async fn heartbeat(
    State(state): State<AppState>,
    Form(form): Form<ResourceForm>,
) -> Result<StatusCode, ApiError> {
    let client = parse_client(&form.client)?;
    state
        .broker()
        .heartbeat(&form.pool_id, &form.id, client)
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "vend-broker",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Build the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/RequestResource", post(request_resource))
        .route("/GetResource", post(get_resource))
        .route("/Heartbeat", post(heartbeat))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
