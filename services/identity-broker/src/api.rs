//! Pool HTTP API
//!
//! Endpoints (`consumer` names the calling worker and is only used for logs):
//! - POST   /pools/{pool}/acquire                   — `{consumer, lease?}` → 200 `{identity}` | 204
//! - GET    /pools/{pool}                           — pool health summary
//! - GET    /pools/{pool}/identities                — active identities, payload included
//! - PUT    /pools/{pool}/identities/{id}           — `{consumer, data}` replace payload
//! - DELETE /pools/{pool}/identities/{id}?consumer= — remove identity
//! - POST   /pools/{pool}/identities/{id}/{action}  — `{consumer}`; lease, release, touch, renew, deprecate
//!
//! Mutations answer `{"applied": bool}`. Unknown identity ids are not errors:
//! another worker may already have removed them.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use identity_pool::{AcquireOptions, Pool};
use serde::Deserialize;

use crate::error::ApiError;

/// Pools by name, fixed at startup.
pub type Pools = Arc<BTreeMap<String, Pool>>;

#[derive(Clone)]
pub struct ApiState {
    pools: Pools,
}

impl ApiState {
    pub fn new(pools: Pools) -> Self {
        Self { pools }
    }

    fn pool(&self, name: &str) -> Result<&Pool, ApiError> {
        self.pools
            .get(name)
            .ok_or_else(|| ApiError::UnknownPool(name.to_string()))
    }
}

pub fn build_pool_router(state: ApiState) -> Router {
    Router::new()
        .route("/pools/{pool}", get(pool_status))
        .route("/pools/{pool}/acquire", post(acquire))
        .route("/pools/{pool}/identities", get(list_identities))
        .route(
            "/pools/{pool}/identities/{id}",
            put(update_identity).delete(remove_identity),
        )
        .route("/pools/{pool}/identities/{id}/{action}", post(identity_action))
        .with_state(state)
}

#[derive(Deserialize)]
struct AcquireRequest {
    consumer: String,
    #[serde(default)]
    lease: bool,
}

#[derive(Deserialize)]
struct ConsumerRequest {
    consumer: String,
}

#[derive(Deserialize)]
struct UpdateRequest {
    consumer: String,
    data: serde_json::Value,
}

fn require_consumer(consumer: &str) -> Result<&str, ApiError> {
    if consumer.trim().is_empty() {
        return Err(ApiError::BadRequest("consumer must not be empty".into()));
    }
    Ok(consumer)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn applied(applied: bool) -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "applied": applied }))
}

/// POST /pools/{pool}/acquire — may block while the pool creates or waits.
async fn acquire(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
    Json(request): Json<AcquireRequest>,
) -> Result<Response, ApiError> {
    let pool = state.pool(&pool)?;
    let consumer = require_consumer(&request.consumer)?;
    let options = AcquireOptions {
        lease: request.lease,
    };

    match pool.acquire(consumer, options).await? {
        Some(identity) => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({ "identity": identity }),
        )),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// GET /pools/{pool} — status summary; never exposes payloads.
async fn pool_status(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
) -> Result<Response, ApiError> {
    let pool = state.pool(&pool)?;
    Ok(json_response(StatusCode::OK, pool.health().await))
}

async fn list_identities(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
) -> Result<Response, ApiError> {
    let pool = state.pool(&pool)?;
    let identities = pool.identities().await;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "identities": identities }),
    ))
}

async fn update_identity(
    State(state): State<ApiState>,
    Path((pool, id)): Path<(String, String)>,
    Json(request): Json<UpdateRequest>,
) -> Result<Response, ApiError> {
    let pool = state.pool(&pool)?;
    let consumer = require_consumer(&request.consumer)?;
    Ok(applied(pool.update(consumer, &id, request.data).await))
}

async fn remove_identity(
    State(state): State<ApiState>,
    Path((pool, id)): Path<(String, String)>,
    Query(request): Query<ConsumerRequest>,
) -> Result<Response, ApiError> {
    let pool = state.pool(&pool)?;
    let consumer = require_consumer(&request.consumer)?;
    Ok(applied(pool.remove(consumer, &id).await))
}

async fn identity_action(
    State(state): State<ApiState>,
    Path((pool, id, action)): Path<(String, String, String)>,
    Json(request): Json<ConsumerRequest>,
) -> Result<Response, ApiError> {
    let pool = state.pool(&pool)?;
    let consumer = require_consumer(&request.consumer)?;

    let result = match action.as_str() {
        "lease" => pool.lease(consumer, &id).await,
        "release" => pool.release(consumer, &id).await,
        "touch" => pool.touch(consumer, &id).await,
        "renew" => pool.renew(consumer, &id).await,
        "deprecate" => pool.deprecate(consumer, &id).await,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown action: {other} (expected lease, release, touch, renew or deprecate)"
            )));
        }
    };
    Ok(applied(result))
}
