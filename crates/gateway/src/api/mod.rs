//! Thin HTTP surface. Handlers parse, call the core, and serialize;
//! nothing else lives here.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use cortex_domain::error::Error;
use cortex_stores::ApiKeyRecord;
use serde::Deserialize;
use uuid::Uuid;

use crate::orchestrator::CortexOrchestrator;
use crate::state::AppState;

#[derive(Clone)]
pub struct ApiContext {
    pub state: AppState,
    pub orchestrator: Arc<CortexOrchestrator>,
}

pub fn router(ctx: ApiContext) -> Router {
    let protected = Router::new()
        .route("/v1/cortex/messages", post(post_message))
        .route("/v1/users/:user_id/events", get(event_stream))
        .route("/v1/tasks/:task_id", get(get_task))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .route_layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            crate::auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct MessageRequest {
    message: String,
    #[serde(default)]
    model_id: Option<String>,
}

fn error_response(e: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::CapacityExceeded { .. } | Error::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

async fn post_message(
    State(ctx): State<ApiContext>,
    Extension(key): Extension<ApiKeyRecord>,
    Json(body): Json<MessageRequest>,
) -> impl IntoResponse {
    if !key.has_execute_scope("cortex") {
        return error_response(Error::Auth("missing execute scope".into())).into_response();
    }
    match ctx
        .orchestrator
        .handle_user_message_sync(&key.user_id, &body.message, body.model_id)
        .await
    {
        Ok(response) => Json(serde_json::json!({ "response": response })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn event_stream(
    State(ctx): State<ApiContext>,
    Extension(key): Extension<ApiKeyRecord>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    if user_id != key.user_id || !key.has_read_scope("executions") {
        return error_response(Error::Auth("missing read scope".into())).into_response();
    }
    let subscriber_id = format!("sse-{}", Uuid::new_v4());
    let rx = ctx.state.bus.subscribe(&user_id, &subscriber_id, 64);

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some((Ok::<_, Infallible>(Event::default().data(data)), rx))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn get_task(
    State(ctx): State<ApiContext>,
    Extension(key): Extension<ApiKeyRecord>,
    Path(task_id): Path<Uuid>,
) -> impl IntoResponse {
    if !key.has_read_scope("executions") {
        return error_response(Error::Auth("missing read scope".into())).into_response();
    }
    match ctx.state.tasks.get(&key.user_id, &task_id) {
        Ok(task) => Json(serde_json::json!(task)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn cancel_task(
    State(ctx): State<ApiContext>,
    Extension(key): Extension<ApiKeyRecord>,
    Path(task_id): Path<Uuid>,
) -> impl IntoResponse {
    if !key.has_execute_scope("cortex") {
        return error_response(Error::Auth("missing execute scope".into())).into_response();
    }
    match ctx.orchestrator.cancel_task(&key.user_id, &task_id) {
        Ok(signalled) => Json(serde_json::json!({ "cancelled": signalled })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}
