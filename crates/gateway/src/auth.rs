//! API-key authentication middleware.
//!
//! Protected routes require `Authorization: Bearer clv_<64 hex>`. The key
//! is verified against stored digests in constant time; the matching
//! record (with its scopes) is attached to the request for handlers to
//! consult.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::ApiContext;

pub async fn require_api_key(
    State(ctx): State<ApiContext>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    match ctx.state.api_keys.verify(presented) {
        Some(record) => {
            req.extensions_mut().insert(record);
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API key" })),
        )
            .into_response(),
    }
}
