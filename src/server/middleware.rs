//! Authentication middleware.
//!
//! Extracts the bearer credential, runs it through the resolver, and injects
//! the resulting [`Identity`] into request extensions for downstream
//! handlers. Failures short-circuit with a JSON error body and never panic
//! across the boundary.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;

/// Authentication middleware for protected routes
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let credential = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    match state.resolver.resolve(credential).await {
        Ok(identity) => {
            debug!(user_id = identity.user_id, path = %path, "Authenticated request");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Credential resolution failed");
            error_response(&e)
        }
    }
}

/// Render a resolution failure as the wire error contract.
///
/// Credential failures carry their message verbatim at 401; internal faults
/// get a generic 500 body so infrastructure detail never leaks.
fn error_response(error: &crate::Error) -> Response {
    let status = error.status_code();
    let message = if status.is_server_error() {
        "Internal server error".to_string()
    } else {
        error.to_string()
    };

    (status, Json(json!({ "error": message }))).into_response()
}
