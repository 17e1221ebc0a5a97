//! HTTP handlers.
//!
//! Public account routes (register, login, health) and protected routes
//! (identity echo, Earth Engine query). Protected routes read the
//! [`Identity`] the auth middleware placed in request extensions.

use std::sync::Arc;

use argon2::{
    Argon2, PasswordHasher, PasswordVerifier,
    password_hash::{PasswordHash, SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::AppState;
use crate::directory::{Identity, NewIdentity};
use crate::google::UpstreamError;

/// Request body for register and login
#[derive(Debug, Deserialize)]
pub struct CredentialsBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": state.cache.stats(),
    }))
}

/// POST /auth/register — create a local password account and issue a token
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> Response {
    if body.email.is_empty() || body.password.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "email and password are required");
    }

    if state.directory.find_by_email(&body.email).await.is_some() {
        return error_body(StatusCode::CONFLICT, "email already registered");
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = match Argon2::default().hash_password(body.password.as_bytes(), &salt) {
        Ok(hash) => hash.to_string(),
        Err(e) => {
            warn!(error = %e, "Password hashing failed");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    let user = match state
        .directory
        .create(NewIdentity {
            email: body.email.clone(),
            password_hash: Some(password_hash),
            ..NewIdentity::default()
        })
        .await
    {
        Ok(user) => user,
        Err(e) => {
            warn!(error = %e, "Account creation failed");
            return error_body(StatusCode::CONFLICT, "email already registered");
        }
    };

    info!(user_id = user.user_id, "Account registered");
    issue_token_response(&state, user.user_id, &user.email, user.provider_id.as_deref())
}

/// POST /auth/login — verify a local password and issue a token
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> Response {
    if body.email.is_empty() || body.password.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "email and password are required");
    }

    // Same rejection for unknown email and wrong password
    let Some(user) = state.directory.find_by_email(&body.email).await else {
        return error_body(StatusCode::UNAUTHORIZED, "invalid email or password");
    };
    let Some(ref stored_hash) = user.password_hash else {
        return error_body(StatusCode::UNAUTHORIZED, "invalid email or password");
    };

    let verified = PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(body.password.as_bytes(), &parsed)
            .is_ok()
    });
    if !verified {
        warn!(user_id = user.user_id, "Password verification failed");
        return error_body(StatusCode::UNAUTHORIZED, "invalid email or password");
    }

    info!(user_id = user.user_id, "Login succeeded");
    issue_token_response(&state, user.user_id, &user.email, user.provider_id.as_deref())
}

/// Query parameters Google appends to the OAuth callback
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// GET /auth/google — redirect to Google's consent screen.
///
/// Offline access with forced consent, so the callback receives a refresh
/// token; without it no stored account could ever satisfy a later refresh.
pub async fn google_auth_handler(State(state): State<Arc<AppState>>) -> Response {
    let scopes = state.google.scopes.join(" ");
    let url = reqwest::Url::parse_with_params(
        &state.google.auth_endpoint,
        &[
            ("client_id", state.google.resolve_client_id().as_str()),
            ("redirect_uri", state.google.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scopes.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    );

    match url {
        Ok(url) => Redirect::temporary(url.as_str()).into_response(),
        Err(e) => {
            warn!(error = %e, "Consent URL construction failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// GET /auth/google/callback — finish account linking.
///
/// Exchanges the authorization code, identifies the principal, and persists
/// the token pair: a new principal gets a fresh record, a returning one gets
/// its tokens updated with the refresh token preserved when Google omits it.
pub async fn google_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(denial) = params.error {
        warn!(error = %denial, "Google consent denied");
        return error_body(StatusCode::UNAUTHORIZED, "Google authorization was denied");
    }
    let Some(code) = params.code else {
        return error_body(StatusCode::BAD_REQUEST, "missing authorization code");
    };

    let grant = match state.upstream.exchange_code(&code).await {
        Ok(grant) => grant,
        Err(UpstreamError::GrantRevoked(detail)) => {
            warn!(detail = %detail, "Authorization code rejected");
            return error_body(StatusCode::UNAUTHORIZED, "authorization code rejected");
        }
        Err(UpstreamError::Timeout) => {
            return error_body(StatusCode::GATEWAY_TIMEOUT, "Google did not answer in time");
        }
        Err(e) => {
            warn!(error = %e, "Code exchange failed");
            return error_body(StatusCode::BAD_GATEWAY, "Google code exchange failed");
        }
    };

    let info = match state.upstream.introspect(&grant.access_token).await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "Introspection of freshly granted token failed");
            return error_body(StatusCode::BAD_GATEWAY, "Google identity lookup failed");
        }
    };
    if info.email.is_empty() {
        return error_body(StatusCode::BAD_GATEWAY, "Google returned no email");
    }

    let result = if state
        .directory
        .find_by_provider_id(&info.provider_id)
        .await
        .is_some()
    {
        // Returning account: refresh token only overwritten when present
        state
            .directory
            .update_tokens(
                &info.provider_id,
                &grant.access_token,
                grant.refresh_token.as_deref(),
            )
            .await
    } else {
        state
            .directory
            .create(NewIdentity {
                email: info.email.clone(),
                provider_id: Some(info.provider_id.clone()),
                access_token: Some(grant.access_token.clone()),
                refresh_token: grant.refresh_token.clone(),
                ..NewIdentity::default()
            })
            .await
    };

    match result {
        Ok(user) => {
            info!(user_id = user.user_id, "Google account linked");
            issue_token_response(&state, user.user_id, &user.email, user.provider_id.as_deref())
        }
        Err(e) => {
            warn!(error = %e, "Persisting linked account failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// GET /api/me — echo the resolved identity, minus token material
pub async fn me_handler(Extension(identity): Extension<Identity>) -> Json<Value> {
    Json(json!({
        "user_id": identity.user_id,
        "email": identity.email,
        "provider_id": identity.provider_id,
        "google_linked": identity.refresh_token.is_some(),
    }))
}

/// POST /api/earthengine/query — forward a query with the caller's token
pub async fn earthengine_query_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<Value>,
) -> Response {
    let Some(ref access_token) = identity.access_token else {
        // Local-only accounts have nothing to authorize downstream with
        return error_body(
            StatusCode::UNAUTHORIZED,
            "account has no Google authorization; sign in with Google",
        );
    };

    match state.earthengine.query(access_token, body).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            warn!(user_id = identity.user_id, error = %e, "Earth Engine query failed");
            error_body(e.status_code(), "Earth Engine query failed")
        }
    }
}

/// Issue a local token and render the login/register success body
fn issue_token_response(
    state: &AppState,
    user_id: i64,
    email: &str,
    provider_id: Option<&str>,
) -> Response {
    match state.validator.issue(user_id, email, provider_id) {
        Ok(token) => Json(json!({
            "token": token,
            "user": { "user_id": user_id, "email": email },
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Token issuance failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
