use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{ETAG, IF_MATCH, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flagpanel_lib::api::{
    DeleteManyRequest, ErrorBody, FlagCommand, SessionResponse, SignInRequest, UpsertRequest,
    WriteResponse,
};
use flagpanel_lib::{FlagError, FlagListing, Revision};
use tracing::{error, warn};

use super::auth::{authenticate, clear_session_cookie, request_token, session_cookie, unauthorized};
use super::metrics::metrics;
use super::state::AppState;

// ── Helpers ──────────────────────────────────────────────────

/// `If-Match` as the revision the client last saw.
fn expected_revision(headers: &HeaderMap) -> Option<Revision> {
    headers
        .get(IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .and_then(Revision::from_etag)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Map a repository failure to a status and body. Storage details are logged
/// and replaced by `failure`.
fn flag_error(err: FlagError, failure: &'static str) -> Response {
    match err {
        FlagError::Unauthorized => unauthorized(),
        FlagError::InvalidArgument(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        FlagError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Flag not found"),
        FlagError::Conflict(msg) => error_response(StatusCode::CONFLICT, msg),
        FlagError::StorageUnavailable(detail) | FlagError::Transport(detail) => {
            error!(%detail, "{}", failure);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, failure)
        }
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    warn!(error = %rejection.body_text(), "malformed request body");
    error_response(StatusCode::BAD_REQUEST, "Invalid request body")
}

fn with_etag(mut response: Response, revision: Option<&Revision>) -> Response {
    if let Some(value) = revision.and_then(|r| HeaderValue::from_str(&r.to_etag()).ok()) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}

fn written(revision: Option<Revision>) -> Response {
    let etag = revision.clone();
    with_etag(
        Json(WriteResponse {
            success: true,
            revision,
        })
        .into_response(),
        etag.as_ref(),
    )
}

fn observe_listing(listing: &FlagListing) {
    let m = metrics();
    m.flags_total.set(listing.flags.len() as i64);
    m.maintenance_mode.set(i64::from(listing.is_maintenance));
}

// ── GET /flags ───────────────────────────────────────────────

pub async fn handle_list_flags(State(state): State<Arc<AppState>>) -> Response {
    let listing = state.repository.list().await;
    observe_listing(&listing);
    let revision = listing.revision.clone();
    with_etag(Json(listing).into_response(), revision.as_ref())
}

// ── POST /flags ──────────────────────────────────────────────

pub async fn handle_upsert_flags(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<UpsertRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let expected = expected_revision(&headers);
    let repo = &state.repository;
    let start = Instant::now();

    let (operation, result) = match body.into_command() {
        FlagCommand::Batch(batch) => (
            "batch",
            repo.batch_upsert(
                batch.into_iter().map(|f| (f.key, f.enabled)),
                expected.as_ref(),
            )
            .await,
        ),
        FlagCommand::Upsert {
            key,
            enabled,
            old_key,
        } => (
            "upsert",
            repo.upsert(&key, enabled, old_key.as_deref(), expected.as_ref())
                .await,
        ),
        FlagCommand::SetMaintenance(enabled) => (
            "maintenance",
            repo.set_maintenance(enabled, expected.as_ref()).await,
        ),
        FlagCommand::Missing => {
            return error_response(StatusCode::BAD_REQUEST, "Key is required");
        }
    };

    metrics().record_write(operation, result.is_ok(), start);
    match result {
        Ok(revision) => written(revision),
        Err(e) => flag_error(e, "Failed to update flags"),
    }
}

// ── DELETE /flags/{key} ──────────────────────────────────────

pub async fn handle_delete_flag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    let expected = expected_revision(&headers);
    let start = Instant::now();
    let result = state.repository.delete(&key, expected.as_ref()).await;
    metrics().record_write("delete", result.is_ok(), start);

    match result {
        Ok(revision) => written(revision),
        Err(e) => flag_error(e, "Failed to delete flag"),
    }
}

/// `DELETE /flags/` with an empty key segment.
pub async fn handle_delete_blank_key() -> Response {
    error_response(StatusCode::BAD_REQUEST, "Key is required")
}

// ── POST /flags/delete ───────────────────────────────────────

pub async fn handle_delete_many(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<DeleteManyRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let expected = expected_revision(&headers);
    let start = Instant::now();
    let result = state
        .repository
        .delete_many(&body.keys, expected.as_ref())
        .await;
    metrics().record_write("delete_many", result.is_ok(), start);

    match result {
        Ok(outcome) => {
            let revision = outcome.revision.clone();
            with_etag(
                Json(serde_json::json!({
                    "success": true,
                    "deleted": outcome.deleted,
                    "missing": outcome.missing,
                    "revision": outcome.revision,
                }))
                .into_response(),
                revision.as_ref(),
            )
        }
        Err(e) => flag_error(e, "Failed to delete flags"),
    }
}

// ── /auth ────────────────────────────────────────────────────

pub async fn handle_sign_in(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SignInRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };

    match state.sessions.sign_in(&body.email, &body.password).await {
        Ok((token, user)) => {
            metrics().sign_ins_total.with_label_values(&["ok"]).inc();
            let cookie = session_cookie(
                &token,
                state.sessions.ttl(),
                state.config.auth.cookie_secure,
            );
            let mut response = Json(SessionResponse {
                user,
                token: Some(token),
            })
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                response.headers_mut().insert(SET_COOKIE, value);
            }
            response
        }
        Err(_) => {
            metrics().sign_ins_total.with_label_values(&["rejected"]).inc();
            error_response(StatusCode::UNAUTHORIZED, "Invalid email or password")
        }
    }
}

pub async fn handle_sign_out(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = request_token(&headers) {
        state.sessions.sign_out(&token).await;
    }

    let cookie = clear_session_cookie(state.config.auth.cookie_secure);
    let mut response = Json(serde_json::json!({"success": true})).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

pub async fn handle_session(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match authenticate(&state, &headers).await {
        Some(user) => Json(SessionResponse { user, token: None }).into_response(),
        None => unauthorized(),
    }
}
