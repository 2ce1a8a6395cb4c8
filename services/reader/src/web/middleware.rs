//! services/reader/src/web/middleware.rs
//!
//! Authentication middleware. Every protected route runs through
//! `require_auth`, which turns the opaque session cookie into the reader's
//! user id via the identity port.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::AppState;

const SESSION_COOKIE: &str = "session";

/// Picks the session token out of a raw `Cookie` header value.
fn session_token(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}

/// Resolves the session cookie to a user id and stores it in the request
/// extensions; requests without a valid session get a 401.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_token)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let user_id = state.identity.validate_session(token).await.map_err(|e| {
        warn!("Failed to validate session: {e}");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(user_id);

    Ok(next.run(req).await)
}
