// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use roost_core::LOCAL;

use crate::error::ErrorCode;
use crate::transport::AppState;

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Resolve the owning principal for a request.
///
/// `AUTH_DISABLED` collapses every owner to `"local"` (development only).
/// Otherwise a Bearer header or `?token=` must match the configured
/// operator token; account issuance is an external collaborator.
pub fn resolve_owner(
    config: &crate::config::HubConfig,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<String, ErrorCode> {
    if config.auth_disabled {
        return Ok(LOCAL.to_owned());
    }

    let expected = config.auth_token.as_deref().ok_or(ErrorCode::Unauthorized)?;

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    for candidate in [bearer, query_token].into_iter().flatten() {
        if constant_time_eq(candidate, expected) {
            return Ok(LOCAL.to_owned());
        }
    }

    Err(ErrorCode::Unauthorized)
}

/// Axum middleware enforcing session auth on owner-scoped API routes.
///
/// Exempt: `/api/health` and all WebSocket upgrades (`/ws/`), which
/// authenticate in their own handlers (query token or hello message).
pub async fn auth_layer(
    state: State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();

    if path == "/api/health" || path.starts_with("/ws/") {
        return next.run(req).await;
    }

    if let Err(code) = resolve_owner(&state.config, req.headers(), None) {
        let body = crate::error::ErrorResponse { error: code.to_error_body("unauthorized") };
        return (
            StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            axum::Json(body),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
