// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes surfaced by the hub across HTTP and WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NameTaken,
    NotFound,
    Unauthorized,
    BadRequest,
    ExecutorOffline,
    Disconnected,
    Timeout,
    SpawnFailed,
    ProtocolError,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NameTaken => 409,
            Self::NotFound => 404,
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            // Placement errors at create time are client errors; transient
            // RPC failures during operation are server-side.
            Self::ExecutorOffline => 400,
            Self::Disconnected => 502,
            Self::Timeout => 504,
            Self::SpawnFailed => 400,
            Self::ProtocolError => 400,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NameTaken => "NAME_TAKEN",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::ExecutorOffline => "EXECUTOR_OFFLINE",
            Self::Disconnected => "DISCONNECTED",
            Self::Timeout => "TIMEOUT",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code plus the human-readable message that accompanies it.
#[derive(Debug, Clone)]
pub struct HubError {
    pub code: ErrorCode,
    pub message: String,
}

impl HubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} not found"))
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        self.code.to_http_response(self.message.clone())
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HubError {}

impl From<ErrorCode> for HubError {
    fn from(code: ErrorCode) -> Self {
        Self { code, message: code.as_str().to_owned() }
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
