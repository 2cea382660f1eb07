//! Main axum router, shared request helpers and the HTTP error type.
//!
//! Routes:
//! - `GET  /repositories/{repo}/info/refs?service=` - Smart HTTP ref advertisement
//! - `POST /repositories/{repo}/{service}`          - `git-upload-pack` / `git-receive-pack`
//! - `POST /api/repositories/create`                - Empty bare repository
//! - `POST /api/repositories/mirror`                - Mirror clone of a remote
//! - `POST /api/repositories/generate`              - Snapshot of the project working tree
//! - `GET  /api/repositories/{token}/tree`          - Recursive tree listing
//! - `GET  /api/repositories/{token}/file`          - Single blob
//! - `GET  /healthz`                                - Health check
//! - `GET  /metrics`                                - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::auth::{Identity, Permission};
use crate::metrics::AuthzOutcome;
use crate::store::StoreError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
///
/// This table is the only place routes are declared; axum prefers static
/// segments over captures, so `info/refs` never reaches the RPC route.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Git smart HTTP protocol endpoints
        .route(
            "/repositories/{repo}/info/refs",
            get(super::smart::handle_info_refs),
        )
        .route("/repositories/{repo}/{service}", post(super::smart::handle_rpc))
        // Repository management
        .route(
            "/api/repositories/create",
            post(super::manage::handle_create),
        )
        .route(
            "/api/repositories/mirror",
            post(super::manage::handle_mirror),
        )
        .route(
            "/api/repositories/generate",
            post(super::manage::handle_generate),
        )
        .route(
            "/api/repositories/{token}/tree",
            get(super::manage::handle_tree),
        )
        .route(
            "/api/repositories/{token}/file",
            get(super::manage::handle_file),
        )
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        config: Arc::clone(&state.config),
        runner: Arc::clone(&state.runner),
    };
    crate::health::health_handler(axum::extract::State(health_state)).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state.metrics.encode()?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Resolve `session` and check `permission` on `project`.
///
/// Missing or unresolvable credentials are `Unauthorized`; a resolved
/// identity that is denied is `Forbidden`.
pub(crate) async fn authorize(
    state: &AppState,
    session: Option<&str>,
    project: &str,
    permission: &Permission,
) -> Result<Identity, AppError> {
    let metrics = &state.metrics.metrics;

    let Some(session) = session.filter(|s| !s.is_empty()) else {
        metrics.record_authz(AuthzOutcome::Unauthenticated);
        return Err(AppError::Unauthorized("authentication required".into()));
    };

    let Some(identity) = state.identities.resolve_session(session).await? else {
        debug!("session did not resolve");
        metrics.record_authz(AuthzOutcome::Unauthenticated);
        return Err(AppError::Unauthorized("invalid or expired session".into()));
    };

    let decision = state.resolver.authorize(&identity, project, permission).await?;
    if !decision.allowed {
        warn!(
            identity = %identity.digest(),
            %permission,
            role = decision.role.as_deref().unwrap_or("-"),
            reason = %decision.reason,
            "access denied"
        );
        metrics.record_authz(AuthzOutcome::Denied);
        return Err(AppError::Forbidden(format!(
            "{permission} denied: {}",
            decision.reason
        )));
    }

    metrics.record_authz(AuthzOutcome::Allowed);
    Ok(identity)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Protocol endpoints render it as plain text; management endpoints wrap it
/// in [`ApiError`] for a JSON envelope.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// The caller is not authenticated.
    Unauthorized(String),
    /// The caller is authenticated but not allowed.
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    /// A git subprocess reported failure.  Carries its (redacted) stderr.
    GitFailed(String),
    /// An unexpected internal error.  Logged; never shown to the client.
    Internal(anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::GitFailed(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message.  Logs internal errors as a side effect.
    fn into_message(self) -> String {
        match self {
            Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::GitFailed(msg) => msg,
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                "internal server error".to_string()
            }
        }
    }

    fn with_challenge(status: StatusCode, response: Response) -> Response {
        if status == StatusCode::UNAUTHORIZED {
            let mut response = response;
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Basic realm=\"githost\""),
            );
            return response;
        }
        response
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let response = (status, self.into_message()).into_response();
        Self::with_challenge(status, response)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(_) => AppError::Conflict(err.to_string()),
            StoreError::NotFound(_) => AppError::NotFound(err.to_string()),
            StoreError::InvalidToken(_) | StoreError::InvalidPath(_) | StoreError::InvalidUrl(_) => {
                AppError::BadRequest(err.to_string())
            }
            StoreError::InitFailed(_) | StoreError::CloneFailed(_) | StoreError::CommitFailed(_) => {
                AppError::GitFailed(err.to_string())
            }
            StoreError::Internal(e) => AppError::Internal(e),
        }
    }
}

/// [`AppError`] rendered as `{"error": true, "errmsg": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let body = Json(json!({ "error": true, "errmsg": self.0.into_message() }));
        AppError::with_challenge(status, (status, body).into_response())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
