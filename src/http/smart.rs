//! Smart-HTTP protocol endpoints.
//!
//! Both entry points resolve the repository, validate the service and
//! authorize before a single protocol byte is produced; after that the
//! response is a stream owned by the git subprocess (see [`super::stream`]).

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::stream::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::handler::{authorize, AppError};
use super::stream::{InputInspector, InputStream, ProcessBody};
use crate::auth::{session_from_headers, Permission};
use crate::git::pktline::{pkt_lines, service_announcement, PktLine};
use crate::git::{commands, Service};
use crate::store::paths::token_from_segment;
use crate::AppState;

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /repositories/{repo}/info/refs?service=<svc>`
///
/// Emits `pkt-line("# service=<svc>\n")`, a flush packet, then the output of
/// `git <svc> --stateless-rpc --advertise-refs`.
#[instrument(skip_all, fields(%repo, service = query.service.as_deref().unwrap_or("")))]
pub(crate) async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = token_from_segment(&repo);
    let located = state.store.locate(token).await?;
    let service = parse_service(query.service.as_deref())?;
    authorize_service(&state, &headers, token, service).await?;

    let announcement = service_announcement(service.name())
        .context("failed to frame service announcement")?;
    let child = state
        .runner
        .start(commands::advertise_refs_spec(service, &located.path))
        .with_context(|| format!("failed to spawn git {}", service.subcommand()))?;
    debug!("streaming ref advertisement");

    let body = ProcessBody {
        service,
        prefix: Some(Bytes::from(announcement)),
        input: None,
        inspect: None,
        timeout: rpc_timeout(&state),
        metrics: Arc::clone(&state.metrics.metrics),
    }
    .into_body(child)
    .context("failed to attach to git subprocess")?;

    Ok(git_response(service.advertisement_content_type(), body))
}

/// `POST /repositories/{repo}/{service}`
///
/// The service comes from the path, never from the query string.  The
/// request body is piped into `git <svc> --stateless-rpc` while its output is
/// streamed back.
#[instrument(skip_all, fields(%repo, %service))]
pub(crate) async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Path((repo, service)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let token = token_from_segment(&repo);
    let located = state.store.locate(token).await?;
    let service = parse_service(Some(&service))?;
    authorize_service(&state, &headers, token, service).await?;

    let input = request_input(body, &headers, state.config.git.max_gzip_body_bytes).await?;
    let inspect = service.is_write().then(ref_update_logger);

    let child = state
        .runner
        .start(commands::stateless_rpc_spec(service, &located.path))
        .with_context(|| format!("failed to spawn git {}", service.subcommand()))?;

    let body = ProcessBody {
        service,
        prefix: None,
        input: Some(input),
        inspect,
        timeout: rpc_timeout(&state),
        metrics: Arc::clone(&state.metrics.metrics),
    }
    .into_body(child)
    .context("failed to attach to git subprocess")?;

    Ok(git_response(service.result_content_type(), body))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_service(raw: Option<&str>) -> Result<Service, AppError> {
    let raw = raw.ok_or_else(|| AppError::BadRequest("missing service parameter".into()))?;
    raw.parse()
        .map_err(|e: crate::git::service::UnknownService| AppError::BadRequest(e.to_string()))
}

/// Pushes always need `code:write`.  Fetches need `code:read` only when
/// `access.authorize_reads` is set.
async fn authorize_service(
    state: &AppState,
    headers: &HeaderMap,
    token: &str,
    service: Service,
) -> Result<(), AppError> {
    let permission = if service.is_write() {
        Permission::code_write()
    } else if state.config.access.authorize_reads {
        Permission::code_read()
    } else {
        return Ok(());
    };

    let session = session_from_headers(headers);
    let identity = authorize(state, session.as_deref(), token, &permission).await?;
    debug!(identity = %identity.digest(), %permission, "authorized");
    Ok(())
}

fn rpc_timeout(state: &AppState) -> Duration {
    Duration::from_secs(state.config.git.rpc_timeout_secs)
}

fn git_response(content_type: String, body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

/// The request body as a chunk stream.  Gzip-encoded bodies are buffered
/// (bounded by `limit` both before and after decompression) and inflated.
async fn request_input(body: Body, headers: &HeaderMap, limit: usize) -> Result<InputStream, AppError> {
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"));

    if !gzip {
        return Ok(body
            .into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed());
    }

    let compressed = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
    let inflated = tokio::task::spawn_blocking(move || gunzip(&compressed, limit))
        .await
        .context("decompression task panicked")??;
    debug!(bytes = inflated.len(), "inflated gzip request body");

    Ok(futures::stream::iter([Ok(inflated)]).boxed())
}

fn gunzip(data: &[u8], limit: usize) -> Result<Bytes, AppError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| AppError::BadRequest(format!("invalid gzip request body: {e}")))?;
    if out.len() > limit {
        return Err(AppError::BadRequest(format!(
            "decompressed request body exceeds {limit} bytes"
        )));
    }
    Ok(Bytes::from(out))
}

/// Logs the ref updates announced at the start of a push.
fn ref_update_logger() -> InputInspector {
    let mut first = true;
    Box::new(move |chunk: &[u8]| {
        if !std::mem::take(&mut first) {
            return;
        }
        for update in ref_updates(chunk) {
            info!(reference = %update.name, old = %update.old, new = %update.new, "ref update requested");
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
struct RefUpdate {
    old: String,
    new: String,
    name: String,
}

/// `<old> SP <new> SP <ref> [NUL capabilities] LF` lines up to the first flush.
fn ref_updates(data: &[u8]) -> Vec<RefUpdate> {
    pkt_lines(data)
        .map_while(|pkt| match pkt {
            PktLine::Data(line) => Some(line),
            _ => None,
        })
        .filter_map(|line| {
            let command = line.split(|b| *b == 0).next()?;
            let text = std::str::from_utf8(command).ok()?.trim_end();
            let mut parts = text.splitn(3, ' ');
            Some(RefUpdate {
                old: parts.next()?.to_string(),
                new: parts.next()?.to_string(),
                name: parts.next()?.to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
