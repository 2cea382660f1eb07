use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::config::Config;
use crate::git::{commands, ProcessRunner};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repositories: CheckResult,
    pub projects: CheckResult,
    pub git: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: Option<String>) -> Self {
        Self { ok: true, detail }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
    pub runner: Arc<dyn ProcessRunner>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_dir(path: &Path) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(None),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", path.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", path.display())),
    }
}

async fn check_git(runner: &dyn ProcessRunner) -> CheckResult {
    match commands::version(runner).await {
        Ok(version) => CheckResult::healthy(Some(version)),
        Err(e) => CheckResult::unhealthy(format!("git --version failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Without repositories or git nothing can be served; a missing projects
    // root only breaks materialisation.
    if !checks.repositories.ok || !checks.git.ok {
        HealthStatus::Unhealthy
    } else if !checks.projects.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (repositories, projects, git) = tokio::join!(
        check_dir(&state.config.storage.repositories_path),
        check_dir(&state.config.storage.projects_path),
        check_git(state.runner.as_ref()),
    );

    let checks = HealthChecks {
        repositories,
        projects,
        git,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{failed_output, ok_output, FakeRunner};

    fn state(repos: &Path, projects: &Path, runner: FakeRunner) -> HealthState {
        let mut config = Config::default();
        config.storage.repositories_path = repos.to_path_buf();
        config.storage.projects_path = projects.to_path_buf();
        HealthState {
            config: Arc::new(config),
            runner: Arc::new(runner),
        }
    }

    #[tokio::test]
    async fn all_checks_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::with_handler(|_| ok_output("git version 2.43.0\n"));
        let resp = health_handler(State(state(tmp.path(), tmp.path(), runner)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_repositories_root_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let resp = health_handler(State(state(&tmp.path().join("nope"), tmp.path(), runner)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn aggregate() {
        let checks = |r, p, g| HealthChecks {
            repositories: CheckResult { ok: r, detail: None },
            projects: CheckResult { ok: p, detail: None },
            git: CheckResult { ok: g, detail: None },
        };
        assert_eq!(aggregate_status(&checks(true, true, true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(true, false, true)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(true, true, false)), HealthStatus::Unhealthy);
        assert_eq!(aggregate_status(&checks(false, true, true)), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn git_failure_is_reported() {
        let result = check_git(&FakeRunner::with_handler(|_| failed_output(127, "not found"))).await;
        assert!(!result.ok);
    }
}
