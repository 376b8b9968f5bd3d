use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::process::Command;

use crate::AppState;

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
    pub repos: CheckResult,
    pub checkouts: CheckResult,
    pub git: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_dir(path: &Path, missing_ok: bool) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", path.display())),
        Err(e) if missing_ok && e.kind() == std::io::ErrorKind::NotFound => CheckResult {
            ok: true,
            detail: Some(format!("{} will be created on first checkout", path.display())),
        },
        Err(e) => CheckResult::unhealthy(format!("stat {} failed: {e}", path.display())),
    }
}

async fn check_git() -> CheckResult {
    let output = Command::new("git")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => CheckResult {
            ok: true,
            detail: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
        },
        Ok(output) => CheckResult::unhealthy(format!("git --version exited with {}", output.status)),
        Err(e) => CheckResult::unhealthy(format!("failed to run git: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Pushes need the repository root and `git`; checkouts only degrade
/// notifications.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.repos.ok || !checks.git.ok {
        HealthStatus::Unhealthy
    } else if !checks.checkouts.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (repos, checkouts, git) = tokio::join!(
        check_dir(&state.config.repos.root, false),
        check_dir(&state.config.repos.checkout_root, true),
        check_git(),
    );

    let checks = HealthChecks {
        repos,
        checkouts,
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

    fn checks(repos: bool, checkouts: bool, git: bool) -> HealthChecks {
        let result = |ok| CheckResult { ok, detail: None };
        HealthChecks {
            repos: result(repos),
            checkouts: result(checkouts),
            git: result(git),
        }
    }

    #[test]
    fn aggregate() {
        assert_eq!(aggregate_status(&checks(true, true, true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(true, false, true)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(false, true, true)), HealthStatus::Unhealthy);
        assert_eq!(aggregate_status(&checks(true, true, false)), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn missing_checkout_root_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(check_dir(&tmp.path().join("later"), true).await.ok);
        assert!(!check_dir(&tmp.path().join("later"), false).await.ok);
    }

    #[tokio::test]
    async fn file_is_not_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let result = check_dir(&file, true).await;
        assert!(!result.ok);
        assert!(result.detail.unwrap().contains("not a directory"));
    }
}
