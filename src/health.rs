use std::path::Path;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

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
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repos_path: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

async fn check_repos_path(path: &Path) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => CheckResult {
            ok: true,
            detail: None,
        },
        Ok(_) => CheckResult {
            ok: false,
            detail: Some("repository base is not a directory".into()),
        },
        Err(_) => CheckResult {
            ok: false,
            detail: Some("repository base is not accessible".into()),
        },
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET /health`: 200 with `{"status":"ok"}` while the repository base
/// directory is reachable, 503 otherwise.
pub async fn health_report(repos_path: &Path) -> (StatusCode, Json<HealthResponse>) {
    let repos_path = check_repos_path(repos_path).await;
    let status = if repos_path.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let code = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        code,
        Json(HealthResponse {
            status,
            checks: HealthChecks { repos_path },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_directory_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let check = check_repos_path(tmp.path()).await;
        assert!(check.ok);
        assert!(check.detail.is_none());
    }

    #[tokio::test]
    async fn report_maps_failure_to_503() {
        let tmp = tempfile::tempdir().unwrap();
        let (code, Json(body)) = health_report(tmp.path()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, HealthStatus::Ok);

        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let (code, Json(body)) = health_report(&file).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, HealthStatus::Unhealthy);
        assert!(!body.checks.repos_path.ok);
    }

    #[tokio::test]
    async fn missing_directory_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let check = check_repos_path(&tmp.path().join("nope")).await;
        assert!(!check.ok);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(HealthResponse {
            status: HealthStatus::Ok,
            checks: HealthChecks {
                repos_path: CheckResult { ok: true, detail: None },
            },
        })
        .unwrap();
        assert_eq!(json["status"], "ok");
    }
}
