//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: catalog query plus a staging-directory disk probe

use crate::services::dedup_service::DedupService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

const PROBE_BYTES: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Cheap liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// HTTP 200 when both the catalog and the staging directory respond,
/// HTTP 503 otherwise. The body reports each check.
pub async fn readyz(State(service): State<DedupService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("catalog", check_catalog(&service).await);
    checks.insert("disk", check_disk(&service.objects.staging_dir()).await);

    let ready = checks.values().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
    };
    (status, Json(body))
}

async fn check_catalog(service: &DedupService) -> CheckStatus {
    match service.catalog.ping().await {
        Ok(1) => CheckStatus::passed(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

/// Write, read back and delete a probe file under `dir`.
async fn check_disk(dir: &Path) -> CheckStatus {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, PROBE_BYTES).await {
        return CheckStatus::failed(format!("could not write probe file: {}", e));
    }

    let status = match fs::read(&probe).await {
        Ok(bytes) if bytes == PROBE_BYTES => CheckStatus::passed(),
        Ok(_) => CheckStatus::failed("probe content mismatch".to_string()),
        Err(e) => CheckStatus::failed(format!("could not read probe file: {}", e)),
    };

    match fs::remove_file(&probe).await {
        Ok(()) => status,
        Err(e) if status.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe file: {}", e)),
        },
        Err(_) => status,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn passed() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
