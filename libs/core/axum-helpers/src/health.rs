//! Process-level probes shared by fleet services.
//!
//! Two layers of health live on a machine. Machine health (process table,
//! backend probes, phase) belongs to the orchestrator's own endpoints.
//! This module covers the layer below: "is this process up at all"
//! (`/healthz`) and the generic fold of several dependency checks into one
//! ready/not-ready verdict.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use core_config::AppIdentity;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// One dependency's verdict inside a readiness report.
#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated verdict over a set of dependency checks.
#[derive(Debug, Serialize)]
pub struct DependencyReport {
    pub ok: bool,
    pub dependencies: BTreeMap<&'static str, DependencyStatus>,
}

impl DependencyReport {
    /// 200 when everything is up, 503 otherwise.
    pub fn status_code(&self) -> StatusCode {
        if self.ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// A boxed dependency check. Resolve to `Err(reason)` when the dependency
/// should make the caller report not-ready.
pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Run every check concurrently and fold the verdicts into one report.
///
/// All checks always run; a readiness page that stops at the first failure
/// hides the second broken dependency from whoever is debugging the
/// machine.
pub async fn check_dependencies(
    checks: Vec<(&'static str, CheckFuture<'_>)>,
) -> DependencyReport {
    let (names, futures): (Vec<_>, Vec<_>) = checks.into_iter().unzip();
    let results = join_all(futures).await;

    let mut ok = true;
    let mut dependencies = BTreeMap::new();
    for (name, result) in names.into_iter().zip(results) {
        let status = match result {
            Ok(()) => DependencyStatus {
                up: true,
                error: None,
            },
            Err(reason) => {
                tracing::warn!(dependency = name, reason = %reason, "Dependency check failed");
                ok = false;
                DependencyStatus {
                    up: false,
                    error: Some(reason),
                }
            }
        };
        dependencies.insert(name, status);
    }

    DependencyReport { ok, dependencies }
}

/// What `/healthz` answers.
#[derive(Debug, Serialize)]
pub struct LivenessReport {
    pub alive: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Liveness handler: answering at all is the signal. Identity is included
/// so a fleet operator can tell which build a machine runs without shelling
/// into it.
pub async fn liveness_handler(State(identity): State<AppIdentity>) -> Json<LivenessReport> {
    Json(LivenessReport {
        alive: true,
        service: identity.name,
        version: identity.version,
    })
}

/// Router exposing `/healthz` for process-level probes.
pub fn liveness_router(identity: AppIdentity) -> Router {
    Router::new()
        .route("/healthz", get(liveness_handler))
        .with_state(identity)
}
