//! Machine-level health and readiness endpoints.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use axum_helpers::{CheckFuture, check_dependencies};
use domain_status::{MachinePhase, Pm2Status, ServiceHealth};
use serde_json::{Value, json};

/// `GET /health` — per-service slice; 200 iff every supervised service's
/// process is online.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let snapshot = state.latest();

    let mut services = serde_json::Map::new();
    let mut all_online = true;
    for (key, service) in &snapshot.status.services {
        if service.pm2_status != Pm2Status::Online {
            all_online = false;
        }
        services.insert(
            key.clone(),
            json!({
                "pm2_status": service.pm2_status,
                "status": service.status,
                "health": service.health,
                "port": service.port,
            }),
        );
    }

    let code = if all_online {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if all_online { "healthy" } else { "unhealthy" },
        "name": state.app.name,
        "version": state.app.version,
        "services": Value::Object(services),
    });
    (code, Json(body))
}

/// `GET /ready` — 200 iff the machine phase is `ready` and every
/// non-health-server service reports healthy. The two conditions run as
/// independent dependency checks so the response names whichever one is
/// holding readiness back.
pub async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let snapshot = state.latest();

    let phase = snapshot.status.machine.phase;
    let mut unhealthy = Vec::new();
    for (key, service) in &snapshot.status.services {
        let service_type = snapshot
            .structure
            .services
            .get(key)
            .map(|i| i.service_type.as_str())
            .unwrap_or("");
        if service_type == "health-server" {
            continue;
        }
        if service.health != ServiceHealth::Healthy {
            unhealthy.push(key.clone());
        }
    }

    let checks: Vec<(&'static str, CheckFuture<'_>)> = vec![
        (
            "machine_phase",
            Box::pin(async move {
                if phase == MachinePhase::Ready {
                    Ok(())
                } else {
                    Err(format!("machine phase is {:?}", phase))
                }
            }),
        ),
        (
            "backend_services",
            Box::pin(async move {
                if unhealthy.is_empty() {
                    Ok(())
                } else {
                    Err(format!("unhealthy: {}", unhealthy.join(", ")))
                }
            }),
        ),
    ];

    let report = check_dependencies(checks).await;
    let code = report.status_code();
    let body = json!({
        "ready": report.ok,
        "phase": phase,
        "checks": report.dependencies,
    });
    (code, Json(body))
}
