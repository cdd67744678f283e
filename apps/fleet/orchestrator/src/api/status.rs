//! Full status and per-service drill-down endpoints.

use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde_json::{Value, json};

/// `GET /status` — the full runtime status plus derived fields.
pub async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.latest();
    let base = snapshot.health_url.trim_end_matches("/health").to_string();

    let mut body = serde_json::to_value(&snapshot).expect("snapshot serializes");
    if let Value::Object(ref mut map) = body {
        map.insert(
            "uptime_ms".to_string(),
            json!(snapshot.status.machine.uptime_ms),
        );
        map.insert(
            "endpoints".to_string(),
            json!({
                "health": format!("{}/health", base),
                "ready": format!("{}/ready", base),
                "status": format!("{}/status", base),
                "services": format!("{}/services", base),
            }),
        );
    }
    Json(body)
}

/// `GET /services` — per-service runtime joined with the structure entry.
pub async fn services_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.latest();
    let mut services = serde_json::Map::new();
    for (key, runtime) in &snapshot.status.services {
        let instance = snapshot.structure.services.get(key);
        services.insert(
            key.clone(),
            json!({
                "service_type": instance.map(|i| i.service_type.clone()),
                "worker_id": instance.map(|i| i.worker_id.clone()),
                "pm2_name": instance.map(|i| i.pm2_name.clone()),
                "port": runtime.port.or(instance.and_then(|i| i.port)),
                "status": runtime.status,
                "health": runtime.health,
                "pm2_status": runtime.pm2_status,
            }),
        );
    }
    Json(json!({ "services": Value::Object(services) }))
}

/// `GET /services/{name}/health` — drill-down by service key or pm2 name.
pub async fn service_health_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let snapshot = state.latest();

    let found = snapshot
        .status
        .services
        .get(&name)
        .map(|runtime| (name.clone(), runtime.clone()))
        .or_else(|| {
            snapshot
                .structure
                .services
                .values()
                .find(|i| i.pm2_name == name)
                .and_then(|i| {
                    snapshot
                        .status
                        .services
                        .get(&i.service_key)
                        .map(|runtime| (i.service_key.clone(), runtime.clone()))
                })
        });

    match found {
        Some((service_key, runtime)) => Ok(Json(json!({
            "service": service_key,
            "health": runtime.health,
            "status": runtime.status,
            "pm2_status": runtime.pm2_status,
            "port": runtime.port,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown service '{}'", name) })),
        )),
    }
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
