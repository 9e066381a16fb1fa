/**
 * HTTP API - Read-only introspection of the running observatory
 *
 * ROLE:
 * Serves JSON views of the snapshot registry, the master state machine,
 * alarms and loaded schedules for dashboards and scripts. Control goes
 * through the command server; nothing here changes state.
 *
 * SECURITY:
 * - `x-api-key` header required on every route except /health
 * - Key read from `OBSERVATORY_API_KEY`; unset key means every guarded
 *   route answers 401
 */

use crate::alarms::AlarmRecord;
use crate::context::ObservatoryContext;
use crate::executor::ExecutorControl;
use crate::health::KernelHealth;
use crate::master::{MasterHandle, MasterStatus};
use crate::schedule::ScheduleSummary;
use crate::state::SubsystemState;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

pub const API_KEY_ENV: &str = "OBSERVATORY_API_KEY";

pub fn api_key_ok(expected: &str, provided: Option<&str>) -> bool {
    !expected.is_empty() && provided == Some(expected)
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("[http] {API_KEY_ENV} not set, access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }
    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_ok(&expected, provided) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ObservatoryContext>,
    pub master: MasterHandle,
    pub executor: ExecutorControl,
}

#[derive(Serialize)]
struct ObservatoryView {
    #[serde(flatten)]
    status: MasterStatus,
    executor_running: bool,
    safe: bool,
    dark: bool,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/state", get(get_state))
        .route("/state/{subsystem}", get(get_subsystem))
        .route("/observatory", get(get_observatory))
        .route("/alarms", get(get_alarms))
        .route("/schedules", get(get_schedules))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let state = app.master.status().state.to_string();
    Json(app.ctx.health.get_health(&app.ctx.snapshots, &state))
}

async fn get_state(State(app): State<AppState>) -> Json<Map<String, Value>> {
    Json(app.ctx.snapshot().flatten())
}

async fn get_subsystem(
    State(app): State<AppState>,
    Path(subsystem): Path<String>,
) -> Result<Json<SubsystemState>, StatusCode> {
    app.ctx
        .snapshots
        .lock()
        .get(&subsystem)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_observatory(State(app): State<AppState>) -> Json<ObservatoryView> {
    Json(ObservatoryView {
        status: app.master.status(),
        executor_running: app.executor.is_running(),
        safe: app.ctx.safety.is_safe(),
        dark: app.ctx.is_dark(),
    })
}

async fn get_alarms(State(app): State<AppState>) -> Json<Vec<AlarmRecord>> {
    Json(app.ctx.alarms.lock().clone())
}

async fn get_schedules(State(app): State<AppState>) -> Json<Vec<ScheduleSummary>> {
    let now = app.ctx.clock.mjd();
    let summaries = app.executor.schedules().lock().summaries(now);
    Json(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_must_match_exactly() {
        assert!(api_key_ok("s3cret", Some("s3cret")));
        assert!(!api_key_ok("s3cret", Some("S3CRET")));
        assert!(!api_key_ok("s3cret", None));
        assert!(!api_key_ok("", Some("")));
    }
}
