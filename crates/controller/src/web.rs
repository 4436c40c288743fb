use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::info;

use crate::config::ZoneId;
use crate::scheduler::Override;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    /// Extension applied by `/api/delay` when no `minutes` are given.
    pub default_delay: Duration,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/warnings", get(api_warnings))
        .route("/api/delay", post(api_delay))
        .route("/api/cancel", post(api_cancel))
        .route("/api/water-now", post(api_water_now))
        .with_state(state)
}

#[derive(Serialize)]
struct Msg {
    msg: String,
}

fn reply(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(Msg { msg: msg.into() })).into_response()
}

#[derive(Deserialize)]
struct UnitQuery {
    unit: Option<String>,
    minutes: Option<String>,
}

impl UnitQuery {
    fn unit(&self) -> Result<ZoneId, Response> {
        let raw = self
            .unit
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| reply(StatusCode::BAD_REQUEST, "no unit given"))?;
        raw.trim()
            .parse()
            .map_err(|_| reply(StatusCode::BAD_REQUEST, "non-numeric unit given"))
    }

    fn minutes(&self) -> Result<Option<Duration>, Response> {
        let Some(raw) = self.minutes.as_deref() else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(m) if m > 0 => m
                .checked_mul(60)
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| reply(StatusCode::BAD_REQUEST, "minutes out of range")),
            _ => Err(reply(StatusCode::BAD_REQUEST, "minutes must be a positive integer")),
        }
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_warnings(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.warnings())
}

async fn apply(state: &AppState, cmd: Override) -> Response {
    let mut st = state.shared.write().await;
    match st.apply_override(cmd, Instant::now()) {
        Ok(msg) => reply(StatusCode::OK, msg),
        Err(e) => reply(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn api_delay(State(state): State<AppState>, Query(q): Query<UnitQuery>) -> Response {
    let (zone, minutes) = match (q.unit(), q.minutes()) {
        (Ok(zone), Ok(minutes)) => (zone, minutes),
        (Err(r), _) | (_, Err(r)) => return r,
    };
    let extra = minutes.unwrap_or(state.default_delay);
    apply(&state, Override::DelayPending { zone, extra }).await
}

async fn api_cancel(State(state): State<AppState>, Query(q): Query<UnitQuery>) -> Response {
    match q.unit() {
        Ok(zone) => apply(&state, Override::CancelActive { zone }).await,
        Err(r) => r,
    }
}

async fn api_water_now(State(state): State<AppState>, Query(q): Query<UnitQuery>) -> Response {
    match q.unit() {
        Ok(zone) => apply(&state, Override::WaterNow { zone }).await,
        Err(r) => r,
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}
