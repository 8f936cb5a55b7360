//! Admin HTTP surface.
//!
//! Minimal read and control endpoints:
//! - `GET /ping`: liveness.
//! - `GET /status`: uptime and active runner count.
//! - `GET /list`: uuid to "symbol last_price_checked_time".
//! - `GET /show?uuid=…`: `{ "exist": bool }`.
//! - `GET /event?action=enable|disable&uuid=…`: enqueue a lifecycle
//!   event; 400 on missing or invalid params.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::supervisor::{Event, Supervisor};

struct AdminState {
    supervisor: Arc<Supervisor>,
    started_at: Instant,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    let state = Arc::new(AdminState {
        supervisor,
        started_at: Instant::now(),
    });
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/list", get(list))
        .route("/show", get(show))
        .route("/event", get(event))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    supervisor: Arc<Supervisor>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "admin server listening");
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ping() -> &'static str {
    "pong"
}

async fn status(State(state): State<Arc<AdminState>>) -> String {
    let uptime = state.started_at.elapsed();
    let hours = uptime.as_secs() / 3600;
    let days = hours / 24;
    format!(
        "up {} days {} hours, {} strategies",
        days,
        hours % 24,
        state.supervisor.runner_count()
    )
}

async fn list(State(state): State<Arc<AdminState>>) -> Json<HashMap<String, String>> {
    let entries = state
        .supervisor
        .index()
        .list()
        .into_iter()
        .map(|(uuid, (symbol, checked))| {
            let checked = checked
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            (uuid.to_string(), format!("{symbol} {checked}"))
        })
        .collect();
    Json(entries)
}

#[derive(Debug, Deserialize)]
struct ShowQuery {
    #[serde(default)]
    uuid: String,
}

async fn show(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<ShowQuery>,
) -> impl IntoResponse {
    let exist = query
        .uuid
        .trim()
        .parse::<Uuid>()
        .map(|uuid| state.supervisor.exists(uuid))
        .unwrap_or(false);
    Json(serde_json::json!({ "exist": exist }))
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    #[serde(default)]
    action: String,
    #[serde(default)]
    uuid: String,
}

async fn event(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<EventQuery>,
) -> impl IntoResponse {
    let action = query.action.trim();
    let raw_uuid = query.uuid.trim();
    info!(action, uuid = raw_uuid, "admin event");

    if action.is_empty() || raw_uuid.is_empty() {
        return (StatusCode::BAD_REQUEST, "invalid params".to_string());
    }
    let Ok(uuid) = raw_uuid.parse::<Uuid>() else {
        return (StatusCode::BAD_REQUEST, "invalid params".to_string());
    };

    let event = match action {
        "enable" => Event::Enable(uuid),
        "disable" => Event::Disable(uuid),
        other => {
            return (
                StatusCode::BAD_REQUEST,
                format!("action '{other}' not supported"),
            );
        }
    };
    let _ = state.supervisor.events().send(event);
    (StatusCode::OK, "queued".to_string())
}
