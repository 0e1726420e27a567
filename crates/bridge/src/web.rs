use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::broker::CommandPublisher;
use crate::codec::{Command, Reading};
use crate::config::ApiConfig;
use crate::history::{HistoryRecord, HistoryStore};
use crate::service::{HistoryError, TelemetryService};

const DEFAULT_RANGE: &str = "-1h";

/// Stamped on every response, errors included.
const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("x-xss-protection", "1; mode=block"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
];

type Svc<S, P> = Arc<TelemetryService<S, P>>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: HistoryStore, P: CommandPublisher>(svc: Svc<S, P>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/live", get(live::<S, P>))
        .route("/api/history", get(history::<S, P>))
        .route("/api/toggle-load", post(toggle_load::<S, P>))
        .route("/api/health", get(health::<S, P>))
        .with_state(svc)
        .layer(middleware::from_fn(security_headers))
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    response
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

async fn index() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME") }))
}

#[derive(Serialize)]
struct LiveBody<'a> {
    data: &'a Reading,
    #[serde(with = "time::serde::rfc3339")]
    received_at: OffsetDateTime,
    age_seconds: f64,
}

async fn live<S: HistoryStore, P: CommandPublisher>(State(svc): State<Svc<S, P>>) -> Response {
    let Some(state) = svc.live().await else {
        return detail(
            StatusCode::SERVICE_UNAVAILABLE,
            "no data received yet, waiting for the device",
        );
    };
    let age = OffsetDateTime::now_utc() - state.received_at;
    Json(LiveBody {
        data: &state.reading,
        received_at: state.received_at,
        age_seconds: age.as_seconds_f64().max(0.0),
    })
    .into_response()
}

#[derive(Deserialize)]
struct HistoryParams {
    range: Option<String>,
    limit: Option<NonZeroUsize>,
}

#[derive(Serialize)]
struct HistoryBody {
    range: String,
    count: usize,
    data: Vec<HistoryRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn history<S: HistoryStore, P: CommandPublisher>(
    State(svc): State<Svc<S, P>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let range = params.range.unwrap_or_else(|| DEFAULT_RANGE.to_owned());
    match svc.history(&range, params.limit).await {
        Ok(data) => Json(HistoryBody {
            range,
            count: data.len(),
            data,
            error: None,
        })
        .into_response(),
        Err(HistoryError::Range(e)) => detail(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(HistoryError::Store(e)) => {
            warn!(%range, status = ?e.status(), error = %e, "history query failed");
            let body = HistoryBody {
                range,
                count: 0,
                data: Vec::new(),
                error: Some(e.to_string()),
            };
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
    }
}

#[derive(Deserialize)]
struct ToggleLoadRequest {
    state: bool,
}

async fn toggle_load<S: HistoryStore, P: CommandPublisher>(
    State(svc): State<Svc<S, P>>,
    Json(req): Json<ToggleLoadRequest>,
) -> Response {
    let command = Command::ToggleLoad { state: req.state };
    match svc.send_command(&command).await {
        Ok(()) => Json(json!({
            "status": "ok",
            "message": format!("load command sent: {}", if req.state { "on" } else { "off" }),
            "requested_state": req.state,
        }))
        .into_response(),
        Err(_) => detail(StatusCode::BAD_GATEWAY, "mqtt command could not be delivered"),
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    mqtt_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    last_data_received: Option<OffsetDateTime>,
    uptime_seconds: u64,
}

async fn health<S: HistoryStore, P: CommandPublisher>(State(svc): State<Svc<S, P>>) -> Response {
    let status = svc.status().await;
    Json(HealthBody {
        status: "healthy",
        mqtt_connected: status.connected,
        last_data_received: status.last_received,
        uptime_seconds: status.uptime.as_secs(),
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve the API until `shutdown` resolves, then drain open requests.
pub async fn serve<S, P, F>(svc: Svc<S, P>, cfg: &ApiConfig, shutdown: F) -> anyhow::Result<()>
where
    S: HistoryStore,
    P: CommandPublisher,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("failed to bind http api on {}:{}", cfg.host, cfg.port))?;
    info!(addr = %listener.local_addr()?, "http api listening");

    axum::serve(listener, router(svc))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server error")
}
