use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cdp_adapter::metrics as cdp_metrics;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        cdp_metrics::register_metrics(global_registry());
    });
}

/// Serves `/metrics` on `port`. Port 0 disables the endpoint.
pub fn spawn_metrics_server(port: u16) -> Option<JoinHandle<()>> {
    if port == 0 {
        return None;
    }

    register_metrics();
    let app = router();
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    info!(%addr, "metrics server listening");
    Some(tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                    error!(?err, "metrics server exited with error");
                }
            }
            Err(err) => {
                error!(?err, "failed to bind metrics listener");
            }
        }
    }))
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(global_registry().clone()))
}

/// The registry in prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    register_metrics();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&global_registry().gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Response {
    let encoder = TextEncoder::new();
    let format_type = encoder.format_type().to_string();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metric encode error",
        )
            .into_response();
    }

    match (String::from_utf8(buffer), HeaderValue::from_str(&format_type)) {
        (Ok(body), Ok(value)) => {
            ([(axum::http::header::CONTENT_TYPE, value)], body).into_response()
        }
        _ => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metric encode error",
        )
            .into_response(),
    }
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}
