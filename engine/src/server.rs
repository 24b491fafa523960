//! The observability server: readiness/liveness probes plus the prometheus
//! endpoint, served next to the pipeline.

use std::future::ready;

use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use health::HealthRegistry;
use tokio::task::JoinHandle;
use tracing::error;

pub async fn index() -> &'static str {
    "gridflow engine"
}

pub fn router(registry: HealthRegistry) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(registry.get_status())));
    setup_metrics_routes(router)
}

pub fn start(registry: HealthRegistry, host: &str, port: u16) -> JoinHandle<()> {
    let bind = format!("{host}:{port}");
    let router = router(registry);
    tokio::task::spawn(async move {
        if let Err(err) = serve(router, &bind).await {
            error!(error = %err, "observability server exited");
        }
    })
}
