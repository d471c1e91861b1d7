use log::info;
use prometheus::Encoder;
use warp::{Filter, Rejection, Reply};

/// Environment variable overriding the metrics port
const METRICS_PORT_ENV_VAR: &str = "KECS_METRICS_PORT";
/// Port the /metrics endpoint listens on when none is configured
const DEFAULT_METRICS_PORT: u16 = 9404;

/// Renders every metric registered against the default Prometheus
/// registry, including the process collector's defaults.
async fn metrics_handler() -> Result<impl Reply, Rejection> {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("metrics_handler - failed to encode metrics: {}", e);
        return Err(warp::reject::reject());
    }
    match String::from_utf8(buffer) {
        Ok(body) => Ok(body),
        Err(e) => {
            log::error!("metrics_handler - metrics were not valid UTF-8: {}", e);
            Err(warp::reject::reject())
        }
    }
}

/// Serves Prometheus metrics at /metrics for the lifetime of the process.
pub async fn run_metrics_server() -> anyhow::Result<()> {
    let port = match std::env::var(METRICS_PORT_ENV_VAR) {
        Ok(p) => p.parse::<u16>()?,
        Err(_) => DEFAULT_METRICS_PORT,
    };
    info!("run_metrics_server - serving /metrics on port {}", port);
    let metrics_route = warp::path!("metrics").and_then(metrics_handler);
    warp::serve(metrics_route).run(([0, 0, 0, 0], port)).await;
    Ok(())
}
