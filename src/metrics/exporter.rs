use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::utils::error::LatticeError;

/// Install the Prometheus recorder with an HTTP listener on localhost.
pub fn start_metrics_server(port: u16) -> Result<(), LatticeError> {
    let addr: SocketAddr = format!("127.0.0.1:{port}")
        .parse()
        .map_err(|e| LatticeError::configuration(format!("bad metrics address: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| LatticeError::configuration(format!("metrics exporter: {e}")))?;

    info!("metrics server listening at http://{addr}/metrics");
    Ok(())
}
