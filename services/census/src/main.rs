use std::sync::Arc;

use census::{CensusConfig, CensusService, transport_axum::serve_http_with_axum};
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_env("CENSUS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CensusConfig::from_env();
    tracing::info!(
        bind_addr = %config.bind_addr,
        http_workers = config.http_workers,
        wal = config.wal_path.is_some(),
        shared_leases = config.lease_dir.is_some(),
        "census starting"
    );

    let service = match CensusService::from_config(&config) {
        Ok(service) => service,
        Err(err) => {
            tracing::error!(error = %err, "census failed to start");
            std::process::exit(1);
        }
    };

    if let Err(err) = serve_http_with_axum(Arc::new(service), &config.bind_addr, config.http_workers)
    {
        tracing::error!(error = %err, "census http server stopped");
        std::process::exit(1);
    }
}
