use crate::cli::ServeArgs;
use crate::infra::{seed_accounts, AppState, SandboxProcessor};
use crate::routes::with_marketplace_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use linkedpet::config::AppConfig;
use linkedpet::error::AppError;
use linkedpet::marketplace::{MarketplaceService, MemoryStore};
use linkedpet::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry, config.environment)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = Arc::new(MemoryStore::new(config.store));
    seed_accounts(&store).map_err(|err| AppError::Workflow(err.into()))?;
    let processor = Arc::new(SandboxProcessor::default());
    let marketplace = Arc::new(MarketplaceService::new(
        store,
        processor,
        config.payments.clone(),
    ));

    let app = with_marketplace_routes(marketplace)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        currency = %config.payments.currency,
        fee_bps = config.payments.platform_fee_bps,
        "marketplace service ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
