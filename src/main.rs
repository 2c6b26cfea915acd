use clap::Parser;
use quorum_core::{
    agents::{AgentTransport, ContextProvider, HttpAgentTransport, NullContextProvider},
    config::{Cli, Settings},
    consensus::ConsensusEngine,
    events::EventBus,
    metrics::MetricsRecorder,
    orchestrator::Orchestrator,
    registry::AgentRegistry,
    routing::RoutingEngine,
    store::Store,
    transport::ApiServer,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
// store error, 3 port bind failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_BIND: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log_filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting quorum-core orchestration server");

    let settings = match Settings::load(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let store = match Store::open(&settings.store.path, settings.store.pool_size) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %settings.store.path.display(), "store error");
            std::process::exit(EXIT_STORE);
        }
    };

    let listener = match tokio::net::TcpListener::bind((settings.server.host.as_str(), settings.server.port)).await
    {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                error = %e,
                host = %settings.server.host,
                port = settings.server.port,
                "port bind failure"
            );
            std::process::exit(EXIT_BIND);
        }
    };

    // Singletons are created in dependency order and injected explicitly;
    // teardown happens in reverse below.
    let bus = EventBus::new(settings.bus.topic_capacity);
    let registry = Arc::new(AgentRegistry::new(
        store.clone(),
        bus.clone(),
        settings.health.clone(),
    ));
    if let Err(e) = registry.bootstrap(&settings.agents).await {
        error!(error = %e, "agent registry bootstrap failed");
        std::process::exit(EXIT_CONFIG);
    }

    let routing = match RoutingEngine::new(registry.clone(), settings.routing.clone()) {
        Ok(routing) => routing,
        Err(e) => {
            error!(error = %e, "routing engine init failed");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let consensus = ConsensusEngine::new(store.clone(), bus.clone(), settings.consensus.clone());
    let transport: Arc<dyn AgentTransport> = Arc::new(HttpAgentTransport::new());
    let context: Arc<dyn ContextProvider> = Arc::new(NullContextProvider);

    let orchestrator = Orchestrator::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        routing,
        consensus,
        transport.clone(),
        context,
        settings.clone(),
    );

    let metrics = MetricsRecorder::new(store.clone(), bus.clone(), settings.metrics.clone());
    let (metrics_subscription, metrics_flusher) = metrics.spawn();
    let health_loop = registry.spawn_health_loop(transport);

    let api = ApiServer::new(&settings, orchestrator, bus, metrics);

    tokio::select! {
        result = api.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "transport failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Reverse-order teardown: stop background loops, drain the metrics
    // subscriber, then let the store drop.
    health_loop.abort();
    metrics_flusher.abort();
    metrics_subscription.unsubscribe().await;
    info!("clean shutdown");
}
