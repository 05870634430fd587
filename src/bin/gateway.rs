use std::sync::Arc;
use std::time::Duration;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use courier_server::broker::Broker;
use courier_server::config::Config;
use courier_server::gateway::{self, consumer, ConnectionManager, GatewayState};
use courier_server::init_tracing;

#[tokio::main]
async fn main() {
    let config = Config::from_env(8080).expect("Failed to load configuration");
    init_tracing(
        "courier_server=info,tower_http=info",
        config.is_production,
    );
    info!("🚀 Courier gateway starting...");

    // Broker connectivity is a hard startup requirement; afterwards the
    // monitor keeps re-dialing with fixed backoff.
    let broker = Broker::connect(&config.rabbitmq_url)
        .await
        .expect("Failed to connect to broker");
    broker.spawn_reconnect_monitor();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to build HTTP client");

    let state = GatewayState {
        connections: ConnectionManager::new(),
        broker,
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
        http,
        message_service_url: config.message_service_url.clone(),
        user_service_url: config.user_service_url.clone(),
    };

    // Broker → socket fan-in runs for the process lifetime.
    tokio::spawn(consumer::run(state.clone(), config.gateway_queue.clone()));

    let app = gateway::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");
    info!("🎧 Gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed");

    // Close sockets cleanly and publish best-effort offline presence.
    gateway::shutdown(&state).await;
    info!("👋 Gateway stopped");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install ctrl-c handler");
}
