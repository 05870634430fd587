use std::sync::Arc;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use courier_server::broker::Broker;
use courier_server::config::Config;
use courier_server::db::Store;
use courier_server::init_tracing;
use courier_server::messages::{self, consumer, MessageState};

#[tokio::main]
async fn main() {
    let config = Config::from_env(8082).expect("Failed to load configuration");
    init_tracing(
        "courier_server=info,tower_http=info",
        config.is_production,
    );
    info!("🚀 Courier message service starting...");

    let store = Store::connect(&config.mongodb_uri, &config.mongodb_database)
        .await
        .expect("Failed to connect to document store");
    store
        .health_check()
        .await
        .expect("Document store health check failed");
    store
        .ensure_indexes()
        .await
        .expect("Failed to ensure document store indexes");

    let broker = Broker::connect(&config.rabbitmq_url)
        .await
        .expect("Failed to connect to broker");
    broker.spawn_reconnect_monitor();

    let state = MessageState {
        store,
        broker,
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
    };

    // The sent → delivered transition is driven by our own queue.
    tokio::spawn(consumer::run(state.clone()));

    let app = messages::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");
    info!("🎧 Message service listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed");
    info!("👋 Message service stopped");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install ctrl-c handler");
}
