use std::sync::Arc;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use courier_server::config::Config;
use courier_server::db::Store;
use courier_server::init_tracing;
use courier_server::users::{self, UserState};

#[tokio::main]
async fn main() {
    let config = Config::from_env(8081).expect("Failed to load configuration");
    init_tracing(
        "courier_server=info,tower_http=info",
        config.is_production,
    );
    info!("🚀 Courier user service starting...");

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

    let state = UserState {
        store,
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
        jwt_expiration_hours: config.jwt_expiration_hours,
    };

    let app = users::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");
    info!("🎧 User service listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed");
    info!("👋 User service stopped");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install ctrl-c handler");
}
