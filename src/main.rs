use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use relay_rs::config::{RuntimeConfig, SharedConfig};
use relay_rs::core::RelayCore;
use relay_rs::http;
use relay_rs::session;
use relay_rs::store::memory::MemoryStore;
use relay_rs::store::pg::PgStore;
use relay_rs::store::Store;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SharedConfig::new(RuntimeConfig::from_env());

    // Defaults to the in-memory store; a `DATABASE_URL` opts into the
    // durable `sqlx`/Postgres alternative behind the same `Store` trait.
    let store: Arc<dyn Store> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            info!("connecting to postgres store");
            Arc::new(
                PgStore::connect(&url)
                    .await
                    .expect("failed to connect to DATABASE_URL"),
            )
        }
        Err(_) => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let core = RelayCore::new(store, config);

    let app = Router::new()
        .route("/", get(handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(core);

    let port = std::env::var("RELAY_PORT").unwrap_or_else(|_| "3001".to_string());
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("invalid RELAY_PORT");

    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app)
        .await
        .expect("server terminated unexpectedly");
}

/// The single route: a WebSocket upgrade for relay traffic, or the
/// relay-information document for a plain `Accept: application/nostr+json`
/// GET.
async fn handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(core): State<Arc<RelayCore>>,
) -> Response {
    if let Some(ws) = ws {
        return ws
            .on_upgrade(move |socket| session::run(socket, core))
            .into_response();
    }
    http::index(headers, State(core)).await
}
