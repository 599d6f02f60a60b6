//! Shared test fixtures: a running relay and a signed-event builder.
//! Signing is real BIP-340 Schnorr via `secp256k1`, not a stub, so the
//! same validation path the server runs in production is exercised here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use relay_rs::config::{RuntimeConfig, SharedConfig};
use relay_rs::core::RelayCore;
use relay_rs::http;
use relay_rs::session;
use relay_rs::store::memory::MemoryStore;

pub struct TestKey {
    secp: Secp256k1<secp256k1::All>,
    keypair: Keypair,
    pub pubkey_hex: String,
}

impl TestKey {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (xonly, _parity) = keypair.x_only_public_key();
        let pubkey_hex = hex::encode(xonly.serialize());
        Self {
            secp,
            keypair,
            pubkey_hex,
        }
    }

    /// Build a fully valid, signed event JSON value.
    pub fn sign_event(
        &self,
        kind: u32,
        created_at: i64,
        tags: Vec<Vec<&str>>,
        content: &str,
    ) -> serde_json::Value {
        let tags_json: Vec<Vec<String>> = tags
            .into_iter()
            .map(|t| t.into_iter().map(String::from).collect())
            .collect();
        let canonical =
            serde_json::json!([0, self.pubkey_hex, created_at, kind, tags_json, content])
                .to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let id_bytes = hasher.finalize();
        let id_hex = hex::encode(id_bytes);

        let msg = Message::from_digest_slice(&id_bytes).expect("32-byte digest");
        let sig = self.secp.sign_schnorr(&msg, &self.keypair);

        serde_json::json!({
            "id": id_hex,
            "pubkey": self.pubkey_hex,
            "created_at": created_at,
            "kind": kind,
            "tags": tags_json,
            "content": content,
            "sig": hex::encode(sig.as_ref()),
        })
    }
}

/// Boot a relay with the given runtime config on an ephemeral localhost
/// port and return its base `ws://` URL. The server task runs for the
/// lifetime of the test process (no graceful shutdown is needed: the OS
/// reclaims the socket when the test binary exits).
pub async fn spawn_relay(config: RuntimeConfig) -> String {
    let core = RelayCore::new(Arc::new(MemoryStore::new()), SharedConfig::new(config));

    let app = Router::new()
        .route("/", get(handler))
        .with_state(core);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("ws://{addr}/")
}

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

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub async fn connect(url: &str) -> WsStream {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket handshake");
    stream
}

use futures::{SinkExt, StreamExt};

pub async fn send_json(stream: &mut WsStream, value: &serde_json::Value) {
    stream
        .send(WsMessage::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// Read the next text frame, transparently skipping ping/pong control
/// frames emitted by the keep-alive.
pub async fn recv_json(stream: &mut WsStream) -> serde_json::Value {
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return serde_json::from_str(&text).expect("valid JSON frame")
            }
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
            Some(Err(e)) => panic!("websocket error: {e}"),
            None => panic!("connection closed unexpectedly"),
        }
    }
}
