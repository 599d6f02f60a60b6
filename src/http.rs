//! Relay-information HTTP endpoint: the thin outer layer the WebSocket
//! core is wired up behind.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;

use crate::core::RelayCore;

pub async fn index(headers: HeaderMap, State(core): State<Arc<RelayCore>>) -> Response {
    if let Some(accept) = headers.get("accept") {
        if accept.to_str().unwrap_or("").contains("application/nostr+json") {
            let info = &core.config.load().information;
            return Json(serde_json::json!({
                "name": info.name,
                "description": info.description,
                "pubkey": info.pubkey,
                "contact": info.contact,
                "software": "relay-rs",
                "version": env!("CARGO_PKG_VERSION"),
            }))
            .into_response();
        }
    }
    "Welcome to relay-rs".into_response()
}
