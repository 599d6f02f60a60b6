//! The per-connection actor and protocol state machine. Wired to `axum`'s
//! WebSocket split: one task owns the socket halves, a bounded `mpsc`
//! channel is the outbound mailbox, and a second task drains it to the
//! socket sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broadcaster::new_mailbox;
use crate::core::RelayCore;
use crate::error::SessionError;
use crate::model::{classify_kind, filters_match, Event, Filter, KindClass};
use crate::store::Store;
use crate::validator::validate;
use crate::wire::{
    auth_message, eose_message, event_message, notice_message, ok_message, parse_client_frame,
    ClientFrame,
};

const FIRST_PING_DELAY: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Unauth,
    Authed,
}

/// Per-connection state machine. Only the owning session mutates these
/// fields.
pub struct RelaySession {
    conn_id: u64,
    core: Arc<RelayCore>,
    subscriptions: HashMap<String, Vec<Filter>>,
    auth_challenge: Option<String>,
    authenticated_pubkey: Option<String>,
    state: AuthState,
    out: mpsc::Sender<Message>,
}

/// Run one connection end to end until the socket closes, then clean up.
pub async fn run(socket: WebSocket, core: Arc<RelayCore>) {
    let conn_id = core.next_conn_id();
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Keep-alive: first ping 30s after open, then every 50s. A failed
    // write fails the session, same as any other send.
    let ping_tx = out_tx.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        tokio::time::sleep(FIRST_PING_DELAY).await;
        loop {
            if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
            tokio::time::sleep(PING_INTERVAL).await;
        }
    });

    let (mailbox_tx, mut mailbox_rx) = new_mailbox();
    core.broadcaster.register_mailbox(conn_id, mailbox_tx);

    let mut session = RelaySession {
        conn_id,
        core: core.clone(),
        subscriptions: HashMap::new(),
        auth_challenge: None,
        authenticated_pubkey: None,
        state: AuthState::Unauth,
        out: out_tx.clone(),
    };
    session.issue_challenge().await;

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_text(&text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn_id, "websocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            event = mailbox_rx.recv() => {
                match event {
                    Some(event) => session.deliver_live(&event).await,
                    None => break,
                }
            }
        }
    }

    send_task.abort();
    heartbeat_task.abort();
    core.broadcaster.unregister_mailbox(conn_id);
    core.index.unregister_all(conn_id);
    debug!(conn_id, "session terminated, subscriptions released");
}

impl RelaySession {
    async fn send(&self, text: String) {
        let _ = self.out.send(Message::Text(text)).await;
    }

    async fn issue_challenge(&mut self) {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);
        self.auth_challenge = Some(challenge.clone());
        self.send(auth_message(&challenge)).await;
    }

    async fn handle_text(&mut self, text: &str) {
        match parse_client_frame(text) {
            Some(ClientFrame::Event(raw)) => self.handle_event(raw).await,
            Some(ClientFrame::Req { sub_id, filters }) => self.handle_req(sub_id, filters).await,
            Some(ClientFrame::Close(sub_id)) => self.handle_close(sub_id).await,
            Some(ClientFrame::Auth(raw)) => self.handle_auth(raw).await,
            None => self.send(notice_message("Invalid message")).await,
        }
    }

    fn policy_requires_auth(&self) -> bool {
        self.core.config.load().auth_required
    }

    /// Checks this connection's identity against the configured pubkey
    /// allow-list for subscribing. An unauthenticated connection is let
    /// through only when the allow-list is empty; once it's non-empty, a
    /// `REQ` must come from one of the listed pubkeys, mirroring the
    /// allow-list check `handle_event` runs before storing a publish.
    fn check_subscriber_authorized(&self) -> Result<(), SessionError> {
        let config = self.core.config.load();
        let allowed = match &self.authenticated_pubkey {
            Some(pubkey) => config.pubkey_allowed(pubkey),
            None => config.allowed_pubkeys.is_empty(),
        };
        if allowed {
            Ok(())
        } else {
            Err(SessionError::NotAuthorized)
        }
    }

    /// `["EVENT", event]`.
    async fn handle_event(&mut self, raw: crate::model::RawEvent) {
        let event = match validate(raw) {
            Ok(ev) => ev,
            Err(err) => {
                // there is no validated id to echo back when the raw `id`
                // field itself was missing or malformed; fall back to "".
                let id = String::new();
                self.send(ok_message(&id, false, &err.reason())).await;
                return;
            }
        };

        if self.policy_requires_auth() && self.state == AuthState::Unauth {
            self.issue_challenge().await;
            return;
        }

        if !self.core.config.load().pubkey_allowed(&event.pubkey) {
            self.send(ok_message(&event.id, false, "blocked: not authorized"))
                .await;
            return;
        }

        if classify_kind(event.kind) == KindClass::Authentication {
            self.send(ok_message(&event.id, false, "AUTH events are not stored"))
                .await;
            return;
        }

        match self.store_and_classify(&event).await {
            Ok(()) => {
                self.send(ok_message(&event.id, true, "")).await;
                self.core.broadcaster.broadcast(event.clone(), self.conn_id);
                self.handle_supplemental_kinds(&event).await;
            }
            Err(SessionError::Store(err)) => {
                self.send(ok_message(&event.id, false, err.reason())).await;
            }
            Err(_) => {
                self.send(ok_message(&event.id, false, "error: internal error"))
                    .await;
            }
        }
    }

    async fn store_and_classify(&self, event: &Event) -> Result<(), SessionError> {
        match classify_kind(event.kind) {
            KindClass::Ephemeral => Ok(()),
            KindClass::Regular => {
                self.core.store.put_regular(event.clone()).await?;
                Ok(())
            }
            KindClass::Replaceable => {
                self.core.store.put_replaceable(event.clone()).await?;
                Ok(())
            }
            KindClass::ParameterizedReplaceable => {
                self.core.store.put_parameterized(event.clone()).await?;
                Ok(())
            }
            KindClass::Authentication => unreachable!("handled before classification"),
        }
    }

    /// NIP-09 deletion and NIP-62 request-to-vanish, layered on top of the
    /// mandatory storage path above.
    async fn handle_supplemental_kinds(&self, event: &Event) {
        if event.kind == 5 {
            let ids: Vec<String> = event.tag_values("e").map(str::to_string).collect();
            if !ids.is_empty() {
                let _ = self.core.store.delete_by_ids(&event.pubkey, &ids).await;
            }
        }
        if event.kind == 62 {
            let _ = self.core.store.delete_by_pubkey(&event.pubkey).await;
        }
    }

    /// `["REQ", sub_id, filter...]`.
    async fn handle_req(&mut self, sub_id: String, filters: Vec<Filter>) {
        if self.policy_requires_auth() && self.state == AuthState::Unauth {
            self.issue_challenge().await;
            return;
        }

        if self.check_subscriber_authorized().is_err() {
            self.send(notice_message("blocked: not authorized")).await;
            return;
        }

        if filters.is_empty() || filters.iter().any(|f| f.authors().is_empty()) {
            self.send(notice_message(
                "rejected: this relay requires an 'authors' filter for all subscriptions",
            ))
            .await;
            return;
        }

        self.subscriptions.insert(sub_id.clone(), filters.clone());

        // Register with the index before querying history, so any event
        // broadcast concurrently with the historical scan queues into this
        // session's mailbox and is only drained after EOSE is sent.
        let authors: Vec<String> = filters.iter().flat_map(|f| f.authors().to_vec()).collect();
        self.core.index.register(self.conn_id, &sub_id, &authors);

        match self.core.store.query(&filters).await {
            Ok(events) => {
                for ev in events {
                    self.send(event_message(&sub_id, ev.to_wire())).await;
                }
                self.send(eose_message(&sub_id)).await;
            }
            Err(err) => {
                self.send(notice_message(&format!(
                    "Failed to query events: {}",
                    err.reason()
                )))
                .await;
            }
        }
    }

    /// `["CLOSE", sub_id]`.
    async fn handle_close(&mut self, sub_id: String) {
        self.subscriptions.remove(&sub_id);
        self.core.index.unregister(self.conn_id, &sub_id);
        self.send(notice_message(&format!("Closed sub_id: `{sub_id}`")))
            .await;
    }

    /// `["AUTH", auth_event]`.
    async fn handle_auth(&mut self, raw: crate::model::RawEvent) {
        let event = match validate(raw) {
            Ok(ev) => ev,
            Err(_) => {
                self.send(ok_message("", false, "invalid: auth event validation failed"))
                    .await;
                return;
            }
        };

        if classify_kind(event.kind) != KindClass::Authentication {
            self.send(ok_message(
                &event.id,
                false,
                "invalid: auth event validation failed",
            ))
            .await;
            return;
        }

        let challenge_ok = match &self.auth_challenge {
            Some(expected) => event
                .tag_values("challenge")
                .any(|v| v == expected.as_str()),
            None => false,
        };
        let relay_ok = event.tag_values("relay").next().is_some();

        if !challenge_ok || !relay_ok {
            self.send(ok_message(
                &event.id,
                false,
                "invalid: auth event validation failed",
            ))
            .await;
            return;
        }

        if !self.core.config.load().pubkey_allowed(&event.pubkey) {
            self.send(ok_message(&event.id, false, "blocked: not authorized"))
                .await;
            return;
        }

        self.authenticated_pubkey = Some(event.pubkey.clone());
        self.auth_challenge = None;
        self.state = AuthState::Authed;
        self.send(ok_message(&event.id, true, "")).await;
    }

    /// Local re-check against this session's own subscription table: the
    /// subscription index only narrows candidates by author, so every
    /// other filter field (`kinds`, `since`, tag filters, ...) is
    /// re-evaluated here before delivery.
    async fn deliver_live(&self, event: &Arc<Event>) {
        for (sub_id, filters) in &self.subscriptions {
            if filters_match(filters, event) {
                self.send(event_message(sub_id, event.to_wire())).await;
            }
        }
    }
}
