//! A single logical queue that serializes event fan-out to candidate
//! connections, and must never block the ingestion path on a slow
//! subscriber.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::index::SubscriptionIndex;
use crate::model::Event;

type ConnId = u64;

/// Capacity of each session's live-delivery mailbox. A full mailbox means
/// a slow consumer; the delivery is dropped, not queued indefinitely or
/// blocked on.
const MAILBOX_CAPACITY: usize = 256;

pub struct Broadcaster {
    index: Arc<SubscriptionIndex>,
    mailboxes: RwLock<HashMap<ConnId, mpsc::Sender<Arc<Event>>>>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
}

struct QueueItem {
    event: Arc<Event>,
    origin: ConnId,
}

impl Broadcaster {
    /// Spawns the single fan-out worker task and returns a handle shared
    /// by every session.
    pub fn spawn(index: Arc<SubscriptionIndex>) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<QueueItem>();
        let broadcaster = Arc::new(Self {
            index,
            mailboxes: RwLock::new(HashMap::new()),
            queue_tx,
        });
        let worker = broadcaster.clone();
        tokio::spawn(async move {
            while let Some(item) = queue_rx.recv().await {
                worker.dispatch(item);
            }
        });
        broadcaster
    }

    /// A session registers its mailbox so it becomes a delivery candidate.
    pub fn register_mailbox(&self, conn_id: ConnId, sender: mpsc::Sender<Arc<Event>>) {
        self.mailboxes.write().unwrap().insert(conn_id, sender);
    }

    pub fn unregister_mailbox(&self, conn_id: ConnId) {
        self.mailboxes.write().unwrap().remove(&conn_id);
    }

    /// Enqueue `event` for fan-out. Non-blocking: the ingestion path only
    /// pays the cost of pushing onto the unbounded queue, never the cost
    /// of delivering to every candidate.
    pub fn broadcast(&self, event: Event, origin: ConnId) {
        let _ = self.queue_tx.send(QueueItem {
            event: Arc::new(event),
            origin,
        });
    }

    fn dispatch(&self, item: QueueItem) {
        let candidates = self.index.candidates(&item.event);
        let mailboxes = self.mailboxes.read().unwrap();
        for conn_id in candidates {
            if conn_id == item.origin {
                continue;
            }
            if let Some(sender) = mailboxes.get(&conn_id) {
                if sender.try_send(item.event.clone()).is_err() {
                    debug!(conn_id, "dropping live delivery: mailbox full or closed");
                }
            }
        }
    }
}

pub fn new_mailbox() -> (mpsc::Sender<Arc<Event>>, mpsc::Receiver<Arc<Event>>) {
    mpsc::channel(MAILBOX_CAPACITY)
}
