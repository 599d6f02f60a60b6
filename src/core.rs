//! Shared handles wired together at startup and handed to every session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broadcaster::Broadcaster;
use crate::config::SharedConfig;
use crate::index::SubscriptionIndex;
use crate::store::Store;

pub struct RelayCore {
    pub store: Arc<dyn Store>,
    pub index: Arc<SubscriptionIndex>,
    pub broadcaster: Arc<Broadcaster>,
    pub config: SharedConfig,
    next_conn_id: AtomicU64,
}

impl RelayCore {
    pub fn new(store: Arc<dyn Store>, config: SharedConfig) -> Arc<Self> {
        let index = Arc::new(SubscriptionIndex::new());
        let broadcaster = Broadcaster::spawn(index.clone());
        Arc::new(Self {
            store,
            index,
            broadcaster,
            config,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}
