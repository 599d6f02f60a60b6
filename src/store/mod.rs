//! Transactional, linearizable event persistence.

pub mod memory;
pub mod pg;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Event, Filter};

/// Persistence backend. `MemoryStore` is a single-writer, lock-protected
/// in-memory implementation; `PgStore` is a durable Postgres-backed
/// alternative behind the same trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert if `id` is not already present; a duplicate id is a no-op
    /// that still returns `Ok`.
    async fn put_regular(&self, ev: Event) -> Result<(), StoreError>;

    /// Keep only the latest event per `(pubkey, kind)`.
    async fn put_replaceable(&self, ev: Event) -> Result<(), StoreError>;

    /// Keep only the latest event per `(pubkey, kind, d_tag)`.
    async fn put_parameterized(&self, ev: Event) -> Result<(), StoreError>;

    /// Events matching any filter in the list, deduplicated by id, sorted
    /// `(created_at desc, id desc)`, truncated to the smallest present
    /// `limit` across matching filters.
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError>;

    /// NIP-09 style deletion: remove `ids` if and only if they belong to
    /// `pubkey`.
    async fn delete_by_ids(&self, pubkey: &str, ids: &[String]) -> Result<(), StoreError>;

    /// NIP-62 style "request to vanish": remove every event by `pubkey`.
    async fn delete_by_pubkey(&self, pubkey: &str) -> Result<(), StoreError>;
}

/// "Latest" tie-break for replaceable/parameterized-replaceable kinds:
/// higher `created_at` wins, ties broken by lexicographically greater
/// `id`.
pub fn is_newer(candidate: &Event, incumbent: &Event) -> bool {
    (candidate.created_at, candidate.id.as_str()) > (incumbent.created_at, incumbent.id.as_str())
}
