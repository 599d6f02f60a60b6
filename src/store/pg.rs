//! Postgres-backed `Store`, a durable alternative to `MemoryStore` behind
//! the same trait. Not wired into the default binary (see `main.rs`);
//! opted into by setting `DATABASE_URL`.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use super::Store;
use crate::error::StoreError;
use crate::model::{filters_match, Event, Filter};

pub struct PgStore {
    pool: PgPool,
}

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    pubkey TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    kind INTEGER NOT NULL,
    tags JSONB NOT NULL,
    content TEXT NOT NULL,
    sig TEXT NOT NULL,
    d_tag TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS events_pubkey_idx ON events (pubkey);
CREATE UNIQUE INDEX IF NOT EXISTS events_pubkey_kind_idx ON events (pubkey, kind)
    WHERE kind = 0 OR kind = 3 OR (kind >= 10000 AND kind < 20000);
CREATE UNIQUE INDEX IF NOT EXISTS events_pubkey_kind_d_idx ON events (pubkey, kind, d_tag)
    WHERE kind >= 30000 AND kind < 40000;
"#;

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(50)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        sqlx::query(INIT_SQL)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(Self { pool })
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, StoreError> {
        let tags_json: serde_json::Value = row
            .try_get("tags")
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let tags: Vec<Vec<String>> =
            serde_json::from_value(tags_json).map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(Event {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::Transaction(e.to_string()))?,
            pubkey: row
                .try_get("pubkey")
                .map_err(|e| StoreError::Transaction(e.to_string()))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| StoreError::Transaction(e.to_string()))?,
            kind: row.try_get::<i32, _>("kind").map_err(|e| StoreError::Transaction(e.to_string()))? as u32,
            tags,
            content: row
                .try_get("content")
                .map_err(|e| StoreError::Transaction(e.to_string()))?,
            sig: row
                .try_get("sig")
                .map_err(|e| StoreError::Transaction(e.to_string()))?,
        })
    }
}

/// Run `op` once; on failure, run it again before surfacing `StoreError`.
/// `MemoryStore` has no transient failure mode a retry would help (a
/// poisoned lock never recovers by retrying), so this lives only on the
/// backend that actually has one.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(_) => op().await,
    }
}

#[async_trait]
impl Store for PgStore {
    async fn put_regular(&self, ev: Event) -> Result<(), StoreError> {
        retry_once(|| self.put_regular_once(&ev)).await
    }

    async fn put_replaceable(&self, ev: Event) -> Result<(), StoreError> {
        retry_once(|| self.put_replaceable_once(&ev)).await
    }

    async fn put_parameterized(&self, ev: Event) -> Result<(), StoreError> {
        retry_once(|| self.put_parameterized_once(&ev)).await
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError> {
        retry_once(|| self.query_once(filters)).await
    }

    async fn delete_by_ids(&self, pubkey: &str, ids: &[String]) -> Result<(), StoreError> {
        retry_once(|| self.delete_by_ids_once(pubkey, ids)).await
    }

    async fn delete_by_pubkey(&self, pubkey: &str) -> Result<(), StoreError> {
        retry_once(|| self.delete_by_pubkey_once(pubkey)).await
    }
}

impl PgStore {
    async fn put_regular_once(&self, ev: &Event) -> Result<(), StoreError> {
        let tags_json = serde_json::to_value(&ev.tags).unwrap_or_default();
        sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&ev.id)
        .bind(&ev.pubkey)
        .bind(ev.created_at)
        .bind(ev.kind as i32)
        .bind(tags_json)
        .bind(&ev.content)
        .bind(&ev.sig)
        .bind(ev.d_tag())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn put_replaceable_once(&self, ev: &Event) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let existing = sqlx::query("SELECT created_at, id FROM events WHERE pubkey = $1 AND kind = $2")
            .bind(&ev.pubkey)
            .bind(ev.kind as i32)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        if let Some(row) = existing {
            let existing_created_at: i64 = row
                .try_get("created_at")
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            let existing_id: String = row
                .try_get("id")
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            if (ev.created_at, ev.id.as_str()) <= (existing_created_at, existing_id.as_str()) {
                tx.commit().await.map_err(|e| StoreError::Transaction(e.to_string()))?;
                return Ok(());
            }
            sqlx::query("DELETE FROM events WHERE pubkey = $1 AND kind = $2")
                .bind(&ev.pubkey)
                .bind(ev.kind as i32)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
        }
        let tags_json = serde_json::to_value(&ev.tags).unwrap_or_default();
        sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&ev.id)
        .bind(&ev.pubkey)
        .bind(ev.created_at)
        .bind(ev.kind as i32)
        .bind(tags_json)
        .bind(&ev.content)
        .bind(&ev.sig)
        .bind(ev.d_tag())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Transaction(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn put_parameterized_once(&self, ev: &Event) -> Result<(), StoreError> {
        let d_tag = ev.d_tag();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let existing = sqlx::query(
            "SELECT created_at, id FROM events WHERE pubkey = $1 AND kind = $2 AND d_tag = $3",
        )
        .bind(&ev.pubkey)
        .bind(ev.kind as i32)
        .bind(&d_tag)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Transaction(e.to_string()))?;
        if let Some(row) = existing {
            let existing_created_at: i64 = row
                .try_get("created_at")
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            let existing_id: String = row
                .try_get("id")
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            if (ev.created_at, ev.id.as_str()) <= (existing_created_at, existing_id.as_str()) {
                tx.commit().await.map_err(|e| StoreError::Transaction(e.to_string()))?;
                return Ok(());
            }
            sqlx::query("DELETE FROM events WHERE pubkey = $1 AND kind = $2 AND d_tag = $3")
                .bind(&ev.pubkey)
                .bind(ev.kind as i32)
                .bind(&d_tag)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
        }
        let tags_json = serde_json::to_value(&ev.tags).unwrap_or_default();
        sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&ev.id)
        .bind(&ev.pubkey)
        .bind(ev.created_at)
        .bind(ev.kind as i32)
        .bind(tags_json)
        .bind(&ev.content)
        .bind(&ev.sig)
        .bind(d_tag)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Transaction(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn query_once(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError> {
        // Authors restrict the scan: fetch the author-keyed candidate rows
        // per filter and apply full filter matching in process, same
        // division of labor as `MemoryStore`. A short (prefix) author is
        // matched with `LIKE prefix || '%'` since `pubkey = ANY($1)` only
        // catches full 64-char hex equality, mirroring the prefix branch
        // `SubscriptionIndex`/`MemoryStore` both take for the same filters.
        const PUBKEY_HEX_LEN: usize = 64;
        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::new();
        for f in filters {
            let authors = f.authors.clone().unwrap_or_default();
            if authors.is_empty() {
                continue;
            }
            let (full, prefixes): (Vec<String>, Vec<String>) = authors
                .into_iter()
                .partition(|a| a.len() == PUBKEY_HEX_LEN);

            let mut rows = Vec::new();
            if !full.is_empty() {
                rows.extend(
                    sqlx::query("SELECT * FROM events WHERE pubkey = ANY($1)")
                        .bind(&full)
                        .fetch_all(&self.pool)
                        .await
                        .map_err(|e| StoreError::Transaction(e.to_string()))?,
                );
            }
            for prefix in &prefixes {
                rows.extend(
                    sqlx::query("SELECT * FROM events WHERE pubkey LIKE $1 || '%'")
                        .bind(prefix)
                        .fetch_all(&self.pool)
                        .await
                        .map_err(|e| StoreError::Transaction(e.to_string()))?,
                );
            }

            for row in rows {
                let ev = Self::row_to_event(&row)?;
                if seen.contains(&ev.id) {
                    continue;
                }
                if filters_match(filters, &ev) {
                    seen.insert(ev.id.clone());
                    results.push(ev);
                }
            }
        }
        results.sort_by(|a, b| (b.created_at, b.id.as_str()).cmp(&(a.created_at, a.id.as_str())));
        if let Some(limit) = filters.iter().filter_map(|f| f.limit).min() {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn delete_by_ids_once(&self, pubkey: &str, ids: &[String]) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM events WHERE pubkey = $1 AND id = ANY($2)")
            .bind(pubkey)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_pubkey_once(&self, pubkey: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM events WHERE pubkey = $1")
            .bind(pubkey)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }
}
