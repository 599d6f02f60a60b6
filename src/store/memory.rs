//! In-memory `Store` implementation. Single-writer, lock-protected; a
//! transaction is one critical section under `inner`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{is_newer, Store};
use crate::error::StoreError;
use crate::model::{filters_match, Event, Filter};

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Event>,
    by_pubkey_kind: HashMap<(String, u32), String>,
    by_pubkey_kind_d: HashMap<(String, u32, String), String>,
    by_pubkey: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn insert_indexes(&mut self, ev: &Event) {
        self.by_pubkey
            .entry(ev.pubkey.clone())
            .or_default()
            .insert(ev.id.clone());
    }

    fn remove_event(&mut self, id: &str) {
        if let Some(ev) = self.by_id.remove(id) {
            if let Some(set) = self.by_pubkey.get_mut(&ev.pubkey) {
                set.remove(id);
            }
        }
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Candidate event ids for a filter list: union of each filter's
    /// author-indexed sets when `authors` is present, which keeps a scan
    /// bounded to the matching authors' own events rather than the whole
    /// store; falls back to every stored event otherwise.
    fn candidate_ids(&self, inner: &Inner, filters: &[Filter]) -> HashSet<String> {
        let mut ids = HashSet::new();
        let mut unrestricted = false;
        for f in filters {
            match &f.authors {
                Some(authors) if !authors.is_empty() => {
                    for author in authors {
                        if author.len() == 64 {
                            if let Some(set) = inner.by_pubkey.get(author) {
                                ids.extend(set.iter().cloned());
                            }
                        } else {
                            // prefix author: scan index keys once.
                            for (pubkey, set) in &inner.by_pubkey {
                                if pubkey.starts_with(author.as_str()) {
                                    ids.extend(set.iter().cloned());
                                }
                            }
                        }
                    }
                }
                _ => unrestricted = true,
            }
        }
        if unrestricted {
            ids.extend(inner.by_id.keys().cloned());
        }
        ids
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_regular(&self, ev: Event) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        if inner.by_id.contains_key(&ev.id) {
            return Ok(());
        }
        inner.insert_indexes(&ev);
        inner.by_id.insert(ev.id.clone(), ev);
        Ok(())
    }

    async fn put_replaceable(&self, ev: Event) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let key = (ev.pubkey.clone(), ev.kind);
        let replace = match inner.by_pubkey_kind.get(&key) {
            None => true,
            Some(existing_id) => {
                let existing = inner.by_id.get(existing_id);
                existing.map(|e| is_newer(&ev, e)).unwrap_or(true)
            }
        };
        if !replace {
            return Ok(());
        }
        if let Some(old_id) = inner.by_pubkey_kind.get(&key).cloned() {
            inner.remove_event(&old_id);
        }
        inner.insert_indexes(&ev);
        inner.by_pubkey_kind.insert(key, ev.id.clone());
        inner.by_id.insert(ev.id.clone(), ev);
        Ok(())
    }

    async fn put_parameterized(&self, ev: Event) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let key = (ev.pubkey.clone(), ev.kind, ev.d_tag());
        let replace = match inner.by_pubkey_kind_d.get(&key) {
            None => true,
            Some(existing_id) => {
                let existing = inner.by_id.get(existing_id);
                existing.map(|e| is_newer(&ev, e)).unwrap_or(true)
            }
        };
        if !replace {
            return Ok(());
        }
        if let Some(old_id) = inner.by_pubkey_kind_d.get(&key).cloned() {
            inner.remove_event(&old_id);
        }
        inner.insert_indexes(&ev);
        inner.by_pubkey_kind_d.insert(key, ev.id.clone());
        inner.by_id.insert(ev.id.clone(), ev);
        Ok(())
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().map_err(|_| lock_poisoned())?;
        let candidate_ids = self.candidate_ids(&inner, filters);
        let mut results: Vec<Event> = candidate_ids
            .into_iter()
            .filter_map(|id| inner.by_id.get(&id).cloned())
            .filter(|ev| filters_match(filters, ev))
            .collect();
        results.sort_by(|a, b| (b.created_at, b.id.as_str()).cmp(&(a.created_at, a.id.as_str())));

        let limit = filters.iter().filter_map(|f| f.limit).min();
        if let Some(limit) = limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn delete_by_ids(&self, pubkey: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        for id in ids {
            let owned_by_pubkey = inner.by_id.get(id).map(|e| e.pubkey == pubkey).unwrap_or(false);
            if owned_by_pubkey {
                inner.remove_event(id);
            }
        }
        Ok(())
    }

    async fn delete_by_pubkey(&self, pubkey: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| lock_poisoned())?;
        let ids: Vec<String> = inner
            .by_pubkey
            .get(pubkey)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            inner.remove_event(&id);
        }
        inner.by_pubkey.remove(pubkey);
        Ok(())
    }
}

fn lock_poisoned() -> StoreError {
    StoreError::Transaction("lock poisoned".to_string())
}
