//! Subscription index: author-keyed connection group membership with
//! refcounts. Answers "which connections may be interested in this event?"
//! without scanning every live connection's full filter list.
//!
//! Grounded in the process-group-with-refcount idiom
//! `other_examples/.../verse-pbc-groups_relay__.../subscription_manager.rs`
//! uses for its own per-subscription bookkeeping, generalized here to
//! track group membership per author rather than per connection.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::model::Event;

type ConnId = u64;

const PUBKEY_HEX_LEN: usize = 64;

#[derive(Default)]
struct Inner {
    /// `(conn_id, sub_id) -> authors that subscription registered for`.
    sub_authors: HashMap<(ConnId, String), Vec<String>>,
    /// `(conn_id, author) -> refcount`.
    author_refcount: HashMap<(ConnId, String), usize>,
    /// Full 64-char pubkey -> live conn_ids, looked up directly.
    author_members: HashMap<String, HashSet<ConnId>>,
    /// Registered author prefixes (shorter than a full pubkey) -> live
    /// conn_ids. Checked by scanning, since an incoming event only carries
    /// its full pubkey and has to be matched against whatever prefixes are
    /// currently registered.
    prefix_members: HashMap<String, HashSet<ConnId>>,
}

/// Concurrent author-group index. Per-connection operations are
/// linearizable: they hold the single lock for their duration, and that
/// lock is only ever held for a short, bounded critical section.
pub struct SubscriptionIndex {
    inner: RwLock<Inner>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register `sub_id` for `conn_id` against `authors` (duplicates in
    /// `authors` are fine; this dedups them itself). Re-registering the
    /// same `(conn_id, sub_id)` atomically replaces its prior author set.
    pub fn register(&self, conn_id: ConnId, sub_id: &str, authors: &[String]) {
        let mut inner = self.inner.write().unwrap();
        Self::unregister_locked(&mut inner, conn_id, sub_id);

        let mut unique: Vec<String> = Vec::new();
        for a in authors {
            if !unique.contains(a) {
                unique.push(a.clone());
            }
        }

        for a in &unique {
            let count = inner
                .author_refcount
                .entry((conn_id, a.clone()))
                .or_insert(0);
            *count += 1;
            if *count == 1 {
                let members = if a.len() == PUBKEY_HEX_LEN {
                    inner.author_members.entry(a.clone()).or_default()
                } else {
                    inner.prefix_members.entry(a.clone()).or_default()
                };
                members.insert(conn_id);
            }
        }
        inner
            .sub_authors
            .insert((conn_id, sub_id.to_string()), unique);
    }

    pub fn unregister(&self, conn_id: ConnId, sub_id: &str) {
        let mut inner = self.inner.write().unwrap();
        Self::unregister_locked(&mut inner, conn_id, sub_id);
    }

    fn unregister_locked(inner: &mut Inner, conn_id: ConnId, sub_id: &str) {
        let Some(authors) = inner.sub_authors.remove(&(conn_id, sub_id.to_string())) else {
            return;
        };
        for a in authors {
            let key = (conn_id, a.clone());
            if let Some(count) = inner.author_refcount.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    inner.author_refcount.remove(&key);
                    let members = if a.len() == PUBKEY_HEX_LEN {
                        inner.author_members.get_mut(&a)
                    } else {
                        inner.prefix_members.get_mut(&a)
                    };
                    if let Some(members) = members {
                        members.remove(&conn_id);
                        if members.is_empty() {
                            if a.len() == PUBKEY_HEX_LEN {
                                inner.author_members.remove(&a);
                            } else {
                                inner.prefix_members.remove(&a);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Remove every subscription owned by `conn_id`. Idempotent: safe to
    /// call more than once, including concurrently with normal
    /// termination.
    pub fn unregister_all(&self, conn_id: ConnId) {
        let mut inner = self.inner.write().unwrap();
        let sub_ids: Vec<String> = inner
            .sub_authors
            .keys()
            .filter(|(c, _)| *c == conn_id)
            .map(|(_, s)| s.clone())
            .collect();
        for sub_id in sub_ids {
            Self::unregister_locked(&mut inner, conn_id, &sub_id);
        }
    }

    /// Snapshot of live conn_ids that may be interested in `event`: an
    /// exact match on its full pubkey, plus any connection subscribed on a
    /// prefix of it.
    pub fn candidates(&self, event: &Event) -> HashSet<ConnId> {
        let inner = self.inner.read().unwrap();
        let mut out: HashSet<ConnId> = inner
            .author_members
            .get(&event.pubkey)
            .cloned()
            .unwrap_or_default();
        for (prefix, conns) in &inner.prefix_members {
            if event.pubkey.starts_with(prefix.as_str()) {
                out.extend(conns.iter().copied());
            }
        }
        out
    }

    #[cfg(test)]
    fn refcount(&self, conn_id: ConnId, author: &str) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .author_refcount
            .get(&(conn_id, author.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(pubkey: &str) -> Event {
        Event {
            id: "e".repeat(64),
            pubkey: pubkey.to_string(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "s".repeat(128),
        }
    }

    #[test]
    fn register_then_candidates_sees_conn() {
        let idx = SubscriptionIndex::new();
        idx.register(1, "sub1", &["pk1".to_string()]);
        let c = idx.candidates(&ev("pk1"));
        assert!(c.contains(&1));
    }

    #[test]
    fn reregistering_same_sub_replaces_authors() {
        let idx = SubscriptionIndex::new();
        idx.register(1, "sub1", &["pk1".to_string()]);
        idx.register(1, "sub1", &["pk2".to_string()]);
        assert!(!idx.candidates(&ev("pk1")).contains(&1));
        assert!(idx.candidates(&ev("pk2")).contains(&1));
    }

    #[test]
    fn refcount_tracks_number_of_subs_mentioning_author() {
        let idx = SubscriptionIndex::new();
        idx.register(1, "sub1", &["pk1".to_string()]);
        idx.register(1, "sub2", &["pk1".to_string()]);
        assert_eq!(idx.refcount(1, "pk1"), 2);
        idx.unregister(1, "sub1");
        assert_eq!(idx.refcount(1, "pk1"), 1);
        assert!(idx.candidates(&ev("pk1")).contains(&1));
        idx.unregister(1, "sub2");
        assert_eq!(idx.refcount(1, "pk1"), 0);
        assert!(!idx.candidates(&ev("pk1")).contains(&1));
    }

    #[test]
    fn unregister_all_is_idempotent_and_clears_everything() {
        let idx = SubscriptionIndex::new();
        idx.register(1, "sub1", &["pk1".to_string(), "pk2".to_string()]);
        idx.register(1, "sub2", &["pk2".to_string()]);
        idx.unregister_all(1);
        idx.unregister_all(1);
        assert!(!idx.candidates(&ev("pk1")).contains(&1));
        assert!(!idx.candidates(&ev("pk2")).contains(&1));
        assert_eq!(idx.refcount(1, "pk1"), 0);
        assert_eq!(idx.refcount(1, "pk2"), 0);
    }

    #[test]
    fn duplicate_authors_within_one_filter_list_count_once() {
        let idx = SubscriptionIndex::new();
        idx.register(1, "sub1", &["pk1".to_string(), "pk1".to_string()]);
        assert_eq!(idx.refcount(1, "pk1"), 1);
    }

    #[test]
    fn exact_64_char_author_is_indexed_for_direct_lookup() {
        let idx = SubscriptionIndex::new();
        let full = "02".repeat(32);
        idx.register(1, "sub1", &[full.clone()]);
        assert!(idx.candidates(&ev(&full)).contains(&1));
        assert!(!idx.candidates(&ev(&"03".repeat(32))).contains(&1));
    }

    #[test]
    fn prefix_author_still_reaches_live_delivery() {
        let idx = SubscriptionIndex::new();
        let full = "02".repeat(32);
        idx.register(1, "sub1", &["0202".to_string()]);
        let c = idx.candidates(&ev(&full));
        assert!(
            c.contains(&1),
            "a connection subscribed on an author prefix must still be a live-delivery candidate"
        );
        assert!(!idx.candidates(&ev(&"03".repeat(32))).contains(&1));
    }
}
