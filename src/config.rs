//! Runtime configuration. Loaded once from the environment at startup,
//! then held behind an `ArcSwap` so hot-path reads (`auth.required`,
//! `auth.allowed_pubkeys`) never block on a writer publishing a reload.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;

#[derive(Debug, Clone)]
pub struct RelayInformation {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub contact: String,
}

impl Default for RelayInformation {
    fn default() -> Self {
        Self {
            name: "relay-rs".to_string(),
            description: "A Rust-based relay".to_string(),
            pubkey: String::new(),
            contact: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub auth_required: bool,
    pub allowed_pubkeys: HashSet<String>,
    pub information: RelayInformation,
}

impl RuntimeConfig {
    /// Whether `pubkey` may publish or subscribe: allowed when the
    /// allow-list is empty, or when it contains `pubkey`.
    pub fn pubkey_allowed(&self, pubkey: &str) -> bool {
        self.allowed_pubkeys.is_empty() || self.allowed_pubkeys.contains(pubkey)
    }

    pub fn from_env() -> Self {
        let auth_required = std::env::var("AUTH_REQUIRED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let allowed_pubkeys = std::env::var("AUTH_ALLOWED_PUBKEYS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        let information = RelayInformation {
            name: std::env::var("RELAY_NAME").unwrap_or_else(|_| "relay-rs".to_string()),
            description: std::env::var("RELAY_DESCRIPTION")
                .unwrap_or_else(|_| "A Rust-based relay".to_string()),
            pubkey: std::env::var("RELAY_PUBKEY").unwrap_or_default(),
            contact: std::env::var("RELAY_CONTACT").unwrap_or_default(),
        };
        Self {
            auth_required,
            allowed_pubkeys,
            information,
        }
    }
}

/// Shared handle to the live configuration. Single-writer (admin reload),
/// many-reader (every session, on every `EVENT`/`REQ`).
#[derive(Clone)]
pub struct SharedConfig(Arc<ArcSwap<RuntimeConfig>>);

impl SharedConfig {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(initial)))
    }

    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.0.load_full()
    }

    pub fn store(&self, new: RuntimeConfig) {
        self.0.store(Arc::new(new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_allows_everyone() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.pubkey_allowed("anything"));
    }

    #[test]
    fn non_empty_allow_list_restricts() {
        let mut cfg = RuntimeConfig::default();
        cfg.allowed_pubkeys.insert("pk1".to_string());
        assert!(cfg.pubkey_allowed("pk1"));
        assert!(!cfg.pubkey_allowed("pk2"));
    }

    #[test]
    fn shared_config_reads_see_latest_store() {
        let shared = SharedConfig::new(RuntimeConfig::default());
        assert!(!shared.load().auth_required);
        let mut updated = RuntimeConfig::default();
        updated.auth_required = true;
        shared.store(updated);
        assert!(shared.load().auth_required);
    }
}
