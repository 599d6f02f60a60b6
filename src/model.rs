//! Wire-level data model: events, filters, and kind classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// An event as received off the wire, before validation. Every field is
/// optional/loosely typed so the Validator can distinguish `MissingField`
/// from `MalformedField`.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    pub id: Option<Value>,
    pub pubkey: Option<Value>,
    pub created_at: Option<Value>,
    pub kind: Option<Value>,
    pub tags: Option<Value>,
    pub content: Option<Value>,
    pub sig: Option<Value>,
}

/// A validated, storable event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// The value of the second element of the first `"d"` tag, or `""` if
    /// there is none. Used to key parameterized-replaceable storage.
    pub fn d_tag(&self) -> String {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .cloned()
            .unwrap_or_default()
    }

    /// Every value of a single tag name, e.g. `"e"` or `"p"`.
    pub fn tag_values(&self, name: &str) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "pubkey": self.pubkey,
            "created_at": self.created_at,
            "kind": self.kind,
            "tags": self.tags,
            "content": self.content,
            "sig": self.sig,
        })
    }
}

/// Storage class derived from `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    ParameterizedReplaceable,
    Ephemeral,
    Authentication,
}

/// Classify a kind number into its storage behavior. Kinds outside every
/// named range are treated as regular (append, keep all).
pub fn classify_kind(kind: u32) -> KindClass {
    match kind {
        22242 => KindClass::Authentication,
        0 | 3 => KindClass::Replaceable,
        k if (10000..20000).contains(&k) => KindClass::Replaceable,
        k if (20000..30000).contains(&k) => KindClass::Ephemeral,
        k if (30000..40000).contains(&k) => KindClass::ParameterizedReplaceable,
        _ => KindClass::Regular,
    }
}

/// Subscription filter. Tag filters (`#e`, `#p`, `#d`, ...) are collected
/// generically by tag name into `tags`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// `true` if every field present on this filter matches `event`.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id_matches(id, &event.id)) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors
                .iter()
                .any(|author| id_matches(author, &event.pubkey))
            {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let mut found = false;
            for t in &event.tags {
                if t.first().map(String::as_str) == Some(name.as_str()) {
                    if let Some(v) = t.get(1) {
                        if values.iter().any(|want| want == v) {
                            found = true;
                            break;
                        }
                    }
                }
            }
            if !found {
                return false;
            }
        }
        true
    }

    /// Unique authors mentioned across a filter (used by the Subscription
    /// Index). Empty/absent authors yield no entries.
    pub fn authors(&self) -> &[String] {
        self.authors.as_deref().unwrap_or(&[])
    }
}

/// An `ids`/`authors` entry matches exactly, or as a hex prefix of the full
/// 64-char value, so clients may subscribe on a shortened id or pubkey.
fn id_matches(filter_value: &str, full: &str) -> bool {
    if filter_value.len() == full.len() {
        filter_value == full
    } else {
        full.starts_with(filter_value)
    }
}

/// A list of filters matches an event when any filter in the list matches.
pub fn filters_match(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Deserialize a single filter from its raw JSON object shape, pulling out
/// the dynamic `#<X>` tag-filter keys.
pub fn parse_filter(value: &Value) -> Option<Filter> {
    let obj = value.as_object()?;
    let mut filter = Filter::default();

    if let Some(v) = obj.get("ids") {
        filter.ids = Some(string_array(v)?);
    }
    if let Some(v) = obj.get("authors") {
        filter.authors = Some(string_array(v)?);
    }
    if let Some(v) = obj.get("kinds") {
        let arr = v.as_array()?;
        let mut kinds = Vec::with_capacity(arr.len());
        for k in arr {
            kinds.push(k.as_u64()? as u32);
        }
        filter.kinds = Some(kinds);
    }
    if let Some(v) = obj.get("since") {
        filter.since = Some(v.as_i64()?);
    }
    if let Some(v) = obj.get("until") {
        filter.until = Some(v.as_i64()?);
    }
    if let Some(v) = obj.get("limit") {
        filter.limit = Some(v.as_u64()? as usize);
    }
    for (key, v) in obj {
        if key.len() >= 2 && key.starts_with('#') {
            let tag_name = &key[1..];
            if let Some(values) = string_array(v) {
                filter.tags.insert(tag_name.to_string(), values);
            }
        }
    }

    Some(filter)
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    let arr = value.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        out.push(v.as_str()?.to_string());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u32, created_at: i64, pubkey: &str, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: "b".repeat(128),
        }
    }

    #[test]
    fn classify_boundaries() {
        assert_eq!(classify_kind(0), KindClass::Replaceable);
        assert_eq!(classify_kind(3), KindClass::Replaceable);
        assert_eq!(classify_kind(1), KindClass::Regular);
        assert_eq!(classify_kind(999), KindClass::Regular);
        assert_eq!(classify_kind(1000), KindClass::Regular);
        assert_eq!(classify_kind(9999), KindClass::Regular);
        assert_eq!(classify_kind(10000), KindClass::Replaceable);
        assert_eq!(classify_kind(19999), KindClass::Replaceable);
        assert_eq!(classify_kind(20000), KindClass::Ephemeral);
        assert_eq!(classify_kind(29999), KindClass::Ephemeral);
        assert_eq!(classify_kind(30000), KindClass::ParameterizedReplaceable);
        assert_eq!(classify_kind(22242), KindClass::Authentication);
    }

    #[test]
    fn filter_requires_every_present_field() {
        let ev = event(1, 100, "pk1", vec![vec!["d", "x"]]);
        let f = Filter {
            authors: Some(vec!["pk1".to_string()]),
            kinds: Some(vec![1]),
            since: Some(50),
            ..Default::default()
        };
        assert!(f.matches(&ev));
        let f2 = Filter {
            kinds: Some(vec![2]),
            ..Default::default()
        };
        assert!(!f2.matches(&ev));
    }

    #[test]
    fn tag_filter_matches_second_element() {
        let ev = event(1, 100, "pk1", vec![vec!["e", "abc"], vec!["p", "def"]]);
        let mut tags = HashMap::new();
        tags.insert("e".to_string(), vec!["abc".to_string()]);
        let f = Filter {
            tags,
            ..Default::default()
        };
        assert!(f.matches(&ev));

        let mut tags2 = HashMap::new();
        tags2.insert("e".to_string(), vec!["zzz".to_string()]);
        let f2 = Filter {
            tags: tags2,
            ..Default::default()
        };
        assert!(!f2.matches(&ev));
    }

    #[test]
    fn prefix_match_on_authors() {
        let ev = event(1, 100, &"02".repeat(32), vec![]);
        let f = Filter {
            authors: Some(vec!["0202".to_string()]),
            ..Default::default()
        };
        assert!(f.matches(&ev));
    }

    #[test]
    fn or_across_filter_list() {
        let ev = event(5, 1, "pk1", vec![]);
        let filters = vec![
            Filter {
                kinds: Some(vec![1]),
                ..Default::default()
            },
            Filter {
                kinds: Some(vec![5]),
                ..Default::default()
            },
        ];
        assert!(filters_match(&filters, &ev));
    }
}
