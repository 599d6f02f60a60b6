//! Event validation: canonical serialization, id hash, and
//! Schnorr-over-secp256k1 signature check. Pure and stateless. This is the
//! only place hash/signature checks happen; the session never reimplements
//! them.

use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ValidationError;
use crate::model::{Event, RawEvent};

/// Validate a raw, untrusted event.
pub fn validate(raw: RawEvent) -> Result<Event, ValidationError> {
    let id_val = raw.id.ok_or(ValidationError::MissingField("id"))?;
    let pubkey_val = raw.pubkey.ok_or(ValidationError::MissingField("pubkey"))?;
    let created_at_val = raw
        .created_at
        .ok_or(ValidationError::MissingField("created_at"))?;
    let kind_val = raw.kind.ok_or(ValidationError::MissingField("kind"))?;
    let tags_val = raw.tags.ok_or(ValidationError::MissingField("tags"))?;
    let content_val = raw.content.ok_or(ValidationError::MissingField("content"))?;
    let sig_val = raw.sig.ok_or(ValidationError::MissingField("sig"))?;

    let id = id_val
        .as_str()
        .ok_or(ValidationError::MalformedField("id"))?
        .to_string();
    let pubkey = pubkey_val
        .as_str()
        .ok_or(ValidationError::MalformedField("pubkey"))?
        .to_string();
    let created_at = created_at_val
        .as_i64()
        .ok_or(ValidationError::MalformedField("created_at"))?;
    let kind = kind_val
        .as_u64()
        .ok_or(ValidationError::MalformedField("kind"))?;
    let kind: u32 = kind
        .try_into()
        .map_err(|_| ValidationError::MalformedField("kind"))?;
    let tags = parse_tags(&tags_val).ok_or(ValidationError::MalformedField("tags"))?;
    let content = content_val
        .as_str()
        .ok_or(ValidationError::MalformedField("content"))?
        .to_string();
    let sig = sig_val
        .as_str()
        .ok_or(ValidationError::MalformedField("sig"))?
        .to_string();

    let id_bytes = decode_hex(&id, 32).ok_or(ValidationError::MalformedField("id"))?;
    let pubkey_bytes = decode_hex(&pubkey, 32).ok_or(ValidationError::MalformedField("pubkey"))?;
    let sig_bytes = decode_hex(&sig, 64).ok_or(ValidationError::MalformedField("sig"))?;

    let computed = canonical_id(&pubkey, created_at, kind, &tags, &content);
    if computed != id_bytes {
        return Err(ValidationError::IdMismatch);
    }

    let secp = Secp256k1::verification_only();
    let pk = XOnlyPublicKey::from_slice(&pubkey_bytes).map_err(|_| ValidationError::BadSignature)?;
    let msg = Message::from_digest_slice(&id_bytes).map_err(|_| ValidationError::BadSignature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| ValidationError::BadSignature)?;
    secp.verify_schnorr(&signature, &msg, &pk)
        .map_err(|_| ValidationError::BadSignature)?;

    Ok(Event {
        id,
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig,
    })
}

fn parse_tags(value: &Value) -> Option<Vec<Vec<String>>> {
    let arr = value.as_array()?;
    let mut tags = Vec::with_capacity(arr.len());
    for inner in arr {
        let inner_arr = inner.as_array()?;
        let mut tag = Vec::with_capacity(inner_arr.len());
        for v in inner_arr {
            tag.push(v.as_str()?.to_string());
        }
        tags.push(tag);
    }
    Some(tags)
}

fn decode_hex(s: &str, expected_len: usize) -> Option<Vec<u8>> {
    if s.len() != expected_len * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    hex::decode(s).ok()
}

/// `sha256(canonical_serialize([0, pubkey, created_at, kind, tags, content]))`.
pub fn canonical_id(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Vec<u8> {
    let serialized = canonical_serialize(pubkey, created_at, kind, tags, content);
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.finalize().to_vec()
}

/// Produce the exact JSON array `[0, pubkey, created_at, kind, tags, content]`
/// with no insignificant whitespace. Written by hand rather than via
/// `serde_json::to_string` because serde's string escaping (ASCII-only
/// `\uXXXX` for non-ASCII) doesn't match what signers actually hash:
/// non-ASCII content must round-trip as raw UTF-8 or every id recomputes
/// differently than the client that signed it.
fn canonical_serialize(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let mut out = String::new();
    out.push('[');
    out.push('0');
    out.push(',');
    push_json_string(&mut out, pubkey);
    out.push(',');
    out.push_str(&created_at.to_string());
    out.push(',');
    out.push_str(&kind.to_string());
    out.push(',');
    out.push('[');
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, item) in tag.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            push_json_string(&mut out, item);
        }
        out.push(']');
    }
    out.push(']');
    out.push(',');
    push_json_string(&mut out, content);
    out.push(']');
    out
}

/// JSON-escape a string: `"`, `\`, and control chars `< 0x20` are escaped;
/// `/` is left bare; non-ASCII is emitted as raw UTF-8.
fn push_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_serialize_has_no_extra_whitespace() {
        let s = canonical_serialize("pk", 100, 1, &[vec!["e".to_string(), "v".to_string()]], "hi");
        assert_eq!(s, r#"[0,"pk",100,1,[["e","v"]],"hi"]"#);
    }

    #[test]
    fn escapes_quotes_and_backslashes_not_slashes() {
        let s = canonical_serialize("pk", 0, 1, &[], "a\"b\\c/d");
        assert_eq!(s, r#"[0,"pk",0,1,[],"a\"b\\c/d"]"#);
    }

    #[test]
    fn missing_field_is_detected() {
        let raw = RawEvent {
            id: None,
            pubkey: None,
            created_at: None,
            kind: None,
            tags: None,
            content: None,
            sig: None,
        };
        assert_eq!(
            validate(raw).unwrap_err(),
            ValidationError::MissingField("id")
        );
    }

    #[test]
    fn malformed_hex_id_is_rejected() {
        let raw = RawEvent {
            id: Some(Value::String("not-hex".to_string())),
            pubkey: Some(Value::String("a".repeat(64))),
            created_at: Some(Value::from(1)),
            kind: Some(Value::from(1)),
            tags: Some(Value::Array(vec![])),
            content: Some(Value::String(String::new())),
            sig: Some(Value::String("b".repeat(128))),
        };
        assert_eq!(
            validate(raw).unwrap_err(),
            ValidationError::MalformedField("id")
        );
    }
}
