//! Wire protocol: JSON arrays over WebSocket text frames.

use serde_json::Value;

use crate::model::{parse_filter, Filter, RawEvent};

/// A parsed client -> relay frame.
pub enum ClientFrame {
    Event(RawEvent),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Auth(RawEvent),
}

/// Parse an inbound text frame. `None` means "malformed or unknown",
/// surfaced by the caller as `NOTICE "Invalid message"`.
pub fn parse_client_frame(text: &str) -> Option<ClientFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let tag = arr.first()?.as_str()?;
    match tag {
        "EVENT" => {
            let ev_val = arr.get(1)?.clone();
            let raw: RawEvent = serde_json::from_value(ev_val).ok()?;
            Some(ClientFrame::Event(raw))
        }
        "REQ" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            let mut filters = Vec::new();
            for v in arr.iter().skip(2) {
                filters.push(parse_filter(v)?);
            }
            Some(ClientFrame::Req { sub_id, filters })
        }
        "CLOSE" => {
            let sub_id = arr.get(1)?.as_str()?.to_string();
            Some(ClientFrame::Close(sub_id))
        }
        "AUTH" => {
            let ev_val = arr.get(1)?.clone();
            let raw: RawEvent = serde_json::from_value(ev_val).ok()?;
            Some(ClientFrame::Auth(raw))
        }
        _ => None,
    }
}

pub fn ok_message(id: &str, accepted: bool, message: &str) -> String {
    serde_json::json!(["OK", id, accepted, message]).to_string()
}

pub fn event_message(sub_id: &str, event_json: Value) -> String {
    serde_json::json!(["EVENT", sub_id, event_json]).to_string()
}

pub fn eose_message(sub_id: &str) -> String {
    serde_json::json!(["EOSE", sub_id]).to_string()
}

pub fn notice_message(message: &str) -> String {
    serde_json::json!(["NOTICE", message]).to_string()
}

pub fn auth_message(challenge: &str) -> String {
    serde_json::json!(["AUTH", challenge]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_non_array_is_rejected() {
        assert!(parse_client_frame(r#"{"a":1}"#).is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(parse_client_frame(r#"["WAT"]"#).is_none());
    }

    #[test]
    fn req_parses_multiple_filters() {
        let msg = r#"["REQ", "sub1", {"authors":["pk1"]}, {"authors":["pk2"]}]"#;
        match parse_client_frame(msg) {
            Some(ClientFrame::Req { sub_id, filters }) => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(filters.len(), 2);
            }
            _ => panic!("expected Req"),
        }
    }

    #[test]
    fn close_parses_sub_id() {
        match parse_client_frame(r#"["CLOSE", "sub1"]"#) {
            Some(ClientFrame::Close(id)) => assert_eq!(id, "sub1"),
            _ => panic!("expected Close"),
        }
    }
}
