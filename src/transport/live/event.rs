use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use prost::Message as ProstMessage;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{DomainEvent, next_event_id};

use super::proto::{INTERACT_ENTER, InteractWordV2};

pub const CMD_DANMU_MSG: &str = "DANMU_MSG";
pub const CMD_WATCHED_CHANGE: &str = "WATCHED_CHANGE";
pub const CMD_ONLINE_RANK_COUNT: &str = "ONLINE_RANK_COUNT";
pub const CMD_SEND_GIFT: &str = "SEND_GIFT";
pub const CMD_SUPER_CHAT_MESSAGE: &str = "SUPER_CHAT_MESSAGE";
pub const CMD_INTERACT_WORD_V2: &str = "INTERACT_WORD_V2";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("body is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{cmd}: missing or mistyped field {field}")]
    MissingField { cmd: &'static str, field: &'static str },
    #[error("{cmd}: bad base64 payload: {source}")]
    Base64 {
        cmd: &'static str,
        source: base64::DecodeError,
    },
    #[error("{cmd}: bad protobuf payload: {source}")]
    Protobuf {
        cmd: &'static str,
        source: prost::DecodeError,
    },
}

/// Decodes one application body.
///
/// `Ok(None)` means the body was understood but carries nothing to publish:
/// no `cmd`, or a `cmd` this client does not handle. New commands show up on
/// the platform all the time, so that case is routine.
pub fn decode_event(body: &[u8]) -> Result<Option<DomainEvent>, EventError> {
    let text = std::str::from_utf8(body)?;
    let json: Value = serde_json::from_str(text)?;

    let Some(cmd) = json.get("cmd").and_then(Value::as_str) else {
        debug!("Body without cmd ignored");
        return Ok(None);
    };

    let event = match cmd {
        CMD_DANMU_MSG => danmu_msg(&json)?,
        CMD_WATCHED_CHANGE => DomainEvent::WatchedCountUpdate {
            count: u64_at(&json, "/data/num", CMD_WATCHED_CHANGE, "data.num")?,
        },
        CMD_ONLINE_RANK_COUNT => DomainEvent::OnlineRankCountUpdate {
            count: u64_at(&json, "/data/count", CMD_ONLINE_RANK_COUNT, "data.count")?,
        },
        CMD_SEND_GIFT => send_gift(&json)?,
        CMD_SUPER_CHAT_MESSAGE => super_chat(&json)?,
        CMD_INTERACT_WORD_V2 => interact_word(&json)?,
        other => {
            debug!("Ignoring cmd: {other}");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn str_at(
    json: &Value,
    pointer: &str,
    cmd: &'static str,
    field: &'static str,
) -> Result<String, EventError> {
    json.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(EventError::MissingField { cmd, field })
}

fn u64_at(
    json: &Value,
    pointer: &str,
    cmd: &'static str,
    field: &'static str,
) -> Result<u64, EventError> {
    json.pointer(pointer)
        .and_then(Value::as_u64)
        .ok_or(EventError::MissingField { cmd, field })
}

/// `DANMU_MSG` addresses its fields by position:
/// `info[0][15].user.base.{name,face}` and `info[1]` for the text.
/// All index lookups for this layout live here.
fn danmu_msg(json: &Value) -> Result<DomainEvent, EventError> {
    const CMD: &str = CMD_DANMU_MSG;
    let info = json
        .get("info")
        .and_then(Value::as_array)
        .ok_or(EventError::MissingField { cmd: CMD, field: "info" })?;

    let text = info
        .get(1)
        .and_then(Value::as_str)
        .ok_or(EventError::MissingField { cmd: CMD, field: "info[1]" })?;

    let user = info
        .first()
        .and_then(Value::as_array)
        .and_then(|meta| meta.get(15))
        .and_then(|extra| extra.pointer("/user/base"))
        .ok_or(EventError::MissingField {
            cmd: CMD,
            field: "info[0][15].user.base",
        })?;

    let username = user
        .get("name")
        .and_then(Value::as_str)
        .ok_or(EventError::MissingField {
            cmd: CMD,
            field: "info[0][15].user.base.name",
        })?;
    let avatar = user
        .get("face")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(DomainEvent::ChatMessage {
        id: next_event_id(),
        username: username.to_string(),
        avatar,
        text: text.to_string(),
        timestamp: Utc::now(),
    })
}

fn send_gift(json: &Value) -> Result<DomainEvent, EventError> {
    const CMD: &str = CMD_SEND_GIFT;
    let username = str_at(json, "/data/uname", CMD, "data.uname")?;
    let gift_name = str_at(json, "/data/giftName", CMD, "data.giftName")?;
    let gift_count = u64_at(json, "/data/num", CMD, "data.num")?;
    Ok(DomainEvent::GiftNotice {
        id: next_event_id(),
        username,
        gift_name,
        gift_count,
        timestamp: Utc::now(),
    })
}

fn super_chat(json: &Value) -> Result<DomainEvent, EventError> {
    const CMD: &str = CMD_SUPER_CHAT_MESSAGE;
    let username = str_at(json, "/data/user_info/uname", CMD, "data.user_info.uname")?;
    let avatar = str_at(json, "/data/user_info/face", CMD, "data.user_info.face")?;
    let text = str_at(json, "/data/message", CMD, "data.message")?;
    let amount = u64_at(json, "/data/price", CMD, "data.price")?;
    Ok(DomainEvent::SuperChatMessage {
        id: next_event_id(),
        username,
        avatar,
        text,
        amount,
        timestamp: Utc::now(),
    })
}

fn interact_word(json: &Value) -> Result<DomainEvent, EventError> {
    const CMD: &str = CMD_INTERACT_WORD_V2;
    let pb = json
        .pointer("/data/pb")
        .and_then(Value::as_str)
        .ok_or(EventError::MissingField { cmd: CMD, field: "data.pb" })?;
    let raw = BASE64
        .decode(pb)
        .map_err(|source| EventError::Base64 { cmd: CMD, source })?;
    let word = InteractWordV2::decode(raw.as_slice())
        .map_err(|source| EventError::Protobuf { cmd: CMD, source })?;

    if word.msg_type != INTERACT_ENTER {
        debug!("INTERACT_WORD_V2 msg_type={} from {}", word.msg_type, word.uname);
    }
    Ok(DomainEvent::EnterNotice {
        id: next_event_id(),
        username: word.uname,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> Option<DomainEvent> {
        decode_event(json.as_bytes()).unwrap()
    }

    #[test]
    fn danmu_msg_reads_positional_fields() {
        let body = r#"{"cmd":"DANMU_MSG","info":[[0,1,25,16777215,1700000000000,0,0,"",0,0,0,"",0,"{}","{}",{"user":{"base":{"name":"Alice","face":"u1"}}}],"hello",[1,"Alice"]]}"#;
        match decode(body) {
            Some(DomainEvent::ChatMessage {
                username,
                text,
                avatar,
                ..
            }) => {
                assert_eq!(username, "Alice");
                assert_eq!(text, "hello");
                assert_eq!(avatar.as_deref(), Some("u1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn danmu_msg_with_short_meta_array_is_field_error() {
        let body = r#"{"cmd":"DANMU_MSG","info":[[0,1,2],"hello"]}"#;
        let err = decode_event(body.as_bytes()).unwrap_err();
        assert!(matches!(err, EventError::MissingField { cmd: "DANMU_MSG", .. }));
    }

    #[test]
    fn watched_change() {
        assert_eq!(
            decode(r#"{"cmd":"WATCHED_CHANGE","data":{"num":1234,"text_small":"1234"}}"#),
            Some(DomainEvent::WatchedCountUpdate { count: 1234 })
        );
    }

    #[test]
    fn online_rank_count() {
        assert_eq!(
            decode(r#"{"cmd":"ONLINE_RANK_COUNT","data":{"count":42}}"#),
            Some(DomainEvent::OnlineRankCountUpdate { count: 42 })
        );
    }

    #[test]
    fn send_gift() {
        let body = r#"{"cmd":"SEND_GIFT","data":{"uname":"Bob","giftName":"辣条","num":3}}"#;
        match decode(body) {
            Some(DomainEvent::GiftNotice {
                username,
                gift_name,
                gift_count,
                ..
            }) => {
                assert_eq!(username, "Bob");
                assert_eq!(gift_name, "辣条");
                assert_eq!(gift_count, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn super_chat_message() {
        let body = r#"{"cmd":"SUPER_CHAT_MESSAGE","data":{"message":"hi streamer","price":30,"user_info":{"uname":"Carol","face":"https://f/c.jpg"}}}"#;
        match decode(body) {
            Some(DomainEvent::SuperChatMessage {
                username,
                avatar,
                text,
                amount,
                ..
            }) => {
                assert_eq!(username, "Carol");
                assert_eq!(avatar, "https://f/c.jpg");
                assert_eq!(text, "hi streamer");
                assert_eq!(amount, 30);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interact_word_v2_decodes_protobuf_username() {
        let word = InteractWordV2 {
            uid: 99,
            uname: "Dave".into(),
            msg_type: INTERACT_ENTER,
            roomid: 1000,
            timestamp: 1_700_000_000,
        };
        let pb = BASE64.encode(word.encode_to_vec());
        let body =
            serde_json::json!({ "cmd": "INTERACT_WORD_V2", "data": { "pb": pb } }).to_string();
        match decode(&body) {
            Some(DomainEvent::EnterNotice { username, .. }) => assert_eq!(username, "Dave"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interact_word_v2_bad_base64() {
        let body = r#"{"cmd":"INTERACT_WORD_V2","data":{"pb":"***"}}"#;
        assert!(matches!(
            decode_event(body.as_bytes()),
            Err(EventError::Base64 { .. })
        ));
    }

    #[test]
    fn unknown_cmd_is_ignored() {
        assert_eq!(decode(r#"{"cmd":"UNKNOWN_FUTURE_CMD","data":{"x":[1,2,3]}}"#), None);
    }

    #[test]
    fn cmd_match_is_exact() {
        assert_eq!(decode(r#"{"cmd":"danmu_msg","info":[]}"#), None);
    }

    #[test]
    fn missing_field_is_an_error() {
        assert!(matches!(
            decode_event(br#"{"cmd":"WATCHED_CHANGE","data":{"num":"many"}}"#),
            Err(EventError::MissingField { field: "data.num", .. })
        ));
    }

    #[test]
    fn non_json_body_is_an_error() {
        assert!(matches!(
            decode_event(b"\x00\x00\x01\x02"),
            Err(EventError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_event(&[0xff, 0xfe]),
            Err(EventError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn ids_increase_across_kinds() {
        let gift = decode(r#"{"cmd":"SEND_GIFT","data":{"uname":"a","giftName":"g","num":1}}"#);
        let sc = decode(
            r#"{"cmd":"SUPER_CHAT_MESSAGE","data":{"message":"m","price":1,"user_info":{"uname":"b","face":"f"}}}"#,
        );
        let (
            Some(DomainEvent::GiftNotice { id: a, .. }),
            Some(DomainEvent::SuperChatMessage { id: b, .. }),
        ) = (gift, sc)
        else {
            panic!("unexpected events");
        };
        assert!(b > a);
    }
}
