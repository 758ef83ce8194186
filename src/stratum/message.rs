use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// JSON-RPC id. Pools use numbers; notifications carry `null` or omit the
/// field entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Null,
    Number(u64),
    String(String),
}

/// Error payload as the stratum dialects ship it: usually the array form
/// `[code, message, traceback]`, occasionally an object.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl Serialize for RpcError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.serialize_element(&Value::Null)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RpcError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Array(items) => Ok(RpcError {
                code: items.first().and_then(Value::as_i64).unwrap_or(0),
                message: items
                    .get(1)
                    .map(stringify)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            }),
            Value::Object(map) => Ok(RpcError {
                code: map.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: map
                    .get("message")
                    .map(stringify)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            }),
            other => Ok(RpcError {
                code: 0,
                message: stringify(other),
            }),
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One newline-framed message in either direction.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Value,
    },
    Response {
        id: Id,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Stratum notifications carry `id: null`, which JSON-RPC says should be an
/// absent field; shape-sniff instead of trusting the tag.
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;

        let has_method = value.get("method").is_some();
        let id_is_real = matches!(value.get("id"), Some(v) if !v.is_null());
        let is_response = value.get("result").is_some() || value.get("error").is_some();

        if has_method {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| de::Error::custom("method is not a string"))?
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            if id_is_real {
                let id = serde_json::from_value(value.get("id").cloned().unwrap_or(Value::Null))
                    .map_err(de::Error::custom)?;
                return Ok(Message::Request { id, method, params });
            }
            return Ok(Message::Notification { method, params });
        }

        if is_response {
            let id = serde_json::from_value(value.get("id").cloned().unwrap_or(Value::Null))
                .map_err(de::Error::custom)?;
            let result = match value.get("result") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.clone()),
            };
            let error = match value.get("error") {
                None | Some(Value::Null) => None,
                Some(v) => Some(serde_json::from_value(v.clone()).map_err(de::Error::custom)?),
            };
            return Ok(Message::Response { id, result, error });
        }

        Err(de::Error::custom("unknown message shape"))
    }
}

impl Message {
    pub fn request(id: u64, method: &str, params: Value) -> Message {
        Message::Request {
            id: Id::Number(id),
            method: method.to_string(),
            params,
        }
    }
}

/// Frame shape filter: a well-formed frame is a single JSON object on one
/// line. Anything else is a partial read or transport noise.
pub fn looks_like_frame(line: &str) -> bool {
    !line.is_empty() && line.starts_with('{') && line.ends_with('}')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[track_caller]
    fn case(s: &str, expected: Message) {
        let actual = serde_json::from_str::<Message>(s).unwrap();
        assert_eq!(actual, expected, "deserialize Message from str");

        let serialized = serde_json::to_string(&actual).unwrap();
        let lhs: Value = serde_json::from_str(s).unwrap();
        let rhs: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(lhs, rhs, "JSON semantic equality");

        let round_trip = serde_json::from_str::<Message>(&serialized).unwrap();
        assert_eq!(round_trip, expected, "roundtrip");
    }

    #[test]
    fn subscribe_request() {
        case(
            r#"{"id":1,"method":"mining.subscribe","params":[]}"#,
            Message::request(1, "mining.subscribe", json!([])),
        );
    }

    #[test]
    fn ethereum_stratum_subscribe_result() {
        case(
            r#"{"id":1,"result":[["mining.notify","ae6812eb","EthereumStratum/1.0.0"],"08c0"],"error":null}"#,
            Message::Response {
                id: Id::Number(1),
                result: Some(json!([
                    ["mining.notify", "ae6812eb", "EthereumStratum/1.0.0"],
                    "08c0"
                ])),
                error: None,
            },
        );
    }

    #[test]
    fn notify_with_null_id_is_a_notification() {
        let expected = Message::Notification {
            method: "mining.notify".into(),
            params: json!(["j", "0xaa", "0xbb", "0x1234", 1000]),
        };
        assert_eq!(
            serde_json::from_str::<Message>(
                r#"{"id":null,"method":"mining.notify","params":["j","0xaa","0xbb","0x1234",1000]}"#
            )
            .unwrap(),
            expected
        );
        assert_eq!(
            serde_json::from_str::<Message>(
                r#"{"method":"mining.notify","params":["j","0xaa","0xbb","0x1234",1000]}"#
            )
            .unwrap(),
            expected
        );
    }

    #[test]
    fn get_version_with_id_is_a_request() {
        case(
            r#"{"id":9,"method":"client.get_version","params":[]}"#,
            Message::request(9, "client.get_version", json!([])),
        );
    }

    #[test]
    fn submit_response_true() {
        case(
            r#"{"id":4,"result":true,"error":null}"#,
            Message::Response {
                id: Id::Number(4),
                result: Some(json!(true)),
                error: None,
            },
        );
    }

    #[test]
    fn error_array_is_parsed_and_stringified() {
        let msg = serde_json::from_str::<Message>(
            r#"{"id":4,"result":null,"error":[21,"Job not found",null]}"#,
        )
        .unwrap();
        match msg {
            Message::Response {
                error: Some(err), ..
            } => {
                assert_eq!(err.code, 21);
                assert_eq!(err.message, "Job not found");
            }
            other => panic!("expected response with error, got {other:?}"),
        }
    }

    #[test]
    fn error_object_is_tolerated() {
        let msg = serde_json::from_str::<Message>(
            r#"{"id":4,"result":null,"error":{"code":-1,"message":"low difficulty"}}"#,
        )
        .unwrap();
        match msg {
            Message::Response {
                error: Some(err), ..
            } => {
                assert_eq!(err.code, -1);
                assert_eq!(err.message, "low difficulty");
            }
            other => panic!("expected response with error, got {other:?}"),
        }
    }

    #[test]
    fn frame_filter_requires_a_braced_object() {
        assert!(looks_like_frame(r#"{"id":1}"#));
        assert!(!looks_like_frame(""));
        assert!(!looks_like_frame(r#"{"id":1}trailing"#));
        assert!(!looks_like_frame("HTTP/1.1 400 Bad Request"));
    }
}
