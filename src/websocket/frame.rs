//! Wire frame shapes and inbound frame classification
//!
//! Outbound frames are typed builders serialized with serde. Inbound text
//! is parsed into a loose envelope first and then classified into control
//! frames (ping/pong/acks/errors) and data frames; payload bodies stay
//! opaque `serde_json::Value`s keyed by topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::websocket::topic::Topic;

// ============================================================================
// Outbound frames
// ============================================================================

/// Auth frame parameters: key, signature and the signed timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub orderly_key: String,
    pub sign: String,
    pub timestamp: String,
}

/// Parameters of an orderbook snapshot request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestParams {
    #[serde(rename = "type")]
    pub request_type: String,
    pub symbol: String,
}

/// A frame sent to the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Subscribe {
        id: String,
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Unsubscribe {
        id: String,
        topic: String,
    },
    Auth {
        id: String,
        params: AuthParams,
    },
    Request {
        id: String,
        params: RequestParams,
    },
    Ping,
    Pong,
}

impl OutboundFrame {
    /// Build a subscribe frame for a topic, carrying its params if any
    pub fn subscribe(client_id: &str, topic: &Topic) -> Self {
        OutboundFrame::Subscribe {
            id: client_id.to_string(),
            topic: topic.name(),
            params: topic.params().cloned(),
        }
    }

    /// Build an unsubscribe frame for a topic identifier
    pub fn unsubscribe(client_id: &str, topic: &str) -> Self {
        OutboundFrame::Unsubscribe {
            id: client_id.to_string(),
            topic: topic.to_string(),
        }
    }

    /// Build an auth frame from already-signed parameters
    pub fn auth(client_id: &str, params: AuthParams) -> Self {
        OutboundFrame::Auth {
            id: client_id.to_string(),
            params,
        }
    }

    /// Build an orderbook snapshot request for a symbol
    pub fn request_orderbook(client_id: &str, symbol: &str) -> Self {
        OutboundFrame::Request {
            id: client_id.to_string(),
            params: RequestParams {
                request_type: "orderbook".to_string(),
                symbol: symbol.to_string(),
            },
        }
    }

    /// Whether this is a heartbeat frame (not worth logging per-send)
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, OutboundFrame::Ping | OutboundFrame::Pong)
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Loose envelope covering every inbound frame shape
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub ts: Option<u64>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A classified inbound frame
#[derive(Debug, Clone)]
pub enum Frame {
    /// Server liveness probe; must be answered with a pong
    Ping,
    /// Reply to a client ping
    Pong,
    /// Result of the auth handshake
    AuthAck {
        success: bool,
        message: Option<String>,
    },
    /// Result of a subscribe request
    SubscribeAck {
        topic: Option<String>,
        success: bool,
        message: Option<String>,
    },
    /// Result of an unsubscribe request
    UnsubscribeAck {
        topic: Option<String>,
        success: bool,
    },
    /// Server-reported error
    ServerError {
        code: Option<i64>,
        message: String,
    },
    /// Reply to an orderbook snapshot request; routed like data for
    /// `<symbol>@orderbook`
    OrderbookSnapshot {
        symbol: String,
        ts: Option<u64>,
        data: Value,
    },
    /// A data frame carrying a topic and an opaque payload
    Data {
        topic: String,
        ts: Option<u64>,
        data: Value,
    },
}

/// Parse and classify one inbound text frame.
///
/// Returns [`Error::MalformedFrame`] for text that is not valid JSON or
/// that matches no known shape; callers log and drop those.
pub fn classify(text: &str) -> Result<Frame> {
    let envelope: InboundEnvelope = serde_json::from_str(text)
        .map_err(|e| Error::MalformedFrame(format!("{e}: {}", truncate(text))))?;

    if let Some(event) = envelope.event.as_deref() {
        return match event {
            "ping" => Ok(Frame::Ping),
            "pong" => Ok(Frame::Pong),
            "auth" => Ok(Frame::AuthAck {
                success: envelope.success.unwrap_or(false),
                message: envelope.message,
            }),
            "subscribe" => Ok(Frame::SubscribeAck {
                topic: envelope.topic,
                success: envelope.success.unwrap_or(false),
                message: envelope.message,
            }),
            "unsubscribe" => Ok(Frame::UnsubscribeAck {
                topic: envelope.topic,
                success: envelope.success.unwrap_or(false),
            }),
            "error" => Ok(Frame::ServerError {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            }),
            "request" => classify_request_reply(envelope),
            other => Err(Error::MalformedFrame(format!("unknown event {other:?}"))),
        };
    }

    match (envelope.topic, envelope.data) {
        (Some(topic), Some(data)) => Ok(Frame::Data {
            topic,
            ts: envelope.ts,
            data,
        }),
        _ => Err(Error::MalformedFrame(format!(
            "frame has neither event nor topic+data: {}",
            truncate(text)
        ))),
    }
}

/// An orderbook request reply carries the symbol inside its data body
fn classify_request_reply(envelope: InboundEnvelope) -> Result<Frame> {
    if !envelope.success.unwrap_or(false) {
        return Ok(Frame::ServerError {
            code: envelope.code,
            message: envelope
                .message
                .unwrap_or_else(|| "request failed".to_string()),
        });
    }
    let data = envelope
        .data
        .ok_or_else(|| Error::MalformedFrame("request reply without data".to_string()))?;
    let symbol = data
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedFrame("request reply without symbol".to_string()))?
        .to_string();
    Ok(Frame::OrderbookSnapshot {
        symbol,
        ts: envelope.ts,
        data,
    })
}

fn truncate(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

// ============================================================================
// Delivered messages
// ============================================================================

/// One message delivered from a topic inbox
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message arrived on
    pub topic: String,
    /// Exchange timestamp in milliseconds, when the frame carried one
    pub ts: Option<u64>,
    /// Opaque payload; semantic decoding is the caller's responsibility
    pub data: Value,
    /// Local arrival time
    pub received_at: Instant,
}

impl Message {
    /// Decode the payload into a concrete type
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ============ Outbound serialization ============

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = OutboundFrame::subscribe("WS_PUBLIC", &Topic::bbos());
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"event": "subscribe", "id": "WS_PUBLIC", "topic": "bbos"})
        );
    }

    #[test]
    fn test_subscribe_frame_with_params() {
        let topic = Topic::custom("indexprice", Some(json!({"symbol": "PERP_ETH_USDC"})));
        let frame = OutboundFrame::subscribe("WS_PUBLIC", &topic);
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["params"], json!({"symbol": "PERP_ETH_USDC"}));
    }

    #[test]
    fn test_unsubscribe_frame_shape() {
        let frame = OutboundFrame::unsubscribe("WS_PUBLIC", "bbos");
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"event": "unsubscribe", "id": "WS_PUBLIC", "topic": "bbos"})
        );
    }

    #[test]
    fn test_auth_frame_shape() {
        let frame = OutboundFrame::auth(
            "WS_PRIVATE",
            AuthParams {
                orderly_key: "ed25519:abc".to_string(),
                sign: "c2ln".to_string(),
                timestamp: "1700000000000".to_string(),
            },
        );
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "auth");
        assert_eq!(json["params"]["orderly_key"], "ed25519:abc");
        assert_eq!(json["params"]["timestamp"], "1700000000000");
    }

    #[test]
    fn test_request_frame_shape() {
        let frame = OutboundFrame::request_orderbook("WS_PUBLIC", "PERP_ETH_USDC");
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "request");
        assert_eq!(json["params"]["type"], "orderbook");
        assert_eq!(json["params"]["symbol"], "PERP_ETH_USDC");
    }

    #[test]
    fn test_heartbeat_frames() {
        assert_eq!(
            serde_json::to_value(OutboundFrame::Pong).unwrap(),
            json!({"event": "pong"})
        );
        assert_eq!(
            serde_json::to_value(OutboundFrame::Ping).unwrap(),
            json!({"event": "ping"})
        );
        assert!(OutboundFrame::Ping.is_heartbeat());
        assert!(OutboundFrame::Pong.is_heartbeat());
        assert!(!OutboundFrame::unsubscribe("x", "y").is_heartbeat());
    }

    // ============ Inbound classification ============

    #[test]
    fn test_classify_ping() {
        assert!(matches!(
            classify(r#"{"event":"ping","ts":1700000000000}"#).unwrap(),
            Frame::Ping
        ));
    }

    #[test]
    fn test_classify_pong() {
        assert!(matches!(classify(r#"{"event":"pong"}"#).unwrap(), Frame::Pong));
    }

    #[test]
    fn test_classify_auth_ack_success() {
        let frame = classify(r#"{"id":"WS_PRIVATE","event":"auth","success":true,"ts":1}"#).unwrap();
        match frame {
            Frame::AuthAck { success, message } => {
                assert!(success);
                assert!(message.is_none());
            }
            other => panic!("expected AuthAck, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_auth_ack_failure() {
        let frame =
            classify(r#"{"event":"auth","success":false,"message":"invalid key"}"#).unwrap();
        match frame {
            Frame::AuthAck { success, message } => {
                assert!(!success);
                assert_eq!(message.as_deref(), Some("invalid key"));
            }
            other => panic!("expected AuthAck, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_subscribe_ack() {
        let frame =
            classify(r#"{"event":"subscribe","success":true,"topic":"bbos","ts":1}"#).unwrap();
        match frame {
            Frame::SubscribeAck { topic, success, .. } => {
                assert!(success);
                assert_eq!(topic.as_deref(), Some("bbos"));
            }
            other => panic!("expected SubscribeAck, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_server_error() {
        let frame = classify(r#"{"event":"error","code":429,"message":"too many"}"#).unwrap();
        match frame {
            Frame::ServerError { code, message } => {
                assert_eq!(code, Some(429));
                assert_eq!(message, "too many");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_data_frame() {
        let frame = classify(
            r#"{"topic":"PERP_ETH_USDC@trade","ts":1700000000000,"data":{"price":"3000"}}"#,
        )
        .unwrap();
        match frame {
            Frame::Data { topic, ts, data } => {
                assert_eq!(topic, "PERP_ETH_USDC@trade");
                assert_eq!(ts, Some(1_700_000_000_000));
                assert_eq!(data["price"], "3000");
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_orderbook_request_reply() {
        let frame = classify(
            r#"{"event":"request","success":true,"ts":5,"data":{"symbol":"PERP_ETH_USDC","asks":[]}}"#,
        )
        .unwrap();
        match frame {
            Frame::OrderbookSnapshot { symbol, ts, data } => {
                assert_eq!(symbol, "PERP_ETH_USDC");
                assert_eq!(ts, Some(5));
                assert!(data["asks"].is_array());
            }
            other => panic!("expected OrderbookSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_failed_request_reply() {
        let frame =
            classify(r#"{"event":"request","success":false,"message":"unknown symbol"}"#).unwrap();
        assert!(matches!(frame, Frame::ServerError { .. }));
    }

    #[test]
    fn test_classify_invalid_json() {
        let err = classify("not json at all").unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_classify_shapeless_frame() {
        let err = classify(r#"{"foo":"bar"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_classify_unknown_event() {
        let err = classify(r#"{"event":"mystery"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    // ============ Message ============

    #[test]
    fn test_message_parse_data() {
        #[derive(Deserialize)]
        struct Trade {
            price: String,
        }

        let msg = Message {
            topic: "PERP_ETH_USDC@trade".to_string(),
            ts: Some(1),
            data: json!({"price": "3000"}),
            received_at: Instant::now(),
        };
        let trade: Trade = msg.parse_data().unwrap();
        assert_eq!(trade.price, "3000");
    }

    #[test]
    fn test_message_parse_data_type_mismatch() {
        let msg = Message {
            topic: "bbos".to_string(),
            ts: None,
            data: json!("just a string"),
            received_at: Instant::now(),
        };
        let result: Result<std::collections::HashMap<String, String>> = msg.parse_data();
        assert!(matches!(result, Err(Error::Json(_))));
    }
}
