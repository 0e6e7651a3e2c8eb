//! SignalR JSON hub protocol codec
//!
//! Text frames are JSON objects terminated by the record separator `0x1E`.
//! One WebSocket message may carry several frames.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u8 = 1;
const TYPE_STREAM_ITEM: u8 = 2;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// A decoded hub frame
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Frame types a client never acts on (stream items, cancel)
    Ignored(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    invocation_id: Option<&'a str>,
    target: &'a str,
    arguments: &'a [Value],
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// `{"protocol":"json","version":1}` plus separator
pub fn handshake_request() -> String {
    format!("{}{}", r#"{"protocol":"json","version":1}"#, RECORD_SEPARATOR)
}

/// Split a text message into frame payloads, dropping empty tails
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|f| !f.trim().is_empty())
}

/// Check the handshake answer; returns any frames that followed it
pub fn parse_handshake_response(text: &str) -> Result<Vec<&str>> {
    let mut frames = split_frames(text);
    let first = frames
        .next()
        .ok_or_else(|| Error::Hub("empty handshake response".to_string()))?;
    let response: HandshakeResponse = serde_json::from_str(first)?;
    if let Some(error) = response.error {
        return Err(Error::Hub(format!("handshake rejected: {}", error)));
    }
    Ok(frames.collect())
}

pub fn decode_frame(payload: &str) -> Result<HubFrame> {
    let wire: WireFrame = serde_json::from_str(payload)?;
    let frame = match wire.kind {
        TYPE_INVOCATION => HubFrame::Invocation {
            invocation_id: wire.invocation_id,
            target: wire
                .target
                .ok_or_else(|| Error::Hub("invocation without target".to_string()))?,
            arguments: wire.arguments,
        },
        TYPE_COMPLETION => HubFrame::Completion {
            invocation_id: wire.invocation_id.unwrap_or_default(),
            result: wire.result,
            error: wire.error,
        },
        TYPE_PING => HubFrame::Ping,
        TYPE_CLOSE => HubFrame::Close {
            error: wire.error,
            allow_reconnect: wire.allow_reconnect,
        },
        TYPE_STREAM_ITEM | 4 | 5 => HubFrame::Ignored(wire.kind),
        other => return Err(Error::Hub(format!("unknown frame type {}", other))),
    };
    Ok(frame)
}

/// Encode an invocation, separator included
pub fn encode_invocation(
    target: &str,
    arguments: &[Value],
    invocation_id: Option<&str>,
) -> Result<String> {
    let frame = OutgoingInvocation {
        kind: TYPE_INVOCATION,
        invocation_id,
        target,
        arguments,
    };
    Ok(format!("{}{}", serde_json::to_string(&frame)?, RECORD_SEPARATOR))
}

pub fn encode_ping() -> String {
    format!(r#"{{"type":{}}}{}"#, TYPE_PING, RECORD_SEPARATOR)
}
