//! Chat message model and tolerant wire parsing
//!
//! The backend is loose about field names and id types, so raw messages are
//! decoded through `RawMessage` and only then turned into a `Message` relative
//! to the current user.

use crate::config::TEMP_ID_PREFIX;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Who authored a message, relative to the current user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    Other,
}

/// Delivery status shown next to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Sending,
    Sent,
    Seen,
}

/// An attachment descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub url: String,
}

/// A displayable chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
    /// Local creation time, used when the server gave no timestamp
    pub received_at: DateTime<Utc>,
    pub sender: Sender,
    pub status: Status,
    pub file: Option<FileAttachment>,
}

impl Message {
    /// Optimistic placeholder for a send in flight
    ///
    /// `seq` tells apart sends started within the same millisecond.
    pub fn placeholder(
        text: &str,
        file: Option<FileAttachment>,
        now: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            id: temp_id(now, seq),
            text: text.to_string(),
            sent_at: Some(now),
            received_at: now,
            sender: Sender::Me,
            status: Status::Sending,
            file,
        }
    }

    pub fn is_temporary(&self) -> bool {
        is_temp_id(&self.id)
    }

    pub fn is_mine(&self) -> bool {
        self.sender == Sender::Me
    }

    /// Ordering key: server time, else local time
    pub fn sort_key(&self) -> DateTime<Utc> {
        self.sent_at.unwrap_or(self.received_at)
    }

    /// `HH:MM` in the local timezone
    pub fn display_time(&self) -> String {
        self.sort_key().with_timezone(&Local).format("%H:%M").to_string()
    }
}

pub fn temp_id(now: DateTime<Utc>, seq: u64) -> String {
    format!("{}{}-{}", TEMP_ID_PREFIX, now.timestamp_millis(), seq)
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// A message as the server sends it
///
/// Decoded from the raw JSON object by key priority, so payloads that carry
/// several spellings of a field (or a nested `sender` profile next to
/// `senderId`) still decode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct RawMessage {
    pub id: String,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    pub sent_at: Option<String>,
    pub is_read: Option<bool>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
}

const ID_KEYS: &[&str] = &["id", "messageId", "Id"];
const SENDER_KEYS: &[&str] = &["senderId", "fromUserId", "sender"];
const RECEIVER_KEYS: &[&str] = &["receiverId", "toUserId", "receiver"];
const CONTENT_KEYS: &[&str] = &["content", "text", "message"];
const SENT_AT_KEYS: &[&str] = &["sentAt", "createdAt", "timestamp"];
const READ_KEYS: &[&str] = &["isRead", "isSeen"];

impl TryFrom<Map<String, Value>> for RawMessage {
    type Error = String;

    fn try_from(fields: Map<String, Value>) -> std::result::Result<Self, String> {
        let id = first(&fields, ID_KEYS, scalar_id).ok_or("message without a usable id")?;
        Ok(Self {
            id,
            sender_id: first(&fields, SENDER_KEYS, user_id),
            receiver_id: first(&fields, RECEIVER_KEYS, user_id),
            content: first(&fields, CONTENT_KEYS, string),
            sent_at: first(&fields, SENT_AT_KEYS, string),
            is_read: first(&fields, READ_KEYS, Value::as_bool),
            file_url: first(&fields, &["fileUrl"], string),
            file_name: first(&fields, &["fileName"], string),
            file_size: first(&fields, &["fileSize"], Value::as_u64),
            file_type: first(&fields, &["fileType"], string),
        })
    }
}

/// First key whose value `pick` accepts
fn first<T>(
    fields: &Map<String, Value>,
    keys: &[&str],
    pick: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    keys.iter().find_map(|key| fields.get(*key).and_then(&pick))
}

fn string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A user id, or a user object carrying one
fn user_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => ["id", "userId", "Id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(scalar_id)),
        other => scalar_id(other),
    }
}

impl RawMessage {
    /// Resolve against the current user
    pub fn into_message(self, my_user_id: &str, now: DateTime<Utc>) -> Message {
        let sender = match self.sender_id.as_deref() {
            Some(id) if id == my_user_id => Sender::Me,
            _ => Sender::Other,
        };
        let status = if self.is_read.unwrap_or(false) {
            Status::Seen
        } else {
            Status::Sent
        };
        let file = self.file_url.map(|url| FileAttachment {
            name: self.file_name.unwrap_or_else(|| {
                url.rsplit('/').next().unwrap_or_default().to_string()
            }),
            size: self.file_size.unwrap_or(0),
            mime_type: self
                .file_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            url,
        });

        Message {
            id: self.id,
            text: self.content.unwrap_or_default(),
            sent_at: self.sent_at.as_deref().and_then(parse_timestamp),
            received_at: now,
            sender,
            status,
            file,
        }
    }
}

/// Parse RFC 3339, or naive ISO-8601 as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Decode a batch; `None` if the payload is not an array
///
/// Elements that fail to decode are skipped.
pub fn parse_batch(value: &Value) -> Option<Vec<RawMessage>> {
    let items = value.as_array()?;
    let mut batch = Vec::with_capacity(items.len());
    for item in items {
        match RawMessage::deserialize(item) {
            Ok(raw) => batch.push(raw),
            Err(e) => warn!(error = %e, "skipping malformed message in batch"),
        }
    }
    Some(batch)
}

/// Same as `parse_batch` for a raw body; unparseable text gives `None`
pub fn parse_batch_str(body: &str) -> Option<Vec<RawMessage>> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => parse_batch(&value),
        Err(e) => {
            warn!(error = %e, "message batch is not valid JSON");
            None
        }
    }
}

/// Resolve a whole batch against the current user
pub fn resolve_batch(batch: Vec<RawMessage>, my_user_id: &str, now: DateTime<Utc>) -> Vec<Message> {
    batch
        .into_iter()
        .map(|raw| raw.into_message(my_user_id, now))
        .collect()
}
