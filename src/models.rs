//! Message records and conversation partitions

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Branch id of the main line of a conversation
pub const MAIN_BRANCH: &str = "0";

/// Conversation-type partition. Each partition has its own store slice and
/// its own artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[serde(rename = "chatgpt")]
    ChatGpt,
    Claude,
}

impl ChatType {
    pub const ALL: [ChatType; 2] = [ChatType::ChatGpt, ChatType::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::ChatGpt => "chatgpt",
            ChatType::Claude => "claude",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chatgpt" | "openai" => Ok(ChatType::ChatGpt),
            "claude" | "anthropic" => Ok(ChatType::Claude),
            other => Err(Error::Config(format!(
                "Unknown chat type '{}'. Valid values: chatgpt, claude",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Human,
    Assistant,
}

impl Sender {
    /// Map the sender/role strings used by the chat exports
    pub fn parse(s: &str) -> Option<Sender> {
        match s.trim().to_lowercase().as_str() {
            "human" | "user" => Some(Sender::Human),
            "assistant" | "ai" | "model" | "bot" => Some(Sender::Assistant),
            _ => None,
        }
    }
}

/// A validated conversation message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub chat_name: String,
    #[serde(default = "default_branch_id")]
    pub branch_id: String,
    pub message_id: String,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

fn default_branch_id() -> String {
    MAIN_BRANCH.to_string()
}

impl Message {
    /// Main-line message; use [`Message::with_branch`] for anything else
    pub fn new(
        chat_name: impl Into<String>,
        message_id: impl Into<String>,
        parent_message_id: Option<&str>,
        text: impl Into<String>,
        sender: Sender,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            chat_name: chat_name.into(),
            branch_id: default_branch_id(),
            message_id: message_id.into(),
            parent_message_id: parent_message_id.map(str::to_string),
            text: text.into(),
            sender,
            timestamp,
        }
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = branch_id.into();
        self
    }

    /// Calendar month of the message, `YYYY-MM` (UTC)
    pub fn month_year(&self) -> String {
        self.timestamp.format("%Y-%m").to_string()
    }
}

/// Timestamps arrive either as ISO strings or as epoch seconds (ChatGPT)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(f64),
    Text(String),
}

impl RawTimestamp {
    pub fn parse(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Epoch(secs) => {
                if !secs.is_finite() {
                    return None;
                }
                let millis = (secs * 1000.0).round() as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            RawTimestamp::Text(s) => parse_timestamp(s),
        }
    }
}

/// Parse an ISO-8601 timestamp, with or without timezone
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(ts, fmt).ok())
        .map(|dt| dt.and_utc())
}

/// Loosely-typed message record as it arrives from uploads or older
/// snapshots. Must pass [`RawMessage::validate`] before analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub chat_name: Option<String>,
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
}

impl RawMessage {
    /// Check the required fields. Returns the name of the first missing or
    /// unusable field on failure.
    pub fn validate(&self) -> Result<Message, &'static str> {
        let chat_name = non_empty(&self.chat_name).ok_or("chat_name")?;
        let message_id = non_empty(&self.message_id).ok_or("message_id")?;
        let text = self.text.clone().ok_or("text")?;
        let sender = self
            .sender
            .as_deref()
            .and_then(Sender::parse)
            .ok_or("sender")?;
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(RawTimestamp::parse)
            .ok_or("timestamp")?;

        let branch_id = non_empty(&self.branch_id).unwrap_or_else(default_branch_id);
        let parent_message_id = non_empty(&self.parent_message_id);

        Ok(Message {
            chat_name,
            branch_id,
            message_id,
            parent_message_id,
            text,
            sender,
            timestamp,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl From<&Message> for RawMessage {
    fn from(msg: &Message) -> Self {
        RawMessage {
            chat_name: Some(msg.chat_name.clone()),
            branch_id: Some(msg.branch_id.clone()),
            message_id: Some(msg.message_id.clone()),
            parent_message_id: msg.parent_message_id.clone(),
            text: Some(msg.text.clone()),
            sender: Some(match msg.sender {
                Sender::Human => "human".to_string(),
                Sender::Assistant => "assistant".to_string(),
            }),
            timestamp: Some(RawTimestamp::Text(msg.timestamp.to_rfc3339())),
        }
    }
}

/// Validate a batch of raw records, skipping incomplete ones with a warning
pub fn validate_records(records: &[RawMessage]) -> Vec<Message> {
    records
        .iter()
        .enumerate()
        .filter_map(|(idx, raw)| match raw.validate() {
            Ok(msg) => Some(msg),
            Err(field) => {
                tracing::warn!(
                    index = idx,
                    message_id = raw.message_id.as_deref().unwrap_or(""),
                    field,
                    "Skipping message with missing or invalid field"
                );
                None
            }
        })
        .collect()
}
