//! Import pipeline for chat exports.
//!
//! Flattens ChatGPT (`mapping` tree) and Claude (`chat_messages` list)
//! exports into [`Message`] records. Claude messages get branch ids from a
//! breadth-first walk of the reply tree; ChatGPT nodes keep their parent
//! links and are ordered by timestamp.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{parse_timestamp, ChatType, Message, Sender, MAIN_BRANCH};

/// Detect the export format from the first conversation in the file
pub fn detect_chat_type(data: &serde_json::Value) -> Result<ChatType> {
    let first = data
        .as_array()
        .ok_or_else(|| Error::Import("Export must be a JSON array of conversations".to_string()))?
        .first()
        .and_then(|item| item.as_object())
        .ok_or_else(|| Error::Import("Export contains no conversations".to_string()))?;

    if first.contains_key("mapping") {
        Ok(ChatType::ChatGpt)
    } else if first.contains_key("chat_messages") {
        Ok(ChatType::Claude)
    } else {
        Err(Error::Import("Unknown chat format".to_string()))
    }
}

/// Parse an export string into its partition and flattened messages
pub fn parse_export(json_content: &str) -> Result<(ChatType, Vec<Message>)> {
    let data: serde_json::Value = serde_json::from_str(json_content)
        .map_err(|e| Error::Import(format!("Failed to parse export JSON: {}", e)))?;
    let chat_type = detect_chat_type(&data)?;

    let messages = match chat_type {
        ChatType::ChatGpt => {
            let conversations: Vec<ChatGPTConversation> = serde_json::from_value(data)
                .map_err(|e| Error::Import(format!("Failed to parse ChatGPT JSON: {}", e)))?;
            flatten_chatgpt(&conversations)
        }
        ChatType::Claude => {
            let conversations: Vec<ClaudeConversation> = serde_json::from_value(data)
                .map_err(|e| Error::Import(format!("Failed to parse conversations JSON: {}", e)))?;
            flatten_claude(&conversations)
        }
    };

    tracing::info!(%chat_type, messages = messages.len(), "Parsed chat export");
    Ok((chat_type, messages))
}

pub fn parse_export_file(path: &Path) -> Result<(ChatType, Vec<Message>)> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_export(&content)
}

// =============================================================================
// Claude
// =============================================================================

/// Claude conversation export format
#[derive(Debug, Deserialize)]
pub struct ClaudeConversation {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub chat_messages: Vec<ClaudeMessage>,
}

/// Claude message format
#[derive(Debug, Deserialize)]
pub struct ClaudeMessage {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, alias = "parent_message_uuid")]
    pub parent: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub content: Vec<ClaudeContentBlock>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClaudeContentBlock {
    #[serde(default)]
    pub text: Option<String>,
}

impl ClaudeMessage {
    /// Newer exports leave `text` empty and carry content blocks instead
    fn body(&self) -> String {
        if !self.text.trim().is_empty() {
            return self.text.clone();
        }
        self.content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn flatten_claude(conversations: &[ClaudeConversation]) -> Vec<Message> {
    let mut messages = Vec::new();

    for conv in conversations {
        let chat_name = conv
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("Unnamed Chat");

        // Index usable messages; anything without an id or timestamp is dropped
        let mut by_id: HashMap<&str, (&ClaudeMessage, DateTime<Utc>, Sender)> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for msg in &conv.chat_messages {
            if msg.uuid.is_empty() || by_id.contains_key(msg.uuid.as_str()) {
                continue;
            }
            let Some(ts) = msg.created_at.as_deref().and_then(parse_timestamp) else {
                tracing::warn!(chat = chat_name, message_id = %msg.uuid, "Skipping Claude message without timestamp");
                continue;
            };
            let Some(sender) = Sender::parse(&msg.sender) else {
                tracing::warn!(chat = chat_name, message_id = %msg.uuid, sender = %msg.sender, "Skipping Claude message with unknown sender");
                continue;
            };
            by_id.insert(msg.uuid.as_str(), (msg, ts, sender));
            order.push(msg.uuid.as_str());
        }

        // Children oldest first (stable on export order); a parent outside the
        // chat makes a root
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut roots: Vec<&str> = Vec::new();
        for &id in &order {
            let (msg, _, _) = by_id[id];
            match msg.parent.as_deref().filter(|p| by_id.contains_key(p)) {
                Some(parent) => children.entry(parent).or_default().push(id),
                None => roots.push(id),
            }
        }
        for kids in children.values_mut() {
            kids.sort_by_key(|id| by_id[id].1);
        }

        let mut visited: HashSet<&str> = HashSet::new();
        for root in roots {
            let mut queue: VecDeque<(&str, String)> = VecDeque::new();
            queue.push_back((root, MAIN_BRANCH.to_string()));

            while let Some((id, branch)) = queue.pop_front() {
                if !visited.insert(id) {
                    continue;
                }
                let (msg, ts, sender) = by_id[id];
                messages.push(
                    Message::new(chat_name, id, msg.parent.as_deref(), msg.body(), sender, ts)
                        .with_branch(branch.clone()),
                );

                // First child continues the branch, later siblings fork off it
                let kids = children.get(id).map(Vec::as_slice).unwrap_or(&[]);
                for (idx, child) in kids.iter().enumerate() {
                    let child_branch = if idx == 0 { branch.clone() } else { format!("{}.{}", branch, idx) };
                    queue.push_back((*child, child_branch));
                }
            }
        }

        let unreachable = order.len() - order.iter().filter(|id| visited.contains(*id)).count();
        if unreachable > 0 {
            tracing::warn!(chat = chat_name, unreachable, "Claude messages not reachable from any root were dropped");
        }
    }

    messages
}

// =============================================================================
// ChatGPT
// =============================================================================

/// ChatGPT conversation export format
#[derive(Debug, Deserialize)]
pub struct ChatGPTConversation {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub mapping: HashMap<String, ChatGPTNode>,
}

/// ChatGPT tree node in mapping
#[derive(Debug, Deserialize)]
pub struct ChatGPTNode {
    pub message: Option<ChatGPTMessage>,
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

/// ChatGPT message format
#[derive(Debug, Deserialize)]
pub struct ChatGPTMessage {
    pub id: String,
    pub author: ChatGPTAuthor,
    pub create_time: Option<f64>,
    pub content: ChatGPTContent,
}

#[derive(Debug, Deserialize)]
pub struct ChatGPTAuthor {
    pub role: String,
}

/// ChatGPT content (various types)
#[derive(Debug, Deserialize)]
pub struct ChatGPTContent {
    pub content_type: Option<String>,
    pub parts: Option<Vec<serde_json::Value>>,
    // Code content
    pub language: Option<String>,
    pub text: Option<String>,
    // Quote content
    pub url: Option<String>,
    // Reasoning recap
    pub content: Option<String>,
}

fn flatten_chatgpt(conversations: &[ChatGPTConversation]) -> Vec<Message> {
    let mut messages = Vec::new();

    for conv in conversations {
        let chat_name = conv
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("Untitled Chat");

        // Sorted node ids so ties on timestamp come out the same every run
        let mut node_ids: Vec<&String> = conv.mapping.keys().collect();
        node_ids.sort();

        for node_id in node_ids {
            let node = &conv.mapping[node_id];
            let Some(msg) = node.message.as_ref() else {
                continue;
            };

            // Skip system and tool messages
            let sender = match msg.author.role.as_str() {
                "user" => Sender::Human,
                "assistant" => Sender::Assistant,
                _ => continue,
            };

            let Some(ts) = msg.create_time.and_then(epoch_to_utc) else {
                continue;
            };
            let Some(text) = extract_chatgpt_content(&msg.content) else {
                continue;
            };

            // Parent links point at mapping node ids; resolve to message ids
            let parent = node
                .parent
                .as_ref()
                .and_then(|p| conv.mapping.get(p))
                .and_then(|p| p.message.as_ref())
                .map(|m| m.id.as_str());

            messages.push(Message::new(chat_name, msg.id.as_str(), parent, text, sender, ts));
        }

        if conv.id.is_none() {
            tracing::debug!(chat = chat_name, "ChatGPT conversation without id");
        }
    }

    messages.sort_by_key(|m| m.timestamp);
    messages
}

fn epoch_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}

/// Extract text content from ChatGPT content object
fn extract_chatgpt_content(content: &ChatGPTContent) -> Option<String> {
    let content_type = content.content_type.as_deref().unwrap_or("text");

    match content_type {
        "text" => content
            .parts
            .as_ref()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.trim().is_empty()),
        "code" => content.text.as_ref().map(|text| {
            let lang = content.language.as_deref().unwrap_or("");
            format!("```{}\n{}\n```", lang, text)
        }),
        "multimodal_text" => content
            .parts
            .as_ref()
            .map(|parts| {
                let mut texts = Vec::new();
                let mut image_count = 0;

                for part in parts {
                    if let Some(text) = part.as_str() {
                        if !text.trim().is_empty() {
                            texts.push(text.to_string());
                        }
                    } else if part.is_object() {
                        image_count += 1;
                    }
                }

                if image_count > 0 {
                    texts.push(format!("[{} image(s) attached]", image_count));
                }

                texts.join("\n")
            })
            .filter(|s| !s.trim().is_empty()),
        "tether_quote" => content.text.as_ref().map(|text| {
            let url = content.url.as_deref().unwrap_or("source");
            format!("> {}\n> {}", text, url)
        }),
        "execution_output" => content
            .text
            .as_ref()
            .map(|text| format!("Output:\n```\n{}\n```", text)),
        "reasoning_recap" => content.content.clone(),
        _ => None, // thoughts, system_error, etc.
    }
}
