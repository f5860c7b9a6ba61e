//! Edit-branch reconstruction
//!
//! Rebuilds the parent/child tree of every chat and flags siblings that were
//! created long after their predecessor. Near-simultaneous siblings are
//! alternate completions of one turn; a sibling arriving after a long pause
//! is an edited and resubmitted turn that forks the conversation.
//!
//! Pure: no I/O, no caching, identical output for identical input.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::models::{validate_records, Message, RawMessage, MAIN_BRANCH};

/// Sibling gap (seconds) above which the later sibling starts an edit branch
pub const EDIT_GAP_SECS: f64 = 60.0;

/// A fork created by editing an earlier turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditBranch {
    pub branch_id: String,
    pub parent_message_id: String,
    /// `None` when the parent is not part of the input (deleted, out of order)
    pub parent_message: Option<Message>,
    /// Sibling immediately preceding the edit
    pub original_message: Message,
    pub time_gap_secs: f64,
    /// Edited message first, then every descendant (depth first)
    pub branch_messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatBranches {
    pub main_branch: Vec<Message>,
    pub edit_branches: BTreeMap<String, EditBranch>,
    /// Off-main messages no edit branch claims (alternate completions),
    /// keyed by their `branch_id`, oldest first
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub alternate_branches: BTreeMap<String, Vec<Message>>,
}

impl ChatBranches {
    /// Messages across the main line, edit branches and alternates
    pub fn message_count(&self) -> usize {
        self.main_branch.len()
            + self.edit_branches.values().map(|b| b.branch_messages.len()).sum::<usize>()
            + self.alternate_branches.values().map(Vec::len).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BranchAnalysis {
    pub chats: BTreeMap<String, ChatBranches>,
    /// Records dropped for missing fields or duplicate ids
    pub skipped: usize,
}

impl BranchAnalysis {
    pub fn edit_branch_count(&self) -> usize {
        self.chats.values().map(|c| c.edit_branches.len()).sum()
    }
}

/// Validate loosely-typed records, then analyze. Incomplete records are
/// skipped with a warning.
pub fn analyze_records(records: &[RawMessage]) -> BranchAnalysis {
    let messages = validate_records(records);
    let dropped = records.len() - messages.len();
    let mut analysis = analyze_branches(&messages);
    analysis.skipped += dropped;
    analysis
}

pub fn analyze_branches(messages: &[Message]) -> BranchAnalysis {
    analyze_branches_with_gap(messages, EDIT_GAP_SECS)
}

pub fn analyze_branches_with_gap(messages: &[Message], gap_secs: f64) -> BranchAnalysis {
    let mut by_chat: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, msg) in messages.iter().enumerate() {
        by_chat.entry(msg.chat_name.as_str()).or_default().push(idx);
    }

    let mut analysis = BranchAnalysis::default();
    for (chat_name, indices) in by_chat {
        let (chat, skipped) = analyze_chat(messages, &indices, gap_secs);
        analysis.skipped += skipped;
        analysis.chats.insert(chat_name.to_string(), chat);
    }

    analysis
}

fn analyze_chat(messages: &[Message], indices: &[usize], gap_secs: f64) -> (ChatBranches, usize) {
    let mut by_id: HashMap<&str, usize> = HashMap::new();
    let mut unique: Vec<usize> = Vec::with_capacity(indices.len());
    let mut skipped = 0;

    for &idx in indices {
        let msg = &messages[idx];
        if by_id.contains_key(msg.message_id.as_str()) {
            tracing::warn!(
                chat = %msg.chat_name,
                message_id = %msg.message_id,
                "Skipping duplicate message id"
            );
            skipped += 1;
            continue;
        }
        by_id.insert(msg.message_id.as_str(), idx);
        unique.push(idx);
    }

    // Parent -> children, children ordered by (timestamp, input position)
    let mut children: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for &idx in &unique {
        if let Some(parent) = messages[idx].parent_message_id.as_deref() {
            children.entry(parent).or_default().push(idx);
        }
    }
    for kids in children.values_mut() {
        kids.sort_by_key(|&i| (messages[i].timestamp, i));
    }

    let mut edit_branches = BTreeMap::new();
    let mut in_edit_branch: HashSet<usize> = HashSet::new();

    for (&parent_id, kids) in &children {
        if kids.len() < 2 {
            continue;
        }

        for pos in 1..kids.len() {
            let earlier = &messages[kids[pos - 1]];
            let later = &messages[kids[pos]];
            let gap = (later.timestamp - earlier.timestamp).num_milliseconds() as f64 / 1000.0;
            if gap <= gap_secs {
                continue;
            }

            let mut collected = Vec::new();
            collect_descendants(messages, &children, kids[pos], &mut collected);
            in_edit_branch.extend(collected.iter().copied());

            let branch_id = format!("{}.{}", parent_id, pos);
            let branch = EditBranch {
                branch_id: branch_id.clone(),
                parent_message_id: parent_id.to_string(),
                parent_message: by_id.get(parent_id).map(|&i| messages[i].clone()),
                original_message: earlier.clone(),
                time_gap_secs: gap,
                branch_messages: collected.iter().map(|&i| messages[i].clone()).collect(),
            };
            if branch.parent_message.is_none() {
                tracing::debug!(chat = %later.chat_name, parent_id, "Edit branch parent not found");
            }
            edit_branches.insert(branch_id, branch);
        }
    }

    let mut rest: Vec<usize> = unique.iter().copied().filter(|i| !in_edit_branch.contains(i)).collect();
    rest.sort_by_key(|&i| (messages[i].timestamp, i));

    let mut main_branch = Vec::new();
    let mut alternate_branches: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for i in rest {
        let msg = &messages[i];
        if msg.branch_id == MAIN_BRANCH {
            main_branch.push(msg.clone());
        } else {
            alternate_branches.entry(msg.branch_id.clone()).or_default().push(msg.clone());
        }
    }

    let chat = ChatBranches { main_branch, edit_branches, alternate_branches };
    (chat, skipped)
}

/// Depth-first closure over descendants of `root`, in child order.
/// `out` is the accumulator; cycles in malformed input are cut.
fn collect_descendants(
    messages: &[Message],
    children: &BTreeMap<&str, Vec<usize>>,
    root: usize,
    out: &mut Vec<usize>,
) {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut stack = vec![root];

    while let Some(idx) = stack.pop() {
        if !visited.insert(idx) {
            continue;
        }
        out.push(idx);
        if let Some(kids) = children.get(messages[idx].message_id.as_str()) {
            stack.extend(kids.iter().rev().copied());
        }
    }
}
