use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use tangent::ai_client::GenerativeProvider;
use tangent::embeddings::EmbeddingProvider;
use tangent::pipeline::PipelineConfig;
use tangent::retry::RetryPolicy;
use tangent::{
    analyze_branches, ArtifactStore, ChatType, InMemoryMessageStore, Message, MessageStore,
    Pipeline, Result, Sender, TaskQueue, TaskSource, TaskState,
};

/// Two fixed directions keyed on vocabulary
struct VocabularyEmbedder;

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(batch
            .iter()
            .map(|t| {
                if t.contains("tokio") || t.contains("async") {
                    vec![1.0, 0.05, 0.0]
                } else {
                    vec![0.05, 1.0, 0.0]
                }
            })
            .collect())
    }
}

struct FixedLabel;

#[async_trait]
impl GenerativeProvider for FixedLabel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        Ok(if prompt.contains("tokio") { "Async Runtime" } else { "Gardening" }.to_string())
    }
}

fn pipeline(dir: &TempDir) -> Arc<Pipeline> {
    let config = PipelineConfig { min_samples: Some(2), ..PipelineConfig::default() };
    Arc::new(Pipeline::new(
        Arc::new(VocabularyEmbedder),
        Arc::new(FixedLabel),
        RetryPolicy::new(3, Duration::from_millis(1)),
        ArtifactStore::new(dir.path()),
        config,
    ))
}

fn msg(chat: &str, id: &str, parent: Option<&str>, text: &str, secs: i64) -> Message {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let sender = if parent.is_none() { Sender::Human } else { Sender::Assistant };
    Message::new(chat, id, parent, text, sender, base + chrono::Duration::seconds(secs))
}

const POLL: Duration = Duration::from_millis(5);

#[tokio::test]
async fn snapshot_task_produces_consistent_artifacts() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryMessageStore::new());
    let messages = [
        msg("runtime", "1", None, "how does tokio schedule tasks", 0),
        msg("runtime", "2", Some("1"), "tokio uses work stealing", 5),
        msg("runtime", "3", Some("2"), "async fn desugaring", 10),
        msg("garden", "1", None, "when to plant tomatoes", 0),
        msg("garden", "2", Some("1"), "after the last frost", 4),
        msg("garden", "3", Some("2"), "tomatoes need full sun", 8),
    ];
    for m in messages {
        store.append(ChatType::ChatGpt, m).unwrap();
    }

    let (queue, _worker) = TaskQueue::start(store.clone(), pipeline(&dir), 16);
    let task_id = queue.enqueue_task(ChatType::ChatGpt, None).unwrap();
    let status = queue.wait_for(&task_id, POLL).await.unwrap();
    assert_eq!(status.status, TaskState::Completed, "error: {:?}", status.error);

    let artifacts = ArtifactStore::new(dir.path()).read_artifacts(ChatType::ChatGpt);
    assert_eq!(artifacts.points.len(), 6);
    assert_eq!(artifacts.clusters.len(), 6);
    assert_eq!(artifacts.titles.len(), 6);
    assert_eq!(artifacts.topics.len(), 2);
    assert_eq!(artifacts.topics[&artifacts.clusters[0]], "Async Runtime");
    assert_eq!(artifacts.topics[&artifacts.clusters[3]], "Gardening");

    // Raw snapshot rebuilds the store
    let restored = InMemoryMessageStore::new();
    let loaded = restored
        .rehydrate(ChatType::ChatGpt, &ArtifactStore::new(dir.path()).snapshot_path(ChatType::ChatGpt))
        .unwrap();
    assert_eq!(loaded, 6);
    assert_eq!(restored.snapshot(ChatType::ChatGpt), store.snapshot(ChatType::ChatGpt));
}

#[tokio::test]
async fn uploaded_export_is_processed_without_touching_store() {
    let dir = TempDir::new().unwrap();
    let export = serde_json::json!([{
        "uuid": "c-1",
        "name": "runtime",
        "chat_messages": [
            {"uuid": "a", "sender": "human", "text": "tokio select", "created_at": "2024-06-01T12:00:00Z"},
            {"uuid": "b", "parent": "a", "sender": "assistant", "text": "tokio select polls futures", "created_at": "2024-06-01T12:00:03Z"},
            {"uuid": "c", "parent": "a", "sender": "assistant", "text": "async cancellation", "created_at": "2024-06-01T12:03:00Z"}
        ]
    }]);
    let path = dir.path().join("conversations.json");
    std::fs::write(&path, export.to_string()).unwrap();

    let store = Arc::new(InMemoryMessageStore::new());
    let (queue, _worker) = TaskQueue::start(store.clone(), pipeline(&dir), 16);
    let task_id = queue
        .enqueue_task(ChatType::Claude, Some(TaskSource::File(path.clone())))
        .unwrap();
    let status = queue.wait_for(&task_id, POLL).await.unwrap();
    assert_eq!(status.status, TaskState::Completed, "error: {:?}", status.error);

    assert!(store.is_empty(ChatType::Claude));
    let artifacts = ArtifactStore::new(dir.path()).read_artifacts(ChatType::Claude);
    assert_eq!(artifacts.points.len(), 3);

    // Same export under the wrong partition fails the task
    let wrong = queue
        .enqueue_task(ChatType::ChatGpt, Some(TaskSource::File(path)))
        .unwrap();
    let status = queue.wait_for(&wrong, POLL).await.unwrap();
    assert_eq!(status.status, TaskState::Failed);
}

#[tokio::test]
async fn upload_does_not_replace_persisted_store_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryMessageStore::new());
    store.append(ChatType::Claude, msg("live", "L1", None, "tokio timers", 0)).unwrap();
    store.append(ChatType::Claude, msg("live", "L2", Some("L1"), "tokio sleep is async", 6)).unwrap();

    let (queue, _worker) = TaskQueue::start(store.clone(), pipeline(&dir), 16);
    let snapshot_task = queue.enqueue_task(ChatType::Claude, None).unwrap();
    assert_eq!(queue.wait_for(&snapshot_task, POLL).await.unwrap().status, TaskState::Completed);

    let export = serde_json::json!([{
        "uuid": "c-9",
        "name": "garden",
        "chat_messages": [
            {"uuid": "u1", "sender": "human", "text": "pruning roses", "created_at": "2024-06-02T08:00:00Z"},
            {"uuid": "u2", "parent": "u1", "sender": "assistant", "text": "prune in late winter", "created_at": "2024-06-02T08:00:04Z"}
        ]
    }]);
    let path = dir.path().join("upload.json");
    std::fs::write(&path, export.to_string()).unwrap();
    let upload_task = queue
        .enqueue_task(ChatType::Claude, Some(TaskSource::File(path)))
        .unwrap();
    assert_eq!(queue.wait_for(&upload_task, POLL).await.unwrap().status, TaskState::Completed);

    // Latest map shows the upload, but a restart still sees the live messages
    let titles = ArtifactStore::new(dir.path()).read_artifacts(ChatType::Claude).titles;
    assert_eq!(titles, vec!["garden", "garden"]);

    let restarted = InMemoryMessageStore::new();
    restarted
        .rehydrate(ChatType::Claude, &ArtifactStore::new(dir.path()).snapshot_path(ChatType::Claude))
        .unwrap();
    let ids: Vec<String> = restarted
        .snapshot(ChatType::Claude)
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(ids, vec!["L1", "L2"]);
}

#[test]
fn edit_after_long_pause_yields_single_edit_branch() {
    let messages = vec![
        msg("chat", "1", None, "first", 0),
        msg("chat", "2", Some("1"), "reply", 5),
        msg("chat", "3", Some("1"), "edited reply", 90),
    ];
    let analysis = analyze_branches(&messages);
    let chat = &analysis.chats["chat"];

    let main: Vec<&str> = chat.main_branch.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(main, vec!["1", "2"]);
    assert_eq!(chat.edit_branches.len(), 1);

    let branch = chat.edit_branches.values().next().unwrap();
    assert_eq!(branch.branch_messages[0].message_id, "3");
    assert_eq!(branch.time_gap_secs, 85.0);
    assert_eq!(analysis, analyze_branches(&messages));
}
