//! Background task queue
//!
//! Many producers, one consumer. Tasks run strictly in enqueue order and at
//! most one pipeline execution is in flight. Each task runs inside its own
//! spawned future, so a failure or panic marks that task failed and the
//! worker moves on.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::import::parse_export_file;
use crate::models::{ChatType, Message};
use crate::pipeline::{MessageOrigin, PipelineOutcome, TaskProcessor};
use crate::store::MessageStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "path")]
pub enum TaskSource {
    /// Live in-memory messages of the partition, copied at task start
    Snapshot,
    /// Uploaded export file
    File(PathBuf),
}

impl TaskSource {
    pub fn origin(&self) -> MessageOrigin {
        match self {
            TaskSource::Snapshot => MessageOrigin::Store,
            TaskSource::File(_) => MessageOrigin::Upload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub partition: ChatType,
    pub source: TaskSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    /// Percent done, 0.0-100.0
    pub progress: f32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PipelineOutcome>,
}

impl TaskStatus {
    fn queued() -> Self {
        Self { status: TaskState::Queued, progress: 0.0, error: None, outcome: None }
    }
}

/// Status lookup. Queued and running tasks are always kept; finished ones
/// are evicted oldest first beyond `retention`.
struct StatusBoard {
    inner: Mutex<BoardInner>,
    retention: usize,
}

#[derive(Default)]
struct BoardInner {
    statuses: HashMap<String, TaskStatus>,
    order: VecDeque<String>,
    finished: VecDeque<String>,
}

impl StatusBoard {
    fn new(retention: usize) -> Self {
        Self { inner: Mutex::new(BoardInner::default()), retention: retention.max(1) }
    }

    fn insert(&self, task_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.statuses.insert(task_id.to_string(), TaskStatus::queued());
            inner.order.push_back(task_id.to_string());
        }
    }

    fn remove(&self, task_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.statuses.remove(task_id);
            inner.order.retain(|id| id != task_id);
        }
    }

    fn update(&self, task_id: &str, apply: impl FnOnce(&mut TaskStatus)) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(status) = inner.statuses.get_mut(task_id) {
                apply(status);
            }
        }
    }

    fn set_progress(&self, task_id: &str, progress: u8) {
        self.update(task_id, |s| s.progress = f32::from(progress.min(100)));
    }

    fn finish(&self, task_id: &str, result: Result<PipelineOutcome>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(status) = inner.statuses.get_mut(task_id) {
            match result {
                Ok(outcome) => {
                    status.status = TaskState::Completed;
                    status.progress = 100.0;
                    status.outcome = Some(outcome);
                }
                Err(e) => {
                    status.status = TaskState::Failed;
                    status.error = Some(e.to_string());
                }
            }
        }
        inner.finished.push_back(task_id.to_string());

        while inner.finished.len() > self.retention {
            if let Some(old) = inner.finished.pop_front() {
                inner.statuses.remove(&old);
                inner.order.retain(|id| id != &old);
            }
        }
    }

    fn get(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.lock().ok()?.statuses.get(task_id).cloned()
    }

    fn recent(&self) -> Vec<(String, TaskStatus)> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter_map(|id| inner.statuses.get(id).map(|s| (id.clone(), s.clone())))
            .collect()
    }
}

/// Handle for producers. Cheap to clone; the worker stops once every handle
/// is dropped and the queue has drained.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Task>,
    board: Arc<StatusBoard>,
    last_id: Arc<AtomicI64>,
}

impl TaskQueue {
    /// Start the single worker. Returns the producer handle and the worker's
    /// join handle.
    pub fn start(
        store: Arc<dyn MessageStore>,
        processor: Arc<dyn TaskProcessor>,
        status_retention: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let board = Arc::new(StatusBoard::new(status_retention));
        let worker = tokio::spawn(run_worker(receiver, store, processor, board.clone()));

        let queue = Self { sender, board, last_id: Arc::new(AtomicI64::new(0)) };
        (queue, worker)
    }

    /// Queue a pipeline run for `partition`. Non-blocking; `None` means the
    /// live snapshot.
    pub fn enqueue_task(&self, partition: ChatType, source: Option<TaskSource>) -> Result<String> {
        let task_id = self.next_task_id();
        let task = Task {
            task_id: task_id.clone(),
            partition,
            source: source.unwrap_or(TaskSource::Snapshot),
        };

        self.board.insert(&task_id);
        if self.sender.send(task).is_err() {
            self.board.remove(&task_id);
            return Err(Error::QueueClosed);
        }

        tracing::info!(task_id = %task_id, %partition, "Task queued");
        Ok(task_id)
    }

    /// Append a message to the store and queue a snapshot refresh of its
    /// partition
    pub fn submit_message(
        &self,
        store: &dyn MessageStore,
        partition: ChatType,
        message: Message,
    ) -> Result<String> {
        store.append(partition, message)?;
        self.enqueue_task(partition, None)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.board.get(task_id)
    }

    /// Tracked tasks in enqueue order
    pub fn recent_tasks(&self) -> Vec<(String, TaskStatus)> {
        self.board.recent()
    }

    /// Poll until the task finishes. `None` if the id is unknown or was
    /// evicted.
    pub async fn wait_for(&self, task_id: &str, poll: Duration) -> Option<TaskStatus> {
        loop {
            let status = self.task_status(task_id)?;
            if status.status.is_finished() {
                return Some(status);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Microseconds since the epoch, bumped past the previous id so ids are
    /// unique and increase in creation order
    fn next_task_id(&self) -> String {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1).to_string()
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Task>,
    store: Arc<dyn MessageStore>,
    processor: Arc<dyn TaskProcessor>,
    board: Arc<StatusBoard>,
) {
    tracing::info!("Task worker started");

    while let Some(task) = receiver.recv().await {
        let task_id = task.task_id.clone();
        board.update(&task_id, |s| s.status = TaskState::Running);
        tracing::info!(task_id = %task_id, partition = %task.partition, "Task started");

        let handle = tokio::spawn(execute(task, store.clone(), processor.clone(), board.clone()));
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Task(format!("Task aborted: {}", e))),
        };

        match &result {
            Ok(outcome) => tracing::info!(
                task_id = %task_id,
                points = outcome.points,
                clusters = outcome.clusters,
                "Task completed"
            ),
            Err(e) => tracing::error!(task_id = %task_id, "Task failed: {}", e),
        }
        board.finish(&task_id, result);
    }

    tracing::info!("Task queue closed, worker exiting");
}

async fn execute(
    task: Task,
    store: Arc<dyn MessageStore>,
    processor: Arc<dyn TaskProcessor>,
    board: Arc<StatusBoard>,
) -> Result<PipelineOutcome> {
    let messages = load_messages(&task, store.as_ref())?;
    if messages.is_empty() {
        tracing::info!(task_id = %task.task_id, partition = %task.partition, "No messages to process");
        return Ok(PipelineOutcome::empty(task.partition, 0));
    }

    let task_id = task.task_id.clone();
    let progress = move |p: u8| board.set_progress(&task_id, p);
    processor.process(task.partition, messages, task.source.origin(), &progress).await
}

fn load_messages(task: &Task, store: &dyn MessageStore) -> Result<Vec<Message>> {
    match &task.source {
        TaskSource::Snapshot => Ok(store.snapshot(task.partition)),
        TaskSource::File(path) => {
            let (chat_type, messages) = parse_export_file(path)?;
            if chat_type != task.partition {
                return Err(Error::Import(format!(
                    "{} contains a {} export but the task targets {}",
                    path.display(),
                    chat_type,
                    task.partition
                )));
            }
            Ok(messages)
        }
    }
}

/// Queue a snapshot task for every partition each `interval`. The first run
/// happens one interval after the call. Stops when the queue is closed.
pub fn spawn_periodic_refresh(
    queue: TaskQueue,
    partitions: Vec<ChatType>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for &partition in &partitions {
                if let Err(e) = queue.enqueue_task(partition, None) {
                    tracing::warn!(%partition, "Stopping periodic refresh: {}", e);
                    return;
                }
            }
        }
    })
}
