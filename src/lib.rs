//! Conversation topic maps and edit-branch reconstruction.
//!
//! Messages land in a [`store::MessageStore`]; a single background worker
//! ([`queue::TaskQueue`]) turns partition snapshots into 2-D topic maps via
//! [`pipeline::Pipeline`], and [`branches::analyze_branches`] rebuilds the
//! reply tree with its edit branches on demand.

pub mod ai_client;
pub mod artifacts;
pub mod branches;
pub mod clustering;
pub mod embeddings;
pub mod error;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod projection;
pub mod queue;
pub mod retry;
pub mod settings;
pub mod similarity;
pub mod store;
pub mod topics;
pub mod utils;

pub use artifacts::{ArtifactSet, ArtifactStore, Generation, MonthlyState};
pub use branches::{analyze_branches, analyze_records, BranchAnalysis, ChatBranches, EditBranch};
pub use error::{Error, Result};
pub use models::{ChatType, Message, RawMessage, Sender};
pub use pipeline::{Granularity, MessageOrigin, Pipeline, PipelineOutcome};
pub use queue::{spawn_periodic_refresh, Task, TaskQueue, TaskSource, TaskState, TaskStatus};
pub use settings::Settings;
pub use store::{InMemoryMessageStore, MessageStore};
