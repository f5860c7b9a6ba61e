//! Artifact persistence
//!
//! Layout under the data directory:
//!
//! ```text
//! {base}/{partition}_messages.json      raw message snapshot
//! {base}/{partition}/embeddings_2d.json [[x, y], ...]
//! {base}/{partition}/clusters.json      [label, ...]  (-1 = noise)
//! {base}/{partition}/chat_titles.json   [title, ...]
//! {base}/{partition}/topics.json        {"<cluster id>": "<topic>"}
//! {base}/{partition}/states/state_YYYY-MM.json     cumulative month state
//! {base}/{partition}/states/messages_YYYY-MM.json  messages up to that month
//! ```
//!
//! A write serializes every payload first, stages each file as a `.tmp`
//! sibling, and renames only after all staging writes succeeded.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ChatType, Message};

pub const EMBEDDINGS_FILE: &str = "embeddings_2d.json";
pub const CLUSTERS_FILE: &str = "clusters.json";
pub const TITLES_FILE: &str = "chat_titles.json";
pub const TOPICS_FILE: &str = "topics.json";
pub const STATES_DIR: &str = "states";

/// Latest pipeline output for one partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub points: Vec<[f64; 2]>,
    pub clusters: Vec<i32>,
    pub titles: Vec<String>,
    pub topics: BTreeMap<i32, String>,
}

impl ArtifactSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// One cluster label and one title per point
    pub fn is_consistent(&self) -> bool {
        self.points.len() == self.clusters.len() && self.points.len() == self.titles.len()
    }
}

/// Map of everything sent up to the end of `month_year`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyState {
    pub month_year: String,
    pub points: Vec<[f64; 2]>,
    pub clusters: Vec<i32>,
    pub titles: Vec<String>,
    pub topics: BTreeMap<i32, String>,
    pub total_conversations: usize,
}

impl MonthlyState {
    pub fn new(month_year: impl Into<String>, artifacts: ArtifactSet) -> Self {
        Self {
            month_year: month_year.into(),
            total_conversations: artifacts.len(),
            points: artifacts.points,
            clusters: artifacts.clusters,
            titles: artifacts.titles,
            topics: artifacts.topics,
        }
    }
}

/// Everything one successful run persists
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub artifacts: ArtifactSet,
    /// Every message the run covered
    pub messages: Vec<Message>,
    /// Replace the raw store snapshot with `messages`. Off for runs over
    /// uploaded files, which never stand in for the store.
    pub replace_snapshot: bool,
    /// Cumulative month states, oldest first. Empty leaves any existing
    /// history alone.
    pub history: Vec<MonthlyState>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn partition_dir(&self, partition: ChatType) -> PathBuf {
        self.base.join(partition.as_str())
    }

    pub fn snapshot_path(&self, partition: ChatType) -> PathBuf {
        self.base.join(format!("{}_messages.json", partition.as_str()))
    }

    pub fn states_dir(&self, partition: ChatType) -> PathBuf {
        self.partition_dir(partition).join(STATES_DIR)
    }

    /// Replace the partition's artifacts, and optionally its raw snapshot and
    /// month history. On error the previous generation stays in place.
    pub fn write(&self, partition: ChatType, generation: &Generation) -> Result<()> {
        let artifacts = &generation.artifacts;
        if !artifacts.is_consistent() {
            return Err(Error::Store(format!(
                "Inconsistent artifact set: {} points, {} clusters, {} titles",
                artifacts.points.len(),
                artifacts.clusters.len(),
                artifacts.titles.len()
            )));
        }
        if let Some(state) = generation
            .history
            .iter()
            .find(|s| s.points.len() != s.clusters.len() || s.points.len() != s.titles.len())
        {
            return Err(Error::Store(format!("Inconsistent state for {}", state.month_year)));
        }

        let dir = self.partition_dir(partition);
        let states = self.states_dir(partition);
        let mut payloads: Vec<(PathBuf, Vec<u8>)> = vec![
            (dir.join(EMBEDDINGS_FILE), serde_json::to_vec(&artifacts.points)?),
            (dir.join(CLUSTERS_FILE), serde_json::to_vec(&artifacts.clusters)?),
            (dir.join(TOPICS_FILE), serde_json::to_vec(&artifacts.topics)?),
            (dir.join(TITLES_FILE), serde_json::to_vec(&artifacts.titles)?),
        ];
        if generation.replace_snapshot {
            payloads.push((self.snapshot_path(partition), serde_json::to_vec(&generation.messages)?));
        }
        for state in &generation.history {
            let covered: Vec<&Message> = generation
                .messages
                .iter()
                .filter(|m| m.month_year() <= state.month_year)
                .collect();
            payloads.push((states.join(state_file(&state.month_year)), serde_json::to_vec(state)?));
            payloads.push((states.join(messages_file(&state.month_year)), serde_json::to_vec(&covered)?));
        }

        let target_dir = if generation.history.is_empty() { &dir } else { &states };
        fs::create_dir_all(target_dir).map_err(|e| Error::io(target_dir, e))?;

        let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(payloads.len());
        for (path, bytes) in &payloads {
            let tmp = tmp_path(path);
            if let Err(e) = fs::write(&tmp, bytes) {
                discard(&staged);
                let _ = fs::remove_file(&tmp);
                return Err(Error::io(&tmp, e));
            }
            staged.push((tmp, path.as_path()));
        }

        for (pos, (tmp, path)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(tmp, path) {
                discard(&staged[pos..]);
                return Err(Error::io(*path, e));
            }
        }

        if !generation.history.is_empty() {
            let keep: HashSet<&str> = generation.history.iter().map(|s| s.month_year.as_str()).collect();
            self.prune_months(partition, &keep);
        }

        tracing::info!(
            %partition,
            points = artifacts.len(),
            topics = artifacts.topics.len(),
            messages = generation.messages.len(),
            snapshot = generation.replace_snapshot,
            months = generation.history.len(),
            "Wrote artifacts"
        );
        Ok(())
    }

    /// Current artifact set for a partition. Missing, unreadable or
    /// inconsistent files give an empty set.
    pub fn read_artifacts(&self, partition: ChatType) -> ArtifactSet {
        let dir = self.partition_dir(partition);
        let read = || -> Option<ArtifactSet> {
            Some(ArtifactSet {
                points: read_json(&dir.join(EMBEDDINGS_FILE))?,
                clusters: read_json(&dir.join(CLUSTERS_FILE))?,
                titles: read_json(&dir.join(TITLES_FILE))?,
                topics: read_json(&dir.join(TOPICS_FILE))?,
            })
        };

        match read() {
            Some(set) if set.is_consistent() => set,
            Some(set) => {
                tracing::warn!(
                    %partition,
                    points = set.points.len(),
                    clusters = set.clusters.len(),
                    titles = set.titles.len(),
                    "Artifact lengths disagree, serving empty set"
                );
                ArtifactSet::default()
            }
            None => ArtifactSet::default(),
        }
    }

    /// Months with a stored state, oldest first
    pub fn list_months(&self, partition: ChatType) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.states_dir(partition)) else {
            return Vec::new();
        };
        let mut months: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let month = name.strip_prefix("state_")?.strip_suffix(".json")?;
                Some(month.to_string())
            })
            .collect();
        months.sort();
        months
    }

    /// Stored state for one month; `None` when missing or unreadable
    pub fn read_state(&self, partition: ChatType, month_year: &str) -> Option<MonthlyState> {
        read_json(&self.states_dir(partition).join(state_file(month_year)))
    }

    /// Messages covered by one month's state
    pub fn read_state_messages(&self, partition: ChatType, month_year: &str) -> Vec<Message> {
        read_json(&self.states_dir(partition).join(messages_file(month_year))).unwrap_or_default()
    }

    /// Remove a partition's artifacts, history and raw snapshot
    pub fn clear(&self, partition: ChatType) -> Result<()> {
        let dir = self.partition_dir(partition);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        let snapshot = self.snapshot_path(partition);
        if snapshot.exists() {
            fs::remove_file(&snapshot).map_err(|e| Error::io(&snapshot, e))?;
        }
        Ok(())
    }

    /// Drop month files that the latest generation no longer covers
    fn prune_months(&self, partition: ChatType, keep: &HashSet<&str>) {
        let states = self.states_dir(partition);
        for month in self.list_months(partition) {
            if keep.contains(month.as_str()) {
                continue;
            }
            for path in [states.join(state_file(&month)), states.join(messages_file(&month))] {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), "Failed to remove stale state: {}", e);
                    }
                }
            }
        }
    }
}

fn state_file(month_year: &str) -> String {
    format!("state_{}.json", month_year)
}

fn messages_file(month_year: &str) -> String {
    format!("messages_{}.json", month_year)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn discard(staged: &[(PathBuf, &Path)]) {
    for (tmp, _) in staged {
        let _ = fs::remove_file(tmp);
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to read artifact: {}", e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Corrupt artifact: {}", e);
            None
        }
    }
}
