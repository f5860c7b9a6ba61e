//! Topic-map pipeline: embed -> project -> cluster -> label -> persist
//!
//! One [`Pipeline::run`] turns a message snapshot into a complete
//! [`ArtifactSet`], plus one cumulative map per calendar month when month
//! history is on. Nothing is written unless every stage before persistence
//! succeeded.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ai_client::{self, GenerativeProvider};
use crate::artifacts::{ArtifactSet, ArtifactStore, Generation, MonthlyState};
use crate::clustering::{cluster_members, dbscan, ClusteringResult, DbscanParams};
use crate::embeddings::{self, embed_in_batches_with_progress, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{ChatType, Message};
use crate::projection::project_2d;
use crate::retry::RetryPolicy;
use crate::settings::Settings;
use crate::topics::TopicLabeler;

/// What becomes one point on the map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One point per message, titled with the chat name
    #[default]
    Message,
    /// One point per (chat, branch), titled "<chat> (Branch <id>)"
    Branch,
}

/// Progress sink, 0-100
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Where a run's messages came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    /// Snapshot of the live store. Persisted as the partition's raw snapshot.
    Store,
    /// Uploaded export. Never replaces the raw snapshot.
    Upload,
}

/// Seam between the task worker and the work it runs
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(
        &self,
        partition: ChatType,
        messages: Vec<Message>,
        origin: MessageOrigin,
        progress: ProgressFn<'_>,
    ) -> Result<PipelineOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub partition: ChatType,
    pub messages: usize,
    pub points: usize,
    pub clusters: usize,
    pub noise_points: usize,
    pub topics: BTreeMap<i32, String>,
    /// Month states written alongside the latest map
    #[serde(default)]
    pub months: usize,
    /// False when there was nothing to embed and no artifacts were written
    pub persisted: bool,
}

impl PipelineOutcome {
    pub fn empty(partition: ChatType, messages: usize) -> Self {
        Self {
            partition,
            messages,
            points: 0,
            clusters: 0,
            noise_points: 0,
            topics: BTreeMap::new(),
            months: 0,
            persisted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub embedding_retry: RetryPolicy,
    pub eps: f32,
    pub min_samples: Option<usize>,
    pub seed: u64,
    pub granularity: Granularity,
    pub monthly_history: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            batch_size: settings.embedding_batch_size,
            embedding_retry: settings.embedding_retry(),
            eps: settings.cluster_eps,
            min_samples: settings.cluster_min_samples,
            seed: settings.projection_seed,
            granularity: settings.granularity,
            monthly_history: settings.monthly_history,
        }
    }

    fn dbscan_params(&self, item_count: usize) -> DbscanParams {
        match self.min_samples {
            Some(min_samples) => DbscanParams { eps: self.eps, min_samples },
            None => DbscanParams::adaptive(item_count, self.eps),
        }
    }
}

/// One embedding unit with the title shown for its point
#[derive(Debug, Clone, PartialEq)]
struct Unit {
    title: String,
    text: String,
}

/// Vectors already fetched during this run, keyed by unit text
type EmbeddingCache = HashMap<String, Vec<f32>>;

/// Part of the 0-100 progress scale owned by one map build
#[derive(Debug, Clone, Copy)]
struct Span {
    start: u8,
    end: u8,
}

impl Span {
    const FULL: Span = Span { start: 0, end: 100 };

    /// `index`-th of `count` equal slices
    fn slice(index: usize, count: usize) -> Self {
        let count = count.max(1);
        Span {
            start: (100 * index / count) as u8,
            end: (100 * (index + 1) / count) as u8,
        }
    }

    fn at(&self, pct: u8) -> u8 {
        let width = u32::from(self.end.saturating_sub(self.start));
        self.start + (width * u32::from(pct.min(100)) / 100) as u8
    }
}

/// One finished map before it is written
struct MapBuild {
    artifacts: ArtifactSet,
    summary: ClusteringResult,
}

pub struct Pipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    labeler: TopicLabeler,
    artifacts: ArtifactStore,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerativeProvider>,
        topic_retry: RetryPolicy,
        artifacts: ArtifactStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            embedder,
            labeler: TopicLabeler::new(generator, topic_retry),
            artifacts,
            config,
        }
    }

    /// Providers and tuning from settings; artifacts under the data dir
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(embeddings::from_settings(settings)?);
        let generator: Arc<dyn GenerativeProvider> = Arc::from(ai_client::from_settings(settings)?);
        tracing::debug!(
            embedding_model = %settings.embedding_model(),
            generation_model = generator.model().unwrap_or("-"),
            "Pipeline providers ready"
        );
        Ok(Self::new(
            embedder,
            generator,
            settings.topic_retry(),
            ArtifactStore::new(settings.data_dir()),
            PipelineConfig::from_settings(settings),
        ))
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn run(
        &self,
        partition: ChatType,
        messages: Vec<Message>,
        origin: MessageOrigin,
        progress: ProgressFn<'_>,
    ) -> Result<PipelineOutcome> {
        let message_count = messages.len();
        let mut cache = EmbeddingCache::new();

        // Earlier months first, each over everything sent up to its end
        let month_of: Vec<String> = messages.iter().map(Message::month_year).collect();
        let months: Vec<String> = if self.config.monthly_history {
            month_of.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
        } else {
            Vec::new()
        };
        let segments = months.len().max(1);

        let mut history = Vec::with_capacity(months.len());
        for (idx, month) in months.iter().take(months.len().saturating_sub(1)).enumerate() {
            let covered: Vec<Message> = messages
                .iter()
                .zip(&month_of)
                .filter(|(_, m)| *m <= month)
                .map(|(msg, _)| msg.clone())
                .collect();
            let units = build_units(&covered, self.config.granularity);
            let span = Span::slice(idx, segments);
            if units.len() < 2 {
                tracing::debug!(%partition, month = %month, units = units.len(), "Skipping month with too few points");
                progress(span.end);
                continue;
            }
            if let Some(build) = self.build_map(partition, &units, &mut cache, span, progress).await? {
                tracing::info!(%partition, month = %month, points = build.artifacts.len(), "Month state built");
                history.push(MonthlyState::new(month.clone(), build.artifacts));
            }
        }

        let span = if months.is_empty() { Span::FULL } else { Span::slice(segments - 1, segments) };
        let units = build_units(&messages, self.config.granularity);
        progress(span.at(5));

        let Some(build) = self.build_map(partition, &units, &mut cache, span, progress).await? else {
            tracing::info!(%partition, messages = message_count, "No non-empty texts to embed, skipping");
            progress(100);
            return Ok(PipelineOutcome::empty(partition, message_count));
        };
        if let Some(last) = months.last() {
            if units.len() >= 2 {
                history.push(MonthlyState::new(last.clone(), build.artifacts.clone()));
            }
        }

        let outcome = PipelineOutcome {
            partition,
            messages: message_count,
            points: build.artifacts.len(),
            clusters: build.summary.clusters_created,
            noise_points: build.summary.noise_points,
            topics: build.artifacts.topics.clone(),
            months: history.len(),
            persisted: true,
        };

        // Persist
        let generation = Generation {
            artifacts: build.artifacts,
            messages,
            replace_snapshot: origin == MessageOrigin::Store,
            history,
        };
        let store = self.artifacts.clone();
        tokio::task::spawn_blocking(move || store.write(partition, &generation))
            .await
            .map_err(|e| Error::Store(format!("Artifact writer stopped: {}", e)))??;
        progress(100);

        Ok(outcome)
    }

    /// Embed, project, cluster and label one set of units. `None` when no
    /// unit has text to embed.
    async fn build_map(
        &self,
        partition: ChatType,
        units: &[Unit],
        cache: &mut EmbeddingCache,
        span: Span,
        progress: ProgressFn<'_>,
    ) -> Result<Option<MapBuild>> {
        // 1. Embed (5-60%)
        let embedded = self
            .embed_units(units, cache, |done, total| {
                progress(span.at(5 + (55 * done / total.max(1)) as u8))
            })
            .await?;
        if embedded.is_empty() {
            return Ok(None);
        }

        let mut titles = Vec::with_capacity(embedded.len());
        let mut kept_texts = Vec::with_capacity(embedded.len());
        let mut vectors = Vec::with_capacity(embedded.len());
        for (idx, vector) in embedded {
            titles.push(units[idx].title.clone());
            kept_texts.push(units[idx].text.clone());
            vectors.push(vector);
        }
        tracing::info!(%partition, units = units.len(), embedded = vectors.len(), "Embedding complete");

        // 2. Project
        let points = project_2d(&vectors, self.config.seed);
        progress(span.at(65));

        // 3. Cluster
        let params = self.config.dbscan_params(vectors.len());
        let clusters = dbscan(&vectors, &params);
        let summary = ClusteringResult::from_labels(&clusters, &params);
        tracing::info!(
            %partition,
            clusters = summary.clusters_created,
            noise = summary.noise_points,
            min_samples = summary.min_samples,
            "Clustering complete"
        );
        progress(span.at(75));

        // 4. Label
        let members = cluster_members(&clusters);
        let topics = self.labeler.label_clusters(&members, &kept_texts, &vectors).await;
        progress(span.at(90));

        Ok(Some(MapBuild { artifacts: ArtifactSet { points, clusters, titles, topics }, summary }))
    }

    /// `(unit index, vector)` for every unit with text. Only texts missing
    /// from `cache` go to the provider, each once.
    async fn embed_units<F>(
        &self,
        units: &[Unit],
        cache: &mut EmbeddingCache,
        on_batch: F,
    ) -> Result<Vec<(usize, Vec<f32>)>>
    where
        F: FnMut(usize, usize),
    {
        let mut seen: HashSet<&str> = HashSet::new();
        let pending: Vec<String> = units
            .iter()
            .map(|u| u.text.as_str())
            .filter(|t| !t.trim().is_empty() && !cache.contains_key(*t) && seen.insert(*t))
            .map(str::to_string)
            .collect();

        let fetched = embed_in_batches_with_progress(
            self.embedder.as_ref(),
            &pending,
            self.config.batch_size,
            &self.config.embedding_retry,
            on_batch,
        )
        .await?;
        for (idx, vector) in fetched {
            cache.insert(pending[idx].clone(), vector);
        }

        Ok(units
            .iter()
            .enumerate()
            .filter_map(|(idx, u)| cache.get(&u.text).map(|v| (idx, v.clone())))
            .collect())
    }
}

#[async_trait]
impl TaskProcessor for Pipeline {
    async fn process(
        &self,
        partition: ChatType,
        messages: Vec<Message>,
        origin: MessageOrigin,
        progress: ProgressFn<'_>,
    ) -> Result<PipelineOutcome> {
        self.run(partition, messages, origin, progress).await
    }
}

fn build_units(messages: &[Message], granularity: Granularity) -> Vec<Unit> {
    match granularity {
        Granularity::Message => messages
            .iter()
            .map(|m| Unit { title: m.chat_name.clone(), text: m.text.clone() })
            .collect(),
        Granularity::Branch => {
            let mut groups: BTreeMap<(&str, &str), Vec<&Message>> = BTreeMap::new();
            for m in messages {
                groups.entry((m.chat_name.as_str(), m.branch_id.as_str())).or_default().push(m);
            }
            groups
                .into_iter()
                .map(|((chat, branch), mut group)| {
                    group.sort_by_key(|m| m.timestamp);
                    let text = group
                        .iter()
                        .map(|m| m.text.trim())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ");
                    Unit { title: format!("{} (Branch {})", chat, branch), text }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Sender;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Keyword embedding: "rust" and "bread" texts land on separate axes
    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(batch
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    let rust = t.matches("rust").count() as f32;
                    let bread = t.matches("bread").count() as f32;
                    vec![rust + 0.01, bread + 0.01, t.len() as f32 * 0.001]
                })
                .collect())
        }
    }

    /// Counts every text sent to the provider
    #[derive(Default)]
    struct CountingEmbedder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
            self.sent.lock().unwrap().extend(batch.iter().cloned());
            KeywordEmbedder.embed(batch).await
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _batch: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::Provider("embedding service down".to_string()))
        }
    }

    struct EchoLabeler;

    #[async_trait]
    impl GenerativeProvider for EchoLabeler {
        async fn complete(&self, prompt: &str) -> Result<String> {
            if prompt.contains("bread") {
                Ok("Baking".to_string())
            } else {
                Ok("Rust Programming".to_string())
            }
        }
    }

    fn messages() -> Vec<Message> {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let texts = [
            ("rust chat", "rust borrow checker"),
            ("rust chat", "rust lifetimes"),
            ("rust chat", "rust traits and rust generics"),
            ("baking", "sourdough bread starter"),
            ("baking", "bread hydration"),
            ("baking", "bread crust"),
            ("baking", ""),
        ];
        texts
            .iter()
            .enumerate()
            .map(|(i, (chat, text))| {
                Message::new(*chat, format!("m{}", i), None, *text, Sender::Human, base + Duration::seconds(i as i64))
            })
            .collect()
    }

    fn pipeline(dir: &TempDir, embedder: Arc<dyn EmbeddingProvider>) -> Pipeline {
        let config = PipelineConfig { min_samples: Some(2), ..PipelineConfig::default() };
        Pipeline::new(
            embedder,
            Arc::new(EchoLabeler),
            RetryPolicy::once(),
            ArtifactStore::new(dir.path()),
            config,
        )
    }

    #[tokio::test]
    async fn test_run_writes_consistent_artifacts() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(KeywordEmbedder));
        let seen = Mutex::new(Vec::new());
        let record = |p: u8| seen.lock().unwrap().push(p);

        let outcome = pipeline.run(ChatType::Claude, messages(), MessageOrigin::Store, &record).await.unwrap();

        // Empty message is not embedded
        assert_eq!(outcome.messages, 7);
        assert_eq!(outcome.points, 6);
        assert_eq!(outcome.clusters, 2);
        assert!(outcome.persisted);

        let set = pipeline.artifact_store().read_artifacts(ChatType::Claude);
        assert_eq!(set.points.len(), 6);
        assert_eq!(set.clusters.len(), 6);
        assert_eq!(set.titles.len(), 6);
        assert_eq!(set.titles[0], "rust chat");
        assert_eq!(set.clusters[0], set.clusters[1]);
        assert_ne!(set.clusters[0], set.clusters[3]);
        assert_eq!(set.topics[&set.clusters[3]], "Baking");

        let progress = seen.lock().unwrap().clone();
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_rerun_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(KeywordEmbedder));
        let noop = |_: u8| {};

        pipeline.run(ChatType::Claude, messages(), MessageOrigin::Store, &noop).await.unwrap();
        let first = pipeline.artifact_store().read_artifacts(ChatType::Claude);
        pipeline.run(ChatType::Claude, messages(), MessageOrigin::Store, &noop).await.unwrap();
        let second = pipeline.artifact_store().read_artifacts(ChatType::Claude);

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_previous_artifacts() {
        let dir = TempDir::new().unwrap();
        let noop = |_: u8| {};
        pipeline(&dir, Arc::new(KeywordEmbedder))
            .run(ChatType::ChatGpt, messages(), MessageOrigin::Store, &noop)
            .await
            .unwrap();

        let failing = pipeline(&dir, Arc::new(FailingEmbedder));
        let before = failing.artifact_store().read_artifacts(ChatType::ChatGpt);
        assert!(failing.run(ChatType::ChatGpt, messages(), MessageOrigin::Store, &noop).await.is_err());
        assert_eq!(failing.artifact_store().read_artifacts(ChatType::ChatGpt), before);
    }

    #[tokio::test]
    async fn test_only_empty_texts_is_noop() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(FailingEmbedder));
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let msgs = vec![Message::new("c", "1", None, "   ", Sender::Human, base)];

        // Provider is never called for an all-empty batch
        let outcome = pipeline.run(ChatType::Claude, msgs, MessageOrigin::Store, &|_: u8| {}).await.unwrap();
        assert!(!outcome.persisted);
        assert!(pipeline.artifact_store().read_artifacts(ChatType::Claude).is_empty());
    }

    #[tokio::test]
    async fn test_upload_run_keeps_store_snapshot() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir, Arc::new(KeywordEmbedder));
        let noop = |_: u8| {};

        pipeline.run(ChatType::Claude, messages(), MessageOrigin::Store, &noop).await.unwrap();
        let snapshot = pipeline.artifact_store().snapshot_path(ChatType::Claude);
        let before = std::fs::read(&snapshot).unwrap();

        let upload = messages().into_iter().take(3).collect();
        let outcome = pipeline.run(ChatType::Claude, upload, MessageOrigin::Upload, &noop).await.unwrap();
        assert_eq!(outcome.points, 3);
        assert_eq!(pipeline.artifact_store().read_artifacts(ChatType::Claude).len(), 3);
        assert_eq!(std::fs::read(&snapshot).unwrap(), before);
    }

    #[tokio::test]
    async fn test_monthly_history_embeds_each_text_once() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(CountingEmbedder::default());
        let mut p = pipeline(&dir, embedder.clone());
        p.config.monthly_history = true;

        // Two January messages, one lone February message, four in March
        let month = |m: u32, d: u32| Utc.with_ymd_and_hms(2024, m, d, 9, 0, 0).unwrap();
        let mut msgs = messages();
        let dates = [month(1, 3), month(1, 4), month(2, 1), month(3, 1), month(3, 2), month(3, 3), month(3, 4)];
        for (msg, ts) in msgs.iter_mut().zip(dates) {
            msg.timestamp = ts;
        }

        let seen = Mutex::new(Vec::new());
        let record = |pct: u8| seen.lock().unwrap().push(pct);
        let outcome = p.run(ChatType::ChatGpt, msgs, MessageOrigin::Store, &record).await.unwrap();

        assert_eq!(outcome.months, 3);
        let store = p.artifact_store();
        assert_eq!(store.list_months(ChatType::ChatGpt), vec!["2024-01", "2024-02", "2024-03"]);
        assert_eq!(store.read_state(ChatType::ChatGpt, "2024-01").unwrap().total_conversations, 2);
        assert_eq!(store.read_state(ChatType::ChatGpt, "2024-02").unwrap().total_conversations, 3);
        assert_eq!(store.read_state_messages(ChatType::ChatGpt, "2024-02").len(), 3);

        let latest = store.read_state(ChatType::ChatGpt, "2024-03").unwrap();
        let current = store.read_artifacts(ChatType::ChatGpt);
        assert_eq!(latest.points, current.points);
        assert_eq!(latest.titles, current.titles);

        let mut sent = embedder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 6);
        sent.sort();
        sent.dedup();
        assert_eq!(sent.len(), 6);

        let progress = seen.lock().unwrap().clone();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));
    }

    #[test]
    fn test_progress_spans() {
        assert_eq!(Span::FULL.at(60), 60);
        let second = Span::slice(1, 4);
        assert_eq!((second.start, second.end), (25, 50));
        assert_eq!(second.at(0), 25);
        assert_eq!(second.at(100), 50);
        assert_eq!(Span::slice(3, 4).end, 100);
    }

    #[test]
    fn test_min_samples_override() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.dbscan_params(100).min_samples, 10);
        config.min_samples = Some(4);
        assert_eq!(config.dbscan_params(100).min_samples, 4);
    }

    #[test]
    fn test_branch_units() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let msgs = vec![
            Message::new("chat", "2", Some("1"), "second", Sender::Assistant, base + Duration::seconds(5)),
            Message::new("chat", "1", None, "first", Sender::Human, base),
            Message::new("chat", "3", Some("2"), "edit", Sender::Human, base + Duration::seconds(90)).with_branch("0.1"),
        ];
        let units = build_units(&msgs, Granularity::Branch);
        assert_eq!(
            units,
            vec![
                Unit { title: "chat (Branch 0)".to_string(), text: "first second".to_string() },
                Unit { title: "chat (Branch 0.1)".to_string(), text: "edit".to_string() },
            ]
        );

        assert_eq!(build_units(&msgs, Granularity::Message).len(), 3);
    }
}
