//! Topic labeling for clusters
//!
//! Each cluster is summarized by a few member texts closest to its centroid,
//! which go to the generative provider in a single prompt. Labeling never
//! fails the pipeline: provider errors end in the [`ERROR_TOPIC`] sentinel.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ai_client::GenerativeProvider;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::similarity::{compute_centroid, rank_by_similarity};
use crate::utils::{safe_truncate, single_line};

/// Returned when every attempt failed
pub const ERROR_TOPIC: &str = "Error";
/// Returned for an empty completion or a cluster with no texts
pub const FALLBACK_TOPIC: &str = "Miscellaneous";

pub const MAX_SAMPLES: usize = 5;
const MAX_SAMPLE_BYTES: usize = 500;

pub struct TopicLabeler {
    provider: Arc<dyn GenerativeProvider>,
    policy: RetryPolicy,
}

impl TopicLabeler {
    pub fn new(provider: Arc<dyn GenerativeProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    /// Short topic for up to [`MAX_SAMPLES`] texts
    pub async fn label(&self, samples: &[String]) -> String {
        let samples: Vec<&String> = samples
            .iter()
            .filter(|s| !s.trim().is_empty())
            .take(MAX_SAMPLES)
            .collect();
        if samples.is_empty() {
            return FALLBACK_TOPIC.to_string();
        }

        let prompt = build_prompt(&samples);
        let result = retry_with_backoff(&self.policy, "topic label", |_| self.provider.complete(&prompt)).await;

        match result {
            Ok(completion) => clean_label(&completion),
            Err(e) => {
                tracing::error!("Error generating topic: {}", e);
                ERROR_TOPIC.to_string()
            }
        }
    }

    /// Label every cluster in `members` (cluster id -> indices into `texts`
    /// and `embeddings`)
    pub async fn label_clusters(
        &self,
        members: &BTreeMap<i32, Vec<usize>>,
        texts: &[String],
        embeddings: &[Vec<f32>],
    ) -> BTreeMap<i32, String> {
        let mut topics = BTreeMap::new();
        for (&cluster_id, indices) in members {
            let samples = representative_texts(indices, texts, embeddings, MAX_SAMPLES);
            let topic = self.label(&samples).await;
            tracing::debug!(cluster_id, members = indices.len(), topic = %topic, "Labeled cluster");
            topics.insert(cluster_id, topic);
        }
        topics
    }
}

/// Member texts nearest the cluster centroid, most central first
pub fn representative_texts(
    indices: &[usize],
    texts: &[String],
    embeddings: &[Vec<f32>],
    limit: usize,
) -> Vec<String> {
    let vectors: Vec<&[f32]> = indices
        .iter()
        .filter_map(|&i| embeddings.get(i).map(Vec::as_slice))
        .collect();

    let ranked = match compute_centroid(&vectors) {
        Some(centroid) => rank_by_similarity(&centroid, embeddings, indices, limit),
        None => indices.iter().copied().take(limit).collect(),
    };

    ranked
        .into_iter()
        .filter_map(|i| texts.get(i).cloned())
        .collect()
}

fn build_prompt(samples: &[&String]) -> String {
    let messages_text = samples
        .iter()
        .map(|s| single_line(safe_truncate(s, MAX_SAMPLE_BYTES)))
        .collect::<Vec<_>>()
        .join("\n- ");

    format!(
        r#"You are a technical topic analyzer. Review the following chat conversation messages and provide a single concise topic label (2-4 words) that best describes their common theme.

Conversation messages:
- {}

Provide ONLY the topic label, nothing else. Examples:
"Network Security Tools"
"UI Animation Design"
"Data Visualization"
"API Integration"
"#,
        messages_text
    )
}

/// Trim whitespace and wrapping quotes; empty becomes the fallback topic
fn clean_label(completion: &str) -> String {
    let label = completion
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    if label.is_empty() {
        FALLBACK_TOPIC.to_string()
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls, then answers `reply`
    struct FlakyProvider {
        failures: u32,
        reply: String,
        calls: AtomicU32,
    }

    impl FlakyProvider {
        fn new(failures: u32, reply: &str) -> Arc<Self> {
            Arc::new(Self { failures, reply: reply.to_string(), calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl GenerativeProvider for FlakyProvider {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(Error::Provider(format!("transient failure {}", n)))
            } else {
                Ok(self.reply.clone())
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    fn samples() -> Vec<String> {
        vec!["How do I pin a future?".to_string(), "What is Unpin?".to_string()]
    }

    #[tokio::test]
    async fn test_label_after_two_failures() {
        let provider = FlakyProvider::new(2, " \"Async Rust\"\n");
        let labeler = TopicLabeler::new(provider.clone(), policy());
        assert_eq!(labeler.label(&samples()).await, "Async Rust");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_three_failures_yield_sentinel() {
        let provider = FlakyProvider::new(3, "never");
        let labeler = TopicLabeler::new(provider.clone(), policy());
        assert_eq!(labeler.label(&samples()).await, ERROR_TOPIC);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_completion_and_empty_cluster() {
        let provider = FlakyProvider::new(0, "   ");
        let labeler = TopicLabeler::new(provider.clone(), policy());
        assert_eq!(labeler.label(&samples()).await, FALLBACK_TOPIC);

        assert_eq!(labeler.label(&[]).await, FALLBACK_TOPIC);
        // No provider call for a cluster without texts
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prompt_caps_samples() {
        let many: Vec<String> = (0..8).map(|i| format!("sample {}", i)).collect();
        let refs: Vec<&String> = many.iter().take(MAX_SAMPLES).collect();
        let prompt = build_prompt(&refs);
        assert!(prompt.contains("- sample 4"));
        assert!(!prompt.contains("sample 5"));
    }

    #[test]
    fn test_representatives_nearest_centroid_first() {
        let texts: Vec<String> = ["edge", "center", "other edge"].iter().map(|s| s.to_string()).collect();
        let embeddings = vec![vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0]];
        let reps = representative_texts(&[0, 1, 2], &texts, &embeddings, 2);
        assert_eq!(reps[0], "center");
        assert_eq!(reps.len(), 2);
    }

    #[tokio::test]
    async fn test_label_clusters_covers_every_cluster() {
        let provider = FlakyProvider::new(0, "Topic");
        let labeler = TopicLabeler::new(provider, policy());
        let texts: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 1.0]];
        let mut members = BTreeMap::new();
        members.insert(0, vec![0]);
        members.insert(1, vec![1, 2]);

        let topics = labeler.label_clusters(&members, &texts, &embeddings).await;
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[&1], "Topic");
    }
}
