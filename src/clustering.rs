//! Clustering module - density-based over cosine distance
//!
//! DBSCAN on the raw embeddings, without a pairwise distance matrix. Points are visited in input order and
//! cluster ids are handed out in discovery order, so identical input always
//! produces identical labels.
//!
//! Noise points get [`NOISE`] and take no part in topic generation.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

/// Label for points outside every dense region
pub const NOISE: i32 = -1;

const UNVISITED: i32 = -2;

pub const DEFAULT_EPS: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbscanParams {
    /// Neighborhood radius in cosine distance
    pub eps: f32,
    /// Neighbors (self included) needed for a core point
    pub min_samples: usize,
}

impl DbscanParams {
    /// `min_samples` scales with collection size: max(2, n / 10)
    pub fn adaptive(item_count: usize, eps: f32) -> Self {
        Self {
            eps,
            min_samples: (item_count / 10).max(2),
        }
    }
}

impl Default for DbscanParams {
    fn default() -> Self {
        Self { eps: DEFAULT_EPS, min_samples: 2 }
    }
}

/// Summary of one clustering run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringResult {
    pub items_processed: usize,
    pub clusters_created: usize,
    pub noise_points: usize,
    pub min_samples: usize,
}

impl ClusteringResult {
    pub fn from_labels(labels: &[i32], params: &DbscanParams) -> Self {
        Self {
            items_processed: labels.len(),
            clusters_created: cluster_members(labels).len(),
            noise_points: labels.iter().filter(|&&l| l == NOISE).count(),
            min_samples: params.min_samples,
        }
    }
}

/// One label per embedding, `NOISE` for outliers.
///
/// Neighborhoods are computed on demand from unit vectors, so memory stays
/// linear in the number of points. Each point's neighborhood is scanned at
/// most once.
pub fn dbscan(embeddings: &[Vec<f32>], params: &DbscanParams) -> Vec<i32> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }

    let units: Vec<Option<Vec<f32>>> = embeddings.iter().map(|e| unit_vector(e)).collect();
    let region = |p: usize| -> Vec<usize> {
        (0..n)
            .filter(|&q| q == p || distance(&units[p], &units[q]) <= params.eps)
            .collect()
    };

    let min_samples = params.min_samples.max(1);
    let mut labels = vec![UNVISITED; n];
    let mut next_cluster = 0;

    for p in 0..n {
        if labels[p] != UNVISITED {
            continue;
        }

        let neighbors = region(p);
        if neighbors.len() < min_samples {
            labels[p] = NOISE;
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[p] = cluster;

        let mut queue: VecDeque<usize> = neighbors.into_iter().collect();
        while let Some(q) = queue.pop_front() {
            if labels[q] == NOISE {
                // Border point: joins the cluster but does not expand it
                labels[q] = cluster;
                continue;
            }
            if labels[q] != UNVISITED {
                continue;
            }
            labels[q] = cluster;

            let q_neighbors = region(q);
            if q_neighbors.len() >= min_samples {
                queue.extend(
                    q_neighbors
                        .into_iter()
                        .filter(|&r| labels[r] == UNVISITED || labels[r] == NOISE),
                );
            }
        }
    }

    labels
}

/// L2-normalized copy; `None` for zero or empty vectors
fn unit_vector(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if v.is_empty() || norm == 0.0 {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Cosine distance between unit vectors. Zero vectors sit at distance 1
/// from everything, matching [`crate::similarity::cosine_distance`].
fn distance(a: &Option<Vec<f32>>, b: &Option<Vec<f32>>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) if a.len() == b.len() => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            (1.0 - dot).clamp(0.0, 2.0)
        }
        _ => 1.0,
    }
}

/// Member indices per cluster, noise excluded, ordered by cluster id
pub fn cluster_members(labels: &[i32]) -> BTreeMap<i32, Vec<usize>> {
    let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        if label != NOISE {
            members.entry(label).or_default().push(idx);
        }
    }
    members
}
