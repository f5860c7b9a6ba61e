//! Vector similarity helpers for embeddings
//!
//! Cosine similarity/distance, centroids, and nearest-member ranking.

/// Cosine similarity between two embedding vectors
/// Returns a value between -1.0 and 1.0 (1.0 = identical, 0.0 = orthogonal)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Cosine distance in [0, 2]: 0 = same direction, 1 = orthogonal.
/// Zero vectors are at distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).clamp(0.0, 2.0)
}

/// Compute the centroid (average) of multiple embeddings
/// Returns a normalized centroid vector
pub fn compute_centroid(embeddings: &[&[f32]]) -> Option<Vec<f32>> {
    if embeddings.is_empty() {
        return None;
    }

    let dim = embeddings[0].len();
    if dim == 0 {
        return None;
    }

    let mut centroid = vec![0.0f32; dim];
    let mut counted = 0usize;
    for emb in embeddings {
        if emb.len() != dim {
            continue; // Skip mismatched dimensions
        }
        for (i, &val) in emb.iter().enumerate() {
            centroid[i] += val;
        }
        counted += 1;
    }

    let n = counted as f32;
    for val in &mut centroid {
        *val /= n;
    }

    // Normalize (L2 norm)
    let norm: f32 = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        for val in &mut centroid {
            *val /= norm;
        }
    }

    Some(centroid)
}

/// Rank candidate indices by similarity to `target`, most similar first.
/// Ties keep candidate order so the ranking is deterministic.
pub fn rank_by_similarity(
    target: &[f32],
    embeddings: &[Vec<f32>],
    candidates: &[usize],
    top_n: usize,
) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = candidates
        .iter()
        .filter_map(|&i| embeddings.get(i).map(|emb| (i, cosine_similarity(target, emb))))
        .collect();

    // Stable sort keeps original order on ties
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    scored.truncate(top_n);
    scored.into_iter().map(|(i, _)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 0.0001);
    }

    #[test]
    fn test_cosine_distance_range() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        // Zero vector
        assert!((cosine_distance(&[0.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_compute_centroid_normalized() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = compute_centroid(&[&a, &b]).unwrap();
        let norm: f32 = c.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((c[0] - c[1]).abs() < 1e-6);
        assert!(compute_centroid(&[]).is_none());
    }

    #[test]
    fn test_rank_by_similarity() {
        let embeddings = vec![
            vec![0.0, 1.0],  // orthogonal
            vec![1.0, 0.1],  // close
            vec![1.0, 0.0],  // identical
            vec![-1.0, 0.0], // opposite
        ];
        let ranked = rank_by_similarity(&[1.0, 0.0], &embeddings, &[0, 1, 2, 3], 2);
        assert_eq!(ranked, vec![2, 1]);

        // Only candidates are considered
        let ranked = rank_by_similarity(&[1.0, 0.0], &embeddings, &[0, 3], 5);
        assert_eq!(ranked, vec![0, 3]);
    }
}
