//! 2-D projection of embeddings for the topic map
//!
//! Principal components by power iteration. The starting vectors come from a
//! seeded RNG and component signs are normalized, so the same input and seed
//! always produce the same coordinates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_SEED: u64 = 42;

const MAX_ITERATIONS: usize = 300;
const TOLERANCE: f64 = 1e-10;

/// Project every embedding onto the first two principal components.
/// Output has one point per input row. Rows shorter than the first row are
/// treated as zero-padded.
pub fn project_2d(embeddings: &[Vec<f32>], seed: u64) -> Vec<[f64; 2]> {
    let n = embeddings.len();
    if n == 0 {
        return Vec::new();
    }
    let dim = embeddings[0].len();
    if dim == 0 {
        return vec![[0.0, 0.0]; n];
    }

    let centered = center(embeddings, dim);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut components: Vec<Vec<f64>> = Vec::with_capacity(2);
    for _ in 0..2 {
        match principal_component(&centered, dim, &components, &mut rng) {
            Some(c) => components.push(c),
            None => break,
        }
    }

    centered
        .iter()
        .map(|row| {
            let mut point = [0.0f64; 2];
            for (axis, component) in components.iter().enumerate() {
                point[axis] = dot(row, component);
            }
            point
        })
        .collect()
}

fn center(embeddings: &[Vec<f32>], dim: usize) -> Vec<Vec<f64>> {
    let n = embeddings.len() as f64;
    let mut mean = vec![0.0f64; dim];
    for row in embeddings {
        for (m, &v) in mean.iter_mut().zip(row.iter()) {
            *m += v as f64;
        }
    }
    for m in &mut mean {
        *m /= n;
    }

    embeddings
        .iter()
        .map(|row| {
            (0..dim)
                .map(|j| row.get(j).copied().unwrap_or(0.0) as f64 - mean[j])
                .collect()
        })
        .collect()
}

/// Dominant eigenvector of XᵀX orthogonal to `previous`, or `None` when the
/// remaining variance is zero.
fn principal_component(
    x: &[Vec<f64>],
    dim: usize,
    previous: &[Vec<f64>],
    rng: &mut StdRng,
) -> Option<Vec<f64>> {
    let mut v: Vec<f64> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    orthogonalize(&mut v, previous);
    if normalize(&mut v).is_none() {
        return None;
    }

    for _ in 0..MAX_ITERATIONS {
        // w = Xᵀ (X v)
        let xv: Vec<f64> = x.iter().map(|row| dot(row, &v)).collect();
        let mut w = vec![0.0f64; dim];
        for (row, &s) in x.iter().zip(xv.iter()) {
            for (wj, &rj) in w.iter_mut().zip(row.iter()) {
                *wj += rj * s;
            }
        }
        orthogonalize(&mut w, previous);
        let norm = normalize(&mut w)?;
        if norm < TOLERANCE {
            return None;
        }

        let delta: f64 = w.iter().zip(v.iter()).map(|(a, b)| (a - b).abs()).sum();
        v = w;
        if delta < TOLERANCE {
            break;
        }
    }

    // Sign convention: largest-magnitude entry is positive
    let pivot = v
        .iter()
        .copied()
        .fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        for val in &mut v {
            *val = -*val;
        }
    }

    Some(v)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for u in basis {
        let proj = dot(v, u);
        for (vi, ui) in v.iter_mut().zip(u.iter()) {
            *vi -= proj * ui;
        }
    }
}

/// Scale to unit length in place; returns the original norm
fn normalize(v: &mut [f64]) -> Option<f64> {
    let norm = dot(v, v).sqrt();
    if !norm.is_finite() || norm < 1e-12 {
        return None;
    }
    for val in v.iter_mut() {
        *val /= norm;
    }
    Some(norm)
}
