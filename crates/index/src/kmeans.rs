//! Seeded k-means with k-means++ initialization
//!
//! Used to train the IVF coarse quantizer. A fixed seed makes training
//! reproducible, so every replica that trains on the same sample ends up
//! with the same centroids.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::distance::l2_squared;

/// Index of the centroid nearest to `point` (ties go to the lower index)
pub fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (ci, centroid) in centroids.iter().enumerate() {
        let d = l2_squared(point, centroid);
        if d < best_dist {
            best_dist = d;
            best = ci;
        }
    }
    best
}

/// Cluster `points` into at most `k` centroids
///
/// With `points.len() <= k` every point becomes its own centroid.
/// Empty clusters keep their previous centroid.
pub fn kmeans(points: &[Vec<f32>], k: usize, iterations: usize, seed: u64) -> Vec<Vec<f32>> {
    let n = points.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }
    if n <= k {
        return points.to_vec();
    }
    let dim = points[0].len();
    let mut rng = StdRng::seed_from_u64(seed);

    // k-means++ initialization
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..n)].clone());
    let mut min_dists = vec![f32::MAX; n];

    while centroids.len() < k {
        let last = &centroids[centroids.len() - 1];
        let mut total = 0.0f64;
        for (i, point) in points.iter().enumerate() {
            let d = l2_squared(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        if total < 1e-30 {
            // All points coincide with existing centroids
            centroids.push(points[rng.gen_range(0..n)].clone());
            continue;
        }
        let threshold = rng.gen::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = n - 1;
        for (i, &d) in min_dists.iter().enumerate() {
            cumulative += d as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids.push(points[chosen].clone());
    }

    // Lloyd iterations
    for _ in 0..iterations {
        let assignments: Vec<usize> = points
            .par_iter()
            .map(|p| nearest_centroid(p, &centroids))
            .collect();

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0u32; k];
        for (point, &ci) in points.iter().zip(&assignments) {
            counts[ci] += 1;
            for (s, v) in sums[ci].iter_mut().zip(point) {
                *s += v;
            }
        }

        let mut moved = false;
        for ci in 0..k {
            if counts[ci] == 0 {
                continue;
            }
            let inv = 1.0 / counts[ci] as f32;
            let updated: Vec<f32> = sums[ci].iter().map(|s| s * inv).collect();
            if updated != centroids[ci] {
                moved = true;
                centroids[ci] = updated;
            }
        }
        if !moved {
            break;
        }
    }

    centroids
}
