//! Shared distance kernels
//!
//! Backends rank by *distance* in the metric's own direction (ascending for
//! L2, descending for inner product). Graph search internally wants a single
//! "higher is better" score, provided by [`score`].
//!
//! No implicit normalization of vectors: inputs are used as-is.

use vdb_core::MetricType;

/// Distance between two vectors under `metric`
///
/// L2 returns the squared Euclidean distance; inner product returns the
/// dot product.
pub fn distance(a: &[f32], b: &[f32], metric: MetricType) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Dimension mismatch in distance computation");
    match metric {
        MetricType::L2 => l2_squared(a, b),
        MetricType::InnerProduct => inner_product(a, b),
    }
}

/// Similarity score where higher always means closer
pub fn score(a: &[f32], b: &[f32], metric: MetricType) -> f32 {
    score_from_distance(distance(a, b, metric), metric)
}

/// Convert a metric distance into a higher-is-better score
pub fn score_from_distance(d: f32, metric: MetricType) -> f32 {
    match metric {
        MetricType::L2 => -d,
        MetricType::InnerProduct => d,
    }
}

/// Inverse of [`score_from_distance`]
pub fn distance_from_score(s: f32, metric: MetricType) -> f32 {
    match metric {
        MetricType::L2 => -s,
        MetricType::InnerProduct => s,
    }
}

/// Squared Euclidean distance
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Dot product
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Sort `(label, distance)` pairs best-first, ties broken by label ascending
pub fn rank(hits: &mut [(u64, f32)], metric: MetricType) {
    hits.sort_by(|a, b| {
        let (sa, sb) = (
            score_from_distance(a.1, metric),
            score_from_distance(b.1, metric),
        );
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_identical_is_zero() {
        let v = [1.0, 2.0, 3.0];
        assert_eq!(l2_squared(&v, &v), 0.0);
    }

    #[test]
    fn test_l2_is_squared() {
        assert_eq!(l2_squared(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }

    #[test]
    fn test_inner_product() {
        assert_eq!(inner_product(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }

    #[test]
    fn test_score_is_higher_for_closer() {
        let q = [1.0, 0.0];
        let near = [0.9, 0.1];
        let far = [-1.0, 0.0];
        for metric in [MetricType::L2, MetricType::InnerProduct] {
            assert!(score(&q, &near, metric) > score(&q, &far, metric));
        }
    }

    #[test]
    fn test_score_distance_inverse() {
        for metric in [MetricType::L2, MetricType::InnerProduct] {
            let d = 2.5;
            assert_eq!(distance_from_score(score_from_distance(d, metric), metric), d);
        }
    }

    #[test]
    fn test_rank_l2_ascending_with_tie_break() {
        let mut hits = vec![(5, 1.0), (2, 0.5), (1, 1.0)];
        rank(&mut hits, MetricType::L2);
        assert_eq!(hits, vec![(2, 0.5), (1, 1.0), (5, 1.0)]);
    }

    #[test]
    fn test_rank_ip_descending() {
        let mut hits = vec![(1, 0.1), (2, 0.9)];
        rank(&mut hits, MetricType::InnerProduct);
        assert_eq!(hits[0].0, 2);
    }
}
