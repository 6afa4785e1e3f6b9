//! 8-bit scalar quantization
//!
//! Each vector is compressed to one byte per component by mapping
//! `[min, max]` linearly onto `[0, 255]`. `min` and `scale = (max - min) / 255`
//! are kept per vector for reconstruction. Distances are computed against the
//! reconstructed values without allocating.

use serde::{Deserialize, Serialize};

use vdb_core::MetricType;

/// Per-vector reconstruction parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarParams {
    /// Smallest component value
    pub min: f32,
    /// Step between adjacent code values
    pub scale: f32,
}

/// Quantize `vector` into `out`, returning its reconstruction parameters
pub fn encode_into(vector: &[f32], out: &mut Vec<u8>) -> ScalarParams {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &v in vector {
        min = min.min(v);
        max = max.max(v);
    }
    if vector.is_empty() {
        return ScalarParams { min: 0.0, scale: 0.0 };
    }

    let range = max - min;
    if range < f32::EPSILON {
        out.extend(std::iter::repeat(0u8).take(vector.len()));
        return ScalarParams { min, scale: 0.0 };
    }
    let inv_scale = 255.0 / range;
    out.extend(
        vector
            .iter()
            .map(|&v| ((v - min) * inv_scale).round().clamp(0.0, 255.0) as u8),
    );
    ScalarParams {
        min,
        scale: range / 255.0,
    }
}

/// Reconstruct one component
#[inline]
pub fn decode_component(code: u8, params: ScalarParams) -> f32 {
    params.min + code as f32 * params.scale
}

/// Reconstruct a full vector (lossy)
pub fn decode(codes: &[u8], params: ScalarParams) -> Vec<f32> {
    codes.iter().map(|&c| decode_component(c, params)).collect()
}

/// Distance between an exact query and a quantized vector
pub fn distance_to_codes(query: &[f32], codes: &[u8], params: ScalarParams, metric: MetricType) -> f32 {
    match metric {
        MetricType::L2 => query
            .iter()
            .zip(codes)
            .map(|(&q, &c)| {
                let d = q - decode_component(c, params);
                d * d
            })
            .sum(),
        MetricType::InnerProduct => query
            .iter()
            .zip(codes)
            .map(|(&q, &c)| q * decode_component(c, params))
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_constant_vector_is_exact() {
        let mut codes = Vec::new();
        let params = encode_into(&[3.0, 3.0, 3.0], &mut codes);
        assert_eq!(decode(&codes, params), vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_extremes_are_exact() {
        let mut codes = Vec::new();
        let params = encode_into(&[-1.0, 0.0, 1.0], &mut codes);
        assert_eq!(codes[0], 0);
        assert_eq!(codes[2], 255);
        let decoded = decode(&codes, params);
        assert!((decoded[0] + 1.0).abs() < 1e-6);
        assert!((decoded[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_distance_to_own_codes_is_small() {
        let v = [0.1, -0.4, 0.9, 0.3];
        let mut codes = Vec::new();
        let params = encode_into(&v, &mut codes);
        assert!(distance_to_codes(&v, &codes, params, MetricType::L2) < 1e-4);
    }

    proptest! {
        #[test]
        fn prop_reconstruction_error_bounded(v in prop::collection::vec(-100.0f32..100.0, 1..32)) {
            let mut codes = Vec::new();
            let params = encode_into(&v, &mut codes);
            let decoded = decode(&codes, params);
            for (a, b) in v.iter().zip(decoded.iter()) {
                // half a quantization step plus float slack
                prop_assert!((a - b).abs() <= params.scale * 0.5 + 1e-3);
            }
        }
    }
}
