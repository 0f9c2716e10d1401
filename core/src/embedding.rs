use sha2::{Digest, Sha256};

/// Pseudo-embedding for the local fallback embedder and tests. The model id
/// and text seed a xorshift64* generator whose stream fills the vector, and
/// the result is L2-normalized so cosine comparisons are well conditioned
/// regardless of dimensionality.
pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update([0x1f]); // field separator so (id, text) pairs cannot collide
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut state = 0u64;
    for (i, byte) in digest.iter().take(8).enumerate() {
        state |= (*byte as u64) << (8 * i);
    }
    // xorshift needs a non-zero state.
    state |= 1;

    let mut out = Vec::with_capacity(dims);
    for _ in 0..dims {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let unit = (state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11) as f64
            / (1u64 << 53) as f64;
        out.push((unit * 2.0 - 1.0) as f32);
    }

    let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut out {
            *value /= norm;
        }
    }

    out
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_reproduce_the_same_vector() {
        let a = deterministic_embedding("hello", "local-hash@1", 8);
        let b = deterministic_embedding("hello", "local-hash@1", 8);
        assert_eq!(a, b);
    }

    #[test]
    fn model_identity_changes_the_stream() {
        let a = deterministic_embedding("hello", "local-hash@1", 8);
        let b = deterministic_embedding("hello", "local-hash@2", 8);
        assert_ne!(a, b);
    }

    #[test]
    fn vectors_come_out_unit_norm() {
        let v = deterministic_embedding("hello", "local-hash@1", 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm was {}", norm);
    }

    #[test]
    fn requested_dimensionality_is_honored() {
        assert_eq!(deterministic_embedding("x", "m", 17).len(), 17);
        assert_eq!(deterministic_embedding("x", "m", 0).len(), 1);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = deterministic_embedding("hello", "local-hash@1", 16);
        let score = cosine_similarity(&v, &v).unwrap();
        assert!((score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_rejects_mismatched_dims() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0]).is_none());
    }
}
