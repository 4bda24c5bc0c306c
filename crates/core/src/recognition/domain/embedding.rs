//! Face embedding vector math.

/// Cosine similarity in `[-1, 1]`. Zero-length or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Element-wise mean. `None` for an empty set or differing dimensions.
pub fn mean_embedding(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let dim = first.len();
    if embeddings.iter().any(|e| e.len() != dim) {
        return None;
    }
    let mut sum = vec![0.0f64; dim];
    for embedding in embeddings {
        for (acc, x) in sum.iter_mut().zip(embedding) {
            *acc += *x as f64;
        }
    }
    let n = embeddings.len() as f64;
    Some(sum.into_iter().map(|s| (s / n) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[rstest]
    #[case(vec![0.6, 0.8], vec![0.6, 0.8], 1.0)]
    #[case(vec![1.0, 0.0], vec![0.0, 1.0], 0.0)]
    #[case(vec![1.0, 0.0], vec![-1.0, 0.0], -1.0)]
    #[case(vec![3.0, 4.0], vec![6.0, 8.0], 1.0)]
    fn test_cosine_similarity(#[case] a: Vec<f32>, #[case] b: Vec<f32>, #[case] expected: f64) {
        assert_relative_eq!(cosine_similarity(&a, &b), expected, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_l2_normalize_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert_relative_eq!(v[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(v[1], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mean_embedding() {
        let mean = mean_embedding(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![2.0, 2.0]]).unwrap();
        assert_relative_eq!(mean[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(mean[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mean_embedding_rejects_empty_and_ragged() {
        assert!(mean_embedding(&[]).is_none());
        assert!(mean_embedding(&[vec![1.0], vec![1.0, 2.0]]).is_none());
    }
}
