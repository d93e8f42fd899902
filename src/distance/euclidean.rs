//! Euclidean distance computation

/// Compute Euclidean distance between two vectors
///
/// # Panics
/// Panics if vectors have different dimensions
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    euclidean_distance_squared(a, b).sqrt()
}

/// Compute squared Euclidean distance (avoids sqrt for comparison purposes)
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    // Four independent accumulators let the compiler vectorize the loop
    let mut acc = [0.0f32; 4];
    let chunks_a = a.chunks_exact(4);
    let chunks_b = b.chunks_exact(4);
    let tail_a = chunks_a.remainder();
    let tail_b = chunks_b.remainder();

    for (ca, cb) in chunks_a.zip(chunks_b) {
        for lane in 0..4 {
            let diff = ca[lane] - cb[lane];
            acc[lane] += diff * diff;
        }
    }

    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for (x, y) in tail_a.iter().zip(tail_b) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((euclidean_distance(&a, &b) - 5.196152).abs() < 0.001);
    }

    #[test]
    fn test_euclidean_distance_squared_with_tail() {
        let a: Vec<f32> = (0..7).map(|i| i as f32).collect();
        let b = vec![0.0; 7];
        // 0 + 1 + 4 + 9 + 16 + 25 + 36
        assert_eq!(euclidean_distance_squared(&a, &b), 91.0);
    }

    #[test]
    #[should_panic(expected = "Vector dimensions must match")]
    fn test_euclidean_distance_dimension_mismatch() {
        euclidean_distance(&[1.0, 2.0], &[1.0]);
    }
}
