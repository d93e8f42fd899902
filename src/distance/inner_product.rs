//! Inner product distance

/// Dot product of two vectors
///
/// # Panics
/// Panics if vectors have different dimensions
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Inner product distance (1 - dot), meaningful for normalized vectors
#[inline]
pub fn inner_product_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot_product(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }

    #[test]
    fn test_inner_product_distance_orders_by_similarity() {
        let q = [1.0, 0.0];
        assert!(inner_product_distance(&q, &[0.9, 0.1]) < inner_product_distance(&q, &[0.1, 0.9]));
    }
}
