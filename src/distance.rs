//! Distance primitives for dense vectors.
//!
//! The forest only speaks Euclidean distance. Internally everything is
//! compared on the squared distance; the square root is taken once, when a
//! result is reported.

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Squared Euclidean distance.
///
/// If dimensions mismatch, this returns `f32::INFINITY` (so it is never selected as a
/// nearest neighbor).
#[inline]
#[must_use]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Euclidean distance.
#[inline]
#[must_use]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

/// Signed distance of `point` to the hyperplane `{x : <normal, x> = offset}`.
///
/// Exact when `normal` has unit length, which is how the builder stores it.
#[inline]
#[must_use]
pub fn margin(normal: &[f32], offset: f32, point: &[f32]) -> f32 {
    dot(normal, point) - offset
}

/// Whether every component is finite.
#[inline]
pub(crate) fn is_finite(v: &[f32]) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squared_distance_matches_hand_computation() {
        let a = [0.0_f32, 0.0, 0.0, 0.0];
        let b = [1.0_f32, 2.0, 0.0, 2.0];
        assert_eq!(l2_distance_squared(&a, &b), 9.0);
        assert_eq!(l2_distance(&a, &b), 3.0);
    }

    #[test]
    fn mismatched_lengths_are_infinitely_far() {
        assert!(l2_distance_squared(&[1.0], &[1.0, 2.0]).is_infinite());
    }

    #[test]
    fn margin_sign_follows_normal() {
        // Plane x = 0.5 with unit normal along +x.
        let normal = [1.0_f32, 0.0];
        assert!(margin(&normal, 0.5, &[1.0, 7.0]) > 0.0);
        assert!(margin(&normal, 0.5, &[0.0, -3.0]) < 0.0);
        assert_eq!(margin(&normal, 0.5, &[0.5, 100.0]), 0.0);
    }

    #[test]
    fn finiteness_check() {
        assert!(is_finite(&[0.0, -1.0, 3.5]));
        assert!(!is_finite(&[0.0, f32::NAN]));
        assert!(!is_finite(&[f32::INFINITY]));
    }
}
