//! Uniform sampling in and on box domains.

use crate::bound::BoxDomain;
use ndarray::Array2;
use rand::Rng;

/// `n` points drawn uniformly from the box, one per row.
///
/// Coordinates with an infinite side are sampled from the finite part of the
/// box only; callers sample state boxes, which are finite.
pub fn uniform_sample_in_box<R: Rng>(domain: &BoxDomain, n: usize, rng: &mut R) -> Array2<f64> {
    let dim = domain.dim();
    Array2::from_shape_fn((n, dim), |(_, j)| sample_coordinate(domain, j, rng))
}

/// `n` points drawn on the boundary: pick a face uniformly, then sample the face.
pub fn uniform_sample_on_box_boundary<R: Rng>(
    domain: &BoxDomain,
    n: usize,
    rng: &mut R,
) -> Array2<f64> {
    let dim = domain.dim();
    let mut out = uniform_sample_in_box(domain, n, rng);
    if dim == 0 {
        return out;
    }
    for mut row in out.rows_mut() {
        let face = rng.gen_range(0..2 * dim);
        let axis = face / 2;
        row[axis] = if face % 2 == 0 {
            domain.lo()[axis]
        } else {
            domain.up()[axis]
        };
    }
    out
}

fn sample_coordinate<R: Rng>(domain: &BoxDomain, j: usize, rng: &mut R) -> f64 {
    let (lo, up) = (domain.lo()[j], domain.up()[j]);
    if lo < up && lo.is_finite() && up.is_finite() {
        rng.gen_range(lo..up)
    } else if lo.is_finite() {
        lo
    } else {
        up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_samples_stay_in_box() {
        let domain = BoxDomain::from_slices(&[-1.0, 2.0, 0.0], &[1.0, 3.0, 0.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let samples = uniform_sample_in_box(&domain, 200, &mut rng);
        assert_eq!(samples.dim(), (200, 3));
        for row in samples.axis_iter(Axis(0)) {
            assert!(domain.contains(row, 0.0));
        }
    }

    #[test]
    fn test_boundary_samples_touch_a_face() {
        let domain = BoxDomain::from_slices(&[-1.0, -2.0], &[1.0, 2.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let samples = uniform_sample_on_box_boundary(&domain, 100, &mut rng);
        for row in samples.axis_iter(Axis(0)) {
            assert!(domain.contains(row, 0.0));
            let on_face = (0..2).any(|j| row[j] == domain.lo()[j] || row[j] == domain.up()[j]);
            assert!(on_face);
        }
    }
}
