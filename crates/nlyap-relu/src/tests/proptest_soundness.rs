//! Property-based soundness tests for bound propagation.
//!
//! For every sampled input in the box, the network output lies inside the
//! IA, LP and MIP bounds, and the bounds nest: MIP ⊆ LP ⊆ IA.

use super::random_network;
use crate::*;
use nlyap_core::{uniform_sample_in_box, BoxDomain};
use nlyap_milp::MicroLpSolver;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Tolerance for solver round-off in bound comparisons.
const FP_TOLERANCE: f64 = 1e-6;

/// Strategy for a valid interval [lower, upper] with lower < upper.
fn valid_interval(range: f64) -> impl Strategy<Value = (f64, f64)> {
    (-range..range, 0.05..range).prop_map(|(a, w)| (a, a + w))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn bounds_are_sound_and_nested(
        seed in 0u64..10_000,
        slope in prop::sample::select(vec![0.0, 0.01, 0.1]),
        i0 in valid_interval(2.0),
        i1 in valid_interval(2.0),
    ) {
        let network = random_network(&[2, 3, 3, 1], slope, seed);
        let domain = BoxDomain::from_slices(&[i0.0, i1.0], &[i0.1, i1.1]).unwrap();
        let solver = MicroLpSolver::default();
        let ia = propagate_bounds(&network, &domain, BoundMethod::Ia, &solver).unwrap();
        let lp = propagate_bounds(&network, &domain, BoundMethod::Lp, &solver).unwrap();
        let mip = propagate_bounds(&network, &domain, BoundMethod::Mip, &solver).unwrap();
        let ia_mip = propagate_bounds(&network, &domain, BoundMethod::IaThenMip, &solver).unwrap();
        prop_assert!(lp.is_within(&ia, FP_TOLERANCE));
        prop_assert!(mip.is_within(&lp, FP_TOLERANCE));
        prop_assert!(ia_mip.is_within(&ia, FP_TOLERANCE));

        let mut rng = StdRng::seed_from_u64(seed);
        for x in uniform_sample_in_box(&domain, 40, &mut rng).rows() {
            let trace = network.forward_trace(x).unwrap();
            for bounds in [&ia, &lp, &mip, &ia_mip] {
                for (k, z) in trace.preactivations.iter().enumerate() {
                    for (j, &v) in z.iter().enumerate() {
                        let b = bounds.preactivation[k][j];
                        prop_assert!(v >= b.lower - FP_TOLERANCE && v <= b.upper + FP_TOLERANCE);
                    }
                }
                let y = trace.output[0];
                prop_assert!(y >= bounds.output[0].lower - FP_TOLERANCE);
                prop_assert!(y <= bounds.output[0].upper + FP_TOLERANCE);
            }
        }
    }
}
