//! Property-based checks of the sample-loss reductions.
//!
//! For nonnegative losses, `mean <= max <= ‖l‖₄ <= n^¼ · max`, and the
//! reduction weights are the derivative of the reduced value.

use crate::*;
use proptest::prelude::*;

const FP_TOLERANCE: f64 = 1e-9;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reductions_are_ordered(losses in prop::collection::vec(0.0f64..10.0, 1..20)) {
        let (mean, _) = Reduction::Mean.reduce(&losses).unwrap();
        let (max, _) = Reduction::Max.reduce(&losses).unwrap();
        let (four, _) = Reduction::FourNorm.reduce(&losses).unwrap();
        let n = losses.len() as f64;
        prop_assert!(mean <= max + FP_TOLERANCE);
        prop_assert!(max <= four + FP_TOLERANCE);
        prop_assert!(four <= n.powf(0.25) * max + FP_TOLERANCE);
    }

    #[test]
    fn weights_are_directional_derivatives(
        losses in prop::collection::vec(0.1f64..10.0, 1..10),
        direction in prop::collection::vec(-1.0f64..1.0, 10),
    ) {
        for reduction in [Reduction::Mean, Reduction::FourNorm] {
            let (value, weights) = reduction.reduce(&losses).unwrap();
            let h = 1e-6;
            let shifted: Vec<f64> = losses.iter().zip(&direction).map(|(l, d)| l + h * d).collect();
            let (moved, _) = reduction.reduce(&shifted).unwrap();
            let predicted: f64 = weights.iter().zip(&direction).map(|(w, d)| w * d).sum();
            prop_assert!(((moved - value) / h - predicted).abs() <= 1e-4);
        }
    }
}
