//! Property-based exactness tests: pinning the argument of an encoding must
//! leave exactly one feasible output, equal to the piecewise function.

use crate::*;
use nlyap_core::Bound;
use proptest::prelude::*;

/// Tolerance for the LP solver's primal values.
const SOLVER_TOLERANCE: f64 = 1e-5;

/// Strategy for a bound strictly spanning zero.
fn spanning_bound() -> impl Strategy<Value = (f64, f64)> {
    (-10.0f64..-0.01, 0.01f64..10.0)
}

/// Output range reachable when the argument is pinned: (min, max).
fn pinned_range(milp: &mut MilpBuilder, output: &LinExpr) -> (f64, f64) {
    let solver = MicroLpSolver::default();
    milp.set_objective(output.clone(), ObjectiveSense::Minimize);
    let lo = solver.solve(milp).unwrap().objective.unwrap();
    milp.set_objective(output.clone(), ObjectiveSense::Maximize);
    let up = solver.solve(milp).unwrap().objective.unwrap();
    (lo, up)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn leaky_relu_is_exact((l, u) in spanning_bound(), t in 0.0f64..=1.0, slope in 0.0f64..0.9) {
        let z_value = l + t * (u - l);
        let mut milp = MilpBuilder::new();
        let z = milp.add_var("z", z_value, z_value, VarType::Continuous);
        let unit = add_leaky_relu(&mut milp, &LinExpr::var(z), Bound::new(l, u), slope, "u").unwrap();
        let expected = z_value.max(slope * z_value);
        let (lo, up) = pinned_range(&mut milp, &unit.output);
        prop_assert!((lo - expected).abs() < SOLVER_TOLERANCE, "min {} vs {}", lo, expected);
        prop_assert!((up - expected).abs() < SOLVER_TOLERANCE, "max {} vs {}", up, expected);
    }

    #[test]
    fn saturation_is_exact(pre in -5.0f64..5.0, lo in -3.0f64..0.0, width in 0.0f64..3.0) {
        let up = lo + width;
        let mut milp = MilpBuilder::new();
        let u = milp.add_var("u", pre, pre, VarType::Continuous);
        let sat = add_saturation(&mut milp, &LinExpr::var(u), Bound::new(-5.0, 5.0), lo, up, "sat").unwrap();
        let expected = pre.clamp(lo, up);
        let (min, max) = pinned_range(&mut milp, &sat.output);
        prop_assert!((min - expected).abs() < SOLVER_TOLERANCE);
        prop_assert!((max - expected).abs() < SOLVER_TOLERANCE);
    }
}
