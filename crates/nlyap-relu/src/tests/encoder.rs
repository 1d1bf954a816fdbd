//! Exactness tests for the ReLU-to-MILP encoder.

use super::random_network;
use crate::*;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, Array1};
use nlyap_core::{uniform_sample_in_box, BoxDomain, LinearLayer, ReluNetwork};
use nlyap_milp::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Min and max of the encoded output with the input pinned to `x`.
fn pinned_output_range(encoding: &ReluEncoding, x: &Array1<f64>) -> (f64, f64) {
    let mut milp = MilpBuilder::new();
    let xs = milp.add_continuous_vars("x", x, x);
    let vars = add_mixed_integer_linear_constraints(
        &mut milp,
        &encoding.constraints,
        &vars_to_exprs(&xs),
        None,
        "s",
        "b",
        VarType::Binary,
    )
    .unwrap();
    let solver = MicroLpSolver::default();
    milp.set_objective(vars.output[0].clone(), ObjectiveSense::Minimize);
    let lo = solver.solve(&milp).unwrap().objective.unwrap();
    milp.set_objective(vars.output[0].clone(), ObjectiveSense::Maximize);
    let up = solver.solve(&milp).unwrap().objective.unwrap();
    (lo, up)
}

// ============================================================
// CONCRETE SCENARIOS
// ============================================================

#[test]
fn test_binary_only_for_unit_spanning_zero() {
    // Unit 0: 4x + 1 ∈ [-3, 5]; unit 1: 1.5x + 3.5 ∈ [2, 5] over x ∈ [-1, 1].
    let l1 = LinearLayer::new(arr2(&[[4.0], [1.5]]), Some(arr1(&[1.0, 3.5]))).unwrap();
    let l2 = LinearLayer::new(arr2(&[[1.0, 1.0]]), None).unwrap();
    let network = ReluNetwork::new(vec![l1, l2], 0.1).unwrap();
    let domain = BoxDomain::from_slices(&[-1.0], &[1.0]).unwrap();
    let encoding = ReluEncoder::output_constraint(&network, &domain, BoundMethod::Ia, &MicroLpSolver::default()).unwrap();
    assert_eq!(encoding.preactivation_bound(0, 0), nlyap_core::Bound::new(-3.0, 5.0));
    assert_eq!(encoding.preactivation_bound(0, 1), nlyap_core::Bound::new(2.0, 5.0));
    assert_eq!(encoding.num_binaries(), 1);
    assert_eq!(encoding.unit_binary[0], vec![Some(0), None]);
    assert_eq!(encoding.constraints.num_slack, 2);

    for x in [-0.9, -0.25, 0.0, 0.6] {
        let xv = arr1(&[x]);
        let expected = network.forward(xv.view()).unwrap()[0];
        let (lo, up) = pinned_output_range(&encoding, &xv);
        assert_abs_diff_eq!(lo, expected, epsilon = 1e-6);
        assert_abs_diff_eq!(up, expected, epsilon = 1e-6);
    }
}

#[test]
fn test_constant_unit_has_no_binary() {
    // A unit with zero weight has l == u and stays affine.
    let l1 = LinearLayer::new(arr2(&[[0.0], [1.0]]), Some(arr1(&[-0.5, 0.0]))).unwrap();
    let l2 = LinearLayer::new(arr2(&[[1.0, 1.0]]), None).unwrap();
    let network = ReluNetwork::new(vec![l1, l2], 0.0).unwrap();
    let domain = BoxDomain::from_slices(&[-1.0], &[1.0]).unwrap();
    let encoding = ReluEncoder::encode_with_bounds(&network, &domain, interval_bounds(&network, &domain).unwrap()).unwrap();
    assert!(encoding.preactivation_bound(0, 0).is_constant());
    assert_eq!(encoding.unit_binary[0], vec![None, Some(0)]);
}

// ============================================================
// EXACTNESS ON SAMPLES
// ============================================================

#[test]
fn test_assignment_reproduces_network() {
    for (seed, method) in [(1, BoundMethod::Ia), (2, BoundMethod::Lp), (3, BoundMethod::IaThenMip)] {
        let network = random_network(&[2, 5, 4, 2], 0.05, seed);
        let domain = BoxDomain::from_slices(&[-1.0, -2.0], &[1.5, 1.0]).unwrap();
        let encoding = ReluEncoder::output_constraint(&network, &domain, method, &MicroLpSolver::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = uniform_sample_in_box(&domain, 50, &mut rng);
        for x in samples.rows() {
            let x = x.to_owned();
            let (slack, binary) = encoding.assignment(&network, x.view()).unwrap();
            assert!(encoding.constraints.is_feasible(&x, &slack, &binary, 1e-7));
            let y = encoding.constraints.evaluate_output(&x, &slack, &binary);
            let expected = network.forward(x.view()).unwrap();
            for (a, b) in y.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_pinned_input_has_unique_output() {
    let network = random_network(&[2, 4, 4, 1], 0.1, 17);
    let domain = BoxDomain::from_slices(&[-1.0, -1.0], &[1.0, 1.0]).unwrap();
    let encoding = ReluEncoder::output_constraint(&network, &domain, BoundMethod::Ia, &MicroLpSolver::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(4);
    for x in uniform_sample_in_box(&domain, 6, &mut rng).rows() {
        let x = x.to_owned();
        let expected = network.forward(x.view()).unwrap()[0];
        let (lo, up) = pinned_output_range(&encoding, &x);
        assert_abs_diff_eq!(lo, expected, epsilon = 1e-5);
        assert_abs_diff_eq!(up, expected, epsilon = 1e-5);
    }
}

#[test]
fn test_network_at_xhat() {
    let network = random_network(&[3, 4, 1], 0.0, 23);
    let domain = BoxDomain::from_slices(&[-1.0, -1.0, -1.0], &[1.0, 1.0, 1.0]).unwrap();
    let x_star = arr1(&[0.2, -0.1, 0.3]);
    let x = arr1(&[0.7, 0.4, -0.6]);
    let indices = [0usize, 2];
    let mut milp = MilpBuilder::new();
    let xs = milp.add_continuous_vars("x", &x, &x);
    let at_xhat = compute_network_at_xhat(
        &mut milp,
        &network,
        &vars_to_exprs(&xs),
        x_star.view(),
        Some(&indices),
        &domain,
        BoundMethod::Ia,
        &MicroLpSolver::default(),
        "phi_xhat",
    )
    .unwrap();
    milp.set_objective(at_xhat.output[0].clone(), ObjectiveSense::Maximize);
    let sol = MicroLpSolver::default().solve(&milp).unwrap();
    let expected = network
        .forward(xhat(x.view(), x_star.view(), Some(&indices)).view())
        .unwrap()[0];
    assert_abs_diff_eq!(sol.objective.unwrap(), expected, epsilon = 1e-6);

    let mut milp = MilpBuilder::new();
    let xs = milp.add_continuous_vars("x", &x, &x);
    let constant = compute_network_at_xhat(
        &mut milp,
        &network,
        &vars_to_exprs(&xs),
        x_star.view(),
        None,
        &domain,
        BoundMethod::Ia,
        &MicroLpSolver::default(),
        "phi_xstar",
    )
    .unwrap();
    assert!(constant.vars.is_none());
    assert_abs_diff_eq!(
        constant.output[0].constant_term(),
        network.forward(x_star.view()).unwrap()[0],
        epsilon = 1e-12
    );
}
