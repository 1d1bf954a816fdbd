//! Hybrid linear systems: mode selection and exactness of the one-hot encoding.

use super::{assert_all_close, pinned_step, solver};
use crate::*;
use ndarray::{arr1, arr2, Array1};
use nlyap_core::BoxDomain;
use nlyap_milp::{LinExpr, MilpBuilder, MilpSolver, ObjectiveSense, VarType};

/// Two modes split on the sign of x₀, continuous across x₀ = 0.
fn two_mode_system() -> AutonomousHybridLinearSystem {
    let mut system = AutonomousHybridLinearSystem::new(BoxDomain::from_slices(&[-1.0, -1.0], &[1.0, 1.0]).unwrap())
        .unwrap();
    system
        .add_mode(
            arr2(&[[0.5, 0.1], [0.0, 0.8]]),
            arr1(&[0.0, 0.0]),
            arr2(&[[1.0, 0.0]]),
            arr1(&[0.0]),
        )
        .unwrap();
    system
        .add_mode(
            arr2(&[[0.9, 0.1], [-0.2, 0.8]]),
            arr1(&[0.0, 0.0]),
            arr2(&[[-1.0, 0.0]]),
            arr1(&[0.0]),
        )
        .unwrap();
    system
}

// ============================================================
// EVALUATION
// ============================================================

#[test]
fn test_mode_selection() {
    let system = two_mode_system();
    assert_eq!(system.mode(arr1(&[-0.5, 0.2]).view()).unwrap(), Some(0));
    assert_eq!(system.mode(arr1(&[0.5, 0.2]).view()).unwrap(), Some(1));
    assert_eq!(system.active_modes(arr1(&[0.0, 0.3]).view()).unwrap(), vec![0, 1]);
}

#[test]
fn test_possible_dx_on_shared_face() {
    let system = two_mode_system();
    let dx = system.possible_dx(arr1(&[0.0, 0.5]).view()).unwrap();
    assert_eq!(dx.len(), 2);
    assert_all_close(&dx[0], &dx[1], 1e-12);
    assert_eq!(system.possible_dx(arr1(&[0.4, 0.5]).view()).unwrap().len(), 1);
}

#[test]
fn test_uncovered_state_is_reported() {
    let mut system = AutonomousHybridLinearSystem::new(BoxDomain::from_slices(&[-1.0], &[1.0]).unwrap()).unwrap();
    system
        .add_mode(arr2(&[[0.5]]), arr1(&[0.0]), arr2(&[[1.0]]), arr1(&[0.0]))
        .unwrap();
    assert_eq!(system.mode(arr1(&[0.5]).view()).unwrap(), None);
    assert!(system.possible_dx(arr1(&[0.5]).view()).unwrap().is_empty());
    let err = system.step_forward(arr1(&[0.5]).view()).unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn test_mode_rejects_bad_dimensions() {
    let mut system = two_mode_system();
    let err = system
        .add_mode(arr2(&[[1.0]]), arr1(&[0.0, 0.0]), arr2(&[[1.0, 0.0]]), arr1(&[0.0]))
        .unwrap_err();
    assert!(err.is_configuration_error());
}

#[test]
fn test_hybrid_needs_finite_box() {
    let domain = BoxDomain::from_slices(&[f64::NEG_INFINITY], &[1.0]).unwrap();
    assert!(AutonomousHybridLinearSystem::new(domain).is_err());
}

// ============================================================
// MILP EXACTNESS
// ============================================================

#[test]
fn test_autonomous_encoding_is_exact() {
    let system = two_mode_system();
    for x in [[-0.7, 0.4], [-0.1, -0.9], [0.3, 0.6], [0.95, -0.2]] {
        let x = arr1(&x);
        let expected = system.step_forward(x.view()).unwrap();
        let (lo, up) = pinned_step(&system, &x);
        assert_all_close(&lo, &expected, 1e-6);
        assert_all_close(&up, &expected, 1e-6);
    }
}

#[test]
fn test_encoding_has_one_binary_per_mode() {
    let system = two_mode_system();
    let (bundle, bounds) = system.mixed_integer_constraints().unwrap();
    assert_eq!(bundle.num_binary, 2);
    assert_eq!(bounds.len(), 2);
    // x₀' ranges over the union of both mode images.
    assert!(bounds[0].lower <= -0.6 && bounds[0].upper >= 1.0);
}

#[test]
fn test_controlled_encoding_is_exact() {
    let mut system = HybridLinearSystem::new(
        BoxDomain::from_slices(&[-1.0], &[1.0]).unwrap(),
        BoxDomain::from_slices(&[-2.0], &[2.0]).unwrap(),
    )
    .unwrap();
    // Mode 0 on x + u <= 0, mode 1 on x + u >= 0.
    system
        .add_mode(arr2(&[[1.0]]), arr2(&[[0.5]]), arr1(&[0.1]), arr2(&[[1.0, 1.0]]), arr1(&[0.0]))
        .unwrap();
    system
        .add_mode(arr2(&[[0.5]]), arr2(&[[1.0]]), arr1(&[0.1]), arr2(&[[-1.0, -1.0]]), arr1(&[0.0]))
        .unwrap();
    for (x, u) in [(0.5, -1.5), (-0.5, 1.0), (0.9, 0.3), (-0.2, -1.9)] {
        let (xv, uv) = (arr1(&[x]), arr1(&[u]));
        let expected = system.step_forward(xv.view(), uv.view()).unwrap();

        let mut milp = MilpBuilder::new();
        let xs = milp.add_continuous_vars("x", &xv, &xv);
        let us = milp.add_continuous_vars("u", &uv, &uv);
        let x_next = milp.add_free_vars("x_next", 1);
        let to_exprs = |vs: &[nlyap_milp::VarId]| -> Vec<LinExpr> { vs.iter().map(|&v| LinExpr::var(v)).collect() };
        system
            .add_dynamics_constraint(&mut milp, &to_exprs(&xs), &to_exprs(&us), &x_next, &solver(), VarType::Binary, "h")
            .unwrap();
        for sense in [ObjectiveSense::Minimize, ObjectiveSense::Maximize] {
            milp.set_objective(LinExpr::var(x_next[0]), sense);
            let sol = solver().solve(&milp).unwrap();
            assert_all_close(&sol.values_of(&x_next), &expected, 1e-6);
        }
    }
}

#[test]
fn test_jacobian_and_active_faces() {
    let system = two_mode_system();
    let jac = system.jacobian(arr1(&[0.5, 0.0]).view()).unwrap();
    assert_eq!(jac, arr2(&[[0.9, 0.1], [-0.2, 0.8]]));
    let faces = system.active_constraint_gradients(arr1(&[-1e-12, 0.3]).view(), 1e-9).unwrap();
    assert_eq!(faces, vec![Array1::from(vec![1.0, 0.0])]);
}
