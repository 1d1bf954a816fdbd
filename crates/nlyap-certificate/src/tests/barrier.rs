//! Control barrier functions: values, derivatives, MILPs and gradients.

use super::{
    assert_slices_close, central_difference, double_integrator, random_network, scalar_kinks, solver, unit_box,
    with_params,
};
use crate::*;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, Array1, ArrayView1};
use nlyap_core::{uniform_sample_in_box, uniform_sample_on_box_boundary, BoxDomain, ReluNetwork};
use nlyap_milp::{MilpSolver, VarType};
use nlyap_system::{ControlAffineSystem, LinearSystem};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn descriptor() -> BarrierDescriptor {
    BarrierDescriptor::new(arr1(&[0.0, 0.0]), 0.5).with_inf_norm(
        InfNormTerm::new(arr2(&[[1.0, 0.5], [-0.5, 1.0]]), arr1(&[0.1, -0.2])).unwrap(),
    )
}

/// `ẋ = −x + u` on `[-1, 1]` with `u ∈ [-1, 1]`.
fn scalar_system() -> LinearSystem {
    LinearSystem::new(
        arr2(&[[-1.0]]),
        arr2(&[[1.0]]),
        unit_box(1),
        BoxDomain::from_slices(&[-1.0], &[1.0]).unwrap(),
    )
    .unwrap()
}

/// `(h(x + t v) − h(x − t v)) / 2t`.
fn directional(barrier: &ControlBarrier<LinearSystem>, desc: &BarrierDescriptor, x: ArrayView1<f64>, v: &Array1<f64>) -> f64 {
    let t = 1e-6;
    let plus = &x + &(v * t);
    let minus = &x - &(v * t);
    (barrier.barrier_value(plus.view(), desc).unwrap() - barrier.barrier_value(minus.view(), desc).unwrap()) / (2.0 * t)
}

// ============================================================
// POINTWISE
// ============================================================

#[test]
fn test_value_includes_inf_norm() {
    let network = random_network(&[2, 4, 1], 0.1, 1);
    let barrier = ControlBarrier::new(double_integrator(unit_box(2)), network.clone()).unwrap();
    let desc = descriptor();
    let x = arr1(&[0.4, -0.2]);
    let phi = |x: ArrayView1<f64>| network.forward(x).unwrap()[0];
    let z: Array1<f64> = arr1(&[0.4 - 0.1 - 0.1, -0.2 - 0.2 + 0.2]);
    let expected = phi(x.view()) - phi(arr1(&[0.0, 0.0]).view()) + 0.5 - z[0].abs().max(z[1].abs());
    assert_abs_diff_eq!(barrier.barrier_value(x.view(), &desc).unwrap(), expected, epsilon = 1e-12);
}

#[test]
fn test_derivative_given_action_is_directional_derivative() {
    let network = random_network(&[2, 5, 1], 0.1, 2);
    let barrier = ControlBarrier::new(double_integrator(unit_box(2)), network).unwrap();
    let desc = descriptor();
    let mut rng = StdRng::seed_from_u64(3);
    let x = uniform_sample_in_box(&unit_box(2), 8, &mut rng);
    let u = uniform_sample_in_box(&BoxDomain::from_slices(&[-2.0], &[2.0]).unwrap(), 8, &mut rng);
    let batch = barrier.barrier_derivative_given_action_batch(&x, &u, &desc, 1e-9).unwrap();
    for i in 0..x.nrows() {
        let xdot = barrier.system().dynamics(x.row(i), u.row(i)).unwrap();
        assert_abs_diff_eq!(batch[i], directional(&barrier, &desc, x.row(i), &xdot), epsilon = 1e-6);
    }
}

#[test]
fn test_derivative_semantics() {
    let network = random_network(&[2, 5, 1], 0.1, 4);
    let worst = ControlBarrier::new(double_integrator(unit_box(2)), network.clone()).unwrap();
    let best = worst.clone().with_semantics(InputSemantics::BestCase);
    let desc = descriptor();
    let mut rng = StdRng::seed_from_u64(5);
    for x in uniform_sample_in_box(&unit_box(2), 10, &mut rng).rows() {
        let rates: Vec<f64> = [-2.0, 2.0]
            .iter()
            .map(|&u| directional(&worst, &desc, x, &worst.system().dynamics(x, arr1(&[u]).view()).unwrap()))
            .collect();
        let hdot_worst = worst.barrier_derivative(x, &desc, 1e-9).unwrap();
        let hdot_best = best.barrier_derivative(x, &desc, 1e-9).unwrap();
        assert_eq!(hdot_worst.len(), 1);
        assert_abs_diff_eq!(hdot_worst[0], rates[0].min(rates[1]), epsilon = 1e-6);
        assert_abs_diff_eq!(hdot_best[0], rates[0].max(rates[1]), epsilon = 1e-6);
    }
}

// ============================================================
// VALUE MILP
// ============================================================

#[test]
fn test_value_milp_dominates_unsafe_samples() {
    let network = random_network(&[2, 6, 1], 0.1, 6);
    let barrier = ControlBarrier::new(double_integrator(unit_box(2)), network).unwrap();
    let desc = descriptor();
    let region = StateRegion::Polytope {
        a: arr2(&[[-1.0, 0.0]]),
        b: arr1(&[-0.5]),
    };
    let problem = barrier
        .barrier_value_as_milp(&desc, &region, VarType::Binary, &solver())
        .unwrap();
    let sol = solver().solve(&problem.milp).unwrap();
    let optimum = sol.optimal_objective("unsafe region").unwrap();
    let x = sol.values_of(&problem.x);
    assert!(x[0] >= 0.5 - 1e-6);
    assert_abs_diff_eq!(optimum, barrier.barrier_value(x.view(), &desc).unwrap(), epsilon = 1e-5);

    let unsafe_box = BoxDomain::from_slices(&[0.5, -1.0], &[1.0, 1.0]).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for x in uniform_sample_in_box(&unsafe_box, 200, &mut rng).rows() {
        assert!(barrier.barrier_value(x, &desc).unwrap() <= optimum + 1e-6);
    }
}

#[test]
fn test_value_milp_on_box_boundary() {
    let network = random_network(&[2, 6, 1], 0.1, 8);
    let barrier = ControlBarrier::new(double_integrator(unit_box(2)), network).unwrap();
    let desc = descriptor();
    let inner = BoxDomain::from_slices(&[-0.5, -0.5], &[0.5, 0.5]).unwrap();
    let problem = barrier
        .barrier_value_as_milp(&desc, &StateRegion::BoxBoundary(inner.clone()), VarType::Binary, &solver())
        .unwrap();
    let sol = solver().solve(&problem.milp).unwrap();
    let optimum = sol.optimal_objective("boundary").unwrap();
    let x = sol.values_of(&problem.x);
    let on_face = (0..2).any(|i| (x[i].abs() - 0.5).abs() <= 1e-6);
    assert!(on_face, "MILP solution {x} is not on the box boundary");

    let mut rng = StdRng::seed_from_u64(9);
    for x in uniform_sample_on_box_boundary(&inner, 200, &mut rng).rows() {
        assert!(barrier.barrier_value(x, &desc).unwrap() <= optimum + 1e-6);
    }
}

/// Largest h over `[lo, 1]` for a scalar barrier, from its breakpoints.
fn exact_scalar_value_optimum(network: &ReluNetwork, desc: &BarrierDescriptor, lo: f64) -> f64 {
    let barrier = ControlBarrier::new(scalar_system(), network.clone()).unwrap();
    let mut candidates = vec![lo, 1.0];
    candidates.extend(scalar_kinks(network));
    if let Some(term) = &desc.inf_norm {
        candidates.push(term.p[0] / term.r[[0, 0]]);
    }
    candidates
        .into_iter()
        .filter(|&x| x >= lo && x <= 1.0)
        .map(|x| barrier.barrier_value(arr1(&[x]).view(), desc).unwrap())
        .fold(f64::NEG_INFINITY, f64::max)
}

#[test]
fn test_value_milp_gradient_matches_finite_difference() {
    let desc = BarrierDescriptor::new(arr1(&[0.0]), 0.2)
        .with_inf_norm(InfNormTerm::new(arr2(&[[2.0]]), arr1(&[0.8])).unwrap());
    let region = StateRegion::Polytope {
        a: arr2(&[[-1.0]]),
        b: arr1(&[-0.2]),
    };
    for seed in [10, 20, 30, 40] {
        let network = random_network(&[1, 4, 1], 0.1, seed);
        let barrier = ControlBarrier::new(scalar_system(), network.clone()).unwrap();
        let problem = barrier
            .barrier_value_as_milp(&desc, &region, VarType::Binary, &solver())
            .unwrap();
        let sol = solver().solve(&problem.milp).unwrap();
        let optimum = sol.optimal_objective("unsafe region").unwrap();
        assert_abs_diff_eq!(optimum, exact_scalar_value_optimum(&network, &desc, 0.2), epsilon = 1e-6);

        let gradient = barrier.value_milp_gradient(&desc, &problem, &sol).unwrap().flatten();
        let fd = central_difference(&network.params(), 1e-6, |p| {
            exact_scalar_value_optimum(&with_params(&network, p), &desc, 0.2)
        });
        assert_slices_close(&gradient, &fd, 1e-4);
    }
}

// ============================================================
// DERIVATIVE MILP
// ============================================================

#[test]
fn test_derivative_milp_is_exact_at_a_pinned_state() {
    let x0 = arr1(&[0.35, -0.55]);
    let network = random_network(&[2, 6, 1], 0.1, 11);
    let desc = descriptor();
    let epsilon = 0.3;
    for semantics in [InputSemantics::WorstCase, InputSemantics::BestCase] {
        let barrier = ControlBarrier::new(double_integrator(BoxDomain::point(x0.view())), network.clone())
            .unwrap()
            .with_semantics(semantics);
        let problem = barrier
            .barrier_derivative_as_milp(&desc, epsilon, VarType::Binary, &solver())
            .unwrap();
        let optimum = solver()
            .solve(&problem.milp)
            .unwrap()
            .optimal_objective("barrier derivative")
            .unwrap();
        let hdot = barrier.barrier_derivative(x0.view(), &desc, 1e-9).unwrap()[0];
        let h = barrier.barrier_value(x0.view(), &desc).unwrap();
        assert_abs_diff_eq!(optimum, -hdot - epsilon * h, epsilon = 1e-6);
    }
}

#[test]
fn test_derivative_milp_dominates_samples() {
    let network = random_network(&[2, 6, 1], 0.1, 12);
    let barrier = ControlBarrier::new(double_integrator(unit_box(2)), network).unwrap();
    let desc = descriptor();
    let epsilon = 0.3;
    let problem = barrier
        .barrier_derivative_as_milp(&desc, epsilon, VarType::Binary, &solver())
        .unwrap();
    let optimum = solver()
        .solve(&problem.milp)
        .unwrap()
        .optimal_objective("barrier derivative")
        .unwrap();
    let mut rng = StdRng::seed_from_u64(13);
    for x in uniform_sample_in_box(&unit_box(2), 300, &mut rng).rows() {
        let h = barrier.barrier_value(x, &desc).unwrap();
        for hdot in barrier.barrier_derivative(x, &desc, 1e-9).unwrap() {
            assert!(-hdot - epsilon * h <= optimum + 1e-6);
        }
    }
}

#[test]
fn test_derivative_milp_gradient_at_a_pinned_state() {
    let desc = descriptor();
    let epsilon = 0.3;
    let cases = [([-0.25, 0.45], 14), ([0.6, 0.1], 24), ([-0.7, -0.35], 34), ([0.15, -0.8], 44)];
    for (state, seed) in cases {
        let x0 = arr1(&state);
        let network = random_network(&[2, 5, 1], 0.1, seed);
        let objective = |network: &ReluNetwork| {
            let barrier = ControlBarrier::new(double_integrator(BoxDomain::point(x0.view())), network.clone()).unwrap();
            let hdot = barrier.barrier_derivative(x0.view(), &desc, 1e-9).unwrap()[0];
            -hdot - epsilon * barrier.barrier_value(x0.view(), &desc).unwrap()
        };
        let barrier = ControlBarrier::new(double_integrator(BoxDomain::point(x0.view())), network.clone()).unwrap();
        let problem = barrier
            .barrier_derivative_as_milp(&desc, epsilon, VarType::Binary, &solver())
            .unwrap();
        let sol = solver().solve(&problem.milp).unwrap();
        assert_abs_diff_eq!(sol.optimal_objective("barrier derivative").unwrap(), objective(&network), epsilon = 1e-6);
        let gradient = barrier.derivative_milp_gradient(&desc, &problem, &sol).unwrap().flatten();
        let fd = central_difference(&network.params(), 1e-6, |p| objective(&with_params(&network, p)));
        assert_slices_close(&gradient, &fd, 1e-4);
    }
}

#[test]
fn test_sample_loss_gradients() {
    let network = random_network(&[2, 5, 1], 0.1, 15);
    let system = double_integrator(unit_box(2));
    let barrier = ControlBarrier::new(system.clone(), network.clone()).unwrap();
    let desc = descriptor();
    let mut rng = StdRng::seed_from_u64(16);
    let samples = uniform_sample_in_box(&unit_box(2), 20, &mut rng);
    let rebuild = |p: &[f64]| ControlBarrier::new(system.clone(), with_params(&network, p)).unwrap();

    let loss = barrier
        .barrier_derivative_loss_at_samples(&desc, 0.3, &samples, 10.0, Reduction::Mean)
        .unwrap();
    let fd = central_difference(&network.params(), 1e-6, |p| {
        rebuild(p)
            .barrier_derivative_loss_at_samples(&desc, 0.3, &samples, 10.0, Reduction::Mean)
            .unwrap()
            .value
    });
    assert_slices_close(&loss.gradient.flatten(), &fd, 1e-4);

    let loss = barrier
        .barrier_value_loss_at_samples(&desc, &samples, 10.0, Reduction::Mean)
        .unwrap();
    let fd = central_difference(&network.params(), 1e-6, |p| {
        rebuild(p)
            .barrier_value_loss_at_samples(&desc, &samples, 10.0, Reduction::Mean)
            .unwrap()
            .value
    });
    assert_slices_close(&loss.gradient.flatten(), &fd, 1e-4);
}
