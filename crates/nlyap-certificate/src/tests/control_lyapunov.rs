//! Control Lyapunov derivative: the worst-case input, the MILP and its gradient.

use super::{
    assert_slices_close, central_difference, double_integrator, random_network, solver, unit_box, with_params,
};
use crate::*;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, Array1, Array2};
use nlyap_core::{uniform_sample_in_box, BoxDomain};
use nlyap_system::{ControlAffineSystem, LinearSystem};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn pinned(x: &Array1<f64>) -> LinearSystem {
    double_integrator(BoxDomain::point(x.view()))
}

#[test]
fn test_rejects_unbounded_input() {
    let system = LinearSystem::new(
        arr2(&[[0.0]]),
        arr2(&[[1.0]]),
        unit_box(1),
        BoxDomain::from_slices(&[f64::NEG_INFINITY], &[f64::INFINITY]).unwrap(),
    )
    .unwrap();
    assert!(ControlLyapunov::new(system, random_network(&[1, 3, 1], 0.1, 0)).is_err());
}

#[test]
fn test_rejects_xhat_indices() {
    let clf = ControlLyapunov::new(double_integrator(unit_box(2)), random_network(&[2, 3, 1], 0.1, 0)).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.1)
        .unwrap()
        .with_xhat_indices(vec![0])
        .unwrap();
    assert!(clf
        .lyapunov_derivative_as_milp(&desc, 0.1, &MilpOptions::default(), &solver())
        .is_err());
}

#[test]
fn test_pointwise_derivative_takes_worst_input() {
    let network = random_network(&[2, 6, 1], 0.1, 3);
    let clf = ControlLyapunov::new(double_integrator(unit_box(2)), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.3).unwrap();
    let (epsilon, t) = (0.2, 1e-6);
    let mut rng = StdRng::seed_from_u64(4);
    for x in uniform_sample_in_box(&unit_box(2), 10, &mut rng).rows() {
        let worst = [-2.0, 2.0]
            .iter()
            .map(|&u| {
                let xdot = clf.system().dynamics(x, arr1(&[u]).view()).unwrap();
                let plus = &x + &(&xdot * t);
                let minus = &x - &(&xdot * t);
                (desc.value(&network, plus.view()).unwrap() - desc.value(&network, minus.view()).unwrap()) / (2.0 * t)
            })
            .fold(f64::INFINITY, f64::min);
        let expected = worst + epsilon * desc.value(&network, x).unwrap();
        let got = clf.lyapunov_derivative(x, &desc, epsilon, 1e-9).unwrap();
        assert_abs_diff_eq!(got, expected, epsilon = 1e-6);
    }
}

#[test]
fn test_milp_is_exact_at_a_pinned_state() {
    let x0 = arr1(&[0.3, -0.7]);
    let network = random_network(&[2, 6, 1], 0.1, 5);
    let clf = ControlLyapunov::new(pinned(&x0), network).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.3).unwrap();
    let problem = clf
        .lyapunov_derivative_as_milp(&desc, 0.2, &MilpOptions::default(), &solver())
        .unwrap();
    let optimum = problem.solve(&solver()).unwrap().optimal_objective("control Lyapunov").unwrap();
    assert_abs_diff_eq!(
        optimum,
        clf.lyapunov_derivative(x0.view(), &desc, 0.2, 1e-9).unwrap(),
        epsilon = 1e-6
    );
}

#[test]
fn test_milp_dominates_samples() {
    let network = random_network(&[2, 6, 1], 0.1, 6);
    let clf = ControlLyapunov::new(double_integrator(unit_box(2)), network).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.3).unwrap();
    let problem = clf
        .lyapunov_derivative_as_milp(&desc, 0.2, &MilpOptions::default(), &solver())
        .unwrap();
    let sol = problem.solve(&solver()).unwrap();
    let optimum = sol.optimal_objective("control Lyapunov").unwrap();
    let x = sol.values_of(&problem.x);
    assert!(clf.lyapunov_derivative(x.view(), &desc, 0.2, 1e-6).unwrap() <= optimum + 1e-6);

    let mut rng = StdRng::seed_from_u64(7);
    for x in uniform_sample_in_box(&unit_box(2), 300, &mut rng).rows() {
        let value = clf.lyapunov_derivative(x, &desc, 0.2, 1e-9).unwrap();
        assert!(value <= optimum + 1e-6, "sample {value} above MILP optimum {optimum}");
    }
}

#[test]
fn test_milp_gradient_at_a_pinned_state() {
    let desc = LyapunovDescriptor::new(arr1(&[0.0, 0.0]), 0.3, arr2(&[[1.0, 0.2], [0.0, 1.5]])).unwrap();
    let cases = [([-0.4, 0.6], 8), ([0.5, 0.3], 18), ([0.7, -0.45], 28), ([-0.2, -0.65], 38)];
    for (state, seed) in cases {
        let x0 = arr1(&state);
        let network = random_network(&[2, 5, 1], 0.1, seed);
        let clf = ControlLyapunov::new(pinned(&x0), network.clone()).unwrap();
        let problem = clf
            .lyapunov_derivative_as_milp(&desc, 0.2, &MilpOptions::default(), &solver())
            .unwrap();
        let sol = problem.solve(&solver()).unwrap();
        let gradient = clf.milp_objective_gradient(&desc, &problem, &sol, true).unwrap().flatten();

        let n = network.num_params();
        let mut params = network.params();
        params.extend(desc.r.iter().copied());
        let fd = central_difference(&params, 1e-6, |p| {
            let mut desc = desc.clone();
            desc.r = Array2::from_shape_vec((2, 2), p[n..].to_vec()).unwrap();
            ControlLyapunov::new(pinned(&x0), with_params(&network, &p[..n]))
                .unwrap()
                .lyapunov_derivative(x0.view(), &desc, 0.2, 1e-9)
                .unwrap()
        });
        assert_slices_close(&gradient, &fd, 1e-4);
    }
}

#[test]
fn test_sample_loss_gradient() {
    let network = random_network(&[2, 5, 1], 0.1, 9);
    let system = double_integrator(unit_box(2));
    let clf = ControlLyapunov::new(system.clone(), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.3).unwrap();
    let mut rng = StdRng::seed_from_u64(10);
    let samples = uniform_sample_in_box(&unit_box(2), 20, &mut rng);
    let loss = clf
        .lyapunov_derivative_loss_at_samples(&desc, 0.2, &samples, 10.0, Reduction::Mean, false)
        .unwrap();
    assert!(loss.value > 0.0);
    let fd = central_difference(&network.params(), 1e-6, |p| {
        ControlLyapunov::new(system.clone(), with_params(&network, p))
            .unwrap()
            .lyapunov_derivative_loss_at_samples(&desc, 0.2, &samples, 10.0, Reduction::Mean, false)
            .unwrap()
            .value
    });
    assert_slices_close(&loss.gradient.flatten(), &fd, 1e-4);
}
