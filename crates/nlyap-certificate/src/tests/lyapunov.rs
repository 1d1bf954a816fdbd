//! Discrete-time Lyapunov conditions: pointwise values, MILP optima and their gradients.

use super::{
    assert_slices_close, central_difference, random_network, relu_system, scalar_contraction, scalar_kinks, solver,
    with_params,
};
use crate::*;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, Array2};
use nlyap_core::{uniform_sample_in_box, ReluNetwork};
use nlyap_system::{AutonomousReluSystem, DiscreteTimeSystem};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Candidate maximizers of a piecewise-linear function of a scalar state:
/// the ends of `[-1, 1]`, the equilibrium, and every kink of ϕ(x) and ϕ(a x).
fn scalar_candidates(network: &ReluNetwork, a: f64) -> Vec<f64> {
    let mut candidates = vec![-1.0, 0.0, 1.0];
    for k in scalar_kinks(network) {
        candidates.push(k);
        candidates.push(k / a);
    }
    candidates.retain(|x| x.abs() <= 1.0);
    candidates
}

fn exact_positivity_optimum(network: &ReluNetwork, desc: &LyapunovDescriptor, epsilon: f64) -> f64 {
    scalar_candidates(network, 1.0)
        .into_iter()
        .map(|x| {
            let x = arr1(&[x]);
            epsilon * desc.l1_norm(x.view()).unwrap() - desc.value(network, x.view()).unwrap()
        })
        .fold(f64::NEG_INFINITY, f64::max)
}

fn exact_derivative_optimum(
    network: &ReluNetwork,
    desc: &LyapunovDescriptor,
    epsilon: f64,
    eps_type: ConvergenceEps,
    a: f64,
) -> f64 {
    scalar_candidates(network, a)
        .into_iter()
        .map(|x| {
            let (x, x_next) = (arr1(&[x]), arr1(&[a * x]));
            eps_type.violation(
                desc.value(network, x.view()).unwrap(),
                desc.value(network, x_next.view()).unwrap(),
                desc.l1_norm(x.view()).unwrap(),
                epsilon,
            )
        })
        .fold(f64::NEG_INFINITY, f64::max)
}

// ============================================================
// POINTWISE VALUES AND REDUCTIONS
// ============================================================

#[test]
fn test_convergence_eps_violation() {
    assert_abs_diff_eq!(ConvergenceEps::ExpLower.violation(2.0, 1.5, 1.0, 0.1), -0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(ConvergenceEps::ExpUpper.violation(2.0, 1.5, 1.0, 0.1), 0.3, epsilon = 1e-12);
    assert_abs_diff_eq!(ConvergenceEps::Asymp.violation(2.0, 1.5, 1.0, 0.1), -0.4, epsilon = 1e-12);
}

#[test]
fn test_reductions() {
    let (mean, w) = Reduction::Mean.reduce(&[1.0, 2.0, 3.0]).unwrap();
    assert_abs_diff_eq!(mean, 2.0);
    assert_slices_close(&w, &[1.0 / 3.0; 3], 1e-12);

    let (max, w) = Reduction::Max.reduce(&[1.0, 3.0, 2.0]).unwrap();
    assert_abs_diff_eq!(max, 3.0);
    assert_eq!(w, vec![0.0, 1.0, 0.0]);

    let losses = [3.0, 4.0];
    let (norm, w) = Reduction::FourNorm.reduce(&losses).unwrap();
    assert_abs_diff_eq!(norm, 337f64.powf(0.25), epsilon = 1e-12);
    let fd = central_difference(&losses, 1e-6, |l| Reduction::FourNorm.reduce(l).unwrap().0);
    assert_slices_close(&w, &fd, 1e-6);

    assert!(Reduction::Mean.reduce(&[]).is_err());
}

#[test]
fn test_value_vanishes_at_equilibrium() {
    let lyapunov = LyapunovDiscreteTime::new(relu_system(1), random_network(&[2, 4, 1], 0.1, 2)).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.2, -0.3]), 0.5).unwrap();
    assert_abs_diff_eq!(lyapunov.lyapunov_value(arr1(&[0.2, -0.3]).view(), &desc).unwrap(), 0.0, epsilon = 1e-12);

    let x = Array2::from_shape_vec((2, 2), vec![0.2, -0.3, 0.5, 0.5]).unwrap();
    let batch = lyapunov.lyapunov_value_batch(&x, &desc).unwrap();
    assert_abs_diff_eq!(batch[0], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(batch[1], lyapunov.lyapunov_value(x.row(1), &desc).unwrap(), epsilon = 1e-12);
}

#[test]
fn test_pointwise_derivative_of_linear_map() {
    let network = random_network(&[1, 4, 1], 0.1, 5);
    let lyapunov = LyapunovDiscreteTime::new(scalar_contraction(0.5), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0]), 0.1).unwrap();
    let x = arr1(&[0.7]);
    let v = desc.value(&network, x.view()).unwrap();
    let v_next = desc.value(&network, arr1(&[0.35]).view()).unwrap();
    let l1 = 0.7;
    let expected = [
        (ConvergenceEps::ExpLower, v_next - v + 0.1 * v),
        (ConvergenceEps::ExpUpper, v - v_next - 0.1 * v),
        (ConvergenceEps::Asymp, v_next - v + 0.1 * l1),
    ];
    for (eps_type, want) in expected {
        let dv = lyapunov.lyapunov_derivative(x.view(), &desc, 0.1, eps_type).unwrap();
        assert_eq!(dv.len(), 1);
        assert_abs_diff_eq!(dv[0], want, epsilon = 1e-12);
    }
}

#[test]
fn test_milp_options_reject_inverted_bounds() {
    let lyapunov = LyapunovDiscreteTime::new(relu_system(1), random_network(&[2, 4, 1], 0.1, 2)).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.5).unwrap();
    let options = MilpOptions {
        lyapunov_lower: Some(1.0),
        lyapunov_upper: Some(0.5),
        ..Default::default()
    };
    assert!(lyapunov
        .lyapunov_positivity_as_milp(&desc, 0.1, &options, &solver())
        .is_err());
}

// ============================================================
// MILP OPTIMA
// ============================================================

#[test]
fn test_positivity_milp_dominates_samples() {
    let network = random_network(&[2, 6, 1], 0.1, 11);
    let lyapunov = LyapunovDiscreteTime::new(relu_system(10), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.05).unwrap();
    let epsilon = 0.1;
    let problem = lyapunov
        .lyapunov_positivity_as_milp(&desc, epsilon, &MilpOptions::default(), &solver())
        .unwrap();
    let sol = problem.solve(&solver()).unwrap();
    let optimum = sol.optimal_objective("positivity").unwrap();

    let x = sol.values_of(&problem.x);
    let at_solution = epsilon * desc.l1_norm(x.view()).unwrap() - desc.value(&network, x.view()).unwrap();
    assert_abs_diff_eq!(optimum, at_solution, epsilon = 1e-5);

    let mut rng = StdRng::seed_from_u64(0);
    for x in uniform_sample_in_box(lyapunov.system().x_domain(), 300, &mut rng).rows() {
        let violation = epsilon * desc.l1_norm(x).unwrap() - desc.value(&network, x).unwrap();
        assert!(violation <= optimum + 1e-6, "sample violation {violation} above MILP optimum {optimum}");
    }
}

#[test]
fn test_positivity_milp_respects_value_bounds() {
    let network = random_network(&[2, 6, 1], 0.1, 12);
    let lyapunov = LyapunovDiscreteTime::new(relu_system(10), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.05).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let samples = uniform_sample_in_box(lyapunov.system().x_domain(), 50, &mut rng);
    let values = lyapunov.lyapunov_value_batch(&samples, &desc).unwrap();
    let lower = values.iter().copied().fold(f64::INFINITY, f64::min);
    let upper = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let options = MilpOptions {
        lyapunov_lower: Some(lower),
        lyapunov_upper: Some(upper),
        ..Default::default()
    };
    let problem = lyapunov.lyapunov_positivity_as_milp(&desc, 0.1, &options, &solver()).unwrap();
    let sol = problem.solve(&solver()).unwrap();
    assert!(sol.is_optimal());
    let v = desc.value(&network, sol.values_of(&problem.x).view()).unwrap();
    assert!(v >= lower - 1e-6 && v <= upper + 1e-6, "V = {v} outside [{lower}, {upper}]");
}

#[test]
fn test_derivative_milp_dominates_samples() {
    let network = random_network(&[2, 6, 1], 0.1, 4);
    let lyapunov = LyapunovDiscreteTime::new(relu_system(3), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.05).unwrap();
    let epsilon = 0.1;
    let mut rng = StdRng::seed_from_u64(2);
    let samples = uniform_sample_in_box(lyapunov.system().x_domain(), 300, &mut rng);

    for eps_type in [ConvergenceEps::ExpLower, ConvergenceEps::ExpUpper, ConvergenceEps::Asymp] {
        let problem = lyapunov
            .lyapunov_derivative_as_milp(&desc, epsilon, eps_type, &MilpOptions::default(), &solver())
            .unwrap();
        let sol = problem.solve(&solver()).unwrap();
        let optimum = sol.optimal_objective("derivative").unwrap();

        let violation_at = |x: ndarray::ArrayView1<f64>| {
            lyapunov
                .lyapunov_derivative(x, &desc, epsilon, eps_type)
                .unwrap()
                .into_iter()
                .fold(f64::NEG_INFINITY, f64::max)
        };
        let x = sol.values_of(&problem.x);
        assert_abs_diff_eq!(optimum, violation_at(x.view()), epsilon = 1e-5);
        for x in samples.rows() {
            assert!(violation_at(x) <= optimum + 1e-6, "{eps_type:?}: sample above MILP optimum");
        }
    }
}

#[test]
fn test_exact_scalar_optima() {
    let network = random_network(&[1, 4, 1], 0.1, 21);
    let lyapunov = LyapunovDiscreteTime::new(scalar_contraction(0.5), network.clone()).unwrap();
    let desc = LyapunovDescriptor::identity(arr1(&[0.0]), 0.1).unwrap();

    let problem = lyapunov
        .lyapunov_positivity_as_milp(&desc, 0.2, &MilpOptions::default(), &solver())
        .unwrap();
    let optimum = problem.solve(&solver()).unwrap().optimal_objective("positivity").unwrap();
    assert_abs_diff_eq!(optimum, exact_positivity_optimum(&network, &desc, 0.2), epsilon = 1e-6);

    let problem = lyapunov
        .lyapunov_derivative_as_milp(&desc, 0.1, ConvergenceEps::ExpLower, &MilpOptions::default(), &solver())
        .unwrap();
    let optimum = problem.solve(&solver()).unwrap().optimal_objective("derivative").unwrap();
    assert_abs_diff_eq!(
        optimum,
        exact_derivative_optimum(&network, &desc, 0.1, ConvergenceEps::ExpLower, 0.5),
        epsilon = 1e-6
    );
}

// ============================================================
// GRADIENTS
// ============================================================

#[test]
fn test_positivity_milp_gradient_matches_finite_difference() {
    let epsilon = 0.2;
    let desc = LyapunovDescriptor::identity(arr1(&[0.0]), 0.1).unwrap();
    for seed in [7, 17, 27, 37] {
        let network = random_network(&[1, 4, 1], 0.1, seed);
        let lyapunov = LyapunovDiscreteTime::new(scalar_contraction(0.5), network.clone()).unwrap();
        let problem = lyapunov
            .lyapunov_positivity_as_milp(&desc, epsilon, &MilpOptions::default(), &solver())
            .unwrap();
        let sol = problem.solve(&solver()).unwrap();
        let gradient = lyapunov
            .milp_objective_gradient(&desc, &problem, &sol, false)
            .unwrap()
            .flatten();
        let fd = central_difference(&network.params(), 1e-6, |p| {
            exact_positivity_optimum(&with_params(&network, p), &desc, epsilon)
        });
        assert_slices_close(&gradient, &fd, 1e-4);
    }
}

#[test]
fn test_derivative_milp_gradient_matches_finite_difference() {
    let epsilon = 0.1;
    let desc = LyapunovDescriptor::identity(arr1(&[0.0]), 0.1).unwrap();
    for seed in [8, 18, 28, 38] {
        let network = random_network(&[1, 4, 1], 0.1, seed);
        let lyapunov = LyapunovDiscreteTime::new(scalar_contraction(0.5), network.clone()).unwrap();
        for eps_type in [ConvergenceEps::ExpLower, ConvergenceEps::Asymp] {
            let problem = lyapunov
                .lyapunov_derivative_as_milp(&desc, epsilon, eps_type, &MilpOptions::default(), &solver())
                .unwrap();
            let sol = problem.solve(&solver()).unwrap();
            let gradient = lyapunov
                .milp_objective_gradient(&desc, &problem, &sol, false)
                .unwrap()
                .flatten();
            let fd = central_difference(&network.params(), 1e-6, |p| {
                exact_derivative_optimum(&with_params(&network, p), &desc, epsilon, eps_type, 0.5)
            });
            assert_slices_close(&gradient, &fd, 1e-4);
        }
    }
}

/// Optimum of a freshly built MILP for `query` with the network and R given by `p`.
fn milp_optimum_at(
    system: &AutonomousReluSystem,
    network: &ReluNetwork,
    desc: &LyapunovDescriptor,
    query: LyapunovQuery,
    p: &[f64],
) -> f64 {
    let n = network.num_params();
    let mut desc = desc.clone();
    desc.r = Array2::from_shape_vec(desc.r.dim(), p[n..].to_vec()).unwrap();
    let lyapunov = LyapunovDiscreteTime::new(system.clone(), with_params(network, &p[..n])).unwrap();
    let options = MilpOptions::default();
    let problem = match query {
        LyapunovQuery::Positivity { epsilon } => lyapunov
            .lyapunov_positivity_as_milp(&desc, epsilon, &options, &solver())
            .unwrap(),
        LyapunovQuery::Derivative { epsilon, eps_type } => lyapunov
            .lyapunov_derivative_as_milp(&desc, epsilon, eps_type, &options, &solver())
            .unwrap(),
    };
    problem.solve(&solver()).unwrap().optimal_objective("Lyapunov MILP").unwrap()
}

#[test]
fn test_milp_gradient_with_r_on_planar_system() {
    let r = arr2(&[[1.0, 0.4], [-0.3, 1.2]]);
    let queries = [
        LyapunovQuery::Positivity { epsilon: 0.3 },
        LyapunovQuery::Derivative {
            epsilon: 0.1,
            eps_type: ConvergenceEps::ExpLower,
        },
    ];
    for seed in [90, 91, 92, 93] {
        let system = relu_system(seed);
        let network = random_network(&[2, 4, 1], 0.1, seed + 100);
        let desc = LyapunovDescriptor::new(arr1(&[0.0, 0.0]), 0.1, r.clone()).unwrap();
        let lyapunov = LyapunovDiscreteTime::new(system.clone(), network.clone()).unwrap();
        let mut params = network.params();
        params.extend(desc.r.iter().copied());
        for query in queries {
            let options = MilpOptions::default();
            let problem = match query {
                LyapunovQuery::Positivity { epsilon } => lyapunov
                    .lyapunov_positivity_as_milp(&desc, epsilon, &options, &solver())
                    .unwrap(),
                LyapunovQuery::Derivative { epsilon, eps_type } => lyapunov
                    .lyapunov_derivative_as_milp(&desc, epsilon, eps_type, &options, &solver())
                    .unwrap(),
            };
            let sol = problem.solve(&solver()).unwrap();
            let gradient = lyapunov
                .milp_objective_gradient(&desc, &problem, &sol, true)
                .unwrap()
                .flatten();
            assert_eq!(gradient.len(), params.len());
            let fd = central_difference(&params, 1e-5, |p| milp_optimum_at(&system, &network, &desc, query, p));
            assert_slices_close(&gradient, &fd, 1e-3);
        }
    }
}

#[test]
fn test_derivative_sample_loss_gradient_with_r() {
    let system = relu_system(30);
    let network = random_network(&[2, 5, 1], 0.1, 31);
    let desc = LyapunovDescriptor::new(arr1(&[0.1, -0.1]), 0.5, arr2(&[[1.0, 0.5], [-0.3, 2.0]])).unwrap();
    let lyapunov = LyapunovDiscreteTime::new(system.clone(), network.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(32);
    let samples = uniform_sample_in_box(system.x_domain(), 20, &mut rng);
    let (epsilon, margin) = (0.1, 10.0);

    let loss = lyapunov
        .lyapunov_derivative_loss_at_samples(&desc, epsilon, ConvergenceEps::ExpLower, &samples, margin, Reduction::Mean, true)
        .unwrap();
    let mut params = network.params();
    params.extend(desc.r.iter().copied());
    let n = network.num_params();
    let fd = central_difference(&params, 1e-6, |p| {
        let mut desc = desc.clone();
        desc.r = Array2::from_shape_vec((2, 2), p[n..].to_vec()).unwrap();
        LyapunovDiscreteTime::new(system.clone(), with_params(&network, &p[..n]))
            .unwrap()
            .lyapunov_derivative_loss_at_samples(&desc, epsilon, ConvergenceEps::ExpLower, &samples, margin, Reduction::Mean, true)
            .unwrap()
            .value
    });
    assert_slices_close(&loss.gradient.flatten(), &fd, 1e-4);
}

#[test]
fn test_positivity_sample_loss_gradient() {
    let system = relu_system(40);
    let network = random_network(&[2, 5, 1], 0.1, 41);
    let desc = LyapunovDescriptor::identity(arr1(&[0.0, 0.0]), 0.2).unwrap();
    let lyapunov = LyapunovDiscreteTime::new(system.clone(), network.clone()).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let samples = uniform_sample_in_box(system.x_domain(), 15, &mut rng);

    let loss = lyapunov
        .lyapunov_positivity_loss_at_samples(&desc, 0.1, &samples, 10.0, Reduction::FourNorm, false)
        .unwrap();
    assert!(loss.value > 0.0);
    let fd = central_difference(&network.params(), 1e-6, |p| {
        LyapunovDiscreteTime::new(system.clone(), with_params(&network, p))
            .unwrap()
            .lyapunov_positivity_loss_at_samples(&desc, 0.1, &samples, 10.0, Reduction::FourNorm, false)
            .unwrap()
            .value
    });
    assert_slices_close(&loss.gradient.flatten(), &fd, 1e-4);
}
