mod barrier;
mod control_lyapunov;
mod lyapunov;
mod proptest_reduction;

use ndarray::{arr1, arr2};
use nlyap_core::{BoxDomain, ReluNetwork};
use nlyap_milp::{MicroLpSolver, SolverConfig};
use nlyap_system::{AutonomousHybridLinearSystem, AutonomousReluSystem, LinearSystem};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub(crate) fn solver() -> MicroLpSolver {
    MicroLpSolver::new(SolverConfig::strict())
}

pub(crate) fn random_network(widths: &[usize], slope: f64, seed: u64) -> ReluNetwork {
    let mut rng = StdRng::seed_from_u64(seed);
    ReluNetwork::setup_relu(widths, slope, true, &mut rng).unwrap()
}

pub(crate) fn unit_box(dim: usize) -> BoxDomain {
    BoxDomain::from_slices(&vec![-1.0; dim], &vec![1.0; dim]).unwrap()
}

/// `x[n+1] = a x` on `[-1, 1]`, a hybrid system with a single mode.
pub(crate) fn scalar_contraction(a: f64) -> AutonomousHybridLinearSystem {
    let mut system = AutonomousHybridLinearSystem::new(unit_box(1)).unwrap();
    system
        .add_mode(arr2(&[[a]]), arr1(&[0.0]), arr2(&[[1.0], [-1.0]]), arr1(&[1.0, 1.0]))
        .unwrap();
    system
}

/// A random ReLU map on `[-1, 1]²`.
pub(crate) fn relu_system(seed: u64) -> AutonomousReluSystem {
    AutonomousReluSystem::new(random_network(&[2, 5, 2], 0.1, seed), unit_box(2)).unwrap()
}

/// A damped double integrator with `u ∈ [-2, 2]` on `domain`.
pub(crate) fn double_integrator(domain: BoxDomain) -> LinearSystem {
    LinearSystem::new(
        arr2(&[[0.0, 1.0], [-1.0, -0.5]]),
        arr2(&[[0.0], [1.0]]),
        domain,
        BoxDomain::from_slices(&[-2.0], &[2.0]).unwrap(),
    )
    .unwrap()
}

/// Hidden-unit kinks `−b_j / w_j` of a one-hidden-layer network with scalar input.
pub(crate) fn scalar_kinks(network: &ReluNetwork) -> Vec<f64> {
    let layer = &network.layers()[0];
    (0..layer.out_features())
        .filter_map(|j| {
            let w = layer.weight[[j, 0]];
            (w.abs() > 1e-12).then(|| -layer.bias_at(j) / w)
        })
        .collect()
}

/// Central differences of `f` around `params`.
pub(crate) fn central_difference(params: &[f64], h: f64, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    (0..params.len())
        .map(|i| {
            let mut plus = params.to_vec();
            plus[i] += h;
            let mut minus = params.to_vec();
            minus[i] -= h;
            (f(&plus) - f(&minus)) / (2.0 * h)
        })
        .collect()
}

/// `network` with its parameters replaced.
pub(crate) fn with_params(network: &ReluNetwork, params: &[f64]) -> ReluNetwork {
    let mut out = network.clone();
    out.set_params(params).unwrap();
    out
}

pub(crate) fn assert_slices_close(a: &[f64], b: &[f64], eps: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!(
            (x - y).abs() <= eps * (1.0 + y.abs()),
            "entry {i}: {x} differs from {y} by more than {eps}"
        );
    }
}
