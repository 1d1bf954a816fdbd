mod hybrid;

use crate::DiscreteTimeSystem;
use ndarray::Array1;
use nlyap_core::ReluNetwork;
use nlyap_milp::{LinExpr, MicroLpSolver, MilpBuilder, MilpSolver, ObjectiveSense, SolverConfig, VarType};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub(crate) fn solver() -> MicroLpSolver {
    MicroLpSolver::new(SolverConfig::strict())
}

pub(crate) fn random_network(widths: &[usize], slope: f64, seed: u64) -> ReluNetwork {
    let mut rng = StdRng::seed_from_u64(seed);
    ReluNetwork::setup_relu(widths, slope, true, &mut rng).unwrap()
}

/// x[n+1] from the dynamics MILP with x pinned, pushed both ways.
///
/// Returns the minimizer and maximizer of Σ x[n+1]; an exact encoding makes them equal.
pub(crate) fn pinned_step<S: DiscreteTimeSystem>(system: &S, x: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
    let mut milp = MilpBuilder::new();
    let xs = milp.add_continuous_vars("x", x, x);
    let x_next = milp.add_free_vars("x_next", system.x_dim());
    let x_exprs: Vec<LinExpr> = xs.iter().map(|&v| LinExpr::var(v)).collect();
    system
        .add_dynamics_constraint(&mut milp, &x_exprs, &x_next, &solver(), VarType::Binary, "dyn")
        .unwrap();
    let sum = x_next.iter().fold(LinExpr::new(), |mut e, &v| {
        e.add_term(v, 1.0);
        e
    });
    let mut out = Vec::new();
    for sense in [ObjectiveSense::Minimize, ObjectiveSense::Maximize] {
        milp.set_objective(sum.clone(), sense);
        let sol = solver().solve(&milp).unwrap();
        assert!(sol.is_optimal(), "pinned dynamics MILP returned {:?}", sol.status);
        out.push(sol.values_of(&x_next));
    }
    let up = out.pop().unwrap();
    let lo = out.pop().unwrap();
    (lo, up)
}

/// Elementwise `|a − b| <= eps`.
#[track_caller]
pub(crate) fn assert_all_close(a: &Array1<f64>, b: &Array1<f64>, eps: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch: {a} vs {b}");
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= eps, "{a} differs from {b} by more than {eps}");
    }
}
