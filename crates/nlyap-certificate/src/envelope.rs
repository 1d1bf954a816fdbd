//! Gradient of a certificate MILP's optimal value with respect to the
//! certificate parameters.
//!
//! At an optimum `x*` the value is `g(x*, θ)` on the affine piece selected by
//! the solution, and `x*` sits on the constraints `c_i(x, θ) = 0` active
//! there (ReLU kinks, zero L1/L∞ arguments, domain faces, dynamics mode
//! boundaries). The Lagrangian envelope theorem gives
//!
//! ```text
//! dV*/dθ = ∂θ g + Σ μ_i ∂θ c_i,     Cᵀ μ = −∇ₓ g
//! ```
//!
//! with `C` the stacked `∇ₓ c_i`. The multipliers are the least-squares
//! solution over a linearly independent subset of the active rows. The result
//! is exact at non-degenerate optima; with several optimal vertices it is one
//! element of the (non-unique) generalized gradient.

use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, ActivationPattern, BoxDomain, NetworkGradient, ReluNetwork, Result};
use nlyap_milp::{MilpSolution, VarId};
use nlyap_relu::ReluEncoding;
use tracing::{trace, warn};

/// Tolerance for deciding that a constraint is active at a MILP optimum.
pub const ACTIVE_TOLERANCE: f64 = 1e-6;

/// Relative tolerance for dropping linearly dependent active rows.
const DEPENDENCE_TOLERANCE: f64 = 1e-9;

/// Gradient with respect to the network parameters and, optionally, R.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGradient {
    pub network: NetworkGradient,
    pub r: Option<Array2<f64>>,
}

impl ParameterGradient {
    pub fn zeros(network: &ReluNetwork, r_shape: Option<(usize, usize)>) -> Self {
        Self {
            network: NetworkGradient::zeros_like(network),
            r: r_shape.map(Array2::zeros),
        }
    }

    pub fn from_network(network: NetworkGradient, r_shape: Option<(usize, usize)>) -> Self {
        Self {
            network,
            r: r_shape.map(Array2::zeros),
        }
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &ParameterGradient, scale: f64) {
        self.network.add_scaled(&other.network, scale);
        if let (Some(r), Some(o)) = (self.r.as_mut(), other.r.as_ref()) {
            r.scaled_add(scale, o);
        }
    }

    pub fn scaled(&self, scale: f64) -> Self {
        let mut out = self.clone();
        out.network.weights.iter_mut().for_each(|w| *w *= scale);
        for b in out.network.biases.iter_mut().flatten() {
            *b *= scale;
        }
        if let Some(r) = out.r.as_mut() {
            *r *= scale;
        }
        out
    }

    /// Network parameters in [`ReluNetwork::params`] order, then R row-major.
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = self.network.flatten();
        if let Some(r) = &self.r {
            out.extend(r.iter().copied());
        }
        out
    }
}

/// First-order data of one affine piece: `∇ₓ` and `∂θ` of an objective or
/// of an active constraint.
#[derive(Debug, Clone)]
pub struct ActivePiece {
    pub grad_x: Array1<f64>,
    pub grad_theta: ParameterGradient,
}

impl ActivePiece {
    pub fn new(grad_x: Array1<f64>, grad_theta: ParameterGradient) -> Self {
        Self { grad_x, grad_theta }
    }

    /// A constraint that does not depend on θ, such as a domain face.
    pub fn fixed(grad_x: Array1<f64>, network: &ReluNetwork, r_shape: Option<(usize, usize)>) -> Self {
        Self::new(grad_x, ParameterGradient::zeros(network, r_shape))
    }

    pub fn add_scaled(&mut self, other: &ActivePiece, scale: f64) {
        self.grad_x.scaled_add(scale, &other.grad_x);
        self.grad_theta.add_scaled(&other.grad_theta, scale);
    }

    pub fn scaled(&self, scale: f64) -> Self {
        Self::new(&self.grad_x * scale, self.grad_theta.scaled(scale))
    }

    /// Pull the state gradient back through `x_next = J x`: `∇ₓ ← Jᵀ ∇ₓ`.
    pub fn pulled_back(mut self, jacobian: &Array2<f64>) -> Self {
        self.grad_x = jacobian.t().dot(&self.grad_x);
        self
    }
}

/// Gradient of the optimal value from the objective and the active constraints.
pub fn envelope_gradient(objective: &ActivePiece, active: &[ActivePiece]) -> Result<ParameterGradient> {
    let n = objective.grad_x.len();
    for (i, piece) in active.iter().enumerate() {
        ensure_dim(&format!("active constraint {i} gradient"), n, piece.grad_x.len())?;
    }
    let kept = independent_rows(active);
    let mut result = objective.grad_theta.clone();
    if kept.is_empty() {
        if objective.grad_x.iter().any(|g| g.abs() > 1e-6) {
            warn!("optimum has no active constraints but a nonzero state gradient");
        }
        return Ok(result);
    }
    let m = kept.len();
    let mut gram = Array2::zeros((m, m));
    let mut rhs = Array1::zeros(m);
    for (a, &i) in kept.iter().enumerate() {
        rhs[a] = -active[i].grad_x.dot(&objective.grad_x);
        for (b, &j) in kept.iter().enumerate() {
            gram[[a, b]] = active[i].grad_x.dot(&active[j].grad_x);
        }
    }
    let mu = solve_linear_system(gram, rhs).ok_or_else(|| {
        nlyap_core::NlyapError::Solver("singular active-constraint system".to_string())
    })?;

    let mut stationarity = objective.grad_x.clone();
    for (a, &i) in kept.iter().enumerate() {
        stationarity.scaled_add(mu[a], &active[i].grad_x);
        result.add_scaled(&active[i].grad_theta, mu[a]);
    }
    let residual = stationarity.iter().map(|v| v * v).sum::<f64>().sqrt();
    if residual > 1e-6 * (1.0 + objective.grad_x.iter().map(|v| v.abs()).sum::<f64>()) {
        warn!(residual, active = active.len(), "objective gradient not spanned by the active constraints");
    }
    trace!(active = active.len(), independent = m, "envelope multipliers solved");
    Ok(result)
}

/// Indices of a maximal linearly independent subset of the active gradients.
fn independent_rows(active: &[ActivePiece]) -> Vec<usize> {
    let mut basis: Vec<Array1<f64>> = Vec::new();
    let mut kept = Vec::new();
    for (i, piece) in active.iter().enumerate() {
        let norm = piece.grad_x.dot(&piece.grad_x).sqrt();
        if norm <= DEPENDENCE_TOLERANCE {
            continue;
        }
        let mut r = piece.grad_x.clone();
        for q in &basis {
            let c = q.dot(&r);
            r.scaled_add(-c, q);
        }
        let rn = r.dot(&r).sqrt();
        if rn > DEPENDENCE_TOLERANCE.sqrt() * norm {
            basis.push(r / rn);
            kept.push(i);
        }
    }
    kept
}

/// Gaussian elimination with partial pivoting.
pub(crate) fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-14 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor != 0.0 {
                for k in col..n {
                    a[[row, k]] -= factor * a[[col, k]];
                }
                b[row] -= factor * b[col];
            }
        }
    }
    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let s: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - s) / a[[row, row]];
    }
    Some(x)
}

/// Faces of `domain` that `x` touches, as `±e_i` constraints.
pub fn active_box_faces(
    x: ArrayView1<f64>,
    domain: &BoxDomain,
    tol: f64,
    network: &ReluNetwork,
    r_shape: Option<(usize, usize)>,
) -> Vec<ActivePiece> {
    let mut out = Vec::new();
    for i in 0..x.len() {
        let at_lo = (x[i] - domain.lo()[i]).abs() <= tol;
        let at_up = (x[i] - domain.up()[i]).abs() <= tol;
        if at_lo || at_up {
            let mut e = Array1::zeros(x.len());
            e[i] = 1.0;
            out.push(ActivePiece::fixed(e, network, r_shape));
        }
    }
    out
}

/// The activation pattern realized by a MILP solution.
///
/// Units with an activation binary read it from `solution`; stable units
/// follow their pre-activation bound.
pub fn pattern_from_solution(
    encoding: &ReluEncoding,
    binaries: &[VarId],
    solution: &MilpSolution,
) -> Result<ActivationPattern> {
    ensure_dim("encoding binaries", encoding.num_binaries(), binaries.len())?;
    let layers = encoding
        .unit_binary
        .iter()
        .enumerate()
        .map(|(k, units)| {
            units
                .iter()
                .enumerate()
                .map(|(j, column)| match column {
                    Some(c) => solution.value(binaries[*c]) > 0.5,
                    None => encoding.preactivation_bound(k, j).lower >= 0.0,
                })
                .collect()
        })
        .collect();
    Ok(ActivationPattern { layers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use nlyap_core::LinearLayer;

    fn tiny_network() -> ReluNetwork {
        let layer = LinearLayer::new(arr2(&[[1.0, 2.0]]), Some(arr1(&[0.5]))).unwrap();
        ReluNetwork::new(vec![layer], 0.0).unwrap()
    }

    #[test]
    fn test_solve_linear_system() {
        let a = arr2(&[[2.0, 1.0], [1.0, 3.0]]);
        let x = solve_linear_system(a, arr1(&[3.0, 5.0])).unwrap();
        assert_abs_diff_eq!(x[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.4, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_system_is_rejected() {
        let a = arr2(&[[1.0, 2.0], [2.0, 4.0]]);
        assert!(solve_linear_system(a, arr1(&[1.0, 2.0])).is_none());
    }

    #[test]
    fn test_dependent_rows_are_dropped() {
        let net = tiny_network();
        let pieces = vec![
            ActivePiece::fixed(arr1(&[1.0, 0.0]), &net, None),
            ActivePiece::fixed(arr1(&[2.0, 0.0]), &net, None),
            ActivePiece::fixed(arr1(&[0.0, 1.0]), &net, None),
        ];
        assert_eq!(independent_rows(&pieces), vec![0, 2]);
    }

    #[test]
    fn test_envelope_of_moving_vertex() {
        // max x subject to x <= θ: value θ, the constraint carries the whole gradient.
        let net = tiny_network();
        let mut theta = ParameterGradient::zeros(&net, None);
        theta.network.weights[0][[0, 0]] = -1.0;
        let constraint = ActivePiece::new(arr1(&[1.0]), theta);
        let objective = ActivePiece::fixed(arr1(&[1.0]), &net, None);
        let grad = envelope_gradient(&objective, &[constraint]).unwrap();
        assert_abs_diff_eq!(grad.network.weights[0][[0, 0]], 1.0, epsilon = 1e-12);
    }
}
