//! MILP building blocks for `∂V/∂x · v` in the continuous-time engines.
//!
//! The gradient of a norm term is piecewise constant: `sᵀR` for the L1 term
//! and `s_k δ_k R_k` for the ∞-norm, with signs `s` and argmax `δ` read off
//! the binaries of the norm encoding. Multiplying those binaries with a
//! bounded continuous `R_k · v` is exact through McCormick products.

use crate::envelope::ActivePiece;
use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{Bound, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    add_absolute_value, add_binary_continuous_product, InfinityNorm, LinExpr, MilpBuilder, MilpSolution,
    PiecewiseUnit, VarId,
};
use nlyap_relu::{add_network_gradient_times_vector, interval_affine, ReluEncoding};
use serde::{Deserialize, Serialize};

/// Which extremum over the input box enters the derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InputSemantics {
    /// `min_u`: the derivative under the least favorable admissible input.
    #[default]
    WorstCase,
    /// `max_u`: the derivative under the most favorable admissible input.
    BestCase,
}

impl InputSemantics {
    /// The input coordinate attaining the extremum of `a · u` over `[lo, up]`.
    pub fn extreme_input(self, a: f64, lo: f64, up: f64) -> f64 {
        match (self, a >= 0.0) {
            (InputSemantics::WorstCase, true) | (InputSemantics::BestCase, false) => lo,
            _ => up,
        }
    }

    /// `min_u a·u` or `max_u a·u` over the box, summed over coordinates.
    pub fn extremum(self, a: ArrayView1<f64>, lo: &Array1<f64>, up: &Array1<f64>) -> f64 {
        a.iter()
            .enumerate()
            .map(|(j, &aj)| aj * self.extreme_input(aj, lo[j], up[j]))
            .sum()
    }

    fn abs_sign(self) -> f64 {
        match self {
            InputSemantics::WorstCase => -1.0,
            InputSemantics::BestCase => 1.0,
        }
    }
}

/// Sign of a norm argument inside a model: fixed by its bound, or a binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignIndicator {
    /// `true` for a nonnegative argument.
    Const(bool),
    /// 1 iff the argument is nonnegative.
    Var(VarId),
}

impl SignIndicator {
    pub(crate) fn of(unit: &PiecewiseUnit<VarId>, argument: Bound) -> Self {
        match unit.binary {
            Some(b) => SignIndicator::Var(b),
            None => SignIndicator::Const(argument.lower >= 0.0),
        }
    }

    /// ±1 at a solution.
    pub(crate) fn sign_at(self, solution: &MilpSolution) -> f64 {
        let nonneg = match self {
            SignIndicator::Const(c) => c,
            SignIndicator::Var(v) => solution.value(v) > 0.5,
        };
        if nonneg {
            1.0
        } else {
            -1.0
        }
    }
}

pub(crate) fn symmetric(bound: Bound) -> Bound {
    let m = bound.lower.abs().max(bound.upper.abs());
    Bound::new(-m, m)
}

pub(crate) fn add_bounds(a: Bound, b: Bound) -> Bound {
    Bound::new(a.lower + b.lower, a.upper + b.upper)
}

/// Bound of `coeffs · v` for `v` in `bounds`.
pub(crate) fn dot_bound(coeffs: ArrayView1<f64>, bounds: &[Bound]) -> Result<Bound> {
    let weight = coeffs.to_owned().insert_axis(ndarray::Axis(0));
    Ok(interval_affine(&weight, None, bounds)?[0])
}

/// `s · w`, with `s = 2β − 1` for a sign binary β.
pub(crate) fn add_signed(
    milp: &mut MilpBuilder,
    sign: SignIndicator,
    w: &LinExpr<VarId>,
    w_bound: Bound,
    name: &str,
) -> Result<(LinExpr<VarId>, Bound)> {
    Ok(match sign {
        SignIndicator::Const(true) => (w.clone(), w_bound),
        SignIndicator::Const(false) => (-w.clone(), w_bound.scale(-1.0)),
        SignIndicator::Var(beta) => {
            let p = add_binary_continuous_product(milp, beta, w, w_bound, name)?;
            (LinExpr::term(p, 2.0) - w, symmetric(w_bound))
        }
    })
}

/// `∂ϕ/∂x · v` reusing the activation binaries of an encoding of ϕ(x).
pub(crate) fn add_network_directional(
    milp: &mut MilpBuilder,
    network: &ReluNetwork,
    encoding: &ReluEncoding,
    binaries: &[VarId],
    v: &[LinExpr<VarId>],
    v_bounds: &[Bound],
    name: &str,
) -> Result<(LinExpr<VarId>, Bound)> {
    let out = add_network_gradient_times_vector(milp, network, encoding, binaries, v, v_bounds, name)?;
    Ok((out.output[0].clone(), out.bounds[0]))
}

/// `scale · Σᵢ sᵢ (Rᵢ · v)`, the L1 term of `∂V/∂x · v`.
pub(crate) fn add_l1_directional(
    milp: &mut MilpBuilder,
    signs: &[SignIndicator],
    r: &Array2<f64>,
    scale: f64,
    v: &[LinExpr<VarId>],
    v_bounds: &[Bound],
    name: &str,
) -> Result<(LinExpr<VarId>, Bound)> {
    let mut expr = LinExpr::new();
    let mut bound = Bound::concrete(0.0);
    for (i, &sign) in signs.iter().enumerate() {
        let w = LinExpr::combine(r.row(i), v, 0.0);
        let w_bound = dot_bound(r.row(i), v_bounds)?;
        let (signed, signed_bound) = add_signed(milp, sign, &w, w_bound, &format!("{name}[{i}]"))?;
        expr.add_scaled(&signed, scale);
        bound = add_bounds(bound, signed_bound.scale(scale));
    }
    Ok((expr, bound))
}

/// `scale · Σ_k δ_k s_k (R_k · v)`, the ∞-norm term of `∂h/∂x · v`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_linf_directional(
    milp: &mut MilpBuilder,
    norm: &InfinityNorm<VarId>,
    argument_bounds: &[Bound],
    r: &Array2<f64>,
    scale: f64,
    v: &[LinExpr<VarId>],
    v_bounds: &[Bound],
    name: &str,
) -> Result<(LinExpr<VarId>, Bound)> {
    let mut expr = LinExpr::new();
    let mut bound = Bound::concrete(0.0);
    for (k, unit) in norm.abs.iter().enumerate() {
        let w = LinExpr::combine(r.row(k), v, 0.0);
        let w_bound = dot_bound(r.row(k), v_bounds)?;
        let (selected, selected_bound) = match norm.argmax.get(k) {
            Some(&delta) => {
                let p = add_binary_continuous_product(milp, delta, &w, w_bound, &format!("{name}_sel[{k}]"))?;
                let hull = Bound::new(w_bound.lower.min(0.0), w_bound.upper.max(0.0));
                (LinExpr::var(p), hull)
            }
            None => (w, w_bound),
        };
        let sign = SignIndicator::of(unit, argument_bounds[k]);
        let (signed, signed_bound) = add_signed(milp, sign, &selected, selected_bound, &format!("{name}[{k}]"))?;
        expr.add_scaled(&signed, scale);
        bound = add_bounds(bound, signed_bound.scale(scale));
    }
    Ok((expr, bound))
}

/// The extremum of `a_j u_j` over `[lo_j, up_j]` as `a_j·mid_j ± |a_j|·half_j`.
pub(crate) struct InputTerm {
    pub expr: LinExpr<VarId>,
    pub abs: PiecewiseUnit<VarId>,
    pub bound: Bound,
}

pub(crate) fn add_input_extremum(
    milp: &mut MilpBuilder,
    semantics: InputSemantics,
    a: &LinExpr<VarId>,
    a_bound: Bound,
    lo: f64,
    up: f64,
    name: &str,
) -> Result<InputTerm> {
    if !lo.is_finite() || !up.is_finite() {
        return Err(NlyapError::InvalidDomain(format!(
            "{name}: the input box must be finite, got [{lo}, {up}]"
        )));
    }
    let (mid, half) = (0.5 * (lo + up), 0.5 * (up - lo));
    let abs = add_absolute_value(milp, a, a_bound, name)?;
    let mut expr = a.scaled(mid);
    expr.add_scaled(&abs.output, semantics.abs_sign() * half);
    let bound = add_bounds(a_bound.scale(mid), abs.bound.scale(semantics.abs_sign() * half));
    Ok(InputTerm { expr, abs, bound })
}

/// `∇ₓ` of `‖Rx − p‖∞` on the piece selected by `(k, sign)`.
pub(crate) fn linf_row_gradient(r: &Array2<f64>, k: usize, sign: f64) -> Array1<f64> {
    r.row(k).mapv(|v| sign * v)
}

/// Tie constraints of `‖z‖∞` at `z = Rx − p` with maximizing entry `k*`.
///
/// Every other entry within `tol` of the maximum magnitude gives
/// `|z_{k*}| − |z_k| = 0`; at `z = 0` every row is active.
pub(crate) fn linf_kink_pieces(
    r: &Array2<f64>,
    z: ArrayView1<f64>,
    tol: f64,
    network: &ReluNetwork,
    r_shape: Option<(usize, usize)>,
) -> Vec<ActivePiece> {
    let Some((k_star, max)) = argmax_abs(z) else {
        return Vec::new();
    };
    if max <= tol {
        return (0..z.len())
            .map(|k| ActivePiece::fixed(r.row(k).to_owned(), network, r_shape))
            .collect();
    }
    let star = linf_row_gradient(r, k_star, z[k_star].signum());
    (0..z.len())
        .filter(|&k| k != k_star && max - z[k].abs() <= tol)
        .map(|k| {
            let grad = &star - &linf_row_gradient(r, k, if z[k] >= 0.0 { 1.0 } else { -1.0 });
            ActivePiece::fixed(grad, network, r_shape)
        })
        .collect()
}

/// Index and value of the largest magnitude.
pub(crate) fn argmax_abs(z: ArrayView1<f64>) -> Option<(usize, f64)> {
    z.iter()
        .map(|v| v.abs())
        .enumerate()
        .fold(None, |best, (k, v)| match best {
            Some((_, m)) if m >= v => best,
            _ => Some((k, v)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_extreme_input() {
        let lo = arr1(&[-1.0, 2.0]);
        let up = arr1(&[3.0, 4.0]);
        let a = arr1(&[2.0, -1.0]);
        assert_abs_diff_eq!(InputSemantics::WorstCase.extremum(a.view(), &lo, &up), -2.0 - 4.0);
        assert_abs_diff_eq!(InputSemantics::BestCase.extremum(a.view(), &lo, &up), 6.0 - 2.0);
    }

    #[test]
    fn test_argmax_abs_prefers_first_tie() {
        assert_eq!(argmax_abs(arr1(&[1.0, -3.0, 3.0]).view()), Some((1, 3.0)));
        assert_eq!(argmax_abs(arr1::<f64>(&[]).view()), None);
    }

    #[test]
    fn test_linf_tie_gives_difference_of_rows() {
        let net = ReluNetwork::new(
            vec![nlyap_core::LinearLayer::new(arr2(&[[1.0, 0.0]]), None).unwrap()],
            0.0,
        )
        .unwrap();
        let r = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let pieces = linf_kink_pieces(&r, arr1(&[2.0, -2.0]).view(), 1e-9, &net, None);
        assert_eq!(pieces.len(), 1);
        assert_abs_diff_eq!(pieces[0].grad_x[0], 1.0);
        assert_abs_diff_eq!(pieces[0].grad_x[1], 1.0);
    }
}
