//! Bound propagation through leaky ReLU networks.
//!
//! Three strategies with increasing precision and cost:
//! - Interval arithmetic: one pass, loosest bounds
//! - LP: one relaxed solve per bound, binaries relaxed to [0, 1]
//! - MIP: one exact solve per bound, tightest
//!
//! `IaThenMip` runs interval arithmetic and only pays for MIP solves on
//! hidden units whose interval spans zero, i.e. the units that would get a
//! binary.

use ndarray::{Array1, Array2};
use nlyap_core::{Bound, BoxDomain, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    add_leaky_relu, vars_to_exprs, LinExpr, MilpBuilder, MilpSolver, ObjectiveSense, SolveStatus,
    VarId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Strategy used to bound pre-activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundMethod {
    /// Interval arithmetic
    #[default]
    Ia,
    /// Linear programming relaxation of the exact encoding
    Lp,
    /// Exact mixed-integer program
    Mip,
    /// Interval arithmetic, tightened by MIP on units spanning zero
    IaThenMip,
}

impl BoundMethod {
    pub fn needs_solver(self) -> bool {
        !matches!(self, BoundMethod::Ia)
    }
}

/// Bounds of every hidden pre-activation and of the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBounds {
    /// `preactivation[k][j]` bounds unit `j` of hidden layer `k`.
    pub preactivation: Vec<Vec<Bound>>,
    pub output: Vec<Bound>,
}

impl NetworkBounds {
    pub fn output_lo(&self) -> Array1<f64> {
        self.output.iter().map(|b| b.lower).collect()
    }

    pub fn output_up(&self) -> Array1<f64> {
        self.output.iter().map(|b| b.upper).collect()
    }

    /// Number of hidden units whose bound strictly spans zero.
    pub fn num_unstable(&self) -> usize {
        self.preactivation
            .iter()
            .flatten()
            .filter(|b| b.spans_zero())
            .count()
    }

    /// True when every bound of `self` lies inside the matching bound of `other`, within `tol`.
    pub fn is_within(&self, other: &NetworkBounds, tol: f64) -> bool {
        let inside = |a: &Bound, b: &Bound| a.lower >= b.lower - tol && a.upper <= b.upper + tol;
        self.output.iter().zip(&other.output).all(|(a, b)| inside(a, b))
            && self
                .preactivation
                .iter()
                .flatten()
                .zip(other.preactivation.iter().flatten())
                .all(|(a, b)| inside(a, b))
    }
}

/// Interval image of `W h + b` for `h` in the box `input`.
///
/// Uses `W⁺l + W⁻u + b <= W h + b <= W⁺u + W⁻l + b`.
pub fn interval_affine(weight: &Array2<f64>, bias: Option<&Array1<f64>>, input: &[Bound]) -> Result<Vec<Bound>> {
    nlyap_core::ensure_dim("interval input", weight.ncols(), input.len())?;
    (0..weight.nrows())
        .map(|i| {
            let b = bias.map_or(0.0, |b| b[i]);
            let (mut lo, mut up) = (b, b);
            for (j, &w) in weight.row(i).iter().enumerate() {
                if w > 0.0 {
                    lo += w * input[j].lower;
                    up += w * input[j].upper;
                } else if w < 0.0 {
                    lo += w * input[j].upper;
                    up += w * input[j].lower;
                }
            }
            Bound::checked(lo, up, i)
        })
        .collect()
}

/// Interval image of the leaky ReLU `max(z, slope·z)`.
pub fn leaky_relu_interval(bound: Bound, slope: f64) -> Bound {
    let f = |z: f64| if z >= 0.0 { z } else { slope * z };
    Bound::new(f(bound.lower), f(bound.upper))
}

/// Interval arithmetic bounds over `domain`.
pub fn interval_bounds(network: &ReluNetwork, domain: &BoxDomain) -> Result<NetworkBounds> {
    domain.check_dim("network input domain", network.in_dim())?;
    let last = network.num_layers() - 1;
    let mut h = domain.bounds();
    let mut preactivation = Vec::with_capacity(last);
    for layer in &network.layers()[..last] {
        let z = interval_affine(&layer.weight, layer.bias.as_ref(), &h)?;
        h = z
            .iter()
            .map(|b| leaky_relu_interval(*b, network.negative_slope()))
            .collect();
        preactivation.push(z);
    }
    let output = interval_affine(&network.layers()[last].weight, network.layers()[last].bias.as_ref(), &h)?;
    Ok(NetworkBounds {
        preactivation,
        output,
    })
}

/// Compute bounds with the chosen method.
///
/// `solver` is only used by the LP and MIP based methods. The encoding used
/// for the solves is rebuilt from the current parameters on every call.
pub fn propagate_bounds(
    network: &ReluNetwork,
    domain: &BoxDomain,
    method: BoundMethod,
    solver: &dyn MilpSolver,
) -> Result<NetworkBounds> {
    let ia = interval_bounds(network, domain)?;
    if method == BoundMethod::Ia {
        return Ok(ia);
    }
    if !domain.is_finite() {
        return Err(NlyapError::InvalidDomain(
            "optimization-based bounds need a finite input box".to_string(),
        ));
    }
    debug!(?method, layers = network.num_layers(), "propagating bounds");

    let mut milp = MilpBuilder::new();
    let x = milp.add_continuous_vars("x", domain.lo(), domain.up());
    let mut h: Vec<LinExpr<VarId>> = vars_to_exprs(&x);
    let mut h_bounds = domain.bounds();
    let last = network.num_layers() - 1;
    let mut preactivation = Vec::with_capacity(last);

    for (k, layer) in network.layers().iter().enumerate() {
        let z: Vec<LinExpr<VarId>> = (0..layer.out_features())
            .map(|j| LinExpr::combine(layer.weight.row(j), &h, layer.bias_at(j)))
            .collect();
        let z_ia = interval_affine(&layer.weight, layer.bias.as_ref(), &h_bounds)?;
        let is_hidden = k < last;
        let mut z_bounds = Vec::with_capacity(z.len());
        for (j, (expr, ia_bound)) in z.iter().zip(&z_ia).enumerate() {
            let tighten = match method {
                BoundMethod::Ia => false,
                BoundMethod::Lp | BoundMethod::Mip => true,
                BoundMethod::IaThenMip => is_hidden && ia_bound.spans_zero(),
            };
            let bound = if tighten && !ia_bound.is_constant() {
                let relaxed = method == BoundMethod::Lp;
                let (lo, up) = solve_bounds(&milp, expr, relaxed, solver)?;
                Bound::checked(lo.max(ia_bound.lower), up.min(ia_bound.upper), j)?
            } else {
                *ia_bound
            };
            z_bounds.push(bound);
        }
        trace!(layer = k, "bounded layer");
        if is_hidden {
            let mut next = Vec::with_capacity(z.len());
            let mut next_bounds = Vec::with_capacity(z.len());
            for (j, (expr, bound)) in z.iter().zip(&z_bounds).enumerate() {
                let unit = add_leaky_relu(
                    &mut milp,
                    expr,
                    *bound,
                    network.negative_slope(),
                    &format!("bound_relu[{k}][{j}]"),
                )?;
                next.push(unit.output);
                next_bounds.push(unit.bound);
            }
            h = next;
            h_bounds = next_bounds;
            preactivation.push(z_bounds);
        } else {
            return Ok(NetworkBounds {
                preactivation,
                output: z_bounds,
            });
        }
    }
    Err(NlyapError::InvalidConfig("network has no output layer".to_string()))
}

/// Minimize and maximize `expr` over `milp` (or its relaxation).
fn solve_bounds(
    milp: &MilpBuilder,
    expr: &LinExpr<VarId>,
    relaxed: bool,
    solver: &dyn MilpSolver,
) -> Result<(f64, f64)> {
    let mut model = if relaxed { milp.relaxed() } else { milp.clone() };
    let mut values = [0.0; 2];
    for (slot, sense) in values
        .iter_mut()
        .zip([ObjectiveSense::Minimize, ObjectiveSense::Maximize])
    {
        model.set_objective(expr.clone(), sense);
        let sol = solver.solve(&model)?;
        *slot = match sol.status {
            SolveStatus::Optimal => sol.optimal_objective("bound propagation")?,
            SolveStatus::Infeasible => {
                return Err(NlyapError::UnexpectedInfeasible(
                    "bound propagation model has no feasible input".to_string(),
                ))
            }
            status => {
                return Err(NlyapError::Solver(format!(
                    "bound propagation solve returned {status:?}"
                )))
            }
        };
    }
    Ok((values[0], values[1]))
}
