//! Exact MILP encoding of `∂ϕ/∂x · v`.
//!
//! Forward-mode differentiation through the activation pattern chosen by an
//! existing encoding of ϕ(x):
//!
//! ```text
//! t_0 = v
//! y_k = W_k t_{k-1}
//! t_k = slope·y_k + (1 − slope)·β_k∘y_k
//! ```
//!
//! The products `β∘y` are encoded exactly with McCormick rows, so the
//! binaries of ϕ(x) are reused and no new ones are created. At a kink the
//! solver may pick either slope, which covers the whole Clarke set.

use crate::bounds::interval_affine;
use crate::encoder::ReluEncoding;
use nlyap_core::{ensure_dim, Bound, NlyapError, ReluNetwork, Result};
use nlyap_milp::{add_binary_continuous_product, LinExpr, MilpBuilder, VarId};

/// Output of [`add_network_gradient_times_vector`].
#[derive(Debug, Clone)]
pub struct GradientTimesVector {
    /// `∂ϕ/∂x · v`, one expression per network output.
    pub output: Vec<LinExpr<VarId>>,
    /// Interval bounds of each output.
    pub bounds: Vec<Bound>,
}

/// Encode `∂ϕ/∂x · v` for the state whose ϕ encoding owns `binaries`.
///
/// `binaries` are the model variables created when `encoding` was
/// materialized; `v_bounds` must be finite.
pub fn add_network_gradient_times_vector(
    milp: &mut MilpBuilder,
    network: &ReluNetwork,
    encoding: &ReluEncoding,
    binaries: &[VarId],
    v: &[LinExpr<VarId>],
    v_bounds: &[Bound],
    name: &str,
) -> Result<GradientTimesVector> {
    ensure_dim("tangent vector", network.in_dim(), v.len())?;
    ensure_dim("tangent bounds", network.in_dim(), v_bounds.len())?;
    ensure_dim("encoding binaries", encoding.num_binaries(), binaries.len())?;
    let slope = network.negative_slope();
    let last = network.num_layers() - 1;
    let mut t = v.to_vec();
    let mut t_bounds = v_bounds.to_vec();

    for (k, layer) in network.layers()[..last].iter().enumerate() {
        let y_bounds = interval_affine(&layer.weight, None, &t_bounds)?;
        let mut next = Vec::with_capacity(layer.out_features());
        let mut next_bounds = Vec::with_capacity(layer.out_features());
        for (j, y_bound) in y_bounds.iter().enumerate() {
            let y = LinExpr::combine(layer.weight.row(j), &t, 0.0);
            let pre = encoding.preactivation_bound(k, j);
            let (expr, bound) = if pre.lower >= 0.0 {
                (y, *y_bound)
            } else if pre.upper <= 0.0 {
                (y.scaled(slope), y_bound.scale(slope))
            } else {
                let column = encoding.unit_binary[k][j].ok_or_else(|| {
                    NlyapError::InvalidConfig(format!(
                        "unit [{k}][{j}] spans zero but has no activation binary"
                    ))
                })?;
                let product = add_binary_continuous_product(
                    milp,
                    binaries[column],
                    &y,
                    *y_bound,
                    &format!("{name}[{k}][{j}]"),
                )?;
                let mut expr = y.scaled(slope);
                expr.add_term(product, 1.0 - slope);
                (expr, y_bound.union(&y_bound.scale(slope)))
            };
            next.push(expr);
            next_bounds.push(bound);
        }
        t = next;
        t_bounds = next_bounds;
    }

    let out_layer = &network.layers()[last];
    let bounds = interval_affine(&out_layer.weight, None, &t_bounds)?;
    let output = (0..out_layer.out_features())
        .map(|j| LinExpr::combine(out_layer.weight.row(j), &t, 0.0))
        .collect();
    Ok(GradientTimesVector { output, bounds })
}
