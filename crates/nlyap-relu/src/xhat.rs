//! The network evaluated at x̂.
//!
//! x̂ copies the reference state x* on a configured index subset and the
//! decision state x everywhere else. Certificates and controllers subtract
//! ϕ(x̂) so that they vanish exactly where x agrees with x* on those indices.

use crate::bounds::BoundMethod;
use crate::encoder::ReluEncoder;
use ndarray::{Array1, ArrayView1};
use nlyap_core::{ensure_dim, Bound, BoxDomain, ReluNetwork, Result};
use nlyap_milp::{
    add_mixed_integer_linear_constraints, LinExpr, MilpBuilder, MilpSolver, MixedIntegerVars,
    VarId, VarType,
};

/// x̂ for a concrete state; `None` means x̂ = x*.
pub fn xhat(x: ArrayView1<f64>, x_reference: ArrayView1<f64>, xhat_indices: Option<&[usize]>) -> Array1<f64> {
    let Some(indices) = xhat_indices else {
        return x_reference.to_owned();
    };
    let mut out = x.to_owned();
    for &i in indices {
        out[i] = x_reference[i];
    }
    out
}

/// x̂ as expressions over the model variables of x.
pub fn xhat_exprs(
    x: &[LinExpr<VarId>],
    x_reference: ArrayView1<f64>,
    xhat_indices: &[usize],
) -> Vec<LinExpr<VarId>> {
    let mut out = x.to_vec();
    for &i in xhat_indices {
        out[i] = LinExpr::constant(x_reference[i]);
    }
    out
}

/// ϕ(x̂) inside a model.
#[derive(Debug, Clone)]
pub struct NetworkAtXhat {
    pub output: Vec<LinExpr<VarId>>,
    /// Bounds of ϕ(x̂) over the domain.
    pub bounds: Vec<Bound>,
    /// Slack and binary variables, absent when x̂ is the constant x*.
    pub vars: Option<MixedIntegerVars>,
}

/// Encode ϕ(x̂) given the model variables of x over `domain`.
///
/// With `xhat_indices == None`, x̂ is x* everywhere and ϕ(x̂) is a constant;
/// otherwise the network is encoded over `domain` with the x̂ coordinates pinned.
#[allow(clippy::too_many_arguments)]
pub fn compute_network_at_xhat(
    milp: &mut MilpBuilder,
    network: &ReluNetwork,
    x: &[LinExpr<VarId>],
    x_reference: ArrayView1<f64>,
    xhat_indices: Option<&[usize]>,
    domain: &BoxDomain,
    method: BoundMethod,
    solver: &dyn MilpSolver,
    name: &str,
) -> Result<NetworkAtXhat> {
    ensure_dim("x̂ reference", network.in_dim(), x_reference.len())?;
    domain.check_dim("x̂ domain", x.len())?;
    let Some(indices) = xhat_indices else {
        let value = network.forward(x_reference)?;
        return Ok(NetworkAtXhat {
            output: value.iter().map(|&v| LinExpr::constant(v)).collect(),
            bounds: value.iter().map(|&v| Bound::concrete(v)).collect(),
            vars: None,
        });
    };
    let xhat_domain = domain.with_fixed(indices, x_reference)?;
    let encoding = ReluEncoder::output_constraint(network, &xhat_domain, method, solver)?;
    let inputs = xhat_exprs(x, x_reference, indices);
    let vars = add_mixed_integer_linear_constraints(
        milp,
        &encoding.constraints,
        &inputs,
        None,
        &format!("{name}_slack"),
        &format!("{name}_binary"),
        VarType::Binary,
    )?;
    let bounds = encoding.bounds.output.clone();
    Ok(NetworkAtXhat {
        output: vars.output.clone(),
        bounds,
        vars: Some(vars),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_xhat_copies_reference_on_indices() {
        let x = arr1(&[1.0, 2.0, 3.0]);
        let r = arr1(&[0.0, -1.0, 0.5]);
        assert_eq!(xhat(x.view(), r.view(), Some(&[1])), arr1(&[1.0, -1.0, 3.0]));
        assert_eq!(xhat(x.view(), r.view(), Some(&[])), x);
        assert_eq!(xhat(x.view(), r.view(), None), r);
    }
}
