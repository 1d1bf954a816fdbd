//! Discrete-time systems whose transition is a (leaky) ReLU network.

use crate::discrete::{ControlledDiscreteTimeSystem, DiscreteTimeSystem, DynamicsVars};
use ndarray::{s, Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, BoxDomain, ReluNetwork, Result};
use nlyap_milp::{add_mixed_integer_linear_constraints, LinExpr, MilpBuilder, MilpSolver, VarId, VarType};
use nlyap_relu::{BoundMethod, ReluEncoder, ReluEncoding};

/// ∇ of every hidden pre-activation of `network` within `tol` of zero at `z`.
pub(crate) fn network_kink_gradients(network: &ReluNetwork, z: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
    let kinks = network.kinks(z, tol)?;
    if kinks.is_empty() {
        return Ok(Vec::new());
    }
    let pattern = network.activation_pattern(z)?;
    kinks
        .into_iter()
        .map(|(k, j)| Ok(network.preactivation_gradient(z, &pattern, k, j)?.0))
        .collect()
}

fn network_jacobian(network: &ReluNetwork, z: ArrayView1<f64>) -> Result<Array2<f64>> {
    Ok(network.jacobian_with_pattern(&network.activation_pattern(z)?))
}

/// Encode `network` over `domain`, shifting its output by `offset`.
fn encode_shifted(
    network: &ReluNetwork,
    domain: &BoxDomain,
    method: BoundMethod,
    solver: &dyn MilpSolver,
    offset: Option<&Array1<f64>>,
) -> Result<ReluEncoding> {
    let mut encoding = ReluEncoder::output_constraint(network, domain, method, solver)?;
    if let Some(offset) = offset {
        encoding.constraints.shift_output(offset.view())?;
    }
    Ok(encoding)
}

fn add_encoding(
    milp: &mut MilpBuilder,
    encoding: &ReluEncoding,
    input: &[LinExpr<VarId>],
    x_next: &[VarId],
    binary_type: VarType,
    name: &str,
) -> Result<DynamicsVars> {
    let vars = add_mixed_integer_linear_constraints(
        milp,
        &encoding.constraints,
        input,
        Some(x_next),
        &format!("{name}_slack"),
        &format!("{name}_binary"),
        binary_type,
    )?;
    let lo = encoding.constraints.output_lo.clone().unwrap_or_else(|| encoding.nn_output_lo());
    let up = encoding.constraints.output_up.clone().unwrap_or_else(|| encoding.nn_output_up());
    Ok(DynamicsVars {
        slack: vars.slack,
        binary: vars.binary,
        x_next_bounds: lo
            .iter()
            .zip(up.iter())
            .map(|(&l, &u)| nlyap_core::Bound::new(l, u))
            .collect(),
    })
}

/// x[n+1] = ϕ(x[n]).
#[derive(Debug, Clone)]
pub struct AutonomousReluSystem {
    network: ReluNetwork,
    x_domain: BoxDomain,
    pub method: BoundMethod,
}

impl AutonomousReluSystem {
    pub fn new(network: ReluNetwork, x_domain: BoxDomain) -> Result<Self> {
        ensure_dim("network input", x_domain.dim(), network.in_dim())?;
        ensure_dim("network output", x_domain.dim(), network.out_dim())?;
        Ok(Self {
            network,
            x_domain,
            method: BoundMethod::default(),
        })
    }

    pub fn network(&self) -> &ReluNetwork {
        &self.network
    }

    pub fn mixed_integer_constraints(&self, solver: &dyn MilpSolver) -> Result<ReluEncoding> {
        encode_shifted(&self.network, &self.x_domain, self.method, solver, None)
    }
}

impl DiscreteTimeSystem for AutonomousReluSystem {
    fn x_dim(&self) -> usize {
        self.x_domain.dim()
    }

    fn x_domain(&self) -> &BoxDomain {
        &self.x_domain
    }

    fn step_forward(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.network.forward(x)
    }

    fn add_dynamics_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<DynamicsVars> {
        let encoding = self.mixed_integer_constraints(solver)?;
        add_encoding(milp, &encoding, x, x_next, binary_type, name)
    }

    fn jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        network_jacobian(&self.network, x)
    }

    fn active_constraint_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
        network_kink_gradients(&self.network, x, tol)
    }
}

/// x[n+1] = ϕ(x[n]) − ϕ(x*) + x*, so x* is an equilibrium by construction.
#[derive(Debug, Clone)]
pub struct AutonomousReluSystemGivenEquilibrium {
    network: ReluNetwork,
    x_domain: BoxDomain,
    x_equilibrium: Array1<f64>,
    pub method: BoundMethod,
}

impl AutonomousReluSystemGivenEquilibrium {
    pub fn new(network: ReluNetwork, x_domain: BoxDomain, x_equilibrium: Array1<f64>) -> Result<Self> {
        ensure_dim("network input", x_domain.dim(), network.in_dim())?;
        ensure_dim("network output", x_domain.dim(), network.out_dim())?;
        ensure_dim("equilibrium", x_domain.dim(), x_equilibrium.len())?;
        Ok(Self {
            network,
            x_domain,
            x_equilibrium,
            method: BoundMethod::default(),
        })
    }

    pub fn x_equilibrium(&self) -> &Array1<f64> {
        &self.x_equilibrium
    }

    fn offset(&self) -> Result<Array1<f64>> {
        Ok(&self.x_equilibrium - &self.network.forward(self.x_equilibrium.view())?)
    }

    pub fn mixed_integer_constraints(&self, solver: &dyn MilpSolver) -> Result<ReluEncoding> {
        let offset = self.offset()?;
        encode_shifted(&self.network, &self.x_domain, self.method, solver, Some(&offset))
    }
}

impl DiscreteTimeSystem for AutonomousReluSystemGivenEquilibrium {
    fn x_dim(&self) -> usize {
        self.x_domain.dim()
    }

    fn x_domain(&self) -> &BoxDomain {
        &self.x_domain
    }

    fn step_forward(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(self.network.forward(x)? + self.offset()?)
    }

    fn add_dynamics_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<DynamicsVars> {
        let encoding = self.mixed_integer_constraints(solver)?;
        add_encoding(milp, &encoding, x, x_next, binary_type, name)
    }

    fn jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        network_jacobian(&self.network, x)
    }

    fn active_constraint_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
        network_kink_gradients(&self.network, x, tol)
    }
}

/// x[n+1] = ϕ(x[n], u[n]) − ϕ(x*, u*) + x*.
#[derive(Debug, Clone)]
pub struct ReluSystemGivenEquilibrium {
    network: ReluNetwork,
    x_domain: BoxDomain,
    u_domain: BoxDomain,
    x_equilibrium: Array1<f64>,
    u_equilibrium: Array1<f64>,
    pub method: BoundMethod,
}

impl ReluSystemGivenEquilibrium {
    pub fn new(
        network: ReluNetwork,
        x_domain: BoxDomain,
        u_domain: BoxDomain,
        x_equilibrium: Array1<f64>,
        u_equilibrium: Array1<f64>,
    ) -> Result<Self> {
        ensure_dim("network input", x_domain.dim() + u_domain.dim(), network.in_dim())?;
        ensure_dim("network output", x_domain.dim(), network.out_dim())?;
        ensure_dim("state equilibrium", x_domain.dim(), x_equilibrium.len())?;
        ensure_dim("input equilibrium", u_domain.dim(), u_equilibrium.len())?;
        Ok(Self {
            network,
            x_domain,
            u_domain,
            x_equilibrium,
            u_equilibrium,
            method: BoundMethod::default(),
        })
    }

    pub fn x_equilibrium(&self) -> &Array1<f64> {
        &self.x_equilibrium
    }

    pub fn u_equilibrium(&self) -> &Array1<f64> {
        &self.u_equilibrium
    }

    fn stack(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("state", self.x_domain.dim(), x.len())?;
        ensure_dim("control input", self.u_domain.dim(), u.len())?;
        Ok(x.iter().chain(u.iter()).copied().collect())
    }

    fn offset(&self) -> Result<Array1<f64>> {
        let z_star = self.stack(self.x_equilibrium.view(), self.u_equilibrium.view())?;
        Ok(&self.x_equilibrium - &self.network.forward(z_star.view())?)
    }

    /// Bundle with input `[x; u]` and output x[n+1].
    pub fn mixed_integer_constraints(&self, solver: &dyn MilpSolver) -> Result<ReluEncoding> {
        let offset = self.offset()?;
        let domain = self.x_domain.concat(&self.u_domain);
        encode_shifted(&self.network, &domain, self.method, solver, Some(&offset))
    }
}

impl ControlledDiscreteTimeSystem for ReluSystemGivenEquilibrium {
    fn x_dim(&self) -> usize {
        self.x_domain.dim()
    }

    fn u_dim(&self) -> usize {
        self.u_domain.dim()
    }

    fn x_domain(&self) -> &BoxDomain {
        &self.x_domain
    }

    fn u_domain(&self) -> &BoxDomain {
        &self.u_domain
    }

    fn step_forward(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Array1<f64>> {
        let z = self.stack(x, u)?;
        Ok(self.network.forward(z.view())? + self.offset()?)
    }

    fn add_dynamics_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        u: &[LinExpr<VarId>],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<DynamicsVars> {
        let encoding = self.mixed_integer_constraints(solver)?;
        let input: Vec<LinExpr<VarId>> = x.iter().chain(u).cloned().collect();
        add_encoding(milp, &encoding, &input, x_next, binary_type, name)
    }

    fn jacobian(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<(Array2<f64>, Array2<f64>)> {
        let z = self.stack(x, u)?;
        let jac = network_jacobian(&self.network, z.view())?;
        let nx = self.x_dim();
        Ok((jac.slice(s![.., ..nx]).to_owned(), jac.slice(s![.., nx..]).to_owned()))
    }

    fn active_constraint_gradients(
        &self,
        x: ArrayView1<f64>,
        u: ArrayView1<f64>,
        tol: f64,
    ) -> Result<Vec<(Array1<f64>, Array1<f64>)>> {
        let z = self.stack(x, u)?;
        let nx = self.x_dim();
        Ok(network_kink_gradients(&self.network, z.view(), tol)?
            .into_iter()
            .map(|g| (g.slice(s![..nx]).to_owned(), g.slice(s![nx..]).to_owned()))
            .collect())
    }
}
