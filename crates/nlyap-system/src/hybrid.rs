//! Hybrid piecewise-affine systems.
//!
//! Mode `i` is active on the polytope `P_i [x; u] <= q_i` and maps
//! `x[n+1] = A_i x + B_i u + g_i`. The MILP picks one mode with a one-hot
//! binary γ and splits the state-input vector into per-mode copies:
//!
//! ```text
//! Σ γ_i = 1,   [x; u] = Σ s_i,
//! lo·γ_i <= s_i <= up·γ_i,   P_i s_i <= q_i γ_i,
//! x[n+1] = Σ (A_i s_i^x + B_i s_i^u + g_i γ_i)
//! ```
//!
//! Only the selected copy is nonzero, so the encoding reproduces the mode
//! map exactly. Where mode polytopes overlap the solver may pick any mode
//! containing the point; evaluation uses the first one.

use crate::discrete::{ControlledDiscreteTimeSystem, DiscreteTimeSystem, DynamicsVars};
use ndarray::{s, Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, Bound, BoxDomain, NlyapError, Result};
use nlyap_milp::{
    add_mixed_integer_linear_constraints, BlockExpr, BundleBuilder, ConstraintSink, LinExpr, MilpBuilder,
    MilpSolver, MixedIntegerConstraints, VarId, VarType,
};
use nlyap_relu::interval_affine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Slack used when testing polytope membership.
pub const MODE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridMode {
    pub a: Array2<f64>,
    /// `x_dim × u_dim`; zero columns for autonomous systems.
    pub b: Array2<f64>,
    pub g: Array1<f64>,
    /// Polytope over `[x; u]`.
    pub p: Array2<f64>,
    pub q: Array1<f64>,
}

impl HybridMode {
    fn contains(&self, z: ArrayView1<f64>, tol: f64) -> bool {
        self.p.dot(&z).iter().zip(self.q.iter()).all(|(lhs, rhs)| *lhs <= rhs + tol)
    }

    fn apply(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Array1<f64> {
        self.a.dot(&x) + self.b.dot(&u) + &self.g
    }
}

/// A controlled hybrid linear system.
#[derive(Debug, Clone)]
pub struct HybridLinearSystem {
    x_domain: BoxDomain,
    u_domain: BoxDomain,
    modes: Vec<HybridMode>,
}

impl HybridLinearSystem {
    pub fn new(x_domain: BoxDomain, u_domain: BoxDomain) -> Result<Self> {
        if !x_domain.is_finite() || !u_domain.is_finite() {
            return Err(NlyapError::InvalidDomain(
                "hybrid systems need finite state and input boxes".to_string(),
            ));
        }
        Ok(Self {
            x_domain,
            u_domain,
            modes: Vec::new(),
        })
    }

    pub fn add_mode(
        &mut self,
        a: Array2<f64>,
        b: Array2<f64>,
        g: Array1<f64>,
        p: Array2<f64>,
        q: Array1<f64>,
    ) -> Result<()> {
        let (nx, nu) = (self.x_domain.dim(), self.u_domain.dim());
        ensure_dim("mode A rows", nx, a.nrows())?;
        ensure_dim("mode A columns", nx, a.ncols())?;
        ensure_dim("mode B rows", nx, b.nrows())?;
        ensure_dim("mode B columns", nu, b.ncols())?;
        ensure_dim("mode g", nx, g.len())?;
        ensure_dim("mode P columns", nx + nu, p.ncols())?;
        ensure_dim("mode q", p.nrows(), q.len())?;
        self.modes.push(HybridMode { a, b, g, p, q });
        Ok(())
    }

    pub fn modes(&self) -> &[HybridMode] {
        &self.modes
    }

    pub fn num_modes(&self) -> usize {
        self.modes.len()
    }

    fn stack(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("state", self.x_domain.dim(), x.len())?;
        ensure_dim("control input", self.u_domain.dim(), u.len())?;
        Ok(x.iter().chain(u.iter()).copied().collect())
    }

    /// Every mode whose polytope contains `(x, u)`.
    pub fn active_modes(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Vec<usize>> {
        let z = self.stack(x, u)?;
        Ok((0..self.modes.len())
            .filter(|&i| self.modes[i].contains(z.view(), MODE_TOLERANCE))
            .collect())
    }

    /// First mode containing `(x, u)`.
    pub fn mode(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Option<usize>> {
        Ok(self.active_modes(x, u)?.first().copied())
    }

    fn mode_or_err(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<&HybridMode> {
        match self.mode(x, u)? {
            Some(i) => Ok(&self.modes[i]),
            None => Err(NlyapError::InvalidDomain(format!(
                "no mode contains x = {x}, u = {u}"
            ))),
        }
    }

    /// The one-hot mode selection bundle with input `[x; u]` and output x[n+1].
    pub fn mixed_integer_constraints(&self) -> Result<(MixedIntegerConstraints, Vec<Bound>)> {
        if self.modes.is_empty() {
            return Err(NlyapError::InvalidConfig("hybrid system has no modes".to_string()));
        }
        let domain = self.x_domain.concat(&self.u_domain);
        let nx = self.x_domain.dim();
        let n = domain.dim();
        let mut b = BundleBuilder::new(n);
        let inputs = b.inputs();
        let mut gamma_sum = BlockExpr::new();
        let mut copy_sum = vec![BlockExpr::new(); n];
        let mut outputs = vec![BlockExpr::new(); nx];
        let mut out_bounds: Option<Vec<Bound>> = None;

        for (i, mode) in self.modes.iter().enumerate() {
            let gamma = b.add_binary(&format!("gamma[{i}]"));
            let copy: Vec<_> = (0..n)
                .map(|j| {
                    b.add_continuous(
                        &format!("mode[{i}]_copy[{j}]"),
                        domain.lo()[j].min(0.0),
                        domain.up()[j].max(0.0),
                    )
                })
                .collect();
            for j in 0..n {
                let mut e = BlockExpr::var(copy[j]);
                e.add_term(gamma, -domain.up()[j]);
                b.add_le(e, 0.0, &format!("mode[{i}]_copy_up[{j}]"));
                let mut e = BlockExpr::var(copy[j]);
                e.add_term(gamma, -domain.lo()[j]);
                b.add_ge(e, 0.0, &format!("mode[{i}]_copy_lo[{j}]"));
                copy_sum[j].add_term(copy[j], 1.0);
            }
            for (r, &qr) in mode.q.iter().enumerate() {
                let mut e = BlockExpr::from_row(mode.p.row(r), &copy, 0.0);
                e.add_term(gamma, -qr);
                b.add_le(e, 0.0, &format!("mode[{i}]_polytope[{r}]"));
            }
            for (k, out) in outputs.iter_mut().enumerate() {
                out.add_scaled(&BlockExpr::from_row(mode.a.row(k), &copy[..nx], 0.0), 1.0);
                out.add_scaled(&BlockExpr::from_row(mode.b.row(k), &copy[nx..], 0.0), 1.0);
                out.add_term(gamma, mode.g[k]);
            }
            gamma_sum.add_term(gamma, 1.0);

            let ab = ndarray::concatenate![ndarray::Axis(1), mode.a, mode.b];
            let mode_bounds = interval_affine(&ab, Some(&mode.g), &domain.bounds())?;
            out_bounds = Some(match out_bounds {
                None => mode_bounds,
                Some(prev) => prev.iter().zip(&mode_bounds).map(|(p, m)| p.union(m)).collect(),
            });
        }
        b.add_eq(gamma_sum, 1.0, "one_mode");
        for (j, sum) in copy_sum.into_iter().enumerate() {
            b.add_eq(sum - &inputs[j], 0.0, &format!("copy_sum[{j}]"));
        }
        let out_bounds = out_bounds.unwrap_or_default();
        let lo: Array1<f64> = out_bounds.iter().map(|b| b.lower).collect();
        let up: Array1<f64> = out_bounds.iter().map(|b| b.upper).collect();
        let bundle = b.finish(&outputs, Some((domain.lo().clone(), domain.up().clone())), Some((lo, up)))?;
        debug!(modes = self.modes.len(), "encoded hybrid system");
        Ok((bundle, out_bounds))
    }
}

impl ControlledDiscreteTimeSystem for HybridLinearSystem {
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
        Ok(self.mode_or_err(x, u)?.apply(x, u))
    }

    fn possible_dx(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        Ok(self
            .active_modes(x, u)?
            .into_iter()
            .map(|i| self.modes[i].apply(x, u))
            .collect())
    }

    fn add_dynamics_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        u: &[LinExpr<VarId>],
        x_next: &[VarId],
        _solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<DynamicsVars> {
        ensure_dim("state", self.x_dim(), x.len())?;
        ensure_dim("control input", self.u_dim(), u.len())?;
        let (bundle, x_next_bounds) = self.mixed_integer_constraints()?;
        let input: Vec<LinExpr<VarId>> = x.iter().chain(u).cloned().collect();
        let vars = add_mixed_integer_linear_constraints(
            milp,
            &bundle,
            &input,
            Some(x_next),
            &format!("{name}_slack"),
            &format!("{name}_gamma"),
            binary_type,
        )?;
        Ok(DynamicsVars {
            slack: vars.slack,
            binary: vars.binary,
            x_next_bounds,
        })
    }

    fn jacobian(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<(Array2<f64>, Array2<f64>)> {
        let mode = self.mode_or_err(x, u)?;
        Ok((mode.a.clone(), mode.b.clone()))
    }

    fn active_constraint_gradients(
        &self,
        x: ArrayView1<f64>,
        u: ArrayView1<f64>,
        tol: f64,
    ) -> Result<Vec<(Array1<f64>, Array1<f64>)>> {
        let mode = self.mode_or_err(x, u)?;
        let z = self.stack(x, u)?;
        let nx = self.x_dim();
        Ok(mode
            .p
            .rows()
            .into_iter()
            .zip(mode.q.iter())
            .filter(|(row, &q)| (row.dot(&z) - q).abs() <= tol)
            .map(|(row, _)| (row.slice(s![..nx]).to_owned(), row.slice(s![nx..]).to_owned()))
            .collect())
    }
}

/// A hybrid linear system without input: `x[n+1] = A_i x + g_i` on `P_i x <= q_i`.
#[derive(Debug, Clone)]
pub struct AutonomousHybridLinearSystem {
    inner: HybridLinearSystem,
    no_input: Array1<f64>,
}

impl AutonomousHybridLinearSystem {
    pub fn new(x_domain: BoxDomain) -> Result<Self> {
        let u_domain = BoxDomain::new(Array1::zeros(0), Array1::zeros(0))?;
        Ok(Self {
            inner: HybridLinearSystem::new(x_domain, u_domain)?,
            no_input: Array1::zeros(0),
        })
    }

    pub fn add_mode(&mut self, a: Array2<f64>, g: Array1<f64>, p: Array2<f64>, q: Array1<f64>) -> Result<()> {
        let nx = self.inner.x_domain.dim();
        self.inner.add_mode(a, Array2::zeros((nx, 0)), g, p, q)
    }

    pub fn modes(&self) -> &[HybridMode] {
        self.inner.modes()
    }

    pub fn num_modes(&self) -> usize {
        self.inner.num_modes()
    }

    pub fn active_modes(&self, x: ArrayView1<f64>) -> Result<Vec<usize>> {
        self.inner.active_modes(x, self.no_input.view())
    }

    pub fn mode(&self, x: ArrayView1<f64>) -> Result<Option<usize>> {
        self.inner.mode(x, self.no_input.view())
    }

    pub fn mixed_integer_constraints(&self) -> Result<(MixedIntegerConstraints, Vec<Bound>)> {
        self.inner.mixed_integer_constraints()
    }
}

impl DiscreteTimeSystem for AutonomousHybridLinearSystem {
    fn x_dim(&self) -> usize {
        self.inner.x_domain.dim()
    }

    fn x_domain(&self) -> &BoxDomain {
        &self.inner.x_domain
    }

    fn step_forward(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.inner.step_forward(x, self.no_input.view())
    }

    fn possible_dx(&self, x: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        self.inner.possible_dx(x, self.no_input.view())
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
        self.inner
            .add_dynamics_constraint(milp, x, &[], x_next, solver, binary_type, name)
    }

    fn jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        Ok(self.inner.jacobian(x, self.no_input.view())?.0)
    }

    fn active_constraint_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
        Ok(self
            .inner
            .active_constraint_gradients(x, self.no_input.view(), tol)?
            .into_iter()
            .map(|(gx, _)| gx)
            .collect())
    }
}
