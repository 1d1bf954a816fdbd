//! Closed-loop composition of a forward system with a feedback controller.
//!
//! ```text
//! u[n]   = clip(ϕᵤ(x[n]) − ϕᵤ(x̂[n]) + u*, u_lo, u_up)
//! x[n+1] = f(x[n], u[n])
//! ```
//!
//! x̂ copies x* on `xhat_indices` and x elsewhere; without indices x̂ = x*.
//! The MILP shares the state variables between the controller and the
//! forward encoding, so a feasible point is one consistent (x, u, x[n+1]).

use crate::discrete::{ControlledDiscreteTimeSystem, DiscreteTimeSystem, DynamicsVars};
use crate::relu_system::network_kink_gradients;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use nlyap_core::{ensure_dim, Bound, BoxDomain, LinearLayer, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    add_mixed_integer_linear_constraints, add_saturation, ConstraintSink, LinExpr, MilpBuilder, MilpSolver,
    VarId, VarType,
};
use nlyap_relu::{compute_network_at_xhat, interval_affine, xhat, BoundMethod, ReluEncoder};
use tracing::debug;

/// The feedback law ϕᵤ.
#[derive(Debug, Clone)]
pub enum Controller {
    Network(ReluNetwork),
    /// A single affine map `W x + b`.
    Linear(LinearLayer),
}

impl Controller {
    pub fn in_dim(&self) -> usize {
        match self {
            Controller::Network(n) => n.in_dim(),
            Controller::Linear(l) => l.in_features(),
        }
    }

    pub fn out_dim(&self) -> usize {
        match self {
            Controller::Network(n) => n.out_dim(),
            Controller::Linear(l) => l.out_features(),
        }
    }

    pub fn evaluate(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        match self {
            Controller::Network(n) => n.forward(x),
            Controller::Linear(l) => {
                ensure_dim("controller input", l.in_features(), x.len())?;
                Ok(l.apply(x))
            }
        }
    }

    /// ∂ϕᵤ/∂x of the affine piece realized at `x`.
    pub fn jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        match self {
            Controller::Network(n) => Ok(n.jacobian_with_pattern(&n.activation_pattern(x)?)),
            Controller::Linear(l) => Ok(l.weight.clone()),
        }
    }

    fn kink_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
        match self {
            Controller::Network(n) => network_kink_gradients(n, x, tol),
            Controller::Linear(_) => Ok(Vec::new()),
        }
    }
}

/// Variables created by [`FeedbackSystem::add_dynamics_mip_constraint`].
#[derive(Debug, Clone)]
pub struct FeedbackVars {
    /// The saturated control.
    pub u: Vec<VarId>,
    /// Bounds of the saturated control.
    pub u_bounds: Vec<Bound>,
    pub forward: DynamicsVars,
    pub controller_slack: Vec<VarId>,
    pub controller_binary: Vec<VarId>,
}

/// Pre-saturation controller output inside a model.
struct PreSaturation {
    output: Vec<LinExpr<VarId>>,
    bounds: Vec<Bound>,
    slack: Vec<VarId>,
    binary: Vec<VarId>,
}

/// x[n+1] = f(x[n], u(x[n])) with a saturated feedback controller.
#[derive(Debug, Clone)]
pub struct FeedbackSystem<F> {
    forward: F,
    controller: Controller,
    x_equilibrium: Array1<f64>,
    u_equilibrium: Array1<f64>,
    u_limits: BoxDomain,
    xhat_indices: Option<Vec<usize>>,
    /// Bound propagation used for the controller network.
    pub controller_bound_method: BoundMethod,
}

impl<F: ControlledDiscreteTimeSystem> FeedbackSystem<F> {
    /// `u_limits` may have infinite entries; an infinite side is not saturated.
    pub fn new(
        forward: F,
        controller: Controller,
        x_equilibrium: Array1<f64>,
        u_equilibrium: Array1<f64>,
        u_limits: BoxDomain,
    ) -> Result<Self> {
        ensure_dim("controller input", forward.x_dim(), controller.in_dim())?;
        ensure_dim("controller output", forward.u_dim(), controller.out_dim())?;
        ensure_dim("state equilibrium", forward.x_dim(), x_equilibrium.len())?;
        ensure_dim("input equilibrium", forward.u_dim(), u_equilibrium.len())?;
        u_limits.check_dim("control limits", forward.u_dim())?;
        Ok(Self {
            forward,
            controller,
            x_equilibrium,
            u_equilibrium,
            u_limits,
            xhat_indices: None,
            controller_bound_method: BoundMethod::Ia,
        })
    }

    /// Let u differ from u* unless x matches x* on `indices`.
    pub fn with_xhat_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        if let Some(&i) = indices.iter().find(|&&i| i >= self.forward.x_dim()) {
            return Err(NlyapError::InvalidConfig(format!(
                "x̂ index {i} out of range for state dimension {}",
                self.forward.x_dim()
            )));
        }
        self.xhat_indices = Some(indices);
        Ok(self)
    }

    pub fn forward_system(&self) -> &F {
        &self.forward
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn x_equilibrium(&self) -> &Array1<f64> {
        &self.x_equilibrium
    }

    pub fn u_equilibrium(&self) -> &Array1<f64> {
        &self.u_equilibrium
    }

    pub fn u_limits(&self) -> &BoxDomain {
        &self.u_limits
    }

    pub fn xhat_indices(&self) -> Option<&[usize]> {
        self.xhat_indices.as_deref()
    }

    fn u_pre_saturation(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        let x_hat = xhat(x, self.x_equilibrium.view(), self.xhat_indices());
        Ok(self.controller.evaluate(x)? - self.controller.evaluate(x_hat.view())? + &self.u_equilibrium)
    }

    /// The saturated control at `x`.
    pub fn compute_u(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("state", self.forward.x_dim(), x.len())?;
        let mut u = self.u_pre_saturation(x)?;
        for (i, v) in u.iter_mut().enumerate() {
            *v = v.max(self.u_limits.lo()[i]).min(self.u_limits.up()[i]);
        }
        Ok(u)
    }

    /// One control per row.
    pub fn compute_u_batch(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((x.nrows(), self.forward.u_dim()));
        for (i, row) in x.rows().into_iter().enumerate() {
            out.row_mut(i).assign(&self.compute_u(row)?);
        }
        Ok(out)
    }

    /// ∂x̂/∂x as a matrix: identity off the x̂ indices, zero on them.
    fn xhat_selection(&self) -> Option<Array2<f64>> {
        let indices = self.xhat_indices.as_ref()?;
        let mut sel = Array2::eye(self.forward.x_dim());
        for &i in indices {
            sel[[i, i]] = 0.0;
        }
        Some(sel)
    }

    /// ∂u_pre/∂x before saturation.
    fn pre_saturation_jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        let mut jac = self.controller.jacobian(x)?;
        if let Some(sel) = self.xhat_selection() {
            let x_hat = xhat(x, self.x_equilibrium.view(), self.xhat_indices());
            jac -= &self.controller.jacobian(x_hat.view())?.dot(&sel);
        }
        Ok(jac)
    }

    /// ∂u/∂x; rows of saturated inputs are zero.
    pub fn control_jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        let u_pre = self.u_pre_saturation(x)?;
        let mut jac = self.pre_saturation_jacobian(x)?;
        for (j, mut row) in jac.axis_iter_mut(Axis(0)).enumerate() {
            if u_pre[j] <= self.u_limits.lo()[j] || u_pre[j] >= self.u_limits.up()[j] {
                row.fill(0.0);
            }
        }
        Ok(jac)
    }

    fn add_pre_saturation(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<PreSaturation> {
        let domain = self.forward.x_domain();
        match &self.controller {
            Controller::Network(network) => {
                let encoding =
                    ReluEncoder::output_constraint(network, domain, self.controller_bound_method, solver)?;
                let at_x = add_mixed_integer_linear_constraints(
                    milp,
                    &encoding.constraints,
                    x,
                    None,
                    &format!("{name}_slack"),
                    &format!("{name}_binary"),
                    binary_type,
                )?;
                let at_xhat = compute_network_at_xhat(
                    milp,
                    network,
                    x,
                    self.x_equilibrium.view(),
                    self.xhat_indices(),
                    domain,
                    self.controller_bound_method,
                    solver,
                    &format!("{name}_xhat"),
                )?;
                let mut slack = at_x.slack;
                let mut binary = at_x.binary;
                if let Some(vars) = at_xhat.vars {
                    slack.extend(vars.slack);
                    binary.extend(vars.binary);
                }
                let (output, bounds) = at_x
                    .output
                    .iter()
                    .zip(&at_xhat.output)
                    .zip(encoding.bounds.output.iter().zip(&at_xhat.bounds))
                    .zip(self.u_equilibrium.iter())
                    .map(|(((phi, phi_hat), (b, b_hat)), &u_star)| {
                        (
                            phi.clone() - phi_hat + u_star,
                            Bound::new(b.lower - b_hat.upper + u_star, b.upper - b_hat.lower + u_star),
                        )
                    })
                    .unzip();
                Ok(PreSaturation {
                    output,
                    bounds,
                    slack,
                    binary,
                })
            }
            Controller::Linear(layer) => {
                // W x + b − (W x̂ + b) = W (x − x̂), nonzero only where x̂ = x*.
                let n = self.forward.x_dim();
                let all: Vec<usize> = (0..n).collect();
                let indices = self.xhat_indices().unwrap_or(&all);
                let mut diff = vec![LinExpr::constant(0.0); n];
                let mut diff_bounds = vec![Bound::concrete(0.0); n];
                for &i in indices {
                    diff[i] = x[i].clone() + (-self.x_equilibrium[i]);
                    diff_bounds[i] = Bound::new(
                        domain.lo()[i] - self.x_equilibrium[i],
                        domain.up()[i] - self.x_equilibrium[i],
                    );
                }
                let bounds = interval_affine(&layer.weight, Some(&self.u_equilibrium), &diff_bounds)?;
                let output = (0..layer.out_features())
                    .map(|j| LinExpr::combine(layer.weight.row(j), &diff, self.u_equilibrium[j]))
                    .collect();
                Ok(PreSaturation {
                    output,
                    bounds,
                    slack: Vec::new(),
                    binary: Vec::new(),
                })
            }
        }
    }

    /// Constrain the model variables `u` to the saturated controller output at `x`.
    ///
    /// Returns the controller slacks and binaries plus the bounds of `u`.
    pub fn add_controller_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        u: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<(Vec<VarId>, Vec<VarId>, Vec<Bound>)> {
        ensure_dim("controller state", self.forward.x_dim(), x.len())?;
        ensure_dim("controller output", self.forward.u_dim(), u.len())?;
        let pre = self.add_pre_saturation(milp, x, solver, binary_type, name)?;
        let mut binary = pre.binary;
        let mut u_bounds = Vec::with_capacity(u.len());
        for (j, (expr, &pre_bound)) in pre.output.iter().zip(&pre.bounds).enumerate() {
            let (lo, up) = (self.u_limits.lo()[j], self.u_limits.up()[j]);
            let sat = add_saturation(milp, expr, pre_bound, lo, up, &format!("{name}_saturation[{j}]"))?;
            binary.extend(sat.binaries);
            let bound = Bound::new(
                pre_bound.lower.max(lo).min(up),
                pre_bound.upper.min(up).max(lo),
            );
            let info = milp.var(u[j]);
            let (lb, ub) = (info.lb.max(bound.lower), info.ub.min(bound.upper));
            milp.set_var_bounds(u[j], lb, ub);
            milp.add_eq(LinExpr::var(u[j]) - &sat.output, 0.0, &format!("{name}_u[{j}]"));
            u_bounds.push(bound);
        }
        Ok((pre.slack, binary, u_bounds))
    }

    /// Encode one closed-loop step: fresh `u` variables, the forward dynamics
    /// and the controller, all sharing `x`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dynamics_mip_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<FeedbackVars> {
        let u = milp.add_free_vars(&format!("{name}_u"), self.forward.u_dim());
        let u_exprs: Vec<LinExpr<VarId>> = u.iter().map(|&v| LinExpr::var(v)).collect();
        let forward = self.forward.add_dynamics_constraint(
            milp,
            x,
            &u_exprs,
            x_next,
            solver,
            binary_type,
            &format!("{name}_forward"),
        )?;
        let (controller_slack, controller_binary, u_bounds) =
            self.add_controller_constraint(milp, x, &u, solver, binary_type, &format!("{name}_controller"))?;
        debug!(
            forward_binaries = forward.binary.len(),
            controller_binaries = controller_binary.len(),
            "encoded closed-loop step"
        );
        Ok(FeedbackVars {
            u,
            u_bounds,
            forward,
            controller_slack,
            controller_binary,
        })
    }
}

impl<F: ControlledDiscreteTimeSystem> DiscreteTimeSystem for FeedbackSystem<F> {
    fn x_dim(&self) -> usize {
        self.forward.x_dim()
    }

    fn x_domain(&self) -> &BoxDomain {
        self.forward.x_domain()
    }

    fn step_forward(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        let u = self.compute_u(x)?;
        self.forward.step_forward(x, u.view())
    }

    fn possible_dx(&self, x: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        let u = self.compute_u(x)?;
        self.forward.possible_dx(x, u.view())
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
        let vars = self.add_dynamics_mip_constraint(milp, x, x_next, solver, binary_type, name)?;
        let mut out = vars.forward;
        out.extend(DynamicsVars {
            slack: vars.controller_slack,
            binary: vars.controller_binary,
            x_next_bounds: Vec::new(),
        });
        Ok(out)
    }

    fn jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        let u = self.compute_u(x)?;
        let (fx, fu) = self.forward.jacobian(x, u.view())?;
        Ok(fx + fu.dot(&self.control_jacobian(x)?))
    }

    fn active_constraint_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
        let u_pre = self.u_pre_saturation(x)?;
        let (lo, up) = (self.u_limits.lo(), self.u_limits.up());
        let mut out = Vec::new();

        let any_unsaturated = (0..u_pre.len()).any(|j| u_pre[j] > lo[j] && u_pre[j] < up[j]);
        if any_unsaturated {
            out.extend(self.controller.kink_gradients(x, tol)?);
            if let Some(sel) = self.xhat_selection() {
                let x_hat = xhat(x, self.x_equilibrium.view(), self.xhat_indices());
                out.extend(
                    self.controller
                        .kink_gradients(x_hat.view(), tol)?
                        .into_iter()
                        .map(|g| sel.t().dot(&g))
                        .filter(|g| g.iter().any(|v| *v != 0.0)),
                );
            }
        }

        let pre_jac = self.pre_saturation_jacobian(x)?;
        for j in 0..u_pre.len() {
            if (u_pre[j] - lo[j]).abs() <= tol || (u_pre[j] - up[j]).abs() <= tol {
                out.push(pre_jac.row(j).to_owned());
            }
        }

        let u = self.compute_u(x)?;
        let du_dx = self.control_jacobian(x)?;
        for (gx, gu) in self.forward.active_constraint_gradients(x, u.view(), tol)? {
            out.push(gx + du_dx.t().dot(&gu));
        }
        Ok(out)
    }
}
