//! Discrete-time Lyapunov conditions.
//!
//! For `x[n+1] = f(x[n])` and `V(x) = ϕ(x) − ϕ(x̂) + λ‖R(x̄ − x̄*)‖₁`:
//!
//! - positivity: `V(x) >= ε‖R(x̄ − x̄*)‖₁`
//! - decrease: `V(x[n+1]) − V(x[n]) + ε V(x[n]) <= 0` ([`ConvergenceEps`])
//!
//! Each condition is available pointwise, as a hinge loss over samples, and
//! as an exact MILP whose optimum is the worst violation over the system
//! domain. The MILP optimum is differentiated with [`crate::envelope`].

use crate::descriptor::LyapunovDescriptor;
use crate::envelope::{
    active_box_faces, envelope_gradient, ActivePiece, ParameterGradient, ACTIVE_TOLERANCE,
};
use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, Bound, BoxDomain, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    add_absolute_value, add_mixed_integer_linear_constraints, vars_to_exprs, ConstraintSink, LinExpr,
    MilpBuilder, MilpSolution, MilpSolver, MixedIntegerVars, ObjectiveSense, PiecewiseUnit, VarId,
    VarType,
};
use nlyap_relu::{compute_network_at_xhat, BoundMethod, NetworkAtXhat, ReluEncoder, ReluEncoding};
use nlyap_system::{DiscreteTimeSystem, DynamicsVars};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which decrease condition to certify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConvergenceEps {
    /// `V(x⁺) − V(x) + εV(x) <= 0`: exponential convergence at rate at least ε.
    #[default]
    ExpLower,
    /// `V(x⁺) − V(x) + εV(x) >= 0`: convergence no faster than ε.
    ExpUpper,
    /// `V(x⁺) − V(x) + ε‖R(x̄ − x̄*)‖₁ <= 0`: asymptotic convergence.
    Asymp,
}

impl ConvergenceEps {
    /// Violation of the condition; positive means it fails.
    pub fn violation(self, v: f64, v_next: f64, l1: f64, epsilon: f64) -> f64 {
        match self {
            ConvergenceEps::ExpLower => v_next - v + epsilon * v,
            ConvergenceEps::ExpUpper => -(v_next - v + epsilon * v),
            ConvergenceEps::Asymp => v_next - v + epsilon * l1,
        }
    }

    /// The same combination applied to first-order pieces.
    pub fn violation_piece(
        self,
        v: &ActivePiece,
        v_next: &ActivePiece,
        l1: &ActivePiece,
        epsilon: f64,
    ) -> ActivePiece {
        let mut out = v_next.clone();
        match self {
            ConvergenceEps::ExpLower => out.add_scaled(v, epsilon - 1.0),
            ConvergenceEps::ExpUpper => {
                out.add_scaled(v, epsilon - 1.0);
                out = out.scaled(-1.0);
            }
            ConvergenceEps::Asymp => {
                out.add_scaled(v, -1.0);
                out.add_scaled(l1, epsilon);
            }
        }
        out
    }
}

/// How per-sample hinge losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reduction {
    #[default]
    Mean,
    Max,
    /// `(Σ lᵢ⁴)^¼`
    FourNorm,
}

impl Reduction {
    /// The reduced loss and its derivative with respect to every sample loss.
    pub fn reduce(self, losses: &[f64]) -> Result<(f64, Vec<f64>)> {
        if losses.is_empty() {
            return Err(NlyapError::InvalidConfig("loss over an empty sample set".to_string()));
        }
        let n = losses.len();
        Ok(match self {
            Reduction::Mean => (losses.iter().sum::<f64>() / n as f64, vec![1.0 / n as f64; n]),
            Reduction::Max => {
                let (arg, max) = losses
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |(ai, am), (i, l)| if l > am { (i, l) } else { (ai, am) });
                let mut weights = vec![0.0; n];
                weights[arg] = 1.0;
                (max, weights)
            }
            Reduction::FourNorm => {
                let value = losses.iter().map(|l| l.powi(4)).sum::<f64>().powf(0.25);
                let weights = if value > 0.0 {
                    losses.iter().map(|l| l.powi(3) / value.powi(3)).collect()
                } else {
                    vec![0.0; n]
                };
                (value, weights)
            }
        })
    }
}

/// A reduced sample loss and its parameter gradient.
#[derive(Debug, Clone)]
pub struct SampleLoss {
    pub value: f64,
    pub gradient: ParameterGradient,
}

/// Optional constraints shared by the Lyapunov MILPs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MilpOptions {
    /// Restrict the search to `V(x) >= lyapunov_lower`.
    pub lyapunov_lower: Option<f64>,
    /// Restrict the search to `V(x) <= lyapunov_upper`.
    pub lyapunov_upper: Option<f64>,
    /// Type of the activation and mode binaries; `Continuous` gives the LP relaxation.
    pub binary_type: VarType,
}

impl Default for MilpOptions {
    fn default() -> Self {
        Self {
            lyapunov_lower: None,
            lyapunov_upper: None,
            binary_type: VarType::Binary,
        }
    }
}

impl MilpOptions {
    pub fn validate(&self) -> Result<()> {
        if let (Some(lo), Some(up)) = (self.lyapunov_lower, self.lyapunov_upper) {
            if lo > up {
                return Err(NlyapError::InvalidConfig(format!(
                    "lyapunov_lower {lo} exceeds lyapunov_upper {up}"
                )));
            }
        }
        Ok(())
    }
}

/// ϕ(x) materialized in a model.
#[derive(Debug, Clone)]
pub struct LyapunovReluOutput {
    pub encoding: ReluEncoding,
    pub vars: MixedIntegerVars,
}

/// `‖R(x̄ − x̄*)‖₁` materialized in a model.
#[derive(Debug, Clone)]
pub struct L1Term {
    pub output: LinExpr<VarId>,
    pub units: Vec<PiecewiseUnit<VarId>>,
    pub argument_bounds: Vec<Bound>,
}

/// V at one state of a model.
#[derive(Debug, Clone)]
pub struct LyapunovTerm {
    pub value: LinExpr<VarId>,
    pub relu: LyapunovReluOutput,
    pub xhat: NetworkAtXhat,
    pub l1: L1Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LyapunovQuery {
    Positivity { epsilon: f64 },
    Derivative { epsilon: f64, eps_type: ConvergenceEps },
}

/// A Lyapunov MILP and the variables callers need to read its solution.
#[derive(Debug, Clone)]
pub struct LyapunovMilp {
    pub milp: MilpBuilder,
    pub x: Vec<VarId>,
    /// Empty for the positivity query.
    pub x_next: Vec<VarId>,
    pub current: LyapunovTerm,
    pub next: Option<LyapunovTerm>,
    pub dynamics: Option<DynamicsVars>,
    pub query: LyapunovQuery,
    pub options: MilpOptions,
}

impl LyapunovMilp {
    pub fn solve(&self, solver: &dyn MilpSolver) -> Result<MilpSolution> {
        solver.solve(&self.milp)
    }
}

/// Constrain `lower <= value <= upper`.
pub fn add_lyapunov_bounds_constraint(
    milp: &mut MilpBuilder,
    value: &LinExpr<VarId>,
    lower: Option<f64>,
    upper: Option<f64>,
    name: &str,
) -> Result<()> {
    if let (Some(lo), Some(up)) = (lower, upper) {
        if lo > up {
            return Err(NlyapError::InvalidConfig(format!(
                "lyapunov_lower {lo} exceeds lyapunov_upper {up}"
            )));
        }
    }
    if let Some(lo) = lower {
        milp.add_ge(value.clone(), lo, &format!("{name}_lower"));
    }
    if let Some(up) = upper {
        milp.add_le(value.clone(), up, &format!("{name}_upper"));
    }
    Ok(())
}

/// Lyapunov candidate for a discrete-time system.
#[derive(Debug, Clone)]
pub struct LyapunovDiscreteTime<S> {
    system: S,
    network: ReluNetwork,
    /// Bound propagation used for every encoding of ϕ.
    pub method: BoundMethod,
}

impl<S: DiscreteTimeSystem> LyapunovDiscreteTime<S> {
    pub fn new(system: S, network: ReluNetwork) -> Result<Self> {
        ensure_dim("Lyapunov network input", system.x_dim(), network.in_dim())?;
        ensure_dim("Lyapunov network output", 1, network.out_dim())?;
        Ok(Self {
            system,
            network,
            method: BoundMethod::default(),
        })
    }

    pub fn with_method(mut self, method: BoundMethod) -> Self {
        self.method = method;
        self
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn network(&self) -> &ReluNetwork {
        &self.network
    }

    pub fn set_network_params(&mut self, params: &[f64]) -> Result<()> {
        self.network.set_params(params)
    }

    pub fn lyapunov_value(&self, x: ArrayView1<f64>, desc: &LyapunovDescriptor) -> Result<f64> {
        desc.value(&self.network, x)
    }

    /// V at every row of `x`.
    pub fn lyapunov_value_batch(&self, x: &Array2<f64>, desc: &LyapunovDescriptor) -> Result<Array1<f64>> {
        let values = (0..x.nrows())
            .into_par_iter()
            .map(|i| desc.value(&self.network, x.row(i)))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Array1::from(values))
    }

    /// Violation of `eps_type` for every admissible next state `x⁺`.
    ///
    /// Matches the objective of [`Self::lyapunov_derivative_as_milp`] at `x`.
    pub fn lyapunov_derivative(
        &self,
        x: ArrayView1<f64>,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        eps_type: ConvergenceEps,
    ) -> Result<Vec<f64>> {
        let v = self.lyapunov_value(x, desc)?;
        let l1 = match eps_type {
            ConvergenceEps::Asymp => desc.l1_norm(x)?,
            _ => 0.0,
        };
        self.system
            .possible_dx(x)?
            .iter()
            .map(|x_next| {
                let v_next = self.lyapunov_value(x_next.view(), desc)?;
                Ok(eps_type.violation(v, v_next, l1, epsilon))
            })
            .collect()
    }

    /// Constrain `x_next = f(x)`.
    pub fn add_system_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[VarId],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
    ) -> Result<DynamicsVars> {
        ensure_dim("state", self.system.x_dim(), x.len())?;
        ensure_dim("next state", self.system.x_dim(), x_next.len())?;
        self.system
            .add_dynamics_constraint(milp, &vars_to_exprs(x), x_next, solver, binary_type, "dynamics")
    }

    /// ϕ(x) for `x` in `domain`.
    pub fn add_lyap_relu_output_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        domain: &BoxDomain,
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<LyapunovReluOutput> {
        add_relu_output(milp, &self.network, self.method, x, domain, solver, binary_type, name)
    }

    /// `‖R(x̄ − x̄*)‖₁` for `x` in `domain`, one absolute value per row of R.
    pub fn add_state_error_l1_constraint(
        &self,
        milp: &mut MilpBuilder,
        desc: &LyapunovDescriptor,
        x: &[LinExpr<VarId>],
        domain: &BoxDomain,
        name: &str,
    ) -> Result<L1Term> {
        add_state_error_l1(milp, desc, x, domain, name)
    }

    /// V(x) for `x` in `domain`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_lyapunov_value(
        &self,
        milp: &mut MilpBuilder,
        desc: &LyapunovDescriptor,
        x: &[LinExpr<VarId>],
        domain: &BoxDomain,
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<LyapunovTerm> {
        let relu = self.add_lyap_relu_output_constraint(milp, x, domain, solver, binary_type, &format!("{name}_phi"))?;
        let xhat = compute_network_at_xhat(
            milp,
            &self.network,
            x,
            desc.x_equilibrium.view(),
            desc.xhat_indices.as_deref(),
            domain,
            self.method,
            solver,
            &format!("{name}_phi_hat"),
        )?;
        let l1 = self.add_state_error_l1_constraint(milp, desc, x, domain, &format!("{name}_l1"))?;
        let mut value = relu.vars.output[0].clone() - &xhat.output[0];
        value.add_scaled(&l1.output, desc.v_lambda);
        Ok(LyapunovTerm { value, relu, xhat, l1 })
    }

    fn state_vars(&self, milp: &mut MilpBuilder, desc: &LyapunovDescriptor, options: &MilpOptions) -> Result<Vec<VarId>> {
        desc.validate(self.system.x_dim())?;
        options.validate()?;
        let domain = self.system.x_domain();
        Ok(milp.add_continuous_vars("x", domain.lo(), domain.up()))
    }

    /// Maximize `ε‖R(x̄ − x̄*)‖₁ − V(x)` over the system domain.
    ///
    /// A positive optimum is a state where positivity fails.
    pub fn lyapunov_positivity_as_milp(
        &self,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        options: &MilpOptions,
        solver: &dyn MilpSolver,
    ) -> Result<LyapunovMilp> {
        let mut milp = MilpBuilder::new();
        let x = self.state_vars(&mut milp, desc, options)?;
        let domain = self.system.x_domain().clone();
        let current = self.add_lyapunov_value(
            &mut milp,
            desc,
            &vars_to_exprs(&x),
            &domain,
            solver,
            options.binary_type,
            "V",
        )?;
        add_lyapunov_bounds_constraint(&mut milp, &current.value, options.lyapunov_lower, options.lyapunov_upper, "V")?;
        let objective = current.l1.output.scaled(epsilon) - &current.value;
        milp.set_objective(objective, ObjectiveSense::Maximize);
        debug!(
            vars = milp.num_vars(),
            binaries = milp.num_binaries(),
            "built Lyapunov positivity MILP"
        );
        Ok(LyapunovMilp {
            milp,
            x,
            x_next: Vec::new(),
            current,
            next: None,
            dynamics: None,
            query: LyapunovQuery::Positivity { epsilon },
            options: *options,
        })
    }

    /// Maximize the decrease violation of `eps_type` over the system domain.
    ///
    /// V(x) and V(x⁺) get separate encodings of ϕ; their activation patterns
    /// are independent.
    pub fn lyapunov_derivative_as_milp(
        &self,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        eps_type: ConvergenceEps,
        options: &MilpOptions,
        solver: &dyn MilpSolver,
    ) -> Result<LyapunovMilp> {
        let mut milp = MilpBuilder::new();
        let x = self.state_vars(&mut milp, desc, options)?;
        let x_next = milp.add_free_vars("x_next", self.system.x_dim());
        let dynamics = self.add_system_constraint(&mut milp, &x, &x_next, solver, options.binary_type)?;
        for (&v, b) in x_next.iter().zip(&dynamics.x_next_bounds) {
            milp.set_var_bounds(v, b.lower, b.upper);
        }
        let next_domain = bounds_domain(&dynamics.x_next_bounds)?;
        let domain = self.system.x_domain().clone();

        let current = self.add_lyapunov_value(
            &mut milp,
            desc,
            &vars_to_exprs(&x),
            &domain,
            solver,
            options.binary_type,
            "V",
        )?;
        add_lyapunov_bounds_constraint(&mut milp, &current.value, options.lyapunov_lower, options.lyapunov_upper, "V")?;
        let next = self.add_lyapunov_value(
            &mut milp,
            desc,
            &vars_to_exprs(&x_next),
            &next_domain,
            solver,
            options.binary_type,
            "V_next",
        )?;

        let objective = match eps_type {
            ConvergenceEps::ExpLower => next.value.clone() - &current.value.scaled(1.0 - epsilon),
            ConvergenceEps::ExpUpper => current.value.scaled(1.0 - epsilon) - &next.value,
            ConvergenceEps::Asymp => {
                next.value.clone() - &current.value + &current.l1.output.scaled(epsilon)
            }
        };
        milp.set_objective(objective, ObjectiveSense::Maximize);
        debug!(
            vars = milp.num_vars(),
            binaries = milp.num_binaries(),
            ?eps_type,
            "built Lyapunov derivative MILP"
        );
        Ok(LyapunovMilp {
            milp,
            x,
            x_next,
            current,
            next: Some(next),
            dynamics: Some(dynamics),
            query: LyapunovQuery::Derivative { epsilon, eps_type },
            options: *options,
        })
    }

    /// Gradient of the optimal value of `problem` with respect to ϕ's
    /// parameters (and R when `with_r`).
    ///
    /// `solution` must be an optimal solution of `problem`.
    pub fn milp_objective_gradient(
        &self,
        desc: &LyapunovDescriptor,
        problem: &LyapunovMilp,
        solution: &MilpSolution,
        with_r: bool,
    ) -> Result<ParameterGradient> {
        if !solution.is_optimal() {
            return Err(NlyapError::InvalidConfig(
                "gradient of a MILP needs an optimal solution".to_string(),
            ));
        }
        let net = &self.network;
        let tol = ACTIVE_TOLERANCE;
        let r_shape = with_r.then(|| desc.r_shape());
        let x = solution.values_of(&problem.x);

        let mut active = active_box_faces(x.view(), self.system.x_domain(), tol, net, r_shape);
        active.extend(desc.kink_pieces(net, x.view(), tol, with_r)?);
        let v = desc.value_piece(net, x.view(), with_r)?;
        let v_value = desc.value(net, x.view())?;
        for bound in [problem.options.lyapunov_lower, problem.options.lyapunov_upper].into_iter().flatten() {
            if (v_value - bound).abs() <= tol {
                active.push(v.clone());
            }
        }
        let signs = desc.l1_signs(x.view())?;
        let l1 = desc.l1_piece(net, x.view(), signs.view(), with_r);

        let objective = match problem.query {
            LyapunovQuery::Positivity { epsilon } => {
                let mut objective = l1.scaled(epsilon);
                objective.add_scaled(&v, -1.0);
                objective
            }
            LyapunovQuery::Derivative { epsilon, eps_type } => {
                let x_next = solution.values_of(&problem.x_next);
                let jacobian = self.system.jacobian(x.view())?;
                for grad in self.system.active_constraint_gradients(x.view(), tol)? {
                    active.push(ActivePiece::fixed(grad, net, r_shape));
                }
                for piece in desc.kink_pieces(net, x_next.view(), tol, with_r)? {
                    active.push(piece.pulled_back(&jacobian));
                }
                let v_next = desc.value_piece(net, x_next.view(), with_r)?.pulled_back(&jacobian);
                eps_type.violation_piece(&v, &v_next, &l1, epsilon)
            }
        };
        envelope_gradient(&objective, &active)
    }

    /// Hinge loss `max(0, margin − (V(x) − ε‖R(x̄ − x̄*)‖₁))` over the rows of `samples`.
    pub fn lyapunov_positivity_loss_at_samples(
        &self,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        samples: &Array2<f64>,
        margin: f64,
        reduction: Reduction,
        with_r: bool,
    ) -> Result<SampleLoss> {
        ensure_dim("sample dimension", self.system.x_dim(), samples.ncols())?;
        let net = &self.network;
        let per_sample = (0..samples.nrows())
            .into_par_iter()
            .map(|i| {
                let x = samples.row(i);
                let slack = desc.value(net, x)? - epsilon * desc.l1_norm(x)?;
                let loss = (margin - slack).max(0.0);
                let mut piece = desc.value_piece(net, x, with_r)?;
                let signs = desc.l1_signs(x)?;
                piece.add_scaled(&desc.l1_piece(net, x, signs.view(), with_r), -epsilon);
                Ok((loss, piece.grad_theta.scaled(-1.0)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.reduce_samples(desc, per_sample, reduction, with_r)
    }

    /// Hinge loss `max(0, violation + margin)` of `eps_type` over the rows of `samples`.
    #[allow(clippy::too_many_arguments)]
    pub fn lyapunov_derivative_loss_at_samples(
        &self,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        eps_type: ConvergenceEps,
        samples: &Array2<f64>,
        margin: f64,
        reduction: Reduction,
        with_r: bool,
    ) -> Result<SampleLoss> {
        ensure_dim("sample dimension", self.system.x_dim(), samples.ncols())?;
        let net = &self.network;
        let per_sample = (0..samples.nrows())
            .into_par_iter()
            .map(|i| {
                let x = samples.row(i);
                let x_next = self.system.step_forward(x)?;
                let violation = eps_type.violation(
                    desc.value(net, x)?,
                    desc.value(net, x_next.view())?,
                    desc.l1_norm(x)?,
                    epsilon,
                );
                let signs = desc.l1_signs(x)?;
                let piece = eps_type.violation_piece(
                    &desc.value_piece(net, x, with_r)?,
                    &desc.value_piece(net, x_next.view(), with_r)?,
                    &desc.l1_piece(net, x, signs.view(), with_r),
                    epsilon,
                );
                Ok(((violation + margin).max(0.0), piece.grad_theta))
            })
            .collect::<Result<Vec<_>>>()?;
        self.reduce_samples(desc, per_sample, reduction, with_r)
    }

    fn reduce_samples(
        &self,
        desc: &LyapunovDescriptor,
        per_sample: Vec<(f64, ParameterGradient)>,
        reduction: Reduction,
        with_r: bool,
    ) -> Result<SampleLoss> {
        let losses: Vec<f64> = per_sample.iter().map(|(l, _)| *l).collect();
        let (value, weights) = reduction.reduce(&losses)?;
        let mut gradient = ParameterGradient::zeros(&self.network, with_r.then(|| desc.r_shape()));
        for ((loss, grad), w) in per_sample.iter().zip(weights) {
            if *loss > 0.0 && w != 0.0 {
                gradient.add_scaled(grad, w);
            }
        }
        Ok(SampleLoss { value, gradient })
    }
}

/// Materialize ϕ(x) for `x` in `domain`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_relu_output(
    milp: &mut MilpBuilder,
    network: &ReluNetwork,
    method: BoundMethod,
    x: &[LinExpr<VarId>],
    domain: &BoxDomain,
    solver: &dyn MilpSolver,
    binary_type: VarType,
    name: &str,
) -> Result<LyapunovReluOutput> {
    let encoding = ReluEncoder::output_constraint(network, domain, method, solver)?;
    let vars = add_mixed_integer_linear_constraints(
        milp,
        &encoding.constraints,
        x,
        None,
        &format!("{name}_slack"),
        &format!("{name}_binary"),
        binary_type,
    )?;
    Ok(LyapunovReluOutput { encoding, vars })
}

/// Materialize `‖R(x̄ − x̄*)‖₁` for `x` in `domain`.
pub(crate) fn add_state_error_l1(
    milp: &mut MilpBuilder,
    desc: &LyapunovDescriptor,
    x: &[LinExpr<VarId>],
    domain: &BoxDomain,
    name: &str,
) -> Result<L1Term> {
    ensure_dim("state", desc.x_dim(), x.len())?;
    let arguments = desc.l1_argument_exprs(x);
    let argument_bounds = desc.l1_argument_bounds(domain)?;
    let units = arguments
        .iter()
        .zip(&argument_bounds)
        .enumerate()
        .map(|(i, (arg, &bound))| add_absolute_value(milp, arg, bound, &format!("{name}[{i}]")))
        .collect::<Result<Vec<_>>>()?;
    let mut output = LinExpr::new();
    for unit in &units {
        output += &unit.output;
    }
    Ok(L1Term {
        output,
        units,
        argument_bounds,
    })
}

/// The box spanned by per-coordinate bounds.
pub(crate) fn bounds_domain(bounds: &[Bound]) -> Result<BoxDomain> {
    let lo: Array1<f64> = bounds.iter().map(|b| b.lower).collect();
    let up: Array1<f64> = bounds.iter().map(|b| b.upper).collect();
    BoxDomain::new(lo, up)
}
