//! Control Lyapunov functions for control-affine systems ẋ = f(x) + G(x)u.
//!
//! With `u` in the box `[u_lo, u_up]`, V̇ is affine in `u`, so
//!
//! ```text
//! minᵤ V̇ = ∂V/∂x·f(x) + ∂V/∂x·G(x)·u_mid − ‖∂V/∂x·G(x)·diag(u_half)‖₁
//! ```
//!
//! and the condition to certify is `minᵤ V̇ + εV(x) <= 0` over the domain.

use crate::descriptor::LyapunovDescriptor;
use crate::envelope::{
    active_box_faces, envelope_gradient, pattern_from_solution, ActivePiece, ParameterGradient, ACTIVE_TOLERANCE,
};
use crate::gradient_terms::{
    add_bounds, add_input_extremum, add_l1_directional, add_network_directional, InputSemantics, SignIndicator,
};
use crate::lyapunov::{
    add_lyapunov_bounds_constraint, add_relu_output, add_state_error_l1, L1Term, LyapunovReluOutput, MilpOptions,
    Reduction, SampleLoss,
};
use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, ActivationPattern, Bound, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    vars_to_exprs, LinExpr, MilpBuilder, MilpSolution, MilpSolver, ObjectiveSense, PiecewiseUnit, VarId,
};
use nlyap_relu::BoundMethod;
use nlyap_system::{add_system_constraint, ControlAffineSystem, SystemConstraintVars};
use rayon::prelude::*;
use tracing::debug;

/// The control Lyapunov derivative MILP and the variables needed to read its solution.
#[derive(Debug, Clone)]
pub struct ControlLyapunovMilp {
    pub milp: MilpBuilder,
    pub x: Vec<VarId>,
    pub system: SystemConstraintVars,
    pub relu: LyapunovReluOutput,
    pub l1: L1Term,
    /// V(x).
    pub value: LinExpr<VarId>,
    /// minᵤ V̇(x).
    pub vdot: LinExpr<VarId>,
    /// `|∂V/∂x·G_j|` per input coordinate.
    pub input_abs: Vec<PiecewiseUnit<VarId>>,
    /// Bounds of `∂V/∂x·G_j` over the domain.
    pub input_gradient_bounds: Vec<Bound>,
    pub epsilon: f64,
    pub options: MilpOptions,
}

impl ControlLyapunovMilp {
    pub fn solve(&self, solver: &dyn MilpSolver) -> Result<MilpSolution> {
        solver.solve(&self.milp)
    }
}

#[derive(Debug, Clone)]
pub struct ControlLyapunov<S> {
    system: S,
    network: ReluNetwork,
    pub method: BoundMethod,
}

impl<S: ControlAffineSystem> ControlLyapunov<S> {
    pub fn new(system: S, network: ReluNetwork) -> Result<Self> {
        ensure_dim("Lyapunov network input", system.x_dim(), network.in_dim())?;
        ensure_dim("Lyapunov network output", 1, network.out_dim())?;
        if !system.u_domain().is_finite() {
            return Err(NlyapError::InvalidDomain(
                "control Lyapunov conditions need a finite input box".to_string(),
            ));
        }
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

    fn check_descriptor(&self, desc: &LyapunovDescriptor) -> Result<()> {
        desc.validate(self.system.x_dim())?;
        if desc.xhat_indices.is_some() {
            return Err(NlyapError::InvalidConfig(
                "control Lyapunov functions are normalized at x*, x̂ indices are not supported".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lyapunov_value(&self, x: ArrayView1<f64>, desc: &LyapunovDescriptor) -> Result<f64> {
        self.check_descriptor(desc)?;
        desc.value(&self.network, x)
    }

    /// `minᵤ V̇ + εV(x)`, the minimum taken over every element of ∂V/∂x at `x`.
    pub fn lyapunov_derivative(
        &self,
        x: ArrayView1<f64>,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        zero_tol: f64,
    ) -> Result<f64> {
        self.check_descriptor(desc)?;
        let f = self.system.f(x)?;
        let g = self.system.g(x)?;
        let (lo, up) = (self.system.u_domain().lo(), self.system.u_domain().up());
        let vdot = desc
            .value_gradients(&self.network, x, zero_tol)?
            .iter()
            .map(|dvdx| dvdx.dot(&f) + InputSemantics::WorstCase.extremum(g.t().dot(dvdx).view(), lo, up))
            .fold(f64::INFINITY, f64::min);
        Ok(vdot + epsilon * desc.value(&self.network, x)?)
    }

    /// `∂V/∂x · v` with ∂ϕ/∂x sharing the binaries of `relu`.
    #[allow(clippy::too_many_arguments)]
    fn add_dvdx_times(
        &self,
        milp: &mut MilpBuilder,
        desc: &LyapunovDescriptor,
        relu: &LyapunovReluOutput,
        signs: &[SignIndicator],
        v: &[LinExpr<VarId>],
        v_bounds: &[Bound],
        name: &str,
    ) -> Result<(LinExpr<VarId>, Bound)> {
        let (dphi, phi_bound) = add_network_directional(
            milp,
            &self.network,
            &relu.encoding,
            &relu.vars.binary,
            v,
            v_bounds,
            &format!("{name}_phi"),
        )?;
        let (dl1, l1_bound) =
            add_l1_directional(milp, signs, &desc.r_full(), desc.v_lambda, v, v_bounds, &format!("{name}_l1"))?;
        Ok((dphi + &dl1, add_bounds(phi_bound, l1_bound)))
    }

    /// Maximize `minᵤ V̇ + εV(x)` over the system domain.
    ///
    /// A positive optimum is a state where no admissible input decreases V
    /// fast enough. At a kink of V the model may choose any adjacent piece.
    pub fn lyapunov_derivative_as_milp(
        &self,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        options: &MilpOptions,
        solver: &dyn MilpSolver,
    ) -> Result<ControlLyapunovMilp> {
        self.check_descriptor(desc)?;
        options.validate()?;
        let n = self.system.x_dim();
        let u_dim = self.system.u_dim();
        let domain = self.system.x_domain().clone();
        let mut milp = MilpBuilder::new();
        let x = milp.add_continuous_vars("x", domain.lo(), domain.up());
        let system = add_system_constraint(&self.system, &mut milp, &x, solver, options.binary_type)?;
        let x_exprs = vars_to_exprs(&x);

        let relu = add_relu_output(
            &mut milp,
            &self.network,
            self.method,
            &x_exprs,
            &domain,
            solver,
            options.binary_type,
            "phi",
        )?;
        let phi_star = self.network.forward(desc.x_equilibrium.view())?[0];
        let l1 = add_state_error_l1(&mut milp, desc, &x_exprs, &domain, "l1")?;
        let mut value = relu.vars.output[0].clone() + (-phi_star);
        value.add_scaled(&l1.output, desc.v_lambda);
        add_lyapunov_bounds_constraint(&mut milp, &value, options.lyapunov_lower, options.lyapunov_upper, "V")?;

        let signs: Vec<SignIndicator> = l1
            .units
            .iter()
            .zip(&l1.argument_bounds)
            .map(|(unit, &bound)| SignIndicator::of(unit, bound))
            .collect();
        let cons = &system.constraints;
        let f_bounds: Vec<Bound> = (0..n).map(|i| Bound::new(cons.f_lo[i], cons.f_up[i])).collect();
        let (mut vdot, _) = self.add_dvdx_times(&mut milp, desc, &relu, &signs, &system.f, &f_bounds, "dVdx_f")?;

        let (u_lo, u_up) = (self.system.u_domain().lo(), self.system.u_domain().up());
        let mut input_abs = Vec::with_capacity(u_dim);
        let mut input_gradient_bounds = Vec::with_capacity(u_dim);
        for j in 0..u_dim {
            let g_bounds: Vec<Bound> = (0..n)
                .map(|i| Bound::new(cons.g_flat_lo[i * u_dim + j], cons.g_flat_up[i * u_dim + j]))
                .collect();
            let (a, a_bound) =
                self.add_dvdx_times(&mut milp, desc, &relu, &signs, &system.g[j], &g_bounds, &format!("dVdx_G[{j}]"))?;
            let term = add_input_extremum(
                &mut milp,
                InputSemantics::WorstCase,
                &a,
                a_bound,
                u_lo[j],
                u_up[j],
                &format!("abs_dVdx_G[{j}]"),
            )?;
            vdot += &term.expr;
            input_abs.push(term.abs);
            input_gradient_bounds.push(a_bound);
        }

        let objective = vdot.clone() + &value.scaled(epsilon);
        milp.set_objective(objective, ObjectiveSense::Maximize);
        debug!(
            vars = milp.num_vars(),
            binaries = milp.num_binaries(),
            "built control Lyapunov derivative MILP"
        );
        Ok(ControlLyapunovMilp {
            milp,
            x,
            system,
            relu,
            l1,
            value,
            vdot,
            input_abs,
            input_gradient_bounds,
            epsilon,
            options: *options,
        })
    }

    /// First-order data of `∂V/∂x(θ) · v(x)` on a fixed activation pattern and sign choice.
    fn directional_piece(
        &self,
        desc: &LyapunovDescriptor,
        pattern: &ActivationPattern,
        signs: ArrayView1<f64>,
        dvdx: &Array1<f64>,
        v: &Array1<f64>,
        v_jacobian: &Array2<f64>,
        with_r: bool,
    ) -> Result<ActivePiece> {
        let one = Array1::ones(1);
        let mut theta = ParameterGradient::from_network(
            self.network.jvp_backward_params(pattern, v.view(), one.view())?,
            with_r.then(|| desc.r_shape()),
        );
        if let Some(r) = theta.r.as_mut() {
            *r = desc.signed_r_gradient(signs, v.view()) * desc.v_lambda;
        }
        Ok(ActivePiece::new(v_jacobian.t().dot(dvdx), theta))
    }

    /// `∂V/∂x` on the pattern and sign choice.
    fn dvdx(&self, desc: &LyapunovDescriptor, pattern: &ActivationPattern, signs: ArrayView1<f64>) -> Array1<f64> {
        let jacobian = self.network.jacobian_with_pattern(pattern);
        &jacobian.row(0) + &(signs.dot(&desc.r_full()) * desc.v_lambda)
    }

    /// Objective piece `minᵤ V̇ + εV` at `x`, with the minimizing vertex
    /// chosen per input coordinate by `input_signs` (sign of `∂V/∂x·G_j`).
    #[allow(clippy::too_many_arguments)]
    fn objective_piece(
        &self,
        desc: &LyapunovDescriptor,
        x: ArrayView1<f64>,
        pattern: &ActivationPattern,
        signs: ArrayView1<f64>,
        input_signs: &[f64],
        epsilon: f64,
        with_r: bool,
    ) -> Result<(f64, ActivePiece)> {
        let dvdx = self.dvdx(desc, pattern, signs);
        let g = self.system.g(x)?;
        let g_jacobians = self.system.g_jacobians(x)?;
        let (lo, up) = (self.system.u_domain().lo(), self.system.u_domain().up());
        let mut v = self.system.f(x)?;
        let mut v_jacobian = self.system.f_jacobian(x)?;
        for (j, &s) in input_signs.iter().enumerate() {
            let u = InputSemantics::WorstCase.extreme_input(s, lo[j], up[j]);
            v.scaled_add(u, &g.column(j));
            v_jacobian.scaled_add(u, &g_jacobians[j]);
        }
        let mut piece = self.directional_piece(desc, pattern, signs, &dvdx, &v, &v_jacobian, with_r)?;
        piece.add_scaled(&desc.value_piece(&self.network, x, with_r)?, epsilon);
        let value = dvdx.dot(&v) + epsilon * desc.value(&self.network, x)?;
        Ok((value, piece))
    }

    /// Gradient of the optimal value of `problem` with respect to ϕ's
    /// parameters (and R when `with_r`).
    ///
    /// The activation pattern and the signs of every norm term are read from
    /// `solution`, since ∂V/∂x jumps across kinks.
    pub fn milp_objective_gradient(
        &self,
        desc: &LyapunovDescriptor,
        problem: &ControlLyapunovMilp,
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
        let pattern = pattern_from_solution(&problem.relu.encoding, &problem.relu.vars.binary, solution)?;
        let signs: Array1<f64> = problem
            .l1
            .units
            .iter()
            .zip(&problem.l1.argument_bounds)
            .map(|(unit, &bound)| SignIndicator::of(unit, bound).sign_at(solution))
            .collect();
        let input_signs: Vec<f64> = problem
            .input_abs
            .iter()
            .zip(&problem.input_gradient_bounds)
            .map(|(unit, &bound)| SignIndicator::of(unit, bound).sign_at(solution))
            .collect();
        let (_, objective) =
            self.objective_piece(desc, x.view(), &pattern, signs.view(), &input_signs, problem.epsilon, with_r)?;

        let mut active = active_box_faces(x.view(), self.system.x_domain(), tol, net, r_shape);
        active.extend(desc.kink_pieces(net, x.view(), tol, with_r)?);
        for grad in self.system.active_constraint_gradients(x.view(), tol)? {
            active.push(ActivePiece::fixed(grad, net, r_shape));
        }
        let dvdx = self.dvdx(desc, &pattern, signs.view());
        let g = self.system.g(x.view())?;
        let g_jacobians = self.system.g_jacobians(x.view())?;
        for (j, g_jacobian) in g_jacobians.iter().enumerate() {
            let g_j = g.column(j).to_owned();
            if dvdx.dot(&g_j).abs() <= tol {
                active.push(self.directional_piece(desc, &pattern, signs.view(), &dvdx, &g_j, g_jacobian, with_r)?);
            }
        }
        let v = desc.value(net, x.view())?;
        for bound in [problem.options.lyapunov_lower, problem.options.lyapunov_upper].into_iter().flatten() {
            if (v - bound).abs() <= tol {
                active.push(desc.value_piece(net, x.view(), with_r)?);
            }
        }
        envelope_gradient(&objective, &active)
    }

    /// Hinge loss `max(0, minᵤ V̇ + εV + margin)` over the rows of `samples`.
    ///
    /// Each sample uses the piece realized at it (pre-activations `>= 0`
    /// count as active, zero norm arguments as positive).
    pub fn lyapunov_derivative_loss_at_samples(
        &self,
        desc: &LyapunovDescriptor,
        epsilon: f64,
        samples: &Array2<f64>,
        margin: f64,
        reduction: Reduction,
        with_r: bool,
    ) -> Result<SampleLoss> {
        self.check_descriptor(desc)?;
        ensure_dim("sample dimension", self.system.x_dim(), samples.ncols())?;
        let per_sample = (0..samples.nrows())
            .into_par_iter()
            .map(|i| {
                let x = samples.row(i);
                let pattern = self.network.activation_pattern(x)?;
                let signs = desc.l1_signs(x)?;
                let dvdx = self.dvdx(desc, &pattern, signs.view());
                let input_signs: Vec<f64> = self.system.g(x)?.t().dot(&dvdx).to_vec();
                let (value, piece) =
                    self.objective_piece(desc, x, &pattern, signs.view(), &input_signs, epsilon, with_r)?;
                Ok(((value + margin).max(0.0), piece.grad_theta))
            })
            .collect::<Result<Vec<_>>>()?;
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
