//! Control barrier functions for control-affine systems.
//!
//! ```text
//! h(x) = ϕ(x) − ϕ(x*) + c [− ‖R x − p‖∞]
//! ```
//!
//! The safe set is `{h > 0}`. The certificate needs `h <= 0` on the unsafe
//! region and `ḣ >= −ε h` under the extremal admissible input, where
//! `ḣ = ∂h/∂x·f + ext_u ∂h/∂x·G·u`.

use crate::envelope::{
    active_box_faces, envelope_gradient, pattern_from_solution, ActivePiece, ParameterGradient, ACTIVE_TOLERANCE,
};
use crate::descriptor::network_kink_pieces;
use crate::gradient_terms::{
    add_bounds, add_input_extremum, add_linf_directional, add_network_directional, argmax_abs, linf_kink_pieces,
    linf_row_gradient, InputSemantics, SignIndicator,
};
use crate::lyapunov::{add_relu_output, LyapunovReluOutput, Reduction, SampleLoss};
use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, linf_subgradients, minkowski_sum, ActivationPattern, Bound, BoxDomain, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    add_box_boundary, add_infinity_norm, vars_to_exprs, ConstraintSink, InfinityNorm, LinExpr, MilpBuilder,
    MilpSolution, MilpSolver, ObjectiveSense, PiecewiseUnit, VarId, VarType,
};
use nlyap_relu::{interval_affine, BoundMethod};
use nlyap_system::{add_system_constraint, ControlAffineSystem, SystemConstraintVars};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The `−‖R x − p‖∞` term that shapes the level sets of h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfNormTerm {
    pub r: Array2<f64>,
    pub p: Array1<f64>,
}

impl InfNormTerm {
    pub fn new(r: Array2<f64>, p: Array1<f64>) -> Result<Self> {
        ensure_dim("InfNormTerm p", r.nrows(), p.len())?;
        if r.nrows() == 0 {
            return Err(NlyapError::InvalidConfig("InfNormTerm needs at least one row".to_string()));
        }
        Ok(Self { r, p })
    }

    /// `R x − p`.
    pub fn argument(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.r.dot(&x) - &self.p
    }

    pub fn value(&self, x: ArrayView1<f64>) -> f64 {
        self.argument(x).iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    pub fn argument_bounds(&self, domain: &BoxDomain) -> Result<Vec<Bound>> {
        let offset = -&self.p;
        interval_affine(&self.r, Some(&offset), &domain.bounds())
    }
}

/// Parameters that turn a ReLU network into a barrier candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierDescriptor {
    pub x_star: Array1<f64>,
    pub c: f64,
    pub inf_norm: Option<InfNormTerm>,
}

impl BarrierDescriptor {
    pub fn new(x_star: Array1<f64>, c: f64) -> Self {
        Self {
            x_star,
            c,
            inf_norm: None,
        }
    }

    pub fn with_inf_norm(mut self, term: InfNormTerm) -> Self {
        self.inf_norm = Some(term);
        self
    }

    pub fn validate(&self, x_dim: usize) -> Result<()> {
        ensure_dim("barrier x*", x_dim, self.x_star.len())?;
        if !self.c.is_finite() {
            return Err(NlyapError::InvalidConfig(format!("barrier offset c must be finite, got {}", self.c)));
        }
        if let Some(term) = &self.inf_norm {
            ensure_dim("InfNormTerm R columns", x_dim, term.r.ncols())?;
        }
        Ok(())
    }
}

/// Where [`ControlBarrier::barrier_value_as_milp`] searches for large h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateRegion {
    /// `{x ∈ domain : A x <= b}`.
    Polytope { a: Array2<f64>, b: Array1<f64> },
    /// The boundary of a box inside the domain.
    BoxBoundary(BoxDomain),
}

/// `‖R x − p‖∞` in a model.
#[derive(Debug, Clone)]
pub struct InfNormVars {
    pub norm: InfinityNorm<VarId>,
    pub argument_bounds: Vec<Bound>,
}

/// h at one state of a model.
#[derive(Debug, Clone)]
pub struct BarrierTerm {
    pub value: LinExpr<VarId>,
    pub relu: LyapunovReluOutput,
    pub inf_norm: Option<InfNormVars>,
}

#[derive(Debug, Clone)]
pub struct BarrierValueMilp {
    pub milp: MilpBuilder,
    pub x: Vec<VarId>,
    pub h: BarrierTerm,
    pub region: StateRegion,
    /// The box the search ran over: the system domain, or the region box.
    pub domain: BoxDomain,
}

#[derive(Debug, Clone)]
pub struct BarrierDerivativeMilp {
    pub milp: MilpBuilder,
    pub x: Vec<VarId>,
    pub system: SystemConstraintVars,
    pub h: BarrierTerm,
    pub hdot: LinExpr<VarId>,
    pub input_abs: Vec<PiecewiseUnit<VarId>>,
    pub input_gradient_bounds: Vec<Bound>,
    pub epsilon: f64,
}

#[derive(Debug, Clone)]
pub struct ControlBarrier<S> {
    system: S,
    network: ReluNetwork,
    pub method: BoundMethod,
    pub semantics: InputSemantics,
}

impl<S: ControlAffineSystem> ControlBarrier<S> {
    pub fn new(system: S, network: ReluNetwork) -> Result<Self> {
        ensure_dim("barrier network input", system.x_dim(), network.in_dim())?;
        ensure_dim("barrier network output", 1, network.out_dim())?;
        if !system.u_domain().is_finite() {
            return Err(NlyapError::InvalidDomain(
                "barrier conditions need a finite input box".to_string(),
            ));
        }
        Ok(Self {
            system,
            network,
            method: BoundMethod::default(),
            semantics: InputSemantics::default(),
        })
    }

    pub fn with_semantics(mut self, semantics: InputSemantics) -> Self {
        self.semantics = semantics;
        self
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

    pub fn barrier_value(&self, x: ArrayView1<f64>, desc: &BarrierDescriptor) -> Result<f64> {
        desc.validate(self.system.x_dim())?;
        let mut h = self.network.forward(x)?[0] - self.network.forward(desc.x_star.view())?[0] + desc.c;
        if let Some(term) = &desc.inf_norm {
            h -= term.value(x);
        }
        Ok(h)
    }

    pub fn barrier_value_batch(&self, x: &Array2<f64>, desc: &BarrierDescriptor) -> Result<Array1<f64>> {
        let values = (0..x.nrows())
            .into_par_iter()
            .map(|i| self.barrier_value(x.row(i), desc))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Array1::from(values))
    }

    /// Every element of the subgradient set of h at `x`.
    pub fn barrier_gradients(&self, x: ArrayView1<f64>, desc: &BarrierDescriptor, zero_tol: f64) -> Result<Vec<Array1<f64>>> {
        let phi: Vec<Array1<f64>> = self
            .network
            .input_gradients(x, zero_tol)?
            .into_iter()
            .map(|j| j.row(0).to_owned())
            .collect();
        match &desc.inf_norm {
            None => Ok(phi),
            Some(term) => {
                let linf: Vec<Array1<f64>> = linf_subgradients(term.argument(x).view(), zero_tol)?
                    .into_iter()
                    .map(|s| -s.dot(&term.r))
                    .collect();
                minkowski_sum(&phi, &linf)
            }
        }
    }

    /// `ḣ` under the extremal input, one entry per element of ∂h/∂x at `x`.
    pub fn barrier_derivative(&self, x: ArrayView1<f64>, desc: &BarrierDescriptor, zero_tol: f64) -> Result<Vec<f64>> {
        desc.validate(self.system.x_dim())?;
        let f = self.system.f(x)?;
        let g = self.system.g(x)?;
        let (lo, up) = (self.system.u_domain().lo(), self.system.u_domain().up());
        Ok(self
            .barrier_gradients(x, desc, zero_tol)?
            .iter()
            .map(|dhdx| dhdx.dot(&f) + self.semantics.extremum(g.t().dot(dhdx).view(), lo, up))
            .collect())
    }

    /// `min ∂h/∂x · ẋ(x, u)` over the subgradient set, for a given input.
    pub fn barrier_derivative_given_action(
        &self,
        x: ArrayView1<f64>,
        u: ArrayView1<f64>,
        desc: &BarrierDescriptor,
        zero_tol: f64,
    ) -> Result<f64> {
        let xdot = self.system.dynamics(x, u)?;
        Ok(self
            .barrier_gradients(x, desc, zero_tol)?
            .iter()
            .map(|dhdx| dhdx.dot(&xdot))
            .fold(f64::INFINITY, f64::min))
    }

    /// [`Self::barrier_derivative_given_action`] for paired rows of `x` and `u`.
    pub fn barrier_derivative_given_action_batch(
        &self,
        x: &Array2<f64>,
        u: &Array2<f64>,
        desc: &BarrierDescriptor,
        zero_tol: f64,
    ) -> Result<Array1<f64>> {
        ensure_dim("action batch rows", x.nrows(), u.nrows())?;
        let values = (0..x.nrows())
            .into_par_iter()
            .map(|i| self.barrier_derivative_given_action(x.row(i), u.row(i), desc, zero_tol))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Array1::from(values))
    }

    /// h for the model variables `x` ranging over `domain`.
    fn add_barrier_value(
        &self,
        milp: &mut MilpBuilder,
        desc: &BarrierDescriptor,
        x: &[LinExpr<VarId>],
        domain: &BoxDomain,
        solver: &dyn MilpSolver,
        binary_type: VarType,
    ) -> Result<BarrierTerm> {
        let relu = add_relu_output(milp, &self.network, self.method, x, domain, solver, binary_type, "phi")?;
        let phi_star = self.network.forward(desc.x_star.view())?[0];
        let mut value = relu.vars.output[0].clone() + (desc.c - phi_star);
        let inf_norm = match &desc.inf_norm {
            None => None,
            Some(term) => {
                let arguments: Vec<LinExpr<VarId>> = term
                    .r
                    .rows()
                    .into_iter()
                    .zip(term.p.iter())
                    .map(|(row, &p)| LinExpr::combine(row, x, -p))
                    .collect();
                let argument_bounds = term.argument_bounds(domain)?;
                let norm = add_infinity_norm(milp, &arguments, &argument_bounds, "linf")?;
                value.add_scaled(&norm.output, -1.0);
                Some(InfNormVars { norm, argument_bounds })
            }
        };
        Ok(BarrierTerm { value, relu, inf_norm })
    }

    /// Maximize h over `region`.
    ///
    /// A positive optimum on the unsafe region is a state the barrier fails to exclude.
    pub fn barrier_value_as_milp(
        &self,
        desc: &BarrierDescriptor,
        region: &StateRegion,
        binary_type: VarType,
        solver: &dyn MilpSolver,
    ) -> Result<BarrierValueMilp> {
        desc.validate(self.system.x_dim())?;
        let mut milp = MilpBuilder::new();
        let domain = match region {
            StateRegion::Polytope { a, b } => {
                ensure_dim("region polytope columns", self.system.x_dim(), a.ncols())?;
                ensure_dim("region polytope rows", a.nrows(), b.len())?;
                self.system.x_domain().clone()
            }
            StateRegion::BoxBoundary(inner) => inner.intersect(self.system.x_domain()).ok_or_else(|| {
                NlyapError::InvalidDomain("region box does not meet the system domain".to_string())
            })?,
        };
        let x = milp.add_continuous_vars("x", domain.lo(), domain.up());
        let x_exprs = vars_to_exprs(&x);
        match region {
            StateRegion::Polytope { a, b } => {
                for (i, row) in a.rows().into_iter().enumerate() {
                    milp.add_le(LinExpr::from_row(row, &x, 0.0), b[i], &format!("region[{i}]"));
                }
            }
            StateRegion::BoxBoundary(_) => {
                add_box_boundary(&mut milp, &x_exprs, &domain, "region_boundary")?;
            }
        }
        let h = self.add_barrier_value(&mut milp, desc, &x_exprs, &domain, solver, binary_type)?;
        milp.set_objective(h.value.clone(), ObjectiveSense::Maximize);
        debug!(vars = milp.num_vars(), binaries = milp.num_binaries(), "built barrier value MILP");
        Ok(BarrierValueMilp {
            milp,
            x,
            h,
            region: region.clone(),
            domain,
        })
    }

    /// Maximize `−ḣ − εh` over the system domain; a positive optimum violates `ḣ >= −εh`.
    pub fn barrier_derivative_as_milp(
        &self,
        desc: &BarrierDescriptor,
        epsilon: f64,
        binary_type: VarType,
        solver: &dyn MilpSolver,
    ) -> Result<BarrierDerivativeMilp> {
        desc.validate(self.system.x_dim())?;
        let n = self.system.x_dim();
        let u_dim = self.system.u_dim();
        let domain = self.system.x_domain().clone();
        let mut milp = MilpBuilder::new();
        let x = milp.add_continuous_vars("x", domain.lo(), domain.up());
        let system = add_system_constraint(&self.system, &mut milp, &x, solver, binary_type)?;
        let h = self.add_barrier_value(&mut milp, desc, &vars_to_exprs(&x), &domain, solver, binary_type)?;

        let cons = &system.constraints;
        let f_bounds: Vec<Bound> = (0..n).map(|i| Bound::new(cons.f_lo[i], cons.f_up[i])).collect();
        let (mut hdot, _) = self.add_dhdx_times(&mut milp, desc, &h, &system.f, &f_bounds, "dhdx_f")?;
        let (u_lo, u_up) = (self.system.u_domain().lo(), self.system.u_domain().up());
        let mut input_abs = Vec::with_capacity(u_dim);
        let mut input_gradient_bounds = Vec::with_capacity(u_dim);
        for j in 0..u_dim {
            let g_bounds: Vec<Bound> = (0..n)
                .map(|i| Bound::new(cons.g_flat_lo[i * u_dim + j], cons.g_flat_up[i * u_dim + j]))
                .collect();
            let (a, a_bound) =
                self.add_dhdx_times(&mut milp, desc, &h, &system.g[j], &g_bounds, &format!("dhdx_G[{j}]"))?;
            let term = add_input_extremum(
                &mut milp,
                self.semantics,
                &a,
                a_bound,
                u_lo[j],
                u_up[j],
                &format!("abs_dhdx_G[{j}]"),
            )?;
            hdot += &term.expr;
            input_abs.push(term.abs);
            input_gradient_bounds.push(a_bound);
        }
        let objective = -hdot.clone() - &h.value.scaled(epsilon);
        milp.set_objective(objective, ObjectiveSense::Maximize);
        debug!(
            vars = milp.num_vars(),
            binaries = milp.num_binaries(),
            semantics = ?self.semantics,
            "built barrier derivative MILP"
        );
        Ok(BarrierDerivativeMilp {
            milp,
            x,
            system,
            h,
            hdot,
            input_abs,
            input_gradient_bounds,
            epsilon,
        })
    }

    fn add_dhdx_times(
        &self,
        milp: &mut MilpBuilder,
        desc: &BarrierDescriptor,
        h: &BarrierTerm,
        v: &[LinExpr<VarId>],
        v_bounds: &[Bound],
        name: &str,
    ) -> Result<(LinExpr<VarId>, Bound)> {
        let (mut expr, mut bound) = add_network_directional(
            milp,
            &self.network,
            &h.relu.encoding,
            &h.relu.vars.binary,
            v,
            v_bounds,
            &format!("{name}_phi"),
        )?;
        if let (Some(term), Some(vars)) = (&desc.inf_norm, &h.inf_norm) {
            let (linf, linf_bound) = add_linf_directional(
                milp,
                &vars.norm,
                &vars.argument_bounds,
                &term.r,
                -1.0,
                v,
                v_bounds,
                &format!("{name}_linf"),
            )?;
            expr += &linf;
            bound = add_bounds(bound, linf_bound);
        }
        Ok((expr, bound))
    }

    /// The ∞-norm piece `(k, sign)` realized at `x`, or chosen by `solution`.
    fn linf_selection(
        &self,
        desc: &BarrierDescriptor,
        x: ArrayView1<f64>,
        h: Option<&BarrierTerm>,
        solution: Option<&MilpSolution>,
    ) -> Option<(usize, f64)> {
        let term = desc.inf_norm.as_ref()?;
        if let (Some(vars), Some(solution)) = (h.and_then(|h| h.inf_norm.as_ref()), solution) {
            let k = vars
                .norm
                .argmax
                .iter()
                .position(|&d| solution.value(d) > 0.5)
                .unwrap_or(0);
            let sign = SignIndicator::of(&vars.norm.abs[k], vars.argument_bounds[k]).sign_at(solution);
            return Some((k, sign));
        }
        let z = term.argument(x);
        let (k, _) = argmax_abs(z.view())?;
        Some((k, if z[k] >= 0.0 { 1.0 } else { -1.0 }))
    }

    /// `∂h/∂x` on a pattern and ∞-norm piece.
    fn dhdx(&self, desc: &BarrierDescriptor, pattern: &ActivationPattern, linf: Option<(usize, f64)>) -> Array1<f64> {
        let mut dhdx = self.network.jacobian_with_pattern(pattern).row(0).to_owned();
        if let (Some(term), Some((k, sign))) = (&desc.inf_norm, linf) {
            dhdx -= &linf_row_gradient(&term.r, k, sign);
        }
        dhdx
    }

    /// First-order data of h at `x` on the pattern realized there.
    fn value_piece(&self, desc: &BarrierDescriptor, x: ArrayView1<f64>, linf: Option<(usize, f64)>) -> Result<ActivePiece> {
        let one = Array1::ones(1);
        let pattern = self.network.activation_pattern(x)?;
        let mut theta = self.network.backward_params(x, one.view())?;
        theta.add_scaled(&self.network.backward_params(desc.x_star.view(), one.view())?, -1.0);
        Ok(ActivePiece::new(
            self.dhdx(desc, &pattern, linf),
            ParameterGradient::from_network(theta, None),
        ))
    }

    /// Active pieces shared by every barrier MILP at `x`.
    fn kink_pieces(&self, desc: &BarrierDescriptor, x: ArrayView1<f64>, tol: f64) -> Result<Vec<ActivePiece>> {
        let mut active = network_kink_pieces(&self.network, x, tol, None)?;
        if let Some(term) = &desc.inf_norm {
            active.extend(linf_kink_pieces(&term.r, term.argument(x).view(), tol, &self.network, None));
        }
        Ok(active)
    }

    /// Gradient of the optimal value of a barrier value MILP with respect to ϕ's parameters.
    pub fn value_milp_gradient(
        &self,
        desc: &BarrierDescriptor,
        problem: &BarrierValueMilp,
        solution: &MilpSolution,
    ) -> Result<ParameterGradient> {
        check_optimal(solution)?;
        let tol = ACTIVE_TOLERANCE;
        let x = solution.values_of(&problem.x);
        let linf = self.linf_selection(desc, x.view(), Some(&problem.h), Some(solution));
        let objective = self.value_piece(desc, x.view(), linf)?;
        let mut active = active_box_faces(x.view(), &problem.domain, tol, &self.network, None);
        active.extend(self.kink_pieces(desc, x.view(), tol)?);
        if let StateRegion::Polytope { a, b } = &problem.region {
            for (i, row) in a.rows().into_iter().enumerate() {
                if (row.dot(&x) - b[i]).abs() <= tol {
                    active.push(ActivePiece::fixed(row.to_owned(), &self.network, None));
                }
            }
        }
        envelope_gradient(&objective, &active)
    }

    /// First-order data of `−ḣ − εh` with the pattern, ∞-norm piece and input
    /// vertex fixed; `input_signs` are the signs of `∂h/∂x·G_j`.
    fn derivative_piece(
        &self,
        desc: &BarrierDescriptor,
        x: ArrayView1<f64>,
        pattern: &ActivationPattern,
        linf: Option<(usize, f64)>,
        input_signs: &[f64],
        epsilon: f64,
    ) -> Result<(f64, ActivePiece)> {
        let dhdx = self.dhdx(desc, pattern, linf);
        let g = self.system.g(x)?;
        let g_jacobians = self.system.g_jacobians(x)?;
        let (lo, up) = (self.system.u_domain().lo(), self.system.u_domain().up());
        let mut v = self.system.f(x)?;
        let mut v_jacobian = self.system.f_jacobian(x)?;
        for (j, &s) in input_signs.iter().enumerate() {
            let u = self.semantics.extreme_input(s, lo[j], up[j]);
            v.scaled_add(u, &g.column(j));
            v_jacobian.scaled_add(u, &g_jacobians[j]);
        }
        let mut piece = self.directional_piece(pattern, &dhdx, &v, &v_jacobian)?.scaled(-1.0);
        piece.add_scaled(&self.value_piece(desc, x, linf)?, -epsilon);
        let value = -dhdx.dot(&v) - epsilon * self.barrier_value(x, desc)?;
        Ok((value, piece))
    }

    fn directional_piece(
        &self,
        pattern: &ActivationPattern,
        dhdx: &Array1<f64>,
        v: &Array1<f64>,
        v_jacobian: &Array2<f64>,
    ) -> Result<ActivePiece> {
        let one = Array1::ones(1);
        let theta = self.network.jvp_backward_params(pattern, v.view(), one.view())?;
        Ok(ActivePiece::new(
            v_jacobian.t().dot(dhdx),
            ParameterGradient::from_network(theta, None),
        ))
    }

    /// Gradient of the optimal value of the derivative MILP with respect to ϕ's parameters.
    pub fn derivative_milp_gradient(
        &self,
        desc: &BarrierDescriptor,
        problem: &BarrierDerivativeMilp,
        solution: &MilpSolution,
    ) -> Result<ParameterGradient> {
        check_optimal(solution)?;
        let tol = ACTIVE_TOLERANCE;
        let x = solution.values_of(&problem.x);
        let pattern = pattern_from_solution(&problem.h.relu.encoding, &problem.h.relu.vars.binary, solution)?;
        let linf = self.linf_selection(desc, x.view(), Some(&problem.h), Some(solution));
        let input_signs: Vec<f64> = problem
            .input_abs
            .iter()
            .zip(&problem.input_gradient_bounds)
            .map(|(unit, &bound)| SignIndicator::of(unit, bound).sign_at(solution))
            .collect();
        let (_, objective) = self.derivative_piece(desc, x.view(), &pattern, linf, &input_signs, problem.epsilon)?;

        let mut active = active_box_faces(x.view(), self.system.x_domain(), tol, &self.network, None);
        active.extend(self.kink_pieces(desc, x.view(), tol)?);
        for grad in self.system.active_constraint_gradients(x.view(), tol)? {
            active.push(ActivePiece::fixed(grad, &self.network, None));
        }
        let dhdx = self.dhdx(desc, &pattern, linf);
        let g = self.system.g(x.view())?;
        for (j, g_jacobian) in self.system.g_jacobians(x.view())?.iter().enumerate() {
            let g_j = g.column(j).to_owned();
            if dhdx.dot(&g_j).abs() <= tol {
                active.push(self.directional_piece(&pattern, &dhdx, &g_j, g_jacobian)?);
            }
        }
        envelope_gradient(&objective, &active)
    }

    /// Hinge loss `max(0, h(x) + margin)` over states that must be unsafe.
    pub fn barrier_value_loss_at_samples(
        &self,
        desc: &BarrierDescriptor,
        samples: &Array2<f64>,
        margin: f64,
        reduction: Reduction,
    ) -> Result<SampleLoss> {
        ensure_dim("sample dimension", self.system.x_dim(), samples.ncols())?;
        let per_sample = (0..samples.nrows())
            .into_par_iter()
            .map(|i| {
                let x = samples.row(i);
                let h = self.barrier_value(x, desc)?;
                let piece = self.value_piece(desc, x, self.linf_selection(desc, x, None, None))?;
                Ok(((h + margin).max(0.0), piece.grad_theta))
            })
            .collect::<Result<Vec<_>>>()?;
        self.reduce_samples(per_sample, reduction)
    }

    /// Hinge loss `max(0, −ḣ − εh + margin)` over the rows of `samples`.
    pub fn barrier_derivative_loss_at_samples(
        &self,
        desc: &BarrierDescriptor,
        epsilon: f64,
        samples: &Array2<f64>,
        margin: f64,
        reduction: Reduction,
    ) -> Result<SampleLoss> {
        ensure_dim("sample dimension", self.system.x_dim(), samples.ncols())?;
        let per_sample = (0..samples.nrows())
            .into_par_iter()
            .map(|i| {
                let x = samples.row(i);
                let pattern = self.network.activation_pattern(x)?;
                let linf = self.linf_selection(desc, x, None, None);
                let dhdx = self.dhdx(desc, &pattern, linf);
                let input_signs = self.system.g(x)?.t().dot(&dhdx).to_vec();
                let (value, piece) = self.derivative_piece(desc, x, &pattern, linf, &input_signs, epsilon)?;
                Ok(((value + margin).max(0.0), piece.grad_theta))
            })
            .collect::<Result<Vec<_>>>()?;
        self.reduce_samples(per_sample, reduction)
    }

    fn reduce_samples(&self, per_sample: Vec<(f64, ParameterGradient)>, reduction: Reduction) -> Result<SampleLoss> {
        let losses: Vec<f64> = per_sample.iter().map(|(l, _)| *l).collect();
        let (value, weights) = reduction.reduce(&losses)?;
        let mut gradient = ParameterGradient::zeros(&self.network, None);
        for ((loss, grad), w) in per_sample.iter().zip(weights) {
            if *loss > 0.0 && w != 0.0 {
                gradient.add_scaled(grad, w);
            }
        }
        Ok(SampleLoss { value, gradient })
    }
}

fn check_optimal(solution: &MilpSolution) -> Result<()> {
    if solution.is_optimal() {
        Ok(())
    } else {
        Err(NlyapError::InvalidConfig(
            "gradient of a MILP needs an optimal solution".to_string(),
        ))
    }
}
