//! Counterexample-guided training of Lyapunov and barrier networks.
//!
//! Every iteration rebuilds each certificate MILP from the current
//! parameters, solves it, and turns a positive optimum into the hinge loss
//! `w · max(0, optimum + margin)`. Its gradient comes from
//! [`crate::envelope`]; sample hinge losses are added on top and the sum is
//! minimized with Adam. Training stops as soon as every MILP optimum is
//! non-positive, which certifies the current parameters.

use crate::barrier::{BarrierDescriptor, ControlBarrier, StateRegion};
use crate::descriptor::LyapunovDescriptor;
use crate::envelope::ParameterGradient;
use crate::lyapunov::{ConvergenceEps, LyapunovDiscreteTime, MilpOptions, Reduction};
use ndarray::Array2;
use nlyap_core::{ensure_dim, uniform_sample_in_box, BoxDomain, NlyapError, Result};
use nlyap_milp::{MilpSolution, MilpSolver, SolveStatus, VarType};
use nlyap_system::{ControlAffineSystem, DiscreteTimeSystem};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// MILP optima at or below this count as certified.
pub const CERTIFIED_TOLERANCE: f64 = 1e-6;

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    /// Decay of the first moment (β₁).
    pub beta1: f64,
    /// Decay of the second moment (β₂).
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam over a flat parameter vector.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    m: Vec<f64>,
    v: Vec<f64>,
    t: usize,
}

impl Adam {
    pub fn new(config: AdamConfig, num_params: usize) -> Self {
        Self {
            config,
            m: vec![0.0; num_params],
            v: vec![0.0; num_params],
            t: 0,
        }
    }

    /// One descent step on `params` along `gradient`.
    pub fn step(&mut self, params: &mut [f64], gradient: &[f64]) -> Result<()> {
        ensure_dim("Adam parameters", self.m.len(), params.len())?;
        ensure_dim("Adam gradient", self.m.len(), gradient.len())?;
        self.t += 1;
        let c = &self.config;
        let t = self.t as i32;
        let bias_correction1 = 1.0 - c.beta1.powi(t);
        let bias_correction2 = 1.0 - c.beta2.powi(t);
        for i in 0..params.len() {
            let g = gradient[i];
            self.m[i] = c.beta1 * self.m[i] + (1.0 - c.beta1) * g;
            self.v[i] = c.beta2 * self.v[i] + (1.0 - c.beta2) * g * g;
            let m_hat = self.m[i] / bias_correction1;
            let v_hat = self.v[i] / bias_correction2;
            params[i] -= c.learning_rate * m_hat / (v_hat.sqrt() + c.epsilon);
        }
        Ok(())
    }

    pub fn iterations(&self) -> usize {
        self.t
    }
}

/// Losses and MILP optima of one training iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainStep {
    pub iteration: usize,
    pub loss: f64,
    /// MILP optima in the order the trainer builds them; `None` when infeasible.
    pub milp_optima: [Option<f64>; 3],
    pub sample_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub certified: bool,
    pub history: Vec<TrainStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyapunovTrainConfig {
    pub max_iterations: usize,
    pub adam: AdamConfig,
    /// ε of the positivity condition.
    pub positivity_epsilon: f64,
    /// ε of the decrease condition.
    pub derivative_epsilon: f64,
    pub eps_type: ConvergenceEps,
    pub positivity_milp_weight: f64,
    pub derivative_milp_weight: f64,
    pub positivity_sample_weight: f64,
    pub derivative_sample_weight: f64,
    pub milp_margin: f64,
    pub sample_margin: f64,
    pub num_samples: usize,
    pub seed: u64,
    pub reduction: Reduction,
    /// Train R together with ϕ.
    pub train_r: bool,
    pub milp_options: MilpOptions,
}

impl Default for LyapunovTrainConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            adam: AdamConfig::default(),
            positivity_epsilon: 0.01,
            derivative_epsilon: 0.01,
            eps_type: ConvergenceEps::ExpLower,
            positivity_milp_weight: 1.0,
            derivative_milp_weight: 1.0,
            positivity_sample_weight: 0.0,
            derivative_sample_weight: 1.0,
            milp_margin: 0.0,
            sample_margin: 0.0,
            num_samples: 100,
            seed: 0,
            reduction: Reduction::Mean,
            train_r: false,
            milp_options: MilpOptions::default(),
        }
    }
}

/// Optimum of a certificate MILP, with its gradient when it contributes to the loss.
fn milp_term(
    solution: &MilpSolution,
    what: &str,
    weight: f64,
    margin: f64,
    gradient: impl FnOnce(&MilpSolution) -> Result<ParameterGradient>,
) -> Result<(Option<f64>, f64, Option<ParameterGradient>)> {
    if solution.status == SolveStatus::Infeasible {
        return Ok((None, 0.0, None));
    }
    let optimum = solution.optimal_objective(what)?;
    let loss = weight * (optimum + margin).max(0.0);
    let grad = if loss > 0.0 { Some(gradient(solution)?.scaled(weight)) } else { None };
    Ok((Some(optimum), loss, grad))
}

pub struct LyapunovTrainer<S> {
    pub lyapunov: LyapunovDiscreteTime<S>,
    pub desc: LyapunovDescriptor,
    pub config: LyapunovTrainConfig,
}

impl<S: DiscreteTimeSystem> LyapunovTrainer<S> {
    pub fn new(lyapunov: LyapunovDiscreteTime<S>, desc: LyapunovDescriptor, config: LyapunovTrainConfig) -> Result<Self> {
        desc.validate(lyapunov.system().x_dim())?;
        config.milp_options.validate()?;
        Ok(Self { lyapunov, desc, config })
    }

    fn params(&self) -> Vec<f64> {
        let mut params = self.lyapunov.network().params();
        if self.config.train_r {
            params.extend(self.desc.r.iter().copied());
        }
        params
    }

    fn set_params(&mut self, params: &[f64]) -> Result<()> {
        let n = self.lyapunov.network().num_params();
        self.lyapunov.set_network_params(&params[..n])?;
        if self.config.train_r {
            let shape = self.desc.r.dim();
            self.desc.r = Array2::from_shape_vec(shape, params[n..].to_vec())
                .map_err(|e| NlyapError::InvalidConfig(format!("R parameters: {e}")))?;
        }
        Ok(())
    }

    /// One loss evaluation; the gradient is `None` once the MILPs certify the parameters.
    pub fn evaluate(
        &self,
        samples: &Array2<f64>,
        iteration: usize,
        solver: &dyn MilpSolver,
    ) -> Result<(TrainStep, bool, ParameterGradient)> {
        let c = &self.config;
        let with_r = c.train_r;
        let mut gradient = ParameterGradient::zeros(self.lyapunov.network(), with_r.then(|| self.desc.r_shape()));
        let mut loss = 0.0;

        let positivity =
            self.lyapunov
                .lyapunov_positivity_as_milp(&self.desc, c.positivity_epsilon, &c.milp_options, solver)?;
        let solution = positivity.solve(solver)?;
        let (pos_opt, pos_loss, pos_grad) =
            milp_term(&solution, "positivity MILP", c.positivity_milp_weight, c.milp_margin, |s| {
                self.lyapunov.milp_objective_gradient(&self.desc, &positivity, s, with_r)
            })?;

        let derivative = self.lyapunov.lyapunov_derivative_as_milp(
            &self.desc,
            c.derivative_epsilon,
            c.eps_type,
            &c.milp_options,
            solver,
        )?;
        let solution = derivative.solve(solver)?;
        let (der_opt, der_loss, der_grad) =
            milp_term(&solution, "derivative MILP", c.derivative_milp_weight, c.milp_margin, |s| {
                self.lyapunov.milp_objective_gradient(&self.desc, &derivative, s, with_r)
            })?;
        loss += pos_loss + der_loss;
        for grad in [pos_grad, der_grad].iter().flatten() {
            gradient.add_scaled(grad, 1.0);
        }

        let mut sample_loss = 0.0;
        if c.positivity_sample_weight > 0.0 {
            let term = self.lyapunov.lyapunov_positivity_loss_at_samples(
                &self.desc,
                c.positivity_epsilon,
                samples,
                c.sample_margin,
                c.reduction,
                with_r,
            )?;
            sample_loss += c.positivity_sample_weight * term.value;
            gradient.add_scaled(&term.gradient, c.positivity_sample_weight);
        }
        if c.derivative_sample_weight > 0.0 {
            let term = self.lyapunov.lyapunov_derivative_loss_at_samples(
                &self.desc,
                c.derivative_epsilon,
                c.eps_type,
                samples,
                c.sample_margin,
                c.reduction,
                with_r,
            )?;
            sample_loss += c.derivative_sample_weight * term.value;
            gradient.add_scaled(&term.gradient, c.derivative_sample_weight);
        }
        loss += sample_loss;

        let certified = [pos_opt, der_opt].iter().all(|o| o.map_or(true, |v| v <= CERTIFIED_TOLERANCE));
        let step = TrainStep {
            iteration,
            loss,
            milp_optima: [pos_opt, der_opt, None],
            sample_loss,
        };
        Ok((step, certified, gradient))
    }

    /// Train until the MILPs certify the parameters or the iteration budget runs out.
    pub fn train(&mut self, solver: &dyn MilpSolver) -> Result<TrainReport> {
        let domain = self.lyapunov.system().x_domain().clone();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let samples = uniform_sample_in_box(&domain, self.config.num_samples.max(1), &mut rng);
        let mut params = self.params();
        let mut adam = Adam::new(self.config.adam, params.len());
        let mut history = Vec::new();
        for iteration in 0..self.config.max_iterations {
            let (step, certified, gradient) = self.evaluate(&samples, iteration, solver)?;
            debug!(
                iteration,
                loss = step.loss,
                positivity = ?step.milp_optima[0],
                derivative = ?step.milp_optima[1],
                "Lyapunov training step"
            );
            history.push(step);
            if certified {
                info!(iteration, "Lyapunov conditions certified");
                return Ok(TrainReport { certified: true, history });
            }
            adam.step(&mut params, &gradient.flatten())?;
            self.set_params(&params)?;
        }
        info!(iterations = self.config.max_iterations, "Lyapunov training stopped without a certificate");
        Ok(TrainReport { certified: false, history })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierTrainConfig {
    pub max_iterations: usize,
    pub adam: AdamConfig,
    /// ε of `ḣ >= −εh`.
    pub epsilon: f64,
    /// Region where h must be non-positive.
    pub unsafe_region: Option<StateRegion>,
    /// Box whose boundary must have non-positive h.
    pub verify_region_boundary: Option<BoxDomain>,
    pub unsafe_milp_weight: f64,
    pub boundary_milp_weight: f64,
    pub derivative_milp_weight: f64,
    pub derivative_sample_weight: f64,
    pub milp_margin: f64,
    pub sample_margin: f64,
    pub num_samples: usize,
    pub seed: u64,
    pub reduction: Reduction,
    pub binary_type: VarType,
}

impl Default for BarrierTrainConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            adam: AdamConfig::default(),
            epsilon: 0.1,
            unsafe_region: None,
            verify_region_boundary: None,
            unsafe_milp_weight: 1.0,
            boundary_milp_weight: 1.0,
            derivative_milp_weight: 1.0,
            derivative_sample_weight: 1.0,
            milp_margin: 0.0,
            sample_margin: 0.0,
            num_samples: 100,
            seed: 0,
            reduction: Reduction::Mean,
            binary_type: VarType::Binary,
        }
    }
}

pub struct BarrierTrainer<S> {
    pub barrier: ControlBarrier<S>,
    pub desc: BarrierDescriptor,
    pub config: BarrierTrainConfig,
}

impl<S: ControlAffineSystem> BarrierTrainer<S> {
    pub fn new(barrier: ControlBarrier<S>, desc: BarrierDescriptor, config: BarrierTrainConfig) -> Result<Self> {
        desc.validate(barrier.system().x_dim())?;
        Ok(Self { barrier, desc, config })
    }

    fn region_term(
        &self,
        region: &StateRegion,
        what: &str,
        weight: f64,
        solver: &dyn MilpSolver,
    ) -> Result<(Option<f64>, f64, Option<ParameterGradient>)> {
        let problem = self
            .barrier
            .barrier_value_as_milp(&self.desc, region, self.config.binary_type, solver)?;
        let solution = solver.solve(&problem.milp)?;
        milp_term(&solution, what, weight, self.config.milp_margin, |s| {
            self.barrier.value_milp_gradient(&self.desc, &problem, s)
        })
    }

    /// One loss evaluation, as in [`LyapunovTrainer::evaluate`].
    pub fn evaluate(
        &self,
        samples: &Array2<f64>,
        iteration: usize,
        solver: &dyn MilpSolver,
    ) -> Result<(TrainStep, bool, ParameterGradient)> {
        let c = &self.config;
        let mut gradient = ParameterGradient::zeros(self.barrier.network(), None);
        let mut loss = 0.0;
        let mut optima = [None, None, None];

        if let Some(region) = &c.unsafe_region {
            let (opt, l, g) = self.region_term(region, "unsafe region MILP", c.unsafe_milp_weight, solver)?;
            optima[0] = opt;
            loss += l;
            if let Some(g) = g {
                gradient.add_scaled(&g, 1.0);
            }
        }
        if let Some(boundary) = &c.verify_region_boundary {
            let region = StateRegion::BoxBoundary(boundary.clone());
            let (opt, l, g) = self.region_term(&region, "verification boundary MILP", c.boundary_milp_weight, solver)?;
            optima[1] = opt;
            loss += l;
            if let Some(g) = g {
                gradient.add_scaled(&g, 1.0);
            }
        }
        let derivative = self
            .barrier
            .barrier_derivative_as_milp(&self.desc, c.epsilon, c.binary_type, solver)?;
        let solution = solver.solve(&derivative.milp)?;
        let (opt, l, g) = milp_term(&solution, "barrier derivative MILP", c.derivative_milp_weight, c.milp_margin, |s| {
            self.barrier.derivative_milp_gradient(&self.desc, &derivative, s)
        })?;
        optima[2] = opt;
        loss += l;
        if let Some(g) = g {
            gradient.add_scaled(&g, 1.0);
        }

        let mut sample_loss = 0.0;
        if c.derivative_sample_weight > 0.0 {
            let term = self.barrier.barrier_derivative_loss_at_samples(
                &self.desc,
                c.epsilon,
                samples,
                c.sample_margin,
                c.reduction,
            )?;
            sample_loss = c.derivative_sample_weight * term.value;
            gradient.add_scaled(&term.gradient, c.derivative_sample_weight);
        }
        loss += sample_loss;
        let certified = optima.iter().all(|o| o.map_or(true, |v| v <= CERTIFIED_TOLERANCE));
        Ok((
            TrainStep {
                iteration,
                loss,
                milp_optima: optima,
                sample_loss,
            },
            certified,
            gradient,
        ))
    }

    pub fn train(&mut self, solver: &dyn MilpSolver) -> Result<TrainReport> {
        let domain = self.barrier.system().x_domain().clone();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let samples = uniform_sample_in_box(&domain, self.config.num_samples.max(1), &mut rng);
        let mut params = self.barrier.network().params();
        let mut adam = Adam::new(self.config.adam, params.len());
        let mut history = Vec::new();
        for iteration in 0..self.config.max_iterations {
            let (step, certified, gradient) = self.evaluate(&samples, iteration, solver)?;
            debug!(iteration, loss = step.loss, optima = ?step.milp_optima, "barrier training step");
            history.push(step);
            if certified {
                info!(iteration, "barrier conditions certified");
                return Ok(TrainReport { certified: true, history });
            }
            adam.step(&mut params, &gradient.flatten())?;
            self.barrier.set_network_params(&params)?;
        }
        info!(iterations = self.config.max_iterations, "barrier training stopped without a certificate");
        Ok(TrainReport { certified: false, history })
    }
}
