//! Solver collaborator.
//!
//! [`MilpSolver`] is the narrow interface the certificate engine solves
//! through: take a finished [`MilpBuilder`], return a status and, when
//! optimal, the primal values. [`MicroLpSolver`] implements it with
//! `good_lp` on top of the pure-Rust `microlp` branch-and-bound backend.

use crate::expr::{LinExpr, VarId};
use crate::model::{MilpBuilder, ObjectiveSense, Sense, VarType};
use good_lp::{
    constraint, microlp, variable, Expression, ProblemVariables, ResolutionError, Solution,
    SolverModel, Variable,
};
use ndarray::Array1;
use nlyap_core::{NlyapError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Tunable solver parameters.
///
/// Backends honor what they can; the rest is logged and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Feasibility tolerance used when checking returned points.
    pub tolerance: f64,
    /// Log every constraint violated by the returned point.
    pub verbose: bool,
    pub threads: Option<usize>,
    /// Wall-clock limit in seconds.
    pub time_limit: Option<f64>,
    /// Pass warm-start hints stored in the model.
    pub warm_start: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            verbose: false,
            threads: None,
            time_limit: None,
            warm_start: false,
        }
    }
}

impl SolverConfig {
    /// Preset for tests and small problems: tight tolerance, diagnostics on.
    pub fn strict() -> Self {
        Self {
            tolerance: 1e-8,
            verbose: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Interrupted,
    TimeLimit,
}

/// Outcome of one solve.
#[derive(Debug, Clone)]
pub struct MilpSolution {
    pub status: SolveStatus,
    /// Objective value including the objective constant, when optimal.
    pub objective: Option<f64>,
    /// Primal values indexed by [`VarId`], empty unless optimal.
    pub values: Vec<f64>,
}

impl MilpSolution {
    pub fn infeasible() -> Self {
        Self {
            status: SolveStatus::Infeasible,
            objective: None,
            values: Vec::new(),
        }
    }

    pub fn is_optimal(&self) -> bool {
        self.status == SolveStatus::Optimal
    }

    pub fn value(&self, v: VarId) -> f64 {
        self.values[v.0]
    }

    pub fn values_of(&self, vars: &[VarId]) -> Array1<f64> {
        vars.iter().map(|&v| self.value(v)).collect()
    }

    pub fn eval(&self, expr: &LinExpr<VarId>) -> f64 {
        expr.evaluate(&self.values)
    }

    /// The optimal objective, failing on any other status.
    pub fn optimal_objective(&self, what: &str) -> Result<f64> {
        match (self.status, self.objective) {
            (SolveStatus::Optimal, Some(v)) => Ok(v),
            (SolveStatus::Infeasible, _) => Err(NlyapError::UnexpectedInfeasible(format!(
                "{what}: the trivial point should be feasible"
            ))),
            (status, _) => Err(NlyapError::Solver(format!("{what}: solver returned {status:?}"))),
        }
    }
}

/// Anything that can solve a [`MilpBuilder`] model.
pub trait MilpSolver: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &SolverConfig;

    /// Solve once and report the status; never retries.
    fn solve(&self, milp: &MilpBuilder) -> Result<MilpSolution>;
}

/// `good_lp` + `microlp` backend.
#[derive(Debug, Clone, Default)]
pub struct MicroLpSolver {
    config: SolverConfig,
}

impl MicroLpSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

fn to_expression(expr: &LinExpr<VarId>, vars: &[Variable]) -> Expression {
    let mut e = Expression::from(expr.constant_term());
    for &(v, c) in expr.terms() {
        e += c * vars[v.0];
    }
    e
}

impl MilpSolver for MicroLpSolver {
    fn name(&self) -> &str {
        "microlp"
    }

    fn config(&self) -> &SolverConfig {
        &self.config
    }

    fn solve(&self, milp: &MilpBuilder) -> Result<MilpSolution> {
        if self.config.threads.is_some() || self.config.time_limit.is_some() {
            debug!("microlp ignores thread count and time limit");
        }
        if self.config.warm_start && !milp.warm_start().is_empty() {
            debug!(hints = milp.warm_start().len(), "microlp ignores warm-start hints");
        }
        for (i, v) in milp.vars().iter().enumerate() {
            if v.lb > v.ub {
                debug!(var = %v.name, index = i, "empty variable domain");
                return Ok(MilpSolution::infeasible());
            }
        }

        let mut problem = ProblemVariables::new();
        let vars: Vec<Variable> = milp
            .vars()
            .iter()
            .map(|info| {
                let mut def = variable().name(info.name.clone());
                if info.var_type == VarType::Binary {
                    def = def.integer();
                }
                if info.lb.is_finite() {
                    def = def.min(info.lb);
                }
                if info.ub.is_finite() {
                    def = def.max(info.ub);
                }
                problem.add(def)
            })
            .collect();

        let objective = to_expression(milp.objective(), &vars);
        let mut model = match milp.objective_sense() {
            ObjectiveSense::Minimize => problem.minimise(objective).using(microlp),
            ObjectiveSense::Maximize => problem.maximise(objective).using(microlp),
        };
        for c in milp.constraints() {
            if c.expr.terms().is_empty() {
                if c.violation(&[]) > self.config.tolerance {
                    debug!(constraint = %c.name, "constant constraint violated");
                    return Ok(MilpSolution::infeasible());
                }
                continue;
            }
            let lhs = to_expression(&c.expr, &vars);
            let rhs = Expression::from(c.rhs);
            let con = match c.sense {
                Sense::Le => constraint::leq(lhs, rhs),
                Sense::Ge => constraint::geq(lhs, rhs),
                Sense::Eq => constraint::eq(lhs, rhs),
            };
            model.add_constraint(con);
        }

        trace!(
            vars = milp.num_vars(),
            binaries = milp.num_binaries(),
            constraints = milp.num_constraints(),
            "solving MILP"
        );
        match model.solve() {
            Ok(solution) => {
                let values: Vec<f64> = vars.iter().map(|&v| solution.value(v)).collect();
                let objective = milp.objective_value(&values);
                if self.config.verbose {
                    let violated = milp.violated_constraints(&values, self.config.tolerance.max(1e-6));
                    if !violated.is_empty() {
                        warn!(?violated, "solver returned a point violating constraints");
                    }
                }
                debug!(objective, "MILP solved");
                Ok(MilpSolution {
                    status: SolveStatus::Optimal,
                    objective: Some(objective),
                    values,
                })
            }
            Err(ResolutionError::Infeasible) => {
                debug!("MILP infeasible");
                Ok(MilpSolution::infeasible())
            }
            Err(ResolutionError::Unbounded) => Ok(MilpSolution {
                status: SolveStatus::Unbounded,
                objective: None,
                values: Vec::new(),
            }),
            Err(e) => Err(NlyapError::Solver(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConstraintSink;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_solve_small_milp() {
        // max x + 2y, x + y <= 1.5, y binary
        let mut milp = MilpBuilder::new();
        let x = milp.add_var("x", 0.0, 1.0, VarType::Continuous);
        let y = milp.add_var("y", 0.0, 1.0, VarType::Binary);
        let mut e = LinExpr::var(x);
        e.add_term(y, 1.0);
        milp.add_le(e, 1.5, "cap");
        let mut obj = LinExpr::var(x);
        obj.add_term(y, 2.0);
        milp.set_objective(obj, ObjectiveSense::Maximize);
        let sol = MicroLpSolver::default().solve(&milp).unwrap();
        assert!(sol.is_optimal());
        assert_abs_diff_eq!(sol.value(y), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.value(x), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.objective.unwrap(), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_infeasible_is_a_status() {
        let mut milp = MilpBuilder::new();
        let x = milp.add_var("x", 0.0, 1.0, VarType::Continuous);
        milp.add_ge(LinExpr::var(x), 2.0, "impossible");
        let sol = MicroLpSolver::default().solve(&milp).unwrap();
        assert_eq!(sol.status, SolveStatus::Infeasible);
        assert!(matches!(
            sol.optimal_objective("test"),
            Err(NlyapError::UnexpectedInfeasible(_))
        ));
    }

    #[test]
    fn test_objective_constant_is_reported() {
        let mut milp = MilpBuilder::new();
        let x = milp.add_var("x", -1.0, 2.0, VarType::Continuous);
        milp.set_objective(LinExpr::var(x) + 10.0, ObjectiveSense::Minimize);
        let sol = MicroLpSolver::default().solve(&milp).unwrap();
        assert_abs_diff_eq!(sol.objective.unwrap(), 9.0, epsilon = 1e-6);
    }
}
