//! The explicit MILP model object.
//!
//! Every encoding function receives a `&mut MilpBuilder` (or any other
//! [`ConstraintSink`]) and appends to it; the caller owns the model and hands
//! it to a [`crate::MilpSolver`]. There is no shared global model.

use crate::expr::{LinExpr, VarId};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarType {
    Continuous,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarInfo {
    pub name: String,
    pub lb: f64,
    pub ub: f64,
    pub var_type: VarType,
}

/// Relation between a constraint's expression and its right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    Le,
    Ge,
    Eq,
}

impl fmt::Display for Sense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sense::Le => write!(f, "<="),
            Sense::Ge => write!(f, ">="),
            Sense::Eq => write!(f, "=="),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectiveSense {
    #[default]
    Minimize,
    Maximize,
}

/// `expr sense rhs`; the expression carries no constant.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub name: String,
    pub expr: LinExpr<VarId>,
    pub sense: Sense,
    pub rhs: f64,
}

impl LinearConstraint {
    /// Signed violation at `values` (zero when satisfied).
    pub fn violation(&self, values: &[f64]) -> f64 {
        let lhs = self.expr.evaluate(values);
        match self.sense {
            Sense::Le => (lhs - self.rhs).max(0.0),
            Sense::Ge => (self.rhs - lhs).max(0.0),
            Sense::Eq => (lhs - self.rhs).abs(),
        }
    }
}

/// Anything linear constraints and fresh variables can be written into.
///
/// Implemented by [`MilpBuilder`] (variables are model columns) and by
/// [`crate::BundleBuilder`] (variables are slack/binary columns of a
/// mixed-integer constraint bundle), so the exact encodings are written once.
pub trait ConstraintSink {
    type Var: Copy + Ord + fmt::Debug;

    fn add_continuous(&mut self, name: &str, lb: f64, ub: f64) -> Self::Var;

    fn add_binary(&mut self, name: &str) -> Self::Var;

    fn add_linear(&mut self, expr: LinExpr<Self::Var>, sense: Sense, rhs: f64, name: &str);

    fn add_le(&mut self, expr: LinExpr<Self::Var>, rhs: f64, name: &str) {
        self.add_linear(expr, Sense::Le, rhs, name);
    }

    fn add_ge(&mut self, expr: LinExpr<Self::Var>, rhs: f64, name: &str) {
        self.add_linear(expr, Sense::Ge, rhs, name);
    }

    fn add_eq(&mut self, expr: LinExpr<Self::Var>, rhs: f64, name: &str) {
        self.add_linear(expr, Sense::Eq, rhs, name);
    }
}

/// Mixed-integer linear program under construction.
#[derive(Debug, Clone, Default)]
pub struct MilpBuilder {
    vars: Vec<VarInfo>,
    constraints: Vec<LinearConstraint>,
    objective: LinExpr<VarId>,
    sense: ObjectiveSense,
    warm_start: BTreeMap<VarId, f64>,
}

impl MilpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_var(&mut self, name: impl Into<String>, lb: f64, ub: f64, var_type: VarType) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(VarInfo {
            name: name.into(),
            lb,
            ub,
            var_type,
        });
        id
    }

    /// One continuous variable per entry of `lo`/`up`, named `prefix[i]`.
    pub fn add_continuous_vars(&mut self, prefix: &str, lo: &Array1<f64>, up: &Array1<f64>) -> Vec<VarId> {
        lo.iter()
            .zip(up.iter())
            .enumerate()
            .map(|(i, (&l, &u))| self.add_var(format!("{prefix}[{i}]"), l, u, VarType::Continuous))
            .collect()
    }

    /// `n` free continuous variables.
    pub fn add_free_vars(&mut self, prefix: &str, n: usize) -> Vec<VarId> {
        (0..n)
            .map(|i| {
                self.add_var(
                    format!("{prefix}[{i}]"),
                    f64::NEG_INFINITY,
                    f64::INFINITY,
                    VarType::Continuous,
                )
            })
            .collect()
    }

    pub fn add_binary_vars(&mut self, prefix: &str, n: usize) -> Vec<VarId> {
        (0..n)
            .map(|i| self.add_var(format!("{prefix}[{i}]"), 0.0, 1.0, VarType::Binary))
            .collect()
    }

    /// Add `expr sense rhs`, folding the expression's constant into the right-hand side.
    pub fn add_constraint(&mut self, expr: LinExpr<VarId>, sense: Sense, rhs: f64, name: impl Into<String>) {
        let constant = expr.constant_term();
        let mut expr = expr.simplified();
        expr.add_constant(-constant);
        self.constraints.push(LinearConstraint {
            name: name.into(),
            expr,
            sense,
            rhs: rhs - constant,
        });
    }

    pub fn set_objective(&mut self, objective: LinExpr<VarId>, sense: ObjectiveSense) {
        self.objective = objective;
        self.sense = sense;
    }

    /// Replace the bounds of `v`, e.g. to pin a state to a sample.
    pub fn set_var_bounds(&mut self, v: VarId, lb: f64, ub: f64) {
        let info = &mut self.vars[v.0];
        info.lb = lb;
        info.ub = ub;
    }

    /// Pin every variable in `vars` to the matching entry of `values`.
    pub fn fix_vars(&mut self, vars: &[VarId], values: &Array1<f64>) {
        for (&v, &x) in vars.iter().zip(values.iter()) {
            self.set_var_bounds(v, x, x);
        }
    }

    /// Hint a starting value; backends may ignore it.
    pub fn set_warm_start(&mut self, v: VarId, value: f64) {
        self.warm_start.insert(v, value);
    }

    pub fn warm_start(&self) -> &BTreeMap<VarId, f64> {
        &self.warm_start
    }

    pub fn var(&self, v: VarId) -> &VarInfo {
        &self.vars[v.0]
    }

    pub fn vars(&self) -> &[VarInfo] {
        &self.vars
    }

    pub fn constraints(&self) -> &[LinearConstraint] {
        &self.constraints
    }

    pub fn objective(&self) -> &LinExpr<VarId> {
        &self.objective
    }

    pub fn objective_sense(&self) -> ObjectiveSense {
        self.sense
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn num_binaries(&self) -> usize {
        self.vars
            .iter()
            .filter(|v| v.var_type == VarType::Binary)
            .count()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Copy with every binary relaxed to a continuous variable in its bounds.
    pub fn relaxed(&self) -> MilpBuilder {
        let mut out = self.clone();
        for v in &mut out.vars {
            v.var_type = VarType::Continuous;
        }
        out
    }

    pub fn objective_value(&self, values: &[f64]) -> f64 {
        self.objective.evaluate(values)
    }

    /// Names of constraints (and variable bounds) violated by more than `tol` at `values`.
    ///
    /// A poor man's infeasibility diagnosis for a point the caller expected
    /// to be feasible.
    pub fn violated_constraints(&self, values: &[f64], tol: f64) -> Vec<String> {
        let mut out: Vec<String> = self
            .constraints
            .iter()
            .filter(|c| c.violation(values) > tol)
            .map(|c| c.name.clone())
            .collect();
        for (v, &x) in self.vars.iter().zip(values) {
            if x < v.lb - tol || x > v.ub + tol {
                out.push(format!("bounds of {}", v.name));
            }
        }
        out
    }
}

impl ConstraintSink for MilpBuilder {
    type Var = VarId;

    fn add_continuous(&mut self, name: &str, lb: f64, ub: f64) -> VarId {
        self.add_var(name, lb, ub, VarType::Continuous)
    }

    fn add_binary(&mut self, name: &str) -> VarId {
        self.add_var(name, 0.0, 1.0, VarType::Binary)
    }

    fn add_linear(&mut self, expr: LinExpr<VarId>, sense: Sense, rhs: f64, name: &str) {
        self.add_constraint(expr, sense, rhs, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_folds_into_rhs() {
        let mut milp = MilpBuilder::new();
        let x = milp.add_var("x", 0.0, 1.0, VarType::Continuous);
        milp.add_le(LinExpr::var(x) + 2.0, 3.0, "c");
        let c = &milp.constraints()[0];
        assert_eq!(c.rhs, 1.0);
        assert_eq!(c.expr.constant_term(), 0.0);
        assert!(milp.violated_constraints(&[0.5], 1e-9).is_empty());
        assert_eq!(milp.violated_constraints(&[1.5], 1e-9).len(), 2);
    }

    #[test]
    fn test_relaxed_drops_integrality() {
        let mut milp = MilpBuilder::new();
        milp.add_binary_vars("b", 3);
        assert_eq!(milp.num_binaries(), 3);
        assert_eq!(milp.relaxed().num_binaries(), 0);
    }
}
