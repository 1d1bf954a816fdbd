//! Region-of-attraction estimates from a discrete-time Lyapunov function.
//!
//! For an enclosing box B, every one-step transition that crosses ∂B does
//! so at a state whose V is at least ρ:
//!
//! - exit: `min V(x)` with `x ∈ B` and `x⁺ ∉ int B`
//! - entry: `min V(x⁺)` with `x ∉ int B` and `x⁺ ∈ B`
//!
//! An infeasible crossing contributes +∞. Any sublevel set `{V < ρ}` inside
//! B is forward invariant.

use crate::descriptor::LyapunovDescriptor;
use crate::lyapunov::{bounds_domain, LyapunovDiscreteTime, LyapunovTerm};
use nlyap_core::{BoxDomain, NlyapError, Result};
use nlyap_milp::{
    add_box_boundary, add_box_escape, vars_to_exprs, BoxEscape, ConstraintSink, LinExpr, MilpBuilder, MilpSolver,
    ObjectiveSense, SolveStatus, VarId, VarType,
};
use nlyap_system::{DiscreteTimeSystem, DynamicsVars};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Which crossing of the enclosing box a ROA MILP searches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoaDirection {
    /// Start inside, step out.
    Exit,
    /// Start outside, step in.
    Entry,
}

#[derive(Debug, Clone)]
pub struct RoaMilp {
    pub milp: MilpBuilder,
    pub x: Vec<VarId>,
    pub x_next: Vec<VarId>,
    /// V at x (exit) or at x⁺ (entry).
    pub value: LyapunovTerm,
    pub dynamics: DynamicsVars,
    pub escape: BoxEscape<VarId>,
    pub direction: RoaDirection,
}

#[derive(Debug, Clone)]
pub struct RoaBoundaryMilp {
    pub milp: MilpBuilder,
    pub x: Vec<VarId>,
    pub value: LyapunovTerm,
    /// One binary per face, `[lo_0, up_0, lo_1, up_1, ..]`.
    pub faces: Vec<VarId>,
}

/// Result of [`LyapunovDiscreteTime::compute_region_of_attraction`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoaEstimate {
    /// Certified level: `{V < rho}` is invariant; +∞ when neither crossing is feasible.
    pub rho: f64,
    /// Optimum of the exit MILP, `None` when infeasible.
    pub exit: Option<f64>,
    /// Optimum of the entry MILP, `None` when infeasible.
    pub entry: Option<f64>,
}

impl<S: DiscreteTimeSystem> LyapunovDiscreteTime<S> {
    /// The exit or entry MILP for the enclosing box `roa_box`.
    pub fn construct_milp_for_roa(
        &self,
        desc: &LyapunovDescriptor,
        roa_box: &BoxDomain,
        direction: RoaDirection,
        binary_type: VarType,
        solver: &dyn MilpSolver,
    ) -> Result<RoaMilp> {
        let system = self.system();
        desc.validate(system.x_dim())?;
        roa_box.check_dim("ROA box", system.x_dim())?;
        let domain = system.x_domain();
        let x_domain = match direction {
            RoaDirection::Exit => roa_box.intersect(domain).ok_or_else(|| {
                NlyapError::InvalidDomain("ROA box does not meet the system domain".to_string())
            })?,
            RoaDirection::Entry => domain.clone(),
        };

        let mut milp = MilpBuilder::new();
        let x = milp.add_continuous_vars("x", x_domain.lo(), x_domain.up());
        let x_next = milp.add_free_vars("x_next", system.x_dim());
        let dynamics = self.add_system_constraint(&mut milp, &x, &x_next, solver, binary_type)?;
        for (&v, b) in x_next.iter().zip(&dynamics.x_next_bounds) {
            milp.set_var_bounds(v, b.lower, b.upper);
        }
        let next_domain = bounds_domain(&dynamics.x_next_bounds)?;
        let x_exprs = vars_to_exprs(&x);
        let x_next_exprs = vars_to_exprs(&x_next);

        let (escape, value) = match direction {
            RoaDirection::Exit => {
                let escape = add_box_escape(&mut milp, &x_next_exprs, &next_domain, roa_box, "exit")?;
                let value = self.add_lyapunov_value(&mut milp, desc, &x_exprs, &x_domain, solver, binary_type, "V")?;
                (escape, value)
            }
            RoaDirection::Entry => {
                let escape = add_box_escape(&mut milp, &x_exprs, domain, roa_box, "outside")?;
                for (i, xi) in x_next_exprs.iter().enumerate() {
                    milp.add_ge(xi.clone(), roa_box.lo()[i], &format!("enter_lo[{i}]"));
                    milp.add_le(xi.clone(), roa_box.up()[i], &format!("enter_up[{i}]"));
                }
                let value =
                    self.add_lyapunov_value(&mut milp, desc, &x_next_exprs, &next_domain, solver, binary_type, "V_next")?;
                (escape, value)
            }
        };
        milp.set_objective(value.value.clone(), ObjectiveSense::Minimize);
        debug!(?direction, vars = milp.num_vars(), binaries = milp.num_binaries(), "built ROA MILP");
        Ok(RoaMilp {
            milp,
            x,
            x_next,
            value,
            dynamics,
            escape,
            direction,
        })
    }

    /// Minimize V over the boundary of `roa_box`.
    pub fn construct_milp_for_roa_boundary(
        &self,
        desc: &LyapunovDescriptor,
        roa_box: &BoxDomain,
        binary_type: VarType,
        solver: &dyn MilpSolver,
    ) -> Result<RoaBoundaryMilp> {
        desc.validate(self.system().x_dim())?;
        let domain = roa_box.intersect(self.system().x_domain()).ok_or_else(|| {
            NlyapError::InvalidDomain("ROA box does not meet the system domain".to_string())
        })?;
        let mut milp = MilpBuilder::new();
        let x = milp.add_continuous_vars("x", domain.lo(), domain.up());
        let x_exprs: Vec<LinExpr<VarId>> = vars_to_exprs(&x);
        let faces = add_box_boundary(&mut milp, &x_exprs, &domain, "boundary")?;
        let value = self.add_lyapunov_value(&mut milp, desc, &x_exprs, &domain, solver, binary_type, "V")?;
        milp.set_objective(value.value.clone(), ObjectiveSense::Minimize);
        Ok(RoaBoundaryMilp { milp, x, value, faces })
    }

    /// ρ = min of the exit and entry optima.
    pub fn compute_region_of_attraction(
        &self,
        desc: &LyapunovDescriptor,
        roa_box: &BoxDomain,
        binary_type: VarType,
        solver: &dyn MilpSolver,
    ) -> Result<RoaEstimate> {
        let mut optima = [None, None];
        for (slot, direction) in optima.iter_mut().zip([RoaDirection::Exit, RoaDirection::Entry]) {
            let problem = self.construct_milp_for_roa(desc, roa_box, direction, binary_type, solver)?;
            let solution = solver.solve(&problem.milp)?;
            *slot = match solution.status {
                SolveStatus::Infeasible => {
                    debug!(?direction, "no box crossing in this direction");
                    None
                }
                _ => Some(solution.optimal_objective("ROA MILP")?),
            };
        }
        let [exit, entry] = optima;
        let rho = exit.unwrap_or(f64::INFINITY).min(entry.unwrap_or(f64::INFINITY));
        info!(rho, ?exit, ?entry, "region of attraction estimate");
        Ok(RoaEstimate { rho, exit, entry })
    }
}
