//! MILP modeling for certificate verification.
//!
//! - [`MilpBuilder`]: the explicit model object every encoder appends to
//! - [`MixedIntegerConstraints`]: the slack/binary constraint bundle produced
//!   by network and dynamics encoders
//! - [`encodings`]: exact big-M encodings (leaky ReLU, absolute value,
//!   binary×continuous product, saturation, box boundary, box escape, ∞-norm)
//! - [`MilpSolver`]: the solver collaborator, with a `good_lp`/`microlp` backend

pub mod encodings;
pub mod expr;
pub mod mixed_integer;
pub mod model;
pub mod solver;

pub use encodings::{
    add_absolute_value, add_binary_continuous_product, add_box_boundary, add_box_escape,
    add_infinity_norm, add_leaky_relu, add_saturation, BoxEscape, InfinityNorm, PiecewiseUnit,
    SaturationUnit,
};
pub use expr::{evaluate_all, vars_to_exprs, LinExpr, VarId};
pub use mixed_integer::{
    add_mixed_integer_linear_constraints, BlockExpr, BlockVar, BundleBuilder,
    MixedIntegerConstraints, MixedIntegerVars,
};
pub use model::{
    ConstraintSink, LinearConstraint, MilpBuilder, ObjectiveSense, Sense, VarInfo, VarType,
};
pub use solver::{MicroLpSolver, MilpSolution, MilpSolver, SolveStatus, SolverConfig};

pub use nlyap_core::{NlyapError, Result};

#[cfg(test)]
mod tests;
