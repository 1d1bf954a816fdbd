//! Dynamical systems with exact MILP encodings of their dynamics.
//!
//! - [`ControlAffineSystem`]: ẋ = f(x) + G(x)u ([`LinearSystem`],
//!   [`ReluSecondOrderControlAffineSystem`])
//! - [`HybridLinearSystem`] / [`AutonomousHybridLinearSystem`]: piecewise-affine
//!   maps selected by polytope membership
//! - ReLU discrete-time systems, autonomous or controlled
//! - [`FeedbackSystem`]: a controlled system closed with a saturated controller

pub mod control_affine;
pub mod discrete;
pub mod feedback;
pub mod hybrid;
pub mod relu_system;

pub use control_affine::{
    add_system_constraint, ControlAffineConstraints, ControlAffineSystem, LinearSystem,
    ReluSecondOrderControlAffineSystem, SystemConstraintVars,
};
pub use discrete::{ControlledDiscreteTimeSystem, DiscreteTimeSystem, DynamicsVars};
pub use feedback::{Controller, FeedbackSystem, FeedbackVars};
pub use hybrid::{AutonomousHybridLinearSystem, HybridLinearSystem, HybridMode, MODE_TOLERANCE};
pub use relu_system::{AutonomousReluSystem, AutonomousReluSystemGivenEquilibrium, ReluSystemGivenEquilibrium};

pub use nlyap_core::{NlyapError, Result};

#[cfg(test)]
mod tests;
