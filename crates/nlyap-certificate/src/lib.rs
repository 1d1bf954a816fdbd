//! Lyapunov and barrier certificates for systems with ReLU components.
//!
//! - [`LyapunovDiscreteTime`]: positivity and decrease of
//!   `V(x) = ϕ(x) − ϕ(x̂) + λ‖R(x̄ − x̄*)‖₁` for `x[n+1] = f(x[n])`
//! - [`ControlLyapunov`]: `min_u V̇ <= −εV` for control-affine systems
//! - [`ControlBarrier`]: `h <= 0` on unsafe states and `ḣ >= −εh`
//! - [`RoaEstimate`]: invariant sublevel sets inside a box
//! - [`envelope`]: gradients of MILP optima with respect to network parameters
//! - [`train`]: counterexample-guided training with Adam
//!
//! Every condition is available pointwise, as a sample loss and as an exact
//! MILP whose optimum is the worst violation over the domain.

pub mod barrier;
pub mod control_lyapunov;
pub mod descriptor;
pub mod envelope;
mod gradient_terms;
pub mod lyapunov;
pub mod roa;
pub mod train;

pub use barrier::{
    BarrierDerivativeMilp, BarrierDescriptor, BarrierTerm, BarrierValueMilp, ControlBarrier, InfNormTerm,
    InfNormVars, StateRegion,
};
pub use control_lyapunov::{ControlLyapunov, ControlLyapunovMilp};
pub use descriptor::{network_kink_pieces, LyapunovDescriptor};
pub use envelope::{envelope_gradient, ActivePiece, ParameterGradient, ACTIVE_TOLERANCE};
pub use gradient_terms::InputSemantics;
pub use lyapunov::{
    add_lyapunov_bounds_constraint, ConvergenceEps, L1Term, LyapunovDiscreteTime, LyapunovMilp, LyapunovQuery,
    LyapunovReluOutput, LyapunovTerm, MilpOptions, Reduction, SampleLoss,
};
pub use roa::{RoaBoundaryMilp, RoaDirection, RoaEstimate, RoaMilp};
pub use train::{
    Adam, AdamConfig, BarrierTrainConfig, BarrierTrainer, LyapunovTrainConfig, LyapunovTrainer, TrainReport,
    TrainStep, CERTIFIED_TOLERANCE,
};

pub use nlyap_core::{NlyapError, Result};

#[cfg(test)]
mod tests;
