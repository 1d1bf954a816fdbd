//! Core types for neural Lyapunov and barrier certificate verification.
//!
//! - [`BoxDomain`] / [`Bound`]: axis-aligned domains and scalar intervals
//! - [`ReluNetwork`]: fully connected leaky ReLU networks with forward
//!   evaluation, activation patterns and hand-written back-propagation
//! - [`subgradient`]: explicit enumeration of Clarke subgradient vertices
//! - [`NlyapError`]: the error taxonomy shared by every crate

pub mod bound;
pub mod descriptor;
pub mod error;
pub mod network;
pub mod sampling;
pub mod subgradient;

pub use bound::{Bound, BoxDomain, BOUND_TOLERANCE};
pub use descriptor::{LayerDescriptor, NetworkDescriptor};
pub use error::{ensure_dim, NlyapError, Result};
pub use network::{
    outer, ActivationPattern, ForwardTrace, LinearLayer, NetworkGradient, ReluNetwork,
};
pub use sampling::{uniform_sample_in_box, uniform_sample_on_box_boundary};
pub use subgradient::{
    check_enumeration, l1_subgradients, linf_subgradients, minkowski_sum, ChoiceProduct,
    ENUMERATION_LIMIT, ENUMERATION_WARN_THRESHOLD,
};
