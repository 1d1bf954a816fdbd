//! Bound propagation and exact MILP encodings of leaky ReLU networks.
//!
//! - [`propagate_bounds`]: interval arithmetic, LP, MIP, or IA then MIP
//! - [`ReluEncoder`]: big-M encoding of the network output as a
//!   [`nlyap_milp::MixedIntegerConstraints`] bundle
//! - [`compute_network_at_xhat`]: ϕ(x̂) with x̂ mixing x and x*
//! - [`add_network_gradient_times_vector`]: `∂ϕ/∂x · v` reusing the binaries of ϕ(x)

pub mod bounds;
pub mod encoder;
pub mod jvp;
pub mod xhat;

pub use bounds::{
    interval_affine, interval_bounds, leaky_relu_interval, propagate_bounds, BoundMethod,
    NetworkBounds,
};
pub use encoder::{add_network, EncodedNetwork, ReluEncoder, ReluEncoding};
pub use jvp::{add_network_gradient_times_vector, GradientTimesVector};
pub use xhat::{compute_network_at_xhat, xhat, xhat_exprs, NetworkAtXhat};

pub use nlyap_core::{NlyapError, Result};

#[cfg(test)]
mod tests;
