mod encoder;
mod proptest_soundness;

use nlyap_core::ReluNetwork;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// A seeded random network.
pub(crate) fn random_network(widths: &[usize], slope: f64, seed: u64) -> ReluNetwork {
    let mut rng = StdRng::seed_from_u64(seed);
    ReluNetwork::setup_relu(widths, slope, true, &mut rng).unwrap()
}
