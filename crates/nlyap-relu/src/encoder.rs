//! Exact MILP encoding of a leaky ReLU network over a box.
//!
//! Every hidden unit gets a continuous slack equal to its post-activation
//! value. Units whose pre-activation bound spans zero also get an activation
//! binary (1 iff active) and the four big-M inequalities; stable units are
//! tied to their affine piece with an equality. The output is the last
//! affine layer applied to the last hidden slacks.

use crate::bounds::{propagate_bounds, BoundMethod, NetworkBounds};
use ndarray::{Array1, ArrayView1};
use nlyap_core::{ensure_dim, Bound, BoxDomain, ReluNetwork, Result};
use nlyap_milp::{
    add_leaky_relu, BlockVar, BundleBuilder, ConstraintSink, LinExpr, MilpSolver, MixedIntegerConstraints,
};
use tracing::debug;

/// The bundle of a network plus the bookkeeping needed to read it back.
#[derive(Debug, Clone)]
pub struct ReluEncoding {
    pub constraints: MixedIntegerConstraints,
    /// Slack column of hidden unit `[layer][unit]`.
    pub relu_unit_index: Vec<Vec<usize>>,
    /// Binary column of hidden unit `[layer][unit]`, for units spanning zero.
    pub unit_binary: Vec<Vec<Option<usize>>>,
    pub bounds: NetworkBounds,
    pub negative_slope: f64,
}

impl ReluEncoding {
    pub fn num_binaries(&self) -> usize {
        self.constraints.num_binary
    }

    pub fn nn_output_lo(&self) -> Array1<f64> {
        self.bounds.output_lo()
    }

    pub fn nn_output_up(&self) -> Array1<f64> {
        self.bounds.output_up()
    }

    /// Pre-activation bound of a hidden unit.
    pub fn preactivation_bound(&self, layer: usize, unit: usize) -> Bound {
        self.bounds.preactivation[layer][unit]
    }

    /// The slack and binary assignment that reproduces `network(x)`.
    pub fn assignment(&self, network: &ReluNetwork, x: ArrayView1<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        let trace = network.forward_trace(x)?;
        let mut slack = Array1::zeros(self.constraints.num_slack);
        let mut binary = Array1::zeros(self.constraints.num_binary);
        for (k, z) in trace.preactivations.iter().enumerate() {
            for (j, &v) in z.iter().enumerate() {
                slack[self.relu_unit_index[k][j]] = network.activate(v);
                if let Some(b) = self.unit_binary[k][j] {
                    binary[b] = if v >= 0.0 { 1.0 } else { 0.0 };
                }
            }
        }
        Ok((slack, binary))
    }
}

/// Builds [`ReluEncoding`]s; holds no state between calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReluEncoder;

impl ReluEncoder {
    /// Bound the network over `domain` with `method`, then encode it.
    pub fn output_constraint(
        network: &ReluNetwork,
        domain: &BoxDomain,
        method: BoundMethod,
        solver: &dyn MilpSolver,
    ) -> Result<ReluEncoding> {
        let bounds = propagate_bounds(network, domain, method, solver)?;
        Self::encode_with_bounds(network, domain, bounds)
    }

    /// Encode with precomputed bounds.
    pub fn encode_with_bounds(
        network: &ReluNetwork,
        domain: &BoxDomain,
        bounds: NetworkBounds,
    ) -> Result<ReluEncoding> {
        domain.check_dim("network input domain", network.in_dim())?;
        let mut b = BundleBuilder::new(network.in_dim());
        let inputs = b.inputs();
        let encoded = add_network(&mut b, network, &inputs, &bounds, "relu")?;
        let constraints = b.finish(
            &encoded.output,
            Some((domain.lo().clone(), domain.up().clone())),
            Some((bounds.output_lo(), bounds.output_up())),
        )?;
        debug!(
            slacks = constraints.num_slack,
            binaries = constraints.num_binary,
            "encoded ReLU network"
        );
        Ok(ReluEncoding {
            constraints,
            relu_unit_index: columns(&encoded.slack, |v| v.column()),
            unit_binary: columns(&encoded.binary, |v| v.map(BlockVar::column)),
            bounds,
            negative_slope: network.negative_slope(),
        })
    }
}

fn columns<T, U>(vars: &[Vec<T>], f: impl Fn(&T) -> U) -> Vec<Vec<U>> {
    vars.iter().map(|layer| layer.iter().map(&f).collect()).collect()
}

/// Variables of a network written into a [`ConstraintSink`].
#[derive(Debug, Clone)]
pub struct EncodedNetwork<V> {
    /// Network output as expressions over the sink's variables.
    pub output: Vec<LinExpr<V>>,
    /// Post-activation slack of hidden unit `[layer][unit]`.
    pub slack: Vec<Vec<V>>,
    /// Activation binary of hidden unit `[layer][unit]`, for units spanning zero.
    pub binary: Vec<Vec<Option<V>>>,
}

/// Write the exact encoding of `network(input)` into `sink`.
///
/// `bounds` must be valid for every input the sink admits. Every hidden unit
/// gets a slack; stable units tie it to their affine piece with an equality.
pub fn add_network<S: ConstraintSink>(
    sink: &mut S,
    network: &ReluNetwork,
    input: &[LinExpr<S::Var>],
    bounds: &NetworkBounds,
    name: &str,
) -> Result<EncodedNetwork<S::Var>> {
    ensure_dim("network input", network.in_dim(), input.len())?;
    ensure_dim("network bounds", network.num_layers() - 1, bounds.preactivation.len())?;
    let slope = network.negative_slope();
    let last = network.num_layers() - 1;
    let mut h = input.to_vec();
    let mut slack = Vec::with_capacity(last);
    let mut binary = Vec::with_capacity(last);

    for (k, layer) in network.layers()[..last].iter().enumerate() {
        let mut next = Vec::with_capacity(layer.out_features());
        let mut slack_k = Vec::with_capacity(layer.out_features());
        let mut binary_k = Vec::with_capacity(layer.out_features());
        for j in 0..layer.out_features() {
            let z = LinExpr::combine(layer.weight.row(j), &h, layer.bias_at(j));
            let unit_name = format!("{name}[{k}][{j}]");
            let unit = add_leaky_relu(sink, &z, bounds.preactivation[k][j], slope, &unit_name)?;
            let s = match unit.slack {
                Some(s) => s,
                None => {
                    let s = sink.add_continuous(&format!("{unit_name}_slack"), unit.bound.lower, unit.bound.upper);
                    sink.add_eq(LinExpr::var(s) - &unit.output, 0.0, &format!("{unit_name}_affine"));
                    s
                }
            };
            slack_k.push(s);
            binary_k.push(unit.binary);
            next.push(LinExpr::var(s));
        }
        h = next;
        slack.push(slack_k);
        binary.push(binary_k);
    }

    let out_layer = &network.layers()[last];
    let output = (0..out_layer.out_features())
        .map(|j| LinExpr::combine(out_layer.weight.row(j), &h, out_layer.bias_at(j)))
        .collect();
    Ok(EncodedNetwork { output, slack, binary })
}
