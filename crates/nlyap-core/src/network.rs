//! Fully connected (leaky) ReLU networks.
//!
//! A network is an ordered list of affine layers with a leaky ReLU of fixed
//! negative slope between consecutive layers and no activation after the
//! last one. Everything here is plain evaluation: forward passes, activation
//! patterns, Jacobians and hand-written back-propagation. The MILP encodings
//! live in `nlyap-relu`.

use crate::error::{ensure_dim, NlyapError, Result};
use crate::subgradient::{check_enumeration, ChoiceProduct};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Affine layer `y = W x + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearLayer {
    /// Weight matrix, shape (out_features, in_features).
    pub weight: Array2<f64>,
    /// Optional bias, length out_features.
    pub bias: Option<Array1<f64>>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f64>, bias: Option<Array1<f64>>) -> Result<Self> {
        if let Some(b) = &bias {
            ensure_dim("layer bias", weight.nrows(), b.len())?;
        }
        Ok(Self { weight, bias })
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Bias of unit `i`, zero when the layer has no bias.
    #[inline]
    pub fn bias_at(&self, i: usize) -> f64 {
        self.bias.as_ref().map_or(0.0, |b| b[i])
    }

    /// Apply the affine map.
    pub fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mut y = self.weight.dot(&x);
        if let Some(b) = &self.bias {
            y += b;
        }
        y
    }

    fn num_params(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

/// Which units of each hidden layer are active (pre-activation >= 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationPattern {
    pub layers: Vec<Vec<bool>>,
}

impl ActivationPattern {
    /// Slope realized by a unit: 1 when active, `negative_slope` otherwise.
    #[inline]
    pub fn slope(&self, layer: usize, unit: usize, negative_slope: f64) -> f64 {
        if self.layers[layer][unit] {
            1.0
        } else {
            negative_slope
        }
    }

    fn slopes(&self, layer: usize, negative_slope: f64) -> Array1<f64> {
        self.layers[layer]
            .iter()
            .map(|&a| if a { 1.0 } else { negative_slope })
            .collect()
    }
}

/// Intermediate values of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    /// Input of every affine layer: `x` first, then each hidden post-activation.
    pub layer_inputs: Vec<Array1<f64>>,
    /// Pre-activations of every hidden layer.
    pub preactivations: Vec<Array1<f64>>,
    pub output: Array1<f64>,
}

impl ForwardTrace {
    pub fn activation_pattern(&self) -> ActivationPattern {
        ActivationPattern {
            layers: self
                .preactivations
                .iter()
                .map(|z| z.iter().map(|&v| v >= 0.0).collect())
                .collect(),
        }
    }
}

/// Gradient of a scalar with respect to every network parameter.
///
/// Layout mirrors the network: one weight matrix and one optional bias per layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGradient {
    pub weights: Vec<Array2<f64>>,
    pub biases: Vec<Option<Array1<f64>>>,
}

impl NetworkGradient {
    pub fn zeros_like(network: &ReluNetwork) -> Self {
        Self {
            weights: network
                .layers
                .iter()
                .map(|l| Array2::zeros(l.weight.raw_dim()))
                .collect(),
            biases: network
                .layers
                .iter()
                .map(|l| l.bias.as_ref().map(|b| Array1::zeros(b.len())))
                .collect(),
        }
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &NetworkGradient, scale: f64) {
        for (w, o) in self.weights.iter_mut().zip(&other.weights) {
            w.scaled_add(scale, o);
        }
        for (b, o) in self.biases.iter_mut().zip(&other.biases) {
            if let (Some(b), Some(o)) = (b.as_mut(), o.as_ref()) {
                b.scaled_add(scale, o);
            }
        }
    }

    /// Flatten in the order of [`ReluNetwork::params`].
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for (w, b) in self.weights.iter().zip(&self.biases) {
            out.extend(w.iter().copied());
            if let Some(b) = b {
                out.extend(b.iter().copied());
            }
        }
        out
    }
}

/// A fully connected leaky ReLU network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReluNetwork {
    layers: Vec<LinearLayer>,
    negative_slope: f64,
}

impl ReluNetwork {
    /// Build a network from layers, checking that consecutive shapes chain.
    pub fn new(layers: Vec<LinearLayer>, negative_slope: f64) -> Result<Self> {
        if layers.is_empty() {
            return Err(NlyapError::InvalidConfig(
                "a network needs at least one layer".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&negative_slope) {
            return Err(NlyapError::InvalidConfig(format!(
                "negative slope must lie in [0, 1), got {negative_slope}"
            )));
        }
        for (k, pair) in layers.windows(2).enumerate() {
            ensure_dim(
                &format!("input of layer {}", k + 1),
                pair[0].out_features(),
                pair[1].in_features(),
            )?;
        }
        Ok(Self {
            layers,
            negative_slope,
        })
    }

    /// Random initialization with `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` entries.
    pub fn setup_relu<R: Rng>(
        widths: &[usize],
        negative_slope: f64,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        check_widths(widths)?;
        let layers = widths
            .windows(2)
            .map(|w| {
                let k = 1.0 / (w[0] as f64).sqrt();
                let weight = Array2::from_shape_fn((w[1], w[0]), |_| rng.gen_range(-k..=k));
                let b = bias.then(|| Array1::from_shape_fn(w[1], |_| rng.gen_range(-k..=k)));
                LinearLayer { weight, bias: b }
            })
            .collect();
        Self::new(layers, negative_slope)
    }

    /// Build a network from a flat parameter vector laid out as [`Self::params`].
    pub fn from_params(
        widths: &[usize],
        negative_slope: f64,
        bias: bool,
        params: &[f64],
    ) -> Result<Self> {
        check_widths(widths)?;
        let layers = widths
            .windows(2)
            .map(|w| LinearLayer {
                weight: Array2::zeros((w[1], w[0])),
                bias: bias.then(|| Array1::zeros(w[1])),
            })
            .collect();
        let mut net = Self::new(layers, negative_slope)?;
        net.set_params(params)?;
        Ok(net)
    }

    pub fn layers(&self) -> &[LinearLayer] {
        &self.layers
    }

    pub fn negative_slope(&self) -> f64 {
        self.negative_slope
    }

    pub fn in_dim(&self) -> usize {
        self.layers[0].in_features()
    }

    pub fn out_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].out_features()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Widths of the input, every hidden layer and the output.
    pub fn widths(&self) -> Vec<usize> {
        std::iter::once(self.in_dim())
            .chain(self.layers.iter().map(|l| l.out_features()))
            .collect()
    }

    pub fn has_bias(&self) -> bool {
        self.layers.iter().all(|l| l.bias.is_some())
    }

    /// Number of hidden units, i.e. units followed by an activation.
    pub fn num_relu_units(&self) -> usize {
        self.layers[..self.layers.len() - 1]
            .iter()
            .map(|l| l.out_features())
            .sum()
    }

    #[inline]
    pub fn activate(&self, z: f64) -> f64 {
        if z >= 0.0 {
            z
        } else {
            self.negative_slope * z
        }
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(LinearLayer::num_params).sum()
    }

    /// Flat parameters: per layer, the weight in row-major order then the bias.
    pub fn params(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.num_params());
        for l in &self.layers {
            out.extend(l.weight.iter().copied());
            if let Some(b) = &l.bias {
                out.extend(b.iter().copied());
            }
        }
        out
    }

    pub fn set_params(&mut self, params: &[f64]) -> Result<()> {
        ensure_dim("network parameters", self.num_params(), params.len())?;
        let mut it = params.iter().copied();
        for l in &mut self.layers {
            for w in l.weight.iter_mut() {
                *w = it.next().unwrap_or_default();
            }
            if let Some(b) = l.bias.as_mut() {
                for v in b.iter_mut() {
                    *v = it.next().unwrap_or_default();
                }
            }
        }
        Ok(())
    }

    pub fn forward(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("network input", self.in_dim(), x.len())?;
        let last = self.layers.len() - 1;
        let mut h = x.to_owned();
        for (k, layer) in self.layers.iter().enumerate() {
            let z = layer.apply(h.view());
            h = if k < last {
                z.mapv(|v| self.activate(v))
            } else {
                z
            };
        }
        Ok(h)
    }

    /// Forward pass over the rows of `x`.
    pub fn forward_batch(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((x.nrows(), self.out_dim()));
        for (i, row) in x.axis_iter(Axis(0)).enumerate() {
            out.row_mut(i).assign(&self.forward(row)?);
        }
        Ok(out)
    }

    pub fn forward_trace(&self, x: ArrayView1<f64>) -> Result<ForwardTrace> {
        ensure_dim("network input", self.in_dim(), x.len())?;
        let last = self.layers.len() - 1;
        let mut layer_inputs = Vec::with_capacity(self.layers.len());
        let mut preactivations = Vec::with_capacity(last);
        let mut h = x.to_owned();
        for layer in &self.layers[..last] {
            let z = layer.apply(h.view());
            let next = z.mapv(|v| self.activate(v));
            layer_inputs.push(h);
            preactivations.push(z);
            h = next;
        }
        let output = self.layers[last].apply(h.view());
        layer_inputs.push(h);
        Ok(ForwardTrace {
            layer_inputs,
            preactivations,
            output,
        })
    }

    pub fn activation_pattern(&self, x: ArrayView1<f64>) -> Result<ActivationPattern> {
        Ok(self.forward_trace(x)?.activation_pattern())
    }

    /// Hidden units `(layer, unit)` whose pre-activation at `x` is within `tol` of zero.
    pub fn kinks(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<(usize, usize)>> {
        let trace = self.forward_trace(x)?;
        Ok(trace
            .preactivations
            .iter()
            .enumerate()
            .flat_map(|(k, z)| {
                z.iter()
                    .enumerate()
                    .filter(|(_, v)| v.abs() <= tol)
                    .map(move |(j, _)| (k, j))
            })
            .collect())
    }

    /// Jacobian `W_L D_{L-1} W_{L-1} ... D_1 W_1` of the affine piece selected by `pattern`.
    pub fn jacobian_with_pattern(&self, pattern: &ActivationPattern) -> Array2<f64> {
        let mut jac = self.layers[0].weight.clone();
        for (k, layer) in self.layers.iter().enumerate().skip(1) {
            let d = pattern.slopes(k - 1, self.negative_slope);
            let scaled = &jac * &d.insert_axis(Axis(1));
            jac = layer.weight.dot(&scaled);
        }
        jac
    }

    /// Every Jacobian in the Clarke set at `x`.
    ///
    /// Units whose pre-activation is within `zero_tol` of zero contribute both
    /// slopes, and the result is the Cartesian product over those units. Later
    /// layers keep the pattern of the forward pass at `x`.
    pub fn input_gradients(&self, x: ArrayView1<f64>, zero_tol: f64) -> Result<Vec<Array2<f64>>> {
        let trace = self.forward_trace(x)?;
        let base = trace.activation_pattern();
        let kinks: Vec<(usize, usize)> = trace
            .preactivations
            .iter()
            .enumerate()
            .flat_map(|(k, z)| {
                z.iter()
                    .enumerate()
                    .filter(|(_, v)| v.abs() <= zero_tol)
                    .map(move |(j, _)| (k, j))
            })
            .collect();
        if kinks.is_empty() {
            return Ok(vec![self.jacobian_with_pattern(&base)]);
        }
        let radices = vec![2; kinks.len()];
        check_enumeration("ReLU kink slopes", &radices)?;
        trace!(kinks = kinks.len(), "enumerating network subgradients");
        Ok(ChoiceProduct::new(radices)
            .map(|choice| {
                let mut pattern = base.clone();
                for (&(k, j), &c) in kinks.iter().zip(&choice) {
                    pattern.layers[k][j] = c == 1;
                }
                self.jacobian_with_pattern(&pattern)
            })
            .collect())
    }

    /// Back-propagate `upstream` from the pre-activation of layer `from_layer`.
    ///
    /// Returns the gradient of `upstream · y_{from_layer}` with respect to the
    /// network input and with respect to every parameter, under `pattern`.
    /// Layers after `from_layer` get zero gradient.
    pub fn backward_from_layer(
        &self,
        trace: &ForwardTrace,
        pattern: &ActivationPattern,
        from_layer: usize,
        upstream: ArrayView1<f64>,
    ) -> Result<(Array1<f64>, NetworkGradient)> {
        if from_layer >= self.layers.len() {
            return Err(NlyapError::InvalidConfig(format!(
                "layer {from_layer} out of range for a network with {} layers",
                self.layers.len()
            )));
        }
        ensure_dim(
            "upstream gradient",
            self.layers[from_layer].out_features(),
            upstream.len(),
        )?;
        let mut grad = NetworkGradient::zeros_like(self);
        let mut delta = upstream.to_owned();
        for j in (0..=from_layer).rev() {
            grad.weights[j] = outer(delta.view(), trace.layer_inputs[j].view());
            if let Some(b) = grad.biases[j].as_mut() {
                b.assign(&delta);
            }
            let g = self.layers[j].weight.t().dot(&delta);
            delta = if j > 0 {
                g * &pattern.slopes(j - 1, self.negative_slope)
            } else {
                g
            };
        }
        Ok((delta, grad))
    }

    /// Gradient of `upstream · ϕ(x)` with respect to the parameters.
    pub fn backward_params(
        &self,
        x: ArrayView1<f64>,
        upstream: ArrayView1<f64>,
    ) -> Result<NetworkGradient> {
        let trace = self.forward_trace(x)?;
        let pattern = trace.activation_pattern();
        self.backward_params_with_pattern(&trace, &pattern, upstream)
    }

    pub fn backward_params_with_pattern(
        &self,
        trace: &ForwardTrace,
        pattern: &ActivationPattern,
        upstream: ArrayView1<f64>,
    ) -> Result<NetworkGradient> {
        let (_, grad) = self.backward_from_layer(trace, pattern, self.layers.len() - 1, upstream)?;
        Ok(grad)
    }

    /// Gradients of the pre-activation of hidden unit (`layer`, `unit`) at `x`.
    ///
    /// Returns (∇ₓ z, ∇_θ z) under `pattern`.
    pub fn preactivation_gradient(
        &self,
        x: ArrayView1<f64>,
        pattern: &ActivationPattern,
        layer: usize,
        unit: usize,
    ) -> Result<(Array1<f64>, NetworkGradient)> {
        let trace = self.forward_trace(x)?;
        let mut e = Array1::zeros(self.layers[layer].out_features());
        e[unit] = 1.0;
        self.backward_from_layer(&trace, pattern, layer, e.view())
    }

    /// Gradient of `w · J(x) v` with respect to the parameters, `J` taken at a fixed pattern.
    ///
    /// Biases do not enter the Jacobian and get zero gradient.
    pub fn jvp_backward_params(
        &self,
        pattern: &ActivationPattern,
        v: ArrayView1<f64>,
        w: ArrayView1<f64>,
    ) -> Result<NetworkGradient> {
        ensure_dim("tangent vector", self.in_dim(), v.len())?;
        ensure_dim("cotangent vector", self.out_dim(), w.len())?;
        let last = self.layers.len() - 1;
        // Tangent inputs of every layer.
        let mut tangents = Vec::with_capacity(self.layers.len());
        let mut t = v.to_owned();
        for (k, layer) in self.layers[..last].iter().enumerate() {
            let y = layer.weight.dot(&t);
            tangents.push(t);
            t = y * &pattern.slopes(k, self.negative_slope);
        }
        tangents.push(t);

        let mut grad = NetworkGradient::zeros_like(self);
        let mut delta = w.to_owned();
        for j in (0..=last).rev() {
            grad.weights[j] = outer(delta.view(), tangents[j].view());
            if j > 0 {
                let g = self.layers[j].weight.t().dot(&delta);
                delta = g * &pattern.slopes(j - 1, self.negative_slope);
            }
        }
        Ok(grad)
    }
}

fn check_widths(widths: &[usize]) -> Result<()> {
    if widths.len() < 2 || widths.contains(&0) {
        return Err(NlyapError::InvalidConfig(format!(
            "network widths must list at least two positive sizes, got {widths:?}"
        )));
    }
    Ok(())
}

/// Outer product `a bᵀ`.
pub fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}
