//! The parameters that turn a ReLU network into a Lyapunov candidate.
//!
//! ```text
//! V(x) = ϕ(x) − ϕ(x̂) + λ‖R(x̄ − x̄*)‖₁
//! ```
//!
//! x̂ copies x* on `xhat_indices` and x elsewhere (x̂ = x* when unset), and
//! x̄ is the sub-vector of x on `xbar_indices` (all of x when unset).

use crate::envelope::{ActivePiece, ParameterGradient};
use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{
    ensure_dim, l1_subgradients, minkowski_sum, Bound, BoxDomain, NlyapError, ReluNetwork, Result,
};
use nlyap_milp::LinExpr;
use nlyap_relu::{interval_affine, xhat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovDescriptor {
    pub x_equilibrium: Array1<f64>,
    pub v_lambda: f64,
    /// Acts on x̄; `r.ncols()` equals the number of x̄ coordinates.
    pub r: Array2<f64>,
    pub xhat_indices: Option<Vec<usize>>,
    pub xbar_indices: Option<Vec<usize>>,
}

impl LyapunovDescriptor {
    pub fn new(x_equilibrium: Array1<f64>, v_lambda: f64, r: Array2<f64>) -> Result<Self> {
        let desc = Self {
            x_equilibrium,
            v_lambda,
            r,
            xhat_indices: None,
            xbar_indices: None,
        };
        desc.validate(desc.x_dim())?;
        Ok(desc)
    }

    /// `R = I`.
    pub fn identity(x_equilibrium: Array1<f64>, v_lambda: f64) -> Result<Self> {
        let n = x_equilibrium.len();
        Self::new(x_equilibrium, v_lambda, Array2::eye(n))
    }

    pub fn with_xhat_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        self.xhat_indices = Some(indices);
        self.validate(self.x_dim())?;
        Ok(self)
    }

    /// Restrict the norm term to `indices`; `r` must already have one column per index.
    pub fn with_xbar_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        self.xbar_indices = Some(indices);
        self.validate(self.x_dim())?;
        Ok(self)
    }

    pub fn x_dim(&self) -> usize {
        self.x_equilibrium.len()
    }

    /// Shape of R, for gradients that include it.
    pub fn r_shape(&self) -> (usize, usize) {
        self.r.dim()
    }

    pub fn validate(&self, x_dim: usize) -> Result<()> {
        ensure_dim("equilibrium", x_dim, self.x_equilibrium.len())?;
        if !self.v_lambda.is_finite() || self.v_lambda < 0.0 {
            return Err(NlyapError::InvalidConfig(format!(
                "V_lambda must be finite and non-negative, got {}",
                self.v_lambda
            )));
        }
        for (what, indices) in [("x̂", &self.xhat_indices), ("x̄", &self.xbar_indices)] {
            if let Some(indices) = indices {
                if let Some(&bad) = indices.iter().find(|&&i| i >= x_dim) {
                    return Err(NlyapError::InvalidConfig(format!(
                        "{what} index {bad} out of range for state dimension {x_dim}"
                    )));
                }
            }
        }
        let xbar_dim = self.xbar_indices.as_ref().map_or(x_dim, Vec::len);
        ensure_dim("R columns", xbar_dim, self.r.ncols())
    }

    /// R with its columns scattered to the full state: `R̄ x = R x̄`.
    pub fn r_full(&self) -> Array2<f64> {
        match &self.xbar_indices {
            None => self.r.clone(),
            Some(indices) => {
                let mut full = Array2::zeros((self.r.nrows(), self.x_dim()));
                for (c, &i) in indices.iter().enumerate() {
                    for r in 0..self.r.nrows() {
                        full[[r, i]] += self.r[[r, c]];
                    }
                }
                full
            }
        }
    }

    fn xbar(&self, x: ArrayView1<f64>) -> Array1<f64> {
        match &self.xbar_indices {
            None => x.to_owned(),
            Some(indices) => indices.iter().map(|&i| x[i]).collect(),
        }
    }

    /// `R(x̄ − x̄*)`.
    pub fn l1_argument(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("state", self.x_dim(), x.len())?;
        Ok(self.r_full().dot(&(&x - &self.x_equilibrium)))
    }

    pub fn l1_norm(&self, x: ArrayView1<f64>) -> Result<f64> {
        Ok(self.l1_argument(x)?.iter().map(|v| v.abs()).sum())
    }

    /// `R(x̄ − x̄*)` over model expressions.
    pub fn l1_argument_exprs<V: Copy + Ord>(&self, x: &[LinExpr<V>]) -> Vec<LinExpr<V>> {
        let r_full = self.r_full();
        r_full
            .rows()
            .into_iter()
            .map(|row| LinExpr::combine(row, x, -row.dot(&self.x_equilibrium)))
            .collect()
    }

    /// Interval bounds of `R(x̄ − x̄*)` for `x` in `domain`.
    pub fn l1_argument_bounds(&self, domain: &BoxDomain) -> Result<Vec<Bound>> {
        let r_full = self.r_full();
        let offset = -r_full.dot(&self.x_equilibrium);
        interval_affine(&r_full, Some(&offset), &domain.bounds())
    }

    pub fn xhat(&self, x: ArrayView1<f64>) -> Array1<f64> {
        xhat(x, self.x_equilibrium.view(), self.xhat_indices.as_deref())
    }

    /// `∂x̂/∂x` as a 0/1 mask: 1 where x̂ follows x.
    fn xhat_mask(&self) -> Option<Array1<f64>> {
        self.xhat_indices.as_ref().map(|indices| {
            let mut mask = Array1::ones(self.x_dim());
            for &i in indices {
                mask[i] = 0.0;
            }
            mask
        })
    }

    /// V(x).
    pub fn value(&self, network: &ReluNetwork, x: ArrayView1<f64>) -> Result<f64> {
        ensure_dim("Lyapunov network output", 1, network.out_dim())?;
        let phi = network.forward(x)?[0];
        let phi_hat = network.forward(self.xhat(x).view())?[0];
        Ok(phi - phi_hat + self.v_lambda * self.l1_norm(x)?)
    }

    /// Every element of the Clarke subgradient set of V at `x`.
    ///
    /// Kinks of ϕ(x), of ϕ(x̂) and zero entries of the norm argument each
    /// contribute both sides; the set is their Minkowski sum.
    pub fn value_gradients(&self, network: &ReluNetwork, x: ArrayView1<f64>, zero_tol: f64) -> Result<Vec<Array1<f64>>> {
        let phi: Vec<Array1<f64>> = network
            .input_gradients(x, zero_tol)?
            .into_iter()
            .map(|j| j.row(0).to_owned())
            .collect();
        let mut grads = phi;
        if let Some(mask) = self.xhat_mask() {
            let hat: Vec<Array1<f64>> = network
                .input_gradients(self.xhat(x).view(), zero_tol)?
                .into_iter()
                .map(|j| -(&j.row(0) * &mask))
                .collect();
            grads = minkowski_sum(&grads, &hat)?;
        }
        let r_full = self.r_full();
        let l1: Vec<Array1<f64>> = l1_subgradients(self.l1_argument(x)?.view(), zero_tol)?
            .into_iter()
            .map(|s| s.dot(&r_full) * self.v_lambda)
            .collect();
        minkowski_sum(&grads, &l1)
    }

    /// Signs of the norm argument at `x`, with `+1` at zero.
    pub fn l1_signs(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(self
            .l1_argument(x)?
            .mapv(|v| if v >= 0.0 { 1.0 } else { -1.0 }))
    }

    /// `∂R` of `Σ s_i R_i·v̄` for fixed signs `s`.
    pub fn signed_r_gradient(&self, signs: ArrayView1<f64>, v: ArrayView1<f64>) -> Array2<f64> {
        let vbar = self.xbar(v);
        Array2::from_shape_fn(self.r.dim(), |(i, j)| signs[i] * vbar[j])
    }

    /// First-order data of the norm term `‖R(x̄ − x̄*)‖₁` on the piece given by `signs`.
    pub fn l1_piece(
        &self,
        network: &ReluNetwork,
        x: ArrayView1<f64>,
        signs: ArrayView1<f64>,
        with_r: bool,
    ) -> ActivePiece {
        let grad_x = signs.dot(&self.r_full());
        let mut grad = ParameterGradient::zeros(network, with_r.then(|| self.r_shape()));
        if let Some(r) = grad.r.as_mut() {
            let dx = &x - &self.x_equilibrium;
            *r = self.signed_r_gradient(signs, dx.view());
        }
        ActivePiece::new(grad_x, grad)
    }

    /// First-order data of V at `x` on the piece realized there.
    pub fn value_piece(&self, network: &ReluNetwork, x: ArrayView1<f64>, with_r: bool) -> Result<ActivePiece> {
        let r_shape = with_r.then(|| self.r_shape());
        let one = Array1::ones(1);
        let pattern = network.activation_pattern(x)?;
        let mut piece = ActivePiece::new(
            network.jacobian_with_pattern(&pattern).row(0).to_owned(),
            ParameterGradient::from_network(network.backward_params(x, one.view())?, r_shape),
        );
        let x_hat = self.xhat(x);
        let hat_theta = ParameterGradient::from_network(network.backward_params(x_hat.view(), one.view())?, r_shape);
        let hat_x = match self.xhat_mask() {
            Some(mask) => {
                let pattern = network.activation_pattern(x_hat.view())?;
                &network.jacobian_with_pattern(&pattern).row(0) * &mask
            }
            None => Array1::zeros(x.len()),
        };
        piece.add_scaled(&ActivePiece::new(hat_x, hat_theta), -1.0);
        let signs = self.l1_signs(x)?;
        piece.add_scaled(&self.l1_piece(network, x, signs.view(), with_r), self.v_lambda);
        Ok(piece)
    }

    /// Kink constraints of V active at `x`: ReLU pre-activations of ϕ(x) and
    /// ϕ(x̂) within `tol` of zero, and zero entries of the norm argument.
    pub fn kink_pieces(&self, network: &ReluNetwork, x: ArrayView1<f64>, tol: f64, with_r: bool) -> Result<Vec<ActivePiece>> {
        let r_shape = with_r.then(|| self.r_shape());
        let mut out = network_kink_pieces(network, x, tol, r_shape)?;
        if let Some(mask) = self.xhat_mask() {
            let x_hat = self.xhat(x);
            for mut piece in network_kink_pieces(network, x_hat.view(), tol, r_shape)? {
                piece.grad_x = &piece.grad_x * &mask;
                out.push(piece);
            }
        }
        let r_full = self.r_full();
        let dx = &x - &self.x_equilibrium;
        for (i, arg) in self.l1_argument(x)?.iter().enumerate() {
            if arg.abs() <= tol {
                let mut grad = ParameterGradient::zeros(network, r_shape);
                if let Some(r) = grad.r.as_mut() {
                    let mut e = Array1::zeros(self.r.nrows());
                    e[i] = 1.0;
                    *r = self.signed_r_gradient(e.view(), dx.view());
                }
                out.push(ActivePiece::new(r_full.row(i).to_owned(), grad));
            }
        }
        Ok(out)
    }
}

/// Pre-activations of `network` within `tol` of zero at `x`, as active constraints.
pub fn network_kink_pieces(
    network: &ReluNetwork,
    x: ArrayView1<f64>,
    tol: f64,
    r_shape: Option<(usize, usize)>,
) -> Result<Vec<ActivePiece>> {
    let kinks = network.kinks(x, tol)?;
    if kinks.is_empty() {
        return Ok(Vec::new());
    }
    let pattern = network.activation_pattern(x)?;
    kinks
        .into_iter()
        .map(|(k, j)| {
            let (gx, gtheta) = network.preactivation_gradient(x, &pattern, k, j)?;
            Ok(ActivePiece::new(gx, ParameterGradient::from_network(gtheta, r_shape)))
        })
        .collect()
}
