//! JSON persistence of networks.
//!
//! A network is stored as its widths, negative slope, bias flag and the
//! per-layer weights, so a certificate or controller can be saved and
//! reloaded independently of any encoding.

use crate::error::{NlyapError, Result};
use crate::network::{LinearLayer, ReluNetwork};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Row-major weight, one inner vector per output unit.
    pub weight: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub widths: Vec<usize>,
    pub negative_slope: f64,
    pub bias: bool,
    pub layers: Vec<LayerDescriptor>,
}

impl NetworkDescriptor {
    pub fn from_network(network: &ReluNetwork) -> Self {
        let layers = network
            .layers()
            .iter()
            .map(|l| LayerDescriptor {
                weight: l.weight.rows().into_iter().map(|r| r.to_vec()).collect(),
                bias: l.bias.as_ref().map(|b| b.to_vec()),
            })
            .collect();
        Self {
            widths: network.widths(),
            negative_slope: network.negative_slope(),
            bias: network.has_bias(),
            layers,
        }
    }

    /// Rebuild the network, validating every shape against `widths`.
    pub fn to_network(&self) -> Result<ReluNetwork> {
        if self.layers.len() + 1 != self.widths.len() {
            return Err(NlyapError::InvalidConfig(format!(
                "{} layers do not match widths {:?}",
                self.layers.len(),
                self.widths
            )));
        }
        let layers = self
            .layers
            .iter()
            .zip(self.widths.windows(2))
            .enumerate()
            .map(|(k, (l, w))| {
                let (rows, cols) = (w[1], w[0]);
                if l.weight.len() != rows || l.weight.iter().any(|r| r.len() != cols) {
                    return Err(NlyapError::InvalidConfig(format!(
                        "layer {k} weight is not {rows}x{cols}"
                    )));
                }
                let flat: Vec<f64> = l.weight.iter().flatten().copied().collect();
                let weight = Array2::from_shape_vec((rows, cols), flat)
                    .map_err(|e| NlyapError::InvalidConfig(e.to_string()))?;
                let bias = match (&l.bias, self.bias) {
                    (Some(b), true) => Some(Array1::from(b.clone())),
                    (None, false) => None,
                    _ => {
                        return Err(NlyapError::InvalidConfig(format!(
                            "layer {k} bias does not match the bias flag"
                        )))
                    }
                };
                LinearLayer::new(weight, bias)
            })
            .collect::<Result<Vec<_>>>()?;
        ReluNetwork::new(layers, self.negative_slope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
