//! Explicit subgradient enumeration.
//!
//! At a non-differentiable point the certificate conditions are checked over
//! every vertex of the Clarke subdifferential. These helpers build those
//! vertex sets with an explicit Cartesian-product iterator and refuse
//! enumerations that would not fit in memory.

use crate::error::{NlyapError, Result};
use ndarray::{Array1, ArrayView1};
use tracing::warn;

/// Enumerations larger than this are logged.
pub const ENUMERATION_WARN_THRESHOLD: usize = 1 << 10;
/// Enumerations larger than this are rejected.
pub const ENUMERATION_LIMIT: usize = 1 << 20;

/// Size of the product of `radices`, failing above [`ENUMERATION_LIMIT`].
pub fn check_enumeration(what: &str, radices: &[usize]) -> Result<usize> {
    let mut count: usize = 1;
    for &r in radices {
        count = count.saturating_mul(r.max(1));
        if count > ENUMERATION_LIMIT {
            return Err(NlyapError::EnumerationTooLarge {
                what: what.to_string(),
                count,
                limit: ENUMERATION_LIMIT,
            });
        }
    }
    if count > ENUMERATION_WARN_THRESHOLD {
        warn!(what, count, "large subgradient enumeration");
    }
    Ok(count)
}

/// Iterator over every tuple `(c_0, .., c_{n-1})` with `0 <= c_i < radices[i]`.
///
/// The last coordinate varies fastest. An empty radix list yields one empty tuple.
#[derive(Debug, Clone)]
pub struct ChoiceProduct {
    radices: Vec<usize>,
    current: Option<Vec<usize>>,
}

impl ChoiceProduct {
    pub fn new(radices: Vec<usize>) -> Self {
        let current = if radices.contains(&0) {
            None
        } else {
            Some(vec![0; radices.len()])
        };
        Self { radices, current }
    }
}

impl Iterator for ChoiceProduct {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let out = self.current.clone()?;
        let mut carry = true;
        if let Some(cur) = self.current.as_mut() {
            for i in (0..cur.len()).rev() {
                cur[i] += 1;
                if cur[i] < self.radices[i] {
                    carry = false;
                    break;
                }
                cur[i] = 0;
            }
        }
        if carry {
            self.current = None;
        }
        Some(out)
    }
}

/// Vertices of ∂‖z‖₁: `sign(z_i)` per coordinate, both signs where `|z_i| <= zero_tol`.
pub fn l1_subgradients(z: ArrayView1<f64>, zero_tol: f64) -> Result<Vec<Array1<f64>>> {
    let choices: Vec<Vec<f64>> = z
        .iter()
        .map(|&v| {
            if v.abs() <= zero_tol {
                vec![-1.0, 1.0]
            } else {
                vec![v.signum()]
            }
        })
        .collect();
    expand_choices("L1 norm signs", &choices)
}

/// Vertices of ∂‖z‖∞.
///
/// Every coordinate attaining the maximum magnitude (within `zero_tol`)
/// contributes `±e_i` with the sign of `z_i`, or both signs when `z_i` is zero.
pub fn linf_subgradients(z: ArrayView1<f64>, zero_tol: f64) -> Result<Vec<Array1<f64>>> {
    let max = z.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let mut out = Vec::new();
    for (i, &v) in z.iter().enumerate() {
        if max - v.abs() > zero_tol {
            continue;
        }
        let signs: &[f64] = if v.abs() <= zero_tol {
            &[-1.0, 1.0]
        } else if v > 0.0 {
            &[1.0]
        } else {
            &[-1.0]
        };
        for &s in signs {
            let mut g = Array1::zeros(z.len());
            g[i] = s;
            out.push(g);
        }
    }
    check_enumeration("Linf norm vertices", &[out.len()])?;
    Ok(out)
}

/// `{a + b : a ∈ lhs, b ∈ rhs}`.
pub fn minkowski_sum(lhs: &[Array1<f64>], rhs: &[Array1<f64>]) -> Result<Vec<Array1<f64>>> {
    check_enumeration("Minkowski sum", &[lhs.len(), rhs.len()])?;
    Ok(lhs
        .iter()
        .flat_map(|a| rhs.iter().map(move |b| a + b))
        .collect())
}

fn expand_choices(what: &str, choices: &[Vec<f64>]) -> Result<Vec<Array1<f64>>> {
    let radices: Vec<usize> = choices.iter().map(Vec::len).collect();
    check_enumeration(what, &radices)?;
    Ok(ChoiceProduct::new(radices)
        .map(|idx| {
            idx.iter()
                .zip(choices)
                .map(|(&k, c)| c[k])
                .collect::<Array1<f64>>()
        })
        .collect())
}
