//! Sparse linear expressions.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// Handle to a variable of a [`crate::MilpBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub usize);

impl VarId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// `Σ c_i v_i + constant` over variables of type `V`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinExpr<V = VarId> {
    terms: Vec<(V, f64)>,
    constant: f64,
}

impl<V> Default for LinExpr<V> {
    fn default() -> Self {
        Self {
            terms: Vec::new(),
            constant: 0.0,
        }
    }
}

impl<V: Copy + Ord> LinExpr<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(c: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: c,
        }
    }

    pub fn var(v: V) -> Self {
        Self::term(v, 1.0)
    }

    pub fn term(v: V, coeff: f64) -> Self {
        Self {
            terms: vec![(v, coeff)],
            constant: 0.0,
        }
    }

    /// `Σ coeffs[i] * vars[i] + constant`, skipping zero coefficients.
    pub fn from_row(coeffs: ArrayView1<f64>, vars: &[V], constant: f64) -> Self {
        let terms = coeffs
            .iter()
            .zip(vars)
            .filter(|(c, _)| **c != 0.0)
            .map(|(&c, &v)| (v, c))
            .collect();
        Self { terms, constant }
    }

    /// `Σ coeffs[i] * exprs[i] + constant`.
    pub fn combine(coeffs: ArrayView1<f64>, exprs: &[LinExpr<V>], constant: f64) -> Self {
        let mut out = Self::constant(constant);
        for (&c, e) in coeffs.iter().zip(exprs) {
            if c != 0.0 {
                out.add_scaled(e, c);
            }
        }
        out
    }

    pub fn add_term(&mut self, v: V, coeff: f64) -> &mut Self {
        if coeff != 0.0 {
            self.terms.push((v, coeff));
        }
        self
    }

    pub fn add_constant(&mut self, c: f64) -> &mut Self {
        self.constant += c;
        self
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &LinExpr<V>, scale: f64) -> &mut Self {
        self.terms
            .extend(other.terms.iter().map(|&(v, c)| (v, scale * c)));
        self.constant += scale * other.constant;
        self
    }

    pub fn scaled(&self, scale: f64) -> Self {
        let mut out = Self::new();
        out.add_scaled(self, scale);
        out
    }

    pub fn terms(&self) -> &[(V, f64)] {
        &self.terms
    }

    pub fn constant_term(&self) -> f64 {
        self.constant
    }

    pub fn is_constant(&self) -> bool {
        self.terms.iter().all(|(_, c)| *c == 0.0)
    }

    /// Merge duplicate variables and drop zero coefficients.
    pub fn simplified(&self) -> Self {
        let mut merged: BTreeMap<V, f64> = BTreeMap::new();
        for &(v, c) in &self.terms {
            *merged.entry(v).or_insert(0.0) += c;
        }
        Self {
            terms: merged.into_iter().filter(|(_, c)| *c != 0.0).collect(),
            constant: self.constant,
        }
    }

    /// Evaluate with `value(v)` giving each variable's value.
    pub fn evaluate_with(&self, mut value: impl FnMut(V) -> f64) -> f64 {
        self.terms
            .iter()
            .fold(self.constant, |acc, &(v, c)| acc + c * value(v))
    }

    /// Map the variables into another namespace.
    pub fn map_vars<W: Copy + Ord>(&self, mut f: impl FnMut(V) -> W) -> LinExpr<W> {
        LinExpr {
            terms: self.terms.iter().map(|&(v, c)| (f(v), c)).collect(),
            constant: self.constant,
        }
    }
}

impl LinExpr<VarId> {
    /// Evaluate against a dense assignment indexed by [`VarId`].
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.evaluate_with(|v| values[v.0])
    }
}

/// Evaluate a vector of expressions.
pub fn evaluate_all(exprs: &[LinExpr<VarId>], values: &[f64]) -> Array1<f64> {
    exprs.iter().map(|e| e.evaluate(values)).collect()
}

/// One expression per variable.
pub fn vars_to_exprs<V: Copy + Ord>(vars: &[V]) -> Vec<LinExpr<V>> {
    vars.iter().map(|&v| LinExpr::var(v)).collect()
}

impl<V: Copy + Ord> From<f64> for LinExpr<V> {
    fn from(c: f64) -> Self {
        Self::constant(c)
    }
}

impl<V: Copy + Ord> AddAssign<&LinExpr<V>> for LinExpr<V> {
    fn add_assign(&mut self, rhs: &LinExpr<V>) {
        self.add_scaled(rhs, 1.0);
    }
}

impl<V: Copy + Ord> SubAssign<&LinExpr<V>> for LinExpr<V> {
    fn sub_assign(&mut self, rhs: &LinExpr<V>) {
        self.add_scaled(rhs, -1.0);
    }
}

impl<V: Copy + Ord> Add<&LinExpr<V>> for LinExpr<V> {
    type Output = LinExpr<V>;

    fn add(mut self, rhs: &LinExpr<V>) -> LinExpr<V> {
        self += rhs;
        self
    }
}

impl<V: Copy + Ord> Sub<&LinExpr<V>> for LinExpr<V> {
    type Output = LinExpr<V>;

    fn sub(mut self, rhs: &LinExpr<V>) -> LinExpr<V> {
        self -= rhs;
        self
    }
}

impl<V: Copy + Ord> Add<f64> for LinExpr<V> {
    type Output = LinExpr<V>;

    fn add(mut self, rhs: f64) -> LinExpr<V> {
        self.constant += rhs;
        self
    }
}

impl<V: Copy + Ord> Mul<f64> for LinExpr<V> {
    type Output = LinExpr<V>;

    fn mul(self, rhs: f64) -> LinExpr<V> {
        self.scaled(rhs)
    }
}

impl<V: Copy + Ord> Neg for LinExpr<V> {
    type Output = LinExpr<V>;

    fn neg(self) -> LinExpr<V> {
        self.scaled(-1.0)
    }
}
