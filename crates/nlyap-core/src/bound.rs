//! Scalar bounds and axis-aligned box domains.

use crate::error::{ensure_dim, NlyapError, Result};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Slack allowed when a computed lower bound exceeds its upper bound.
///
/// Solvers return bounds with a small numerical error. Anything beyond this
/// is a precondition failure and is reported, never clamped.
pub const BOUND_TOLERANCE: f64 = 1e-6;

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Create a bound from computed values, tolerating tiny inversions.
    ///
    /// An inversion within [`BOUND_TOLERANCE`] collapses to the midpoint;
    /// anything larger is an error.
    pub fn checked(lower: f64, upper: f64, index: usize) -> Result<Self> {
        if lower.is_nan() || upper.is_nan() || lower > upper + BOUND_TOLERANCE {
            return Err(NlyapError::InvalidBounds {
                index,
                lower,
                upper,
            });
        }
        if lower > upper {
            let mid = 0.5 * (lower + upper);
            return Ok(Self {
                lower: mid,
                upper: mid,
            });
        }
        Ok(Self { lower, upper })
    }

    /// Create a concrete (point) bound.
    #[inline]
    pub fn concrete(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    /// Check if this bound contains a value.
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Width of the bound interval.
    #[inline]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// True when the interval strictly contains zero.
    #[inline]
    pub fn spans_zero(&self) -> bool {
        self.lower < 0.0 && self.upper > 0.0
    }

    /// True when lower == upper.
    #[inline]
    pub fn is_constant(&self) -> bool {
        self.lower == self.upper
    }

    /// Intersect two bounds.
    #[inline]
    pub fn intersect(&self, other: &Bound) -> Option<Bound> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower <= upper {
            Some(Bound { lower, upper })
        } else {
            None
        }
    }

    /// Union of two bounds (convex hull).
    #[inline]
    pub fn union(&self, other: &Bound) -> Bound {
        Bound {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Image of the interval under `t -> scale * t`.
    #[inline]
    pub fn scale(&self, scale: f64) -> Bound {
        if scale >= 0.0 {
            Bound::new(scale * self.lower, scale * self.upper)
        } else {
            Bound::new(scale * self.upper, scale * self.lower)
        }
    }
}

/// An axis-aligned box `lo <= x <= up`.
///
/// Entries may be infinite (unbounded control limits), never NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDomain {
    lo: Array1<f64>,
    up: Array1<f64>,
}

impl BoxDomain {
    /// Create a box, rejecting mismatched lengths and `lo > up`.
    pub fn new(lo: Array1<f64>, up: Array1<f64>) -> Result<Self> {
        ensure_dim("box upper bound", lo.len(), up.len())?;
        for (i, (&l, &u)) in lo.iter().zip(up.iter()).enumerate() {
            if l.is_nan() || u.is_nan() || l > u {
                return Err(NlyapError::InvalidBounds {
                    index: i,
                    lower: l,
                    upper: u,
                });
            }
        }
        Ok(Self { lo, up })
    }

    /// Create a box from slices.
    pub fn from_slices(lo: &[f64], up: &[f64]) -> Result<Self> {
        Self::new(Array1::from(lo.to_vec()), Array1::from(up.to_vec()))
    }

    /// Degenerate box containing a single point.
    pub fn point(x: ArrayView1<f64>) -> Self {
        Self {
            lo: x.to_owned(),
            up: x.to_owned(),
        }
    }

    pub fn lo(&self) -> &Array1<f64> {
        &self.lo
    }

    pub fn up(&self) -> &Array1<f64> {
        &self.up
    }

    pub fn dim(&self) -> usize {
        self.lo.len()
    }

    /// Bound of coordinate `i`.
    pub fn bound(&self, i: usize) -> Bound {
        Bound {
            lower: self.lo[i],
            upper: self.up[i],
        }
    }

    pub fn bounds(&self) -> Vec<Bound> {
        (0..self.dim()).map(|i| self.bound(i)).collect()
    }

    /// True when every coordinate is finite.
    pub fn is_finite(&self) -> bool {
        self.lo.iter().chain(self.up.iter()).all(|v| v.is_finite())
    }

    /// Check membership with tolerance `tol`.
    pub fn contains(&self, x: ArrayView1<f64>, tol: f64) -> bool {
        x.len() == self.dim()
            && x
                .iter()
                .zip(self.lo.iter().zip(self.up.iter()))
                .all(|(&v, (&l, &u))| v >= l - tol && v <= u + tol)
    }

    /// Center of the box.
    pub fn mid(&self) -> Array1<f64> {
        (&self.lo + &self.up) * 0.5
    }

    /// Half of the side lengths.
    pub fn half_range(&self) -> Array1<f64> {
        (&self.up - &self.lo) * 0.5
    }

    /// Intersection with another box of the same dimension.
    pub fn intersect(&self, other: &BoxDomain) -> Option<BoxDomain> {
        if other.dim() != self.dim() {
            return None;
        }
        let lo = Array1::from_shape_fn(self.dim(), |i| self.lo[i].max(other.lo[i]));
        let up = Array1::from_shape_fn(self.dim(), |i| self.up[i].min(other.up[i]));
        BoxDomain::new(lo, up).ok()
    }

    /// True when this box lies inside `other`.
    pub fn is_subset_of(&self, other: &BoxDomain) -> bool {
        self.dim() == other.dim()
            && (0..self.dim()).all(|i| self.lo[i] >= other.lo[i] && self.up[i] <= other.up[i])
    }

    /// Stack two boxes, e.g. a state box and a control box into a box over `[x; u]`.
    pub fn concat(&self, other: &BoxDomain) -> BoxDomain {
        let lo = self.lo.iter().chain(other.lo.iter()).copied().collect();
        let up = self.up.iter().chain(other.up.iter()).copied().collect();
        BoxDomain { lo, up }
    }

    /// Copy of the box with the listed coordinates pinned to `values[i]`.
    pub fn with_fixed(&self, indices: &[usize], values: ArrayView1<f64>) -> Result<BoxDomain> {
        ensure_dim("pinned values", self.dim(), values.len())?;
        let mut lo = self.lo.clone();
        let mut up = self.up.clone();
        for &i in indices {
            if i >= self.dim() {
                return Err(NlyapError::InvalidConfig(format!(
                    "index {i} out of range for a box of dimension {}",
                    self.dim()
                )));
            }
            lo[i] = values[i];
            up[i] = values[i];
        }
        Ok(BoxDomain { lo, up })
    }

    /// Ensure `x` has the dimension of this box.
    pub fn check_dim(&self, what: &str, got: usize) -> Result<()> {
        ensure_dim(what, self.dim(), got)
    }
}
