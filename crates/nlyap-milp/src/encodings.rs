//! Exact mixed-integer encodings of piecewise-linear primitives.
//!
//! Every function is generic over [`ConstraintSink`] so the same rows land
//! either in a live model or in a constraint bundle. All encodings are exact
//! given valid bounds on their continuous arguments: every feasible binary
//! assignment reproduces the piecewise function.

use crate::expr::LinExpr;
use crate::model::ConstraintSink;
use nlyap_core::{Bound, BoxDomain, NlyapError, Result};

/// Result of encoding `max(z, slope·z)`.
#[derive(Debug, Clone)]
pub struct PiecewiseUnit<V> {
    /// The unit's output: `z`, `slope·z`, or the slack.
    pub output: LinExpr<V>,
    /// The slack, only for units whose bound spans zero.
    pub slack: Option<V>,
    /// The activation binary (1 iff `z >= 0`), only for units whose bound spans zero.
    pub binary: Option<V>,
    /// Bounds on the output.
    pub bound: Bound,
}

/// Encode `s = max(z, slope·z)` for `z ∈ bound`, `slope <= 1`.
///
/// A unit with `lower >= 0` is the identity and one with `upper <= 0` is
/// `slope·z`; neither needs a binary. Otherwise a slack `s` and binary `β`
/// satisfy
///
/// ```text
/// s >= z,  s >= slope·z,
/// s <= z − (1−β)(1−slope)·lower,
/// s <= slope·z + β(1−slope)·upper.
/// ```
///
/// `slope = 0` is a ReLU, `slope = −1` is `|z|`.
pub fn add_leaky_relu<S: ConstraintSink>(
    sink: &mut S,
    z: &LinExpr<S::Var>,
    bound: Bound,
    slope: f64,
    name: &str,
) -> Result<PiecewiseUnit<S::Var>> {
    if slope >= 1.0 {
        return Err(NlyapError::InvalidConfig(format!(
            "{name}: slope must be below 1, got {slope}"
        )));
    }
    if bound.lower.is_nan() || bound.upper.is_nan() || bound.lower > bound.upper {
        return Err(NlyapError::InvalidBounds {
            index: 0,
            lower: bound.lower,
            upper: bound.upper,
        });
    }
    if bound.lower >= 0.0 {
        return Ok(PiecewiseUnit {
            output: z.clone(),
            slack: None,
            binary: None,
            bound,
        });
    }
    if bound.upper <= 0.0 {
        return Ok(PiecewiseUnit {
            output: z.scaled(slope),
            slack: None,
            binary: None,
            bound: bound.scale(slope),
        });
    }
    if !bound.lower.is_finite() || !bound.upper.is_finite() {
        return Err(NlyapError::InvalidDomain(format!(
            "{name}: big-M encoding needs finite bounds, got [{}, {}]",
            bound.lower, bound.upper
        )));
    }
    let (l, u) = (bound.lower, bound.upper);
    let out_bound = Bound::new(0.0_f64.min(slope * l), u.max(slope * l));
    let s = sink.add_continuous(&format!("{name}_slack"), out_bound.lower, out_bound.upper);
    let beta = sink.add_binary(&format!("{name}_binary"));
    let sv = LinExpr::var(s);
    sink.add_ge(sv.clone() - z, 0.0, &format!("{name}_ge_z"));
    sink.add_ge(sv.clone() - &z.scaled(slope), 0.0, &format!("{name}_ge_slope_z"));
    let mut upper_active = sv.clone() - z;
    upper_active.add_term(beta, -(1.0 - slope) * l);
    sink.add_le(upper_active, -(1.0 - slope) * l, &format!("{name}_le_active"));
    let mut upper_inactive = sv - &z.scaled(slope);
    upper_inactive.add_term(beta, -(1.0 - slope) * u);
    sink.add_le(upper_inactive, 0.0, &format!("{name}_le_inactive"));
    Ok(PiecewiseUnit {
        output: LinExpr::var(s),
        slack: Some(s),
        binary: Some(beta),
        bound: out_bound,
    })
}

/// Encode `|z|`; the binary (when created) is 1 iff `z >= 0`.
pub fn add_absolute_value<S: ConstraintSink>(
    sink: &mut S,
    z: &LinExpr<S::Var>,
    bound: Bound,
    name: &str,
) -> Result<PiecewiseUnit<S::Var>> {
    add_leaky_relu(sink, z, bound, -1.0, name)
}

/// Encode `p = β·y` for binary `β` and `y ∈ y_bound` (exact McCormick).
///
/// ```text
/// y_lo·β <= p <= y_up·β
/// y − y_up(1−β) <= p <= y − y_lo(1−β)
/// ```
pub fn add_binary_continuous_product<S: ConstraintSink>(
    sink: &mut S,
    beta: S::Var,
    y: &LinExpr<S::Var>,
    y_bound: Bound,
    name: &str,
) -> Result<S::Var> {
    let (yl, yu) = (y_bound.lower, y_bound.upper);
    if !yl.is_finite() || !yu.is_finite() || yl > yu {
        return Err(NlyapError::InvalidDomain(format!(
            "{name}: product encoding needs finite bounds, got [{yl}, {yu}]"
        )));
    }
    let p = sink.add_continuous(&format!("{name}_product"), yl.min(0.0), yu.max(0.0));
    let pv = LinExpr::var(p);
    let mut e = pv.clone();
    e.add_term(beta, -yu);
    sink.add_le(e, 0.0, &format!("{name}_le_up_beta"));
    let mut e = pv.clone();
    e.add_term(beta, -yl);
    sink.add_ge(e, 0.0, &format!("{name}_ge_lo_beta"));
    let mut e = pv.clone() - y;
    e.add_term(beta, -yl);
    sink.add_le(e, -yl, &format!("{name}_le_y"));
    let mut e = pv - y;
    e.add_term(beta, -yu);
    sink.add_ge(e, -yu, &format!("{name}_ge_y"));
    Ok(p)
}

/// Result of encoding `clip(u_pre, lo, up)`.
#[derive(Debug, Clone)]
pub struct SaturationUnit<V> {
    pub output: LinExpr<V>,
    pub binaries: Vec<V>,
}

/// Encode `clip(u_pre, lo, up)` as `lo + relu(u_pre − lo) − relu(u_pre − up)`.
///
/// Each ReLU piece only gets a binary when its kink lies strictly inside the
/// bound of `u_pre`. An infinite limit drops the matching piece, and with both
/// limits infinite the output is `u_pre` itself.
pub fn add_saturation<S: ConstraintSink>(
    sink: &mut S,
    u_pre: &LinExpr<S::Var>,
    pre_bound: Bound,
    lo: f64,
    up: f64,
    name: &str,
) -> Result<SaturationUnit<S::Var>> {
    if lo.is_nan() || up.is_nan() || lo > up {
        return Err(NlyapError::InvalidBounds {
            index: 0,
            lower: lo,
            upper: up,
        });
    }
    let mut binaries = Vec::new();
    let mut output = if lo.is_finite() {
        let shifted = u_pre.clone() + (-lo);
        let lower_piece = add_leaky_relu(
            sink,
            &shifted,
            Bound::new(pre_bound.lower - lo, (pre_bound.upper - lo).max(pre_bound.lower - lo)),
            0.0,
            &format!("{name}_lo"),
        )?;
        binaries.extend(lower_piece.binary);
        lower_piece.output + lo
    } else {
        u_pre.clone()
    };
    if up.is_finite() {
        let shifted = u_pre.clone() + (-up);
        let upper_piece = add_leaky_relu(
            sink,
            &shifted,
            Bound::new(pre_bound.lower - up, (pre_bound.upper - up).max(pre_bound.lower - up)),
            0.0,
            &format!("{name}_up"),
        )?;
        binaries.extend(upper_piece.binary);
        output -= &upper_piece.output;
    }
    Ok(SaturationUnit { output, binaries })
}

/// Constrain `x` to the boundary of `domain`.
///
/// One binary per face `(i, lo)` / `(i, up)` in the order
/// `[lo_0, up_0, lo_1, up_1, ..]`, exactly one of them active; the active face
/// pins its coordinate.
pub fn add_box_boundary<S: ConstraintSink>(
    sink: &mut S,
    x: &[LinExpr<S::Var>],
    domain: &BoxDomain,
    name: &str,
) -> Result<Vec<S::Var>> {
    domain.check_dim("boundary state", x.len())?;
    if !domain.is_finite() {
        return Err(NlyapError::InvalidDomain(format!(
            "{name}: box boundary needs a finite box"
        )));
    }
    let mut faces = Vec::with_capacity(2 * x.len());
    let mut sum = LinExpr::new();
    for (i, xi) in x.iter().enumerate() {
        let (lo, up) = (domain.lo()[i], domain.up()[i]);
        let width = up - lo;
        sink.add_ge(xi.clone(), lo, &format!("{name}_in_lo[{i}]"));
        sink.add_le(xi.clone(), up, &format!("{name}_in_up[{i}]"));
        let z_lo = sink.add_binary(&format!("{name}_face_lo[{i}]"));
        let z_up = sink.add_binary(&format!("{name}_face_up[{i}]"));
        // x_i <= lo + width (1 - z_lo)
        let mut e = xi.clone();
        e.add_term(z_lo, width);
        sink.add_le(e, up, &format!("{name}_pin_lo[{i}]"));
        // x_i >= lo + width z_up
        let mut e = xi.clone();
        e.add_term(z_up, -width);
        sink.add_ge(e, lo, &format!("{name}_pin_up[{i}]"));
        sum.add_term(z_lo, 1.0).add_term(z_up, 1.0);
        faces.push(z_lo);
        faces.push(z_up);
    }
    sink.add_eq(sum, 1.0, &format!("{name}_one_face"));
    Ok(faces)
}

/// Variables of a box-escape encoding.
#[derive(Debug, Clone)]
pub struct BoxEscape<V> {
    /// Face binaries in the order `[lo_0, up_0, lo_1, up_1, ..]`.
    pub faces: Vec<V>,
    /// Per-face copies of the state; only the active face's copy is nonzero.
    pub copies: Vec<Vec<V>>,
}

/// Constrain `x ∈ outer` to lie outside the interior of `inner`.
///
/// Disjunctive hull formulation: one binary `ζ_f` per face with `Σζ = 1` and
/// a copy `t_f` of the state with `outer.lo·ζ_f <= t_f <= outer.up·ζ_f`,
/// `x = Σ_f t_f`, and the face condition `t_f[i] <= inner.lo_i·ζ_f` (or
/// `>= inner.up_i·ζ_f`) on the copy.
pub fn add_box_escape<S: ConstraintSink>(
    sink: &mut S,
    x: &[LinExpr<S::Var>],
    outer: &BoxDomain,
    inner: &BoxDomain,
    name: &str,
) -> Result<BoxEscape<S::Var>> {
    outer.check_dim("escaping state", x.len())?;
    inner.check_dim("escaped box", x.len())?;
    if !outer.is_finite() || !inner.is_finite() {
        return Err(NlyapError::InvalidDomain(format!(
            "{name}: box escape needs finite boxes"
        )));
    }
    let dim = x.len();
    let mut faces = Vec::with_capacity(2 * dim);
    let mut copies = Vec::with_capacity(2 * dim);
    let mut sum = LinExpr::new();
    for f in 0..2 * dim {
        let axis = f / 2;
        let zeta = sink.add_binary(&format!("{name}_face[{f}]"));
        let t: Vec<S::Var> = (0..dim)
            .map(|j| {
                sink.add_continuous(
                    &format!("{name}_copy[{f}][{j}]"),
                    outer.lo()[j].min(0.0),
                    outer.up()[j].max(0.0),
                )
            })
            .collect();
        for j in 0..dim {
            let mut e = LinExpr::var(t[j]);
            e.add_term(zeta, -outer.up()[j]);
            sink.add_le(e, 0.0, &format!("{name}_copy_up[{f}][{j}]"));
            let mut e = LinExpr::var(t[j]);
            e.add_term(zeta, -outer.lo()[j]);
            sink.add_ge(e, 0.0, &format!("{name}_copy_lo[{f}][{j}]"));
        }
        let mut e = LinExpr::var(t[axis]);
        if f % 2 == 0 {
            e.add_term(zeta, -inner.lo()[axis]);
            sink.add_le(e, 0.0, &format!("{name}_below[{f}]"));
        } else {
            e.add_term(zeta, -inner.up()[axis]);
            sink.add_ge(e, 0.0, &format!("{name}_above[{f}]"));
        }
        sum.add_term(zeta, 1.0);
        faces.push(zeta);
        copies.push(t);
    }
    sink.add_eq(sum, 1.0, &format!("{name}_one_face"));
    for (j, xj) in x.iter().enumerate() {
        let mut e = xj.clone();
        for t in &copies {
            e.add_term(t[j], -1.0);
        }
        sink.add_eq(e, 0.0, &format!("{name}_sum_copies[{j}]"));
    }
    Ok(BoxEscape { faces, copies })
}

/// Result of encoding `‖y‖∞`.
#[derive(Debug, Clone)]
pub struct InfinityNorm<V> {
    pub output: LinExpr<V>,
    /// `|y_k|` for every entry.
    pub abs: Vec<PiecewiseUnit<V>>,
    /// One-hot selector of the entry attaining the maximum; empty for a single entry.
    pub argmax: Vec<V>,
    pub bound: Bound,
}

/// Encode `t = max_k |y_k|`.
///
/// ```text
/// t >= |y_k|,   t <= |y_k| + (t_up − |y_k|_lo)(1 − δ_k),   Σ δ = 1
/// ```
pub fn add_infinity_norm<S: ConstraintSink>(
    sink: &mut S,
    y: &[LinExpr<S::Var>],
    bounds: &[Bound],
    name: &str,
) -> Result<InfinityNorm<S::Var>> {
    if y.is_empty() || y.len() != bounds.len() {
        return Err(NlyapError::InvalidConfig(format!(
            "{name}: infinity norm needs one bound per entry, got {} entries and {} bounds",
            y.len(),
            bounds.len()
        )));
    }
    let abs = y
        .iter()
        .zip(bounds)
        .enumerate()
        .map(|(k, (yk, &bk))| add_absolute_value(sink, yk, bk, &format!("{name}_abs[{k}]")))
        .collect::<Result<Vec<_>>>()?;
    if abs.len() == 1 {
        let unit = &abs[0];
        return Ok(InfinityNorm {
            output: unit.output.clone(),
            bound: unit.bound,
            argmax: Vec::new(),
            abs,
        });
    }
    let bound = Bound::new(
        abs.iter().map(|a| a.bound.lower).fold(f64::NEG_INFINITY, f64::max),
        abs.iter().map(|a| a.bound.upper).fold(f64::NEG_INFINITY, f64::max),
    );
    let t = sink.add_continuous(&format!("{name}_max"), bound.lower, bound.upper);
    let mut argmax = Vec::with_capacity(abs.len());
    let mut sum = LinExpr::new();
    for (k, unit) in abs.iter().enumerate() {
        sink.add_ge(LinExpr::var(t) - &unit.output, 0.0, &format!("{name}_ge[{k}]"));
        let delta = sink.add_binary(&format!("{name}_argmax[{k}]"));
        let big_m = bound.upper - unit.bound.lower;
        // t − |y_k| + M δ_k <= M
        let mut e = LinExpr::var(t) - &unit.output;
        e.add_term(delta, big_m);
        sink.add_le(e, big_m, &format!("{name}_le[{k}]"));
        sum.add_term(delta, 1.0);
        argmax.push(delta);
    }
    sink.add_eq(sum, 1.0, &format!("{name}_one_argmax"));
    Ok(InfinityNorm {
        output: LinExpr::var(t),
        abs,
        argmax,
        bound,
    })
}
