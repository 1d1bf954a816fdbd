//! Mixed-integer constraint bundles.
//!
//! A bundle describes `output = f(input)` exactly through continuous slack
//! variables and binary variables:
//!
//! ```text
//! Ain_input·input + Ain_slack·slack + Ain_binary·binary <= rhs_in
//! Aeq_input·input + Aeq_slack·slack + Aeq_binary·binary == rhs_eq
//! output = Aout_input·input + Aout_slack·slack + Aout_binary·binary + Cout
//! ```
//!
//! together with bounds on the input, slack, binary and output blocks. It is
//! the artifact handed from the network and system encoders to the
//! certificate engine, which materializes it into a [`MilpBuilder`] with
//! [`add_mixed_integer_linear_constraints`].

use crate::expr::{LinExpr, VarId};
use crate::model::{ConstraintSink, MilpBuilder, Sense, VarType};
use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{ensure_dim, NlyapError, Result};
use std::fmt;

/// A column of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockVar {
    Input(usize),
    Slack(usize),
    Binary(usize),
}

impl BlockVar {
    /// Column index inside the variable's own block.
    pub fn column(self) -> usize {
        match self {
            BlockVar::Input(i) | BlockVar::Slack(i) | BlockVar::Binary(i) => i,
        }
    }
}

impl fmt::Display for BlockVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockVar::Input(i) => write!(f, "input[{i}]"),
            BlockVar::Slack(i) => write!(f, "slack[{i}]"),
            BlockVar::Binary(i) => write!(f, "binary[{i}]"),
        }
    }
}

/// Expression over bundle columns.
pub type BlockExpr = LinExpr<BlockVar>;

/// The dense constraint bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixedIntegerConstraints {
    pub num_input: usize,
    pub num_slack: usize,
    pub num_binary: usize,

    pub ain_input: Option<Array2<f64>>,
    pub ain_slack: Option<Array2<f64>>,
    pub ain_binary: Option<Array2<f64>>,
    pub rhs_in: Option<Array1<f64>>,

    pub aeq_input: Option<Array2<f64>>,
    pub aeq_slack: Option<Array2<f64>>,
    pub aeq_binary: Option<Array2<f64>>,
    pub rhs_eq: Option<Array1<f64>>,

    pub aout_input: Option<Array2<f64>>,
    pub aout_slack: Option<Array2<f64>>,
    pub aout_binary: Option<Array2<f64>>,
    pub cout: Option<Array1<f64>>,

    pub input_lo: Option<Array1<f64>>,
    pub input_up: Option<Array1<f64>>,
    pub slack_lo: Option<Array1<f64>>,
    pub slack_up: Option<Array1<f64>>,
    pub binary_lo: Option<Array1<f64>>,
    pub binary_up: Option<Array1<f64>>,
    pub output_lo: Option<Array1<f64>>,
    pub output_up: Option<Array1<f64>>,
}

impl MixedIntegerConstraints {
    pub fn num_output(&self) -> usize {
        [&self.aout_input, &self.aout_slack, &self.aout_binary]
            .iter()
            .find_map(|m| m.as_ref().map(|m| m.nrows()))
            .or_else(|| self.cout.as_ref().map(|c| c.len()))
            .unwrap_or(0)
    }

    /// Add a constant to every output, moving the declared output bounds with it.
    pub fn shift_output(&mut self, offset: ArrayView1<f64>) -> Result<()> {
        ensure_dim("output offset", self.num_output(), offset.len())?;
        let shifted = |v: &Option<Array1<f64>>| Some(v.clone().unwrap_or_else(|| Array1::zeros(offset.len())) + &offset);
        self.cout = shifted(&self.cout);
        if self.output_lo.is_some() {
            self.output_lo = shifted(&self.output_lo);
        }
        if self.output_up.is_some() {
            self.output_up = shifted(&self.output_up);
        }
        Ok(())
    }

    /// Number of inequality rows.
    pub fn num_ineq(&self) -> usize {
        self.rhs_in.as_ref().map_or(0, |r| r.len())
    }

    pub fn num_eq(&self) -> usize {
        self.rhs_eq.as_ref().map_or(0, |r| r.len())
    }

    /// Output for a given assignment of the three blocks.
    pub fn evaluate_output(
        &self,
        input: &Array1<f64>,
        slack: &Array1<f64>,
        binary: &Array1<f64>,
    ) -> Array1<f64> {
        let mut out = self
            .cout
            .clone()
            .unwrap_or_else(|| Array1::zeros(self.num_output()));
        if let Some(a) = &self.aout_input {
            out += &a.dot(input);
        }
        if let Some(a) = &self.aout_slack {
            out += &a.dot(slack);
        }
        if let Some(a) = &self.aout_binary {
            out += &a.dot(binary);
        }
        out
    }

    /// True when the assignment satisfies every row and every declared bound within `tol`.
    pub fn is_feasible(
        &self,
        input: &Array1<f64>,
        slack: &Array1<f64>,
        binary: &Array1<f64>,
        tol: f64,
    ) -> bool {
        let lhs = |a: &Option<Array2<f64>>, b: &Option<Array2<f64>>, c: &Option<Array2<f64>>, n: usize| {
            let mut out = Array1::<f64>::zeros(n);
            if let Some(a) = a {
                out += &a.dot(input);
            }
            if let Some(b) = b {
                out += &b.dot(slack);
            }
            if let Some(c) = c {
                out += &c.dot(binary);
            }
            out
        };
        let ineq_ok = self.rhs_in.as_ref().map_or(true, |rhs| {
            let l = lhs(&self.ain_input, &self.ain_slack, &self.ain_binary, rhs.len());
            l.iter().zip(rhs.iter()).all(|(a, b)| *a <= b + tol)
        });
        let eq_ok = self.rhs_eq.as_ref().map_or(true, |rhs| {
            let l = lhs(&self.aeq_input, &self.aeq_slack, &self.aeq_binary, rhs.len());
            l.iter().zip(rhs.iter()).all(|(a, b)| (a - b).abs() <= tol)
        });
        let within = |x: &Array1<f64>, lo: &Option<Array1<f64>>, up: &Option<Array1<f64>>| {
            let lo_ok = lo
                .as_ref()
                .map_or(true, |lo| x.iter().zip(lo.iter()).all(|(v, l)| *v >= l - tol));
            let up_ok = up
                .as_ref()
                .map_or(true, |up| x.iter().zip(up.iter()).all(|(v, u)| *v <= u + tol));
            lo_ok && up_ok
        };
        ineq_ok
            && eq_ok
            && within(input, &self.input_lo, &self.input_up)
            && within(slack, &self.slack_lo, &self.slack_up)
            && within(binary, &self.binary_lo, &self.binary_up)
    }

    /// Output row `i` as an expression over bundle columns.
    pub fn output_expr(&self, i: usize) -> BlockExpr {
        let mut e = BlockExpr::constant(self.cout.as_ref().map_or(0.0, |c| c[i]));
        let blocks: [(&Option<Array2<f64>>, fn(usize) -> BlockVar); 3] = [
            (&self.aout_input, BlockVar::Input),
            (&self.aout_slack, BlockVar::Slack),
            (&self.aout_binary, BlockVar::Binary),
        ];
        for (m, ctor) in blocks {
            if let Some(m) = m {
                for (j, &c) in m.row(i).iter().enumerate() {
                    e.add_term(ctor(j), c);
                }
            }
        }
        e
    }
}

/// Sparse accumulator that produces a [`MixedIntegerConstraints`].
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    num_input: usize,
    slack_lo: Vec<f64>,
    slack_up: Vec<f64>,
    slack_names: Vec<String>,
    binary_names: Vec<String>,
    ineq: Vec<(BlockExpr, f64)>,
    eq: Vec<(BlockExpr, f64)>,
}

impl BundleBuilder {
    pub fn new(num_input: usize) -> Self {
        Self {
            num_input,
            slack_lo: Vec::new(),
            slack_up: Vec::new(),
            slack_names: Vec::new(),
            binary_names: Vec::new(),
            ineq: Vec::new(),
            eq: Vec::new(),
        }
    }

    /// Input columns as expressions.
    pub fn inputs(&self) -> Vec<BlockExpr> {
        (0..self.num_input)
            .map(|i| BlockExpr::var(BlockVar::Input(i)))
            .collect()
    }

    pub fn num_slack(&self) -> usize {
        self.slack_lo.len()
    }

    pub fn num_binary(&self) -> usize {
        self.binary_names.len()
    }

    pub fn slack_names(&self) -> &[String] {
        &self.slack_names
    }

    pub fn binary_names(&self) -> &[String] {
        &self.binary_names
    }

    /// Assemble the dense bundle with `outputs` as the declared output map.
    pub fn finish(
        self,
        outputs: &[BlockExpr],
        input_bounds: Option<(Array1<f64>, Array1<f64>)>,
        output_bounds: Option<(Array1<f64>, Array1<f64>)>,
    ) -> Result<MixedIntegerConstraints> {
        if let Some((lo, up)) = &input_bounds {
            ensure_dim("bundle input lower bound", self.num_input, lo.len())?;
            ensure_dim("bundle input upper bound", self.num_input, up.len())?;
        }
        if let Some((lo, up)) = &output_bounds {
            ensure_dim("bundle output lower bound", outputs.len(), lo.len())?;
            ensure_dim("bundle output upper bound", outputs.len(), up.len())?;
        }
        let dims = (self.num_input, self.num_slack(), self.num_binary());
        let (ain_input, ain_slack, ain_binary, rhs_in) = dense_rows(&self.ineq, dims)?;
        let (aeq_input, aeq_slack, aeq_binary, rhs_eq) = dense_rows(&self.eq, dims)?;
        let out_rows: Vec<(BlockExpr, f64)> = outputs
            .iter()
            .map(|e| (e.clone(), -e.constant_term()))
            .collect();
        let (aout_input, aout_slack, aout_binary, neg_cout) = dense_rows(&out_rows, dims)?;
        let (input_lo, input_up) = input_bounds.unzip();
        let (output_lo, output_up) = output_bounds.unzip();
        let num_binary = self.num_binary();
        Ok(MixedIntegerConstraints {
            num_input: self.num_input,
            num_slack: self.slack_lo.len(),
            num_binary,
            ain_input,
            ain_slack,
            ain_binary,
            rhs_in,
            aeq_input,
            aeq_slack,
            aeq_binary,
            rhs_eq,
            aout_input,
            aout_slack,
            aout_binary,
            cout: neg_cout.map(|c| -c),
            input_lo,
            input_up,
            slack_lo: (!self.slack_lo.is_empty()).then(|| Array1::from(self.slack_lo)),
            slack_up: (!self.slack_up.is_empty()).then(|| Array1::from(self.slack_up)),
            binary_lo: (num_binary > 0).then(|| Array1::zeros(num_binary)),
            binary_up: (num_binary > 0).then(|| Array1::ones(num_binary)),
            output_lo,
            output_up,
        })
    }
}

impl ConstraintSink for BundleBuilder {
    type Var = BlockVar;

    fn add_continuous(&mut self, name: &str, lb: f64, ub: f64) -> BlockVar {
        self.slack_lo.push(lb);
        self.slack_up.push(ub);
        self.slack_names.push(name.to_string());
        BlockVar::Slack(self.slack_lo.len() - 1)
    }

    fn add_binary(&mut self, name: &str) -> BlockVar {
        self.binary_names.push(name.to_string());
        BlockVar::Binary(self.binary_names.len() - 1)
    }

    fn add_linear(&mut self, expr: BlockExpr, sense: Sense, rhs: f64, _name: &str) {
        let rhs = rhs - expr.constant_term();
        match sense {
            Sense::Le => self.ineq.push((expr, rhs)),
            Sense::Ge => self.ineq.push((-expr, -rhs)),
            Sense::Eq => self.eq.push((expr, rhs)),
        }
    }
}

type DenseRows = (
    Option<Array2<f64>>,
    Option<Array2<f64>>,
    Option<Array2<f64>>,
    Option<Array1<f64>>,
);

/// Split rows into the three dense blocks; all-zero blocks become `None`.
fn dense_rows(rows: &[(BlockExpr, f64)], dims: (usize, usize, usize)) -> Result<DenseRows> {
    if rows.is_empty() {
        return Ok((None, None, None, None));
    }
    let n = rows.len();
    let mut a_in = Array2::zeros((n, dims.0));
    let mut a_slack = Array2::zeros((n, dims.1));
    let mut a_bin = Array2::zeros((n, dims.2));
    let mut rhs = Array1::zeros(n);
    for (r, (expr, b)) in rows.iter().enumerate() {
        for &(v, c) in expr.terms() {
            let (mat, j, len) = match v {
                BlockVar::Input(j) => (&mut a_in, j, dims.0),
                BlockVar::Slack(j) => (&mut a_slack, j, dims.1),
                BlockVar::Binary(j) => (&mut a_bin, j, dims.2),
            };
            if j >= len {
                return Err(NlyapError::InvalidConfig(format!(
                    "bundle row {r} references {v} beyond the declared block size {len}"
                )));
            }
            mat[[r, j]] += c;
        }
        rhs[r] = *b;
    }
    let nonzero = |m: Array2<f64>| (m.iter().any(|v| *v != 0.0)).then_some(m);
    Ok((nonzero(a_in), nonzero(a_slack), nonzero(a_bin), Some(rhs)))
}

/// Variables created when a bundle is added to a model.
#[derive(Debug, Clone)]
pub struct MixedIntegerVars {
    pub slack: Vec<VarId>,
    pub binary: Vec<VarId>,
    /// The bundle output as expressions over model variables.
    pub output: Vec<LinExpr<VarId>>,
}

/// Materialize `bundle` in `milp`, with `input` as the bundle's input columns.
///
/// When `output` is given, equality constraints tie those variables to the
/// bundle output. `binary_type` chooses between the exact program and its LP
/// relaxation.
pub fn add_mixed_integer_linear_constraints(
    milp: &mut MilpBuilder,
    bundle: &MixedIntegerConstraints,
    input: &[LinExpr<VarId>],
    output: Option<&[VarId]>,
    slack_name: &str,
    binary_name: &str,
    binary_type: VarType,
) -> Result<MixedIntegerVars> {
    ensure_dim("bundle input", bundle.num_input, input.len())?;
    let slack: Vec<VarId> = (0..bundle.num_slack)
        .map(|i| {
            let lb = bundle.slack_lo.as_ref().map_or(f64::NEG_INFINITY, |l| l[i]);
            let ub = bundle.slack_up.as_ref().map_or(f64::INFINITY, |u| u[i]);
            milp.add_var(format!("{slack_name}[{i}]"), lb, ub, VarType::Continuous)
        })
        .collect();
    let binary: Vec<VarId> = (0..bundle.num_binary)
        .map(|i| {
            let lb = bundle.binary_lo.as_ref().map_or(0.0, |l| l[i]);
            let ub = bundle.binary_up.as_ref().map_or(1.0, |u| u[i]);
            milp.add_var(format!("{binary_name}[{i}]"), lb, ub, binary_type)
        })
        .collect();

    let to_model = |e: &BlockExpr| -> LinExpr<VarId> {
        let mut out = LinExpr::constant(e.constant_term());
        for &(v, c) in e.terms() {
            match v {
                BlockVar::Input(j) => {
                    out.add_scaled(&input[j], c);
                }
                BlockVar::Slack(j) => {
                    out.add_term(slack[j], c);
                }
                BlockVar::Binary(j) => {
                    out.add_term(binary[j], c);
                }
            }
        }
        out
    };
    let row_expr = |a: &Option<Array2<f64>>, b: &Option<Array2<f64>>, c: &Option<Array2<f64>>, r: usize| {
        let mut e = BlockExpr::new();
        let blocks: [(&Option<Array2<f64>>, fn(usize) -> BlockVar); 3] =
            [(a, BlockVar::Input), (b, BlockVar::Slack), (c, BlockVar::Binary)];
        for (m, ctor) in blocks {
            if let Some(m) = m {
                for (j, &coef) in m.row(r).iter().enumerate() {
                    e.add_term(ctor(j), coef);
                }
            }
        }
        e
    };

    if let Some(rhs) = &bundle.rhs_in {
        for (r, &b) in rhs.iter().enumerate() {
            let e = row_expr(&bundle.ain_input, &bundle.ain_slack, &bundle.ain_binary, r);
            milp.add_constraint(to_model(&e), Sense::Le, b, format!("{slack_name}_ineq[{r}]"));
        }
    }
    if let Some(rhs) = &bundle.rhs_eq {
        for (r, &b) in rhs.iter().enumerate() {
            let e = row_expr(&bundle.aeq_input, &bundle.aeq_slack, &bundle.aeq_binary, r);
            milp.add_constraint(to_model(&e), Sense::Eq, b, format!("{slack_name}_eq[{r}]"));
        }
    }
    if let (Some(lo), Some(up)) = (&bundle.input_lo, &bundle.input_up) {
        for (i, e) in input.iter().enumerate() {
            if lo[i].is_finite() {
                milp.add_constraint(e.clone(), Sense::Ge, lo[i], format!("{slack_name}_input_lo[{i}]"));
            }
            if up[i].is_finite() {
                milp.add_constraint(e.clone(), Sense::Le, up[i], format!("{slack_name}_input_up[{i}]"));
            }
        }
    }

    let out_exprs: Vec<LinExpr<VarId>> = (0..bundle.num_output())
        .map(|i| to_model(&bundle.output_expr(i)))
        .collect();
    if let Some(out_vars) = output {
        ensure_dim("bundle output", out_exprs.len(), out_vars.len())?;
        for (i, (e, &v)) in out_exprs.iter().zip(out_vars).enumerate() {
            milp.add_constraint(
                LinExpr::var(v) - e,
                Sense::Eq,
                0.0,
                format!("{slack_name}_output[{i}]"),
            );
        }
    }
    Ok(MixedIntegerVars {
        slack,
        binary,
        output: out_exprs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_bundle_rows_and_output() {
        let mut b = BundleBuilder::new(1);
        let x = b.inputs();
        let s = b.add_continuous("s", 0.0, 5.0);
        let beta = b.add_binary("beta");
        // s >= x ; s <= 2 beta
        b.add_ge(BlockExpr::var(s) - &x[0], 0.0, "s_ge_x");
        b.add_le(BlockExpr::var(s) - &BlockExpr::term(beta, 2.0), 0.0, "s_le");
        let out = BlockExpr::var(s) + 1.0;
        let bundle = b.finish(&[out], None, None).unwrap();
        assert_eq!(bundle.num_ineq(), 2);
        assert_eq!(bundle.num_eq(), 0);
        assert_eq!(bundle.cout, Some(arr1(&[1.0])));
        assert!(bundle.aout_input.is_none());
        let y = bundle.evaluate_output(&arr1(&[0.5]), &arr1(&[1.5]), &arr1(&[1.0]));
        assert_eq!(y, arr1(&[2.5]));
        assert!(bundle.is_feasible(&arr1(&[0.5]), &arr1(&[1.5]), &arr1(&[1.0]), 1e-9));
        assert!(!bundle.is_feasible(&arr1(&[0.5]), &arr1(&[1.5]), &arr1(&[0.0]), 1e-9));
    }

    #[test]
    fn test_materialize_bundle() {
        let mut b = BundleBuilder::new(2);
        let x = b.inputs();
        let out = x[0].clone() * 2.0 - &x[1];
        let bundle = b.finish(&[out], None, None).unwrap();
        let mut milp = MilpBuilder::new();
        let xs = milp.add_free_vars("x", 2);
        let y = milp.add_free_vars("y", 1);
        let inputs: Vec<_> = xs.iter().map(|&v| LinExpr::var(v)).collect();
        let vars = add_mixed_integer_linear_constraints(
            &mut milp,
            &bundle,
            &inputs,
            Some(&y),
            "s",
            "b",
            VarType::Binary,
        )
        .unwrap();
        assert!(vars.slack.is_empty());
        assert_eq!(milp.num_constraints(), 1);
        assert_eq!(vars.output[0].evaluate(&[1.0, 3.0, 0.0]), -1.0);
    }
}
