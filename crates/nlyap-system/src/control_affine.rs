//! Control-affine systems ẋ = f(x) + G(x)u with box-bounded input.

use crate::relu_system::network_kink_gradients;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use nlyap_core::{ensure_dim, BoxDomain, NlyapError, ReluNetwork, Result};
use nlyap_milp::{
    add_mixed_integer_linear_constraints, BlockExpr, BundleBuilder, LinExpr, MilpBuilder, MilpSolver,
    MixedIntegerConstraints, ObjectiveSense, SolveStatus, VarId, VarType,
};
use nlyap_relu::{add_network, interval_affine, propagate_bounds, BoundMethod};
use tracing::debug;

/// Exact encodings of f(x) and of G(x) flattened row-major.
#[derive(Debug, Clone)]
pub struct ControlAffineConstraints {
    /// Input x, output f(x).
    pub mip_cnstr_f: MixedIntegerConstraints,
    /// Input x, output `G(x)` flattened row-major (`x_dim * u_dim` entries).
    pub mip_cnstr_g: MixedIntegerConstraints,
    pub f_lo: Array1<f64>,
    pub f_up: Array1<f64>,
    pub g_flat_lo: Array1<f64>,
    pub g_flat_up: Array1<f64>,
}

pub trait ControlAffineSystem: Send + Sync {
    fn x_dim(&self) -> usize;

    fn u_dim(&self) -> usize;

    fn x_domain(&self) -> &BoxDomain;

    fn u_domain(&self) -> &BoxDomain;

    fn f(&self, x: ArrayView1<f64>) -> Result<Array1<f64>>;

    /// `x_dim × u_dim`.
    fn g(&self, x: ArrayView1<f64>) -> Result<Array2<f64>>;

    /// ẋ with `u` clipped to the input box.
    fn dynamics(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("control input", self.u_dim(), u.len())?;
        let lo = self.u_domain().lo();
        let up = self.u_domain().up();
        let clipped: Array1<f64> = u
            .iter()
            .enumerate()
            .map(|(i, &v)| v.max(lo[i]).min(up[i]))
            .collect();
        Ok(self.f(x)? + self.g(x)?.dot(&clipped))
    }

    /// ∂f/∂x on the affine piece realized at `x`.
    fn f_jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>>;

    /// ∂G[:, j]/∂x for every input column `j`.
    fn g_jacobians(&self, x: ArrayView1<f64>) -> Result<Vec<Array2<f64>>>;

    /// ∇ₓ of every kink constraint of f or G active within `tol` at `x`.
    fn active_constraint_gradients(&self, _x: ArrayView1<f64>, _tol: f64) -> Result<Vec<Array1<f64>>> {
        Ok(Vec::new())
    }

    fn mixed_integer_constraints(&self, solver: &dyn MilpSolver) -> Result<ControlAffineConstraints>;
}

/// f(x) and the columns of G(x) inside a model.
#[derive(Debug, Clone)]
pub struct SystemConstraintVars {
    pub f: Vec<LinExpr<VarId>>,
    /// `g[j][i]` is `G(x)[i][j]`.
    pub g: Vec<Vec<LinExpr<VarId>>>,
    pub slack: Vec<VarId>,
    pub binary: Vec<VarId>,
    pub constraints: ControlAffineConstraints,
}

/// Add f(x) and G(x) for the model variables `x`, restricting `x` to the system domain.
pub fn add_system_constraint<S: ControlAffineSystem + ?Sized>(
    system: &S,
    milp: &mut MilpBuilder,
    x: &[VarId],
    solver: &dyn MilpSolver,
    binary_type: VarType,
) -> Result<SystemConstraintVars> {
    ensure_dim("system state", system.x_dim(), x.len())?;
    let domain = system.x_domain();
    for (i, &v) in x.iter().enumerate() {
        let info = milp.var(v);
        let (lb, ub) = (info.lb.max(domain.lo()[i]), info.ub.min(domain.up()[i]));
        milp.set_var_bounds(v, lb, ub);
    }
    let constraints = system.mixed_integer_constraints(solver)?;
    let x_exprs: Vec<LinExpr<VarId>> = x.iter().map(|&v| LinExpr::var(v)).collect();
    let f_vars = add_mixed_integer_linear_constraints(
        milp,
        &constraints.mip_cnstr_f,
        &x_exprs,
        None,
        "slack_f",
        "binary_f",
        binary_type,
    )?;
    let g_vars = add_mixed_integer_linear_constraints(
        milp,
        &constraints.mip_cnstr_g,
        &x_exprs,
        None,
        "slack_G",
        "binary_G",
        binary_type,
    )?;
    let u_dim = system.u_dim();
    let g = (0..u_dim)
        .map(|j| {
            (0..system.x_dim())
                .map(|i| g_vars.output[i * u_dim + j].clone())
                .collect()
        })
        .collect();
    let mut slack = f_vars.slack;
    slack.extend(g_vars.slack);
    let mut binary = f_vars.binary;
    binary.extend(g_vars.binary);
    Ok(SystemConstraintVars {
        f: f_vars.output,
        g,
        slack,
        binary,
        constraints,
    })
}

fn check_box_dims(x_domain: &BoxDomain, u_domain: &BoxDomain, x_dim: usize, u_dim: usize) -> Result<()> {
    x_domain.check_dim("state domain", x_dim)?;
    u_domain.check_dim("input domain", u_dim)?;
    if !x_domain.is_finite() {
        return Err(NlyapError::InvalidDomain(
            "control-affine systems need a finite state box".to_string(),
        ));
    }
    Ok(())
}

/// ẋ = Ax + Bu.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    a: Array2<f64>,
    b: Array2<f64>,
    x_domain: BoxDomain,
    u_domain: BoxDomain,
}

impl LinearSystem {
    pub fn new(a: Array2<f64>, b: Array2<f64>, x_domain: BoxDomain, u_domain: BoxDomain) -> Result<Self> {
        let x_dim = a.nrows();
        ensure_dim("A columns", x_dim, a.ncols())?;
        ensure_dim("B rows", x_dim, b.nrows())?;
        check_box_dims(&x_domain, &u_domain, x_dim, b.ncols())?;
        Ok(Self {
            a,
            b,
            x_domain,
            u_domain,
        })
    }

    pub fn a(&self) -> &Array2<f64> {
        &self.a
    }

    pub fn b(&self) -> &Array2<f64> {
        &self.b
    }

    /// Whether some admissible u gives `Ax + Bu = 0`.
    pub fn can_be_equilibrium_state(&self, x: ArrayView1<f64>, solver: &dyn MilpSolver) -> Result<bool> {
        ensure_dim("state", self.x_dim(), x.len())?;
        let ax = self.a.dot(&x);
        let mut milp = MilpBuilder::new();
        let u = milp.add_continuous_vars("u", self.u_domain.lo(), self.u_domain.up());
        for i in 0..self.x_dim() {
            let row = LinExpr::from_row(self.b.row(i), &u, ax[i]);
            milp.add_constraint(row, nlyap_milp::Sense::Eq, 0.0, format!("equilibrium[{i}]"));
        }
        milp.set_objective(LinExpr::new(), ObjectiveSense::Minimize);
        let sol = solver.solve(&milp)?;
        Ok(sol.status == SolveStatus::Optimal)
    }
}

impl ControlAffineSystem for LinearSystem {
    fn x_dim(&self) -> usize {
        self.a.nrows()
    }

    fn u_dim(&self) -> usize {
        self.b.ncols()
    }

    fn x_domain(&self) -> &BoxDomain {
        &self.x_domain
    }

    fn u_domain(&self) -> &BoxDomain {
        &self.u_domain
    }

    fn f(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("state", self.x_dim(), x.len())?;
        Ok(self.a.dot(&x))
    }

    fn g(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        ensure_dim("state", self.x_dim(), x.len())?;
        Ok(self.b.clone())
    }

    fn f_jacobian(&self, _x: ArrayView1<f64>) -> Result<Array2<f64>> {
        Ok(self.a.clone())
    }

    fn g_jacobians(&self, _x: ArrayView1<f64>) -> Result<Vec<Array2<f64>>> {
        Ok(vec![Array2::zeros((self.x_dim(), self.x_dim())); self.u_dim()])
    }

    fn mixed_integer_constraints(&self, _solver: &dyn MilpSolver) -> Result<ControlAffineConstraints> {
        let f_bounds = interval_affine(&self.a, None, &self.x_domain.bounds())?;
        let f_lo: Array1<f64> = f_bounds.iter().map(|b| b.lower).collect();
        let f_up: Array1<f64> = f_bounds.iter().map(|b| b.upper).collect();

        let bf = BundleBuilder::new(self.x_dim());
        let inputs = bf.inputs();
        let f_out: Vec<BlockExpr> = (0..self.x_dim())
            .map(|i| BlockExpr::combine(self.a.row(i), &inputs, 0.0))
            .collect();
        let input_bounds = Some((self.x_domain.lo().clone(), self.x_domain.up().clone()));
        let mip_cnstr_f = bf.finish(&f_out, input_bounds.clone(), Some((f_lo.clone(), f_up.clone())))?;

        let g_flat: Array1<f64> = self.b.iter().copied().collect();
        let g_out: Vec<BlockExpr> = g_flat.iter().map(|&v| BlockExpr::constant(v)).collect();
        let mip_cnstr_g = BundleBuilder::new(self.x_dim()).finish(
            &g_out,
            input_bounds,
            Some((g_flat.clone(), g_flat.clone())),
        )?;
        Ok(ControlAffineConstraints {
            mip_cnstr_f,
            mip_cnstr_g,
            f_lo,
            f_up,
            g_flat_lo: g_flat.clone(),
            g_flat_up: g_flat,
        })
    }
}

/// Second-order system with state x = (q, v):
///
/// ```text
/// q̇ = v
/// v̇ = a(x) + b(x)u
/// ```
///
/// where `a = ϕ_a` and `b = ϕ_b` reshaped to `nq × u_dim`. With an
/// equilibrium (x*, u*) the networks are shifted so that
/// `v̇ = ϕ_a(x) − ϕ_a(x*) + ϕ_b(x)u − ϕ_b(x*)u*`, which vanishes at (x*, u*).
#[derive(Debug, Clone)]
pub struct ReluSecondOrderControlAffineSystem {
    x_domain: BoxDomain,
    u_domain: BoxDomain,
    phi_a: ReluNetwork,
    phi_b: ReluNetwork,
    method: BoundMethod,
    nq: usize,
    /// Constant added to ϕ_a.
    a_offset: Array1<f64>,
}

impl ReluSecondOrderControlAffineSystem {
    pub fn new(
        x_domain: BoxDomain,
        u_domain: BoxDomain,
        phi_a: ReluNetwork,
        phi_b: ReluNetwork,
        method: BoundMethod,
    ) -> Result<Self> {
        let x_dim = x_domain.dim();
        if x_dim % 2 != 0 {
            return Err(NlyapError::InvalidConfig(format!(
                "second-order state dimension must be even, got {x_dim}"
            )));
        }
        let nq = x_dim / 2;
        let u_dim = u_domain.dim();
        check_box_dims(&x_domain, &u_domain, x_dim, u_dim)?;
        ensure_dim("ϕ_a input", x_dim, phi_a.in_dim())?;
        ensure_dim("ϕ_a output", nq, phi_a.out_dim())?;
        ensure_dim("ϕ_b input", x_dim, phi_b.in_dim())?;
        ensure_dim("ϕ_b output", nq * u_dim, phi_b.out_dim())?;
        Ok(Self {
            x_domain,
            u_domain,
            phi_a,
            phi_b,
            method,
            nq,
            a_offset: Array1::zeros(nq),
        })
    }

    /// Shift the dynamics so that (x*, u*) is an equilibrium.
    pub fn with_equilibrium(mut self, x_equilibrium: ArrayView1<f64>, u_equilibrium: ArrayView1<f64>) -> Result<Self> {
        ensure_dim("equilibrium control", self.u_domain.dim(), u_equilibrium.len())?;
        let a_star = self.phi_a.forward(x_equilibrium)?;
        let b_star = self.b_raw(x_equilibrium)?;
        self.a_offset = -(a_star + b_star.dot(&u_equilibrium));
        Ok(self)
    }

    pub fn nq(&self) -> usize {
        self.nq
    }

    pub fn method(&self) -> BoundMethod {
        self.method
    }

    pub fn set_method(&mut self, method: BoundMethod) {
        self.method = method;
    }

    fn b_raw(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        let flat = self.phi_b.forward(x)?;
        flat.into_shape((self.nq, self.u_domain.dim()))
            .map_err(|e| NlyapError::InvalidConfig(e.to_string()))
    }

    pub fn a(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        Ok(self.phi_a.forward(x)? + &self.a_offset)
    }

    /// `nq × u_dim`.
    pub fn b(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        self.b_raw(x)
    }
}

impl ControlAffineSystem for ReluSecondOrderControlAffineSystem {
    fn x_dim(&self) -> usize {
        self.x_domain.dim()
    }

    fn u_dim(&self) -> usize {
        self.u_domain.dim()
    }

    fn x_domain(&self) -> &BoxDomain {
        &self.x_domain
    }

    fn u_domain(&self) -> &BoxDomain {
        &self.u_domain
    }

    fn f(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        ensure_dim("state", self.x_dim(), x.len())?;
        let a = self.a(x)?;
        Ok(ndarray::concatenate![Axis(0), x.slice(s![self.nq..]), a])
    }

    fn g(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        ensure_dim("state", self.x_dim(), x.len())?;
        let mut g = Array2::zeros((self.x_dim(), self.u_dim()));
        g.slice_mut(s![self.nq.., ..]).assign(&self.b(x)?);
        Ok(g)
    }

    fn f_jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>> {
        let pattern = self.phi_a.activation_pattern(x)?;
        let mut jac = Array2::zeros((self.x_dim(), self.x_dim()));
        for i in 0..self.nq {
            jac[[i, self.nq + i]] = 1.0;
        }
        jac.slice_mut(s![self.nq.., ..])
            .assign(&self.phi_a.jacobian_with_pattern(&pattern));
        Ok(jac)
    }

    fn g_jacobians(&self, x: ArrayView1<f64>) -> Result<Vec<Array2<f64>>> {
        let pattern = self.phi_b.activation_pattern(x)?;
        let jb = self.phi_b.jacobian_with_pattern(&pattern);
        let u_dim = self.u_dim();
        Ok((0..u_dim)
            .map(|j| {
                let mut jac = Array2::zeros((self.x_dim(), self.x_dim()));
                for i in 0..self.nq {
                    jac.row_mut(self.nq + i).assign(&jb.row(i * u_dim + j));
                }
                jac
            })
            .collect())
    }

    fn active_constraint_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>> {
        let mut out = network_kink_gradients(&self.phi_a, x, tol)?;
        out.extend(network_kink_gradients(&self.phi_b, x, tol)?);
        Ok(out)
    }

    fn mixed_integer_constraints(&self, solver: &dyn MilpSolver) -> Result<ControlAffineConstraints> {
        let input_bounds = Some((self.x_domain.lo().clone(), self.x_domain.up().clone()));

        let bounds_a = propagate_bounds(&self.phi_a, &self.x_domain, self.method, solver)?;
        let mut bf = BundleBuilder::new(self.x_dim());
        let inputs = bf.inputs();
        let a = add_network(&mut bf, &self.phi_a, &inputs, &bounds_a, "phi_a")?;
        let mut f_out: Vec<BlockExpr> = inputs[self.nq..].to_vec();
        f_out.extend(a.output.into_iter().zip(self.a_offset.iter()).map(|(e, &c)| e + c));
        let f_lo = ndarray::concatenate![
            Axis(0),
            self.x_domain.lo().slice(s![self.nq..]),
            bounds_a.output_lo() + &self.a_offset
        ];
        let f_up = ndarray::concatenate![
            Axis(0),
            self.x_domain.up().slice(s![self.nq..]),
            bounds_a.output_up() + &self.a_offset
        ];
        let mip_cnstr_f = bf.finish(&f_out, input_bounds.clone(), Some((f_lo.clone(), f_up.clone())))?;

        let bounds_b = propagate_bounds(&self.phi_b, &self.x_domain, self.method, solver)?;
        let mut bg = BundleBuilder::new(self.x_dim());
        let inputs = bg.inputs();
        let b = add_network(&mut bg, &self.phi_b, &inputs, &bounds_b, "phi_b")?;
        let zeros = self.nq * self.u_dim();
        let mut g_out = vec![BlockExpr::new(); zeros];
        g_out.extend(b.output);
        let g_flat_lo = ndarray::concatenate![Axis(0), Array1::zeros(zeros), bounds_b.output_lo()];
        let g_flat_up = ndarray::concatenate![Axis(0), Array1::zeros(zeros), bounds_b.output_up()];
        let mip_cnstr_g = bg.finish(&g_out, input_bounds, Some((g_flat_lo.clone(), g_flat_up.clone())))?;
        debug!(
            f_binaries = mip_cnstr_f.num_binary,
            g_binaries = mip_cnstr_g.num_binary,
            "encoded second-order system"
        );
        Ok(ControlAffineConstraints {
            mip_cnstr_f,
            mip_cnstr_g,
            f_lo,
            f_up,
            g_flat_lo,
            g_flat_up,
        })
    }
}
