//! Discrete-time dynamics collaborators.
//!
//! A [`DiscreteTimeSystem`] maps x[n] to x[n+1] (autonomous or closed loop);
//! a [`ControlledDiscreteTimeSystem`] takes the input explicitly. Both expose
//! an exact MILP encoding of one step plus the local first-order data the
//! certificate gradients need: the Jacobian of the active affine piece and
//! the gradients of the kink constraints active at a point.

use ndarray::{Array1, Array2, ArrayView1};
use nlyap_core::{Bound, BoxDomain, Result};
use nlyap_milp::{LinExpr, MilpBuilder, MilpSolver, VarId, VarType};

/// Variables and bounds created by `add_dynamics_constraint`.
#[derive(Debug, Clone, Default)]
pub struct DynamicsVars {
    pub slack: Vec<VarId>,
    pub binary: Vec<VarId>,
    /// Interval bounds of x[n+1] valid over the system domain.
    pub x_next_bounds: Vec<Bound>,
}

impl DynamicsVars {
    pub fn extend(&mut self, other: DynamicsVars) {
        self.slack.extend(other.slack);
        self.binary.extend(other.binary);
    }
}

/// x[n+1] = f(x[n]).
pub trait DiscreteTimeSystem: Send + Sync {
    fn x_dim(&self) -> usize;

    /// Domain over which the encoding is exact.
    fn x_domain(&self) -> &BoxDomain;

    fn step_forward(&self, x: ArrayView1<f64>) -> Result<Array1<f64>>;

    /// Every admissible next state; a singleton unless the dynamics are ambiguous at `x`.
    fn possible_dx(&self, x: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        Ok(vec![self.step_forward(x)?])
    }

    /// One row per state.
    fn step_forward_batch(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((x.nrows(), self.x_dim()));
        for (i, row) in x.rows().into_iter().enumerate() {
            out.row_mut(i).assign(&self.step_forward(row)?);
        }
        Ok(out)
    }

    /// Constrain `x_next = f(x)` for `x` in [`Self::x_domain`].
    fn add_dynamics_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<DynamicsVars>;

    /// ∂f/∂x of the affine piece realized at `x`.
    fn jacobian(&self, x: ArrayView1<f64>) -> Result<Array2<f64>>;

    /// ∇ₓ of every kink constraint of f active within `tol` at `x`.
    fn active_constraint_gradients(&self, x: ArrayView1<f64>, tol: f64) -> Result<Vec<Array1<f64>>>;
}

/// x[n+1] = f(x[n], u[n]).
pub trait ControlledDiscreteTimeSystem: Send + Sync {
    fn x_dim(&self) -> usize;

    fn u_dim(&self) -> usize;

    fn x_domain(&self) -> &BoxDomain;

    fn u_domain(&self) -> &BoxDomain;

    fn step_forward(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Array1<f64>>;

    fn possible_dx(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        Ok(vec![self.step_forward(x, u)?])
    }

    /// Constrain `x_next = f(x, u)` for `(x, u)` in the domain product.
    #[allow(clippy::too_many_arguments)]
    fn add_dynamics_constraint(
        &self,
        milp: &mut MilpBuilder,
        x: &[LinExpr<VarId>],
        u: &[LinExpr<VarId>],
        x_next: &[VarId],
        solver: &dyn MilpSolver,
        binary_type: VarType,
        name: &str,
    ) -> Result<DynamicsVars>;

    /// (∂f/∂x, ∂f/∂u) of the affine piece realized at `(x, u)`.
    fn jacobian(&self, x: ArrayView1<f64>, u: ArrayView1<f64>) -> Result<(Array2<f64>, Array2<f64>)>;

    /// (∇ₓ, ∇ᵤ) of every kink constraint active within `tol` at `(x, u)`.
    fn active_constraint_gradients(
        &self,
        x: ArrayView1<f64>,
        u: ArrayView1<f64>,
        tol: f64,
    ) -> Result<Vec<(Array1<f64>, Array1<f64>)>>;
}
