//! nlyap CLI
//!
//! Verifies a ReLU Lyapunov candidate for an autonomous piecewise-affine
//! system described in a JSON problem file.
//!
//! # Commands
//!
//! - `nlyap positivity <problem.json>` - Worst violation of `V(x) >= ε‖R(x − x*)‖₁`
//! - `nlyap derivative <problem.json>` - Worst violation of the decrease condition
//! - `nlyap roa <problem.json>` - Certified sublevel inside the problem's `roa_box`

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ndarray::{Array1, Array2};
use nlyap_certificate::{
    ConvergenceEps, LyapunovDescriptor, LyapunovDiscreteTime, LyapunovMilp, MilpOptions,
};
use nlyap_core::{BoxDomain, NetworkDescriptor};
use nlyap_milp::{MicroLpSolver, MilpSolver, SolveStatus, SolverConfig, VarType};
use nlyap_system::AutonomousHybridLinearSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlyap")]
#[command(about = "Exact MILP verification of neural Lyapunov functions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Maximize the positivity violation over the state domain
    Positivity {
        /// Problem file
        file: PathBuf,
        /// Solve the LP relaxation instead of the MILP
        #[arg(long)]
        relax: bool,
    },
    /// Maximize the decrease violation over the state domain
    Derivative {
        /// Problem file
        file: PathBuf,
        /// Solve the LP relaxation instead of the MILP
        #[arg(long)]
        relax: bool,
    },
    /// Compute the largest certified sublevel of V inside `roa_box`
    Roa {
        /// Problem file
        file: PathBuf,
    },
}

/// One affine mode `x⁺ = A x + g` active on `{x : P x <= q}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModeSpec {
    a: Vec<Vec<f64>>,
    g: Vec<f64>,
    p: Vec<Vec<f64>>,
    q: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BoxSpec {
    lo: Vec<f64>,
    up: Vec<f64>,
}

impl BoxSpec {
    fn to_domain(&self) -> anyhow::Result<BoxDomain> {
        Ok(BoxDomain::from_slices(&self.lo, &self.up)?)
    }
}

/// Contents of a problem file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProblemFile {
    x_domain: BoxSpec,
    modes: Vec<ModeSpec>,
    network: NetworkDescriptor,
    lambda: f64,
    /// Defaults to the identity.
    #[serde(default)]
    r: Option<Vec<Vec<f64>>>,
    epsilon: f64,
    x_equilibrium: Vec<f64>,
    #[serde(default)]
    eps_type: ConvergenceEps,
    #[serde(default)]
    roa_box: Option<BoxSpec>,
}

fn matrix(rows: &[Vec<f64>], what: &str) -> anyhow::Result<Array2<f64>> {
    let ncols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|row| row.len() != ncols) {
        bail!("{what} has rows of different lengths");
    }
    let data = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), ncols), data).with_context(|| format!("{what} is not a matrix"))
}

impl ProblemFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn system(&self) -> anyhow::Result<AutonomousHybridLinearSystem> {
        let mut system = AutonomousHybridLinearSystem::new(self.x_domain.to_domain()?)?;
        for (i, mode) in self.modes.iter().enumerate() {
            system
                .add_mode(
                    matrix(&mode.a, "A")?,
                    Array1::from(mode.g.clone()),
                    matrix(&mode.p, "P")?,
                    Array1::from(mode.q.clone()),
                )
                .with_context(|| format!("mode {i}"))?;
        }
        Ok(system)
    }

    fn lyapunov(&self) -> anyhow::Result<LyapunovDiscreteTime<AutonomousHybridLinearSystem>> {
        let network = self.network.to_network().context("building the Lyapunov network")?;
        Ok(LyapunovDiscreteTime::new(self.system()?, network)?)
    }

    fn descriptor(&self) -> anyhow::Result<LyapunovDescriptor> {
        let x_equilibrium = Array1::from(self.x_equilibrium.clone());
        let desc = match &self.r {
            Some(r) => LyapunovDescriptor::new(x_equilibrium, self.lambda, matrix(r, "R")?)?,
            None => LyapunovDescriptor::identity(x_equilibrium, self.lambda)?,
        };
        Ok(desc)
    }
}

fn solver() -> MicroLpSolver {
    MicroLpSolver::new(SolverConfig::default())
}

fn binary_type(relax: bool) -> VarType {
    if relax {
        VarType::Continuous
    } else {
        VarType::Binary
    }
}

fn report(problem: &LyapunovMilp, what: &str, solver: &dyn MilpSolver) -> anyhow::Result<()> {
    let solution = problem.solve(solver)?;
    match solution.status {
        SolveStatus::Infeasible => {
            println!("{what}: MILP infeasible, the condition holds vacuously");
        }
        _ => {
            let optimum = solution.optimal_objective(what)?;
            let x = solution.values_of(&problem.x);
            let verdict = if optimum <= 0.0 { "certified" } else { "violated" };
            println!("{what}: {verdict}");
            println!("  max violation: {optimum:.6e}");
            println!("  at x = {x}");
            if !problem.x_next.is_empty() {
                println!("  x_next = {}", solution.values_of(&problem.x_next));
            }
        }
    }
    Ok(())
}

fn positivity(file: &Path, relax: bool) -> anyhow::Result<()> {
    let problem = ProblemFile::load(file)?;
    let lyapunov = problem.lyapunov()?;
    let desc = problem.descriptor()?;
    let options = MilpOptions {
        binary_type: binary_type(relax),
        ..Default::default()
    };
    let solver = solver();
    let milp = lyapunov.lyapunov_positivity_as_milp(&desc, problem.epsilon, &options, &solver)?;
    info!(vars = milp.milp.num_vars(), binaries = milp.milp.num_binaries(), "solving positivity");
    report(&milp, "positivity", &solver)
}

fn derivative(file: &Path, relax: bool) -> anyhow::Result<()> {
    let problem = ProblemFile::load(file)?;
    let lyapunov = problem.lyapunov()?;
    let desc = problem.descriptor()?;
    let options = MilpOptions {
        binary_type: binary_type(relax),
        ..Default::default()
    };
    let solver = solver();
    let milp = lyapunov.lyapunov_derivative_as_milp(&desc, problem.epsilon, problem.eps_type, &options, &solver)?;
    info!(vars = milp.milp.num_vars(), binaries = milp.milp.num_binaries(), "solving derivative");
    report(&milp, "derivative", &solver)
}

fn roa(file: &Path) -> anyhow::Result<()> {
    let problem = ProblemFile::load(file)?;
    let Some(roa_box) = &problem.roa_box else {
        bail!("{} has no roa_box", file.display());
    };
    let lyapunov = problem.lyapunov()?;
    let desc = problem.descriptor()?;
    let estimate =
        lyapunov.compute_region_of_attraction(&desc, &roa_box.to_domain()?, VarType::Binary, &solver())?;
    let show = |v: Option<f64>| v.map_or_else(|| "infeasible".to_string(), |v| format!("{v:.6e}"));
    println!("region of attraction: {{x : V(x) < {:.6e}}}", estimate.rho);
    println!("  exit optimum:  {}", show(estimate.exit));
    println!("  entry optimum: {}", show(estimate.entry));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Positivity { file, relax } => positivity(&file, relax)?,
        Commands::Derivative { file, relax } => derivative(&file, relax)?,
        Commands::Roa { file } => roa(&file)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACTION: &str = r#"{
        "x_domain": { "lo": [-1.0], "up": [1.0] },
        "modes": [
            { "a": [[0.5]], "g": [0.0], "p": [[1.0], [-1.0]], "q": [1.0, 1.0] }
        ],
        "network": {
            "widths": [1, 1],
            "negative_slope": 0.0,
            "bias": false,
            "layers": [{ "weight": [[0.0]], "bias": null }]
        },
        "lambda": 1.0,
        "epsilon": 0.1,
        "x_equilibrium": [0.0]
    }"#;

    #[test]
    fn test_problem_file_parses_with_defaults() {
        let problem: ProblemFile = serde_json::from_str(CONTRACTION).unwrap();
        assert_eq!(problem.eps_type, ConvergenceEps::ExpLower);
        assert!(problem.r.is_none());
        assert!(problem.roa_box.is_none());
        assert_eq!(problem.system().unwrap().num_modes(), 1);
        assert_eq!(problem.descriptor().unwrap().r_shape(), (1, 1));
    }

    #[test]
    fn test_contraction_is_certified() {
        // V = |x| and x⁺ = x/2.
        let problem: ProblemFile = serde_json::from_str(CONTRACTION).unwrap();
        let lyapunov = problem.lyapunov().unwrap();
        let desc = problem.descriptor().unwrap();
        let solver = MicroLpSolver::new(SolverConfig::strict());
        let milp = lyapunov
            .lyapunov_derivative_as_milp(&desc, 0.1, ConvergenceEps::ExpLower, &MilpOptions::default(), &solver)
            .unwrap();
        let optimum = milp.solve(&solver).unwrap().optimal_objective("derivative").unwrap();
        assert!(optimum <= 1e-6);
    }

    #[test]
    fn test_ragged_matrix_is_rejected() {
        assert!(matrix(&[vec![1.0, 2.0], vec![3.0]], "A").is_err());
    }
}
