pub mod exec;

use crate::structure::{CalculatorSettings, CellFilter, Structure};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Self-consistent field did not converge: {0}")]
    NotConverged(String),
    #[error("Failed to spawn solver")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to communicate with solver")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize solver messages")]
    Protocol(#[from] serde_yaml::Error),
    #[error("Solver exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
}

/// One named relaxation stage: calculator to attach and the optimizer budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagePreset {
    pub name: String,
    pub calculator: CalculatorSettings,
    #[serde(default)]
    pub filter: Option<CellFilter>,
    /// force convergence threshold in eV/Å
    pub fmax: f64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    100
}

/// coarse pass followed by the accurate unit cell relaxation
pub static DEFAULT_STAGES: Lazy<Vec<StagePreset>> = Lazy::new(|| {
    vec![
        StagePreset {
            name: "quickRelaxation".to_owned(),
            calculator: CalculatorSettings {
                xc: "LDA".to_owned(),
                cutoff: None,
                kpts: [4, 4, 4],
                eigenstates: None,
            },
            filter: Some(CellFilter::Strain),
            fmax: 0.05,
            max_steps: default_max_steps(),
        },
        StagePreset {
            name: "ucRelaxation".to_owned(),
            calculator: CalculatorSettings {
                xc: "RPBE".to_owned(),
                cutoff: Some(500.0),
                kpts: [8, 8, 8],
                eigenstates: Some(1e-10),
            },
            filter: Some(CellFilter::UnitCell),
            fmax: 0.005,
            max_steps: default_max_steps(),
        },
    ]
});

/// What the optimizer reports back after a bounded run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaxReport {
    pub steps: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Converged,
    MaxSteps,
    NotConverged,
}

impl StageOutcome {
    /// `Err(NotConverged)` is a result, every other solver error is not.
    ///
    /// An optimizer that gives up before its step budget is used up did not converge either.
    pub fn classify(
        preset: &StagePreset,
        result: Result<RelaxReport, SolverError>,
    ) -> Result<Self, SolverError> {
        match result {
            Ok(report) if report.converged => Ok(Self::Converged),
            Ok(report) if report.steps >= preset.max_steps => Ok(Self::MaxSteps),
            Ok(_) => Ok(Self::NotConverged),
            Err(SolverError::NotConverged(_)) => Ok(Self::NotConverged),
            Err(error) => Err(error),
        }
    }
}

/// The physics engine plus geometry optimizer.
///
/// `relax` runs until forces drop below `preset.fmax` or `preset.max_steps` is used up,
/// updating `structure` in place. The calculator is already attached to `structure`.
pub trait Solver {
    fn relax(
        &self,
        structure: &mut Structure,
        preset: &StagePreset,
        trace: &Path,
    ) -> Result<RelaxReport, SolverError>;
}
