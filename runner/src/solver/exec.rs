use super::{RelaxReport, Solver, SolverError, StagePreset};
use crate::structure::Structure;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, error, instrument, trace};

#[derive(Debug, Serialize)]
struct Request<'a> {
    stage: &'a StagePreset,
    structure: &'a Structure,
    trace: &'a Path,
}

#[derive(Debug, Deserialize)]
struct Response {
    steps: usize,
    converged: bool,
    structure: Structure,
    /// set when the electronic structure failed to converge
    #[serde(default)]
    scf_failure: Option<String>,
}

/// Solver running as an external executable.
///
/// The request (stage preset, structure and trace path) is written as YAML to stdin and
/// the relaxed structure plus step count is read back as YAML from stdout.
#[derive(Debug, Clone)]
pub struct ExternalSolver {
    pub exec: PathBuf,
    pub params: Vec<OsString>,
}

impl ExternalSolver {
    pub fn new(exec: PathBuf, params: Vec<OsString>) -> Self {
        Self { exec, params }
    }
}

impl Solver for ExternalSolver {
    #[instrument(skip(self, structure), fields(stage = %preset.name), level = "debug")]
    fn relax(
        &self,
        structure: &mut Structure,
        preset: &StagePreset,
        trace: &Path,
    ) -> Result<RelaxReport, SolverError> {
        let mut handle = Command::new(&self.exec)
            .args(&self.params)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SolverError::Spawn)?;

        debug!("Solver running as {}", handle.id());

        if let Some(mut stdin) = handle.stdin.take() {
            let request = serde_yaml::to_string(&Request {
                stage: preset,
                structure,
                trace,
            })?;
            stdin.write_all(request.as_bytes())?;
            // Dropping stdin here will close the underlying file descriptor, giving the solver
            // a clear end of input
            drop(stdin);
        }

        let output = handle.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(status = ?output.status, stderr = %stderr, "Solver failed");

            return Err(SolverError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("Output from solver: {stdout}");

        let response: Response = match serde_yaml::from_str(&stdout) {
            Ok(response) => response,
            Err(e) => {
                error!("Solver answered with an unreadable report: {e}");

                return Err(e.into());
            }
        };

        *structure = response.structure;

        match response.scf_failure {
            Some(message) => Err(SolverError::NotConverged(message)),
            None => Ok(RelaxReport {
                steps: response.steps,
                converged: response.converged,
            }),
        }
    }
}
