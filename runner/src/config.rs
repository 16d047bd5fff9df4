use crate::{
    checkpoint::CheckpointManager,
    pipeline::MaxStepsPolicy,
    setup::Provisioning,
    solver::{exec::ExternalSolver, StagePreset, DEFAULT_STAGES},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// environment variable consulted when `setups.path` is not configured
pub const SETUP_PATH_VARIABLE: &str = "GPAW_SETUP_PATH";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// expand a leading `~` to the home directory of the current user
pub fn expand_home(path: &Path) -> Result<PathBuf, ConfigErrors> {
    let mut components = path.components();

    match components.next() {
        Some(Component::Normal(first)) if first == "~" => dirs::home_dir()
            .map(|home| home.join(components.as_path()))
            .ok_or(ConfigErrors::NoHome),
        _ => Ok(path.to_path_buf()),
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config is not valid YAML")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("No setup path configured and {SETUP_PATH_VARIABLE} is not set")]
    MissingSetupPath,
    #[error("No solver configured")]
    MissingSolver,
    #[error("Unable to determine the home directory")]
    NoHome,
    #[error("Config failed preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // root for per-formula checkpoint directories, `~` is expanded
    #[serde(default = "default_cache")]
    pub cache: PathBuf,
    // record store, defaults to `<cache>/database.db`
    #[serde(default, alias = "db")]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub setups: SetupConfig,
    // only required for relaxation sweeps
    #[serde(default)]
    pub solver: Option<SolverConfig>,
    #[serde(default = "default_stages")]
    pub stages: Vec<StagePreset>,
    #[serde(default)]
    pub max_steps_policy: MaxStepsPolicy,
    #[serde(default = "default_extension")]
    pub artifact_extension: String,
    // how long to wait for another worker holding the database lock
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SetupConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_suffixes")]
    pub suffixes: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SolverConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            path: None,
            suffixes: default_suffixes(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cache: default_cache(),
            database: None,
            setups: SetupConfig::default(),
            solver: None,
            stages: default_stages(),
            max_steps_policy: MaxStepsPolicy::default(),
            artifact_extension: default_extension(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|_| ConfigErrors::FileNotFound(path.to_path_buf()))?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn cache_root(&self) -> Result<PathBuf, ConfigErrors> {
        expand_home(&self.cache)
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigErrors> {
        match &self.database {
            Some(path) => expand_home(path),
            None => Ok(self.cache_root()?.join("database.db")),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn checkpoints(&self) -> Result<CheckpointManager, ConfigErrors> {
        Ok(CheckpointManager::new(
            self.cache_root()?,
            self.artifact_extension.clone(),
        ))
    }

    /// setup directory from the config, falling back to `$GPAW_SETUP_PATH`
    pub fn provisioning(&self) -> Result<Provisioning, ConfigErrors> {
        let path = match &self.setups.path {
            Some(path) => expand_home(path)?,
            None => env::var_os(SETUP_PATH_VARIABLE)
                .map(PathBuf::from)
                .ok_or(ConfigErrors::MissingSetupPath)?,
        };

        Ok(Provisioning::new(path, self.setups.suffixes.clone()))
    }

    pub fn solver(&self) -> Result<ExternalSolver, ConfigErrors> {
        let solver = self.solver.as_ref().ok_or(ConfigErrors::MissingSolver)?;

        Ok(ExternalSolver::new(
            expand_home(&solver.exec)?,
            solver.params.iter().map(Into::into).collect(),
        ))
    }

    /// Report every problem at once instead of piece-by-piece, returns true if any was found
    pub fn preflight_checks(&self, needs_solver: bool) -> bool {
        let mut contains_error = false;

        if self.stages.is_empty() {
            error!("No stages were defined, nothing to relax");
            contains_error = true;
        }

        for (name, count) in self.stages.iter().map(|stage| stage.name.as_str()).counts() {
            if count > 1 {
                error!("Stage {name} is defined {count} times, checkpoints would collide");
                contains_error = true;
            }
        }

        for stage in self.stages.iter() {
            let name = &stage.name;

            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                error!("Stage name '{name}' can't be used as part of a file name");
                contains_error = true;
            }

            if !(stage.fmax > 0.0) {
                error!("stages.{name}.fmax must be positive");
                contains_error = true;
            }

            if stage.max_steps == 0 {
                error!("stages.{name}.max_steps cannot be 0");
                contains_error = true;
            }
        }

        if self.artifact_extension.is_empty() || self.artifact_extension.contains('/') {
            error!(
                "artifact_extension '{}' is not a valid file extension",
                self.artifact_extension
            );
            contains_error = true;
        }

        match self.provisioning() {
            Ok(provisioning) if !provisioning.path.is_dir() => {
                warn!(
                    "Setup directory {} does not exist, every composition will end up as nosetup",
                    provisioning.path.to_string_lossy()
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!("{e}");
                contains_error = true;
            }
        }

        if needs_solver {
            match self.solver() {
                Ok(solver) => match check_executable(&solver.exec) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "Solver target {} is not executable",
                            solver.exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if solver.exec ({}) is an executable: {e}",
                            solver.exec.to_string_lossy()
                        );
                        contains_error = true;
                    }
                },
                Err(e) => {
                    error!("{e}");
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_cache() -> PathBuf {
    PathBuf::from("~/abx3_cached/")
}

fn default_stages() -> Vec<StagePreset> {
    DEFAULT_STAGES.clone()
}

fn default_suffixes() -> Vec<String> {
    vec!["LDA.gz".to_owned(), "RPBE.gz".to_owned()]
}

fn default_extension() -> String {
    "json".to_owned()
}

fn default_busy_timeout() -> u64 {
    30_000
}
