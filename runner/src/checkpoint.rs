use crate::{structure::Composition, ticket::JobTicket};
use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to (de)serialize checkpoint {path:?}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Stage snapshots on disk, one directory per formula below `root`.
///
/// The existence of `<root>/<formula>/abx3_<stage>.<extension>` is the only thing that marks
/// a stage as done.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    root: PathBuf,
    extension: String,
}

impl CheckpointManager {
    pub fn new(root: PathBuf, extension: impl Into<String>) -> Self {
        Self {
            root,
            extension: extension.into(),
        }
    }

    pub fn directory(&self, composition: &Composition) -> PathBuf {
        self.root.join(composition.formula())
    }

    pub fn stage_path(&self, composition: &Composition, stage: &str) -> PathBuf {
        self.directory(composition)
            .join(format!("abx3_{stage}.{}", self.extension))
    }

    /// solver trace, shared by all stages of a composition
    pub fn trace_path(&self, composition: &Composition) -> PathBuf {
        self.directory(composition).join("relaxation.txt")
    }

    /// create the directory for `composition`, an existing one is fine
    pub fn prepare(&self, composition: &Composition) -> Result<PathBuf, CheckpointError> {
        let directory = self.directory(composition);

        match fs::create_dir_all(&directory) {
            Ok(()) => Ok(directory),
            Err(error) if error.kind() == ErrorKind::AlreadyExists && directory.is_dir() => {
                Ok(directory)
            }
            Err(error) => Err(CheckpointError::io(&directory, error)),
        }
    }

    /// Restore the snapshot of `stage` into `ticket` if it exists.
    #[instrument(skip(self, ticket), fields(process = ticket.process()), level = "debug")]
    pub fn stage_done(&self, ticket: &mut JobTicket, stage: &str) -> Result<bool, CheckpointError> {
        if ticket.is_null() {
            return Ok(false);
        }

        let path = self.stage_path(ticket.composition(), stage);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = ?path, "No checkpoint for stage");

                return Ok(false);
            }
            Err(error) => return Err(CheckpointError::io(&path, error)),
        };

        let structure = serde_json::from_slice(&bytes).map_err(|source| {
            CheckpointError::Serialization {
                path: path.clone(),
                source,
            }
        })?;

        info!(path = ?path, "Restored stage from checkpoint");

        Ok(ticket.replace_structure(structure))
    }

    /// Write the snapshot of `stage`, replacing any previous one.
    #[instrument(skip(self, ticket), fields(process = ticket.process()), level = "debug")]
    pub fn record_stage(&self, ticket: &JobTicket, stage: &str) -> Result<(), CheckpointError> {
        let Some(structure) = ticket.structure() else {
            return Ok(());
        };

        self.prepare(ticket.composition())?;
        let path = self.stage_path(ticket.composition(), stage);
        let bytes = serde_json::to_vec(structure).map_err(|source| {
            CheckpointError::Serialization {
                path: path.clone(),
                source,
            }
        })?;

        // write-then-rename, a crash mid-write must not leave a half snapshot that looks done
        let mut temporary = path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);

        let mut file = fs::File::create(&temporary).map_err(|e| CheckpointError::io(&temporary, e))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| CheckpointError::io(&temporary, e))?;
        drop(file);
        fs::rename(&temporary, &path).map_err(|e| CheckpointError::io(&path, e))?;

        info!(path = ?path, "Recorded stage");

        Ok(())
    }
}
