//! Claiming and checkpointing for ABX3 perovskite relaxation sweeps.
//!
//! Workers racing over the same candidate table coordinate only through the record
//! store: a composition is worked on by whoever manages to reserve its process tag, and
//! finished stages are recognized by their snapshot on disk.

pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod database;
pub mod pipeline;
pub mod setup;
pub mod solver;
pub mod structure;
pub mod sweep;
pub mod ticket;

#[cfg(test)]
mod test_util;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Record store failed: {0}")]
    Store(#[from] database::ConnectionError),
    #[error("{0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),
    #[error("Solver failed: {0}")]
    Solver(#[from] solver::SolverError),
    #[error("Failed to read work items: {0}")]
    Table(#[from] collector::TableError),
    #[error("{0}")]
    Config(#[from] config::ConfigErrors),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// failures confined to a single work item, a sweep records them and moves on
    pub fn is_item_failure(&self) -> bool {
        matches!(
            self,
            Self::Solver(_) | Self::Checkpoint(checkpoint::CheckpointError::Serialization { .. })
        )
    }
}
