pub mod sqlite;
pub mod util;

use crate::structure::{Composition, Structure};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr, time::Duration};
use thiserror::Error;

pub type ID = i64;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("Failed to (de)serialize a stored structure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown state label '{0}' in record store")]
    UnknownLabel(String),
    #[error("Failed to determine the identity of this worker")]
    Identity(#[from] nix::Error),
}

/// How a computation on a structure ended, as persisted next to each record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateLabel {
    Initial,
    Relaxed,
    NotConverged,
    MaxSteps,
    NoSetup,
    Interrupted,
}

impl StateLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Relaxed => "relaxed",
            Self::NotConverged => "notconverged",
            Self::MaxSteps => "maxsteps",
            Self::NoSetup => "nosetup",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for StateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateLabel {
    type Err = ConnectionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initial" => Ok(Self::Initial),
            "relaxed" => Ok(Self::Relaxed),
            "notconverged" => Ok(Self::NotConverged),
            "maxsteps" => Ok(Self::MaxSteps),
            "nosetup" => Ok(Self::NoSetup),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(ConnectionError::UnknownLabel(other.to_owned())),
        }
    }
}

/// A claim on a process tag, alive until deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ID,
    pub process: String,
    pub holder: String,
    pub pid: u32,
    /// unix seconds
    pub created_at: i64,
}

/// Entry to be appended to the structure table
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub composition: &'a Composition,
    pub process: &'a str,
    pub state: StateLabel,
    pub structure: &'a Structure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureRecord {
    pub id: ID,
    pub composition: Composition,
    pub process: String,
    pub state: StateLabel,
    pub structure: Structure,
    pub created_at: i64,
}

/// All supported record store backends
/// (enum dispatch instead of trait objects, there is only one backend so far)
#[derive(Debug, Clone)]
pub enum RecordStore {
    SQLite(sqlite::SharedConnection),
}

impl RecordStore {
    /// open the store at `path` and make sure the schema exists
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, ConnectionError> {
        let store = Self::SQLite(sqlite::SharedConnection::load(path, busy_timeout)?);
        store.init()?;

        Ok(store)
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.init(),
        }
    }

    /// atomically claim `process`, `None` if someone else holds it
    pub fn reserve(&self, process: &str) -> Result<Option<Reservation>, ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.reserve(process),
        }
    }

    pub fn release(&self, id: ID) -> Result<bool, ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.release(id),
        }
    }

    pub fn write(&self, record: &NewRecord) -> Result<ID, ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.write(record),
        }
    }

    /// most recent structure stored for `composition` with `state`
    pub fn query(
        &self,
        composition: &Composition,
        state: StateLabel,
    ) -> Result<Option<Structure>, ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.query(composition, state),
        }
    }

    pub fn records(&self, composition: &Composition) -> Result<Vec<StructureRecord>, ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.records(composition),
        }
    }

    /// reservations created at least `older_than` ago, oldest first
    pub fn stale_reservations(&self, older_than: Duration) -> Result<Vec<Reservation>, ConnectionError> {
        match self {
            Self::SQLite(connection) => connection.stale_reservations(older_than),
        }
    }
}

pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists reservations (
    id integer primary key,
    process text not null unique,
    holder text not null,
    pid integer not null,
    created_at integer not null
);",
    "create table if not exists structures (
    id integer primary key,
    process text not null,
    formula text not null,
    a_ion text not null,
    b_ion text not null,
    x_ion text not null,
    state text not null,
    structure text not null,
    created_at integer not null
);",
    "create index if not exists structures_by_state
    on structures (a_ion, b_ion, x_ion, state);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
