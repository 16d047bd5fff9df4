use super::{
    util::holder, ConnectionError, NewRecord, Reservation, StateLabel, StructureRecord, ID,
    SQL_SCHEMA, SQL_SCHEMA_NUMBER,
};
use crate::structure::{Composition, Structure};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
    holder: String,
    pid: u32,
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(path: &Path, busy_timeout: Duration) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path, busy_timeout)?))
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        self.lock().init()
    }

    pub fn reserve(&self, process: &str) -> Result<Option<Reservation>, ConnectionError> {
        self.lock().reserve(process)
    }

    pub fn release(&self, id: ID) -> Result<bool, ConnectionError> {
        self.lock().release(id)
    }

    pub fn write(&self, record: &NewRecord) -> Result<ID, ConnectionError> {
        self.lock().write(record)
    }

    pub fn query(
        &self,
        composition: &Composition,
        state: StateLabel,
    ) -> Result<Option<Structure>, ConnectionError> {
        self.lock().query(composition, state)
    }

    pub fn records(&self, composition: &Composition) -> Result<Vec<StructureRecord>, ConnectionError> {
        self.lock().records(composition)
    }

    pub fn stale_reservations(&self, older_than: Duration) -> Result<Vec<Reservation>, ConnectionError> {
        self.lock().stale_reservations(older_than)
    }
}

fn reservation_from_row(row: &rusqlite::Row) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: row.get(0)?,
        process: row.get(1)?,
        holder: row.get(2)?,
        pid: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl InnerConnection {
    pub fn load(path: &Path, busy_timeout: Duration) -> Result<Self, ConnectionError> {
        let connection = Connection::open(path)?;
        // other workers may hold the write lock for a moment, wait instead of failing
        connection.busy_timeout(busy_timeout)?;

        debug!(path = ?path, "Opened SQLite record store");

        Ok(Self {
            connection,
            holder: holder()?,
            pid: std::process::id(),
        })
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(ConnectionError::SQLite(error));
                }
            };
        }

        Ok(())
    }

    pub fn reserve(&self, process: &str) -> Result<Option<Reservation>, ConnectionError> {
        // the unique constraint on `process` makes this a single atomic claim, an ignored
        // insert returns no row
        let reservation = self
            .connection
            .prepare_cached(
                "insert or ignore into reservations
                 (process, holder, pid, created_at)
                 values (?, ?, ?, cast(strftime('%s', 'now') as integer))
                 returning id, process, holder, pid, created_at",
            )?
            .query_row(
                params![process, self.holder.as_str(), self.pid],
                reservation_from_row,
            )
            .optional()?;

        match &reservation {
            Some(reservation) => debug!(id = reservation.id, process = process, "Reserved process"),
            None => debug!(process = process, "Process is already reserved"),
        }

        Ok(reservation)
    }

    pub fn release(&self, id: ID) -> Result<bool, ConnectionError> {
        let deleted = self
            .connection
            .prepare_cached("delete from reservations where id = ?")?
            .execute(params![id])?;

        debug!(id = id, deleted = deleted, "Released reservation");

        Ok(deleted > 0)
    }

    pub fn write(&self, record: &NewRecord) -> Result<ID, ConnectionError> {
        let structure = serde_json::to_string(record.structure)?;

        let id = self
            .connection
            .prepare_cached(
                "insert into structures
                 (process, formula, a_ion, b_ion, x_ion, state, structure, created_at)
                 values (?, ?, ?, ?, ?, ?, ?, cast(strftime('%s', 'now') as integer))
                 returning id",
            )?
            .query_row(
                params![
                    record.process,
                    record.composition.formula(),
                    record.composition.a.as_str(),
                    record.composition.b.as_str(),
                    record.composition.x.as_str(),
                    record.state.as_str(),
                    structure
                ],
                |row| row.get(0),
            )?;

        info!(
            id = id,
            formula = %record.composition,
            process = record.process,
            state = %record.state,
            "Stored structure"
        );

        Ok(id)
    }

    pub fn query(
        &self,
        composition: &Composition,
        state: StateLabel,
    ) -> Result<Option<Structure>, ConnectionError> {
        let structure: Option<String> = self
            .connection
            .prepare_cached(
                "select structure from structures
                 where a_ion = ? and b_ion = ? and x_ion = ? and state = ?
                 order by id desc limit 1",
            )?
            .query_row(
                params![
                    composition.a.as_str(),
                    composition.b.as_str(),
                    composition.x.as_str(),
                    state.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;

        structure
            .map(|structure| serde_json::from_str(&structure).map_err(ConnectionError::from))
            .transpose()
    }

    pub fn records(&self, composition: &Composition) -> Result<Vec<StructureRecord>, ConnectionError> {
        self.connection
            .prepare_cached(
                "select id, process, state, structure, created_at from structures
                 where a_ion = ? and b_ion = ? and x_ion = ?
                 order by id",
            )?
            .query_map(
                params![
                    composition.a.as_str(),
                    composition.b.as_str(),
                    composition.x.as_str()
                ],
                |row| {
                    Ok((
                        row.get::<_, ID>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )?
            .try_fold(Vec::new(), |mut init, result| {
                let (id, process, state, structure, created_at) = result?;
                init.push(StructureRecord {
                    id,
                    composition: composition.clone(),
                    process,
                    state: state.parse()?,
                    structure: serde_json::from_str(&structure)?,
                    created_at,
                });

                Ok::<Vec<StructureRecord>, ConnectionError>(init)
            })
    }

    pub fn stale_reservations(&self, older_than: Duration) -> Result<Vec<Reservation>, ConnectionError> {
        let seconds = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);

        self.connection
            .prepare_cached(
                "select id, process, holder, pid, created_at from reservations
                 where created_at <= cast(strftime('%s', 'now') as integer) - ?
                 order by created_at, id",
            )?
            .query_map(params![seconds], reservation_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Reservation>, ConnectionError>(init)
            })
    }
}
