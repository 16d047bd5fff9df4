use crate::{
    database::{ConnectionError, NewRecord, RecordStore, Reservation, StateLabel, ID},
    setup::Provisioning,
    structure::{Composition, Geometry, Structure},
};
use tracing::{debug, error, instrument, warn};

/// Where the structure of a freshly claimed ticket comes from
#[derive(Debug, Clone, PartialEq)]
pub enum InitialState {
    /// synthesize the perovskite cell
    Geometry(Geometry),
    /// load the latest record stored with this label
    Stored(StateLabel),
}

#[derive(Debug)]
enum TicketState {
    Active {
        structure: Structure,
        reservation: Reservation,
    },
    Null,
}

/// One claimed unit of work: a composition under a process tag.
///
/// A ticket whose claim failed (or that already finished) is *null*: every operation on
/// it returns immediately without touching the store. Dropping a ticket that is still
/// active records its structure as [`StateLabel::Interrupted`] and frees the claim.
#[derive(Debug)]
pub struct JobTicket<'a> {
    store: &'a RecordStore,
    composition: Composition,
    process: String,
    state: TicketState,
}

impl<'a> JobTicket<'a> {
    /// Claim `<formula>_<process>` and materialize the structure.
    ///
    /// Returns a null ticket if the tag is already reserved, or if `initial` refers to a
    /// state that was never stored. Missing setup files are recorded as
    /// [`StateLabel::NoSetup`] right away, which also leaves the ticket null.
    #[instrument(skip(store, provisioning, composition), fields(formula = %composition), level = "debug")]
    pub fn open(
        store: &'a RecordStore,
        provisioning: &Provisioning,
        composition: Composition,
        initial: &InitialState,
        process: &str,
    ) -> Result<Self, ConnectionError> {
        let mut ticket = Self {
            store,
            process: composition.process_tag(process),
            composition,
            state: TicketState::Null,
        };

        let Some(reservation) = store.reserve(&ticket.process)? else {
            return Ok(ticket);
        };

        let structure = match initial {
            InitialState::Geometry(geometry) => {
                Some(Structure::perovskite(&ticket.composition, geometry))
            }
            InitialState::Stored(state) => match store.query(&ticket.composition, *state) {
                Ok(structure) => structure,
                Err(error) => {
                    ticket.release_quietly(reservation.id);

                    return Err(error);
                }
            },
        };

        let Some(structure) = structure else {
            warn!(
                process = %ticket.process,
                initial = ?initial,
                "No stored structure to start from, releasing claim"
            );
            store.release(reservation.id)?;

            return Ok(ticket);
        };

        ticket.state = TicketState::Active {
            structure,
            reservation,
        };

        let missing = provisioning.missing(&ticket.composition);
        if !missing.is_empty() {
            warn!(process = %ticket.process, missing = ?missing, "Setups not found");
            ticket.commit(StateLabel::NoSetup)?;
        }

        Ok(ticket)
    }

    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    /// full process tag, `<formula>_<process>`
    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn is_null(&self) -> bool {
        matches!(self.state, TicketState::Null)
    }

    pub fn structure(&self) -> Option<&Structure> {
        match &self.state {
            TicketState::Active { structure, .. } => Some(structure),
            TicketState::Null => None,
        }
    }

    pub fn structure_mut(&mut self) -> Option<&mut Structure> {
        match &mut self.state {
            TicketState::Active { structure, .. } => Some(structure),
            TicketState::Null => None,
        }
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match &self.state {
            TicketState::Active { reservation, .. } => Some(reservation),
            TicketState::Null => None,
        }
    }

    /// swap in a restored structure, ignored for null tickets
    pub(crate) fn replace_structure(&mut self, restored: Structure) -> bool {
        match self.structure_mut() {
            Some(structure) => {
                *structure = restored;
                true
            }
            None => false,
        }
    }

    /// Store the current structure under `state` while keeping the claim.
    pub fn annotate(&self, state: StateLabel) -> Result<Option<ID>, ConnectionError> {
        match &self.state {
            TicketState::Active { structure, .. } => self.write(structure, state).map(Some),
            TicketState::Null => Ok(None),
        }
    }

    /// Store the current structure under `state` and end the claim.
    ///
    /// The ticket stays active if the write fails, so the claim is never lost silently.
    /// Once the record is written the ticket is null, even if releasing the claim fails.
    pub fn commit(&mut self, state: StateLabel) -> Result<Option<ID>, ConnectionError> {
        let TicketState::Active {
            structure,
            reservation,
        } = &self.state
        else {
            return Ok(None);
        };

        let id = self.write(structure, state)?;
        let reservation = reservation.id;
        self.state = TicketState::Null;
        self.store.release(reservation)?;

        debug!(process = %self.process, state = %state, "Finished process");

        Ok(Some(id))
    }

    fn write(&self, structure: &Structure, state: StateLabel) -> Result<ID, ConnectionError> {
        self.store.write(&NewRecord {
            composition: &self.composition,
            process: &self.process,
            state,
            structure,
        })
    }

    fn release_quietly(&self, id: ID) {
        if let Err(error) = self.store.release(id) {
            error!(error = ?error, process = %self.process, "Failed to release reservation {id}: {error}");
        }
    }
}

impl Drop for JobTicket<'_> {
    fn drop(&mut self) {
        if self.is_null() {
            return;
        }

        warn!(process = %self.process, "Ticket dropped while active, recording as interrupted");

        if let Err(error) = self.commit(StateLabel::Interrupted) {
            error!(error = ?error, process = %self.process, "Failed to record interrupted process: {error}");
        }
    }
}
