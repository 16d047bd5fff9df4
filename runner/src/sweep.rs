use crate::{
    collector::WorkItem,
    database::{RecordStore, StateLabel},
    pipeline::StagePipeline,
    setup::Provisioning,
    solver::Solver,
    ticket::{InitialState, JobTicket},
    RunnerError,
};
use tracing::{debug, error, info, instrument};

/// default process for pre-populating the store with initial structures
pub const CREATION: &str = "creation";
/// default process for relaxation sweeps
pub const RELAXING: &str = "relaxing";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// items this worker claimed
    pub claimed: usize,
    /// items claimed elsewhere, already finished or without a starting structure
    pub skipped: usize,
    /// claimed items given up on, the solver broke down or a snapshot was unreadable
    pub failed: usize,
}

/// Walks work items and claims whatever no other worker holds.
#[derive(Debug)]
pub struct Sweep<'a> {
    store: &'a RecordStore,
    provisioning: &'a Provisioning,
    process: String,
}

impl<'a> Sweep<'a> {
    pub fn new(store: &'a RecordStore, provisioning: &'a Provisioning, process: impl Into<String>) -> Self {
        Self {
            store,
            provisioning,
            process: process.into(),
        }
    }

    fn claim(&self, item: WorkItem, initial: &InitialState) -> Result<Option<JobTicket<'a>>, RunnerError> {
        let index = item.index;
        let ticket = JobTicket::open(
            self.store,
            self.provisioning,
            item.composition,
            initial,
            &self.process,
        )?;

        if ticket.is_null() {
            debug!(index = index, process = ticket.process(), "Skipping item");

            return Ok(None);
        }

        info!(
            formula = %ticket.composition(),
            index = index,
            pid = std::process::id(),
            "Found new job"
        );

        Ok(Some(ticket))
    }

    /// Store the synthesized structure of every unclaimed item as `initial`.
    #[instrument(skip_all, fields(process = %self.process))]
    pub fn create<I>(&self, items: I) -> Result<SweepSummary, RunnerError>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let mut summary = SweepSummary::default();

        for item in items {
            let initial = item.initial.clone();

            match self.claim(item, &initial)? {
                Some(mut ticket) => {
                    summary.claimed += 1;
                    ticket.commit(StateLabel::Initial)?;
                }
                None => summary.skipped += 1,
            }
        }

        info!(?summary, "Done with creation sweep");

        Ok(summary)
    }

    /// Relax every unclaimed item and store the result as `relaxed`.
    ///
    /// With `from` set, items start from their latest stored structure with that label
    /// instead of the geometry in the table.
    #[instrument(skip_all, fields(process = %self.process))]
    pub fn relax<I, V>(
        &self,
        pipeline: &StagePipeline<V>,
        from: Option<StateLabel>,
        items: I,
    ) -> Result<SweepSummary, RunnerError>
    where
        I: IntoIterator<Item = WorkItem>,
        V: Solver,
    {
        let mut summary = SweepSummary::default();

        for item in items {
            let initial = match from {
                Some(state) => InitialState::Stored(state),
                None => item.initial.clone(),
            };

            let Some(mut ticket) = self.claim(item, &initial)? else {
                summary.skipped += 1;

                continue;
            };
            summary.claimed += 1;

            match pipeline.run(&mut ticket) {
                Ok(report) => {
                    debug!(?report, "Pipeline finished");
                    ticket.commit(StateLabel::Relaxed)?;
                }
                // the ticket is dropped below and recorded as interrupted
                Err(error) if error.is_item_failure() => {
                    error!(error = ?error, process = ticket.process(), "Giving up on item: {error}");
                    summary.failed += 1;
                }
                Err(error) => return Err(error),
            }
        }

        info!(?summary, "Done with relaxation sweep");

        Ok(summary)
    }
}
