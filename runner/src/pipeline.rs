use crate::{
    checkpoint::CheckpointManager,
    database::StateLabel,
    solver::{Solver, StageOutcome, StagePreset},
    ticket::JobTicket,
    RunnerError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// What to do after a stage used up its step budget without converging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxStepsPolicy {
    /// store a `maxsteps` record and keep going with the next stage
    #[default]
    Continue,
    /// finish the ticket as `maxsteps`, later stages are skipped
    Abort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// stages the solver ran for
    pub computed: usize,
    /// stages restored from their checkpoint
    pub restored: usize,
    pub abnormal: Option<StageOutcome>,
}

/// Fixed, ordered list of relaxation stages run against a ticket
#[derive(Debug)]
pub struct StagePipeline<'a, V: Solver> {
    stages: &'a [StagePreset],
    solver: &'a V,
    checkpoints: &'a CheckpointManager,
    policy: MaxStepsPolicy,
}

impl<'a, V: Solver> StagePipeline<'a, V> {
    pub fn new(
        stages: &'a [StagePreset],
        solver: &'a V,
        checkpoints: &'a CheckpointManager,
        policy: MaxStepsPolicy,
    ) -> Self {
        Self {
            stages,
            solver,
            checkpoints,
            policy,
        }
    }

    /// Run every stage that has no checkpoint yet, stopping early once the ticket is null.
    #[instrument(skip_all, fields(process = ticket.process()))]
    pub fn run(&self, ticket: &mut JobTicket) -> Result<PipelineReport, RunnerError> {
        let mut report = PipelineReport::default();

        for stage in self.stages {
            if ticket.is_null() {
                break;
            }

            if self.checkpoints.stage_done(ticket, &stage.name)? {
                debug!(stage = %stage.name, "Stage already done");
                report.restored += 1;

                continue;
            }

            let Some(outcome) = self.run_stage(ticket, stage)? else {
                break;
            };
            report.computed += 1;

            if outcome != StageOutcome::Converged {
                report.abnormal = Some(outcome);
            }
        }

        Ok(report)
    }

    fn run_stage(
        &self,
        ticket: &mut JobTicket,
        stage: &StagePreset,
    ) -> Result<Option<StageOutcome>, RunnerError> {
        let trace = self.checkpoints.trace_path(ticket.composition());
        self.checkpoints.prepare(ticket.composition())?;

        let Some(structure) = ticket.structure_mut() else {
            return Ok(None);
        };
        structure.calculator = Some(stage.calculator.clone());

        info!(
            stage = %stage.name,
            fmax = stage.fmax,
            max_steps = stage.max_steps,
            "Relaxing"
        );

        let outcome = StageOutcome::classify(stage, self.solver.relax(structure, stage, &trace))?;

        // the attempt is kept whatever the outcome
        self.checkpoints.record_stage(ticket, &stage.name)?;

        match (outcome, self.policy) {
            (StageOutcome::Converged, _) => debug!(stage = %stage.name, "Stage converged"),
            (StageOutcome::NotConverged, _) => {
                warn!(stage = %stage.name, "Solver did not converge");
                ticket.commit(StateLabel::NotConverged)?;
            }
            (StageOutcome::MaxSteps, MaxStepsPolicy::Continue) => {
                warn!(stage = %stage.name, "Step budget exhausted, continuing");
                ticket.annotate(StateLabel::MaxSteps)?;
            }
            (StageOutcome::MaxSteps, MaxStepsPolicy::Abort) => {
                warn!(stage = %stage.name, "Step budget exhausted, aborting");
                ticket.commit(StateLabel::MaxSteps)?;
            }
        }

        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        solver::DEFAULT_STAGES,
        test_util::{sn_ti_o, Behavior, Fixture, MockSolver},
        ticket::InitialState,
    };

    fn relaxing(fixture: &Fixture) -> JobTicket<'_> {
        fixture.open(sn_ti_o(), InitialState::Stored(StateLabel::Initial), "relaxing")
    }

    fn artifacts(fixture: &Fixture) -> [bool; 2] {
        DEFAULT_STAGES
            .iter()
            .map(|stage| fixture.checkpoints.stage_path(&sn_ti_o(), &stage.name).exists())
            .collect::<Vec<_>>()
            .try_into()
            .unwrap()
    }

    #[test]
    fn stages_run_in_order_and_are_recorded() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::default();
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let mut ticket = relaxing(&fixture);
        let report = pipeline.run(&mut ticket).unwrap();
        assert_eq!(
            report,
            PipelineReport {
                computed: 2,
                restored: 0,
                abnormal: None
            }
        );
        assert_eq!(*solver.stages.borrow(), ["quickRelaxation", "ucRelaxation"]);
        assert_eq!(
            ticket.structure().unwrap().calculator,
            Some(DEFAULT_STAGES[1].calculator.clone())
        );
        ticket.commit(StateLabel::Relaxed).unwrap();

        assert_eq!(artifacts(&fixture), [true, true]);
        assert!(fixture.checkpoints.trace_path(&sn_ti_o()).is_file());
        assert_eq!(
            fixture.labels(&sn_ti_o()),
            [StateLabel::Initial, StateLabel::Relaxed]
        );
        assert_eq!(fixture.live_reservations(), 0);
    }

    #[test]
    fn resume_restores_every_stage_without_solving() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::default();
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let mut ticket = relaxing(&fixture);
        pipeline.run(&mut ticket).unwrap();
        let finished = serde_json::to_vec(ticket.structure().unwrap()).unwrap();
        ticket.commit(StateLabel::Relaxed).unwrap();

        let solver = MockSolver::default();
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);
        let mut ticket = fixture.open(sn_ti_o(), InitialState::Stored(StateLabel::Relaxed), "relaxing");
        let report = pipeline.run(&mut ticket).unwrap();

        assert_eq!(report.computed, 0);
        assert_eq!(report.restored, 2);
        assert_eq!(solver.calls.get(), 0);
        assert_eq!(serde_json::to_vec(ticket.structure().unwrap()).unwrap(), finished);
    }

    #[test]
    fn interrupted_run_resumes_at_the_missing_stage() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::with(&[Behavior::Converge, Behavior::Crash]);
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let mut ticket = relaxing(&fixture);
        assert!(matches!(pipeline.run(&mut ticket), Err(RunnerError::Solver(_))));
        drop(ticket);
        assert_eq!(artifacts(&fixture), [true, false]);
        assert_eq!(
            fixture.labels(&sn_ti_o()),
            [StateLabel::Initial, StateLabel::Interrupted]
        );

        let solver = MockSolver::default();
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);
        let mut ticket = relaxing(&fixture);
        let report = pipeline.run(&mut ticket).unwrap();

        assert_eq!((report.restored, report.computed), (1, 1));
        assert_eq!(*solver.stages.borrow(), ["ucRelaxation"]);
        assert_eq!(artifacts(&fixture), [true, true]);
    }

    #[test]
    fn non_convergence_ends_the_ticket() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::with(&[Behavior::NotConverged]);
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let mut ticket = relaxing(&fixture);
        let report = pipeline.run(&mut ticket).unwrap();
        assert_eq!(report.computed, 1);
        assert_eq!(report.abnormal, Some(StageOutcome::NotConverged));
        assert!(ticket.is_null());
        // the driver's final commit no longer does anything
        assert_eq!(ticket.commit(StateLabel::Relaxed).unwrap(), None);

        assert_eq!(artifacts(&fixture), [true, false]);
        assert_eq!(
            fixture.labels(&sn_ti_o()),
            [StateLabel::Initial, StateLabel::NotConverged]
        );
        assert_eq!(fixture.live_reservations(), 0);
    }

    #[test]
    fn early_stop_without_convergence_is_not_relaxed() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::with(&[Behavior::Stalled]);
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let mut ticket = relaxing(&fixture);
        let report = pipeline.run(&mut ticket).unwrap();
        assert_eq!(report.abnormal, Some(StageOutcome::NotConverged));
        assert!(ticket.is_null());
        assert_eq!(solver.calls.get(), 1);

        assert_eq!(
            fixture.labels(&sn_ti_o()),
            [StateLabel::Initial, StateLabel::NotConverged]
        );
    }

    #[test]
    fn max_steps_continue_annotates_and_proceeds() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::with(&[Behavior::MaxSteps]);
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let mut ticket = relaxing(&fixture);
        let report = pipeline.run(&mut ticket).unwrap();
        assert_eq!(report.computed, 2);
        assert_eq!(report.abnormal, Some(StageOutcome::MaxSteps));
        assert!(!ticket.is_null());
        ticket.commit(StateLabel::Relaxed).unwrap();

        assert_eq!(artifacts(&fixture), [true, true]);
        assert_eq!(
            fixture.labels(&sn_ti_o()),
            [StateLabel::Initial, StateLabel::MaxSteps, StateLabel::Relaxed]
        );
    }

    #[test]
    fn max_steps_abort_ends_the_ticket() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::with(&[Behavior::MaxSteps]);
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Abort);

        let mut ticket = relaxing(&fixture);
        let report = pipeline.run(&mut ticket).unwrap();
        assert_eq!(report.computed, 1);
        assert!(ticket.is_null());

        assert_eq!(artifacts(&fixture), [true, false]);
        assert_eq!(
            fixture.labels(&sn_ti_o()),
            [StateLabel::Initial, StateLabel::MaxSteps]
        );
        assert_eq!(fixture.live_reservations(), 0);
    }

    #[test]
    fn null_ticket_runs_nothing() {
        let fixture = Fixture::new();
        fixture.create(sn_ti_o());
        let solver = MockSolver::default();
        let pipeline = StagePipeline::new(&DEFAULT_STAGES, &solver, &fixture.checkpoints, MaxStepsPolicy::Continue);

        let _held = relaxing(&fixture);
        let mut ticket = relaxing(&fixture);
        assert!(ticket.is_null());

        assert_eq!(pipeline.run(&mut ticket).unwrap(), PipelineReport::default());
        assert_eq!(solver.calls.get(), 0);
        assert_eq!(artifacts(&fixture), [false, false]);
    }
}
