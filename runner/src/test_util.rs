use crate::{
    checkpoint::CheckpointManager,
    database::{RecordStore, StateLabel},
    setup::Provisioning,
    solver::{RelaxReport, Solver, SolverError, StagePreset},
    structure::{Composition, Geometry, Structure},
    ticket::{InitialState, JobTicket},
};
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;

pub const PROVISIONED: [&str; 9] = ["Sn", "Ti", "O", "Ba", "Zr", "S", "Cs", "Pb", "I"];

pub struct Fixture {
    pub dir: TempDir,
    pub store: RecordStore,
    pub provisioning: Provisioning,
    pub checkpoints: CheckpointManager,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let setups = dir.path().join("setups");
        fs::create_dir(&setups).unwrap();
        let provisioning =
            Provisioning::new(setups, vec!["LDA.gz".to_owned(), "RPBE.gz".to_owned()]);
        for element in PROVISIONED {
            for suffix in provisioning.suffixes.iter() {
                fs::write(provisioning.file(element, suffix), b"").unwrap();
            }
        }

        let store = RecordStore::open(&dir.path().join("database.db"), Duration::from_secs(10)).unwrap();
        let checkpoints = CheckpointManager::new(dir.path().join("cache"), "json");

        Self {
            dir,
            store,
            provisioning,
            checkpoints,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("database.db")
    }

    pub fn open(&self, composition: Composition, initial: InitialState, process: &str) -> JobTicket<'_> {
        JobTicket::open(&self.store, &self.provisioning, composition, &initial, process).unwrap()
    }

    /// store the `initial` structure of `composition` and release the claim again
    pub fn create(&self, composition: Composition) {
        let mut ticket = self.open(
            composition,
            InitialState::Geometry(Geometry::Cubic(3.0)),
            "creation",
        );
        ticket.commit(StateLabel::Initial).unwrap().unwrap();
    }

    pub fn labels(&self, composition: &Composition) -> Vec<StateLabel> {
        self.store
            .records(composition)
            .unwrap()
            .into_iter()
            .map(|record| record.state)
            .collect()
    }

    pub fn live_reservations(&self) -> usize {
        self.store.stale_reservations(Duration::ZERO).unwrap().len()
    }
}

pub fn sn_ti_o() -> Composition {
    Composition::new("Sn", "Ti", "O")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Converge,
    MaxSteps,
    /// optimizer stops early without converging
    Stalled,
    NotConverged,
    Crash,
}

/// Shrinks the cell a little per call, answers according to the queued behaviors
#[derive(Debug, Default)]
pub struct MockSolver {
    pub calls: Cell<usize>,
    pub stages: RefCell<Vec<String>>,
    pub behaviors: RefCell<VecDeque<Behavior>>,
}

impl MockSolver {
    pub fn with(behaviors: &[Behavior]) -> Self {
        Self {
            behaviors: RefCell::new(behaviors.iter().copied().collect()),
            ..Self::default()
        }
    }
}

impl Solver for MockSolver {
    fn relax(
        &self,
        structure: &mut Structure,
        preset: &StagePreset,
        trace: &Path,
    ) -> Result<RelaxReport, SolverError> {
        self.calls.set(self.calls.get() + 1);
        self.stages.borrow_mut().push(preset.name.clone());
        fs::write(trace, preset.name.as_bytes())?;

        let behavior = self
            .behaviors
            .borrow_mut()
            .pop_front()
            .unwrap_or(Behavior::Converge);

        if behavior == Behavior::Crash {
            return Err(SolverError::Failed {
                status: 1,
                stderr: "segmentation fault".to_owned(),
            });
        }

        for vector in structure.cell.iter_mut().chain(structure.positions.iter_mut()) {
            for value in vector.iter_mut() {
                *value *= 0.99;
            }
        }
        structure.energy = Some(-1.0 / 3.0 * self.calls.get() as f64);

        match behavior {
            Behavior::NotConverged => Err(SolverError::NotConverged("KohnShamConvergenceError".to_owned())),
            Behavior::MaxSteps => Ok(RelaxReport {
                steps: preset.max_steps,
                converged: false,
            }),
            Behavior::Stalled => Ok(RelaxReport {
                steps: 5,
                converged: false,
            }),
            _ => Ok(RelaxReport {
                steps: 3,
                converged: true,
            }),
        }
    }
}
