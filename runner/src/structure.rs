use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Vector = [f64; 3];
pub type Cell = [Vector; 3];

/// A-B-X3 identity of a cubic perovskite
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Composition {
    pub a: String,
    pub b: String,
    pub x: String,
}

impl Composition {
    pub fn new(a: impl Into<String>, b: impl Into<String>, x: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            x: x.into(),
        }
    }

    /// formula as used for directory names and process tags, e.g. `SnTiO3`
    pub fn formula(&self) -> String {
        format!("{}{}{}3", self.a, self.b, self.x)
    }

    /// the reservation key shared by all workers: `<formula>_<process>`
    pub fn process_tag(&self, process: &str) -> String {
        format!("{}_{process}", self.formula())
    }

    pub fn elements(&self) -> [&str; 3] {
        [self.a.as_str(), self.b.as_str(), self.x.as_str()]
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formula())
    }
}

/// Lattice description used to synthesize a fresh cell
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Cubic(f64),
    Lengths(Vector),
    Cell(Cell),
}

impl Geometry {
    pub fn cell(&self) -> Cell {
        match self {
            Self::Cubic(a) => diagonal([*a; 3]),
            Self::Lengths(lengths) => diagonal(*lengths),
            Self::Cell(cell) => *cell,
        }
    }
}

fn diagonal(lengths: Vector) -> Cell {
    [
        [lengths[0], 0.0, 0.0],
        [0.0, lengths[1], 0.0],
        [0.0, 0.0, lengths[2]],
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellFilter {
    Strain,
    UnitCell,
}

/// Solver settings attached to a structure for a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalculatorSettings {
    pub xc: String,
    /// plane-wave cutoff in eV, solver default when absent
    #[serde(default)]
    pub cutoff: Option<f64>,
    pub kpts: [u32; 3],
    #[serde(default)]
    pub eigenstates: Option<f64>,
}

/// Periodic atomic configuration plus whatever the solver attached to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub symbols: Vec<String>,
    pub positions: Vec<Vector>,
    pub cell: Cell,
    pub pbc: [bool; 3],
    #[serde(default)]
    pub calculator: Option<CalculatorSettings>,
    #[serde(default)]
    pub energy: Option<f64>,
}

impl Structure {
    /// Build the 5 atom cell: A on the corner, B in the body center and X on the three
    /// face centers, in exactly that order.
    pub fn perovskite(composition: &Composition, geometry: &Geometry) -> Self {
        let cell = geometry.cell();
        let half = |vectors: &[usize]| -> Vector {
            let mut point = [0.0; 3];
            for &index in vectors {
                for (axis, value) in point.iter_mut().enumerate() {
                    *value += cell[index][axis];
                }
            }
            point.map(|value| value / 2.0)
        };

        let positions = vec![
            [0.0, 0.0, 0.0],
            half(&[0, 1, 2]),
            half(&[0, 1]),
            half(&[0, 2]),
            half(&[1, 2]),
        ];

        let symbols = [
            &composition.a,
            &composition.b,
            &composition.x,
            &composition.x,
            &composition.x,
        ]
        .into_iter()
        .cloned()
        .collect_vec();

        Self {
            symbols,
            positions,
            cell,
            pbc: [true; 3],
            calculator: None,
            energy: None,
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// chemical formula in reduced element-count form, e.g. `SnTiO3`
    pub fn formula(&self) -> String {
        self.symbols
            .iter()
            .dedup_with_count()
            .map(|(count, symbol)| match count {
                1 => symbol.clone(),
                count => format!("{symbol}{count}"),
            })
            .join("")
    }
}
