use crate::{
    structure::{Composition, Geometry},
    ticket::InitialState,
};
use itertools::Itertools;
use std::{fs, io, path::Path};
use thiserror::Error;
use tracing::{debug, info};

/// columns read from the candidate table, element symbols followed by the two radii
pub const COLUMNS: [&str; 5] = ["A", "B", "X", "RA", "RC"];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Failed to read table")]
    Io(#[from] io::Error),
    #[error("Table has no header")]
    Empty,
    #[error("Table is missing column(s) {0}")]
    MissingColumns(String),
    #[error("Row {row} is malformed: {reason}")]
    Malformed { row: usize, reason: String },
}

/// One row of the sweep: what to compute and where its structure comes from
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// row index in file order, starting at 0
    pub index: usize,
    pub composition: Composition,
    pub initial: InitialState,
}

/// Work items from a comma separated candidate table.
///
/// The lattice constant estimate of a row is `RA + RC`. Quoting is not supported.
#[derive(Debug)]
pub struct TableCollector {
    items: std::vec::IntoIter<WorkItem>,
}

impl TableCollector {
    /// read `path` and skip the first `offset` rows
    pub fn load(path: &Path, offset: usize) -> Result<Self, TableError> {
        let contents = fs::read_to_string(path)?;
        let collector = Self::parse(&contents, offset)?;

        info!(path = ?path, offset = offset, rows = collector.len(), "Loaded table");

        Ok(collector)
    }

    pub fn parse(contents: &str, offset: usize) -> Result<Self, TableError> {
        let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
        let header = lines.next().ok_or(TableError::Empty)?;
        let header = header.split(',').map(str::trim).collect_vec();

        let mut positions = [0; COLUMNS.len()];
        let mut missing = Vec::new();
        for (position, column) in positions.iter_mut().zip(COLUMNS) {
            match header.iter().position(|name| *name == column) {
                Some(index) => *position = index,
                None => missing.push(column),
            }
        }
        if !missing.is_empty() {
            return Err(TableError::MissingColumns(missing.into_iter().join(", ")));
        }

        let items = lines
            .enumerate()
            .skip(offset)
            .map(|(row, line)| Self::parse_row(row, line, &positions))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(rows = items.len(), "Parsed table rows");

        Ok(Self {
            items: items.into_iter(),
        })
    }

    fn parse_row(
        row: usize,
        line: &str,
        positions: &[usize; COLUMNS.len()],
    ) -> Result<WorkItem, TableError> {
        let fields = line.split(',').map(str::trim).collect_vec();
        let field = |column: usize| {
            fields
                .get(positions[column])
                .copied()
                .filter(|value| !value.is_empty())
                .ok_or_else(|| TableError::Malformed {
                    row,
                    reason: format!("missing value for {}", COLUMNS[column]),
                })
        };
        let radius = |column: usize| -> Result<f64, TableError> {
            field(column)?
                .parse::<f64>()
                .map_err(|error| TableError::Malformed {
                    row,
                    reason: format!("{} is not a number: {error}", COLUMNS[column]),
                })
        };

        Ok(WorkItem {
            index: row,
            composition: Composition::new(field(0)?, field(1)?, field(2)?),
            initial: InitialState::Geometry(Geometry::Cubic(radius(3)? + radius(4)?)),
        })
    }
}

impl Iterator for TableCollector {
    type Item = WorkItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for TableCollector {}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "index,A,B,X,RA,RC
0,Sn,Ti,O,1.1,1.9
1,Ba,Zr,S,1.5,2.0

2,Cs,Pb,I,1.75,2.25
";

    #[test]
    fn rows_become_work_items() {
        let items = TableCollector::parse(TABLE, 0).unwrap().collect_vec();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].composition, Composition::new("Sn", "Ti", "O"));
        assert_eq!(
            items[0].initial,
            InitialState::Geometry(Geometry::Cubic(1.1 + 1.9))
        );
        assert_eq!(items[2].index, 2);
        assert_eq!(items[2].composition.formula(), "CsPbI3");
    }

    #[test]
    fn offset_skips_leading_rows() {
        let items = TableCollector::parse(TABLE, 2).unwrap().collect_vec();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].index, 2);
        assert!(TableCollector::parse(TABLE, 10).unwrap().next().is_none());
    }

    #[test]
    fn missing_columns_and_bad_numbers_are_reported() {
        assert!(matches!(
            TableCollector::parse("A,B,X,RA\nSn,Ti,O,1.0\n", 0),
            Err(TableError::MissingColumns(columns)) if columns == "RC"
        ));
        assert!(matches!(
            TableCollector::parse("A,B,X,RA,RC\nSn,Ti,O,one,2.0\n", 0),
            Err(TableError::Malformed { row: 0, .. })
        ));
        assert!(matches!(TableCollector::parse("", 0), Err(TableError::Empty)));
    }
}
