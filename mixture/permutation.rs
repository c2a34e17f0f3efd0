//! The group action over the `P` views of every sample.
//!
//! Entry `(shift, target)` names the view that is compared against mean block
//! `shift` when a component is tested in alignment `target`. The default table is
//! the cyclic group, `(shift + target) mod P`.

use crate::config::ConfigError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// How the permutation structure is specified in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermutationSpec {
    /// `P` views related by cyclic shifts.
    Cyclic(usize),
    /// An explicit `P × P` table, one row per shift.
    Table(Vec<Vec<usize>>),
}

impl Default for PermutationSpec {
    fn default() -> Self {
        PermutationSpec::Cyclic(1)
    }
}

/// Validated, immutable `P × P` permutation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationTable {
    table: Array2<usize>,
}

impl PermutationTable {
    pub fn cyclic(n_permutations: usize) -> Result<Self, ConfigError> {
        if n_permutations == 0 {
            return Err(ConfigError::EmptyPermutationTable);
        }
        let table = Array2::from_shape_fn((n_permutations, n_permutations), |(shift, target)| {
            (shift + target) % n_permutations
        });
        Ok(Self { table })
    }

    pub fn from_table(table: Array2<usize>) -> Result<Self, ConfigError> {
        let (rows, cols) = table.dim();
        if rows == 0 {
            return Err(ConfigError::EmptyPermutationTable);
        }
        if rows != cols {
            return Err(ConfigError::NonSquarePermutationTable { rows, cols });
        }
        if let Some(((shift, target), &value)) = table.indexed_iter().find(|(_, v)| **v >= rows)
        {
            return Err(ConfigError::PermutationIndexOutOfRange {
                shift,
                target,
                value,
                size: rows,
            });
        }
        Ok(Self { table })
    }

    pub fn from_spec(spec: &PermutationSpec) -> Result<Self, ConfigError> {
        match spec {
            PermutationSpec::Cyclic(p) => Self::cyclic(*p),
            PermutationSpec::Table(rows) => {
                let size = rows.len();
                if let Some(bad) = rows.iter().find(|row| row.len() != size) {
                    return Err(ConfigError::NonSquarePermutationTable {
                        rows: size,
                        cols: bad.len(),
                    });
                }
                let flat: Vec<usize> = rows.iter().flatten().copied().collect();
                let table = Array2::from_shape_vec((size, size), flat)
                    .map_err(|_| ConfigError::EmptyPermutationTable)?;
                Self::from_table(table)
            }
        }
    }

    /// Number of views `P`.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// View index to compare against mean block `shift` under alignment `target`.
    #[inline]
    pub fn source(&self, shift: usize, target: usize) -> usize {
        self.table[(shift, target)]
    }
}
