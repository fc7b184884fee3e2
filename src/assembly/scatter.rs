//! Insertion of dense local blocks into global accumulators.
//!
//! The functions here perform no index translation: row and column indices
//! are partition-local indices already resolved from a cell's dofmap. For
//! matrices, every targeted entry must exist in the accumulator's
//! preallocated sparsity pattern; a miss is a structural error that aborts
//! the assembly pass.

use crate::assembly::AssemblyError;
use itertools::izip;
use nalgebra::base::storage::Storage;
use nalgebra::{DMatrixView, DVectorView, DVectorViewMut, Dyn, Matrix, RealField, U1};
use nalgebra_sparse::csr::CsrRowMut;
use nalgebra_sparse::{CsrMatrix, SparseEntryMut};

/// Insertion semantics for scatter operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Accumulate into the existing entry. Assembly loops always add, since a
    /// dof touched by several cells sums all contributions.
    Add,
    /// Overwrite the existing entry.
    Set,
}

/// Inserts a dense block into a CSR matrix at the given row and column
/// indices.
///
/// `values` must have shape `rows.len() x cols.len()`. Any `(row, col)` pair
/// outside the matrix or its sparsity pattern fails with
/// [`AssemblyError::StructuralInsertion`].
///
/// # Panics
///
/// Panics if the shape of `values` does not match the index lists.
pub fn insert_csr<'a, T: RealField>(
    csr: &mut CsrMatrix<T>,
    rows: &[usize],
    cols: &[usize],
    values: impl Into<DMatrixView<'a, T>>,
    mode: InsertMode,
) -> Result<(), AssemblyError> {
    let values = values.into();
    assert_eq!(values.nrows(), rows.len(), "Value block shape must match row indices");
    assert_eq!(values.ncols(), cols.len(), "Value block shape must match column indices");

    for (&row, values_row) in izip!(rows, values.row_iter()) {
        for (&col, value) in izip!(cols, values_row.iter()) {
            match csr.get_entry_mut(row, col) {
                Some(SparseEntryMut::NonZero(entry)) => match mode {
                    InsertMode::Add => *entry += value.clone(),
                    InsertMode::Set => *entry = value.clone(),
                },
                _ => return Err(AssemblyError::StructuralInsertion { row, col }),
            }
        }
    }
    Ok(())
}

/// Inserts dense values into a vector at the given indices.
///
/// The vector contract mirrors [`insert_csr`] with a single index list; an
/// out-of-bounds index is reported as a structural error with `col == row`.
///
/// # Panics
///
/// Panics if `values` does not have the same length as `indices`.
pub fn insert_vector<'a, T: RealField>(
    vector: impl Into<DVectorViewMut<'a, T>>,
    indices: &[usize],
    values: impl Into<DVectorView<'a, T>>,
    mode: InsertMode,
) -> Result<(), AssemblyError> {
    let mut vector = vector.into();
    let values = values.into();
    assert_eq!(values.len(), indices.len(), "Value count must match index count");

    for (&index, value) in izip!(indices, values.iter()) {
        if index >= vector.len() {
            return Err(AssemblyError::StructuralInsertion {
                row: index,
                col: index,
            });
        }
        match mode {
            InsertMode::Add => vector[index] += value.clone(),
            InsertMode::Set => vector[index] = value.clone(),
        }
    }
    Ok(())
}

/// Adds one row of a local cell matrix to the corresponding row of a CSR
/// matrix.
///
/// `cell_dofs` are the cell's global dof indices and `sorted_permutation` the
/// cell-local indices ordered by ascending global index. Sorting lets the row
/// be scattered in a single forward walk over the CSR row's column indices
/// instead of one search per entry.
pub(crate) fn add_cell_row_to_csr_row<T, S>(
    row: &mut CsrRowMut<T>,
    cell_dofs: &[usize],
    sorted_permutation: &[usize],
    row_index: usize,
    local_row: &Matrix<T, U1, Dyn, S>,
) -> Result<(), AssemblyError>
where
    T: RealField,
    S: Storage<T, U1, Dyn>,
{
    assert_eq!(cell_dofs.len(), sorted_permutation.len());
    assert_eq!(cell_dofs.len(), local_row.ncols());

    let (col_indices, values) = row.cols_and_values_mut();
    let mut csr_col_iter = col_indices.iter().copied().enumerate();

    for &local_idx in sorted_permutation {
        let global_col = cell_dofs[local_idx];
        // The walk never backtracks, which is why the permutation must be
        // sorted by global index.
        match csr_col_iter.find(|(_, csr_col)| *csr_col == global_col) {
            Some((offset, _)) => values[offset] += local_row[local_idx].clone(),
            None => {
                return Err(AssemblyError::StructuralInsertion {
                    row: row_index,
                    col: global_col,
                })
            }
        }
    }
    Ok(())
}
