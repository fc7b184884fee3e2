//! Serial and data-parallel assembly loops and sparsity pattern construction.

use crate::assembly::local::{CellConnectivityAssembler, CellMatrixAssembler, CellVectorAssembler};
use crate::assembly::scatter::add_cell_row_to_csr_row;
use crate::assembly::AssemblyError;
use itertools::izip;
use log::debug;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut, RealField, Scalar};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use rayon::slice::ParallelSliceMut;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::marker::PhantomData;

/// A serial assembler for CSR matrices.
///
/// This is the reference loop strategy: owned cells are visited one by one in
/// ascending index order and their local tensors are added to the matrix
/// immediately. All members are buffers that prevent unnecessary allocations
/// when assembling multiple matrices with the same assembler.
#[derive(Debug, Clone)]
pub struct CsrAssembler<T: Scalar> {
    workspace: RefCell<CsrAssemblerWorkspace<T>>,
}

impl<T: Scalar> Default for CsrAssembler<T> {
    fn default() -> Self {
        Self {
            workspace: RefCell::new(CsrAssemblerWorkspace::default()),
        }
    }
}

#[derive(Debug, Clone)]
struct CsrAssemblerWorkspace<T: Scalar> {
    connectivity_permutation: Vec<usize>,
    cell_dofs: Vec<usize>,
    cell_matrix: DMatrix<T>,
}

impl<T: Scalar> Default for CsrAssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            connectivity_permutation: Vec::new(),
            cell_dofs: Vec::new(),
            cell_matrix: DMatrix::from_vec(0, 0, Vec::new()),
        }
    }
}

impl<T: Scalar> CsrAssembler<T> {
    /// Builds the sparsity pattern induced by the assembler's connectivity.
    ///
    /// The pattern contains an entry for every (row, col) pair any cell's
    /// local tensor can touch, which is exactly the precondition the assembly
    /// loops rely on. Entries are collected into a `BTreeSet`, trading some
    /// speed for storing each of the (possibly many) duplicate entries only
    /// once.
    pub fn assemble_pattern(&self, assembler: &(impl ?Sized + CellConnectivityAssembler)) -> SparsityPattern {
        let mut matrix_entries = BTreeSet::new();
        let mut cell_dofs = Vec::new();
        for cell in 0..assembler.num_cells() {
            cell_dofs.resize(assembler.cell_dof_count(cell), usize::MAX);
            assembler.populate_cell_dofs(&mut cell_dofs, cell);

            for dof_i in &cell_dofs {
                for dof_j in &cell_dofs {
                    matrix_entries.insert((*dof_i, *dof_j));
                }
            }
        }

        let num_rows = assembler.num_dofs();
        let mut offsets = Vec::with_capacity(num_rows + 1);
        let mut column_indices = Vec::with_capacity(matrix_entries.len());

        offsets.push(0);
        for (i, j) in matrix_entries {
            while i + 1 > offsets.len() {
                // This condition indicates that we have reached a new row. We need to run this
                // in a while loop to correctly handle consecutive empty rows
                offsets.push(column_indices.len());
            }
            column_indices.push(j);
        }

        // Make sure we fill out the remaining offsets if the last rows are empty
        while offsets.len() < num_rows + 1 {
            offsets.push(column_indices.len());
        }

        SparsityPattern::try_from_offsets_and_indices(num_rows, num_rows, offsets, column_indices)
            .expect("Internal error: Pattern data is valid by construction")
    }
}

impl<T: RealField> CsrAssembler<T> {
    /// Assembles the matrix into a freshly allocated CSR matrix whose pattern
    /// is derived from the assembler's connectivity.
    pub fn assemble(
        &self,
        assembler: &(impl ?Sized + CellMatrixAssembler<T>),
    ) -> Result<CsrMatrix<T>, AssemblyError> {
        let pattern = self.assemble_pattern(assembler);
        let initial_values = vec![T::zero(); pattern.nnz()];
        let mut matrix = CsrMatrix::try_from_pattern_and_values(pattern, initial_values)
            .expect("Internal error: Matrix values match pattern nnz by construction");
        self.assemble_into_csr(&mut matrix, assembler)?;
        Ok(matrix)
    }

    /// Assembles into an existing CSR matrix with `Add` semantics.
    ///
    /// The matrix's sparsity pattern must cover every entry any cell can
    /// produce; a miss aborts with
    /// [`AssemblyError::StructuralInsertion`]. On error the matrix contents
    /// are unspecified and must be discarded.
    pub fn assemble_into_csr(
        &self,
        csr: &mut CsrMatrix<T>,
        assembler: &(impl ?Sized + CellMatrixAssembler<T>),
    ) -> Result<(), AssemblyError> {
        assembler.validate_configuration()?;
        validate_accumulator_dims(csr.nrows(), csr.ncols(), assembler.num_dofs())?;
        debug!(
            "Assembling {} cells into {}x{} CSR matrix (nnz {})",
            assembler.num_cells(),
            csr.nrows(),
            csr.ncols(),
            csr.nnz()
        );

        // Reuse previously allocated buffers
        let ws = &mut *self.workspace.borrow_mut();
        let connectivity_permutation = &mut ws.connectivity_permutation;
        let cell_dofs = &mut ws.cell_dofs;
        let cell_matrix = &mut ws.cell_matrix;

        for cell in 0..assembler.num_cells() {
            let n = assembler.cell_dof_count(cell);

            cell_dofs.resize(n, 0);
            cell_matrix.resize_mut(n, n, T::zero());
            cell_matrix.fill(T::zero());

            assembler.assemble_cell_matrix_into(cell, DMatrixViewMut::from(&mut *cell_matrix))?;
            assembler.populate_cell_dofs(cell_dofs, cell);

            connectivity_permutation.clear();
            connectivity_permutation.extend(0..n);
            connectivity_permutation.sort_unstable_by_key(|i| cell_dofs[*i]);

            for (local_row_idx, global_row_idx) in cell_dofs.iter().enumerate() {
                let mut csr_row = csr.row_mut(*global_row_idx);
                let local_row = cell_matrix.row(local_row_idx);
                add_cell_row_to_csr_row(
                    &mut csr_row,
                    cell_dofs,
                    connectivity_permutation,
                    *global_row_idx,
                    &local_row,
                )?;
            }
        }

        Ok(())
    }
}

/// Scratch produced by one cell during a parallel tabulation phase.
#[derive(Debug)]
struct CellContribution<T: Scalar> {
    dofs: Vec<usize>,
    local: DMatrix<T>,
}

/// A parallel assembler for CSR matrices.
///
/// Cells are tabulated concurrently, each into its own disjoint scratch
/// storage, so no two workers ever write to shared accumulator entries. A
/// single-writer reduction pass then adds the contributions to the matrix in
/// ascending cell order. Up to summation-order rounding the result is
/// identical to [`CsrAssembler`]'s.
#[derive(Debug)]
pub struct CsrParAssembler<T: Scalar> {
    marker: PhantomData<fn() -> T>,
}

impl<T: Scalar> Default for CsrParAssembler<T> {
    fn default() -> Self {
        Self { marker: PhantomData }
    }
}

impl<T: Scalar> CsrParAssembler<T> {
    /// Parallel counterpart of [`CsrAssembler::assemble_pattern`]: per-cell
    /// entry coordinates are counted and sorted in parallel, then merged into
    /// offset/index arrays by a single thread.
    pub fn assemble_pattern<A>(&self, assembler: &A) -> SparsityPattern
    where
        A: ?Sized + Sync + CellConnectivityAssembler,
    {
        // Count number of (including duplicate) entries
        let num_total_entries: usize = (0..assembler.num_cells())
            .into_par_iter()
            .with_min_len(50)
            .map(|cell| {
                let n = assembler.cell_dof_count(cell);
                n * n
            })
            .sum();

        let mut coordinates = Vec::with_capacity(num_total_entries);
        let mut cell_dofs = Vec::new();
        for cell in 0..assembler.num_cells() {
            cell_dofs.resize(assembler.cell_dof_count(cell), 0);
            assembler.populate_cell_dofs(&mut cell_dofs, cell);

            for dof_i in &cell_dofs {
                for dof_j in &cell_dofs {
                    coordinates.push((*dof_i, *dof_j));
                }
            }
        }

        coordinates.par_sort_unstable();

        // TODO: Parallelize the merge phase as well; it is memory bound, but a single
        // thread probably cannot exhaust the available bandwidth on its own
        let num_rows = assembler.num_dofs();
        let mut row_offsets = Vec::with_capacity(num_rows + 1);
        let mut column_indices = Vec::new();
        row_offsets.push(0);

        let mut current_row = 0;
        let mut prev_col = None;

        for (i, j) in coordinates {
            assert!(i < num_rows, "Coordinates must be in bounds");

            while i > current_row {
                row_offsets.push(column_indices.len());
                current_row += 1;
                prev_col = None;
            }

            // Only add column if it is not a duplicate
            if Some(j) != prev_col {
                column_indices.push(j);
                prev_col = Some(j);
            }
        }

        // Fill out offsets for remaining empty rows
        for _ in current_row..num_rows {
            row_offsets.push(column_indices.len());
        }

        SparsityPattern::try_from_offsets_and_indices(num_rows, num_rows, row_offsets, column_indices)
            .expect("Internal error: Pattern data is valid by construction")
    }
}

impl<T: RealField + Send + Sync> CsrParAssembler<T> {
    /// Parallel counterpart of [`CsrAssembler::assemble`].
    pub fn assemble<A>(&self, assembler: &A) -> Result<CsrMatrix<T>, AssemblyError>
    where
        A: ?Sized + Sync + CellMatrixAssembler<T>,
    {
        let pattern = self.assemble_pattern(assembler);
        let initial_values = vec![T::zero(); pattern.nnz()];
        let mut matrix = CsrMatrix::try_from_pattern_and_values(pattern, initial_values)
            .expect("Internal error: Matrix values match pattern nnz by construction");
        self.assemble_into_csr(&mut matrix, assembler)?;
        Ok(matrix)
    }

    /// Assembles into an existing CSR matrix with `Add` semantics.
    ///
    /// The tabulation phase runs on the rayon thread pool and fails as a
    /// whole if any cell fails; the reduction phase is single threaded, so
    /// the accumulator is never written concurrently.
    pub fn assemble_into_csr<A>(&self, csr: &mut CsrMatrix<T>, assembler: &A) -> Result<(), AssemblyError>
    where
        A: ?Sized + Sync + CellMatrixAssembler<T>,
    {
        assembler.validate_configuration()?;
        validate_accumulator_dims(csr.nrows(), csr.ncols(), assembler.num_dofs())?;
        debug!(
            "Assembling {} cells into {}x{} CSR matrix (nnz {}) in parallel",
            assembler.num_cells(),
            csr.nrows(),
            csr.ncols(),
            csr.nnz()
        );

        // Tabulation phase: disjoint per-cell scratch, no shared writes
        let contributions: Vec<CellContribution<T>> = (0..assembler.num_cells())
            .into_par_iter()
            .map(|cell| {
                let n = assembler.cell_dof_count(cell);
                let mut dofs = vec![0; n];
                assembler.populate_cell_dofs(&mut dofs, cell);
                let mut local = DMatrix::zeros(n, n);
                assembler.assemble_cell_matrix_into(cell, DMatrixViewMut::from(&mut local))?;
                Ok(CellContribution { dofs, local })
            })
            .collect::<Result<_, AssemblyError>>()?;

        // Reduction phase: single writer, ascending cell order
        let mut connectivity_permutation = Vec::new();
        for contribution in &contributions {
            let dofs = &contribution.dofs;
            connectivity_permutation.clear();
            connectivity_permutation.extend(0..dofs.len());
            connectivity_permutation.sort_unstable_by_key(|i| dofs[*i]);

            for (local_row_idx, global_row_idx) in dofs.iter().enumerate() {
                let mut csr_row = csr.row_mut(*global_row_idx);
                let local_row = contribution.local.row(local_row_idx);
                add_cell_row_to_csr_row(
                    &mut csr_row,
                    dofs,
                    &connectivity_permutation,
                    *global_row_idx,
                    &local_row,
                )?;
            }
        }

        Ok(())
    }
}

/// A serial assembler for global vectors.
#[derive(Debug, Clone)]
pub struct VectorAssembler<T: Scalar> {
    workspace: RefCell<VectorAssemblerWorkspace<T>>,
}

impl<T: Scalar> Default for VectorAssembler<T> {
    fn default() -> Self {
        Self {
            workspace: RefCell::new(VectorAssemblerWorkspace::default()),
        }
    }
}

#[derive(Debug, Clone)]
struct VectorAssemblerWorkspace<T: Scalar> {
    cell_dofs: Vec<usize>,
    cell_vector: DVector<T>,
}

impl<T: Scalar> Default for VectorAssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            cell_dofs: Vec::new(),
            cell_vector: DVector::from_vec(Vec::new()),
        }
    }
}

impl<T: RealField> VectorAssembler<T> {
    pub fn assemble(
        &self,
        assembler: &(impl ?Sized + CellVectorAssembler<T>),
    ) -> Result<DVector<T>, AssemblyError> {
        let mut vector = DVector::zeros(assembler.num_dofs());
        self.assemble_into(&mut vector, assembler)?;
        Ok(vector)
    }

    /// Assembles into an existing vector with `Add` semantics.
    pub fn assemble_into<'a>(
        &self,
        vector: impl Into<DVectorViewMut<'a, T>>,
        assembler: &(impl ?Sized + CellVectorAssembler<T>),
    ) -> Result<(), AssemblyError> {
        let mut vector = vector.into();
        assembler.validate_configuration()?;
        validate_accumulator_dims(vector.len(), vector.len(), assembler.num_dofs())?;
        debug!(
            "Assembling {} cells into vector of length {}",
            assembler.num_cells(),
            vector.len()
        );

        let ws = &mut *self.workspace.borrow_mut();
        for cell in 0..assembler.num_cells() {
            let n = assembler.cell_dof_count(cell);
            ws.cell_dofs.resize(n, 0);
            ws.cell_vector.resize_vertically_mut(n, T::zero());
            ws.cell_vector.fill(T::zero());

            assembler.assemble_cell_vector_into(cell, DVectorViewMut::from(&mut ws.cell_vector))?;
            assembler.populate_cell_dofs(&mut ws.cell_dofs, cell);

            for (dof, value) in izip!(&ws.cell_dofs, ws.cell_vector.iter()) {
                vector[*dof] += value.clone();
            }
        }

        Ok(())
    }
}

/// A parallel assembler for global vectors.
///
/// Each rayon worker folds its share of the cell range into a private scratch
/// vector; the scratch vectors are then summed pairwise. Only associativity
/// of per-dof summation is relied upon, so the result matches
/// [`VectorAssembler`]'s up to summation-order rounding.
#[derive(Debug)]
pub struct ParVectorAssembler<T: Scalar> {
    marker: PhantomData<fn() -> T>,
}

impl<T: Scalar> Default for ParVectorAssembler<T> {
    fn default() -> Self {
        Self { marker: PhantomData }
    }
}

impl<T: RealField + Send + Sync> ParVectorAssembler<T> {
    pub fn assemble<A>(&self, assembler: &A) -> Result<DVector<T>, AssemblyError>
    where
        A: ?Sized + Sync + CellVectorAssembler<T>,
    {
        let mut vector = DVector::zeros(assembler.num_dofs());
        self.assemble_into(&mut vector, assembler)?;
        Ok(vector)
    }

    /// Assembles into an existing vector with `Add` semantics.
    pub fn assemble_into<'a, A>(
        &self,
        vector: impl Into<DVectorViewMut<'a, T>>,
        assembler: &A,
    ) -> Result<(), AssemblyError>
    where
        A: ?Sized + Sync + CellVectorAssembler<T>,
    {
        let mut vector = vector.into();
        assembler.validate_configuration()?;
        validate_accumulator_dims(vector.len(), vector.len(), assembler.num_dofs())?;
        debug!(
            "Assembling {} cells into vector of length {} in parallel",
            assembler.num_cells(),
            vector.len()
        );

        let num_dofs = assembler.num_dofs();
        let accumulated = (0..assembler.num_cells())
            .into_par_iter()
            .try_fold(
                || DVector::zeros(num_dofs),
                |mut scratch: DVector<T>, cell| {
                    let n = assembler.cell_dof_count(cell);
                    let mut dofs = vec![0; n];
                    assembler.populate_cell_dofs(&mut dofs, cell);
                    let mut local = DVector::zeros(n);
                    assembler.assemble_cell_vector_into(cell, DVectorViewMut::from(&mut local))?;
                    for (dof, value) in izip!(&dofs, local.iter()) {
                        scratch[*dof] += value.clone();
                    }
                    Ok(scratch)
                },
            )
            .try_reduce(
                || DVector::zeros(num_dofs),
                |mut left, right| {
                    left += right;
                    Ok(left)
                },
            )?;

        vector += accumulated;
        Ok(())
    }
}

fn validate_accumulator_dims(nrows: usize, ncols: usize, num_dofs: usize) -> Result<(), AssemblyError> {
    if nrows != num_dofs || ncols != num_dofs {
        return Err(AssemblyError::configuration(format!(
            "accumulator dimensions {nrows}x{ncols} do not match {num_dofs} dofs"
        )));
    }
    Ok(())
}
