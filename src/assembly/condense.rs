//! Element-level static condensation of local block systems.
//!
//! A mixed formulation produces a per-cell block system
//!
//! $$
//! \begin{pmatrix} A_{00} & A_{01} \\\\ A_{10} & 0 \end{pmatrix}
//! \begin{pmatrix} \sigma \\\\ u \end{pmatrix},
//! $$
//!
//! where the $A_{00}$ block couples only dofs internal to the cell. Since the
//! internal block has no inter-cell coupling, it can be eliminated *before*
//! global assembly, cell by cell, yielding the reduced tensor
//! $A = -A_{10} A_{00}^{-1} A_{01}$ over the retained dofs only. The global
//! matrix assembled from the reduced tensors is identical (up to rounding) to
//! assembling the full mixed system and eliminating the internal block
//! globally.

use crate::assembly::local::{
    validate_cell_data, CellConnectivityAssembler, CellMatrixAssembler, TabulationKernel,
};
use crate::assembly::AssemblyError;
use crate::dofmap::{Dofmap, IndexMap};
use crate::geometry::CellGeometry;
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use nalgebra::{DMatrix, DMatrixViewMut, RealField, Scalar};
use thiserror::Error;

/// Error returned when the eliminated block of a local system has no LU
/// solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("eliminated local block is singular")]
pub struct SingularBlockError;

/// Computes the condensed local tensor `output = -a10 * a00^{-1} * a01`.
///
/// The eliminated block `a00` is LU-factorized and `a00 X = a01` is solved as
/// a dense system; the inverse is never formed explicitly. Fails with
/// [`SingularBlockError`] if the factorization encounters a zero pivot.
///
/// # Panics
///
/// Panics if the block shapes are mutually inconsistent or if `output` does
/// not have the shape of the retained block (`a10.nrows() x a01.ncols()`).
pub fn condense_local_blocks<T: RealField>(
    a00: &DMatrix<T>,
    a01: &DMatrix<T>,
    a10: &DMatrix<T>,
    mut output: DMatrixViewMut<T>,
) -> Result<(), SingularBlockError> {
    assert_eq!(a00.nrows(), a00.ncols(), "Eliminated block must be square");
    assert_eq!(a01.nrows(), a00.nrows(), "Coupling block a01 must have a00's row count");
    assert_eq!(a10.ncols(), a00.ncols(), "Coupling block a10 must have a00's column count");
    assert_eq!(output.nrows(), a10.nrows(), "Output must have the retained block's shape");
    assert_eq!(output.ncols(), a01.ncols(), "Output must have the retained block's shape");

    let x = a00.clone().lu().solve(a01).ok_or(SingularBlockError)?;
    output.gemm(-T::one(), a10, &x, T::zero());
    Ok(())
}

define_thread_local_workspace!(WORKSPACE);

#[derive(Debug)]
struct CondenseWorkspace<T: Scalar> {
    cell_coordinates: Vec<T>,
    a00: DMatrix<T>,
    a01: DMatrix<T>,
    a10: DMatrix<T>,
}

impl<T: RealField> Default for CondenseWorkspace<T> {
    fn default() -> Self {
        Self {
            cell_coordinates: Vec::new(),
            a00: DMatrix::zeros(0, 0),
            a01: DMatrix::zeros(0, 0),
            a10: DMatrix::zeros(0, 0),
        }
    }
}

/// A cell assembler that produces statically condensed local tensors from
/// three block kernels.
///
/// `kernel00` tabulates the eliminated `s x s` block, `kernel01` and
/// `kernel10` the `s x u` and `u x s` coupling blocks, where `u` is the
/// dofs-per-cell of the retained space's dofmap. Each cell's blocks are
/// tabulated into zeroed scratch buffers and reduced with
/// [`condense_local_blocks`]; a singular eliminated block aborts the pass
/// with [`AssemblyError::SingularLocalSystem`], since condensation is only
/// defined when every cell's internal block is invertible.
///
/// The dofmap describes the *retained* space only; the eliminated dofs never
/// reach the global accumulator and need no global indices at all.
#[derive(Debug, Clone)]
pub struct SchurCondensedAssembler<'a, T: Scalar, K00, K01, K10> {
    kernel00: K00,
    kernel01: K01,
    kernel10: K10,
    dofmap: &'a Dofmap,
    geometry: &'a CellGeometry<T>,
    coefficients: &'a [T],
    coefficient_stride: usize,
    constants: &'a [T],
    cell_permutations: &'a [u8],
    cell_ownership: Option<&'a IndexMap>,
}

impl<'a, T: Scalar, K00, K01, K10> SchurCondensedAssembler<'a, T, K00, K01, K10> {
    pub fn new(
        kernel00: K00,
        kernel01: K01,
        kernel10: K10,
        dofmap: &'a Dofmap,
        geometry: &'a CellGeometry<T>,
    ) -> Self {
        Self {
            kernel00,
            kernel01,
            kernel10,
            dofmap,
            geometry,
            coefficients: &[],
            coefficient_stride: 0,
            constants: &[],
            cell_permutations: &[],
            cell_ownership: None,
        }
    }

    /// Attach a packed per-cell coefficient array shared by all three
    /// kernels. Cell `c` reads `coefficients[c * stride .. (c + 1) * stride]`.
    pub fn with_coefficients(self, coefficients: &'a [T], stride: usize) -> Self {
        Self {
            coefficients,
            coefficient_stride: stride,
            ..self
        }
    }

    pub fn with_constants(self, constants: &'a [T]) -> Self {
        Self { constants, ..self }
    }

    /// Attach one orientation byte per cell.
    pub fn with_cell_permutations(self, cell_permutations: &'a [u8]) -> Self {
        Self {
            cell_permutations,
            ..self
        }
    }

    /// Bound the assembly loop to the owned cells of the given cell index
    /// map.
    pub fn with_cell_ownership(self, cell_ownership: &'a IndexMap) -> Self {
        Self {
            cell_ownership: Some(cell_ownership),
            ..self
        }
    }

    fn cell_coefficients(&self, cell: usize) -> &[T] {
        let stride = self.coefficient_stride;
        &self.coefficients[cell * stride..(cell + 1) * stride]
    }

    fn cell_permutation(&self, cell: usize) -> &[u8] {
        if self.cell_permutations.is_empty() {
            &[]
        } else {
            &self.cell_permutations[cell..cell + 1]
        }
    }
}

impl<'a, T, K00, K01, K10> CellConnectivityAssembler for SchurCondensedAssembler<'a, T, K00, K01, K10>
where
    T: Scalar,
    K00: TabulationKernel<T>,
    K01: TabulationKernel<T>,
    K10: TabulationKernel<T>,
{
    fn num_cells(&self) -> usize {
        match self.cell_ownership {
            Some(ownership) => ownership.num_owned(),
            None => self.dofmap.num_cells(),
        }
    }

    fn num_dofs(&self) -> usize {
        self.dofmap.num_dofs()
    }

    fn cell_dof_count(&self, _cell: usize) -> usize {
        self.dofmap.dofs_per_cell()
    }

    fn populate_cell_dofs(&self, output: &mut [usize], cell: usize) {
        output.copy_from_slice(self.dofmap.cell_dofs(cell));
    }

    fn validate_configuration(&self) -> Result<(), AssemblyError> {
        let u = self.dofmap.dofs_per_cell();
        let (s0, s1) = self.kernel00.tensor_shape();
        if s0 != s1 {
            return Err(AssemblyError::configuration(format!(
                "eliminated block kernel has non-square shape {s0}x{s1}"
            )));
        }
        let s = s0;
        if self.kernel01.tensor_shape() != (s, u) {
            let (r, c) = self.kernel01.tensor_shape();
            return Err(AssemblyError::configuration(format!(
                "coupling kernel a01 has shape {r}x{c}, expected {s}x{u}"
            )));
        }
        if self.kernel10.tensor_shape() != (u, s) {
            let (r, c) = self.kernel10.tensor_shape();
            return Err(AssemblyError::configuration(format!(
                "coupling kernel a10 has shape {r}x{c}, expected {u}x{s}"
            )));
        }
        validate_cell_data(
            self.dofmap,
            self.geometry,
            self.coefficients.len(),
            self.coefficient_stride,
            self.cell_permutations.len(),
            self.cell_ownership,
        )
    }
}

impl<'a, T, K00, K01, K10> CellMatrixAssembler<T> for SchurCondensedAssembler<'a, T, K00, K01, K10>
where
    T: RealField,
    K00: TabulationKernel<T>,
    K01: TabulationKernel<T>,
    K10: TabulationKernel<T>,
{
    fn assemble_cell_matrix_into(&self, cell: usize, output: DMatrixViewMut<T>) -> Result<(), AssemblyError> {
        let (s, _) = self.kernel00.tensor_shape();
        let u = self.dofmap.dofs_per_cell();

        with_thread_local_workspace(&WORKSPACE, |ws: &mut CondenseWorkspace<T>| {
            ws.cell_coordinates
                .resize(self.geometry.coordinate_buffer_len(), T::zero());
            self.geometry
                .populate_cell_coordinates(&mut ws.cell_coordinates, cell);

            let coefficients = self.cell_coefficients(cell);
            let permutation = self.cell_permutation(cell);

            tabulate_block(
                &self.kernel00,
                &mut ws.a00,
                (s, s),
                coefficients,
                self.constants,
                &ws.cell_coordinates,
                permutation,
            );
            tabulate_block(
                &self.kernel01,
                &mut ws.a01,
                (s, u),
                coefficients,
                self.constants,
                &ws.cell_coordinates,
                permutation,
            );
            tabulate_block(
                &self.kernel10,
                &mut ws.a10,
                (u, s),
                coefficients,
                self.constants,
                &ws.cell_coordinates,
                permutation,
            );

            condense_local_blocks(&ws.a00, &ws.a01, &ws.a10, output)
                .map_err(|SingularBlockError| AssemblyError::SingularLocalSystem { cell })
        })
    }
}

fn tabulate_block<T: RealField>(
    kernel: &impl TabulationKernel<T>,
    block: &mut DMatrix<T>,
    shape: (usize, usize),
    coefficients: &[T],
    constants: &[T],
    coordinates: &[T],
    cell_permutations: &[u8],
) {
    block.resize_mut(shape.0, shape.1, T::zero());
    block.fill(T::zero());
    kernel.tabulate(
        block.as_mut_slice(),
        coefficients,
        constants,
        coordinates,
        0,
        cell_permutations,
    );
}
