//! Local tensor providers: tabulation kernels and kernel-backed cell assemblers.

use crate::assembly::AssemblyError;
use crate::dofmap::{Dofmap, IndexMap};
use crate::geometry::CellGeometry;
use davenport::{define_thread_local_workspace, with_thread_local_workspace};
use nalgebra::{DMatrix, DMatrixViewMut, DVectorViewMut, RealField, Scalar};

/// Trait for assemblers that can report cell-to-dof connectivity.
///
/// This is the read-only half of an assembler: it describes which cells a
/// loop iterates over and which global (partition-local) dofs each cell
/// touches, without producing any values.
pub trait CellConnectivityAssembler {
    /// The number of cells an assembly loop visits, in ascending index order.
    fn num_cells(&self) -> usize;

    /// The total number of partition-local dofs, i.e. the dimension of the
    /// global accumulator.
    fn num_dofs(&self) -> usize;

    fn cell_dof_count(&self, cell: usize) -> usize;

    /// Populate `output` with the dofs of the given cell.
    ///
    /// # Panics
    ///
    /// Panics if `output.len() != self.cell_dof_count(cell)`.
    fn populate_cell_dofs(&self, output: &mut [usize], cell: usize);

    /// Check invariants that must hold before a per-cell loop may start.
    ///
    /// Assembly loops call this exactly once per pass, so shape or size
    /// mismatches are reported before any cell is visited rather than
    /// per cell.
    fn validate_configuration(&self) -> Result<(), AssemblyError> {
        Ok(())
    }
}

/// Trait for assemblers that produce a square dense matrix per cell.
pub trait CellMatrixAssembler<T: Scalar>: CellConnectivityAssembler {
    /// Assemble the local matrix of the given cell into `output`.
    ///
    /// `output` has shape `n x n` with `n = self.cell_dof_count(cell)` and is
    /// zeroed by the caller.
    fn assemble_cell_matrix_into(&self, cell: usize, output: DMatrixViewMut<T>) -> Result<(), AssemblyError>;
}

/// Trait for assemblers that produce a dense vector per cell.
pub trait CellVectorAssembler<T: Scalar>: CellConnectivityAssembler {
    /// Assemble the local vector of the given cell into `output`.
    ///
    /// `output` has length `self.cell_dof_count(cell)` and is zeroed by the
    /// caller.
    fn assemble_cell_vector_into(&self, cell: usize, output: DVectorViewMut<T>) -> Result<(), AssemblyError>;
}

/// A tabulation kernel bound to a single variational form.
///
/// A kernel writes the local tensor of one cell into a caller-owned buffer,
/// given packed per-cell data. It must be a pure function of its arguments:
/// deterministic, writing every entry it owns and nothing else. The scalar
/// type is fixed by the `T` parameter, so a scalar mismatch between kernel
/// and buffers is a compile error rather than a runtime condition.
pub trait TabulationKernel<T: Scalar> {
    /// The `(nrows, ncols)` shape of the tensor this kernel writes. Vector
    /// kernels report `(n, 1)`.
    fn tensor_shape(&self) -> (usize, usize);

    /// Tabulate the local tensor into `output`.
    ///
    /// `output` is a zeroed column-major buffer of exactly
    /// `nrows * ncols` elements. `coefficients` and `constants` hold
    /// externally precomputed form data, `coordinates` the cell's packed
    /// point coordinates (see
    /// [`CellGeometry::populate_cell_coordinates`]). `entity_local_index`
    /// identifies the sub-entity for facet-like integrals and is `0` for
    /// cell integrals; `cell_permutations` carries orientation bytes for
    /// meshes with mixed cell orientations and is empty when unused.
    fn tabulate(
        &self,
        output: &mut [T],
        coefficients: &[T],
        constants: &[T],
        coordinates: &[T],
        entity_local_index: u32,
        cell_permutations: &[u8],
    );
}

/// Adapter that lifts a closure with the tabulation signature into a
/// [`TabulationKernel`].
#[derive(Debug, Clone)]
pub struct KernelFn<F> {
    shape: (usize, usize),
    function: F,
}

impl<F> KernelFn<F> {
    pub fn new(shape: (usize, usize), function: F) -> Self {
        Self { shape, function }
    }
}

impl<T, F> TabulationKernel<T> for KernelFn<F>
where
    T: Scalar,
    F: Fn(&mut [T], &[T], &[T], &[T], u32, &[u8]),
{
    fn tensor_shape(&self) -> (usize, usize) {
        self.shape
    }

    fn tabulate(
        &self,
        output: &mut [T],
        coefficients: &[T],
        constants: &[T],
        coordinates: &[T],
        entity_local_index: u32,
        cell_permutations: &[u8],
    ) {
        (self.function)(
            output,
            coefficients,
            constants,
            coordinates,
            entity_local_index,
            cell_permutations,
        )
    }
}

define_thread_local_workspace!(WORKSPACE);

#[derive(Debug)]
struct KernelWorkspace<T: Scalar> {
    cell_coordinates: Vec<T>,
    local_tensor: DMatrix<T>,
}

impl<T: RealField> Default for KernelWorkspace<T> {
    fn default() -> Self {
        Self {
            cell_coordinates: Vec::new(),
            local_tensor: DMatrix::zeros(0, 0),
        }
    }
}

/// A cell assembler that obtains local tensors by invoking a tabulation
/// kernel with packed per-cell data.
///
/// The assembler binds one kernel to a dofmap, a geometry, a per-cell
/// coefficient array with fixed stride, a shared constants array, and
/// optional per-cell orientation bytes. It implements
/// [`CellMatrixAssembler`] for `n x n` kernels and [`CellVectorAssembler`]
/// for `n x 1` kernels, where `n` is the dofs-per-cell of the dofmap.
///
/// By default all cells of the dofmap are assembled; with
/// [`with_cell_ownership`](Self::with_cell_ownership) the loop is bounded to
/// the owned prefix of a cell index map, leaving ghost cells to the
/// partitions that own them.
#[derive(Debug, Clone)]
pub struct KernelCellAssembler<'a, T: Scalar, K> {
    kernel: K,
    dofmap: &'a Dofmap,
    geometry: &'a CellGeometry<T>,
    coefficients: &'a [T],
    coefficient_stride: usize,
    constants: &'a [T],
    cell_permutations: &'a [u8],
    cell_ownership: Option<&'a IndexMap>,
}

impl<'a, T: Scalar, K> KernelCellAssembler<'a, T, K> {
    pub fn new(kernel: K, dofmap: &'a Dofmap, geometry: &'a CellGeometry<T>) -> Self {
        Self {
            kernel,
            dofmap,
            geometry,
            coefficients: &[],
            coefficient_stride: 0,
            constants: &[],
            cell_permutations: &[],
            cell_ownership: None,
        }
    }

    /// Attach a packed per-cell coefficient array. Cell `c` reads
    /// `coefficients[c * stride .. (c + 1) * stride]`.
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
    /// map. The map's local size must match the dofmap's cell count.
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

impl<'a, T, K> CellConnectivityAssembler for KernelCellAssembler<'a, T, K>
where
    T: Scalar,
    K: TabulationKernel<T>,
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
        let n = self.dofmap.dofs_per_cell();
        let (nrows, ncols) = self.kernel.tensor_shape();
        if nrows != n || (ncols != n && ncols != 1) {
            return Err(AssemblyError::configuration(format!(
                "kernel tensor shape {nrows}x{ncols} does not match {n} dofs per cell"
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

impl<'a, T, K> CellMatrixAssembler<T> for KernelCellAssembler<'a, T, K>
where
    T: RealField,
    K: TabulationKernel<T>,
{
    fn assemble_cell_matrix_into(&self, cell: usize, mut output: DMatrixViewMut<T>) -> Result<(), AssemblyError> {
        let (nrows, ncols) = self.kernel.tensor_shape();
        if (output.nrows(), output.ncols()) != (nrows, ncols) {
            return Err(AssemblyError::configuration(format!(
                "kernel tensor shape {nrows}x{ncols} does not match output shape {}x{}",
                output.nrows(),
                output.ncols()
            )));
        }
        with_thread_local_workspace(&WORKSPACE, |ws: &mut KernelWorkspace<T>| {
            self.tabulate_into_workspace(ws, cell);
            output.copy_from(&ws.local_tensor);
            Ok(())
        })
    }
}

impl<'a, T, K> CellVectorAssembler<T> for KernelCellAssembler<'a, T, K>
where
    T: RealField,
    K: TabulationKernel<T>,
{
    fn assemble_cell_vector_into(&self, cell: usize, mut output: DVectorViewMut<T>) -> Result<(), AssemblyError> {
        let (nrows, ncols) = self.kernel.tensor_shape();
        if ncols != 1 || output.len() != nrows {
            return Err(AssemblyError::configuration(format!(
                "kernel tensor shape {nrows}x{ncols} is not a vector of length {}",
                output.len()
            )));
        }
        with_thread_local_workspace(&WORKSPACE, |ws: &mut KernelWorkspace<T>| {
            self.tabulate_into_workspace(ws, cell);
            output.copy_from(&ws.local_tensor.column(0));
            Ok(())
        })
    }
}

impl<'a, T, K> KernelCellAssembler<'a, T, K>
where
    T: RealField,
    K: TabulationKernel<T>,
{
    fn tabulate_into_workspace(&self, ws: &mut KernelWorkspace<T>, cell: usize) {
        let (nrows, ncols) = self.kernel.tensor_shape();
        ws.cell_coordinates
            .resize(self.geometry.coordinate_buffer_len(), T::zero());
        self.geometry
            .populate_cell_coordinates(&mut ws.cell_coordinates, cell);
        ws.local_tensor.resize_mut(nrows, ncols, T::zero());
        ws.local_tensor.fill(T::zero());
        self.kernel.tabulate(
            ws.local_tensor.as_mut_slice(),
            self.cell_coefficients(cell),
            self.constants,
            &ws.cell_coordinates,
            0,
            self.cell_permutation(cell),
        );
    }
}

/// Shared setup validation for kernel-backed assemblers.
pub(crate) fn validate_cell_data<T: Scalar>(
    dofmap: &Dofmap,
    geometry: &CellGeometry<T>,
    num_coefficients: usize,
    coefficient_stride: usize,
    num_permutations: usize,
    cell_ownership: Option<&IndexMap>,
) -> Result<(), AssemblyError> {
    let num_cells = dofmap.num_cells();
    if geometry.num_cells() != num_cells {
        return Err(AssemblyError::configuration(format!(
            "geometry has {} cells but the dofmap has {num_cells}",
            geometry.num_cells()
        )));
    }
    if num_coefficients != coefficient_stride * num_cells {
        return Err(AssemblyError::configuration(format!(
            "coefficient array has length {num_coefficients}, expected stride {coefficient_stride} x {num_cells} cells"
        )));
    }
    if num_permutations != 0 && num_permutations != num_cells {
        return Err(AssemblyError::configuration(format!(
            "permutation array has length {num_permutations}, expected 0 or {num_cells}"
        )));
    }
    if let Some(ownership) = cell_ownership {
        if ownership.num_local() != num_cells {
            return Err(AssemblyError::configuration(format!(
                "cell index map covers {} local cells but the dofmap has {num_cells}",
                ownership.num_local()
            )));
        }
    }
    Ok(())
}
