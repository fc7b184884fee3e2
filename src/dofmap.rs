//! Cell-to-dof index resolution and distributed ownership bookkeeping.

/// A mapping from cells to their partition-local degree-of-freedom indices.
///
/// The number of dofs per cell is fixed across the map, so the dofs of a cell
/// are always a contiguous slice of the flattened index array. All indices are
/// *local to the partition*; translation to process-global indices is the
/// concern of the distributed accumulator, not of this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dofmap {
    cell_dofs: Vec<usize>,
    dofs_per_cell: usize,
    num_dofs: usize,
}

impl Dofmap {
    /// Constructs a dofmap from a flattened per-cell index array.
    ///
    /// `cell_dofs` stores the dofs of cell `c` at
    /// `[c * dofs_per_cell, (c + 1) * dofs_per_cell)`.
    ///
    /// # Panics
    ///
    /// Panics if `dofs_per_cell` is zero, if the flattened array length is not
    /// a multiple of `dofs_per_cell`, if any index is out of bounds with
    /// respect to `num_dofs`, or if a cell references the same dof twice.
    /// A malformed dofmap is a bug in the caller, not a recoverable assembly
    /// condition.
    pub fn from_cell_dofs(num_dofs: usize, dofs_per_cell: usize, cell_dofs: Vec<usize>) -> Self {
        assert!(dofs_per_cell > 0, "Dofmap must have at least one dof per cell");
        assert_eq!(
            cell_dofs.len() % dofs_per_cell,
            0,
            "Flattened dof array length must be a multiple of dofs_per_cell"
        );
        assert!(
            cell_dofs.iter().all(|dof| *dof < num_dofs),
            "Dof indices must be in bounds"
        );
        for cell in cell_dofs.chunks_exact(dofs_per_cell) {
            for (k, dof) in cell.iter().enumerate() {
                assert!(
                    !cell[k + 1..].contains(dof),
                    "A cell must not reference the same dof twice"
                );
            }
        }
        Self {
            cell_dofs,
            dofs_per_cell,
            num_dofs,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.cell_dofs.len() / self.dofs_per_cell
    }

    pub fn dofs_per_cell(&self) -> usize {
        self.dofs_per_cell
    }

    /// The total number of partition-local dofs, including ghosted ones.
    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    /// The dofs of the given cell, in cell-local order.
    ///
    /// # Panics
    ///
    /// Panics if `cell` is out of bounds.
    pub fn cell_dofs(&self, cell: usize) -> &[usize] {
        let start = cell * self.dofs_per_cell;
        &self.cell_dofs[start..start + self.dofs_per_cell]
    }
}

/// Ownership information for a partition-local index range.
///
/// The local range is laid out as `[0, num_owned)` for indices owned by this
/// partition followed by `[num_owned, num_local)` for indices ghosted from
/// neighboring partitions. The ghost list stores the *global* index of each
/// ghosted entry, in local order.
///
/// The index map is consulted once at assembly setup to bound iteration and
/// size buffers; it is never re-queried per cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMap {
    num_owned: usize,
    ghosts: Vec<usize>,
}

impl IndexMap {
    pub fn new(num_owned: usize, ghosts: Vec<usize>) -> Self {
        Self { num_owned, ghosts }
    }

    pub fn num_owned(&self) -> usize {
        self.num_owned
    }

    pub fn num_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    pub fn num_local(&self) -> usize {
        self.num_owned + self.ghosts.len()
    }

    /// Global indices of the ghosted tail of the local range.
    pub fn ghosts(&self) -> &[usize] {
        &self.ghosts
    }

    pub fn is_owned(&self, local_index: usize) -> bool {
        local_index < self.num_owned
    }
}
