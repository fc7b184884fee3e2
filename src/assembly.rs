//! Assembly of per-cell local tensors into global matrices and vectors.
//!
//! The submodules follow the data flow of an assembly pass: [`local`]
//! produces dense cell tensors from tabulation kernels, [`condense`] reduces
//! local block systems by Schur-complement elimination, [`scatter`] inserts
//! dense blocks into the global accumulator, and [`global`] ties the three
//! together in serial and data-parallel per-cell loops.

pub mod condense;
pub mod global;
pub mod local;
pub mod scatter;

use thiserror::Error;

/// Error produced by a failed assembly pass.
///
/// All variants are deterministic functions of the inputs, so no failure is
/// ever retried. A pass aborts on the first error; whatever has been written
/// to the accumulator up to that point is unspecified and must be discarded
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    /// The assembler's kernels, buffers and index maps are mutually
    /// inconsistent. Detected once at the start of a pass, before any cell is
    /// visited.
    #[error("invalid assembly configuration: {reason}")]
    Configuration { reason: String },
    /// The eliminated block of the given cell's local system is singular, so
    /// static condensation is not defined for this assembly pass.
    #[error("local block system of cell {cell} is singular")]
    SingularLocalSystem { cell: usize },
    /// An insertion targeted an entry outside the preallocated sparsity
    /// pattern. The pattern must cover every entry any local tensor can
    /// produce; a miss indicates a structurally wrong pattern. For vector
    /// insertions `col` equals `row`.
    #[error("matrix entry ({row}, {col}) is not part of the sparsity pattern")]
    StructuralInsertion { row: usize, col: usize },
}

impl AssemblyError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }
}
