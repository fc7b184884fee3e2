//! Element-local static condensation and custom assembly for finite element computations.
//!
//! The crate implements the local-to-global half of a finite element pipeline:
//! per-cell tensors are tabulated by pluggable kernels
//! ([`TabulationKernel`](crate::assembly::local::TabulationKernel)),
//! optionally reduced by element-level static condensation
//! ([`assembly::condense`]), and scattered into a preallocated sparse
//! accumulator by serial or data-parallel assembly loops
//! ([`assembly::global`]).
//!
//! Mesh construction, basis tabulation, boundary conditions and linear solvers
//! are deliberately out of scope: cells enter the crate as plain indices with
//! associated dof lists ([`dofmap::Dofmap`]) and packed coordinates
//! ([`geometry::CellGeometry`]), and leave it as dense blocks added to a
//! `nalgebra_sparse` CSR matrix or a dense vector.

pub mod assembly;
pub mod dofmap;
pub mod geometry;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
