use super::{dg_dofmap, unit_square_geometry};
use matrixcompare::assert_matrix_eq;
use nalgebra::DMatrix;
use skoll::assembly::global::CsrAssembler;
use skoll::assembly::local::{CellConnectivityAssembler, KernelCellAssembler, KernelFn};
use skoll::assembly::AssemblyError;
use skoll::dofmap::IndexMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn kernel_receives_zeroed_buffer_and_cell_coordinates() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();

    // The second triangle is [1, 3, 2], so its packed coordinates are the
    // vertices in exactly that order.
    let expected_coords = [1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
    let kernel = KernelFn::new(
        (3, 3),
        move |output: &mut [f64], _w: &[f64], _c: &[f64], coords: &[f64], entity: u32, perm: &[u8]| {
            assert!(output.iter().all(|v| *v == 0.0), "output buffer must be zeroed");
            assert_eq!(entity, 0);
            assert!(perm.is_empty());
            if coords == expected_coords.as_slice() {
                output[0] = 1.0;
            }
        },
    );
    let assembler = KernelCellAssembler::new(kernel, &dofmap, &geometry);
    let matrix = CsrAssembler::default().assemble(&assembler).unwrap();

    // Only the second cell matches the expected coordinates, and its first
    // dof is global index 3.
    let dense = DMatrix::from(&matrix);
    assert_eq!(dense[(3, 3)], 1.0);
    assert_eq!(dense.sum(), 1.0);
}

#[test]
fn coefficients_and_constants_are_passed_per_cell() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();
    let coefficients = [2.0, 5.0];
    let constants = [10.0];

    let kernel = KernelFn::new(
        (3, 3),
        |output: &mut [f64], w: &[f64], c: &[f64], _coords: &[f64], _entity: u32, _perm: &[u8]| {
            assert_eq!(w.len(), 1);
            assert_eq!(c, &[10.0]);
            for i in 0..3 {
                output[3 * i + i] = w[0] * c[0];
            }
        },
    );
    let assembler = KernelCellAssembler::new(kernel, &dofmap, &geometry)
        .with_coefficients(&coefficients, 1)
        .with_constants(&constants);
    let matrix = CsrAssembler::default().assemble(&assembler).unwrap();

    let mut expected = DMatrix::zeros(6, 6);
    for i in 0..3 {
        expected[(i, i)] = 20.0;
        expected[(3 + i, 3 + i)] = 50.0;
    }
    assert_matrix_eq!(DMatrix::from(&matrix), expected, comp = abs, tol = 1e-14);
}

#[test]
fn cell_permutations_reach_the_kernel() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();
    let permutations = [0u8, 1u8];

    let kernel = KernelFn::new(
        (3, 3),
        |output: &mut [f64], _w: &[f64], _c: &[f64], _coords: &[f64], _entity: u32, perm: &[u8]| {
            let sign = if perm == [1] { -1.0 } else { 1.0 };
            for i in 0..3 {
                output[3 * i + i] = sign;
            }
        },
    );
    let assembler =
        KernelCellAssembler::new(kernel, &dofmap, &geometry).with_cell_permutations(&permutations);
    let dense = DMatrix::from(&CsrAssembler::default().assemble(&assembler).unwrap());
    assert_eq!(dense[(0, 0)], 1.0);
    assert_eq!(dense[(3, 3)], -1.0);
}

#[test]
fn cell_ownership_bounds_the_assembled_range() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();
    // One owned cell, one ghosted from a neighboring partition.
    let ownership = IndexMap::new(1, vec![9]);

    let kernel = KernelFn::new(
        (3, 3),
        |output: &mut [f64], _w: &[f64], _c: &[f64], _coords: &[f64], _entity: u32, _perm: &[u8]| {
            for i in 0..3 {
                output[3 * i + i] = 1.0;
            }
        },
    );
    let assembler =
        KernelCellAssembler::new(kernel, &dofmap, &geometry).with_cell_ownership(&ownership);
    assert_eq!(assembler.num_cells(), 1);

    let matrix = CsrAssembler::default().assemble(&assembler).unwrap();
    let dense = DMatrix::from(&matrix);
    for i in 0..3 {
        assert_eq!(dense[(i, i)], 1.0);
        assert_eq!(dense[(3 + i, 3 + i)], 0.0);
    }
}

#[test]
fn mismatched_kernel_shape_is_a_configuration_error() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();
    let invocations = AtomicUsize::new(0);

    let kernel = KernelFn::new(
        (4, 4),
        |_output: &mut [f64], _w: &[f64], _c: &[f64], _coords: &[f64], _entity: u32, _perm: &[u8]| {
            invocations.fetch_add(1, Ordering::Relaxed);
        },
    );
    let assembler = KernelCellAssembler::new(kernel, &dofmap, &geometry);
    let result = CsrAssembler::default().assemble(&assembler);
    assert!(matches!(result, Err(AssemblyError::Configuration { .. })));
    // The mismatch must be detected before any cell is tabulated.
    assert_eq!(invocations.load(Ordering::Relaxed), 0);
}

#[test]
fn mismatched_coefficient_length_is_a_configuration_error() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();
    let coefficients = [1.0, 2.0, 3.0];

    let kernel = KernelFn::new(
        (3, 3),
        |_output: &mut [f64], _w: &[f64], _c: &[f64], _coords: &[f64], _entity: u32, _perm: &[u8]| {},
    );
    // Stride 2 over 2 cells requires 4 coefficients, not 3.
    let assembler =
        KernelCellAssembler::new(kernel, &dofmap, &geometry).with_coefficients(&coefficients, 2);
    assert!(matches!(
        assembler.validate_configuration(),
        Err(AssemblyError::Configuration { .. })
    ));
}

#[test]
fn mismatched_ownership_size_is_a_configuration_error() {
    let dofmap = dg_dofmap();
    let geometry = unit_square_geometry();
    let ownership = IndexMap::new(1, vec![4, 5]);

    let kernel = KernelFn::new(
        (3, 3),
        |_output: &mut [f64], _w: &[f64], _c: &[f64], _coords: &[f64], _entity: u32, _perm: &[u8]| {},
    );
    let assembler =
        KernelCellAssembler::new(kernel, &dofmap, &geometry).with_cell_ownership(&ownership);
    assert!(matches!(
        assembler.validate_configuration(),
        Err(AssemblyError::Configuration { .. })
    ));
}
