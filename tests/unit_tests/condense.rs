use super::{coupling_kernel_01, coupling_kernel_10, dg_dofmap, stress_mass_kernel, unit_square_geometry};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DMatrixViewMut};
use skoll::assembly::condense::{condense_local_blocks, SchurCondensedAssembler, SingularBlockError};
use skoll::assembly::global::CsrAssembler;
use skoll::assembly::local::{CellConnectivityAssembler, KernelFn};
use skoll::assembly::AssemblyError;
use skoll::dofmap::Dofmap;
use skoll::geometry::CellGeometry;

#[test]
fn identity_block_reduces_to_negated_squared_coupling() {
    // A00 = I, A01 = A10 = diag(1, 2, 3) gives A = -diag(1, 4, 9).
    let a00 = DMatrix::identity(3, 3);
    let coupling = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, 2.0, 3.0]));
    let mut output = DMatrix::zeros(3, 3);

    condense_local_blocks(&a00, &coupling, &coupling, DMatrixViewMut::from(&mut output)).unwrap();

    let expected = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![-1.0, -4.0, -9.0]));
    assert_matrix_eq!(output, expected, comp = abs, tol = 1e-14);
}

#[test]
fn condensation_solves_rather_than_inverts() {
    // A non-symmetric, non-diagonal example verified against the explicit
    // Schur complement -A10 A00^{-1} A01.
    #[rustfmt::skip]
    let a00 = DMatrix::from_row_slice(2, 2, &[
        4.0, 1.0,
        2.0, 3.0,
    ]);
    #[rustfmt::skip]
    let a01 = DMatrix::from_row_slice(2, 3, &[
        1.0, 0.0, 2.0,
        0.0, 1.0, 1.0,
    ]);
    #[rustfmt::skip]
    let a10 = DMatrix::from_row_slice(3, 2, &[
        1.0, 1.0,
        0.0, 2.0,
        1.0, 0.0,
    ]);
    let mut output = DMatrix::zeros(3, 3);
    condense_local_blocks(&a00, &a01, &a10, DMatrixViewMut::from(&mut output)).unwrap();

    let expected = -&a10 * a00.clone().try_inverse().unwrap() * &a01;
    assert_matrix_eq!(output, expected, comp = abs, tol = 1e-12);
}

#[test]
fn singular_eliminated_block_is_rejected() {
    let a00 = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, 0.0, 1.0]));
    let coupling = DMatrix::identity(3, 3);
    let mut output = DMatrix::zeros(3, 3);

    let result = condense_local_blocks(&a00, &coupling, &coupling, DMatrixViewMut::from(&mut output));
    assert_eq!(result, Err(SingularBlockError));
}

#[test]
fn condensed_assembler_reduces_each_cell() {
    // Single reference triangle with constant block kernels, so the reduced
    // tensor can be written down by hand.
    let geometry = CellGeometry::new(2, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0], 3, vec![0, 1, 2]);
    let dofmap = Dofmap::from_cell_dofs(3, 3, vec![0, 1, 2]);

    let kernel00 = KernelFn::new(
        (3, 3),
        |output: &mut [f64], _w: &[f64], _c: &[f64], _x: &[f64], _e: u32, _p: &[u8]| {
            for i in 0..3 {
                output[3 * i + i] = 1.0;
            }
        },
    );
    let diag = |output: &mut [f64], _w: &[f64], _c: &[f64], _x: &[f64], _e: u32, _p: &[u8]| {
        for i in 0..3 {
            output[3 * i + i] = (i + 1) as f64;
        }
    };
    let kernel01 = KernelFn::new((3, 3), diag);
    let kernel10 = KernelFn::new((3, 3), diag);

    let assembler = SchurCondensedAssembler::new(kernel00, kernel01, kernel10, &dofmap, &geometry);
    let matrix = CsrAssembler::default().assemble(&assembler).unwrap();

    let expected = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![-1.0, -4.0, -9.0]));
    assert_matrix_eq!(DMatrix::from(&matrix), expected, comp = abs, tol = 1e-14);
}

#[test]
fn singular_cell_aborts_with_its_index() {
    let geometry = unit_square_geometry();
    let dofmap = dg_dofmap();
    // The eliminated block is diag(c, 1, 1) with a per-cell coefficient c;
    // c = 0 makes the second cell singular.
    let coefficients = [1.0, 0.0];

    let kernel00 = KernelFn::new(
        (3, 3),
        |output: &mut [f64], w: &[f64], _c: &[f64], _x: &[f64], _e: u32, _p: &[u8]| {
            output[0] = w[0];
            output[4] = 1.0;
            output[8] = 1.0;
        },
    );
    let assembler = SchurCondensedAssembler::new(
        kernel00,
        coupling_kernel_01(),
        coupling_kernel_10(),
        &dofmap,
        &geometry,
    )
    .with_coefficients(&coefficients, 1);

    let result = CsrAssembler::default().assemble(&assembler);
    assert_eq!(result.err(), Some(AssemblyError::SingularLocalSystem { cell: 1 }));
}

#[test]
fn inconsistent_block_shapes_are_a_configuration_error() {
    let geometry = unit_square_geometry();
    let dofmap = dg_dofmap();

    let noop = |_output: &mut [f64], _w: &[f64], _c: &[f64], _x: &[f64], _e: u32, _p: &[u8]| {};
    // a01 tabulates 2x3 although the eliminated block is 3x3.
    let assembler = SchurCondensedAssembler::new(
        KernelFn::new((3, 3), noop),
        KernelFn::new((2, 3), noop),
        KernelFn::new((3, 3), noop),
        &dofmap,
        &geometry,
    );
    assert!(matches!(
        assembler.validate_configuration(),
        Err(AssemblyError::Configuration { .. })
    ));
}

#[test]
fn condensed_assembler_matches_scenario_kernels_per_cell() {
    // Per-cell check of -A10 A00^{-1} A01 for the geometry-dependent mixed
    // kernels used by the global exactness tests.
    let geometry = unit_square_geometry();
    let dofmap = dg_dofmap();

    let assembler = SchurCondensedAssembler::new(
        stress_mass_kernel(),
        coupling_kernel_01(),
        coupling_kernel_10(),
        &dofmap,
        &geometry,
    );

    for cell in 0..2 {
        let mut coords = vec![0.0; geometry.coordinate_buffer_len()];
        geometry.populate_cell_coordinates(&mut coords, cell);
        let g = super::coupling_block(&coords);
        let area = super::triangle_area(&coords);
        let expected = g.transpose() * &g / area;

        let mut output = DMatrix::zeros(3, 3);
        use skoll::assembly::local::CellMatrixAssembler;
        assembler
            .assemble_cell_matrix_into(cell, DMatrixViewMut::from(&mut output))
            .unwrap();
        assert_matrix_eq!(output, expected, comp = abs, tol = 1e-12);
    }
}
