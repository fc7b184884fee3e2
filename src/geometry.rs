//! Minimal cell geometry: flat coordinate storage with per-cell packing.

use nalgebra::Scalar;

/// Coordinates of mesh points together with a cell-to-point connectivity.
///
/// Points are stored in a flat array of length `num_points * gdim`, point
/// major. Every cell references the same number of points, so the points of a
/// cell form a contiguous slice of the connectivity array. This is the only
/// geometric information tabulation kernels receive; anything richer (element
/// maps, Jacobians) is the kernel's own business.
#[derive(Debug, Clone, PartialEq)]
pub struct CellGeometry<T: Scalar> {
    gdim: usize,
    points: Vec<T>,
    points_per_cell: usize,
    connectivity: Vec<usize>,
}

impl<T: Scalar> CellGeometry<T> {
    /// # Panics
    ///
    /// Panics if the flat arrays are not multiples of `gdim` respectively
    /// `points_per_cell`, or if the connectivity references a point out of
    /// bounds.
    pub fn new(gdim: usize, points: Vec<T>, points_per_cell: usize, connectivity: Vec<usize>) -> Self {
        assert!(gdim > 0, "Geometric dimension must be positive");
        assert!(points_per_cell > 0, "Cells must reference at least one point");
        assert_eq!(
            points.len() % gdim,
            0,
            "Coordinate array length must be a multiple of gdim"
        );
        assert_eq!(
            connectivity.len() % points_per_cell,
            0,
            "Connectivity length must be a multiple of points_per_cell"
        );
        let num_points = points.len() / gdim;
        assert!(
            connectivity.iter().all(|p| *p < num_points),
            "Connectivity references point out of bounds"
        );
        Self {
            gdim,
            points,
            points_per_cell,
            connectivity,
        }
    }

    pub fn gdim(&self) -> usize {
        self.gdim
    }

    pub fn num_points(&self) -> usize {
        self.points.len() / self.gdim
    }

    pub fn num_cells(&self) -> usize {
        self.connectivity.len() / self.points_per_cell
    }

    pub fn points_per_cell(&self) -> usize {
        self.points_per_cell
    }

    /// The length of the coordinate buffer expected by
    /// [`populate_cell_coordinates`](Self::populate_cell_coordinates).
    pub fn coordinate_buffer_len(&self) -> usize {
        self.points_per_cell * self.gdim
    }

    /// Packs the coordinates of the given cell's points into `output`,
    /// point major in cell-local point order.
    ///
    /// # Panics
    ///
    /// Panics if `output` does not have length
    /// [`coordinate_buffer_len`](Self::coordinate_buffer_len) or if `cell` is
    /// out of bounds.
    pub fn populate_cell_coordinates(&self, output: &mut [T], cell: usize) {
        assert_eq!(output.len(), self.coordinate_buffer_len());
        let start = cell * self.points_per_cell;
        let cell_points = &self.connectivity[start..start + self.points_per_cell];
        for (k, point) in cell_points.iter().enumerate() {
            output[k * self.gdim..(k + 1) * self.gdim]
                .clone_from_slice(&self.points[point * self.gdim..(point + 1) * self.gdim]);
        }
    }
}
