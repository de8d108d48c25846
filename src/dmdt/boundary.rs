//! Reflecting (Neumann) spatial-derivative helpers shared by the dm/dt
//! variants that need them: Zhang's `D` tensor, Baryakhtar's Laplacian, and
//! spin-transfer's propagating-mode polarization.
//!
//! Two distinct conventions are used:
//! - First derivatives (Zhang, STT) reflect at a boundary: the missing
//!   neighbor is replaced by the cell itself, i.e. the field is mirrored
//!   across the boundary rather than extrapolated.
//! - Second derivatives (Baryakhtar) zero out entirely on a boundary cell,
//!   since a 3-point stencil isn't available there.

use crate::mesh::RectangularMesh;
use crate::striped::MeshValue;
use crate::vec3::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

fn axis_dim(mesh: &dyn RectangularMesh, axis: Axis) -> usize {
    match axis {
        Axis::X => mesh.dim_x(),
        Axis::Y => mesh.dim_y(),
        Axis::Z => mesh.dim_z(),
    }
}

fn axis_edge_length(mesh: &dyn RectangularMesh, axis: Axis) -> f64 {
    match axis {
        Axis::X => mesh.edge_length_x(),
        Axis::Y => mesh.edge_length_y(),
        Axis::Z => mesh.edge_length_z(),
    }
}

fn index_at(mesh: &dyn RectangularMesh, i: usize, j: usize, k: usize, axis: Axis, along: usize) -> usize {
    let idx = match axis {
        Axis::X => mesh.index(along, j, k),
        Axis::Y => mesh.index(i, along, k),
        Axis::Z => mesh.index(i, j, along),
    };
    idx.expect("clamped index stays within mesh bounds")
}

/// `(minus, plus)` neighbor indices one step away along `axis`, reflecting
/// at a boundary (missing neighbor replaced by `cell` itself).
pub fn reflecting_neighbors(mesh: &dyn RectangularMesh, cell: usize, axis: Axis) -> (usize, usize) {
    let (i, j, k) = mesh.coords(cell);
    let dim = axis_dim(mesh, axis);
    let along = match axis {
        Axis::X => i,
        Axis::Y => j,
        Axis::Z => k,
    };
    let minus_along = if along == 0 { along } else { along - 1 };
    let plus_along = if along + 1 >= dim { along } else { along + 1 };
    (
        index_at(mesh, i, j, k, axis, minus_along),
        index_at(mesh, i, j, k, axis, plus_along),
    )
}

/// 2-point central difference, reflecting at boundaries (Zhang's `D`
/// tensor, STT's propagating-mode polarization).
pub fn central_difference(
    mesh: &dyn RectangularMesh,
    field: &MeshValue<Vec3>,
    cell: usize,
    axis: Axis,
) -> Vec3 {
    let (minus, plus) = reflecting_neighbors(mesh, cell, axis);
    if minus == plus {
        return Vec3::ZERO;
    }
    let h = axis_edge_length(mesh, axis);
    (field[plus] - field[minus]) / (2.0 * h)
}

/// 4-point central difference (optional higher-order rule for STT's
/// propagating-mode derivative), reflecting at boundaries by falling back
/// to the 2-point stencil whenever the wider stencil would need a neighbor
/// two cells past a boundary.
pub fn four_point_difference(
    mesh: &dyn RectangularMesh,
    field: &MeshValue<Vec3>,
    cell: usize,
    axis: Axis,
) -> Vec3 {
    let (i, j, k) = mesh.coords(cell);
    let dim = axis_dim(mesh, axis);
    let along = match axis {
        Axis::X => i,
        Axis::Y => j,
        Axis::Z => k,
    };
    if along < 2 || along + 2 >= dim {
        return central_difference(mesh, field, cell, axis);
    }
    let h = axis_edge_length(mesh, axis);
    let m2 = index_at(mesh, i, j, k, axis, along - 2);
    let m1 = index_at(mesh, i, j, k, axis, along - 1);
    let p1 = index_at(mesh, i, j, k, axis, along + 1);
    let p2 = index_at(mesh, i, j, k, axis, along + 2);
    (field[m2] - field[p2] + (field[p1] - field[m1]) * 8.0) / (12.0 * h)
}

/// Second difference (Laplacian component) along `axis`; zero on any cell
/// where a 3-point stencil isn't available (Baryakhtar's boundary rule).
pub fn second_difference(
    mesh: &dyn RectangularMesh,
    field: &MeshValue<Vec3>,
    cell: usize,
    axis: Axis,
) -> Vec3 {
    let (i, j, k) = mesh.coords(cell);
    let dim = axis_dim(mesh, axis);
    let along = match axis {
        Axis::X => i,
        Axis::Y => j,
        Axis::Z => k,
    };
    if along == 0 || along + 1 >= dim {
        return Vec3::ZERO;
    }
    let h = axis_edge_length(mesh, axis);
    let minus = index_at(mesh, i, j, k, axis, along - 1);
    let plus = index_at(mesh, i, j, k, axis, along + 1);
    (field[plus] - field[cell] * 2.0 + field[minus]) / (h * h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::UniformRectangularMesh;

    #[test]
    fn central_difference_reflects_at_left_boundary() {
        let mesh = UniformRectangularMesh::new(3, 1, 1, 1.0, 1.0, 1.0);
        let field = MeshValue::from_vec(vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(4.0, 0.0, 0.0),
        ]);
        let d0 = central_difference(&mesh, &field, 0, Axis::X);
        // minus reflects to cell 0 itself, plus is cell 1: (field[1]-field[0])/2
        assert!((d0.x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn second_difference_is_zero_on_boundary_cells() {
        let mesh = UniformRectangularMesh::new(3, 1, 1, 1.0, 1.0, 1.0);
        let field = MeshValue::from_vec(vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(4.0, 0.0, 0.0),
        ]);
        assert_eq!(second_difference(&mesh, &field, 0, Axis::X), Vec3::ZERO);
        assert_eq!(second_difference(&mesh, &field, 2, Axis::X), Vec3::ZERO);
        // Interior cell: (f0 - 2 f1 + f2) / h^2 = (0 - 4 + 4)/1 = 0 for linear field.
        assert_eq!(second_difference(&mesh, &field, 1, Axis::X), Vec3::ZERO);
    }

    #[test]
    fn single_cell_axis_has_zero_derivative() {
        let mesh = UniformRectangularMesh::new(1, 1, 1, 1.0, 1.0, 1.0);
        let field = MeshValue::from_vec(vec![Vec3::new(1.0, 2.0, 3.0)]);
        assert_eq!(central_difference(&mesh, &field, 0, Axis::X), Vec3::ZERO);
    }
}
