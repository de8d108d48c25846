//! Mesh contract.
//!
//! The mesh geometry itself is an external collaborator out of scope for
//! this crate; what we own is the interface the driver/evolver consume,
//! plus a minimal rectangular-mesh implementation used by tests and
//! benchmarks.

use crate::error::{LlgError, Result};
use crate::striped::MeshValue;
use crate::vec3::Vec3;

/// Cell-indexed mesh geometry, shared (by reference) across every `SimState`
/// of a run.
pub trait Mesh: Send + Sync {
    /// Number of cells.
    fn size(&self) -> usize;

    /// Volume (m^3) of cell `i`.
    fn volume(&self, i: usize) -> f64;

    /// Whether every cell has the same volume. Required `true` for aveM and
    /// projection outputs; the core refuses non-uniform meshes with a
    /// diagnostic wherever uniformity is a precondition.
    fn has_uniform_cell_volumes(&self) -> bool;

    /// Cell center position.
    fn center(&self, i: usize) -> Vec3;

    /// Downcast to the rectangular-mesh extension, for dm/dt variants
    /// (Zhang, Baryakhtar, spin-transfer) that require known edge lengths
    /// and (i,j,k) indexing. `None` for non-rectangular meshes.
    fn as_rectangular(&self) -> Option<&dyn RectangularMesh> {
        None
    }
}

/// Rectangular-mesh extension: edge lengths and (i,j,k) <-> linear index.
pub trait RectangularMesh: Mesh {
    fn dim_x(&self) -> usize;
    fn dim_y(&self) -> usize;
    fn dim_z(&self) -> usize;
    fn edge_length_x(&self) -> f64;
    fn edge_length_y(&self) -> f64;
    fn edge_length_z(&self) -> f64;

    /// Linear cell index for grid coordinates, or `None` if out of range.
    fn index(&self, i: usize, j: usize, k: usize) -> Option<usize>;

    /// Grid coordinates for a linear cell index.
    fn coords(&self, cell: usize) -> (usize, usize, usize);
}

/// Populates a per-cell field (Ms, gamma, alpha, m0, ...) given the mesh
/// geometry. An external collaborator -- implementations live in the
/// host's problem-configuration layer (uniform constants, random
/// distributions, image masks, ...); this crate only consumes the trait.
pub trait FillMeshValue<T>: Send + Sync {
    fn fill_mesh_value(&self, mesh: &dyn Mesh, out: &mut MeshValue<T>);
}

/// Refuse a mesh that doesn't have uniform cell volumes, for operations
/// that require it.
pub fn require_uniform_volumes(mesh: &dyn Mesh) -> Result<()> {
    if !mesh.has_uniform_cell_volumes() {
        return Err(LlgError::Mesh(
            "operation requires a mesh with uniform cell volumes".to_string(),
        ));
    }
    Ok(())
}

/// A simple axis-aligned rectangular mesh of identical cuboid cells, used by
/// tests, benchmarks, and as a reference implementation of the contract
/// above. Production meshes (FFT-friendly demag grids, etc.) are supplied by
/// the host.
#[derive(Debug, Clone)]
pub struct UniformRectangularMesh {
    nx: usize,
    ny: usize,
    nz: usize,
    dx: f64,
    dy: f64,
    dz: f64,
}

impl UniformRectangularMesh {
    pub fn new(nx: usize, ny: usize, nz: usize, dx: f64, dy: f64, dz: f64) -> Self {
        Self { nx, ny, nz, dx, dy, dz }
    }
}

impl Mesh for UniformRectangularMesh {
    fn size(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    fn volume(&self, _i: usize) -> f64 {
        self.dx * self.dy * self.dz
    }

    fn has_uniform_cell_volumes(&self) -> bool {
        true
    }

    fn center(&self, i: usize) -> Vec3 {
        let (ix, iy, iz) = self.coords(i);
        Vec3::new(
            (ix as f64 + 0.5) * self.dx,
            (iy as f64 + 0.5) * self.dy,
            (iz as f64 + 0.5) * self.dz,
        )
    }

    fn as_rectangular(&self) -> Option<&dyn RectangularMesh> {
        Some(self)
    }
}

impl RectangularMesh for UniformRectangularMesh {
    fn dim_x(&self) -> usize {
        self.nx
    }
    fn dim_y(&self) -> usize {
        self.ny
    }
    fn dim_z(&self) -> usize {
        self.nz
    }
    fn edge_length_x(&self) -> f64 {
        self.dx
    }
    fn edge_length_y(&self) -> f64 {
        self.dy
    }
    fn edge_length_z(&self) -> f64 {
        self.dz
    }

    fn index(&self, i: usize, j: usize, k: usize) -> Option<usize> {
        if i >= self.nx || j >= self.ny || k >= self.nz {
            return None;
        }
        Some((k * self.ny + j) * self.nx + i)
    }

    fn coords(&self, cell: usize) -> (usize, usize, usize) {
        let ix = cell % self.nx;
        let iy = (cell / self.nx) % self.ny;
        let iz = cell / (self.nx * self.ny);
        (ix, iy, iz)
    }
}

/// A `FillMeshValue` that writes the same constant into every cell, used by
/// integration tests and benchmarks standing in for the real (out-of-scope)
/// MIF-layer field sources.
pub struct UniformValue<T>(pub T);

impl<T: Clone + Send + Sync> FillMeshValue<T> for UniformValue<T> {
    fn fill_mesh_value(&self, mesh: &dyn Mesh, out: &mut MeshValue<T>) {
        for i in 0..mesh.size() {
            out[i] = self.0.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_value_fills_every_cell() {
        let mesh = UniformRectangularMesh::new(3, 2, 1, 1.0, 1.0, 1.0);
        let mut out = MeshValue::<f64>::zeros(mesh.size());
        UniformValue(8e5_f64).fill_mesh_value(&mesh, &mut out);
        assert!(out.iter().all(|&v| v == 8e5));
    }

    #[test]
    fn index_roundtrips_through_coords() {
        let mesh = UniformRectangularMesh::new(10, 10, 1, 5e-9, 5e-9, 5e-9);
        for i in 0..10 {
            for j in 0..10 {
                let idx = mesh.index(i, j, 0).unwrap();
                assert_eq!(mesh.coords(idx), (i, j, 0));
            }
        }
    }

    #[test]
    fn uniform_mesh_reports_uniform_volumes() {
        let mesh = UniformRectangularMesh::new(2, 2, 1, 1.0, 1.0, 1.0);
        assert!(mesh.has_uniform_cell_volumes());
        assert!(require_uniform_volumes(&mesh).is_ok());
    }
}
