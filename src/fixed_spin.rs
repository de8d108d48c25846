//! `FixedSpinMask`: region-based clamp of dm/dt to zero.
//!
//! Configured as a list of `(atlas, region_name)` pairs. The mesh/atlas
//! geometry that maps cell centers to region ids is an external
//! collaborator; this module owns only the `Atlas` contract it consumes
//! and the resulting sorted index list.

use crate::mesh::Mesh;

/// Maps a cell-center position to a named region, e.g. "top", "substrate".
/// Supplied by the host's atlas/region layer, out of scope for this crate.
pub trait Atlas: Send + Sync {
    /// Region name containing `(x, y, z)`, or `None` if outside every
    /// region the atlas knows about.
    fn region_at(&self, x: f64, y: f64, z: f64) -> Option<&str>;
}

/// One `(atlas, region_name)` configuration entry.
pub struct FixedSpinRegion<'a> {
    pub atlas: &'a dyn Atlas,
    pub region_name: String,
}

/// Sorted-ascending list of cell indices whose dm/dt is forced to zero
/// every step, since parallel energy evaluators assume sorted order.
#[derive(Debug, Clone, Default)]
pub struct FixedSpinMask {
    indices: Vec<usize>,
}

impl FixedSpinMask {
    pub fn empty() -> Self {
        Self { indices: Vec::new() }
    }

    /// Rebuild the fixed-cell index list by looking up each cell center in
    /// each configured atlas/region pair.
    pub fn update_fixed_spin_list(mesh: &dyn Mesh, regions: &[FixedSpinRegion<'_>]) -> Self {
        let mut indices = Vec::new();
        for i in 0..mesh.size() {
            let c = mesh.center(i);
            let fixed = regions.iter().any(|r| {
                r.atlas
                    .region_at(c.x, c.y, c.z)
                    .map(|name| name == r.region_name)
                    .unwrap_or(false)
            });
            if fixed {
                indices.push(i);
            }
        }
        indices.sort_unstable();
        Self { indices }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn contains(&self, cell: usize) -> bool {
        self.indices.binary_search(&cell).is_ok()
    }

    /// Zero dm/dt at every fixed cell, after every LLG computation.
    pub fn apply(&self, dm_dt: &mut crate::striped::MeshValue<crate::vec3::Vec3>) {
        for &i in &self.indices {
            dm_dt[i] = crate::vec3::Vec3::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::UniformRectangularMesh;
    use crate::striped::MeshValue;
    use crate::vec3::Vec3;

    struct ZPlaneAtlas;
    impl Atlas for ZPlaneAtlas {
        fn region_at(&self, _x: f64, _y: f64, z: f64) -> Option<&str> {
            if z < 1e-9 { Some("bottom") } else { Some("rest") }
        }
    }

    #[test]
    fn update_fixed_spin_list_is_sorted_and_matches_region() {
        let mesh = UniformRectangularMesh::new(4, 4, 2, 1e-9, 1e-9, 1e-9);
        let atlas = ZPlaneAtlas;
        let regions = vec![FixedSpinRegion { atlas: &atlas, region_name: "bottom".to_string() }];
        let mask = FixedSpinMask::update_fixed_spin_list(&mesh, &regions);
        assert_eq!(mask.indices().len(), 16); // one z-plane of a 4x4x2 mesh
        assert!(mask.indices().windows(2).all(|w| w[0] < w[1]));
        for &i in mask.indices() {
            assert!(mesh.center(i).z < 1e-9);
        }
    }

    #[test]
    fn apply_zeroes_only_fixed_cells() {
        let mut mask = FixedSpinMask::empty();
        mask.indices = vec![1, 3];
        let mut dm_dt = MeshValue::from_vec(vec![Vec3::new(1.0, 1.0, 1.0); 5]);
        mask.apply(&mut dm_dt);
        assert_eq!(dm_dt[0], Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(dm_dt[1], Vec3::ZERO);
        assert_eq!(dm_dt[2], Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(dm_dt[3], Vec3::ZERO);
    }
}
