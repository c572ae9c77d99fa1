use std::sync::{Arc, RwLock};

use anyhow::Result;
use cache_access::cache_access;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::simplify::{LosslessOptions, SimplifyOptions, Simplifier};

#[derive(Default, Debug, Clone)]
struct InnerCache {
    face_normals: Option<Arc<Vec<Vector3<f64>>>>,
}

/// A triangle mesh: flat vertex positions plus index triples into them.
///
/// Holds no adjacency or attribute data of its own — that all lives inside
/// a [`Simplifier`] for the duration of a `simplify`/`simplify_lossless`
/// call and is discarded once the call returns.
pub struct Trimesh {
    pub vertices: Vec<Point3<f64>>,
    pub faces: Vec<(usize, usize, usize)>,

    _cache: RwLock<InnerCache>,
}

impl Clone for Trimesh {
    // Custom clone to avoid copying the cache.
    fn clone(&self) -> Self {
        Self {
            vertices: self.vertices.clone(),
            faces: self.faces.clone(),
            _cache: RwLock::new(InnerCache::default()),
        }
    }
}

impl Trimesh {
    pub fn new(vertices: Vec<Point3<f64>>, faces: Vec<(usize, usize, usize)>) -> Self {
        Self {
            vertices,
            faces,
            _cache: RwLock::new(InnerCache::default()),
        }
    }

    /// Build a mesh from flat slices: `vertices.len()` and `faces.len()`
    /// must each be a multiple of 3.
    pub fn set_mesh(vertices: &[f64], faces: &[usize]) -> Result<Self> {
        if vertices.len() % 3 != 0 {
            return Err(anyhow::anyhow!("vertices must be a flat array of length a multiple of 3"));
        }
        if faces.len() % 3 != 0 {
            return Err(anyhow::anyhow!("faces must be a flat array of length a multiple of 3"));
        }

        let v = vertices
            .chunks_exact(3)
            .map(|chunk| Point3::new(chunk[0], chunk[1], chunk[2]))
            .collect::<Vec<_>>();

        let f: Vec<(usize, usize, usize)> = faces
            .chunks_exact(3)
            .map(|chunk| (chunk[0], chunk[1], chunk[2]))
            .collect();

        Ok(Self::new(v, f))
    }

    /// Simplify toward `opts.target_count` using the lossy collapse
    /// schedule (threshold grows with iteration count and aggressiveness).
    pub fn simplify(&self, opts: &SimplifyOptions) -> Self {
        let mut simplifier = Simplifier::new(&self.vertices, &self.faces);
        simplifier.simplify_lossy(opts);
        let (vertices, faces) = simplifier.into_mesh();
        Trimesh::new(vertices, faces)
    }

    /// Simplify without perceptible geometric change: only collapses an
    /// edge when doing so introduces error below `opts.epsilon`.
    ///
    /// `log` receives a line of progress text per iteration, mirroring the
    /// optional logging callback of the original lossless driver.
    pub fn simplify_lossless<F: FnMut(&str)>(
        &self,
        opts: &LosslessOptions,
        log: Option<F>,
    ) -> Self {
        let mut simplifier = Simplifier::new(&self.vertices, &self.faces);
        simplifier.simplify_lossless(opts, log);
        let (vertices, faces) = simplifier.into_mesh();
        Trimesh::new(vertices, faces)
    }

    /// Returns `(vertices, faces, face normals)`. Normals are recomputed
    /// fresh from the current geometry rather than carried through
    /// simplification, so they are always unit-length and consistent with
    /// the returned positions.
    pub fn get_mesh(&self) -> (Vec<Point3<f64>>, Vec<(usize, usize, usize)>, Vec<Vector3<f64>>) {
        let normals = (*self.face_normals()).clone();
        (self.vertices.clone(), self.faces.clone(), normals)
    }

    /// Calculate the normals for each face of the mesh.
    #[cache_access]
    pub fn face_normals(&self) -> Arc<Vec<Vector3<f64>>> {
        let vertices = &self.vertices;
        self.faces
            .par_iter()
            .map(|face| {
                let v0 = vertices[face.0];
                let v1 = vertices[face.1];
                let v2 = vertices[face.2];
                ((v1 - v0).cross(&(v2 - v0))).normalize()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::relative_eq;

    #[test]
    fn test_mesh_normals() {
        let m = Trimesh::set_mesh(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0], &[0, 1, 2])
            .unwrap();
        let normals = m.face_normals();
        assert_eq!(normals.len(), 1);
        assert!(relative_eq!(
            normals[0],
            Vector3::new(0.0, 0.0, 1.0),
            epsilon = 1e-6
        ));
    }

    #[test]
    fn set_mesh_rejects_misshapen_arrays() {
        assert!(Trimesh::set_mesh(&[0.0, 0.0], &[0, 1, 2]).is_err());
        assert!(Trimesh::set_mesh(&[0.0, 0.0, 0.0], &[0, 1]).is_err());
    }

    fn cube() -> Trimesh {
        let vertices = vec![
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 0.0,
            1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0,
        ];
        let faces = [
            0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7, 0, 1, 5, 0, 5, 4, 1, 2, 6, 1, 6, 5, 2, 3, 7, 2, 7,
            6, 3, 0, 4, 3, 4, 7,
        ];
        Trimesh::set_mesh(&vertices, &faces).unwrap()
    }

    #[test]
    fn simplify_reduces_cube_toward_target() {
        let mesh = cube();
        let opts = SimplifyOptions::new(4);
        let simplified = mesh.simplify(&opts);
        assert!(simplified.faces.len() <= 4);
        assert!(simplified.faces.len() < mesh.faces.len());
    }

    #[test]
    fn get_mesh_returns_unit_length_normals() {
        let mesh = cube();
        let opts = SimplifyOptions::new(6);
        let simplified = mesh.simplify(&opts);
        let (_, faces, normals) = simplified.get_mesh();
        assert_eq!(faces.len(), normals.len());
        for n in normals {
            assert!((n.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn simplify_lossless_preserves_topology_on_a_plane() {
        let _ = env_logger::builder().is_test(true).try_init();

        let vertices = vec![
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 2.0, 1.0,
            0.0, 0.0, 2.0, 0.0, 1.0, 2.0, 0.0, 2.0, 2.0, 0.0,
        ];
        let faces = [0, 1, 4, 0, 4, 3, 1, 2, 5, 1, 5, 4, 3, 4, 7, 3, 7, 6, 4, 5, 8, 4, 8, 7];
        let mesh = Trimesh::set_mesh(&vertices, &faces).unwrap();
        let opts = LosslessOptions::default();
        let simplified = mesh.simplify_lossless::<fn(&str)>(&opts, None);
        assert!(simplified.faces.len() < mesh.faces.len());
    }
}
