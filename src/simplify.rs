//! Quadric-error-metric mesh simplification.
//!
//! This is the core of the crate: an incremental edge-collapse engine over
//! three parallel arrays (vertices, triangles, refs) that avoids a full
//! adjacency rebuild on every collapse. The overall approach follows
//! Garland & Heckbert's QEM and the `update_mesh`/`update_triangles` split
//! popularized by Sven Forstmann's `Fast-Quadric-Mesh-Simplification`.

use ahash::AHashMap;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::geometry::barycentric_interpolate;
use crate::quadric::{top_left_det, vertex_error_at, SymmetricMatrix};

/// Below this many elements, a pass runs sequentially — the overhead of
/// spinning up the rayon thread pool isn't worth it.
const PARALLEL_THRESHOLD: usize = 20_000;

/// Runs `f` over every element of `items`, in parallel once `items` is long
/// enough to make that worthwhile. Safe because every call to `f` only
/// touches its own element.
fn for_each_maybe_parallel<T, F>(items: &mut [T], f: F)
where
    T: Send,
    F: Fn(&mut T) + Sync + Send,
{
    if items.len() > PARALLEL_THRESHOLD {
        items.par_iter_mut().for_each(f);
    } else {
        items.iter_mut().for_each(f);
    }
}

/// Bitmask of the attributes a triangle carries, mirroring the original
/// `NONE / NORMAL / TEXCOORD / COLOR` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrMask(u8);

impl AttrMask {
    pub const NONE: AttrMask = AttrMask(0);
    pub const NORMAL: AttrMask = AttrMask(2);
    pub const TEXCOORD: AttrMask = AttrMask(4);
    pub const COLOR: AttrMask = AttrMask(8);

    pub fn contains(self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: AttrMask) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for AttrMask {
    type Output = AttrMask;
    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
struct Vertex {
    p: Point3<f64>,
    q: SymmetricMatrix,
    border: bool,
    tstart: usize,
    tcount: usize,
}

#[derive(Debug, Clone)]
struct Triangle {
    v: [usize; 3],
    err: [f64; 4],
    deleted: bool,
    dirty: bool,
    attr: AttrMask,
    n: Vector3<f64>,
    uvs: [Vector3<f64>; 3],
    material: i64,
}

#[derive(Debug, Clone, Copy)]
struct Ref {
    tid: usize,
    tvertex: usize,
}

/// Tuning parameters for lossy simplification toward a target triangle
/// count. Defaults mirror the values that work well across most models.
#[derive(Debug, Clone)]
pub struct SimplifyOptions {
    pub target_count: usize,
    pub update_rate: usize,
    pub aggressiveness: f64,
    pub alpha: f64,
    pub k: f64,
    pub max_iterations: usize,
    pub preserve_border: bool,
    pub verbose: bool,
}

impl Default for SimplifyOptions {
    fn default() -> Self {
        SimplifyOptions {
            target_count: 0,
            update_rate: 5,
            aggressiveness: 7.0,
            alpha: 1e-9,
            k: 3.0,
            max_iterations: 100,
            preserve_border: false,
            verbose: false,
        }
    }
}

impl SimplifyOptions {
    pub fn new(target_count: usize) -> Self {
        SimplifyOptions {
            target_count,
            ..Default::default()
        }
    }
}

/// Tuning parameters for lossless simplification: only edges whose QEM
/// error is below `epsilon` are ever collapsed.
#[derive(Debug, Clone)]
pub struct LosslessOptions {
    pub epsilon: f64,
    pub max_iterations: usize,
    pub preserve_border: bool,
}

impl Default for LosslessOptions {
    fn default() -> Self {
        LosslessOptions {
            epsilon: 1e-3,
            max_iterations: 9999,
            preserve_border: false,
        }
    }
}

/// Owns the vertex/triangle/ref arrays for one simplification run.
pub(crate) struct Simplifier {
    vertices: Vec<Vertex>,
    triangles: Vec<Triangle>,
    refs: Vec<Ref>,
}

impl Simplifier {
    pub(crate) fn new(vertices: &[Point3<f64>], faces: &[(usize, usize, usize)]) -> Self {
        let vertices = vertices
            .iter()
            .map(|&p| Vertex {
                p,
                q: SymmetricMatrix::ZERO,
                border: false,
                tstart: 0,
                tcount: 0,
            })
            .collect();

        let triangles = faces
            .iter()
            .map(|&(v0, v1, v2)| Triangle {
                v: [v0, v1, v2],
                err: [0.0; 4],
                deleted: false,
                dirty: false,
                attr: AttrMask::NONE,
                n: Vector3::zeros(),
                uvs: [Vector3::zeros(); 3],
                material: -1,
            })
            .collect();

        Simplifier {
            vertices,
            triangles,
            refs: Vec::new(),
        }
    }

    /// Returns `(error, optimal point)` for collapsing the edge `(i0, i1)`.
    fn calculate_error(&self, i0: usize, i1: usize) -> (f64, Point3<f64>) {
        let q = self.vertices[i0].q + self.vertices[i1].q;
        let border = self.vertices[i0].border && self.vertices[i1].border;
        let det = top_left_det(&q);

        if det.abs() > 1e-15 && !border {
            let p = Point3::new(
                -1.0 / det * q.det(1, 2, 3, 4, 5, 6, 5, 7, 8),
                1.0 / det * q.det(0, 2, 3, 1, 5, 6, 2, 7, 8),
                -1.0 / det * q.det(0, 1, 3, 1, 4, 6, 2, 5, 8),
            );
            let error = vertex_error_at(&q, &p);
            (error, p)
        } else {
            let p1 = self.vertices[i0].p;
            let p2 = self.vertices[i1].p;
            let p3 = Point3::from((p1.coords + p2.coords) / 2.0);

            let error1 = vertex_error_at(&q, &p1);
            let error2 = vertex_error_at(&q, &p2);
            let error3 = vertex_error_at(&q, &p3);

            let error = error1.min(error2.min(error3));
            let p = if error1 == error {
                p1
            } else if error2 == error {
                p2
            } else {
                p3
            };
            (error, p)
        }
    }

    /// Link condition: `true` means the edge must be rejected.
    fn linked(&self, i0: usize, i1: usize) -> bool {
        let v0 = &self.vertices[i0];
        let v1 = &self.vertices[i1];

        let mut lk_v0_v: ahash::AHashSet<usize> = ahash::AHashSet::new();
        let mut lk_v1_v: ahash::AHashSet<usize> = ahash::AHashSet::new();
        let mut lk_v0_e: ahash::AHashSet<(usize, usize)> = ahash::AHashSet::new();
        let mut lk_v1_e: ahash::AHashSet<(usize, usize)> = ahash::AHashSet::new();
        let mut lk_e_v: ahash::AHashSet<usize> = ahash::AHashSet::new();

        for k in 0..v0.tcount {
            let r = self.refs[v0.tstart + k];
            let t = &self.triangles[r.tid];
            if t.deleted {
                continue;
            }
            let curr = r.tvertex;
            let other1 = t.v[(curr + 1) % 3];
            let other2 = t.v[(curr + 2) % 3];
            if other1 == i1 {
                lk_e_v.insert(other2);
            }
            if other2 == i1 {
                lk_e_v.insert(other1);
            }
            lk_v0_v.insert(other1);
            lk_v0_v.insert(other2);
            lk_v0_e.insert((other1, other2));
        }

        for k in 0..v1.tcount {
            let r = self.refs[v1.tstart + k];
            let t = &self.triangles[r.tid];
            if t.deleted {
                continue;
            }
            let curr = r.tvertex;
            let other1 = t.v[(curr + 1) % 3];
            let other2 = t.v[(curr + 2) % 3];
            if other1 == i0 {
                lk_e_v.insert(other2);
            }
            if other2 == i0 {
                lk_e_v.insert(other1);
            }
            lk_v1_v.insert(other1);
            lk_v1_v.insert(other2);
            lk_v1_e.insert((other1, other2));
        }

        for v in lk_v0_v.intersection(&lk_v1_v) {
            if !lk_e_v.contains(v) {
                return true;
            }
        }
        if lk_v0_e.intersection(&lk_v1_e).next().is_some() {
            return true;
        }
        false
    }

    /// Normal-flip / sliver veto for the fan of `i0` when collapsing toward
    /// `p`, with `i1` the other endpoint. `deleted` has one slot per
    /// incident triangle of `i0` and records which ones vanish in the
    /// collapse. Returns `true` to veto the collapse.
    fn flipped(&self, p: Point3<f64>, i0: usize, i1: usize, deleted: &mut [bool]) -> bool {
        let v0 = &self.vertices[i0];
        for k in 0..v0.tcount {
            let r = self.refs[v0.tstart + k];
            let t = &self.triangles[r.tid];
            if t.deleted {
                continue;
            }

            let s = r.tvertex;
            let id1 = t.v[(s + 1) % 3];
            let id2 = t.v[(s + 2) % 3];

            if id1 == i1 || id2 == i1 {
                deleted[k] = true;
                continue;
            }

            let d1 = (self.vertices[id1].p - p).normalize();
            let d2 = (self.vertices[id2].p - p).normalize();
            if d1.dot(&d2).abs() > 0.999 {
                return true;
            }

            let n = d1.cross(&d2).normalize();
            deleted[k] = false;
            if n.dot(&t.n) < 0.2 {
                return true;
            }
        }
        false
    }

    /// Barycentric UV reinterpolation on the triangles of one fan, called
    /// only when the triangle carries `TEXCOORD` and before the fan's
    /// triangles have been rewritten to reference the surviving vertex.
    fn update_uvs(&mut self, p: Point3<f64>, v_idx: usize, deleted: &[bool]) {
        let v = &self.vertices[v_idx];
        for k in 0..v.tcount {
            let r = self.refs[v.tstart + k];
            if deleted[k] {
                continue;
            }
            let t = &self.triangles[r.tid];
            if t.deleted || !t.attr.contains(AttrMask::TEXCOORD) {
                continue;
            }
            let p0 = self.vertices[t.v[0]].p;
            let p1 = self.vertices[t.v[1]].p;
            let p2 = self.vertices[t.v[2]].p;
            let new_uv = barycentric_interpolate(&p, &p0, &p1, &p2, &t.uvs);
            self.triangles[r.tid].uvs[r.tvertex] = new_uv;
        }
    }

    /// Rewrites the fan of `v_idx` to reference `i0`, deletes vanished
    /// triangles, recomputes errors on survivors, and appends their refs.
    /// Returns how many refs were appended.
    fn update_triangles(
        &mut self,
        i0: usize,
        v_idx: usize,
        deleted: &[bool],
        deleted_triangles: &mut usize,
    ) -> usize {
        let v = &self.vertices[v_idx];
        let tstart = v.tstart;
        let tcount = v.tcount;
        let mut appended = 0;

        for k in 0..tcount {
            let r = self.refs[tstart + k];
            if self.triangles[r.tid].deleted {
                continue;
            }

            if deleted[k] {
                self.triangles[r.tid].deleted = true;
                *deleted_triangles += 1;
                continue;
            }

            self.triangles[r.tid].v[r.tvertex] = i0;
            self.triangles[r.tid].dirty = true;

            let t = &self.triangles[r.tid];
            let v0 = t.v[0];
            let v1 = t.v[1];
            let v2 = t.v[2];
            let (e0, _) = self.calculate_error(v0, v1);
            let (e1, _) = self.calculate_error(v1, v2);
            let (e2, _) = self.calculate_error(v2, v0);
            let t = &mut self.triangles[r.tid];
            t.err[0] = e0;
            t.err[1] = e1;
            t.err[2] = e2;
            t.err[3] = e0.min(e1.min(e2));

            self.refs.push(r);
            appended += 1;
        }
        appended
    }

    /// Compacts deleted triangles (when `iteration > 0`), rebuilds the refs
    /// table, and on the first iteration identifies borders and seeds
    /// quadrics/errors.
    fn update_mesh(&mut self, iteration: usize) {
        if iteration > 0 {
            self.triangles.retain(|t| !t.deleted);
        }

        for v in self.vertices.iter_mut() {
            v.tstart = 0;
            v.tcount = 0;
        }
        for t in self.triangles.iter() {
            for &vi in &t.v {
                self.vertices[vi].tcount += 1;
            }
        }
        let mut tstart = 0;
        for v in self.vertices.iter_mut() {
            v.tstart = tstart;
            tstart += v.tcount;
            v.tcount = 0;
        }
        self.refs.clear();
        self.refs.resize(tstart, Ref { tid: 0, tvertex: 0 });
        for (tid, t) in self.triangles.iter().enumerate() {
            for (tvertex, &vi) in t.v.iter().enumerate() {
                let v = &mut self.vertices[vi];
                self.refs[v.tstart + v.tcount] = Ref { tid, tvertex };
                v.tcount += 1;
            }
        }

        if iteration == 0 {
            self.identify_borders();
            self.init_quadrics();
            self.init_errors();
        }
    }

    /// A vertex is a border vertex if it has a neighbor reachable by exactly
    /// one incident triangle edge (i.e. that edge is only used once).
    fn identify_borders(&mut self) {
        for v in self.vertices.iter_mut() {
            v.border = false;
        }
        for v_idx in 0..self.vertices.len() {
            let v = &self.vertices[v_idx];
            let mut neighbor_counts: AHashMap<usize, usize> = AHashMap::new();
            for k in 0..v.tcount {
                let r = self.refs[v.tstart + k];
                let t = &self.triangles[r.tid];
                for j in 0..3 {
                    let a = t.v[j];
                    let b = t.v[(j + 1) % 3];
                    if a == v_idx || b == v_idx {
                        let other = if a == v_idx { b } else { a };
                        if other != v_idx {
                            *neighbor_counts.entry(other).or_insert(0) += 1;
                        }
                    }
                }
            }
            for (&other, &count) in neighbor_counts.iter() {
                if count == 1 {
                    self.vertices[v_idx].border = true;
                    self.vertices[other].border = true;
                }
            }
        }
    }

    fn init_quadrics(&mut self) {
        for v in self.vertices.iter_mut() {
            v.q = SymmetricMatrix::ZERO;
        }

        let vertex_positions: Vec<Point3<f64>> = self.vertices.iter().map(|v| v.p).collect();
        for_each_maybe_parallel(&mut self.triangles, |t| {
            let p0 = vertex_positions[t.v[0]];
            let p1 = vertex_positions[t.v[1]];
            let p2 = vertex_positions[t.v[2]];
            let cross = (p1 - p0).cross(&(p2 - p0));
            let n = cross.normalize();
            if !n.x.is_finite() || !n.y.is_finite() || !n.z.is_finite() {
                log::warn!("degenerate triangle: zero-area face produced a non-finite normal");
            }
            t.n = n;
        });

        // Each vertex's quadric only depends on its own fan, so this
        // reduction can run per-vertex in parallel once refs are populated.
        let n_vertices = self.vertices.len();
        let triangles = &self.triangles;
        let refs = &self.refs;
        let vertex_positions = &vertex_positions;
        let compute = |v: &Vertex| -> SymmetricMatrix {
            let mut q = SymmetricMatrix::ZERO;
            for k in 0..v.tcount {
                let r = refs[v.tstart + k];
                let t = &triangles[r.tid];
                let p0 = vertex_positions[t.v[0]];
                q += SymmetricMatrix::from_plane(t.n.x, t.n.y, t.n.z, -t.n.dot(&p0.coords));
            }
            q
        };
        let quadrics: Vec<SymmetricMatrix> = if n_vertices > PARALLEL_THRESHOLD {
            self.vertices.par_iter().map(compute).collect()
        } else {
            self.vertices.iter().map(compute).collect()
        };
        for (v, q) in self.vertices.iter_mut().zip(quadrics) {
            v.q = q;
        }
    }

    fn init_errors(&mut self) {
        let n = self.triangles.len();
        let compute = |i: usize| -> [f64; 4] {
            let t = &self.triangles[i];
            let v = t.v;
            let e0 = self.calculate_error(v[0], v[1]).0;
            let e1 = self.calculate_error(v[1], v[2]).0;
            let e2 = self.calculate_error(v[2], v[0]).0;
            [e0, e1, e2, e0.min(e1.min(e2))]
        };
        let errs: Vec<[f64; 4]> = if n > PARALLEL_THRESHOLD {
            (0..n).into_par_iter().map(compute).collect()
        } else {
            (0..n).map(compute).collect()
        };
        for (t, e) in self.triangles.iter_mut().zip(errs) {
            t.err = e;
        }
    }

    fn clear_deleted_flags(&mut self) {
        for_each_maybe_parallel(&mut self.triangles, |t| t.deleted = false);
    }

    fn clear_dirty_flags(&mut self) {
        for_each_maybe_parallel(&mut self.triangles, |t| t.dirty = false);
    }

    fn live_triangle_count(&self) -> usize {
        self.triangles.iter().filter(|t| !t.deleted).count()
    }

    fn border_allows(&self, i0: usize, i1: usize, preserve_border: bool) -> bool {
        let b0 = self.vertices[i0].border;
        let b1 = self.vertices[i1].border;
        if preserve_border {
            !b0 && !b1
        } else {
            b0 == b1
        }
    }

    /// Attempts one collapse sweep of the current iteration, returning the
    /// number of triangles newly marked deleted.
    fn sweep(&mut self, threshold: f64, use_link_condition: bool, preserve_border: bool) -> usize {
        let mut deleted_this_sweep = 0;
        let mut deleted0: Vec<bool> = Vec::new();
        let mut deleted1: Vec<bool> = Vec::new();

        for tid in 0..self.triangles.len() {
            if self.triangles[tid].err[3] > threshold
                || self.triangles[tid].deleted
                || self.triangles[tid].dirty
            {
                continue;
            }

            for j in 0..3 {
                if self.triangles[tid].err[j] >= threshold {
                    continue;
                }
                let i0 = self.triangles[tid].v[j];
                let i1 = self.triangles[tid].v[(j + 1) % 3];

                if !self.border_allows(i0, i1, preserve_border) {
                    continue;
                }

                let (_, p) = self.calculate_error(i0, i1);

                if use_link_condition && self.linked(i0, i1) {
                    continue;
                }

                let tcount0 = self.vertices[i0].tcount;
                let tcount1 = self.vertices[i1].tcount;
                deleted0.clear();
                deleted0.resize(tcount0, false);
                deleted1.clear();
                deleted1.resize(tcount1, false);

                if self.flipped(p, i0, i1, &mut deleted0) {
                    continue;
                }
                if self.flipped(p, i1, i0, &mut deleted1) {
                    continue;
                }

                let texcoord = self.triangles[tid].attr.contains(AttrMask::TEXCOORD);
                if texcoord {
                    self.update_uvs(p, i0, &deleted0);
                    self.update_uvs(p, i1, &deleted1);
                }

                self.vertices[i0].p = p;
                self.vertices[i0].q = self.vertices[i0].q + self.vertices[i1].q;

                let tstart_new = self.refs.len();
                let mut appended = 0;
                appended += self.update_triangles(i0, i0, &deleted0, &mut deleted_this_sweep);
                appended += self.update_triangles(i0, i1, &deleted1, &mut deleted_this_sweep);

                let tcount_new = appended;
                if tcount_new <= self.vertices[i0].tcount {
                    if tcount_new > 0 {
                        let tail: Vec<Ref> = self.refs[tstart_new..tstart_new + tcount_new].to_vec();
                        let dst = self.vertices[i0].tstart;
                        self.refs[dst..dst + tcount_new].copy_from_slice(&tail);
                    }
                } else {
                    self.vertices[i0].tstart = tstart_new;
                }
                self.vertices[i0].tcount = tcount_new;

                break;
            }
        }
        deleted_this_sweep
    }

    /// Lossy simplification toward `opts.target_count`.
    pub(crate) fn simplify_lossy(&mut self, opts: &SimplifyOptions) {
        let initial_triangle_count = self.triangles.len();
        self.clear_deleted_flags();
        let mut deleted_triangles = 0usize;

        for iteration in 0..opts.max_iterations {
            let live = initial_triangle_count - deleted_triangles;
            if live <= opts.target_count {
                break;
            }

            let refs_cap = 4 * initial_triangle_count.max(1);
            if iteration % opts.update_rate == 0 || self.refs.len() > refs_cap {
                self.update_mesh(iteration);
            }
            self.clear_dirty_flags();

            let threshold = opts.alpha * (iteration as f64 + opts.k).powf(opts.aggressiveness);

            if opts.verbose && iteration % 5 == 0 {
                log::debug!(
                    "iteration {iteration} - triangles {} threshold {threshold:.3e}",
                    initial_triangle_count - deleted_triangles
                );
            }

            deleted_triangles += self.sweep(threshold, true, opts.preserve_border);

            if initial_triangle_count - deleted_triangles <= opts.target_count {
                break;
            }
        }

        self.compact_mesh();
    }

    /// Lossless simplification: only collapses below `opts.epsilon` ever
    /// happen, and the loop stops once an iteration makes no progress.
    pub(crate) fn simplify_lossless<F: FnMut(&str)>(
        &mut self,
        opts: &LosslessOptions,
        mut log_cb: Option<F>,
    ) {
        self.clear_deleted_flags();

        for iteration in 0..opts.max_iterations {
            self.update_mesh(iteration);
            self.clear_dirty_flags();

            let message = format!(
                "lossless iteration {iteration} - triangles {}",
                self.live_triangle_count()
            );
            log::debug!("{message}");
            if let Some(cb) = log_cb.as_mut() {
                cb(&message);
            }

            let deleted_this_iteration = self.sweep(opts.epsilon, false, opts.preserve_border);
            if deleted_this_iteration == 0 {
                break;
            }
        }

        self.compact_mesh();
    }

    /// Removes deleted triangles and unreferenced vertices, remapping all
    /// triangle vertex indices.
    fn compact_mesh(&mut self) {
        for v in self.vertices.iter_mut() {
            v.tcount = 0;
        }
        self.triangles.retain(|t| !t.deleted);
        for t in self.triangles.iter() {
            for &vi in &t.v {
                self.vertices[vi].tcount = 1;
            }
        }

        let mut dst = 0;
        for i in 0..self.vertices.len() {
            if self.vertices[i].tcount != 0 {
                self.vertices[i].tstart = dst;
                if dst != i {
                    self.vertices[dst].p = self.vertices[i].p;
                }
                dst += 1;
            }
        }

        for t in self.triangles.iter_mut() {
            for j in 0..3 {
                t.v[j] = self.vertices[t.v[j]].tstart;
            }
        }
        self.vertices.truncate(dst);
        self.refs.clear();
    }

    pub(crate) fn into_mesh(self) -> (Vec<Point3<f64>>, Vec<(usize, usize, usize)>) {
        let vertices = self.vertices.into_iter().map(|v| v.p).collect();
        let faces = self
            .triangles
            .into_iter()
            .map(|t| (t.v[0], t.v[1], t.v[2]))
            .collect();
        (vertices, faces)
    }

    #[cfg(test)]
    pub(crate) fn set_texcoord(&mut self, tid: usize, uvs: [Vector3<f64>; 3]) {
        self.triangles[tid].attr.insert(AttrMask::TEXCOORD);
        self.triangles[tid].uvs = uvs;
    }

    #[cfg(test)]
    pub(crate) fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    #[cfg(test)]
    pub(crate) fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[cfg(test)]
    pub(crate) fn vertex_position(&self, i: usize) -> Point3<f64> {
        self.vertices[i].p
    }

    #[cfg(test)]
    pub(crate) fn run_update_mesh(&mut self, iteration: usize) {
        self.update_mesh(iteration);
    }

    #[cfg(test)]
    pub(crate) fn is_border(&self, i: usize) -> bool {
        self.vertices[i].border
    }

    #[cfg(test)]
    pub(crate) fn triangle_vertices(&self, tid: usize) -> [usize; 3] {
        self.triangles[tid].v
    }
}
