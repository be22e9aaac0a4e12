//! Emitter mesh sampling.
//!
//! Particles remember *where* on the emitter they were born as an element
//! index plus face weights, not as a world position. This crate turns that
//! stored origin back into a concrete surface sample (position, normal,
//! tangents, original coordinates) against the evaluated mesh, including
//! the index remapping needed when the evaluated topology differs from
//! the topology the particles were distributed on.

use glam::Vec3;
use log::debug;
use thiserror::Error;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use silt_core::MappedIndex;
use std::collections::HashMap;

// ============================================================================
// Types
// ============================================================================

/// Which kind of emitter element particles were distributed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Origin {
    /// One particle per (selected) vertex.
    Vertex,
    /// Distributed over face surfaces.
    #[default]
    Face,
    /// Distributed over face surfaces, then pushed inward along the
    /// negative normal by the particle's stored offset.
    Volume,
}

/// A face of the emitter mesh. Quads carry four vertices, triangles
/// repeat convention from legacy tessellated meshes: `verts[3]` is unused.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EmitterFace {
    /// Vertex indices; `verts[3]` is ignored for triangles.
    pub verts: [u32; 4],
    /// True for quads.
    pub quad: bool,
}

impl EmitterFace {
    /// A triangle face.
    pub fn tri(a: u32, b: u32, c: u32) -> Self {
        Self {
            verts: [a, b, c, 0],
            quad: false,
        }
    }

    /// A quad face.
    pub fn quad(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self {
            verts: [a, b, c, d],
            quad: true,
        }
    }

    fn corner_count(&self) -> usize {
        if self.quad {
            4
        } else {
            3
        }
    }
}

/// Everything a particle needs to know about its spot on the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SurfaceSample {
    /// Position on (or, for volume origins, inside) the emitter.
    pub pos: Vec3,
    /// Interpolated surface normal, not normalized.
    pub nor: Vec3,
    /// Tangent along the face's u direction.
    pub utan: Vec3,
    /// Tangent along the face's v direction.
    pub vtan: Vec3,
    /// Original (undeformed) coordinates, used for stable texture lookup.
    pub orco: Vec3,
}

impl SurfaceSample {
    /// The all-zero sample returned when an origin cannot be mapped.
    pub const ZERO: Self = Self {
        pos: Vec3::ZERO,
        nor: Vec3::ZERO,
        utan: Vec3::ZERO,
        vtan: Vec3::ZERO,
        orco: Vec3::ZERO,
    };
}

/// UVs assumed when the mesh carries no UV layer, matching a unit quad.
const DEFAULT_UV: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

// ============================================================================
// Emitter mesh
// ============================================================================

/// An evaluated emitter mesh with the optional remap data needed to map
/// particle origins stored against an older topology.
///
/// When the modifier stack only deforms the mesh (`deformed only`), stored
/// indices address the evaluated mesh directly. When it changes topology,
/// [`EmitterMesh::with_remap`] supplies a per-face original index plus the
/// original-space UV quad of each evaluated face, and lookups go through
/// [`EmitterMesh::face_lookup`] / [`EmitterMesh::origspace_to_w`].
#[derive(Debug, Clone)]
pub struct EmitterMesh {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    orco: Option<Vec<Vec3>>,
    faces: Vec<EmitterFace>,
    uvs: Option<Vec<[[f32; 2]; 4]>>,
    /// Per evaluated face, the original face it derives from (-1 if none).
    origindex: Option<Vec<i32>>,
    /// Per evaluated face, its corner UVs in original-face space.
    origspace: Option<Vec<[[f32; 2]; 4]>>,
    /// Original face index to evaluated faces derived from it.
    face_map: HashMap<u32, Vec<u32>>,
}

/// Failure to assemble an emitter mesh from raw attribute arrays.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitterMeshError {
    /// A face addresses a vertex the position array does not have.
    #[error("face {face} references vertex {vert}, mesh has {verts} vertices")]
    VertexOutOfRange { face: usize, vert: u32, verts: usize },
}

impl EmitterMesh {
    /// Builds an emitter mesh, computing area-weighted vertex normals.
    pub fn new(
        positions: Vec<Vec3>,
        faces: Vec<EmitterFace>,
    ) -> Result<Self, EmitterMeshError> {
        for (fi, face) in faces.iter().enumerate() {
            for &v in &face.verts[..face.corner_count()] {
                if v as usize >= positions.len() {
                    return Err(EmitterMeshError::VertexOutOfRange {
                        face: fi,
                        vert: v,
                        verts: positions.len(),
                    });
                }
            }
        }

        let mut normals = vec![Vec3::ZERO; positions.len()];
        for face in &faces {
            let n = face.corner_count();
            let p0 = positions[face.verts[0] as usize];
            let p1 = positions[face.verts[1] as usize];
            let p2 = positions[face.verts[2] as usize];
            // Cross product length carries the area weighting.
            let fnor = (p1 - p0).cross(p2 - p0);
            for &v in &face.verts[..n] {
                normals[v as usize] += fnor;
            }
        }
        for n in &mut normals {
            *n = n.normalize_or(Vec3::Z);
        }
        Ok(Self {
            positions,
            normals,
            orco: None,
            faces,
            uvs: None,
            origindex: None,
            origspace: None,
            face_map: HashMap::new(),
        })
    }

    /// Attaches per-vertex original coordinates.
    pub fn with_orco(mut self, orco: Vec<Vec3>) -> Self {
        debug_assert_eq!(orco.len(), self.positions.len());
        self.orco = Some(orco);
        self
    }

    /// Attaches a per-face UV layer (one quad of UVs per face).
    pub fn with_uvs(mut self, uvs: Vec<[[f32; 2]; 4]>) -> Self {
        debug_assert_eq!(uvs.len(), self.faces.len());
        self.uvs = Some(uvs);
        self
    }

    /// Attaches topology remap data: for each evaluated face, the original
    /// face index it derives from and its corner UVs in original-face
    /// space. Builds the reverse original-to-evaluated face index.
    pub fn with_remap(mut self, origindex: Vec<i32>, origspace: Vec<[[f32; 2]; 4]>) -> Self {
        debug_assert_eq!(origindex.len(), self.faces.len());
        debug_assert_eq!(origspace.len(), self.faces.len());
        let mut face_map: HashMap<u32, Vec<u32>> = HashMap::new();
        for (i, &orig) in origindex.iter().enumerate() {
            if orig >= 0 {
                face_map.entry(orig as u32).or_default().push(i as u32);
            }
        }
        self.origindex = Some(origindex);
        self.origspace = Some(origspace);
        self.face_map = face_map;
        self
    }

    /// True when stored indices address this mesh directly.
    pub fn deformed_only(&self) -> bool {
        self.origindex.is_none()
    }

    /// Number of vertices.
    pub fn vert_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of faces.
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Vertex positions.
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Vertex normals.
    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    /// Faces.
    pub fn faces(&self) -> &[EmitterFace] {
        &self.faces
    }

    fn orco_at(&self, vert: usize) -> Vec3 {
        match &self.orco {
            Some(orco) => orco[vert],
            None => self.positions[vert],
        }
    }

    // ------------------------------------------------------------------
    // Face interpolation
    // ------------------------------------------------------------------

    /// Interpolates position, normal, tangents and orco on a face at the
    /// given corner weights.
    pub fn interpolate_face(&self, face_index: usize, w: &[f32; 4]) -> SurfaceSample {
        let face = &self.faces[face_index];
        let n = face.corner_count();

        let mut pos = Vec3::ZERO;
        let mut nor = Vec3::ZERO;
        let mut orco = Vec3::ZERO;
        for i in 0..n {
            let v = face.verts[i] as usize;
            pos += self.positions[v] * w[i];
            nor += self.normals[v] * w[i];
            orco += self.orco_at(v) * w[i];
        }

        let uv = match &self.uvs {
            Some(uvs) => uvs[face_index],
            None => DEFAULT_UV,
        };

        let co = |i: usize| self.positions[face.verts[i] as usize];
        let (mut utan, mut vtan) = tri_tangents(co(0), co(1), co(2), uv[0], uv[1], uv[2]);
        if face.quad {
            let (u2, v2) = tri_tangents(co(0), co(2), co(3), uv[0], uv[2], uv[3]);
            utan = (utan + u2) * 0.5;
            vtan = (vtan + v2) * 0.5;
        }

        SurfaceSample {
            pos,
            nor,
            utan,
            vtan,
            orco,
        }
    }

    /// Samples a single vertex: position, normal and orco, no tangents.
    pub fn vertex_sample(&self, vert_index: usize) -> SurfaceSample {
        SurfaceSample {
            pos: self.positions[vert_index],
            nor: self.normals[vert_index],
            utan: Vec3::ZERO,
            vtan: Vec3::ZERO,
            orco: self.orco_at(vert_index),
        }
    }

    // ------------------------------------------------------------------
    // Index remapping
    // ------------------------------------------------------------------

    /// Finds the evaluated face containing a particle distributed on
    /// original face `orig_index` at weights `fw`. Candidates are the
    /// evaluated faces derived from that original face; the winner is the
    /// one whose original-space UV region contains the particle's UV.
    pub fn face_lookup(&self, orig_index: u32, fw: &[f32; 4]) -> MappedIndex {
        let (Some(origspace), false) = (&self.origspace, self.face_map.is_empty()) else {
            // No topology change: indices carry over.
            if (orig_index as usize) < self.faces.len() {
                return MappedIndex::Index(orig_index);
            }
            return MappedIndex::NotFound;
        };

        let uv = w_to_uv(fw);
        let Some(candidates) = self.face_map.get(&orig_index) else {
            return MappedIndex::NotFound;
        };
        for &f in candidates {
            let os = &origspace[f as usize];
            let inside = if self.faces[f as usize].quad {
                point_in_tri(uv, os[0], os[1], os[2]) || point_in_tri(uv, os[0], os[2], os[3])
            } else {
                point_in_tri(uv, os[0], os[1], os[2])
            };
            if inside {
                return MappedIndex::Index(f);
            }
        }
        MappedIndex::NotFound
    }

    /// Re-expresses original-face weights as weights on an evaluated face,
    /// using the face's original-space UV corners. The returned weights
    /// interpolate the evaluated face's corners to the same original-space
    /// point the input weights named.
    pub fn origspace_to_w(&self, face_index: usize, fw: &[f32; 4]) -> [f32; 4] {
        let Some(origspace) = &self.origspace else {
            return *fw;
        };
        let os = &origspace[face_index];
        let uv = w_to_uv(fw);
        let n = self.faces[face_index].corner_count();
        mean_value_weights(&os[..n], uv)
    }

    /// Resolves a stored particle origin to a concrete mesh element and
    /// weights on the evaluated mesh. Returns `None` when the element no
    /// longer exists.
    pub fn map_index(
        &self,
        origin: Origin,
        num: i32,
        num_remap: MappedIndex,
        fw: &[f32; 4],
    ) -> Option<(MappedElement, [f32; 4])> {
        if num < 0 {
            return None;
        }
        let num = num as usize;

        // Deformed-only meshes and child particles address elements
        // directly; anything else goes through the remap cache.
        if self.deformed_only() || num_remap == MappedIndex::Child {
            match origin {
                Origin::Vertex => {
                    if num >= self.positions.len() {
                        return None;
                    }
                    Some((MappedElement::Vert(num), *fw))
                }
                Origin::Face | Origin::Volume => {
                    if num >= self.faces.len() {
                        return None;
                    }
                    Some((MappedElement::Face(num), *fw))
                }
            }
        } else {
            match origin {
                Origin::Vertex => match num_remap {
                    MappedIndex::Index(i) if (i as usize) < self.positions.len() => {
                        Some((MappedElement::Vert(i as usize), *fw))
                    }
                    _ => None,
                },
                Origin::Face | Origin::Volume => {
                    let i = match num_remap {
                        MappedIndex::Index(i) => i as usize,
                        MappedIndex::NotFound => num,
                        MappedIndex::Child => unreachable!(),
                    };
                    if i >= self.faces.len() {
                        return None;
                    }
                    Some((MappedElement::Face(i), self.origspace_to_w(i, fw)))
                }
            }
        }
    }

    /// Samples the emitter at a stored particle origin. Unmappable origins
    /// yield [`SurfaceSample::ZERO`] so callers degrade gracefully.
    pub fn particle_on_emitter(
        &self,
        origin: Origin,
        num: i32,
        num_remap: MappedIndex,
        fw: &[f32; 4],
        foffset: f32,
    ) -> SurfaceSample {
        let Some((element, w)) = self.map_index(origin, num, num_remap, fw) else {
            debug!("particle origin {num} not found on evaluated emitter");
            return SurfaceSample::ZERO;
        };
        match element {
            MappedElement::Vert(i) => self.vertex_sample(i),
            MappedElement::Face(i) => {
                let mut sample = self.interpolate_face(i, &w);
                if origin == Origin::Volume {
                    sample.pos -= sample.nor.normalize_or_zero() * foffset;
                }
                sample
            }
        }
    }
}

/// A resolved emitter element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedElement {
    /// Vertex index.
    Vert(usize),
    /// Face index.
    Face(usize),
}

// ============================================================================
// Weight and UV math
// ============================================================================

/// Collapses corner weights to the face-local UV point they name.
pub fn w_to_uv(w: &[f32; 4]) -> [f32; 2] {
    [w[1] + w[2], w[2] + w[3]]
}

/// Tangent pair of a triangle from its UVs. Falls back to edge vectors
/// when the UV mapping is degenerate.
fn tri_tangents(
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    uv0: [f32; 2],
    uv1: [f32; 2],
    uv2: [f32; 2],
) -> (Vec3, Vec3) {
    let d1 = p1 - p0;
    let d2 = p2 - p0;
    let du1 = [uv1[0] - uv0[0], uv1[1] - uv0[1]];
    let du2 = [uv2[0] - uv0[0], uv2[1] - uv0[1]];
    let det = du1[0] * du2[1] - du2[0] * du1[1];
    if det.abs() < 1.0e-9 {
        return (d1, d2);
    }
    let inv = 1.0 / det;
    let utan = (d1 * du2[1] - d2 * du1[1]) * inv;
    let vtan = (d2 * du1[0] - d1 * du2[0]) * inv;
    (utan, vtan)
}

fn cross_2d(a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Point-in-triangle test that accepts either winding.
fn point_in_tri(p: [f32; 2], a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> bool {
    const EPS: f32 = 1.0e-5;
    let d0 = cross_2d(a, b, p);
    let d1 = cross_2d(b, c, p);
    let d2 = cross_2d(c, a, p);
    (d0 >= -EPS && d1 >= -EPS && d2 >= -EPS) || (d0 <= EPS && d1 <= EPS && d2 <= EPS)
}

/// Mean value coordinates of a 2D point with respect to a convex polygon
/// of 3 or 4 corners. Has linear precision: applying the weights to the
/// corners reproduces the point. Points on a corner snap to that corner.
fn mean_value_weights(poly: &[[f32; 2]], p: [f32; 2]) -> [f32; 4] {
    const EPS: f32 = 1.0e-7;
    let n = poly.len();
    debug_assert!(n == 3 || n == 4);

    let mut dist = [0.0f32; 4];
    let mut half_tan = [0.0f32; 4];
    for i in 0..n {
        let a = [poly[i][0] - p[0], poly[i][1] - p[1]];
        let b = [
            poly[(i + 1) % n][0] - p[0],
            poly[(i + 1) % n][1] - p[1],
        ];
        let la = (a[0] * a[0] + a[1] * a[1]).sqrt();
        let lb = (b[0] * b[0] + b[1] * b[1]).sqrt();
        if la < EPS {
            let mut w = [0.0; 4];
            w[i] = 1.0;
            return w;
        }
        dist[i] = la;
        let cross = a[0] * b[1] - a[1] * b[0];
        let dot = a[0] * b[0] + a[1] * b[1];
        // tan(angle / 2) = (|a||b| - a.b) / (a x b)
        half_tan[i] = if cross.abs() < EPS {
            0.0
        } else {
            (la * lb - dot) / cross
        };
    }

    let mut w = [0.0f32; 4];
    let mut total = 0.0;
    for i in 0..n {
        let prev = half_tan[(i + n - 1) % n];
        w[i] = (prev + half_tan[i]) / dist[i];
        total += w[i];
    }
    if total.abs() > EPS {
        for wi in w.iter_mut().take(n) {
            *wi /= total;
        }
    }
    w
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_quad() -> EmitterMesh {
        EmitterMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            vec![EmitterFace::quad(0, 1, 2, 3)],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_out_of_range_face() {
        let err = EmitterMesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![EmitterFace::tri(0, 1, 7)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            EmitterMeshError::VertexOutOfRange {
                face: 0,
                vert: 7,
                verts: 3
            }
        );
    }

    #[test]
    fn test_interpolate_face_center() {
        let mesh = unit_quad();
        let s = mesh.interpolate_face(0, &[0.25, 0.25, 0.25, 0.25]);
        assert!((s.pos - Vec3::new(0.5, 0.5, 0.0)).length() < 1e-6);
        assert!(s.nor.normalize().z > 0.999);
    }

    #[test]
    fn test_default_uv_tangents() {
        let mesh = unit_quad();
        let s = mesh.interpolate_face(0, &[0.25, 0.25, 0.25, 0.25]);
        // Unit quad with default UVs: u tangent along +X, v along +Y.
        assert!(s.utan.normalize().dot(Vec3::X) > 0.99);
        assert!(s.vtan.normalize().dot(Vec3::Y) > 0.99);
    }

    #[test]
    fn test_vertex_sample_uses_orco() {
        let mesh = unit_quad().with_orco(vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ]);
        let s = mesh.vertex_sample(2);
        assert_eq!(s.orco, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(s.pos, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_volume_origin_offsets_inward() {
        let mesh = unit_quad();
        let fw = [0.25, 0.25, 0.25, 0.25];
        let surf = mesh.particle_on_emitter(Origin::Face, 0, MappedIndex::NotFound, &fw, 0.0);
        let vol = mesh.particle_on_emitter(Origin::Volume, 0, MappedIndex::NotFound, &fw, 0.2);
        let inward = (surf.pos - vol.pos).normalize();
        assert!((surf.pos - vol.pos).length() - 0.2 < 1e-6);
        assert!(inward.dot(surf.nor.normalize()) > 0.999);
    }

    #[test]
    fn test_unmapped_origin_is_zeroed() {
        let mesh = unit_quad();
        let s = mesh.particle_on_emitter(
            Origin::Face,
            -1,
            MappedIndex::NotFound,
            &[1.0, 0.0, 0.0, 0.0],
            0.0,
        );
        assert_eq!(s, SurfaceSample::ZERO);
        let s = mesh.particle_on_emitter(
            Origin::Face,
            99,
            MappedIndex::NotFound,
            &[1.0, 0.0, 0.0, 0.0],
            0.0,
        );
        assert_eq!(s, SurfaceSample::ZERO);
    }

    #[test]
    fn test_w_to_uv_corners() {
        assert_eq!(w_to_uv(&[1.0, 0.0, 0.0, 0.0]), [0.0, 0.0]);
        assert_eq!(w_to_uv(&[0.0, 1.0, 0.0, 0.0]), [1.0, 0.0]);
        assert_eq!(w_to_uv(&[0.0, 0.0, 1.0, 0.0]), [1.0, 1.0]);
        assert_eq!(w_to_uv(&[0.0, 0.0, 0.0, 1.0]), [0.0, 1.0]);
    }

    #[test]
    fn test_mean_value_weights_linear_precision() {
        let poly = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let p = [0.3, 0.7];
        let w = mean_value_weights(&poly, p);
        let sum: f32 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        let mut rec = [0.0f32; 2];
        for i in 0..4 {
            rec[0] += w[i] * poly[i][0];
            rec[1] += w[i] * poly[i][1];
        }
        assert!((rec[0] - p[0]).abs() < 1e-5);
        assert!((rec[1] - p[1]).abs() < 1e-5);
    }

    #[test]
    fn test_mean_value_weights_corner_snap() {
        let poly = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let w = mean_value_weights(&poly, [1.0, 1.0]);
        assert_eq!(w, [0.0, 0.0, 1.0, 0.0]);
    }

    /// An original quad split into two triangles must resolve lookups to
    /// the triangle whose original-space region contains the particle, and
    /// the remapped weights must land on the same surface point.
    #[test]
    fn test_face_lookup_on_split_quad() {
        let mesh = EmitterMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            vec![EmitterFace::tri(0, 1, 2), EmitterFace::tri(0, 2, 3)],
        )
        .unwrap()
        .with_remap(
            vec![0, 0],
            vec![
                [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]],
                [[0.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]],
            ],
        );

        // Weights on the original quad naming uv = (0.8, 0.3): below the
        // diagonal, so the first triangle.
        let fw = [0.2 * 0.7, 0.8 * 0.7, 0.8 * 0.3, 0.2 * 0.3];
        let mapped = mesh.face_lookup(0, &fw);
        assert_eq!(mapped, MappedIndex::Index(0));

        let orig_pos = Vec3::new(0.8, 0.3, 0.0);
        let s = mesh.particle_on_emitter(Origin::Face, 0, mapped, &fw, 0.0);
        assert!((s.pos - orig_pos).length() < 1e-4);

        // Above the diagonal lands in the second triangle.
        let fw = [0.8 * 0.2, 0.2 * 0.2, 0.2 * 0.8, 0.8 * 0.8];
        let mapped = mesh.face_lookup(0, &fw);
        assert_eq!(mapped, MappedIndex::Index(1));
        let s = mesh.particle_on_emitter(Origin::Face, 0, mapped, &fw, 0.0);
        assert!((s.pos - Vec3::new(0.2, 0.8, 0.0)).length() < 1e-4);
    }

    #[test]
    fn test_missing_original_face_not_found() {
        let mesh = unit_quad().with_remap(vec![5], vec![DEFAULT_UV]);
        assert_eq!(
            mesh.face_lookup(0, &[1.0, 0.0, 0.0, 0.0]),
            MappedIndex::NotFound
        );
    }
}
