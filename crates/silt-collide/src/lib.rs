//! Continuous collision detection and response against moving meshes.
//!
//! A particle's substep is a straight motion segment from its previous
//! position to its integrated one. Each collider is a triangle mesh whose
//! vertices move linearly over the collider's own time window. Detection
//! sweeps the segment (padded by the collision radius) through each
//! collider's BVH and refines candidate triangles with Newton-Raphson
//! root finding on the time-dependent particle/surface distance, falling
//! back from the triangle plane to its edges and vertices. Response
//! splits the substep at the hit, reflects and damps the velocity, and
//! re-integrates the remainder, up to [`COLLISION_MAX_COLLISIONS`] hits
//! per substep.

use glam::Vec3;
use log::debug;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use silt_core::{Alive, Particle, ParticleRng};
use silt_spatial::{Aabb3, Bvh, Ray};

/// Maximum collisions resolved for one particle in one substep; past this
/// the particle is parked on the surface.
pub const COLLISION_MAX_COLLISIONS: usize = 10;

/// Collision radius used when per-particle size deflection is off.
pub const COLLISION_MIN_RADIUS: f32 = 0.001;

/// Clearance kept between particle and surface after response.
pub const COLLISION_MIN_DISTANCE: f32 = 0.0001;

/// Convergence threshold for the distance root search.
const COLLISION_ZERO: f32 = 1.0e-5;

// ============================================================================
// Colliders
// ============================================================================

/// Per-collider response parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeflectSettings {
    /// Fraction of normal velocity absorbed on impact.
    pub damp: f32,
    /// Random spread added to `damp` per collision.
    pub rdamp: f32,
    /// Tangential friction toward the surface velocity.
    pub frict: f32,
    /// Random spread added to `frict` per collision.
    pub rfrict: f32,
    /// Probability that a particle passes through the surface.
    pub permeability: f32,
    /// Attraction toward the surface after impact.
    pub stickiness: f32,
    /// Colliding particles die on impact.
    pub kill: bool,
}

impl Default for DeflectSettings {
    fn default() -> Self {
        Self {
            damp: 0.0,
            rdamp: 0.0,
            frict: 0.0,
            rfrict: 0.0,
            permeability: 0.0,
            stickiness: 0.0,
            kill: false,
        }
    }
}

/// A moving triangle mesh a particle can collide with, frozen for one
/// frame step: vertex positions at the window start plus their
/// displacement across the window.
#[derive(Debug)]
pub struct Collider {
    /// Identity used by skip lists and emitter matching.
    pub id: u64,
    /// Vertex positions at `time_start`.
    pub verts: Vec<Vec3>,
    /// Vertex displacement over the `[time_start, time_end]` window.
    pub vel: Vec<Vec3>,
    /// Triangle vertex indices.
    pub tris: Vec<[u32; 3]>,
    /// Frame the vertex positions belong to.
    pub time_start: f32,
    /// Frame the displaced positions belong to.
    pub time_end: f32,
    /// Response parameters.
    pub deflect: DeflectSettings,
    bvh: Bvh<u32>,
}

impl Collider {
    /// Builds a collider from mesh positions at both window ends. The BVH
    /// bounds each triangle's swept volume, so one tree serves the whole
    /// window.
    pub fn new(
        id: u64,
        verts_start: Vec<Vec3>,
        verts_end: &[Vec3],
        tris: Vec<[u32; 3]>,
        time_start: f32,
        time_end: f32,
        deflect: DeflectSettings,
    ) -> Self {
        debug_assert_eq!(verts_start.len(), verts_end.len());
        let vel: Vec<Vec3> = verts_start
            .iter()
            .zip(verts_end)
            .map(|(a, b)| *b - *a)
            .collect();

        let prims = tris
            .iter()
            .enumerate()
            .map(|(i, tri)| {
                let swept = tri.iter().flat_map(|&v| {
                    [verts_start[v as usize], verts_end[v as usize]]
                });
                (Aabb3::from_points(swept), i as u32)
            })
            .collect();

        Self {
            id,
            verts: verts_start,
            vel,
            tris,
            time_start,
            time_end,
            deflect,
            bvh: Bvh::build(prims),
        }
    }
}

// ============================================================================
// Collision element
// ============================================================================

/// One candidate surface element, viewed uniformly as 1 (vertex), 2
/// (edge) or 3 (triangle) moving points.
#[derive(Debug, Clone, Copy, Default)]
struct CollisionElement {
    x: [Vec3; 3],
    v: [Vec3; 3],
    tot: usize,
    /// Corner positions interpolated to the current search time.
    x0: Vec3,
    x1: Vec3,
    x2: Vec3,
    /// Particle position at the current search time.
    p: Vec3,
    /// Surface normal at the found root.
    nor: Vec3,
    /// Surface velocity at the hit point.
    vel: Vec3,
    /// Element coordinates of the hit (barycentric or edge fraction).
    uv: [f32; 2],
    /// Cached normal orientation: -1 undecided, 0 as-is, 1 flipped.
    inv_nor: i32,
    /// Particle started inside the surface.
    inside: bool,
}

type DistanceFn = fn(&mut CollisionElement, Vec3, f32) -> f32;

impl CollisionElement {
    fn tri(x: [Vec3; 3], v: [Vec3; 3]) -> Self {
        Self {
            x,
            v,
            tot: 3,
            inv_nor: -1,
            ..Default::default()
        }
    }

    /// Moves the element corners to search time `t` within the substep.
    /// `f` is the substep's start fraction from earlier collisions, and
    /// `fac1..fac2` maps substep time onto the collider's window.
    fn interpolate(&mut self, t: f32, f: f32, fac1: f32, fac2: f32) {
        let ft = f + t * (1.0 - f);
        let mul = fac1 + ft * (fac2 - fac1);
        self.x0 = self.x[0] + self.v[0] * mul;
        if self.tot > 1 {
            self.x1 = self.x[1] + self.v[1] * mul;
            if self.tot > 2 {
                self.x2 = self.x[2] + self.v[2] * mul;
            }
        }
    }

    /// Signed distance from `p` to the element's plane minus `radius`.
    /// The normal sign is decided on first evaluation and cached so the
    /// root search stays on one side.
    fn signed_distance(&mut self, p: Vec3, radius: f32) -> f32 {
        let n = (self.x1 - self.x0).cross(self.x2 - self.x0).normalize_or_zero();

        if self.inv_nor == -1 {
            self.inv_nor = if (p - self.x0).dot(n) < 0.0 { 1 } else { 0 };
        }
        let n = if self.inv_nor == 1 { -n } else { n };

        self.nor = n;
        p.dot(n) - self.x0.dot(n) - radius
    }

    /// Distance from `p` to the nearest point of an edge or vertex
    /// element, minus `radius`.
    fn nearest_distance(&mut self, p: Vec3, radius: f32) -> f32 {
        let closest = if self.tot == 2 {
            let e = self.x1 - self.x0;
            let len_sq = e.length_squared();
            let u = if len_sq > 0.0 {
                ((p - self.x0).dot(e) / len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            self.x0 + e * u
        } else {
            self.x0
        };
        let n = p - closest;
        let d = n.length();
        self.nor = if d > 0.0 { n / d } else { Vec3::ZERO };
        d - radius
    }

    fn distance_with_normal(&self, p: Vec3) -> (f32, Vec3) {
        match self.tot {
            1 => {
                let n = p - self.x0;
                let d = n.length();
                (d, if d > 0.0 { n / d } else { Vec3::ZERO })
            }
            2 => {
                let e = self.x1 - self.x0;
                let vec = p - self.x0;
                let u = vec.dot(e) / e.length_squared().max(f32::EPSILON);
                let n = vec - e * u;
                let d = n.length();
                (d, if d > 0.0 { n / d } else { Vec3::ZERO })
            }
            _ => {
                let mut probe = *self;
                let d = probe.signed_distance(p, 0.0);
                (d, probe.nor)
            }
        }
    }

    /// Surface velocity at the hit's element coordinates.
    fn point_velocity(&mut self) {
        let mut vel = self.v[0];
        if self.tot > 1 {
            vel += (self.v[1] - self.v[0]) * self.uv[0];
            if self.tot > 2 {
                vel += (self.v[2] - self.v[0]) * self.uv[1];
            }
        }
        self.vel = vel;
    }
}

// ============================================================================
// Per-particle collision state
// ============================================================================

/// Parameters of one substep's collision pass.
#[derive(Debug, Clone, Copy)]
pub struct CollisionParams {
    /// Seconds per frame (after time tweaking).
    pub timestep: f32,
    /// Substep length in frames.
    pub dfra: f32,
    /// Frame at the end of the substep.
    pub cfra: f32,
    /// Frame at the start of the substep.
    pub old_cfra: f32,
    /// The emitter's collider id; skipped during a particle's birth frame.
    pub emitter: Option<u64>,
    /// Particles die on any collision.
    pub die_on_collision: bool,
    /// Couple friction into angular velocity.
    pub dynamic_rotation: bool,
    /// Use the particle size as collision radius.
    pub size_deflect: bool,
}

/// Working state for one particle's collision resolution, rebuilt each
/// substep. Carries the shrinking motion segment as collisions are
/// peeled off its front.
struct ParticleCollision {
    f: f32,
    fac1: f32,
    fac2: f32,
    original_ray_length: f32,
    skip: Vec<u64>,
    total_time: f32,
    inv_timestep: f32,
    radius: f32,
    co1: Vec3,
    co2: Vec3,
    ve1: Vec3,
    ve2: Vec3,
    acc: Vec3,
    pce: CollisionElement,
}

struct RayHit {
    /// Distance along the ray, in world units.
    dist: f32,
}

impl ParticleCollision {
    fn new(pa: &Particle, params: &CollisionParams) -> Self {
        let total_time = params.timestep * params.dfra;
        Self {
            f: 0.0,
            fac1: 0.0,
            fac2: 1.0,
            original_ray_length: 0.0,
            skip: Vec::new(),
            total_time,
            inv_timestep: 1.0 / params.timestep,
            radius: if params.size_deflect {
                pa.size
            } else {
                COLLISION_MIN_RADIUS
            },
            co1: pa.prev_state.co,
            co2: pa.state.co,
            ve1: pa.prev_state.vel,
            ve2: pa.state.vel,
            acc: (pa.state.vel - pa.prev_state.vel) / total_time,
            pce: CollisionElement::default(),
        }
    }
}

// ============================================================================
// Newton-Raphson root search
// ============================================================================

/// Searches `t in [0, 1]` for the first time the distance function hits
/// zero. Returns -1 for "no root": the caller treats that candidate as a
/// miss.
fn collision_newton_rhapson(
    col: &ParticleCollision,
    radius: f32,
    pce: &mut CollisionElement,
    distance: DistanceFn,
) -> f32 {
    const DT_INIT: f32 = 0.001;

    pce.inv_nor = -1;
    pce.inside = false;

    let mut t0 = 0.0;
    pce.interpolate(t0, col.f, col.fac1, col.fac2);
    let mut d0 = distance(pce, col.co1, radius);
    let mut t1 = DT_INIT;
    let mut d1;

    for iter in 0..10 {
        pce.p = col.co1.lerp(col.co2, t1);
        pce.interpolate(t1, col.f, col.fac1, col.fac2);
        d1 = distance(pce, pce.p, radius);

        // Started inside the surface: report an immediate collision at
        // the segment start.
        if iter == 0 && d0 < 0.0 && d0 > -radius {
            pce.p = col.co1;
            pce.inside = true;
            return 0.0;
        }

        // Zero gradient, no step possible from here. On the first
        // iteration the far end may see a usable gradient.
        if d1 == d0 {
            if iter == 0 {
                t0 = 1.0;
                pce.interpolate(t0, col.f, col.fac1, col.fac2);
                d0 = distance(pce, col.co2, radius);
                t1 = 1.0 - DT_INIT;
                continue;
            }
            return -1.0;
        }

        let dd = (t1 - t0) / (d1 - d0);
        t0 = t1;
        d0 = d1;
        t1 -= d1 * dd;

        // Moving away from the element can still mean a rotating face
        // swings into the path, so retry once from the far end.
        if iter == 0 && t1 < 0.0 {
            t0 = 1.0;
            pce.interpolate(t0, col.f, col.fac1, col.fac2);
            d0 = distance(pce, col.co2, radius);
            t1 = 1.0 - DT_INIT;
            continue;
        }
        if iter == 1 && !(-COLLISION_ZERO..=1.0).contains(&t1) {
            return -1.0;
        }

        if d1.abs() <= COLLISION_ZERO {
            if (-COLLISION_ZERO..=1.0).contains(&t1) {
                return t1.clamp(0.0, 1.0);
            }
            return -1.0;
        }
    }
    -1.0
}

// ============================================================================
// Candidate refinement: plane, then edges, then vertices
// ============================================================================

fn collision_sphere_to_tri(
    col: &mut ParticleCollision,
    radius: f32,
    pce: &mut CollisionElement,
    t: &mut f32,
) -> bool {
    pce.inv_nor = -1;
    pce.inside = false;

    let ct = collision_newton_rhapson(col, radius, pce, CollisionElement::signed_distance);

    // An inside hit on the stored result is only displaced by another
    // inside hit.
    if ct >= 0.0 && ct < *t && (!col.pce.inside || pce.inside) {
        let e1 = pce.x1 - pce.x0;
        let e2 = pce.x2 - pce.x0;
        let p0 = pce.p - pce.x0;

        let e1e1 = e1.dot(e1);
        let e1e2 = e1.dot(e2);
        let e1p0 = e1.dot(p0);
        let e2e2 = e2.dot(e2);
        let e2p0 = e2.dot(p0);

        let det = e1e1 * e2e2 - e1e2 * e1e2;
        if det.abs() < f32::EPSILON {
            return false;
        }
        let inv = 1.0 / det;
        let u = (e2e2 * e1p0 - e1e2 * e2p0) * inv;
        let v = (e1e1 * e2p0 - e1e2 * e1p0) * inv;

        if u >= 0.0 && v >= 0.0 && u + v <= 1.0 {
            pce.uv = [u, v];
            col.pce = *pce;
            *t = ct;
            return true;
        }
    }
    false
}

fn collision_sphere_to_edges(
    col: &mut ParticleCollision,
    radius: f32,
    pce: &CollisionElement,
    t: &mut f32,
) -> bool {
    let mut hit = false;
    for i in 0..3 {
        let mut cur = CollisionElement {
            x: [pce.x[i], pce.x[(i + 1) % 3], Vec3::ZERO],
            v: [pce.v[i], pce.v[(i + 1) % 3], Vec3::ZERO],
            tot: 2,
            ..Default::default()
        };

        let ct = collision_newton_rhapson(col, radius, &mut cur, CollisionElement::nearest_distance);

        if ct >= 0.0 && ct < *t {
            let e = cur.x1 - cur.x0;
            let u = (cur.p - cur.x0).dot(e) / e.length_squared().max(f32::EPSILON);
            if !(0.0..=1.0).contains(&u) {
                continue;
            }
            cur.uv = [u, 0.0];
            col.pce = cur;
            *t = ct;
            hit = true;
        }
    }
    hit
}

fn collision_sphere_to_verts(
    col: &mut ParticleCollision,
    radius: f32,
    pce: &CollisionElement,
    t: &mut f32,
) -> bool {
    let mut hit = false;
    for i in 0..3 {
        let mut cur = CollisionElement {
            x: [pce.x[i], Vec3::ZERO, Vec3::ZERO],
            v: [pce.v[i], Vec3::ZERO, Vec3::ZERO],
            tot: 1,
            ..Default::default()
        };

        let ct = collision_newton_rhapson(col, radius, &mut cur, CollisionElement::nearest_distance);

        if ct >= 0.0 && ct < *t {
            col.pce = cur;
            *t = ct;
            hit = true;
        }
    }
    hit
}

// ============================================================================
// Detection
// ============================================================================

fn collision_detect(
    pa: &Particle,
    col: &mut ParticleCollision,
    hit: &mut RayHit,
    colliders: &[Collider],
    params: &CollisionParams,
) -> Option<usize> {
    if colliders.is_empty() {
        return None;
    }

    let mut ray_dir = col.co2 - col.co1;
    let mut ray_length = ray_dir.length();
    // A stationary particle can still be hit by a moving collider; give
    // the cast a nonzero length so the sweep still runs.
    if ray_length == 0.0 {
        ray_length = 1.0e-6;
        ray_dir = Vec3::Z * ray_length;
    }
    col.original_ray_length = ray_length;
    col.pce.inside = false;
    hit.dist = ray_length;

    let ray = Ray::new(col.co1, ray_dir);
    let mut hit_collider = None;

    for (ci, coll) in colliders.iter().enumerate() {
        if col.skip.contains(&coll.id) {
            continue;
        }
        // Freshly born particles may start embedded in their emitter.
        if Some(coll.id) == params.emitter
            && pa.time < params.cfra
            && pa.time >= params.old_cfra
        {
            continue;
        }

        let window = coll.time_end - coll.time_start;
        if window <= 0.0 {
            debug!("collider {} has an empty time window, skipping", coll.id);
            continue;
        }
        col.fac1 = (params.old_cfra - coll.time_start) / window;
        col.fac2 = (params.cfra - coll.time_start) / window;

        let radius = col.radius;
        coll.bvh.cast_segment(&ray, hit.dist, radius, |&tri_index| {
            let tri = coll.tris[tri_index as usize];
            let x = tri.map(|v| coll.verts[v as usize]);
            let v = tri.map(|v| coll.vel[v as usize]);
            let mut pce = CollisionElement::tri(x, v);

            let mut t = hit.dist / col.original_ray_length;
            let mut found = collision_sphere_to_tri(col, radius, &mut pce, &mut t);
            if !col.pce.inside {
                found |= collision_sphere_to_edges(col, radius, &pce, &mut t);
                found |= collision_sphere_to_verts(col, radius, &pce, &mut t);
            }

            if found {
                hit.dist = col.original_ray_length * t;
                col.pce.point_velocity();
                hit_collider = Some(ci);
            }
        });
    }

    hit_collider
}

// ============================================================================
// Response
// ============================================================================

/// Outcome of resolving one substep's collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionOutcome {
    /// No collider was hit.
    Miss,
    /// One or more collisions were deflected.
    Deflected,
    /// The particle died on impact.
    Killed,
    /// Too many collisions; the particle was parked on the surface.
    Stuck,
}

/// Returns false when the particle died and needs no further handling.
fn collision_response(
    pa: &mut Particle,
    col: &mut ParticleCollision,
    hit: &RayHit,
    deflect: &DeflectSettings,
    collider_id: u64,
    params: &CollisionParams,
    rng: &mut ParticleRng,
) -> bool {
    let pce = &mut col.pce;

    // Location fraction within the remaining segment, then within the
    // whole substep.
    let x = hit.dist / col.original_ray_length;
    let f = col.f + x * (1.0 - col.f);
    // Seconds before and after the impact.
    let dt1 = (f - col.f) * col.total_time;
    let dt2 = (1.0 - f) * col.total_time;

    let through = rng.next_f32() < deflect.permeability;

    // Exact collision location.
    let co = col.co1.lerp(col.co2, x);

    if !through && (params.die_on_collision || deflect.kill) {
        pa.alive = Alive::Dying;
        pa.dietime = params.old_cfra + (params.cfra - params.old_cfra) * f;
        pa.state.co = co;
        pa.state.vel = col.ve1.lerp(col.ve2, f);
        pa.state.rot = pa.prev_state.rot.slerp(pa.state.rot, f);
        pa.state.ave = pa.prev_state.ave.lerp(pa.state.ave, f);
        return false;
    }

    // Velocity right before impact, with the substep acceleration
    // reapplied over the pre-impact interval.
    let v0 = col.ve1 + col.acc * dt1;

    // Collider velocity is per collider window; convert to per second.
    pce.vel *= col.inv_timestep;

    let damp =
        (deflect.damp + deflect.rdamp * 2.0 * (rng.next_f32() - 0.5)).clamp(0.0, 1.0);
    let frict =
        (deflect.frict + deflect.rfrict * 2.0 * (rng.next_f32() - 0.5)).clamp(0.0, 1.0);

    let nor = pce.nor;
    let mut v0_dot = nor.dot(v0);
    let v0_tan = v0 - nor * v0_dot;

    let vc = pce.vel;
    let vc_dot = nor.dot(vc);
    let vc_tan = vc - nor * vc_dot;

    let mut v1_tan = v0_tan;
    if frict > 0.0 {
        if params.dynamic_rotation {
            // Linear velocity of the particle surface at the contact.
            let vr_tan = nor.cross(pa.state.ave) * pa.size;

            // Work in coordinates moving with the collision plane.
            let mut vt = v0_tan - vc_tan;

            // Weighted average of center-of-mass and surface velocity;
            // the weight follows from the angular-linear conversion.
            vt = vt.lerp(vr_tan, frict * 0.4);

            // Rolling friction is roughly a hundredth of sliding.
            vt *= 1.0 - 0.01 * frict;

            // Surface velocity is opposite to center-of-mass velocity.
            let surface = -vt;

            let vt_global = vt + vc_tan;
            let ave = surface.cross(nor) / pa.size.max(0.001);

            v1_tan = v0_tan.lerp(vt_global, frict);
            pa.state.ave = pa.state.ave.lerp(ave, frict);
        } else {
            v1_tan = v0_tan.lerp(vc_tan, frict);
        }
    }

    // Cancel stickiness applied by an earlier collision this substep, so
    // it cannot masquerade as genuine inward velocity and be amplified by
    // the reflection.
    if v0_dot < 0.0 {
        v0_dot = (v0_dot + deflect.stickiness).min(0.0);
    }

    v0_dot *= 1.0 - damp;
    let vc_dot = vc_dot * if through { damp } else { 1.0 };

    // Normal velocity after impact. The special case covers a surface
    // catching up with the particle from behind.
    let v0_nor = if !through
        && ((vc_dot > 0.0 && v0_dot > 0.0 && vc_dot > v0_dot) || (vc_dot > 0.0 && v0_dot < 0.0))
    {
        nor * (vc_dot + if v0_dot < 0.0 { v0_dot } else { 0.0 })
    } else {
        nor * (vc_dot + if through { v0_dot } else { -v0_dot })
    };

    let v0 = v0_nor + v1_tan;

    // Re-apply acceleration over the remaining interval.
    pa.state.vel = v0 + col.acc * dt2;
    pa.state.co = co + pa.state.vel * dt2;

    if !through {
        // Keep both segment ends clear of the surface.
        let mut co = co;
        let (d, n) = pce.distance_with_normal(co);
        if d < col.radius + COLLISION_MIN_DISTANCE {
            co += n * (col.radius + COLLISION_MIN_DISTANCE - d);
        }
        let mut v0 = v0;
        let dot = n.dot(v0);
        if dot < 0.0 {
            v0 -= n * dot;
        }

        pce.interpolate(1.0, col.f, col.fac1, col.fac2);
        let (d, n) = pce.distance_with_normal(pa.state.co);
        if d < col.radius + COLLISION_MIN_DISTANCE {
            pa.state.co += n * (col.radius + COLLISION_MIN_DISTANCE - d);
        }
        let dot = n.dot(pa.state.vel);
        if dot < 0.0 {
            pa.state.vel -= n * dot;
        }

        col.co1 = co;
        col.ve1 = v0;
    } else {
        col.co1 = co;
        col.ve1 = v0;
    }

    pa.state.vel -= nor * deflect.stickiness;

    col.co2 = pa.state.co;
    col.ve2 = pa.state.vel;
    col.f = f;

    // Permeated colliders are excluded for the rest of the substep to
    // avoid re-colliding with the same surface from the inside.
    if through {
        col.skip.push(collider_id);
    }

    true
}

/// Last resort when a particle keeps colliding: park it on the surface
/// with zero velocity.
fn collision_fail(pa: &mut Particle, col: &mut ParticleCollision) {
    col.pce.interpolate(1.0, col.f, col.fac1, col.fac2);
    let (d, n) = col.pce.distance_with_normal(col.co1);
    pa.state.co = col.co1 + n * (col.radius + COLLISION_MIN_DISTANCE - d);
    pa.state.vel = Vec3::ZERO;
}

/// Resolves all collisions along one particle's substep, modifying the
/// particle state in place.
pub fn collision_check(
    pa: &mut Particle,
    colliders: &[Collider],
    params: &CollisionParams,
    rng: &mut ParticleRng,
) -> CollisionOutcome {
    let mut col = ParticleCollision::new(pa, params);
    let mut hit = RayHit { dist: 0.0 };
    let mut outcome = CollisionOutcome::Miss;

    let mut collision_count = 0;
    while collision_count < COLLISION_MAX_COLLISIONS {
        let Some(ci) = collision_detect(pa, &mut col, &mut hit, colliders, params) else {
            return outcome;
        };
        collision_count += 1;
        if collision_count == COLLISION_MAX_COLLISIONS {
            collision_fail(pa, &mut col);
            return CollisionOutcome::Stuck;
        }
        let deflect = colliders[ci].deflect;
        if !collision_response(pa, &mut col, &hit, &deflect, colliders[ci].id, params, rng) {
            return CollisionOutcome::Killed;
        }
        outcome = CollisionOutcome::Deflected;
    }
    outcome
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ground_plane(deflect: DeflectSettings) -> Collider {
        let verts = vec![
            Vec3::new(-10.0, -10.0, 0.0),
            Vec3::new(10.0, -10.0, 0.0),
            Vec3::new(10.0, 10.0, 0.0),
            Vec3::new(-10.0, 10.0, 0.0),
        ];
        Collider::new(
            1,
            verts.clone(),
            &verts,
            vec![[0, 1, 2], [0, 2, 3]],
            0.0,
            1.0,
            deflect,
        )
    }

    fn falling_particle(z0: f32, z1: f32) -> Particle {
        let mut pa = Particle {
            size: 0.05,
            lifetime: 100.0,
            alive: Alive::Alive,
            ..Default::default()
        };
        pa.prev_state.co = Vec3::new(0.0, 0.0, z0);
        pa.state.co = Vec3::new(0.0, 0.0, z1);
        pa.prev_state.vel = Vec3::new(0.0, 0.0, (z1 - z0) / 0.04);
        pa.state.vel = pa.prev_state.vel;
        pa
    }

    #[test]
    fn test_newton_rhapson_static_plane() {
        let verts = [
            Vec3::new(-5.0, -5.0, 0.0),
            Vec3::new(5.0, -5.0, 0.0),
            Vec3::new(0.0, 5.0, 0.0),
        ];
        let mut pce = CollisionElement::tri(verts, [Vec3::ZERO; 3]);
        let pa = falling_particle(1.0, -1.0);
        let col = ParticleCollision::new(&pa, &test_params());

        let t = collision_newton_rhapson(&col, 0.1, &mut pce, CollisionElement::signed_distance);
        // Crosses radius distance at t = (1 - 0.1) / 2.
        assert!((t - 0.45).abs() < 1e-3);
    }

    #[test]
    fn test_inside_start_reports_immediate_hit() {
        let verts = [
            Vec3::new(-5.0, -5.0, 0.0),
            Vec3::new(5.0, -5.0, 0.0),
            Vec3::new(0.0, 5.0, 0.0),
        ];
        let mut pce = CollisionElement::tri(verts, [Vec3::ZERO; 3]);
        let pa = falling_particle(-0.05, -0.5);
        let col = ParticleCollision::new(&pa, &test_params());

        let t = collision_newton_rhapson(&col, 0.1, &mut pce, CollisionElement::signed_distance);
        assert_eq!(t, 0.0);
        assert!(pce.inside);
    }

    fn test_params() -> CollisionParams {
        CollisionParams {
            timestep: 0.04,
            dfra: 1.0,
            cfra: 2.0,
            old_cfra: 1.0,
            emitter: None,
            die_on_collision: false,
            dynamic_rotation: false,
            size_deflect: false,
        }
    }

    #[test]
    fn test_full_damp_kills_normal_velocity() {
        let collider = ground_plane(DeflectSettings {
            damp: 1.0,
            ..Default::default()
        });
        let mut pa = falling_particle(0.1, -0.1);
        let mut rng = ParticleRng::new(7);

        let outcome = collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        assert_eq!(outcome, CollisionOutcome::Deflected);
        // Fully damped: no rebound, no remaining downward velocity.
        assert!(pa.state.vel.z.abs() < 1e-4);
    }

    #[test]
    fn test_particle_stays_outside_surface() {
        let collider = ground_plane(DeflectSettings::default());
        let mut pa = falling_particle(0.1, -0.2);
        let mut rng = ParticleRng::new(7);

        let outcome = collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        assert_eq!(outcome, CollisionOutcome::Deflected);
        assert!(pa.state.co.z >= COLLISION_MIN_RADIUS);
    }

    #[test]
    fn test_undamped_bounce_reflects() {
        let collider = ground_plane(DeflectSettings::default());
        let mut pa = falling_particle(0.1, -0.1);
        let mut rng = ParticleRng::new(7);

        collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        // Reflected without damping: speed preserved, direction flipped.
        assert!(pa.state.vel.z > 0.0);
        assert!((pa.state.vel.z - 5.0).abs() < 0.1);
    }

    #[test]
    fn test_miss_leaves_state_unchanged() {
        let collider = ground_plane(DeflectSettings::default());
        let mut pa = falling_particle(2.0, 1.0);
        let before = pa.state.co;
        let mut rng = ParticleRng::new(7);

        let outcome = collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        assert_eq!(outcome, CollisionOutcome::Miss);
        assert_eq!(pa.state.co, before);
    }

    #[test]
    fn test_kill_on_collision_sets_dying() {
        let collider = ground_plane(DeflectSettings {
            kill: true,
            ..Default::default()
        });
        let mut pa = falling_particle(0.1, -0.1);
        let mut rng = ParticleRng::new(7);

        let outcome = collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        assert_eq!(outcome, CollisionOutcome::Killed);
        assert_eq!(pa.alive, Alive::Dying);
        // Frozen at the impact point, on the surface.
        assert!(pa.state.co.z.abs() < 0.01);
        assert!(pa.dietime > 1.0 && pa.dietime < 2.0);
    }

    #[test]
    fn test_permeable_surface_lets_particle_through() {
        let collider = ground_plane(DeflectSettings {
            permeability: 1.0,
            ..Default::default()
        });
        let mut pa = falling_particle(0.1, -0.1);
        let mut rng = ParticleRng::new(7);

        let outcome = collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        assert_eq!(outcome, CollisionOutcome::Deflected);
        // Passed through: still below the plane, still moving down.
        assert!(pa.state.co.z < 0.0);
        assert!(pa.state.vel.z < 0.0);
    }

    #[test]
    fn test_emitter_skipped_on_birth_frame() {
        let collider = ground_plane(DeflectSettings::default());
        let mut pa = falling_particle(0.1, -0.1);
        pa.time = 1.5; // born within this frame window
        let mut rng = ParticleRng::new(7);

        let mut params = test_params();
        params.emitter = Some(1);
        let outcome = collision_check(&mut pa, &[collider], &params, &mut rng);
        assert_eq!(outcome, CollisionOutcome::Miss);
    }

    #[test]
    fn test_moving_collider_hits_stationary_particle() {
        let z = -0.5;
        let verts_start = vec![
            Vec3::new(-10.0, -10.0, z),
            Vec3::new(10.0, -10.0, z),
            Vec3::new(10.0, 10.0, z),
            Vec3::new(-10.0, 10.0, z),
        ];
        let verts_end: Vec<Vec3> = verts_start
            .iter()
            .map(|v| *v + Vec3::new(0.0, 0.0, 1.0))
            .collect();
        let collider = Collider::new(
            2,
            verts_start,
            &verts_end,
            vec![[0, 1, 2], [0, 2, 3]],
            1.0,
            2.0,
            DeflectSettings::default(),
        );

        let mut pa = falling_particle(0.0, 0.0);
        pa.state.vel = Vec3::ZERO;
        pa.prev_state.vel = Vec3::ZERO;
        let mut rng = ParticleRng::new(7);

        let outcome = collision_check(&mut pa, &[collider], &test_params(), &mut rng);
        assert_eq!(outcome, CollisionOutcome::Deflected);
        // Carried along by the surface moving up through it.
        assert!(pa.state.co.z > 0.0 || pa.state.vel.z > 0.0);
    }
}
