//! Display path cache builder.
//!
//! Turns per-particle key data (hair strands, keyed chains) into fixed
//! resolution polyline paths for drawing, then grows child strands from
//! the parent paths: either blended between up to four weighted parents
//! or offset from a single parent and shaped by the clump, kink,
//! roughness and twist modifiers. Path builds are data parallel over
//! index ranges; the parent pass always completes before the child pass
//! starts, since children read parent cache entries.

use glam::{Quat, Vec3};
use log::debug;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use silt_core::{
    do_clump, do_kink, do_rough, do_rough_end, do_twist, FrandTable, ParticleKey, ParticleRng,
};
use silt_mesh::EmitterMesh;
use silt_particle::{ChildMode, ChildParticle, InterpCursor, InterpSource, ParticleSystem};
use silt_spatial::KdTree3;
use std::ops::Range;

// ============================================================================
// Path storage
// ============================================================================

/// Keys per storage chunk. Paths are packed into chunks of this size so
/// a large system never asks for one huge contiguous allocation and
/// invalidation frees whole chunks at once.
pub const PATH_CACHE_CHUNK: usize = 1024;

/// One sample along a display path.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PathKey {
    /// Position.
    pub co: Vec3,
    /// Per-segment velocity, forward difference of positions.
    pub vel: Vec3,
    /// Orientation following the path tangent.
    pub rot: Quat,
    /// Normalized position along the strand, 0 at the root.
    pub time: f32,
}

impl Default for PathKey {
    fn default() -> Self {
        Self {
            co: Vec3::ZERO,
            vel: Vec3::ZERO,
            rot: Quat::IDENTITY,
            time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PathMeta {
    chunk: u32,
    start: u32,
    len: u32,
    /// Negative segment counts hide the path from the visible set.
    segments: i32,
}

/// A set of built paths with stable indices into chunked key storage.
#[derive(Debug, Default)]
pub struct PathSet {
    chunks: Vec<Vec<PathKey>>,
    paths: Vec<Option<PathMeta>>,
}

impl PathSet {
    /// Creates an empty set with `count` path slots.
    pub fn with_paths(count: usize) -> Self {
        Self {
            chunks: Vec::new(),
            paths: vec![None; count],
        }
    }

    /// Number of path slots, built or not.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Stores the keys for path `index`, replacing any previous path at
    /// that slot (the old keys stay in their chunk until the whole set
    /// is dropped).
    pub fn insert(&mut self, index: usize, keys: Vec<PathKey>) {
        if keys.is_empty() {
            self.paths[index] = None;
            return;
        }

        let need = keys.len();
        let chunk = match self.chunks.last() {
            Some(last) if last.len() + need <= last.capacity() => self.chunks.len() - 1,
            _ => {
                self.chunks
                    .push(Vec::with_capacity(PATH_CACHE_CHUNK.max(need)));
                self.chunks.len() - 1
            }
        };
        let start = self.chunks[chunk].len();
        self.chunks[chunk].extend(keys);
        let len = self.chunks[chunk].len() - start;

        self.paths[index] = Some(PathMeta {
            chunk: chunk as u32,
            start: start as u32,
            len: len as u32,
            segments: (len - 1) as i32,
        });
    }

    /// The keys of path `index`, hidden or not.
    pub fn path(&self, index: usize) -> Option<&[PathKey]> {
        let meta = self.paths.get(index).copied().flatten()?;
        let start = meta.start as usize;
        Some(&self.chunks[meta.chunk as usize][start..start + meta.len as usize])
    }

    /// Segment count of path `index`; negative when hidden.
    pub fn segments(&self, index: usize) -> Option<i32> {
        self.paths.get(index).copied().flatten().map(|m| m.segments)
    }

    /// Hides a path from the visible set.
    pub fn hide(&mut self, index: usize) {
        if let Some(Some(meta)) = self.paths.get_mut(index) {
            if meta.segments > 0 {
                meta.segments = -meta.segments;
            }
        }
    }

    /// Whether path `index` exists and is meant to be drawn.
    pub fn is_visible(&self, index: usize) -> bool {
        self.segments(index).map_or(false, |s| s >= 0)
    }

    /// Iterates over `(index, keys)` of every visible path.
    pub fn visible(&self) -> impl Iterator<Item = (usize, &[PathKey])> {
        (0..self.paths.len()).filter_map(move |i| {
            if self.is_visible(i) {
                Some((i, self.path(i)?))
            } else {
                None
            }
        })
    }
}

// ============================================================================
// Path sampling
// ============================================================================

/// Samples a built path at normalized parameter `t` in `[0, 1]`.
/// Positions and velocities blend linearly between the bracketing keys,
/// rotations by spherical interpolation.
pub fn interpolate_pathcache(path: &[PathKey], t: f32) -> PathKey {
    debug_assert!(!path.is_empty());
    if path.len() == 1 {
        return path[0];
    }
    let ft = t.clamp(0.0, 1.0) * (path.len() - 1) as f32;
    let i = (ft as usize).min(path.len() - 2);
    let frac = ft - i as f32;
    let a = &path[i];
    let b = &path[i + 1];
    PathKey {
        co: a.co.lerp(b.co, frac),
        vel: a.vel.lerp(b.vel, frac),
        rot: a.rot.slerp(b.rot, frac).normalize(),
        time: a.time + (b.time - a.time) * frac,
    }
}

/// Derives per-key velocities (forward differences) and tangent-chained
/// rotations for a freshly positioned path.
///
/// The first key seeds its rotation from the world up axis; every
/// following key composes the minimal rotation between consecutive
/// tangents onto the previous key's rotation, so orientation twists
/// smoothly along the strand without per-vertex orientation data.
pub fn finish_path(path: &mut [PathKey]) {
    let n = path.len();
    if n < 2 {
        return;
    }

    for i in 0..n - 1 {
        path[i].vel = path[i + 1].co - path[i].co;
    }
    path[n - 1].vel = path[n - 2].vel;

    let mut prev_tangent = Vec3::ZERO;
    for i in 0..n {
        let tangent = if i + 1 < n {
            (path[i + 1].co - path[i].co).normalize_or(prev_tangent)
        } else {
            prev_tangent
        };

        if i == 0 {
            path[0].rot = Quat::from_rotation_arc(Vec3::Z, tangent.normalize_or(Vec3::Z));
        } else {
            let cosangle = prev_tangent.dot(tangent);
            path[i].rot = if cosangle > 0.999_999 {
                path[i - 1].rot
            } else {
                (Quat::from_rotation_arc(prev_tangent, tangent) * path[i - 1].rot).normalize()
            };
        }
        prev_tangent = tangent;
    }
}

// ============================================================================
// Path effectors
// ============================================================================

/// A force field sampled along paths.
pub trait PathEffector: Sync {
    /// Force at a point, in world units per strand.
    fn force(&self, co: Vec3) -> Vec3;
}

impl<F: Fn(Vec3) -> Vec3 + Sync> PathEffector for F {
    fn force(&self, co: Vec3) -> Vec3 {
        self(co)
    }
}

/// Deflects a path through a force field while preserving every segment
/// length: each segment direction is bent by the local force (scaled by
/// the key's strand position, so roots stay anchored) and the key is
/// re-placed at the original distance from its predecessor.
pub fn do_path_effectors(effector: &dyn PathEffector, path: &mut [PathKey]) {
    for i in 1..path.len() {
        let seg = path[i].co - path[i - 1].co;
        let length = seg.length();
        if length <= f32::EPSILON {
            continue;
        }
        let force = effector.force(path[i].co) * path[i].time;
        let dir = (seg + force).normalize_or(seg / length);
        path[i].co = path[i - 1].co + dir * length;
    }
}

// ============================================================================
// Task partitioning
// ============================================================================

/// Splits `total` indices into roughly `4 x` the worker count of ranges,
/// remainder spread over the leading ranges. Each range is one task with
/// its own RNG, so jitter is stable regardless of scheduling.
pub fn task_ranges(total: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    let tasks = (4 * rayon::current_num_threads()).clamp(1, total);
    let base = total / tasks;
    let rem = total % tasks;

    let mut ranges = Vec::with_capacity(tasks);
    let mut start = 0;
    for i in 0..tasks {
        let len = base + usize::from(i < rem);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

// ============================================================================
// Parent paths
// ============================================================================

/// Inputs to a path cache build.
pub struct PathBuildContext<'a> {
    pub psys: &'a ParticleSystem,
    /// Evaluated emitter, for original-coordinate lookups.
    pub emitter: Option<&'a EmitterMesh>,
    /// Segments per parent path.
    pub steps: usize,
    /// Segments per child path.
    pub child_steps: usize,
    /// Fraction of children actually built, 0..1 (viewport display
    /// percentage; renders pass 1).
    pub display_fraction: f32,
    /// Optional force field deflecting built paths.
    pub effector: Option<&'a dyn PathEffector>,
}

/// Builds the parent display paths for every existing particle that has
/// at least a two-key strand. Ranges run in parallel and are merged in
/// index order afterwards.
pub fn build_parent_paths(ctx: &PathBuildContext<'_>) -> PathSet {
    let count = ctx.psys.particles.len();
    let batches: Vec<Vec<(usize, Vec<PathKey>)>> = task_ranges(count)
        .into_par_iter()
        .map(|range| {
            range
                .filter_map(|p| parent_path(ctx, p).map(|keys| (p, keys)))
                .collect()
        })
        .collect();

    let mut set = PathSet::with_paths(count);
    for (p, keys) in batches.into_iter().flatten() {
        set.insert(p, keys);
    }
    set
}

fn parent_path(ctx: &PathBuildContext<'_>, p: usize) -> Option<Vec<PathKey>> {
    let psys = ctx.psys;
    let pa = &psys.particles[p];
    if !pa.exists() {
        return None;
    }

    let source = if pa.hair.len() >= 2 {
        InterpSource::Hair {
            keys: &pa.hair,
            deformed: None,
            hair_index: pa.hair_index as usize,
        }
    } else if pa.keys.len() >= 2 {
        InterpSource::Keyed(&pa.keys)
    } else {
        return None;
    };

    let steps = ctx.steps.max(1);
    let part = &psys.settings;
    let mut cursor = InterpCursor::new(&source, part.bspline, part.timetweak);

    let mut path = Vec::with_capacity(steps + 1);
    for k in 0..=steps {
        let t = k as f32 / steps as f32;
        let state = cursor.state_at_fraction(&source, t);
        path.push(PathKey {
            co: state.co,
            time: t,
            ..Default::default()
        });
    }

    if let Some(effector) = ctx.effector {
        do_path_effectors(effector, &mut path);
    }
    finish_path(&mut path);
    Some(path)
}

// ============================================================================
// Child distribution
// ============================================================================

/// Fills the system's child array for its configured child mode.
///
/// Simple children cycle through the parents; face children are placed
/// on the parents' emitter elements with jittered barycentric weights
/// and get their interpolation parents assigned by nearest original
/// coordinate afterwards.
pub fn distribute_children(psys: &mut ParticleSystem, emitter: Option<&EmitterMesh>) {
    let part = psys.settings.clone();
    let child = &part.child;
    psys.children.clear();

    let totpart = psys.particles.len();
    if child.mode == ChildMode::None || child.count == 0 || totpart == 0 {
        return;
    }

    let total = child.count * totpart;
    psys.children.reserve(total);
    let mut rng = ParticleRng::new(psys.seed.wrapping_add(0x6368_696c_64) | 1);

    match child.mode {
        ChildMode::None => {}
        ChildMode::Simple => {
            for i in 0..total {
                let parent = (i % totpart) as i32;
                let pa = &psys.particles[parent as usize];
                psys.children.push(ChildParticle {
                    parent,
                    pa: [parent, -1, -1, -1],
                    w: [1.0, 0.0, 0.0, 0.0],
                    num: pa.num,
                    fuv: pa.fuv,
                    foffset: pa.foffset,
                });
            }
        }
        ChildMode::Faces => {
            for i in 0..total {
                // Jitter around the parent's own emitter spot.
                let pa = &psys.particles[i % totpart];
                let mut fuv = pa.fuv;
                for w in &mut fuv {
                    *w = (*w + rng.range(-0.25, 0.25)).clamp(0.0, 1.0);
                }
                let sum: f32 = fuv.iter().sum();
                if sum > f32::EPSILON {
                    for w in &mut fuv {
                        *w /= sum;
                    }
                }
                psys.children.push(ChildParticle {
                    parent: -1,
                    pa: [-1; 4],
                    w: [0.0; 4],
                    num: pa.num,
                    fuv,
                    foffset: pa.foffset,
                });
            }
            find_parents(psys, emitter);
        }
    }
}

/// Original coordinate of a particle's emitter spot; falls back to the
/// stored previous position without an emitter.
fn parent_orco(psys: &ParticleSystem, emitter: Option<&EmitterMesh>, p: usize) -> Vec3 {
    let pa = &psys.particles[p];
    match emitter {
        Some(mesh) => {
            mesh.particle_on_emitter(psys.settings.origin, pa.num, pa.num_remap, &pa.fuv, pa.foffset)
                .orco
        }
        None => pa.prev_state.co,
    }
}

fn child_orco(psys: &ParticleSystem, emitter: Option<&EmitterMesh>, cpa: &ChildParticle) -> Vec3 {
    match emitter {
        Some(mesh) => {
            let remap = if cpa.num >= 0 {
                silt_core::MappedIndex::Index(cpa.num as u32)
            } else {
                silt_core::MappedIndex::NotFound
            };
            mesh.particle_on_emitter(psys.settings.origin, cpa.num, remap, &cpa.fuv, cpa.foffset)
                .orco
        }
        None => {
            let p = cpa.pa[0].max(cpa.parent).max(0) as usize;
            psys.particles
                .get(p)
                .map(|pa| pa.prev_state.co)
                .unwrap_or(Vec3::ZERO)
        }
    }
}

/// Assigns up to four interpolation parents per face child by nearest
/// original coordinates, weighted by inverse distance.
pub fn find_parents(psys: &mut ParticleSystem, emitter: Option<&EmitterMesh>) {
    let totpart = psys.particles.len();
    if totpart == 0 {
        return;
    }

    let mut tree = KdTree3::with_capacity(totpart);
    for p in 0..totpart {
        tree.insert(p as u32, parent_orco(psys, emitter, p));
    }
    tree.balance();

    let mut children = std::mem::take(&mut psys.children);
    for cpa in &mut children {
        let orco = child_orco(psys, emitter, cpa);
        let Some((_, nearest_sq)) = tree.nearest(orco) else {
            continue;
        };

        // Gather candidates around the nearest hit and keep the best 4.
        let radius = (nearest_sq.sqrt() * 4.0).max(1.0e-4);
        let mut best: Vec<(u32, f32)> = Vec::with_capacity(8);
        tree.range(orco, radius, |index, dist_sq| {
            best.push((index, dist_sq));
        });
        best.sort_by(|a, b| a.1.total_cmp(&b.1));
        best.truncate(4);

        cpa.pa = [-1; 4];
        cpa.w = [0.0; 4];
        let mut total = 0.0;
        for (k, (index, dist_sq)) in best.iter().enumerate() {
            cpa.pa[k] = *index as i32;
            cpa.w[k] = 1.0 / (1.0e-5 + dist_sq.sqrt());
            total += cpa.w[k];
        }
        for w in &mut cpa.w {
            *w /= total;
        }
    }
    psys.children = children;
}

// ============================================================================
// Child paths
// ============================================================================

/// Number of leading children acting as virtual parents: built like any
/// other child but hidden from the visible set, they only improve the
/// interpolation neighborhood of the real children.
pub fn virtual_parent_count(psys: &ParticleSystem) -> usize {
    let child = &psys.settings.child;
    if child.mode != ChildMode::Faces {
        return 0;
    }
    (child.virtual_parents * psys.particles.len() as f32) as usize
}

/// Builds all child display paths from the finished parent paths.
/// Children beyond the display fraction are skipped entirely; virtual
/// parents are built and then hidden.
pub fn build_child_paths(ctx: &PathBuildContext<'_>, parents: &PathSet) -> PathSet {
    let psys = ctx.psys;
    let child = &psys.settings.child;
    let virtual_parents = virtual_parent_count(psys);

    let shown = (psys.children.len() as f32 * ctx.display_fraction.clamp(0.0, 1.0)) as usize;
    let total = shown.max(virtual_parents).min(psys.children.len());

    let seed = psys.seed;
    let batches: Vec<Vec<(usize, Vec<PathKey>)>> = task_ranges(total)
        .into_par_iter()
        .map(|range| {
            let mut rng = ParticleRng::new(seed ^ ((range.start as u64) << 16) | 1);
            range
                .filter_map(|i| {
                    let cpa = &psys.children[i];
                    let keys = match child.mode {
                        ChildMode::Faces => child_path_between(ctx, parents, i, cpa),
                        ChildMode::Simple => child_path_simple(ctx, parents, i, cpa, &mut rng),
                        ChildMode::None => None,
                    }?;
                    Some((i, keys))
                })
                .collect()
        })
        .collect();

    let mut set = PathSet::with_paths(total);
    for (i, keys) in batches.into_iter().flatten() {
        set.insert(i, keys);
    }
    for i in 0..virtual_parents {
        set.hide(i);
    }
    set
}

/// Reduces a between-child's parent weights where neighboring strands
/// part ways: by tip/root distance ratio for long hair, by root tangent
/// angle otherwise. The dominant parent keeps full weight.
fn parting_weights(
    child: &silt_particle::ChildSettings,
    parents: &PathSet,
    cpa: &ChildParticle,
    w: &mut [f32; 4],
) {
    if child.parting_fac <= 0.0 || child.parting_max <= child.parting_min {
        return;
    }
    let Some(first) = (cpa.pa[0] >= 0)
        .then(|| parents.path(cpa.pa[0] as usize))
        .flatten()
    else {
        return;
    };

    for k in 1..4 {
        if cpa.pa[k] < 0 || w[k] == 0.0 {
            continue;
        }
        let Some(other) = parents.path(cpa.pa[k] as usize) else {
            continue;
        };

        let x = if child.use_long_hair {
            let root = (other[0].co - first[0].co).length().max(1.0e-6);
            let tip = (other[other.len() - 1].co - first[first.len() - 1].co).length();
            tip / root - 1.0
        } else {
            let t1 = first[1].co - first[0].co;
            let t2 = other[1].co - other[0].co;
            let cos = t1
                .normalize_or_zero()
                .dot(t2.normalize_or_zero())
                .clamp(-1.0, 1.0);
            cos.acos().to_degrees()
        };

        let fac = ((x - child.parting_min) / (child.parting_max - child.parting_min))
            .clamp(0.0, 1.0);
        w[k] *= 1.0 - child.parting_fac * fac;
    }

    let total: f32 = w.iter().sum();
    if total > f32::EPSILON {
        for wk in w.iter_mut() {
            *wk /= total;
        }
    }
}

fn child_path_between(
    ctx: &PathBuildContext<'_>,
    parents: &PathSet,
    index: usize,
    cpa: &ChildParticle,
) -> Option<Vec<PathKey>> {
    let psys = ctx.psys;
    let child = &psys.settings.child;
    let steps = ctx.child_steps.max(1);

    let mut w = cpa.w;
    parting_weights(child, parents, cpa, &mut w);

    // Root offset between the child's own spot and the blended parent
    // roots; for long hair it is carried along the strand, rotated with
    // the dominant parent and faded out toward the tip.
    let mut blended_root = Vec3::ZERO;
    let mut total = 0.0;
    for k in 0..4 {
        if cpa.pa[k] < 0 || w[k] == 0.0 {
            continue;
        }
        let path = parents.path(cpa.pa[k] as usize)?;
        blended_root += path[0].co * w[k];
        total += w[k];
    }
    if total <= 0.0 {
        debug!("between child {index} has no usable parents");
        return None;
    }
    blended_root /= total;
    let own_root = child_orco(psys, ctx.emitter, cpa);
    let offset = own_root - blended_root;
    let first_rot = (cpa.pa[0] >= 0)
        .then(|| parents.path(cpa.pa[0] as usize))
        .flatten()
        .map(|p| p[0].rot)
        .unwrap_or(Quat::IDENTITY);

    let mut path = Vec::with_capacity(steps + 1);
    for k in 0..=steps {
        let t = k as f32 / steps as f32;
        let mut co = Vec3::ZERO;
        let mut par = PathKey::default();
        for (pk, wk) in cpa.pa.iter().zip(w) {
            if *pk < 0 || wk == 0.0 {
                continue;
            }
            let sampled = interpolate_pathcache(parents.path(*pk as usize)?, t);
            co += sampled.co * wk;
            if wk >= w[0] {
                par = sampled;
            }
        }
        co /= total;

        if child.use_long_hair {
            let rotated = (par.rot * first_rot.inverse()) * offset;
            co += rotated * (1.0 - t);
        } else {
            co += offset;
        }

        let mut key = ParticleKey::at(co);
        key.rot = par.rot;
        apply_child_modifiers(ctx, index, &par, t, &mut key);
        path.push(PathKey {
            co: key.co,
            time: t,
            ..Default::default()
        });
    }

    finish_path(&mut path);
    Some(path)
}

fn child_path_simple(
    ctx: &PathBuildContext<'_>,
    parents: &PathSet,
    index: usize,
    cpa: &ChildParticle,
    rng: &mut ParticleRng,
) -> Option<Vec<PathKey>> {
    let psys = ctx.psys;
    let child = &psys.settings.child;
    let parent = parents.path(cpa.parent.max(0) as usize)?;
    let steps = ctx.child_steps.max(1);

    // Spread offset in the root frame: a unit-sphere sample scaled to
    // the child radius, flattened against the strand axis.
    let mut offset = rng.unit_sphere() * child.radius;
    offset.z *= 1.0 - child.flat;
    let offset = parent[0].rot * offset;

    let keep = child_length_fraction(&psys.frand, child, index);
    let kept_keys = (((steps + 1) as f32 * keep).round() as usize).clamp(2, steps + 1);

    let mut path = Vec::with_capacity(kept_keys);
    for k in 0..kept_keys {
        let t = k as f32 / steps as f32;
        let par = interpolate_pathcache(parent, t);

        let mut key = ParticleKey::at(par.co + offset);
        key.rot = par.rot;
        apply_child_modifiers(ctx, index, &par, t, &mut key);
        path.push(PathKey {
            co: key.co,
            time: t,
            ..Default::default()
        });
    }

    finish_path(&mut path);
    Some(path)
}

/// Random per-child length reduction; children below the threshold keep
/// their full length.
fn child_length_fraction(
    frand: &FrandTable,
    child: &silt_particle::ChildSettings,
    index: usize,
) -> f32 {
    if child.length <= 0.0 {
        return 1.0;
    }
    let r = frand.get(index + 26);
    if r < child.length_thres {
        1.0
    } else {
        (1.0 - child.length * frand.get(index + 27)).max(0.1)
    }
}

/// Applies the child shape modifiers at one path key, in the same order
/// the deformers expect: clump first (its result scales the kink
/// amplitude), then kink, roughness and twist around the parent strand.
fn apply_child_modifiers(
    ctx: &PathBuildContext<'_>,
    index: usize,
    par: &PathKey,
    t: f32,
    key: &mut ParticleKey,
) {
    let psys = ctx.psys;
    let child = &psys.settings.child;
    let par_vel = par.vel.normalize_or(Vec3::Z);

    let clump = do_clump(key, par.co, t, 1.0, &child.clump);
    do_kink(key, par.co, par_vel, par.rot, t, &child.kink, clump);

    let orco = match child.mode {
        ChildMode::Faces => child_orco(psys, ctx.emitter, &psys.children[index]),
        _ => Vec3::splat(psys.frand.get(index + 31)),
    };
    if child.rough1 != 0.0 {
        do_rough(orco, t, child.rough1, child.rough1_size.max(1.0e-4), 0.0, key);
    }
    if child.rough2 != 0.0 {
        let rough_orco = Vec3::new(
            psys.frand.get(index + 41) * 2.0 - 1.0,
            psys.frand.get(index + 42) * 2.0 - 1.0,
            psys.frand.get(index + 43) * 2.0 - 1.0,
        );
        do_rough(
            rough_orco,
            t,
            child.rough2,
            child.rough2_size.max(1.0e-4),
            child.rough2_thres,
            key,
        );
    }
    if child.rough_end != 0.0 {
        do_rough_end(index as u32, t, child.rough_end, child.rough_end_shape, key);
    }
    if child.twist != 0.0 {
        do_twist(key, par.co, par_vel, t, child.twist, None);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::{Alive, HairKey};
    use silt_particle::{ChildSettings, ParticleSettings};
    use std::sync::Arc;

    fn hair_system(strands: &[(Vec3, Vec3)], child: ChildSettings) -> ParticleSystem {
        let settings = Arc::new(ParticleSettings {
            count: strands.len(),
            child,
            ..Default::default()
        });
        let mut psys = ParticleSystem::new(settings, 7);
        for (pa, (root, tip)) in psys.particles.iter_mut().zip(strands.iter().copied()) {
            pa.alive = Alive::Alive;
            pa.lifetime = 100.0;
            pa.dietime = 100.0;
            for k in 0..4 {
                let t = k as f32 / 3.0;
                pa.hair.push(HairKey::new(root.lerp(tip, t), t * 100.0));
            }
            pa.prev_state.co = root;
            pa.state.co = root;
        }
        psys
    }

    fn build_ctx<'a>(psys: &'a ParticleSystem) -> PathBuildContext<'a> {
        PathBuildContext {
            psys,
            emitter: None,
            steps: 6,
            child_steps: 6,
            display_fraction: 1.0,
            effector: None,
        }
    }

    #[test]
    fn test_chunked_storage_keeps_indices_stable() {
        let mut set = PathSet::with_paths(300);
        for i in 0..300 {
            let keys = vec![
                PathKey {
                    co: Vec3::splat(i as f32),
                    ..Default::default()
                };
                10
            ];
            set.insert(i, keys);
        }
        assert!(set.chunks.len() > 1);
        for i in 0..300 {
            let path = set.path(i).unwrap();
            assert_eq!(path.len(), 10);
            assert_eq!(path[0].co, Vec3::splat(i as f32));
        }
    }

    #[test]
    fn test_parent_path_follows_straight_hair() {
        let psys = hair_system(&[(Vec3::ZERO, Vec3::new(0.0, 0.0, 3.0))], ChildSettings::default());
        let ctx = build_ctx(&psys);
        let parents = build_parent_paths(&ctx);

        let path = parents.path(0).unwrap();
        assert_eq!(path.len(), 7);
        assert!((path[0].co - Vec3::ZERO).length() < 1e-4);
        assert!((path[6].co - Vec3::new(0.0, 0.0, 3.0)).length() < 1e-4);
        // Points stay on the strand line.
        for key in path {
            assert!(key.co.x.abs() < 1e-4 && key.co.y.abs() < 1e-4);
        }
        // Rotations carry the tangent: rotating +Z by the first key's
        // rotation gives the strand direction.
        let dir = path[0].rot * Vec3::Z;
        assert!((dir - Vec3::Z).length() < 1e-4);
        assert_eq!(parents.segments(0), Some(6));
        assert!(parents.is_visible(0));
    }

    #[test]
    fn test_path_without_enough_keys_is_skipped() {
        let settings = Arc::new(ParticleSettings {
            count: 1,
            ..Default::default()
        });
        let mut psys = ParticleSystem::new(settings, 1);
        psys.particles[0].hair.push(HairKey::new(Vec3::ZERO, 0.0));
        let ctx = build_ctx(&psys);
        let parents = build_parent_paths(&ctx);
        assert!(parents.path(0).is_none());
        assert!(!parents.is_visible(0));
    }

    #[test]
    fn test_interpolate_pathcache_endpoints_and_midpoint() {
        let mut path = vec![
            PathKey {
                co: Vec3::ZERO,
                time: 0.0,
                ..Default::default()
            },
            PathKey {
                co: Vec3::new(1.0, 0.0, 0.0),
                time: 0.5,
                ..Default::default()
            },
            PathKey {
                co: Vec3::new(2.0, 0.0, 0.0),
                time: 1.0,
                ..Default::default()
            },
        ];
        finish_path(&mut path);

        assert!((interpolate_pathcache(&path, 0.0).co - path[0].co).length() < 1e-6);
        assert!((interpolate_pathcache(&path, 1.0).co - path[2].co).length() < 1e-6);
        let mid = interpolate_pathcache(&path, 0.5);
        assert!((mid.co - path[1].co).length() < 1e-6);
    }

    #[test]
    fn test_path_effectors_preserve_segment_lengths() {
        let mut path: Vec<PathKey> = (0..5)
            .map(|k| PathKey {
                co: Vec3::new(0.0, 0.0, k as f32),
                time: k as f32 / 4.0,
                ..Default::default()
            })
            .collect();
        let before: Vec<f32> = path
            .windows(2)
            .map(|w| (w[1].co - w[0].co).length())
            .collect();

        let push = |_co: Vec3| Vec3::new(0.8, 0.0, 0.0);
        do_path_effectors(&push, &mut path);

        let after: Vec<f32> = path
            .windows(2)
            .map(|w| (w[1].co - w[0].co).length())
            .collect();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-5);
        }
        // Root is anchored, tip is deflected.
        assert!((path[0].co - Vec3::ZERO).length() < 1e-6);
        assert!(path[4].co.x > 0.3);
    }

    #[test]
    fn test_task_ranges_cover_everything_once() {
        for total in [0usize, 1, 7, 64, 1000] {
            let ranges = task_ranges(total);
            let mut covered = 0;
            let mut expected_start = 0;
            for range in &ranges {
                assert_eq!(range.start, expected_start);
                expected_start = range.end;
                covered += range.len();
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn test_between_children_blend_parents() {
        let mut psys = hair_system(
            &[
                (Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0)),
                (Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 2.0)),
            ],
            ChildSettings {
                mode: ChildMode::Faces,
                count: 1,
                ..Default::default()
            },
        );
        psys.children = vec![ChildParticle {
            parent: -1,
            pa: [0, 1, -1, -1],
            w: [0.5, 0.5, 0.0, 0.0],
            num: -1,
            fuv: [0.0; 4],
            foffset: 0.0,
        }];
        // Child's own root coincides with the blended root, no offset.
        psys.particles[0].prev_state.co = Vec3::new(0.5, 0.0, 0.0);

        let ctx = build_ctx(&psys);
        let parents = build_parent_paths(&ctx);
        let children = build_child_paths(&ctx, &parents);

        let path = children.path(0).unwrap();
        for key in path {
            assert!((key.co.x - 0.5).abs() < 1e-4);
        }
        assert!((path[path.len() - 1].co.z - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_simple_children_keep_offset_without_modifiers() {
        let psys = hair_system(
            &[(Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0))],
            ChildSettings {
                mode: ChildMode::Simple,
                count: 4,
                radius: 0.2,
                ..Default::default()
            },
        );
        let mut psys = psys;
        distribute_children(&mut psys, None);
        assert_eq!(psys.children.len(), 4);

        let ctx = build_ctx(&psys);
        let parents = build_parent_paths(&ctx);
        let children = build_child_paths(&ctx, &parents);

        let parent_path = parents.path(0).unwrap();
        for i in 0..4 {
            let path = children.path(i).unwrap();
            // Without clump/kink/rough the offset is constant along the
            // strand.
            let root_offset = path[0].co - parent_path[0].co;
            assert!(root_offset.length() <= 0.2 + 1e-4);
            let tip_offset = path[path.len() - 1].co - parent_path[parent_path.len() - 1].co;
            assert!((root_offset - tip_offset).length() < 1e-4);
        }
    }

    #[test]
    fn test_clump_pulls_child_tips_to_parent() {
        let psys = hair_system(
            &[(Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0))],
            ChildSettings {
                mode: ChildMode::Simple,
                count: 2,
                radius: 0.3,
                clump: silt_core::ClumpParams {
                    fac: 1.0,
                    pow: 0.0,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let mut psys = psys;
        distribute_children(&mut psys, None);

        let ctx = build_ctx(&psys);
        let parents = build_parent_paths(&ctx);
        let children = build_child_paths(&ctx, &parents);

        let parent_path = parents.path(0).unwrap();
        for i in 0..2 {
            let path = children.path(i).unwrap();
            let root_dist = (path[0].co - parent_path[0].co).length();
            let tip_dist =
                (path[path.len() - 1].co - parent_path[parent_path.len() - 1].co).length();
            assert!(tip_dist < 0.05 * root_dist.max(1.0e-3) + 1.0e-4);
        }
    }

    #[test]
    fn test_virtual_parents_are_hidden() {
        let mut psys = hair_system(
            &[
                (Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0)),
                (Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 2.0)),
            ],
            ChildSettings {
                mode: ChildMode::Faces,
                count: 2,
                virtual_parents: 1.0,
                ..Default::default()
            },
        );
        distribute_children(&mut psys, None);
        assert_eq!(psys.children.len(), 4);
        assert_eq!(virtual_parent_count(&psys), 2);

        let ctx = build_ctx(&psys);
        let parents = build_parent_paths(&ctx);
        let children = build_child_paths(&ctx, &parents);

        assert!(!children.is_visible(0));
        assert!(!children.is_visible(1));
        // Hidden paths still exist for interpolation.
        assert!(children.path(0).is_some());
        assert!(children.visible().all(|(i, _)| i >= 2));
    }

    #[test]
    fn test_display_fraction_limits_built_children() {
        let mut psys = hair_system(
            &[(Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0))],
            ChildSettings {
                mode: ChildMode::Simple,
                count: 10,
                radius: 0.1,
                ..Default::default()
            },
        );
        distribute_children(&mut psys, None);

        let mut ctx = build_ctx(&psys);
        ctx.display_fraction = 0.5;
        let parents = build_parent_paths(&ctx);
        let children = build_child_paths(&ctx, &parents);

        assert_eq!(children.len(), 5);
    }

    #[test]
    fn test_find_parents_assigns_nearest() {
        let mut psys = hair_system(
            &[
                (Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0)),
                (Vec3::new(10.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 1.0)),
            ],
            ChildSettings {
                mode: ChildMode::Faces,
                count: 1,
                ..Default::default()
            },
        );
        psys.children = vec![ChildParticle {
            parent: -1,
            pa: [-1; 4],
            w: [0.0; 4],
            num: -1,
            fuv: [0.0; 4],
            foffset: 0.0,
        }];
        find_parents(&mut psys, None);

        let cpa = &psys.children[0];
        // Without an emitter the child's coordinate falls back near the
        // first parent; the dominant weight must point at it.
        assert_eq!(cpa.pa[0], 0);
        assert!(cpa.w[0] > 0.9);
        let total: f32 = cpa.w.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }
}
