//! Particle system core.
//!
//! Owns the particle array across resets and reallocation, drives the
//! per-frame step (birth, force integration, fluid forces, collision,
//! aging) and provides the interpolation layer that turns stored key
//! sequences (hair keys, keyed-chain keys, point-cache frames) into
//! continuous states for display and cache playback.

use glam::{Quat, Vec3};
use log::debug;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use silt_collide::{collision_check, Collider, CollisionParams};
use silt_core::{
    do_clump, do_kink, interpolate_keys, Alive, ClumpParams, FrandTable, HairKey, KeyBasis,
    KeyInterp, KinkParams, MappedIndex, Particle, ParticleKey, ParticleRng,
};
use silt_fluid::{
    build_spring_hash, classical_density_pass, flush_springs, springs_modify, FluidSpring,
    SphData, SphSettings, SphSolver, SphSystem, SphWorker, SPH_MAX_SYSTEMS,
};
use silt_mesh::{EmitterMesh, Origin};
use silt_spatial::KdTree3;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// Settings
// ============================================================================

/// Physics driving the particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PhysType {
    /// No motion; particles stay at their birth state.
    None,
    /// Newtonian integration of forces.
    #[default]
    Newton,
    /// States interpolated along a chain of target systems.
    Keyed,
    /// Newtonian integration plus SPH fluid forces.
    Fluid,
}

/// Numerical integration scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Integrator {
    Euler,
    #[default]
    Midpoint,
    Rk4,
    Verlet,
}

/// Source of a particle's birth rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RotMode {
    #[default]
    None,
    Normal,
    NormalTangent,
    Velocity,
    GlobalX,
    GlobalY,
    GlobalZ,
}

/// Axis the angular velocity spins around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AveMode {
    #[default]
    None,
    Velocity,
    Horizontal,
    Vertical,
    GlobalX,
    GlobalY,
    GlobalZ,
}

/// How child particles relate to their parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChildMode {
    #[default]
    None,
    /// Each child offsets from a single parent.
    Simple,
    /// Children distributed on emitter faces, blending up to four
    /// weighted parents.
    Faces,
}

/// Child generation and deformation parameters, consumed by the path
/// cache builder.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChildSettings {
    pub mode: ChildMode,
    /// Children per parent.
    pub count: usize,
    /// Spread radius for simple children.
    pub radius: f32,
    /// Flattens the simple-child spread against the surface (0 round,
    /// 1 flat).
    pub flat: f32,
    pub clump: ClumpParams,
    pub kink: KinkParams,
    /// Uniform roughness, sampled from the child's coordinates.
    pub rough1: f32,
    pub rough1_size: f32,
    /// Random roughness, threshold-gated.
    pub rough2: f32,
    pub rough2_size: f32,
    pub rough2_thres: f32,
    /// Endpoint roughness growing toward the tip.
    pub rough_end: f32,
    pub rough_end_shape: f32,
    /// Twist around the parent strand.
    pub twist: f32,
    /// Random per-child length reduction.
    pub length: f32,
    pub length_thres: f32,
    /// Strand parting by angle (degrees) or tip/root distance ratio.
    pub parting_fac: f32,
    pub parting_min: f32,
    pub parting_max: f32,
    /// Long-hair child blending with rotation fade near the tip.
    pub use_long_hair: bool,
    /// Fraction of parents replaced by invisible virtual parents that
    /// improve child distribution.
    pub virtual_parents: f32,
}

/// Shared particle settings; referenced by any number of systems.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticleSettings {
    pub phys: PhysType,
    pub integrator: Integrator,
    /// Particle count the system reallocates to.
    pub count: usize,
    pub frame_start: f32,
    pub frame_end: f32,
    pub lifetime: f32,
    /// Random per-particle lifetime reduction, 0..1.
    pub random_lifetime: f32,
    /// Global time scale; 1 means 0.04 seconds per frame.
    pub timetweak: f32,
    pub mass: f32,
    pub size: f32,
    /// Random per-particle size reduction, 0..1.
    pub random_size: f32,
    /// Weigh fluid contributions by particle size.
    pub size_mass: bool,
    /// Emitter element kind particles are distributed on.
    pub origin: Origin,
    /// Birth velocity along the surface normal.
    pub normal_factor: f32,
    /// Birth velocity along the rotated surface tangent.
    pub tangent_factor: f32,
    /// Rotates the tangent around the normal, in half turns.
    pub tangent_phase: f32,
    /// Random birth velocity.
    pub random_factor: f32,
    /// Inherited emitter velocity.
    pub object_factor: f32,
    pub rotation_mode: RotMode,
    /// Master switch for rotation simulation.
    pub rotations: bool,
    /// Couple collisions and spin (rolling friction).
    pub dynamic_rotation: bool,
    pub angular_velocity_mode: AveMode,
    pub angular_velocity_factor: f32,
    /// Birth phase rotation around the strand axis, in half turns.
    pub phase_factor: f32,
    pub random_phase_factor: f32,
    pub random_rotation_factor: f32,
    pub die_on_collision: bool,
    /// Collide with the particle size instead of a tiny fixed radius.
    pub size_deflect: bool,
    /// Keyed chains loop back to the first target this many times.
    pub keyed_loops: i32,
    /// Keyed targets carry explicit times and durations.
    pub keyed_timing: bool,
    /// Keyed/hair interpolation uses the B-spline basis.
    pub bspline: bool,
    /// Adaptive substepping from the fluid's Courant condition.
    pub adaptive_subframes: bool,
    /// Target Courant number for adaptive substepping.
    pub courant_target: f32,
    pub fluid: Option<SphSettings>,
    pub child: ChildSettings,
}

impl Default for ParticleSettings {
    fn default() -> Self {
        Self {
            phys: PhysType::Newton,
            integrator: Integrator::Midpoint,
            count: 0,
            frame_start: 1.0,
            frame_end: 200.0,
            lifetime: 50.0,
            random_lifetime: 0.0,
            timetweak: 1.0,
            mass: 1.0,
            size: 0.05,
            random_size: 0.0,
            size_mass: false,
            origin: Origin::Face,
            normal_factor: 0.0,
            tangent_factor: 0.0,
            tangent_phase: 0.0,
            random_factor: 0.0,
            object_factor: 0.0,
            rotation_mode: RotMode::None,
            rotations: false,
            dynamic_rotation: false,
            angular_velocity_mode: AveMode::None,
            angular_velocity_factor: 0.0,
            phase_factor: 0.0,
            random_phase_factor: 0.0,
            random_rotation_factor: 0.0,
            die_on_collision: false,
            size_deflect: false,
            keyed_loops: 1,
            keyed_timing: false,
            bspline: false,
            adaptive_subframes: false,
            courant_target: 0.2,
            fluid: None,
            child: ChildSettings::default(),
        }
    }
}

impl ParticleSettings {
    /// Seconds per frame after time tweaking.
    pub fn timestep(&self) -> f32 {
        0.04 * self.timetweak
    }
}

// ============================================================================
// Particle system
// ============================================================================

/// A child particle; its geometry exists only in the path cache.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChildParticle {
    /// Single parent for simple children, -1 for face children.
    pub parent: i32,
    /// Interpolation parents for face children.
    pub pa: [i32; 4],
    /// Interpolation parent weights.
    pub w: [f32; 4],
    /// Emitter face and weights the child sits on.
    pub num: i32,
    pub fuv: [f32; 4],
    pub foffset: f32,
}

/// Neighbor tree cache, stamped with the frame it was built for.
#[derive(Debug, Default)]
pub struct TreeCache {
    pub frame: f32,
    pub tree: Option<KdTree3>,
}

/// How much of a system's state a reset throws away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    /// Free particles, children and caches unconditionally.
    All,
    /// Dependency-graph reset: like [`ResetLevel::All`] unless the
    /// system was hand edited, in which case state is preserved.
    Depsgraph,
    /// Cache miss: flag particles to be skipped, no reallocation.
    CacheMiss,
}

/// One particle system: the particle array plus everything the per-frame
/// step needs around it.
pub struct ParticleSystem {
    pub particles: Vec<Particle>,
    pub settings: Arc<ParticleSettings>,
    pub children: Vec<ChildParticle>,
    pub fluid_springs: Vec<FluidSpring>,
    /// Frame the system was last stepped to.
    pub cfra: f32,
    pub seed: u64,
    /// Stable per-particle random table.
    pub frand: FrandTable,
    /// The system carries user edits that resets must preserve.
    pub edited: bool,
    /// Neighbor tree over particle positions, shared with cooperating
    /// systems; readers query concurrently, rebuilds take the write lock.
    pub tree: RwLock<TreeCache>,
    /// Courant number observed during the last fluid step.
    pub courant_num: f32,
}

impl ParticleSystem {
    pub fn new(settings: Arc<ParticleSettings>, seed: u64) -> Self {
        let mut psys = Self {
            particles: Vec::new(),
            settings,
            children: Vec::new(),
            fluid_springs: Vec::new(),
            cfra: 0.0,
            seed,
            frand: FrandTable::new(seed),
            edited: false,
            tree: RwLock::new(TreeCache::default()),
            courant_num: 0.0,
        };
        psys.realloc_particles(psys.settings.count);
        psys
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Resets system state down to the requested level.
    pub fn reset(&mut self, level: ResetLevel) {
        match level {
            ResetLevel::CacheMiss => {
                for pa in &mut self.particles {
                    pa.no_disp = true;
                }
                return;
            }
            ResetLevel::Depsgraph if self.edited => {
                debug!("preserving edited particle system across reset");
                return;
            }
            _ => {}
        }

        self.particles.clear();
        self.children.clear();
        self.fluid_springs.clear();
        *self.tree.write().expect("tree lock poisoned") = TreeCache::default();
        self.realloc_particles(self.settings.count);
        self.init_particle_times();
    }

    /// Resizes the particle array, preserving the overlapping prefix.
    /// Hair and key arrays of particles beyond the new size are dropped
    /// with them.
    pub fn realloc_particles(&mut self, new_total: usize) {
        if new_total < self.particles.len() {
            self.particles.truncate(new_total);
        } else {
            self.particles.resize_with(new_total, Particle::default);
        }
    }

    /// Compacts out particles flagged as nonexistent (for example by
    /// texture-driven density). Fluid springs are remapped onto the
    /// compacted indices; springs touching a removed particle go with it.
    pub fn free_unexisting(&mut self) {
        let mut remap = vec![u32::MAX; self.particles.len()];
        let mut next = 0u32;
        for (p, pa) in self.particles.iter().enumerate() {
            if pa.exists() {
                remap[p] = next;
                next += 1;
            }
        }

        self.particles.retain(|pa| pa.exists());
        self.fluid_springs.retain_mut(|spring| {
            let a = remap
                .get(spring.particles[0] as usize)
                .copied()
                .unwrap_or(u32::MAX);
            let b = remap
                .get(spring.particles[1] as usize)
                .copied()
                .unwrap_or(u32::MAX);
            if a == u32::MAX || b == u32::MAX {
                return false;
            }
            spring.particles = [a, b];
            true
        });
    }

    /// Assigns birth times, lifetimes and indices over the emission
    /// window.
    pub fn init_particle_times(&mut self) {
        let part = self.settings.clone();
        let count = self.particles.len().max(1) as f32;
        for (p, pa) in self.particles.iter_mut().enumerate() {
            pa.time = part.frame_start + (part.frame_end - part.frame_start) * p as f32 / count;
            pa.lifetime = part.lifetime * (1.0 - part.random_lifetime * self.frand.get(p + 2));
            pa.dietime = pa.time + pa.lifetime;
            pa.alive = Alive::Unborn;
            pa.num = -1;
            pa.num_remap = MappedIndex::NotFound;
            pa.unexist = false;
            pa.no_disp = false;
        }
    }

    /// Rebuilds the neighbor tree if it is stale for `cfra`. Tree
    /// queries go through the read lock; callers must not hold it here.
    pub fn update_particle_tree(&self, cfra: f32) {
        {
            let cache = self.tree.read().expect("tree lock poisoned");
            if cache.tree.is_some() && cache.frame == cfra {
                return;
            }
        }
        let mut cache = self.tree.write().expect("tree lock poisoned");
        let mut tree = KdTree3::with_capacity(self.particles.len());
        for (p, pa) in self.particles.iter().enumerate() {
            if pa.alive == Alive::Alive || pa.alive == Alive::Dying {
                tree.insert(p as u32, pa.prev_state.co);
            }
        }
        tree.balance();
        cache.tree = Some(tree);
        cache.frame = cfra;
    }

    /// Re-initializes a particle at (or before) its birth.
    pub fn reset_particle(&self, pa: &mut Particle, p: usize, emitter: Option<&EmitterMesh>) {
        let part = &self.settings;

        pa.size = part.size * (1.0 - part.random_size * self.frand.get(p + 1));

        let birth = birth_coords(part, pa, p, &self.frand, emitter);
        pa.state = birth;
        pa.state.time = 0.0;
        pa.prev_state = pa.state;

        pa.alive = Alive::Unborn;
        pa.sph_density = 0.0;
        pa.keys.clear();
    }
}

// ============================================================================
// Birth state
// ============================================================================

fn frand_vec(frand: &FrandTable, base: usize) -> Vec3 {
    Vec3::new(
        2.0 * frand.get(base) - 1.0,
        2.0 * frand.get(base + 1) - 1.0,
        2.0 * frand.get(base + 2) - 1.0,
    )
}

/// Computes a particle's birth position, velocity, rotation and angular
/// velocity from its emitter origin and the birth factors.
pub fn birth_coords(
    part: &ParticleSettings,
    pa: &Particle,
    p: usize,
    frand: &FrandTable,
    emitter: Option<&EmitterMesh>,
) -> ParticleKey {
    let mut state = ParticleKey::default();

    let (pos, nor, utan, vtan) = match emitter {
        Some(mesh) => {
            let s = mesh.particle_on_emitter(part.origin, pa.num, pa.num_remap, &pa.fuv, pa.foffset);
            (pos_or(s.pos), s.nor.normalize_or(Vec3::Z), s.utan, s.vtan)
        }
        None => (Vec3::ZERO, Vec3::Z, Vec3::X, Vec3::Y),
    };

    state.co = pos;

    // Birth velocity terms.
    let mut vel = Vec3::ZERO;
    if part.normal_factor != 0.0 {
        vel += nor * part.normal_factor;
    }
    if part.tangent_factor != 0.0 {
        let phase = part.tangent_phase * std::f32::consts::PI;
        let tangent = (utan * phase.cos() + vtan * phase.sin()).normalize_or_zero();
        vel += tangent * part.tangent_factor;
    }
    if part.random_factor != 0.0 {
        vel += frand_vec(frand, p + 10) * part.random_factor;
    }
    if part.object_factor != 0.0 {
        // Inherited emitter velocity; the emitter is static here, so the
        // term only matters for externally supplied velocities.
        vel += pa.prev_state.vel * part.object_factor;
    }
    state.vel = vel;

    // Birth rotation.
    if part.rotations {
        let rot_vec = match part.rotation_mode {
            RotMode::None => Vec3::ZERO,
            RotMode::Normal => nor,
            RotMode::NormalTangent => {
                let phase = part.tangent_phase * std::f32::consts::PI;
                (nor + (utan * phase.cos() + vtan * phase.sin()) * 0.1).normalize_or(nor)
            }
            RotMode::Velocity => state.vel.normalize_or(nor),
            RotMode::GlobalX => Vec3::X,
            RotMode::GlobalY => Vec3::Y,
            RotMode::GlobalZ => Vec3::Z,
        };

        let axis = rot_vec.normalize_or(Vec3::X);
        let mut rot = Quat::from_rotation_arc(Vec3::X, axis);

        if part.random_rotation_factor != 0.0 {
            let mut rng = ParticleRng::new(0xb1e7 ^ (p as u64 + 1));
            rot = rot.slerp(rng.unit_quat(), part.random_rotation_factor);
        }

        let mut phase = part.phase_factor;
        if part.random_phase_factor != 0.0 {
            phase += part.random_phase_factor * frand.get(p + 20);
        }
        let q_phase = Quat::from_axis_angle(Vec3::X, phase * std::f32::consts::PI);

        state.rot = (rot * q_phase).normalize();
    } else {
        state.rot = Quat::IDENTITY;
    }

    // Birth angular velocity.
    if part.angular_velocity_factor != 0.0 {
        let axis = angular_velocity_axis(part.angular_velocity_mode, &state);
        state.ave = axis * part.angular_velocity_factor;
    }

    state
}

fn pos_or(v: Vec3) -> Vec3 {
    if v.is_finite() {
        v
    } else {
        Vec3::ZERO
    }
}

fn angular_velocity_axis(mode: AveMode, state: &ParticleKey) -> Vec3 {
    let vec = match mode {
        AveMode::None => Vec3::ZERO,
        AveMode::Velocity => state.vel,
        AveMode::Horizontal => state.vel.cross(Vec3::Z),
        AveMode::Vertical => state.vel.cross(Vec3::Z).cross(state.vel),
        AveMode::GlobalX => Vec3::X,
        AveMode::GlobalY => Vec3::Y,
        AveMode::GlobalZ => Vec3::Z,
    };
    vec.normalize_or_zero()
}

// ============================================================================
// Keyed chains
// ============================================================================

/// One link of a keyed chain: a target system plus its timing.
pub struct KeyedTarget<'a> {
    pub system: &'a ParticleSystem,
    /// Offset from the particle's birth, used with keyed timing.
    pub time: f32,
    /// Hold duration; nonzero adds a second key.
    pub duration: f32,
}

/// Rebuilds every particle's keyed key array from the target chain.
///
/// Each target contributes one key per particle (two when timing is on
/// and the target has a hold duration); targets with fewer particles
/// than the source wrap around.
pub fn set_keyed_keys(psys: &mut ParticleSystem, targets: &[KeyedTarget<'_>]) {
    let part = psys.settings.clone();
    let loops = part.keyed_loops.max(1) as usize;

    // Count keys first so the per-particle arrays allocate once.
    let mut totkeys = 0;
    for _ in 0..loops {
        for target in targets {
            totkeys += 1;
            if part.keyed_timing && target.duration != 0.0 {
                totkeys += 1;
            }
        }
    }
    if totkeys < 2 {
        debug!("keyed chain with {totkeys} keys per particle, skipping");
        for pa in &mut psys.particles {
            pa.keys.clear();
        }
        return;
    }

    for (p, pa) in psys.particles.iter_mut().enumerate() {
        pa.keys.clear();
        pa.keys.reserve(totkeys);

        for target in std::iter::repeat(targets.iter()).take(loops).flatten() {
            let tsys = target.system;
            if tsys.particles.is_empty() {
                continue;
            }
            let tpa = &tsys.particles[p % tsys.particles.len()];

            let mut key = tpa.state;
            let k = pa.keys.len();
            if part.keyed_timing {
                key.time = pa.time + target.time;
                pa.keys.push(key);
                if target.duration != 0.0 && k + 1 < totkeys {
                    let mut hold = key;
                    hold.time = pa.time + target.time + target.duration;
                    pa.keys.push(hold);
                }
            } else {
                key.time = pa.time + k as f32 / (totkeys - 1) as f32 * pa.lifetime;
                pa.keys.push(key);
            }
        }
    }
}

// ============================================================================
// Point cache
// ============================================================================

/// In-memory point cache: per-frame snapshots of every particle's state.
#[derive(Debug, Default)]
pub struct PointCache {
    frames: BTreeMap<i32, Vec<ParticleKey>>,
}

impl PointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a frame snapshot.
    pub fn store(&mut self, frame: i32, keys: Vec<ParticleKey>) {
        self.frames.insert(frame, keys);
    }

    /// Exact frame lookup.
    pub fn frame(&self, frame: i32) -> Option<&[ParticleKey]> {
        self.frames.get(&frame).map(Vec::as_slice)
    }

    /// Drops all frames after `frame`, for cache invalidation.
    pub fn truncate_after(&mut self, frame: i32) {
        self.frames.retain(|&f, _| f <= frame);
    }

    /// The two stored frames bracketing `t`, for interpolation.
    pub fn bracket(&self, t: f32) -> Option<(i32, &[ParticleKey], i32, &[ParticleKey])> {
        let lower = self.frames.range(..=(t.floor() as i32)).next_back()?;
        let upper = self.frames.range((t.floor() as i32 + 1)..).next();
        match upper {
            Some(upper) => Some((*lower.0, lower.1, *upper.0, upper.1)),
            None => Some((*lower.0, lower.1, *lower.0, lower.1)),
        }
    }

    /// Last cached frame still containing particle `p`: the die time a
    /// baked simulation displays.
    pub fn dietime_from_cache(&self, p: usize) -> Option<f32> {
        self.frames
            .iter()
            .rev()
            .find(|(_, keys)| p < keys.len())
            .map(|(f, _)| *f as f32)
    }

    /// First and last cached frames containing particle `p`.
    pub fn cached_span(&self, p: usize) -> Option<(i32, i32)> {
        let mut frames = self.frames.iter().filter(|(_, keys)| p < keys.len());
        let first = *frames.next()?.0;
        let last = frames.last().map_or(first, |(f, _)| *f);
        Some((first, last))
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

// ============================================================================
// Interpolation layer
// ============================================================================

/// Backing store a particle's continuous state is interpolated from.
pub enum InterpSource<'a> {
    /// Hair keys, optionally overridden by deformed mesh vertices
    /// starting at the particle's hair index.
    Hair {
        keys: &'a [HairKey],
        deformed: Option<&'a [Vec3]>,
        hair_index: usize,
    },
    /// Keyed-chain keys with explicit velocities.
    Keyed(&'a [ParticleKey]),
    /// Two point-cache frames with explicit velocities.
    Cache(&'a [ParticleKey]),
}

impl InterpSource<'_> {
    fn len(&self) -> usize {
        match self {
            InterpSource::Hair { keys, .. } => keys.len(),
            InterpSource::Keyed(keys) | InterpSource::Cache(keys) => keys.len(),
        }
    }

    fn key(&self, i: usize) -> ParticleKey {
        match self {
            InterpSource::Hair {
                keys,
                deformed,
                hair_index,
            } => {
                let hk = &keys[i];
                let co = match deformed {
                    Some(verts) => verts[hair_index + i],
                    None => hk.co,
                };
                ParticleKey {
                    co,
                    time: hk.time,
                    ..Default::default()
                }
            }
            InterpSource::Keyed(keys) | InterpSource::Cache(keys) => keys[i],
        }
    }

    fn has_velocity(&self) -> bool {
        matches!(self, InterpSource::Keyed(_) | InterpSource::Cache(_))
    }
}

/// Cursor for interpolating one particle's keys at monotonically
/// increasing times within a pass.
pub struct InterpCursor {
    index: usize,
    birthtime: f32,
    dietime: f32,
    bspline: bool,
    /// Scales per-key-interval velocities to per-second.
    timetweak: f32,
}

impl InterpCursor {
    /// Prepares interpolation over `source`. Times outside the key range
    /// clamp to the first/last key.
    pub fn new(source: &InterpSource<'_>, bspline: bool, timetweak: f32) -> Self {
        let n = source.len();
        let (birthtime, dietime) = if n == 0 {
            (0.0, 0.0)
        } else {
            (source.key(0).time, source.key(n - 1).time)
        };
        Self {
            index: 0,
            birthtime,
            dietime,
            bspline,
            timetweak,
        }
    }

    /// Interpolated state at normalized strand position `t` in `[0, 1]`.
    pub fn state_at_fraction(&mut self, source: &InterpSource<'_>, t: f32) -> ParticleKey {
        let time = self.birthtime + (self.dietime - self.birthtime) * t.clamp(0.0, 1.0);
        self.state_at(source, time)
    }

    /// Interpolated state at absolute time `t` (frames). Callers must
    /// request non-decreasing times between resets.
    pub fn state_at(&mut self, source: &InterpSource<'_>, t: f32) -> ParticleKey {
        let n = source.len();
        if n == 0 {
            return ParticleKey::default();
        }
        if n == 1 {
            return source.key(0);
        }

        let t = t.clamp(self.birthtime, self.dietime);

        // Monotonic bracket search from the last position.
        while self.index + 2 < n && source.key(self.index + 1).time < t {
            self.index += 1;
        }
        while self.index > 0 && source.key(self.index).time > t {
            self.index -= 1;
        }

        let i = self.index;
        let keys = [
            source.key(i.saturating_sub(1)),
            source.key(i),
            source.key((i + 1).min(n - 1)),
            source.key((i + 2).min(n - 1)),
        ];

        let dfra = (keys[2].time - keys[1].time).max(f32::EPSILON);
        let keytime = ((t - keys[1].time) / dfra).clamp(0.0, 1.0);
        // Velocities stored per second are rescaled to per key interval
        // for the cubic, then back.
        let invdt = dfra * 0.04 * self.timetweak;

        let mut result = ParticleKey::default();
        if source.has_velocity() {
            let mut keys = keys;
            keys[1].vel *= invdt;
            keys[2].vel *= invdt;
            interpolate_keys(KeyInterp::Hermite, &keys, keytime, &mut result, true);
            result.vel /= invdt;
            result.rot = keys[1].rot.slerp(keys[2].rot, keytime);
        } else {
            let basis = if self.bspline {
                KeyBasis::BSpline
            } else {
                KeyBasis::Cardinal
            };
            interpolate_keys(KeyInterp::Basis(basis), &keys, keytime, &mut result, true);
        }
        result.time = t;
        result
    }
}

/// Interpolated state of particle `p` from two bracketing point-cache
/// frames.
pub fn state_from_cache(cache: &PointCache, p: usize, t: f32, timetweak: f32) -> Option<ParticleKey> {
    let (f1, keys1, f2, keys2) = cache.bracket(t)?;
    let k1 = *keys1.get(p)?;
    let k2 = *keys2.get(p)?;
    if f1 == f2 {
        return Some(k1);
    }
    let mut k1 = k1;
    let mut k2 = k2;
    k1.time = f1 as f32;
    k2.time = f2 as f32;
    let window = [k1, k1, k2, k2];
    let source = InterpSource::Cache(&window[1..3]);
    let mut cursor = InterpCursor::new(&source, false, timetweak);
    Some(cursor.state_at(&source, t))
}

// ============================================================================
// Force integration
// ============================================================================

/// Advances a particle's kinematic state by `dtime` seconds.
///
/// The force callback is evaluated once per scheme stage and returns a
/// `(force, impulse)` pair; impulses are velocity deltas applied to the
/// stage state before its derivative is taken. Verlet needs a valid
/// previous state and falls back to Euler on a particle's first step.
pub fn integrate_particle(
    pa: &mut Particle,
    dtime: f32,
    mass: f32,
    external: Option<Vec3>,
    mut integrator: Integrator,
    first_step: bool,
    mut force_fn: impl FnMut(&ParticleKey) -> (Vec3, Vec3),
) {
    if integrator == Integrator::Verlet && first_step {
        integrator = Integrator::Euler;
    }

    let steps = match integrator {
        Integrator::Euler | Integrator::Verlet => 1,
        Integrator::Midpoint => 2,
        Integrator::Rk4 => 4,
    };

    let mut states = [pa.state; 5];
    // Stage times are offsets into the step, not particle age; the force
    // callback advects neighbors by them.
    states[0].time = 0.0;
    let mut dx = [Vec3::ZERO; 4];
    let mut dv = [Vec3::ZERO; 4];

    for i in 0..steps {
        let (force, impulse) = force_fn(&states[i]);
        let mut acceleration = force / mass;
        if let Some(external) = external {
            acceleration += external;
        }
        states[i].vel += impulse;

        match integrator {
            Integrator::Euler => {
                pa.state.co = states[0].co + states[0].vel * dtime;
                pa.state.vel = states[0].vel + acceleration * dtime;
            }
            Integrator::Midpoint => {
                if i == 0 {
                    states[1].co = states[0].co + states[0].vel * (dtime * 0.5);
                    states[1].vel = states[0].vel + acceleration * (dtime * 0.5);
                    states[1].time = dtime * 0.5;
                } else {
                    pa.state.co = states[0].co + states[1].vel * dtime;
                    pa.state.vel = states[0].vel + acceleration * dtime;
                }
            }
            Integrator::Rk4 => match i {
                0 => {
                    dx[0] = states[0].vel * dtime;
                    dv[0] = acceleration * dtime;
                    states[1].co = states[0].co + dx[0] * 0.5;
                    states[1].vel = states[0].vel + dv[0] * 0.5;
                    states[1].time = dtime * 0.5;
                }
                1 => {
                    dx[1] = (states[0].vel + dv[0] * 0.5) * dtime;
                    dv[1] = acceleration * dtime;
                    states[2].co = states[0].co + dx[1] * 0.5;
                    states[2].vel = states[0].vel + dv[1] * 0.5;
                    states[2].time = dtime * 0.5;
                }
                2 => {
                    dx[2] = (states[0].vel + dv[1] * 0.5) * dtime;
                    dv[2] = acceleration * dtime;
                    states[3].co = states[0].co + dx[2];
                    states[3].vel = states[0].vel + dv[2];
                    states[3].time = dtime;
                }
                _ => {
                    dx[3] = (states[0].vel + dv[2]) * dtime;
                    dv[3] = acceleration * dtime;

                    pa.state.co = states[0].co
                        + dx[0] * (1.0 / 6.0)
                        + dx[1] * (1.0 / 3.0)
                        + dx[2] * (1.0 / 3.0)
                        + dx[3] * (1.0 / 6.0);
                    pa.state.vel = states[0].vel
                        + dv[0] * (1.0 / 6.0)
                        + dv[1] * (1.0 / 3.0)
                        + dv[2] * (1.0 / 3.0)
                        + dv[3] * (1.0 / 6.0);
                }
            },
            Integrator::Verlet => {
                // Self-correcting form: the final velocity is re-derived
                // from the position actually reached.
                pa.state.vel = pa.prev_state.vel + acceleration * dtime;
                pa.state.co = pa.prev_state.co + pa.state.vel * dtime;

                pa.state.vel = (pa.state.co - pa.prev_state.co) / dtime;
            }
        }
    }
}

// ============================================================================
// Rotation
// ============================================================================

/// Integrates a particle's rotation over the substep: an optional
/// velocity-derived spin composed with the angular-velocity rotation.
pub fn basic_rotate(part: &ParticleSettings, pa: &mut Particle, dfra: f32, timestep: f32) {
    if !part.rotations {
        pa.state.rot = Quat::IDENTITY;
        return;
    }

    let dtime = dfra * timestep;
    let mut rot2 = Quat::IDENTITY;

    if part.dynamic_rotation
        && matches!(
            part.angular_velocity_mode,
            AveMode::Velocity | AveMode::Horizontal | AveMode::Vertical
        )
    {
        // Re-derive spin from the velocity direction change.
        let len1 = pa.prev_state.vel.length();
        let len2 = pa.state.vel.length();
        if len1 == 0.0 || len2 == 0.0 {
            pa.state.ave = Vec3::ZERO;
        } else {
            let axis = pa.prev_state.vel.cross(pa.state.vel).normalize_or_zero();
            let angle = (pa.prev_state.vel.dot(pa.state.vel) / (len1 * len2)).clamp(-1.0, 1.0);
            pa.state.ave = axis * (angle.acos() / dtime);
        }

        let vec = angular_velocity_axis(part.angular_velocity_mode, &pa.state);
        if vec != Vec3::ZERO {
            rot2 = Quat::from_axis_angle(vec, dtime * part.angular_velocity_factor);
        }
    }

    let rotfac = pa.state.ave.length();
    let rot1 = if rotfac == 0.0 {
        Quat::IDENTITY
    } else {
        Quat::from_axis_angle(pa.state.ave / rotfac, rotfac * dtime)
    };

    pa.state.rot = (rot2 * (rot1 * pa.prev_state.rot)).normalize();
}

// ============================================================================
// Guides
// ============================================================================

/// A guide curve particles are blended onto during their lifetime.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GuideCurve {
    /// Polyline of the guide, root first.
    pub points: Vec<Vec3>,
    /// Blend strength at zero distance.
    pub strength: f32,
    /// Influence range around the guide root.
    pub max_dist: f32,
    /// Trailing fraction of the lifetime that flies free of the guide.
    pub free: f32,
    /// Kink applied to the guide-relative offset.
    pub kink: KinkParams,
    /// Clump applied to the guide-relative offset.
    pub clump: ClumpParams,
}

impl GuideCurve {
    /// Position and tangent at normalized parameter `t`.
    fn sample(&self, t: f32) -> (Vec3, Vec3) {
        let n = self.points.len();
        if n < 2 {
            let p = self.points.first().copied().unwrap_or(Vec3::ZERO);
            return (p, Vec3::Z);
        }
        let ft = t.clamp(0.0, 1.0) * (n - 1) as f32;
        let i = (ft as usize).min(n - 2);
        let frac = ft - i as f32;
        let a = self.points[i];
        let b = self.points[i + 1];
        (a.lerp(b, frac), (b - a).normalize_or(Vec3::Z))
    }
}

/// Blends a particle's free-flight state toward active guide curves.
/// `time` is the normalized life position; `birth_co` anchors the
/// falloff and the lateral offset. Returns true when any guide had
/// influence, in which case the state is authoritative.
pub fn do_guides(guides: &[GuideCurve], state: &mut ParticleKey, birth_co: Vec3, time: f32) -> bool {
    let mut effect_co = Vec3::ZERO;
    let mut effect_vel = Vec3::ZERO;
    let mut total = 0.0;

    for guide in guides {
        let root = guide.points.first().copied().unwrap_or(Vec3::ZERO);
        let dist = (birth_co - root).length();
        if dist > guide.max_dist || guide.strength <= 0.0 {
            continue;
        }
        let falloff = 1.0 - dist / guide.max_dist.max(f32::EPSILON);
        let strength = guide.strength * falloff;

        let guide_t = (time / (1.0 - guide.free).max(f32::EPSILON)).min(1.0);
        let (pos, tan) = guide.sample(guide_t);

        // Carry the root-relative lateral offset along the curve, then
        // let clump and kink shape it.
        let offset = (birth_co - root) - tan * (birth_co - root).dot(tan);
        let mut key = ParticleKey::at(pos + offset);
        key.rot = Quat::from_rotation_arc(Vec3::Z, tan);
        key.vel = tan;

        let par_rot = key.rot;
        let clump = do_clump(&mut key, pos, guide_t, 1.0, &guide.clump);
        do_kink(&mut key, pos, tan, par_rot, guide_t, &guide.kink, clump);

        effect_co += key.co * strength;
        effect_vel += tan * strength;
        total += strength;
    }

    if total <= 0.0 {
        return false;
    }

    let weight = total.min(1.0);
    let target = effect_co / total;
    let speed = state.vel.length();
    state.co = state.co.lerp(target, weight);
    let dir = (effect_vel / total).normalize_or_zero();
    state.vel = state.vel.lerp(dir * speed, weight);
    true
}

// ============================================================================
// Per-frame stepping
// ============================================================================

/// External inputs to one simulation step.
pub struct StepContext<'a> {
    /// Evaluated emitter mesh for birth sampling.
    pub emitter: Option<&'a EmitterMesh>,
    /// Collider id of the emitter, skipped during birth frames.
    pub emitter_id: Option<u64>,
    /// Colliders active this frame.
    pub colliders: &'a [Collider],
    /// Guide curves, applied after integration.
    pub guides: &'a [GuideCurve],
    /// Constant external acceleration.
    pub gravity: Option<Vec3>,
    /// Cooperating fluid systems whose trees are final for this frame.
    pub fluid_neighbors: &'a [&'a ParticleSystem],
}

/// Assembles the owning system plus its cooperating neighbors into the
/// system list the fluid solver consumes. Truncated to the solver's
/// system limit; the owning system is always index zero.
fn sph_systems<'a>(
    psys: &'a ParticleSystem,
    own_tree: &'a KdTree3,
    neighbors: &'a [&'a ParticleSystem],
    neighbor_trees: &'a [&'a KdTree3],
) -> Vec<SphSystem<'a>> {
    let mut systems = Vec::with_capacity(1 + neighbors.len());
    systems.push(SphSystem {
        particles: &psys.particles,
        tree: own_tree,
        mass: psys.settings.mass,
        size_mass: psys.settings.size_mass,
    });
    for (other, tree) in neighbors.iter().zip(neighbor_trees) {
        systems.push(SphSystem {
            particles: &other.particles,
            tree,
            mass: other.settings.mass,
            size_mass: other.settings.size_mass,
        });
    }
    systems.truncate(SPH_MAX_SYSTEMS);
    systems
}

impl ParticleSystem {
    /// Advances the system from its current frame to `cfra`.
    pub fn step(&mut self, ctx: &StepContext<'_>, cfra: f32) {
        let part = self.settings.clone();
        let old_cfra = self.cfra;
        let dfra = cfra - old_cfra;
        if dfra <= 0.0 {
            self.cfra = cfra;
            return;
        }
        let timestep = part.timestep();
        let dtime = dfra * timestep;

        // Births and deaths.
        for p in 0..self.particles.len() {
            let mut pa = std::mem::take(&mut self.particles[p]);
            if pa.alive == Alive::Unborn && pa.time <= cfra {
                self.reset_particle(&mut pa, p, ctx.emitter);
                if pa.time <= cfra {
                    pa.alive = Alive::Alive;
                }
            }
            if (pa.alive == Alive::Alive || pa.alive == Alive::Dying) && cfra > pa.dietime {
                pa.alive = Alive::Dead;
            }
            self.particles[p] = pa;
        }

        match part.phys {
            PhysType::None | PhysType::Keyed => {}
            PhysType::Newton => self.newton_step(ctx, &part, dfra, dtime, cfra, old_cfra),
            PhysType::Fluid => self.fluid_step(ctx, &part, dfra, dtime, cfra, old_cfra),
        }

        self.cfra = cfra;
    }

    fn newton_step(
        &mut self,
        ctx: &StepContext<'_>,
        part: &ParticleSettings,
        dfra: f32,
        dtime: f32,
        cfra: f32,
        old_cfra: f32,
    ) {
        let timestep = part.timestep();
        let seed = self.seed;

        self.particles
            .par_iter_mut()
            .enumerate()
            .for_each(|(p, pa)| {
                if pa.alive != Alive::Alive || !pa.exists() {
                    return;
                }

                let first_step = pa.prev_state.time <= 0.0 && pa.state.time <= 0.0;
                pa.prev_state = pa.state;

                integrate_particle(
                    pa,
                    dtime,
                    part.mass,
                    ctx.gravity,
                    part.integrator,
                    first_step,
                    |_state| (Vec3::ZERO, Vec3::ZERO),
                );
                pa.state.time = pa.prev_state.time + dfra;

                if !ctx.guides.is_empty() {
                    let life = ((cfra - pa.time) / pa.lifetime.max(f32::EPSILON)).clamp(0.0, 1.0);
                    let birth_co =
                        pa.prev_state.co - pa.prev_state.vel * (pa.state.time * timestep);
                    do_guides(ctx.guides, &mut pa.state, birth_co, life);
                }

                basic_rotate(part, pa, dfra, timestep);

                if !ctx.colliders.is_empty() {
                    let mut rng =
                        ParticleRng::new((seed ^ (cfra.to_bits() as u64) ^ ((p as u64) << 32)) | 1);
                    let params = CollisionParams {
                        timestep,
                        dfra,
                        cfra,
                        old_cfra,
                        emitter: ctx.emitter_id,
                        die_on_collision: part.die_on_collision,
                        dynamic_rotation: part.dynamic_rotation,
                        size_deflect: part.size_deflect,
                    };
                    collision_check(pa, ctx.colliders, &params, &mut rng);
                }
            });
    }

    fn fluid_step(
        &mut self,
        ctx: &StepContext<'_>,
        part: &ParticleSettings,
        dfra: f32,
        dtime: f32,
        cfra: f32,
        old_cfra: f32,
    ) {
        let Some(fluid) = part.fluid.as_ref() else {
            debug!("fluid physics without fluid settings, falling back to newton");
            return self.newton_step(ctx, part, dfra, dtime, cfra, old_cfra);
        };
        let timestep = part.timestep();

        for pa in &mut self.particles {
            if pa.alive == Alive::Alive {
                pa.prev_state = pa.state;
            }
        }

        // Own tree first, then cooperating systems are assumed final.
        self.update_particle_tree(cfra);
        let empty = KdTree3::default();

        // Classical solves density over start-of-step positions before
        // any force evaluation.
        if fluid.solver == SphSolver::Classical {
            let densities = {
                let own_cache = self.tree.read().expect("tree lock poisoned");
                let neighbor_caches: Vec<_> = ctx
                    .fluid_neighbors
                    .iter()
                    .map(|psys| psys.tree.read().expect("tree lock poisoned"))
                    .collect();
                let neighbor_trees: Vec<&KdTree3> = neighbor_caches
                    .iter()
                    .map(|cache| cache.tree.as_ref().unwrap_or(&empty))
                    .collect();
                let systems = sph_systems(
                    self,
                    own_cache.tree.as_ref().unwrap_or(&empty),
                    ctx.fluid_neighbors,
                    &neighbor_trees,
                );
                let spring_hash = build_spring_hash(&[]);
                let data = SphData {
                    systems: &systems,
                    settings: fluid,
                    springs: &[],
                    spring_hash: &spring_hash,
                    gravity: ctx.gravity,
                    hfac: 1.0,
                };
                classical_density_pass(&data)
            };
            for (pa, density) in self.particles.iter_mut().zip(densities) {
                pa.sph_density = density;
            }
        }

        let own_cache = self.tree.read().expect("tree lock poisoned");
        let neighbor_caches: Vec<_> = ctx
            .fluid_neighbors
            .iter()
            .map(|psys| psys.tree.read().expect("tree lock poisoned"))
            .collect();
        let neighbor_trees: Vec<&KdTree3> = neighbor_caches
            .iter()
            .map(|cache| cache.tree.as_ref().unwrap_or(&empty))
            .collect();
        let systems = sph_systems(
            self,
            own_cache.tree.as_ref().unwrap_or(&empty),
            ctx.fluid_neighbors,
            &neighbor_trees,
        );

        let spring_hash = build_spring_hash(&self.fluid_springs);
        let data = SphData {
            systems: &systems,
            settings: fluid,
            springs: &self.fluid_springs,
            spring_hash: &spring_hash,
            gravity: ctx.gravity,
            hfac: 1.0,
        };

        // Force pass over a shared read-only view; each worker buffers
        // its spring creations for the flush after the join.
        let new_states: Vec<Option<(Particle, SphWorker)>> = self
            .particles
            .par_iter()
            .enumerate()
            .map(|(p, pa)| {
                if pa.alive != Alive::Alive || !pa.exists() {
                    return None;
                }
                let mut pa = pa.clone();
                let mut worker = SphWorker::default();
                worker.begin_particle();

                let first_step = pa.prev_state.time <= 0.0 && pa.state.time <= 0.0;
                integrate_particle(
                    &mut pa,
                    dtime,
                    part.mass,
                    ctx.gravity,
                    part.integrator,
                    first_step,
                    |state| (data.force(&mut worker, p, state), Vec3::ZERO),
                );
                pa.state.time = pa.prev_state.time + dfra;

                Some((pa, worker))
            })
            .collect();

        drop(data);
        drop(systems);
        drop(neighbor_trees);
        drop(own_cache);
        drop(neighbor_caches);

        // Write back and flush deferred spring creations, in index order
        // so the merge is deterministic.
        let mut spring_hash = spring_hash;
        let mut courant_num = 0.0f32;
        let mut rng = ParticleRng::new(self.seed ^ (cfra.to_bits() as u64) | 1);
        for (p, entry) in new_states.into_iter().enumerate() {
            let Some((mut pa, worker)) = entry else {
                continue;
            };

            if part.adaptive_subframes && worker.element_size > 0.0 {
                let courant = worker.flow.length() * dtime / worker.element_size;
                courant_num = courant_num.max(courant);
            }

            if !ctx.colliders.is_empty() {
                let params = CollisionParams {
                    timestep,
                    dfra,
                    cfra,
                    old_cfra,
                    emitter: ctx.emitter_id,
                    die_on_collision: part.die_on_collision,
                    dynamic_rotation: part.dynamic_rotation,
                    size_deflect: part.size_deflect,
                };
                collision_check(&mut pa, ctx.colliders, &params, &mut rng);
            }

            self.particles[p] = pa;
            flush_springs(&mut self.fluid_springs, &mut spring_hash, worker.new_springs);
        }

        springs_modify(&mut self.fluid_springs, &self.particles, fluid, dtime);
        self.courant_num = courant_num;
    }

    /// Substeps suggested by the last fluid step's Courant number.
    ///
    /// Callers re-run the frame with `1 / n` fractional steps when this
    /// exceeds one.
    pub fn recommended_subframes(&self) -> u32 {
        let part = &self.settings;
        if !part.adaptive_subframes || self.courant_num <= 0.0 {
            return 1;
        }
        (self.courant_num / part.courant_target.max(1.0e-3)).ceil().max(1.0) as u32
    }
}

// ============================================================================
// Tests
// ============================================================================
