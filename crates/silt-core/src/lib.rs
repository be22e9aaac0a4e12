//! Core particle state types for silt.
//!
//! Provides the building blocks shared by the simulation crates:
//! - [`ParticleKey`] - a kinematic sample (position, velocity, rotation, time)
//! - [`Particle`] - per-particle simulation state and emission coordinates
//! - [`KeyBasis`] / [`interpolate_keys`] - cardinal/B-spline/Hermite key blending
//! - [`ParticleRng`] / [`FrandTable`] - deterministic randomness owned by the
//!   simulation context instead of process-wide state
//! - [`CurveTable`] and the child deformers (clump, kink, roughness, twist)

use glam::{Quat, Vec3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Kinematic keys
// ============================================================================

/// A single kinematic sample along a particle's life or path.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticleKey {
    /// Position in world space.
    pub co: Vec3,
    /// Velocity in units per second.
    pub vel: Vec3,
    /// Orientation.
    pub rot: Quat,
    /// Angular velocity (axis scaled by radians per second).
    pub ave: Vec3,
    /// Time this sample is valid for, in frames.
    pub time: f32,
}

impl Default for ParticleKey {
    fn default() -> Self {
        Self {
            co: Vec3::ZERO,
            vel: Vec3::ZERO,
            rot: Quat::IDENTITY,
            ave: Vec3::ZERO,
            time: 0.0,
        }
    }
}

impl ParticleKey {
    /// Creates a key at the given position with everything else at rest.
    pub fn at(co: Vec3) -> Self {
        Self {
            co,
            ..Default::default()
        }
    }
}

/// A stored hair control point. Positions are in emitter space.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HairKey {
    /// Control point position.
    pub co: Vec3,
    /// Time along the strand, in frames.
    pub time: f32,
    /// Softbody weight, 0 pins the key.
    pub weight: f32,
}

impl HairKey {
    /// Creates a hair key with full weight.
    pub fn new(co: Vec3, time: f32) -> Self {
        Self {
            co,
            time,
            weight: 1.0,
        }
    }
}

// ============================================================================
// Particle
// ============================================================================

/// Lifecycle state of a particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Alive {
    /// Birth time has not been reached yet.
    #[default]
    Unborn,
    /// Simulated normally.
    Alive,
    /// Killed this step, state is frozen at the collision instant.
    Dying,
    /// Past its die time.
    Dead,
}

/// Where a particle's emitter element index points after the emitter mesh
/// has been evaluated. Topology-changing modifier stacks move elements
/// around, so the original index has to be remapped before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MappedIndex {
    /// No matching element on the evaluated mesh; sampling yields zeros.
    #[default]
    NotFound,
    /// Child particles address evaluated-mesh elements directly.
    Child,
    /// Remapped element index on the evaluated mesh.
    Index(u32),
}

/// Per-particle simulation state.
///
/// Owned by a particle system; created at system reset, mutated every
/// simulation step.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Particle {
    /// Current kinematic state.
    pub state: ParticleKey,
    /// State at the start of the current step, needed by Verlet
    /// integration and collision response.
    pub prev_state: ParticleKey,
    /// Hair control points; empty for non-hair particles. When non-empty
    /// there are always at least two keys.
    pub hair: Vec<HairKey>,
    /// Keys resolved from keyed-target systems.
    pub keys: Vec<ParticleKey>,
    /// Birth time in frames.
    pub time: f32,
    /// Lifetime in frames.
    pub lifetime: f32,
    /// Death time in frames.
    pub dietime: f32,
    /// Particle size (radius) in world units.
    pub size: f32,
    /// Emitter element index this particle was distributed on, -1 if none.
    pub num: i32,
    /// Remapped element index on the evaluated emitter mesh.
    pub num_remap: MappedIndex,
    /// Barycentric coordinate on the emitter face (4 weights to cover
    /// quads; the last weight is zero on triangles).
    pub fuv: [f32; 4],
    /// Offset along the face normal for volume emission.
    pub foffset: f32,
    /// SPH density from the last density pass.
    pub sph_density: f32,
    /// First hair vertex index in a deformed hair mesh.
    pub hair_index: u32,
    /// Lifecycle state.
    pub alive: Alive,
    /// Marked non-existent (texture influence or grid culling); compacted
    /// away by the lifecycle.
    pub unexist: bool,
    /// Skip display/caching until properly reset (cache-miss reset).
    pub no_disp: bool,
}

impl Particle {
    /// Whether the particle takes part in simulation and display.
    pub fn exists(&self) -> bool {
        !self.unexist
    }
}

// ============================================================================
// Key interpolation
// ============================================================================

/// Basis used to blend a 4-key window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KeyBasis {
    /// Cardinal (Catmull-Rom like) weights; passes through the keys.
    Cardinal,
    /// Uniform cubic B-spline weights; smooths across the keys.
    BSpline,
}

/// How to interpolate between stored keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KeyInterp {
    /// Cubic Hermite using the keys' stored velocities. Used for sources
    /// that record an explicit velocity per key (keyed targets, point
    /// caches, edit keys).
    Hermite,
    /// 4-key basis blending for sources that only store positions.
    Basis(KeyBasis),
}

/// Weights for blending four consecutive keys at parameter `t` in `[0, 1]`
/// between the middle pair.
pub fn key_curve_position_weights(t: f32, basis: KeyBasis) -> [f32; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    match basis {
        KeyBasis::Cardinal => {
            let fc = 0.71;
            [
                -fc * t3 + 2.0 * fc * t2 - fc * t,
                (2.0 - fc) * t3 + (fc - 3.0) * t2 + 1.0,
                (fc - 2.0) * t3 + (3.0 - 2.0 * fc) * t2 + fc * t,
                fc * t3 - fc * t2,
            ]
        }
        KeyBasis::BSpline => [
            -t3 / 6.0 + 0.5 * t2 - 0.5 * t + 1.0 / 6.0,
            0.5 * t3 - t2 + 2.0 / 3.0,
            -0.5 * t3 + 0.5 * t2 + 0.5 * t + 1.0 / 6.0,
            t3 / 6.0,
        ],
    }
}

/// Cubic Hermite interpolation between two keys with explicit velocities.
///
/// Velocities are expected in per-interval units (the caller scales
/// per-second velocities by the key interval). Returns position and the
/// analytic derivative.
pub fn hermite_interpolate(
    co1: Vec3,
    vel1: Vec3,
    co2: Vec3,
    vel2: Vec3,
    t: f32,
) -> (Vec3, Vec3) {
    let t2 = t * t;
    let t3 = t2 * t;

    let co = co1 * (2.0 * t3 - 3.0 * t2 + 1.0)
        + vel1 * (t3 - 2.0 * t2 + t)
        + vel2 * (t3 - t2)
        + co2 * (-2.0 * t3 + 3.0 * t2);
    let vel = co1 * (6.0 * t2 - 6.0 * t)
        + vel1 * (3.0 * t2 - 4.0 * t + 1.0)
        + vel2 * (3.0 * t2 - 2.0 * t)
        + co2 * (-6.0 * t2 + 6.0 * t);

    (co, vel)
}

fn weighted_v3(keys: &[ParticleKey; 4], w: [f32; 4]) -> Vec3 {
    keys[0].co * w[0] + keys[1].co * w[1] + keys[2].co * w[2] + keys[3].co * w[3]
}

/// Interpolates a 4-key window at parameter `t` between `keys[1]` and
/// `keys[2]`.
///
/// Hermite interpolation only looks at the middle pair; basis
/// interpolation blends all four and derives velocity by a small finite
/// difference, stepping backwards at the very end of the interval so the
/// sample stays inside it.
pub fn interpolate_keys(
    interp: KeyInterp,
    keys: &[ParticleKey; 4],
    t: f32,
    result: &mut ParticleKey,
    velocity: bool,
) {
    match interp {
        KeyInterp::Hermite => {
            let (co, vel) =
                hermite_interpolate(keys[1].co, keys[1].vel, keys[2].co, keys[2].vel, t);
            result.co = co;
            result.vel = vel;
        }
        KeyInterp::Basis(basis) => {
            let w = key_curve_position_weights(t, basis);
            result.co = weighted_v3(keys, w);

            if velocity {
                if t > 0.999 {
                    let w = key_curve_position_weights(t - 0.001, basis);
                    result.vel = result.co - weighted_v3(keys, w);
                } else {
                    let w = key_curve_position_weights(t + 0.001, basis);
                    result.vel = weighted_v3(keys, w) - result.co;
                }
            }
        }
    }
}

// ============================================================================
// Randomness
// ============================================================================

/// Simple xorshift random number generator.
///
/// Deterministic and cheap; every parallel task owns its own instance.
#[derive(Debug, Clone)]
pub struct ParticleRng {
    state: u64,
}

impl Default for ParticleRng {
    fn default() -> Self {
        Self::new(12345)
    }
}

impl ParticleRng {
    /// Creates a new RNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Returns a random f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Returns a random f32 in [min, max).
    pub fn range(&mut self, min: f32, max: f32) -> f32 {
        min + self.next_f32() * (max - min)
    }

    /// Returns a random unit vector.
    pub fn unit_sphere(&mut self) -> Vec3 {
        loop {
            let v = Vec3::new(
                self.range(-1.0, 1.0),
                self.range(-1.0, 1.0),
                self.range(-1.0, 1.0),
            );
            let len_sq = v.length_squared();
            if len_sq > 0.0001 && len_sq <= 1.0 {
                return v / len_sq.sqrt();
            }
        }
    }

    /// Returns a random unit quaternion.
    pub fn unit_quat(&mut self) -> Quat {
        Quat::from_xyzw(
            self.range(-1.0, 1.0),
            self.range(-1.0, 1.0),
            self.range(-1.0, 1.0),
            self.range(-1.0, 1.0),
        )
        .normalize()
    }
}

/// Number of entries in a [`FrandTable`].
pub const FRAND_COUNT: usize = 1024;

/// Precomputed table of uniform random values in [0, 1).
///
/// Gives every particle stable per-attribute random numbers across frames
/// and threads: attribute lookups use `particle index + attribute offset`
/// so re-simulating a frame sees identical values. Owned by the particle
/// system and passed by reference.
#[derive(Debug, Clone)]
pub struct FrandTable {
    values: Vec<f32>,
}

impl FrandTable {
    /// Builds the table from a seed.
    pub fn new(seed: u64) -> Self {
        let mut rng = ParticleRng::new(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).max(1));
        let values = (0..FRAND_COUNT).map(|_| rng.next_f32()).collect();
        Self { values }
    }

    /// Returns the table value for the given index, wrapping around.
    pub fn get(&self, index: usize) -> f32 {
        self.values[index % FRAND_COUNT]
    }
}

// ============================================================================
// Sampled curves
// ============================================================================

/// A 1-D curve sampled into a lookup table.
///
/// Stands in for user-editable falloff curves: child modifiers evaluate
/// these instead of recomputing curve mappings per key.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurveTable {
    samples: Vec<f32>,
}

impl CurveTable {
    /// Samples `f` over `[0, 1]` into `resolution` entries.
    pub fn from_fn(resolution: usize, f: impl Fn(f32) -> f32) -> Self {
        let n = resolution.max(2);
        let samples = (0..n)
            .map(|i| f(i as f32 / (n - 1) as f32))
            .collect();
        Self { samples }
    }

    /// The identity ramp.
    pub fn linear() -> Self {
        Self::from_fn(33, |t| t)
    }

    /// Evaluates the curve at `t` in `[0, 1]` with linear filtering.
    pub fn evaluate(&self, t: f32) -> f32 {
        let n = self.samples.len();
        let x = t.clamp(0.0, 1.0) * (n - 1) as f32;
        let i = (x as usize).min(n - 2);
        let f = x - i as f32;
        self.samples[i] * (1.0 - f) + self.samples[i + 1] * f
    }
}

// ============================================================================
// Child deformers
// ============================================================================

/// Kink wave shape applied along child strands and guide offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KinkType {
    /// No kink.
    #[default]
    None,
    /// Helical curl around the strand direction.
    Curl,
    /// Pulsing toward/away from the parent strand.
    Radial,
    /// Sideways wave along a fixed axis.
    Wave,
    /// Interleaved braid pattern.
    Braid,
}

/// Kink parameters, shared between guide deflection and child paths.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KinkParams {
    /// Wave shape.
    pub kind: KinkType,
    /// Waves over the strand length.
    pub freq: f32,
    /// Offsets the wave phase toward root (-1) or tip (1).
    pub shape: f32,
    /// Wave amplitude in world units.
    pub amplitude: f32,
    /// How much clump reduces the amplitude, 0..1.
    pub amp_clump: f32,
    /// Wave axis (0 = x, 1 = y, 2 = z), used by wave and braid.
    pub axis: u8,
    /// Flatten the wave into the axis plane, 0..1.
    pub flat: f32,
}

impl Default for KinkParams {
    fn default() -> Self {
        Self {
            kind: KinkType::None,
            freq: 2.0,
            shape: 0.0,
            amplitude: 0.2,
            amp_clump: 1.0,
            axis: 0,
            flat: 0.0,
        }
    }
}

/// Clump parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClumpParams {
    /// Pull strength toward the parent, negative pushes tips out.
    pub fac: f32,
    /// Shape exponent, -1..1; positive clumps near the tip.
    pub pow: f32,
    /// Scale clumping by random per-clump noise.
    pub use_noise: bool,
    /// Noise cell size for clump noise.
    pub noise_size: f32,
    /// Optional clump-over-length curve; overrides `fac`/`pow` shaping.
    pub curve: Option<CurveTable>,
}

impl Default for ClumpParams {
    fn default() -> Self {
        Self {
            fac: 0.0,
            pow: 0.0,
            use_noise: false,
            noise_size: 1.0,
            curve: None,
        }
    }
}

fn kink_axis_vec(axis: u8) -> Vec3 {
    match axis {
        0 => Vec3::X,
        1 => Vec3::Y,
        _ => Vec3::Z,
    }
}

/// Applies the kink deformation to `key`, offsetting it relative to the
/// parent sample at the same strand time.
///
/// `time` runs 0..1 from root to tip and `clump` is the clump amount
/// already applied at this key, used to fade the amplitude where strands
/// are gathered.
pub fn do_kink(
    key: &mut ParticleKey,
    par_co: Vec3,
    par_vel: Vec3,
    par_rot: Quat,
    time: f32,
    params: &KinkParams,
    clump: f32,
) {
    if params.kind == KinkType::None || params.freq == 0.0 {
        return;
    }

    let t = (time + params.shape) * params.freq * std::f32::consts::PI;
    let amplitude = params.amplitude * (1.0 - params.amp_clump * clump);
    if amplitude == 0.0 {
        return;
    }

    let axis = (par_rot * kink_axis_vec(params.axis)).normalize_or_zero();
    let par_vec = key.co - par_co;

    match params.kind {
        KinkType::None => {}
        KinkType::Curl => {
            // Rotate the lateral offset around the strand direction.
            let dir = par_vel.normalize_or(axis);
            let side = dir.cross(axis).normalize_or(Vec3::Y);
            let offset = Quat::from_axis_angle(dir, t) * (side * amplitude);
            key.co += offset;
        }
        KinkType::Radial => {
            key.co += par_vec * (-amplitude * t.sin());
        }
        KinkType::Wave => {
            let mut offset = axis * (amplitude * t.sin());
            if params.flat > 0.0 {
                let lateral = par_vec - axis * par_vec.dot(axis);
                offset -= lateral * params.flat;
            }
            key.co += offset;
        }
        KinkType::Braid => {
            let dir = par_vel.normalize_or(Vec3::Z);
            let side = axis.cross(dir).normalize_or(Vec3::Y);
            let wave = axis * t.cos() + side * (2.0 * t).sin() * 0.5;
            key.co = par_co + par_vec * (1.0 - params.flat) + wave * amplitude;
        }
    }
}

fn clump_noise(par_co: Vec3, noise_size: f32) -> Vec3 {
    // Cheap value noise keyed on the clump cell; enough to break up
    // perfectly even clump centers.
    let cell = par_co / noise_size.max(1.0e-4);
    let h = |v: f32, s: f32| ((v * 12.9898 + s).sin() * 43758.547).fract() - 0.5;
    Vec3::new(
        h(cell.x + cell.z, 1.0),
        h(cell.y + cell.x, 7.0),
        h(cell.z + cell.y, 13.0),
    ) * noise_size
}

/// Applies clumping, pulling `key` toward the parent sample.
///
/// Returns the clump amount used, so kink can fade its amplitude.
pub fn do_clump(
    key: &mut ParticleKey,
    par_co: Vec3,
    time: f32,
    pa_clump: f32,
    params: &ClumpParams,
) -> f32 {
    let clump = match &params.curve {
        Some(curve) => pa_clump * curve.evaluate(time).clamp(-1.0, 1.0),
        None => {
            if params.fac == 0.0 {
                return 0.0;
            }
            let cpow = if params.pow < 0.0 {
                1.0 + params.pow
            } else {
                1.0 + 9.0 * params.pow
            };
            if params.fac < 0.0 {
                // Negative clump spreads the tips.
                -params.fac * pa_clump * (1.0 - time).powf(cpow)
            } else {
                params.fac * pa_clump * time.powf(cpow)
            }
        }
    };

    let target = if params.use_noise {
        par_co + clump_noise(par_co, params.noise_size)
    } else {
        par_co
    };

    key.co = key.co.lerp(target, clump.clamp(-1.0, 1.0));
    clump
}

/// Roughness parameters for child strands.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RoughParams {
    /// Uniform roughness amplitude, follows the emitter surface position.
    pub rough1: f32,
    /// Uniform roughness noise size.
    pub rough1_size: f32,
    /// Thresholded random roughness amplitude.
    pub rough2: f32,
    /// Random roughness noise size.
    pub rough2_size: f32,
    /// Fraction of strands affected by random roughness.
    pub rough2_threshold: f32,
    /// Endpoint roughness amplitude.
    pub rough_end: f32,
    /// Endpoint roughness shape exponent.
    pub rough_end_shape: f32,
}

fn turbulence(v: Vec3) -> Vec3 {
    // Hash-based substitute for gradient noise, good enough for strand
    // jitter and fully deterministic.
    let h = |x: f32, s: f32| ((x * 127.1 + s).sin() * 43758.547).fract() * 2.0 - 1.0;
    let d = v.x * 1.7 + v.y * 2.3 + v.z * 3.1;
    Vec3::new(h(d, 311.7), h(d, 74.7), h(d, 269.5))
}

/// Uniform roughness: smooth turbulence keyed on the strand's surface
/// coordinate so neighboring strands wave together.
pub fn do_rough(orco: Vec3, time: f32, fac: f32, size: f32, thres: f32, key: &mut ParticleKey) {
    if thres != 0.0 && (orco.x + orco.y + orco.z).abs() < thres {
        return;
    }
    let rough = turbulence(orco / size.max(1.0e-4) + Vec3::splat(time));
    key.co += (key.rot * rough) * (fac * time);
}

/// Endpoint roughness: random offset growing toward the strand tip.
pub fn do_rough_end(loop_seed: u32, time: f32, fac: f32, shape: f32, key: &mut ParticleKey) {
    let mut rng = ParticleRng::new(0x5f37_59df ^ u64::from(loop_seed));
    let rough = Vec3::new(rng.range(-1.0, 1.0), rng.range(-1.0, 1.0), 0.0);
    let roughfac = fac * time.powf(shape.max(0.0) + 1.0);
    key.co += (key.rot * rough) * roughfac;
}

/// Twists the child offset around the parent strand direction.
pub fn do_twist(
    key: &mut ParticleKey,
    par_co: Vec3,
    par_vel: Vec3,
    time: f32,
    twist: f32,
    curve: Option<&CurveTable>,
) {
    if twist == 0.0 {
        return;
    }
    let fac = match curve {
        Some(c) => twist * c.evaluate(time),
        None => twist,
    };
    let axis = par_vel.normalize_or_zero();
    if axis == Vec3::ZERO {
        return;
    }
    let angle = fac * std::f32::consts::TAU * time;
    let offset = key.co - par_co;
    key.co = par_co + Quat::from_axis_angle(axis, angle) * offset;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_at(co: Vec3, time: f32) -> ParticleKey {
        ParticleKey {
            co,
            time,
            ..Default::default()
        }
    }

    #[test]
    fn test_cardinal_weights_pass_through() {
        let w = key_curve_position_weights(0.0, KeyBasis::Cardinal);
        assert_eq!(w, [0.0, 1.0, 0.0, 0.0]);

        let w = key_curve_position_weights(1.0, KeyBasis::Cardinal);
        assert!((w[0]).abs() < 1.0e-6);
        assert!((w[1]).abs() < 1.0e-6);
        assert!((w[2] - 1.0).abs() < 1.0e-6);
        assert!((w[3]).abs() < 1.0e-6);
    }

    #[test]
    fn test_weights_partition_of_unity() {
        for basis in [KeyBasis::Cardinal, KeyBasis::BSpline] {
            for i in 0..=10 {
                let t = i as f32 / 10.0;
                let w = key_curve_position_weights(t, basis);
                let sum: f32 = w.iter().sum();
                assert!((sum - 1.0).abs() < 1.0e-5, "{basis:?} at {t}: {sum}");
            }
        }
    }

    #[test]
    fn test_cardinal_midpoint_exact() {
        // Four collinear, evenly time-spaced keys: interpolation at the
        // middle key's time must reproduce it exactly.
        let keys = [
            key_at(Vec3::new(0.0, 0.0, 0.0), 0.0),
            key_at(Vec3::new(1.0, 0.0, 0.0), 1.0),
            key_at(Vec3::new(2.0, 0.0, 0.0), 2.0),
            key_at(Vec3::new(3.0, 0.0, 0.0), 3.0),
        ];
        let mut result = ParticleKey::default();
        interpolate_keys(
            KeyInterp::Basis(KeyBasis::Cardinal),
            &keys,
            0.0,
            &mut result,
            false,
        );
        assert_eq!(result.co, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_hermite_endpoints() {
        let (co, vel) = hermite_interpolate(
            Vec3::ZERO,
            Vec3::X,
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::X,
            0.0,
        );
        assert!((co - Vec3::ZERO).length() < 1.0e-6);
        assert!((vel - Vec3::X).length() < 1.0e-6);

        let (co, _) = hermite_interpolate(
            Vec3::ZERO,
            Vec3::X,
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::X,
            1.0,
        );
        assert!((co - Vec3::new(0.0, 1.0, 0.0)).length() < 1.0e-6);
    }

    #[test]
    fn test_rng_deterministic() {
        let mut a = ParticleRng::new(42);
        let mut b = ParticleRng::new(42);
        for _ in 0..32 {
            assert_eq!(a.next_f32(), b.next_f32());
        }
    }

    #[test]
    fn test_rng_range() {
        let mut rng = ParticleRng::new(7);
        for _ in 0..200 {
            let v = rng.next_f32();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_rng_unit_sphere() {
        let mut rng = ParticleRng::new(3);
        for _ in 0..50 {
            let v = rng.unit_sphere();
            assert!((v.length() - 1.0).abs() < 1.0e-3);
        }
    }

    #[test]
    fn test_frand_table_wraps() {
        let table = FrandTable::new(99);
        assert_eq!(table.get(5), table.get(5 + FRAND_COUNT));
        for i in 0..FRAND_COUNT {
            let v = table.get(i);
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_curve_table_linear() {
        let curve = CurveTable::linear();
        assert!((curve.evaluate(0.0)).abs() < 1.0e-6);
        assert!((curve.evaluate(0.5) - 0.5).abs() < 1.0e-3);
        assert!((curve.evaluate(1.0) - 1.0).abs() < 1.0e-6);
    }

    #[test]
    fn test_clump_pulls_toward_parent() {
        let params = ClumpParams {
            fac: 1.0,
            ..Default::default()
        };
        let par_co = Vec3::ZERO;
        let mut key = ParticleKey::at(Vec3::new(1.0, 0.0, 0.0));
        let before = key.co.distance(par_co);
        do_clump(&mut key, par_co, 1.0, 1.0, &params);
        assert!(key.co.distance(par_co) < before);
    }

    #[test]
    fn test_clump_zero_is_identity() {
        let params = ClumpParams::default();
        let mut key = ParticleKey::at(Vec3::new(1.0, 2.0, 3.0));
        do_clump(&mut key, Vec3::ZERO, 0.5, 1.0, &params);
        assert_eq!(key.co, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_kink_none_is_identity() {
        let params = KinkParams::default();
        let mut key = ParticleKey::at(Vec3::ONE);
        do_kink(
            &mut key,
            Vec3::ZERO,
            Vec3::Z,
            Quat::IDENTITY,
            0.5,
            &params,
            0.0,
        );
        assert_eq!(key.co, Vec3::ONE);
    }

    #[test]
    fn test_twist_preserves_distance() {
        let par_co = Vec3::ZERO;
        let mut key = ParticleKey::at(Vec3::new(1.0, 0.0, 0.5));
        let before = key.co.distance(par_co);
        do_twist(&mut key, par_co, Vec3::Z, 0.5, 1.0, None);
        assert!((key.co.distance(par_co) - before).abs() < 1.0e-5);
    }
}
