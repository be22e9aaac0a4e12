//! SPH fluid forces.
//!
//! Two interchangeable solvers compute a per-particle force from kernel
//! sums over nearby particles:
//!
//! - [`SphSolver::Ddr`] - double density relaxation: density and near
//!   density from a linear kernel, pressure as linear deviation from rest
//!   density, optional viscoelastic springs with plastic rest lengths.
//! - [`SphSolver::Classical`] - textbook SPH with a Tait (7th power)
//!   equation of state and a Wendland quartic kernel gradient.
//!
//! Neighbor queries run against per-system k-d trees; up to
//! [`SPH_MAX_SYSTEMS`] cooperating systems contribute neighbors. Spring
//! creation during the parallel force pass is deferred into per-worker
//! buffers and flushed after the join, so the shared spring list is never
//! mutated concurrently.

use glam::Vec3;
use log::debug;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use silt_core::{Particle, ParticleKey};
use silt_spatial::KdTree3;
use std::collections::HashMap;
use std::f32::consts::PI;

/// Hard cap on neighbors considered per evaluation. Past this the kernel
/// sums would be biased by tree search order, so extras are dropped.
pub const SPH_NEIGHBORS: usize = 512;

/// Maximum number of cooperating particle systems per fluid.
pub const SPH_MAX_SYSTEMS: usize = 10;

// ============================================================================
// Settings
// ============================================================================

/// Which SPH formulation drives the fluid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SphSolver {
    /// Double density relaxation, viscoelastic.
    #[default]
    Ddr,
    /// Classical SPH with a Tait equation of state.
    Classical,
}

/// Fluid parameters shared by both solvers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SphSettings {
    /// Solver variant.
    pub solver: SphSolver,
    /// Base interaction radius.
    pub radius: f32,
    /// Scale the interaction radius by `4 x particle size`.
    pub fac_radius: bool,
    /// Rest density the pressure terms deviate from.
    pub rest_density: f32,
    /// Scale rest density by the experimentally determined packing
    /// factor 4.77.
    pub fac_density: bool,
    /// Pressure stiffness.
    pub stiffness: f32,
    /// Near-pressure stiffness (DDR repulsion term).
    pub stiffness_near: f32,
    /// Scale near-pressure stiffness by the main stiffness.
    pub fac_repulsion: bool,
    /// Linear viscosity, applied to approaching pairs.
    pub viscosity: f32,
    /// Stiff (square) viscosity, applied to separating pairs.
    pub stiff_viscosity: f32,
    /// Scale stiff viscosity by the linear viscosity.
    pub fac_viscosity: bool,
    /// Spring stiffness; zero disables springs entirely.
    pub spring_k: f32,
    /// Base spring rest length.
    pub rest_length: f32,
    /// Scale the rest length by `2.588 x particle size`.
    pub fac_rest_length: bool,
    /// New springs take the pair's current distance as rest length
    /// instead of the configured one.
    pub current_rest_length: bool,
    /// Persistent springs with plastic rest lengths; off means a plain
    /// Hookean force toward the configured rest length.
    pub viscoelastic_springs: bool,
    /// Springs only form during this many frames after birth (zero means
    /// always).
    pub spring_frames: f32,
    /// Plastic yield threshold as a fraction of rest length.
    pub yield_ratio: f32,
    /// Plastic flow rate once past the yield threshold.
    pub plasticity: f32,
    /// Buoyancy along negative gravity, scaled by density deviation.
    pub buoyancy: f32,
    /// Track average neighbor spacing and flow velocity for adaptive
    /// substepping.
    pub track_courant: bool,
}

impl Default for SphSettings {
    fn default() -> Self {
        Self {
            solver: SphSolver::Ddr,
            radius: 1.0,
            fac_radius: true,
            rest_density: 1.0,
            fac_density: true,
            stiffness: 1.0,
            stiffness_near: 1.0,
            fac_repulsion: true,
            viscosity: 2.0,
            stiff_viscosity: 0.1,
            fac_viscosity: true,
            spring_k: 0.0,
            rest_length: 1.0,
            fac_rest_length: true,
            current_rest_length: false,
            viscoelastic_springs: false,
            spring_frames: 30.0,
            yield_ratio: 0.1,
            plasticity: 1.0,
            buoyancy: 0.0,
            track_courant: false,
        }
    }
}

impl SphSettings {
    /// Interaction radius for a particle of the given size.
    pub fn interaction_radius(&self, size: f32) -> f32 {
        self.radius * if self.fac_radius { 4.0 * size } else { 1.0 }
    }

    fn effective_rest_density(&self) -> f32 {
        self.rest_density * if self.fac_density { 4.77 } else { 1.0 }
    }

    fn effective_rest_length(&self, size: f32) -> f32 {
        self.rest_length * if self.fac_rest_length { 2.588 * size } else { 1.0 }
    }
}

// ============================================================================
// Springs
// ============================================================================

/// A fluid spring between two particles of the owning system.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FluidSpring {
    /// The two particle indices.
    pub particles: [u32; 2],
    /// Current (plastically adapted) rest length.
    pub rest_length: f32,
    /// Marked for the purge sweep.
    pub delete: bool,
}

/// Order-independent key for a particle pair.
pub fn spring_pair_key(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Pair lookup over the spring list for O(1) existence checks.
pub fn build_spring_hash(springs: &[FluidSpring]) -> HashMap<(u32, u32), usize> {
    springs
        .iter()
        .enumerate()
        .map(|(i, s)| (spring_pair_key(s.particles[0], s.particles[1]), i))
        .collect()
}

/// Appends springs buffered by force-pass workers, skipping pairs that
/// already have one. Call after the parallel pass has joined.
pub fn flush_springs(
    springs: &mut Vec<FluidSpring>,
    hash: &mut HashMap<(u32, u32), usize>,
    buffered: impl IntoIterator<Item = FluidSpring>,
) {
    for spring in buffered {
        let key = spring_pair_key(spring.particles[0], spring.particles[1]);
        if let std::collections::hash_map::Entry::Vacant(e) = hash.entry(key) {
            e.insert(springs.len());
            springs.push(spring);
        }
    }
}

/// Plastic rest-length adaptation and purge of over-stretched springs.
///
/// Rest length flows toward the current pair distance once the deviation
/// exceeds the yield band, and any spring whose rest length grows past
/// `4 x particle size` is removed. The purge runs backwards so each
/// removal is a swap with the tail.
pub fn springs_modify(
    springs: &mut Vec<FluidSpring>,
    particles: &[Particle],
    settings: &SphSettings,
    dtime: f32,
) {
    if settings.spring_k == 0.0 || !settings.viscoelastic_springs {
        return;
    }

    let timefix = 25.0 * dtime;
    let yield_ratio = settings.yield_ratio;
    let plasticity = settings.plasticity;

    for spring in springs.iter_mut() {
        let pa1 = &particles[spring.particles[0] as usize];
        let pa2 = &particles[spring.particles[1] as usize];

        let rij = pa2.prev_state.co.distance(pa1.prev_state.co);
        let lij = spring.rest_length;
        let d = yield_ratio * timefix * lij;

        if rij > lij + d {
            spring.rest_length += plasticity * (rij - lij - d) * timefix;
        } else if rij < lij - d {
            spring.rest_length -= plasticity * (lij - d - rij) * timefix;
        }

        if spring.rest_length > 4.0 * pa1.size {
            spring.delete = true;
        }
    }

    for i in (0..springs.len()).rev() {
        if springs[i].delete {
            springs.swap_remove(i);
        }
    }
}

// ============================================================================
// Evaluation context
// ============================================================================

/// One particle system's contribution to a fluid evaluation.
pub struct SphSystem<'a> {
    /// Particle array.
    pub particles: &'a [Particle],
    /// Neighbor tree over this system's particle positions at step start.
    pub tree: &'a KdTree3,
    /// Per-particle mass.
    pub mass: f32,
    /// Weigh each particle's contribution by its size.
    pub size_mass: bool,
}

/// Immutable per-step fluid evaluation data, shared by all workers.
///
/// `systems[0]` owns the particles being integrated; the remaining
/// entries are cooperating systems whose trees are already finalized for
/// this frame.
pub struct SphData<'a> {
    /// Cooperating systems, truncated to [`SPH_MAX_SYSTEMS`].
    pub systems: &'a [SphSystem<'a>],
    /// Fluid parameters (taken from the owning system).
    pub settings: &'a SphSettings,
    /// Springs of the owning system.
    pub springs: &'a [FluidSpring],
    /// Pair lookup over `springs`.
    pub spring_hash: &'a HashMap<(u32, u32), usize>,
    /// Gravity, for buoyancy.
    pub gravity: Option<Vec3>,
    /// Smoothing-length factor applied to the interaction radius.
    pub hfac: f32,
}

/// Mutable per-worker state for one force pass: spring creations are
/// buffered here and Courant tracking accumulates here.
#[derive(Debug, Clone, Default)]
pub struct SphWorker {
    /// Evaluations done by this worker (Courant data is sampled on the
    /// first evaluation of each particle step).
    pub pass: u32,
    /// Average distance to neighbors, for adaptive substepping.
    pub element_size: f32,
    /// Average neighbor velocity, for adaptive substepping.
    pub flow: Vec3,
    /// Springs to create, flushed after the parallel pass.
    pub new_springs: Vec<FluidSpring>,
}

impl SphWorker {
    /// Resets per-particle evaluation state; spring buffer is kept.
    pub fn begin_particle(&mut self) {
        self.pass = 0;
    }
}

struct SphNeighbor {
    system: u32,
    index: u32,
    dist_sq: f32,
}

/// Transient neighbor set plus the two kernel accumulators, valid for one
/// density/force evaluation.
struct SphRangeData {
    neighbors: Vec<SphNeighbor>,
    /// `(density, near_density)` for DDR, `(density, density ratio sum)`
    /// for classical.
    data: [f32; 2],
}

impl SphRangeData {
    fn new() -> Self {
        Self {
            neighbors: Vec::with_capacity(64),
            data: [0.0; 2],
        }
    }
}

impl<'a> SphData<'a> {
    fn systems(&self) -> &[SphSystem<'a>] {
        &self.systems[..self.systems.len().min(SPH_MAX_SYSTEMS)]
    }

    /// Collects neighbors of `co` within `radius` from every system tree,
    /// excluding the owning particle itself, capped at [`SPH_NEIGHBORS`].
    fn gather(&self, own_index: usize, co: Vec3, radius: f32) -> SphRangeData {
        let mut pfr = SphRangeData::new();
        for (si, sys) in self.systems().iter().enumerate() {
            sys.tree.range(co, radius, |index, dist_sq| {
                if si == 0 && index as usize == own_index {
                    return;
                }
                if dist_sq < f32::EPSILON {
                    return;
                }
                if pfr.neighbors.len() >= SPH_NEIGHBORS {
                    return;
                }
                pfr.neighbors.push(SphNeighbor {
                    system: si as u32,
                    index,
                    dist_sq,
                });
            });
        }
        pfr
    }

    /// Computes the fluid force on particle `index` of the owning system
    /// at the integrator-supplied `state`. `state.time` is the offset into
    /// the current step, used to advect neighbor positions.
    pub fn force(&self, worker: &mut SphWorker, index: usize, state: &ParticleKey) -> Vec3 {
        let force = match self.settings.solver {
            SphSolver::Ddr => self.force_ddr(worker, index, state),
            SphSolver::Classical => self.force_classical(worker, index, state),
        };
        worker.pass += 1;
        force
    }

    // ------------------------------------------------------------------
    // Double density relaxation
    // ------------------------------------------------------------------

    fn force_ddr(&self, worker: &mut SphWorker, index: usize, state: &ParticleKey) -> Vec3 {
        let fluid = self.settings;
        let own = &self.systems[0];
        let pa = &own.particles[index];

        let interaction_radius = fluid.interaction_radius(pa.size);
        let h = interaction_radius * self.hfac;
        let inv_mass = 1.0 / own.mass;

        let rest_density = fluid.effective_rest_density();
        let rest_length = fluid.effective_rest_length(pa.size);
        let stiffness_near = fluid.stiffness_near
            * if fluid.fac_repulsion {
                fluid.stiffness
            } else {
                1.0
            };
        let stiff_visc = fluid.stiff_viscosity
            * if fluid.fac_viscosity {
                fluid.viscosity
            } else {
                1.0
            };

        // Density pass over the gathered neighbors.
        let mut pfr = self.gather(index, state.co, interaction_radius);
        for n in &pfr.neighbors {
            let nsys = &self.systems[n.system as usize];
            let npa = &nsys.particles[n.index as usize];
            let dist = n.dist_sq.sqrt();
            let mut q = (1.0 - dist / h) * nsys.mass * inv_mass;
            if nsys.size_mass {
                q *= npa.size;
            }
            pfr.data[0] += q * q;
            pfr.data[1] += q * q * q;
        }

        let pressure = fluid.stiffness * (pfr.data[0] - rest_density);
        let near_pressure = stiffness_near * pfr.data[1];

        let mut force = Vec3::ZERO;
        for n in &pfr.neighbors {
            let nsys = &self.systems[n.system as usize];
            let npa = &nsys.particles[n.index as usize];

            // Neighbor position advected to the evaluation time.
            let co = npa.prev_state.co + npa.prev_state.vel * state.time;
            let mut vec = co - state.co;
            let rij = vec.length();
            if rij <= f32::EPSILON {
                continue;
            }
            vec /= rij;

            let mut q = (1.0 - rij / h) * nsys.mass * inv_mass;
            if nsys.size_mass {
                q *= npa.size;
            }

            force += vec * (-(pressure + near_pressure * q) * q);

            if fluid.viscosity > 0.0 || stiff_visc > 0.0 {
                let dv = npa.prev_state.vel - state.vel;
                let u = vec.dot(dv);
                if u < 0.0 && fluid.viscosity > 0.0 {
                    force += vec * (0.5 * q * fluid.viscosity * u);
                }
                if u > 0.0 && stiff_visc > 0.0 {
                    force += vec * (0.5 * q * stiff_visc * u);
                }
            }

            if fluid.spring_k > 0.0 {
                if fluid.viscoelastic_springs {
                    if n.system == 0 {
                        let key = spring_pair_key(index as u32, n.index);
                        if let Some(&si) = self.spring_hash.get(&key) {
                            let spring = &self.springs[si];
                            force += vec
                                * (-10.0
                                    * fluid.spring_k
                                    * (1.0 - rij / h)
                                    * (spring.rest_length - rij));
                        } else if fluid.spring_frames == 0.0
                            || pa.state.time <= fluid.spring_frames
                        {
                            worker.new_springs.push(FluidSpring {
                                particles: [index as u32, n.index],
                                rest_length: if fluid.current_rest_length {
                                    rij
                                } else {
                                    rest_length
                                },
                                delete: false,
                            });
                        }
                    }
                } else {
                    // Plain Hookean force toward the configured rest length.
                    force +=
                        vec * (-10.0 * fluid.spring_k * (1.0 - rij / h) * (rest_length - rij));
                }
            }
        }

        if fluid.buoyancy > 0.0 {
            if let Some(gravity) = self.gravity {
                force += gravity * (fluid.buoyancy * (pfr.data[0] - rest_density));
            }
        }

        if worker.pass == 0 && fluid.track_courant {
            self.courant(worker, pa, &pfr);
        }

        force
    }

    // ------------------------------------------------------------------
    // Classical SPH
    // ------------------------------------------------------------------

    fn force_classical(&self, worker: &mut SphWorker, index: usize, state: &ParticleKey) -> Vec3 {
        let fluid = self.settings;
        let own = &self.systems[0];
        let pa = &own.particles[index];

        let interaction_radius = fluid.interaction_radius(pa.size);
        let h = interaction_radius * self.hfac;
        let rest_density = fluid.effective_rest_density();
        // Stiffness acts as speed of sound squared.
        let stiffness = fluid.stiffness * fluid.stiffness;

        let density = pa.sph_density.max(f32::EPSILON);
        let pressure = stiffness * (powf7(density / rest_density) - 1.0);

        // Classical neighbors reach to 2h.
        let pfr = self.gather(index, state.co, 2.0 * h);

        let h3 = h * h * h;
        let qfac2 = 42.0 / (256.0 * PI);

        let mut force = Vec3::ZERO;
        for n in &pfr.neighbors {
            let nsys = &self.systems[n.system as usize];
            let npa = &nsys.particles[n.index as usize];

            let mut vec = npa.state.co - state.co;
            let rij = vec.length();
            if rij <= f32::EPSILON {
                continue;
            }
            vec /= rij;
            let rij_h = rij / h;
            if rij_h > 2.0 {
                continue;
            }

            let ndensity = npa.sph_density.max(f32::EPSILON);
            let npressure = stiffness * (powf7(ndensity / rest_density) - 1.0);

            // Wendland quartic gradient:
            //   q2(x) = 2(2 - x)^4 - 4(2 - x)^3 (1 + 2x)
            let dq = qfac2 / h3
                * (2.0 * powf4(2.0 - rij_h) - 4.0 * powf3(2.0 - rij_h) * (1.0 + 2.0 * rij_h));

            // Symmetric pressure term. The sign is folded into vec, which
            // points from the particle to its neighbor.
            let pressure_term =
                pressure / (density * density) + npressure / (ndensity * ndensity);
            force += vec * (pressure_term * dq * nsys.mass);

            if fluid.viscosity > 0.0 {
                let dv = npa.state.vel - state.vel;
                let u = vec.dot(dv);
                if u < 0.0 {
                    force += vec * (fluid.viscosity * u * dq * nsys.mass / ndensity);
                }
            }
        }

        if fluid.buoyancy > 0.0 {
            if let Some(gravity) = self.gravity {
                force += gravity * (fluid.buoyancy * (density - rest_density));
            }
        }

        if worker.pass == 0 && fluid.track_courant {
            self.courant(worker, pa, &pfr);
        }

        force
    }

    /// Average neighbor spacing and flow velocity, consumed by adaptive
    /// substepping.
    fn courant(&self, worker: &mut SphWorker, pa: &Particle, pfr: &SphRangeData) {
        if pfr.neighbors.is_empty() {
            worker.element_size = f32::MAX;
            worker.flow = Vec3::ZERO;
            return;
        }
        let mut dist = 0.0;
        let mut flow = Vec3::ZERO;
        for n in &pfr.neighbors {
            let nsys = &self.systems[n.system as usize];
            let npa = &nsys.particles[n.index as usize];
            dist += pa.prev_state.co.distance(npa.prev_state.co);
            flow += npa.prev_state.vel;
        }
        dist += self.settings.radius;
        let count = pfr.neighbors.len() as f32;
        worker.element_size = dist / count;
        worker.flow = flow / count;
    }
}

// ============================================================================
// Classical density pass
// ============================================================================

/// Computes the classical SPH density of every particle in the owning
/// system, in parallel. The result is written back to `sph_density` by
/// the caller before the force pass runs.
///
/// Uses the Wendland quartic `(2 - x)^4 (1 + 2x)`, normalized by
/// `21 / 256 pi h^3`, summed over neighbors within `2h`.
pub fn classical_density_pass(data: &SphData<'_>) -> Vec<f32> {
    let own = &data.systems[0];
    let qfac = 21.0 / (256.0 * PI);

    (0..own.particles.len())
        .into_par_iter()
        .map(|index| {
            let pa = &own.particles[index];
            let h = data.settings.interaction_radius(pa.size) * data.hfac;
            let h3 = h * h * h;

            let mut density = 0.0;
            for (si, sys) in data.systems().iter().enumerate() {
                sys.tree.range(pa.state.co, 2.0 * h, |nindex, _| {
                    if si == 0 && nindex as usize == index {
                        return;
                    }
                    let npa = &sys.particles[nindex as usize];
                    let rij = npa.state.co.distance(pa.state.co);
                    let rij_h = rij / h;
                    if rij_h > 2.0 {
                        return;
                    }
                    let mut q = qfac / h3 * powf4(2.0 - rij_h) * (1.0 + 2.0 * rij_h);
                    q *= sys.mass;
                    if sys.size_mass {
                        q *= npa.size;
                    }
                    density += q;
                });
            }
            if density <= 0.0 {
                debug!("isolated fluid particle {index}, clamping density");
                density = f32::EPSILON;
            }
            density
        })
        .collect()
}

fn powf3(x: f32) -> f32 {
    x * x * x
}

fn powf4(x: f32) -> f32 {
    let x2 = x * x;
    x2 * x2
}

fn powf7(x: f32) -> f32 {
    let x2 = x * x;
    x2 * x2 * x2 * x
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn particle_at(co: Vec3, size: f32) -> Particle {
        let mut pa = Particle {
            size,
            ..Default::default()
        };
        pa.state.co = co;
        pa.prev_state.co = co;
        pa
    }

    fn tree_over(particles: &[Particle]) -> KdTree3 {
        let mut tree = KdTree3::with_capacity(particles.len());
        for (i, pa) in particles.iter().enumerate() {
            tree.insert(i as u32, pa.prev_state.co);
        }
        tree.balance();
        tree
    }

    fn settings_plain() -> SphSettings {
        SphSettings {
            fac_radius: false,
            fac_density: false,
            fac_repulsion: false,
            fac_viscosity: false,
            fac_rest_length: false,
            radius: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_ddr_repulsion_pushes_apart() {
        let particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(0.4, 0.0, 0.0), 0.1),
        ];
        let tree = tree_over(&particles);
        let settings = SphSettings {
            rest_density: 0.0,
            viscosity: 0.0,
            stiff_viscosity: 0.0,
            ..settings_plain()
        };
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];
        let hash = HashMap::new();
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let mut worker = SphWorker::default();

        let f0 = data.force(&mut worker, 0, &particles[0].state);
        worker.begin_particle();
        let f1 = data.force(&mut worker, 1, &particles[1].state);

        // Away from each other, equal magnitude by symmetry.
        assert!(f0.x < 0.0);
        assert!(f1.x > 0.0);
        assert!((f0.x + f1.x).abs() < 1e-5);
        assert!(f0.y.abs() < 1e-6 && f0.z.abs() < 1e-6);
    }

    #[test]
    fn test_classical_force_vanishes_at_rest_density() {
        let mut particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(0.5, 0.0, 0.0), 0.1),
        ];
        let settings = SphSettings {
            solver: SphSolver::Classical,
            viscosity: 0.0,
            ..settings_plain()
        };
        for pa in &mut particles {
            pa.sph_density = settings.rest_density;
        }
        let tree = tree_over(&particles);
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];
        let hash = HashMap::new();
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let mut worker = SphWorker::default();
        let f = data.force(&mut worker, 0, &particles[0].state);
        assert!(f.length() < 1e-6);
    }

    #[test]
    fn test_classical_density_positive_and_symmetric() {
        let particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(0.5, 0.0, 0.0), 0.1),
        ];
        let tree = tree_over(&particles);
        let settings = SphSettings {
            solver: SphSolver::Classical,
            ..settings_plain()
        };
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];
        let hash = HashMap::new();
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let density = classical_density_pass(&data);
        assert_eq!(density.len(), 2);
        assert!(density[0] > 0.0);
        assert!((density[0] - density[1]).abs() < 1e-6);
    }

    #[test]
    fn test_classical_density_weights_neighbor_size() {
        let particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(0.5, 0.0, 0.0), 0.5),
        ];
        let tree = tree_over(&particles);
        let settings = SphSettings {
            solver: SphSolver::Classical,
            ..settings_plain()
        };
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: true,
        }];
        let hash = HashMap::new();
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let density = classical_density_pass(&data);
        // Each contribution carries the neighbor's size, so the small
        // particle next to the large one sees five times the density.
        assert!(density[1] > 0.0);
        assert!((density[0] / density[1] - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_spring_window_uses_particle_age() {
        let build = |age: f32| {
            let mut particles = vec![
                particle_at(Vec3::ZERO, 0.1),
                particle_at(Vec3::new(0.4, 0.0, 0.0), 0.1),
            ];
            for pa in &mut particles {
                pa.time = 100.0;
                pa.state.time = age;
            }
            particles
        };
        let settings = SphSettings {
            spring_k: 1.0,
            viscoelastic_springs: true,
            spring_frames: 10.0,
            viscosity: 0.0,
            stiff_viscosity: 0.0,
            ..settings_plain()
        };
        let hash = HashMap::new();

        // Born at frame 100 and well past the window: no new springs,
        // regardless of the absolute birth frame.
        let particles = build(50.0);
        let tree = tree_over(&particles);
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let mut worker = SphWorker::default();
        data.force(&mut worker, 0, &particles[0].state);
        assert!(worker.new_springs.is_empty());

        // Inside the window springs still form.
        let particles = build(5.0);
        let tree = tree_over(&particles);
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let mut worker = SphWorker::default();
        data.force(&mut worker, 0, &particles[0].state);
        assert_eq!(worker.new_springs.len(), 1);
    }

    #[test]
    fn test_spring_creation_is_deferred_and_deduplicated() {
        let particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(0.4, 0.0, 0.0), 0.1),
        ];
        let tree = tree_over(&particles);
        let settings = SphSettings {
            spring_k: 1.0,
            viscoelastic_springs: true,
            spring_frames: 0.0,
            viscosity: 0.0,
            stiff_viscosity: 0.0,
            ..settings_plain()
        };
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];

        let mut springs = Vec::new();
        let mut hash = build_spring_hash(&springs);
        let mut worker = SphWorker::default();
        {
            let data = SphData {
                systems: &systems,
                settings: &settings,
                springs: &springs,
                spring_hash: &hash,
                gravity: None,
                hfac: 1.0,
            };
            data.force(&mut worker, 0, &particles[0].state);
        }
        // Not in the shared list until the flush.
        assert!(springs.is_empty());
        assert_eq!(worker.new_springs.len(), 1);

        flush_springs(&mut springs, &mut hash, worker.new_springs.drain(..));
        assert_eq!(springs.len(), 1);
        assert!(hash.contains_key(&spring_pair_key(0, 1)));

        // Existing spring now exerts force instead of re-creating.
        {
            let data = SphData {
                systems: &systems,
                settings: &settings,
                springs: &springs,
                spring_hash: &hash,
                gravity: None,
                hfac: 1.0,
            };
            worker.begin_particle();
            data.force(&mut worker, 0, &particles[0].state);
        }
        assert!(worker.new_springs.is_empty());
    }

    #[test]
    fn test_spring_rest_length_stays_bounded() {
        let size = 0.25;
        let mut particles = vec![
            particle_at(Vec3::ZERO, size),
            particle_at(Vec3::new(3.0, 0.0, 0.0), size),
        ];
        particles[1].prev_state.co = Vec3::new(3.0, 0.0, 0.0);

        let settings = SphSettings {
            spring_k: 1.0,
            viscoelastic_springs: true,
            yield_ratio: 0.01,
            plasticity: 10.0,
            ..settings_plain()
        };

        let mut springs = vec![FluidSpring {
            particles: [0, 1],
            rest_length: 0.5,
            delete: false,
        }];

        // Pair held far apart: rest length creeps up until it crosses the
        // bound and the spring is purged.
        for _ in 0..100 {
            springs_modify(&mut springs, &particles, &settings, 1.0 / 25.0);
            for s in &springs {
                assert!(s.rest_length <= 4.0 * size);
            }
        }
        assert!(springs.is_empty());
    }

    #[test]
    fn test_springs_modify_noop_without_spring_force() {
        let particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(9.0, 0.0, 0.0), 0.1),
        ];
        let settings = SphSettings {
            spring_k: 0.0,
            viscoelastic_springs: true,
            ..settings_plain()
        };
        let mut springs = vec![FluidSpring {
            particles: [0, 1],
            rest_length: 0.5,
            delete: false,
        }];
        springs_modify(&mut springs, &particles, &settings, 0.04);
        assert_eq!(springs.len(), 1);
        assert_eq!(springs[0].rest_length, 0.5);
    }

    #[test]
    fn test_courant_tracks_average_spacing() {
        let mut particles = vec![
            particle_at(Vec3::ZERO, 0.1),
            particle_at(Vec3::new(0.5, 0.0, 0.0), 0.1),
            particle_at(Vec3::new(0.0, 0.5, 0.0), 0.1),
        ];
        for pa in &mut particles {
            pa.prev_state.vel = Vec3::new(2.0, 0.0, 0.0);
        }
        let tree = tree_over(&particles);
        let settings = SphSettings {
            track_courant: true,
            rest_density: 0.0,
            ..settings_plain()
        };
        let systems = [SphSystem {
            particles: &particles,
            tree: &tree,
            mass: 1.0,
            size_mass: false,
        }];
        let hash = HashMap::new();
        let data = SphData {
            systems: &systems,
            settings: &settings,
            springs: &[],
            spring_hash: &hash,
            gravity: None,
            hfac: 1.0,
        };
        let mut worker = SphWorker::default();
        data.force(&mut worker, 0, &particles[0].state);

        // Two neighbors at 0.5 plus the base radius, averaged.
        let expected = (0.5 + 0.5 + settings.radius) / 2.0;
        assert!((worker.element_size - expected).abs() < 1e-5);
        assert!((worker.flow - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-5);
    }
}
