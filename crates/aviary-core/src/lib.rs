//! Core simulation for the aviary: a hummingbird agent feeding from
//! depletable flowers, driven by an external control policy.
//!
//! The crate owns the nectar state machine, the flower registry, agent
//! perception and motion, safe spawn placement, and reward shaping. Rigid
//! body dynamics, rendering, and the policy itself live behind narrow
//! boundary traits and are never simulated here.

use glam::{EulerRot, Mat3, Quat, Vec3};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::debug;

new_key_type! {
    /// Stable handle for flowers backed by a generational slot map.
    pub struct FlowerId;
}

/// Length of the observation vector handed to the policy.
pub const OBSERVATION_SIZE: usize = 10;
/// Length of the action vector consumed each tick.
pub const ACTION_SIZE: usize = 5;

/// World up axis used for spawn orientation and plant geometry.
pub const WORLD_UP: Vec3 = Vec3::Y;

/// Base color pushed to a flower's material while it holds nectar.
pub const FULL_BLOSSOM_COLOR: [f32; 4] = [1.0, 0.0, 0.3, 1.0];
/// Base color pushed to a flower's material once it has been drained.
pub const EMPTY_BLOSSOM_COLOR: [f32; 4] = [0.5, 0.0, 1.0, 1.0];

fn move_towards(current: f32, target: f32, max_delta: f32) -> f32 {
    let delta = target - current;
    if delta.abs() <= max_delta {
        target
    } else {
        current + delta.signum() * max_delta
    }
}

/// Orientation looking along `forward` with `up` as the vertical reference.
///
/// Falls back to an arbitrary perpendicular when `forward` is parallel to
/// `up`, and to identity when `forward` has no direction at all.
fn look_rotation(forward: Vec3, up: Vec3) -> Quat {
    let f = forward.normalize_or_zero();
    if f == Vec3::ZERO {
        return Quat::IDENTITY;
    }
    let mut right = up.cross(f);
    if right.length_squared() <= f32::EPSILON {
        right = f.any_orthonormal_vector();
    }
    let right = right.normalize();
    let upward = f.cross(right);
    Quat::from_mat3(&Mat3::from_cols(right, upward, f))
}

/// Opaque identifier produced by the external collision system for a
/// flower's feeding contact volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColliderHandle(pub u64);

impl fmt::Display for ColliderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collider#{}", self.0)
    }
}

/// High level simulation clock (fixed ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// World-space position and orientation pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    /// Construct a new pose.
    #[must_use]
    pub const fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }
}

/// Errors raised when validating environment configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Errors raised by flower registry construction and lookup.
///
/// `UnknownCollider` signals a caller contract breach: handles reaching
/// `resolve` must have been produced by discovery. Callers should treat it
/// as fatal rather than recoverable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no flower registered for {0}")]
    UnknownCollider(ColliderHandle),
    #[error("{0} is mapped to more than one flower")]
    DuplicateCollider(ColliderHandle),
}

/// Raised when rejection sampling cannot place the agent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("no collision-free spawn pose found in {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
}

/// Raised when play-mode controls are invoked during training.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FreezeError {
    #[error("freeze and unfreeze are only valid outside training mode")]
    TrainingActive,
}

/// Static configuration for an aviary environment instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviaryConfig {
    /// Known environment scale used to normalize observed distances.
    pub area_diameter: f32,
    /// Center of the flight area, used by free-roam spawn sampling.
    pub area_origin: Vec3,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Duration of one fixed simulation tick in seconds.
    pub fixed_dt: f32,
    /// Scale applied to the action's move vector before it reaches the body.
    pub move_force: f32,
    /// Pitch rate in degrees per second at full deflection.
    pub pitch_speed: f32,
    /// Yaw rate in degrees per second at full deflection.
    pub yaw_speed: f32,
    /// Hard pitch limit in degrees, keeping the agent short of vertical.
    pub max_pitch_degrees: f32,
    /// Maximum change of the smoothed rotation rates, per second.
    pub rate_smoothing: f32,
    /// Beak tip position in agent-local coordinates.
    pub beak_tip_offset: Vec3,
    /// Flat reward for a feeding contact while training.
    pub feed_reward_base: f32,
    /// Extra reward at perfect beak-to-blossom alignment while training.
    pub feed_alignment_bonus: f32,
    /// Magnitude of the penalty for striking the area boundary.
    pub boundary_penalty: f32,
    /// Rejection sampling budget for spawn placement.
    pub spawn_attempts: u32,
    /// Radius of the clearance probe around each spawn candidate.
    pub spawn_clearance_radius: f32,
    /// Closest spawn distance in front of a flower.
    pub near_spawn_min_distance: f32,
    /// Farthest spawn distance in front of a flower.
    pub near_spawn_max_distance: f32,
    /// Lowest free-roam spawn height above the area origin.
    pub roam_min_height: f32,
    /// Highest free-roam spawn height above the area origin.
    pub roam_max_height: f32,
    /// Smallest free-roam spawn distance from the area origin.
    pub roam_min_radius: f32,
    /// Largest free-roam spawn distance from the area origin.
    pub roam_max_radius: f32,
    /// Free-roam spawn pitch is sampled within plus or minus this angle.
    pub roam_pitch_limit_degrees: f32,
    /// Plant tilt jitter on the two horizontal axes at episode reset.
    pub plant_tilt_jitter_degrees: f32,
    /// Step limit per training episode; 0 disables the limit.
    pub max_episode_steps: u32,
    /// Maximum number of episode summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for AviaryConfig {
    fn default() -> Self {
        Self {
            area_diameter: 20.0,
            area_origin: Vec3::ZERO,
            rng_seed: None,
            fixed_dt: 0.02,
            move_force: 2.0,
            pitch_speed: 100.0,
            yaw_speed: 100.0,
            max_pitch_degrees: 80.0,
            rate_smoothing: 2.0,
            beak_tip_offset: Vec3::new(0.0, 0.0, 0.3),
            feed_reward_base: 0.01,
            feed_alignment_bonus: 0.02,
            boundary_penalty: 0.5,
            spawn_attempts: 100,
            spawn_clearance_radius: 0.05,
            near_spawn_min_distance: 0.1,
            near_spawn_max_distance: 0.2,
            roam_min_height: 1.2,
            roam_max_height: 2.5,
            roam_min_radius: 2.0,
            roam_max_radius: 7.0,
            roam_pitch_limit_degrees: 60.0,
            plant_tilt_jitter_degrees: 5.0,
            max_episode_steps: 5_000,
            history_capacity: 256,
        }
    }
}

impl AviaryConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.area_diameter <= 0.0 {
            return Err(ConfigError::InvalidConfig("area_diameter must be positive"));
        }
        if self.fixed_dt <= 0.0 {
            return Err(ConfigError::InvalidConfig("fixed_dt must be positive"));
        }
        if self.move_force < 0.0 || self.pitch_speed < 0.0 || self.yaw_speed < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "move_force and rotation speeds must be non-negative",
            ));
        }
        if self.max_pitch_degrees <= 0.0 || self.max_pitch_degrees > 180.0 {
            return Err(ConfigError::InvalidConfig(
                "max_pitch_degrees must be within (0, 180]",
            ));
        }
        if self.rate_smoothing <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "rate_smoothing must be positive",
            ));
        }
        if self.feed_reward_base < 0.0
            || self.feed_alignment_bonus < 0.0
            || self.boundary_penalty < 0.0
        {
            return Err(ConfigError::InvalidConfig(
                "reward magnitudes must be non-negative",
            ));
        }
        if self.spawn_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "spawn_attempts must be non-zero",
            ));
        }
        if self.spawn_clearance_radius <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "spawn_clearance_radius must be positive",
            ));
        }
        if self.near_spawn_min_distance < 0.0
            || self.near_spawn_min_distance > self.near_spawn_max_distance
        {
            return Err(ConfigError::InvalidConfig(
                "near spawn distance range must be ordered and non-negative",
            ));
        }
        if self.roam_min_height > self.roam_max_height
            || self.roam_min_radius < 0.0
            || self.roam_min_radius > self.roam_max_radius
        {
            return Err(ConfigError::InvalidConfig(
                "free roam sampling ranges must be ordered and non-negative",
            ));
        }
        if self.roam_pitch_limit_degrees < 0.0 || self.roam_pitch_limit_degrees >= 180.0 {
            return Err(ConfigError::InvalidConfig(
                "roam_pitch_limit_degrees must be within [0, 180)",
            ));
        }
        if self.plant_tilt_jitter_degrees < 0.0 {
            return Err(ConfigError::InvalidConfig(
                "plant_tilt_jitter_degrees must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Reward delta for one feeding contact.
    ///
    /// The consumed amount is tracked separately as a progress counter and
    /// never scales the reward; only the approach alignment does.
    #[must_use]
    pub fn feed_reward(&self, alignment: f32, training: bool) -> f32 {
        if !training {
            return 0.0;
        }
        self.feed_reward_base + self.feed_alignment_bonus * alignment.clamp(0.0, 1.0)
    }

    /// Reward delta for striking the area boundary.
    #[must_use]
    pub fn boundary_reward(&self, training: bool) -> f32 {
        if training { -self.boundary_penalty } else { 0.0 }
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// One flower blossom within a plant, described in plant-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BlossomSpec {
    /// Offset from the plant pivot to the blossom center.
    pub offset: Vec3,
    /// Direction the blossom faces, away from its stem.
    pub up: Vec3,
    /// Feeding contact handle assigned by the collision system.
    pub nectar_collider: ColliderHandle,
}

/// A flower plant: a pivot plus the blossoms that rotate around it together.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantSpec {
    pub pivot: Vec3,
    pub blossoms: Vec<BlossomSpec>,
}

/// Plain-data scene tree handed to registry discovery.
///
/// How the host engine tags and nests its objects is its own concern; by the
/// time a scene reaches this crate it is groups and plants, nothing else.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneNode {
    Group(Vec<SceneNode>),
    Plant(PlantSpec),
}

/// Material boundary: receives base-color pushes on flower state changes.
///
/// Calls are fire-and-forget; the simulation never waits on the visual side.
pub trait BlossomMaterials: Send {
    fn set_base_color(&mut self, flower: FlowerId, color: [f32; 4]);
}

/// No-op material sink.
#[derive(Debug, Default)]
pub struct NullMaterials;

impl BlossomMaterials for NullMaterials {
    fn set_base_color(&mut self, _flower: FlowerId, _color: [f32; 4]) {}
}

/// A single depletable nectar source.
#[derive(Debug, Clone, PartialEq)]
pub struct Flower {
    nectar: f32,
    position: Vec3,
    up_axis: Vec3,
    offset: Vec3,
    local_up: Vec3,
    nectar_collider: ColliderHandle,
    colliders_active: bool,
}

impl Flower {
    /// Remaining nectar in `[0, 1]`.
    #[must_use]
    pub const fn nectar(&self) -> f32 {
        self.nectar
    }

    /// Whether the flower still holds any nectar.
    #[must_use]
    pub fn has_nectar(&self) -> bool {
        self.nectar > 0.0
    }

    /// World-space blossom center.
    #[must_use]
    pub const fn position(&self) -> Vec3 {
        self.position
    }

    /// World-space unit direction the blossom faces.
    #[must_use]
    pub const fn up_axis(&self) -> Vec3 {
        self.up_axis
    }

    /// Feeding contact handle owned by this flower.
    #[must_use]
    pub const fn nectar_collider(&self) -> ColliderHandle {
        self.nectar_collider
    }

    /// Whether the feeding and mesh colliders currently accept contacts.
    #[must_use]
    pub const fn colliders_active(&self) -> bool {
        self.colliders_active
    }

    /// Attempt to remove `amount` of nectar, returning what was available.
    ///
    /// The requested amount is subtracted in full under a zero clamp, so the
    /// return value can be smaller than the imposed depletion when the
    /// request exceeds what remains. Draining the last nectar deactivates
    /// both colliders until the next reset.
    pub fn feed(&mut self, amount: f32) -> f32 {
        if !self.colliders_active || !self.has_nectar() {
            return 0.0;
        }
        let amount = amount.max(0.0);
        let consumed = amount.min(self.nectar);
        self.nectar = (self.nectar - amount).max(0.0);
        if !self.has_nectar() {
            self.colliders_active = false;
        }
        consumed
    }

    /// Refill the flower and reactivate its colliders.
    pub fn reset(&mut self) {
        self.nectar = 1.0;
        self.colliders_active = true;
    }
}

#[derive(Debug, Clone)]
struct Plant {
    pivot: Vec3,
    members: Vec<FlowerId>,
}

/// Owning collection of the flowers in one environment instance.
///
/// Membership is fixed at discovery; episode resets mutate nectar amounts
/// and plant orientations but never add or remove flowers.
#[derive(Debug, Default)]
pub struct FlowerRegistry {
    flowers: SlotMap<FlowerId, Flower>,
    order: Vec<FlowerId>,
    by_collider: HashMap<ColliderHandle, FlowerId>,
    plants: Vec<Plant>,
}

impl FlowerRegistry {
    /// Build the registry from a scene tree in one recursive pass.
    pub fn discover(root: &SceneNode) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        registry.walk(root)?;
        Ok(registry)
    }

    fn walk(&mut self, node: &SceneNode) -> Result<(), RegistryError> {
        match node {
            SceneNode::Group(children) => {
                for child in children {
                    self.walk(child)?;
                }
            }
            SceneNode::Plant(spec) => {
                let mut members = Vec::with_capacity(spec.blossoms.len());
                for blossom in &spec.blossoms {
                    if self.by_collider.contains_key(&blossom.nectar_collider) {
                        return Err(RegistryError::DuplicateCollider(blossom.nectar_collider));
                    }
                    let flower = Flower {
                        nectar: 1.0,
                        position: spec.pivot + blossom.offset,
                        up_axis: blossom.up.normalize_or(WORLD_UP),
                        offset: blossom.offset,
                        local_up: blossom.up,
                        nectar_collider: blossom.nectar_collider,
                        colliders_active: true,
                    };
                    let id = self.flowers.insert(flower);
                    self.order.push(id);
                    self.by_collider.insert(blossom.nectar_collider, id);
                    members.push(id);
                }
                self.plants.push(Plant {
                    pivot: spec.pivot,
                    members,
                });
            }
        }
        Ok(())
    }

    /// Number of registered flowers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true when the scene contained no flowers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate flowers in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (FlowerId, &Flower)> {
        self.order
            .iter()
            .filter_map(move |id| self.flowers.get(*id).map(|flower| (*id, flower)))
    }

    /// Borrow a flower by handle.
    #[must_use]
    pub fn flower(&self, id: FlowerId) -> Option<&Flower> {
        self.flowers.get(id)
    }

    fn flower_mut(&mut self, id: FlowerId) -> Option<&mut Flower> {
        self.flowers.get_mut(id)
    }

    /// Map a feeding collider back to its owning flower.
    ///
    /// Handles not produced by discovery indicate a caller contract breach.
    pub fn resolve(&self, handle: ColliderHandle) -> Result<FlowerId, RegistryError> {
        self.by_collider
            .get(&handle)
            .copied()
            .ok_or(RegistryError::UnknownCollider(handle))
    }

    /// Sum of nectar remaining across all flowers.
    #[must_use]
    pub fn total_nectar(&self) -> f32 {
        self.flowers.values().map(Flower::nectar).sum()
    }

    /// Refill every flower and re-jitter every plant's orientation.
    ///
    /// Each plant draws an independent rotation: a small tilt on the two
    /// horizontal axes and a full-range spin around the vertical, so the
    /// approach geometry differs between episodes. Reset order is
    /// irrelevant; the operations commute.
    pub fn reset_all(
        &mut self,
        rng: &mut SmallRng,
        tilt_jitter_degrees: f32,
        materials: &mut dyn BlossomMaterials,
    ) {
        for plant in &self.plants {
            let tilt_x = sample_jitter(rng, tilt_jitter_degrees);
            let tilt_z = sample_jitter(rng, tilt_jitter_degrees);
            let spin_y = rng.random_range(-180.0_f32..180.0);
            let rotation = Quat::from_euler(
                EulerRot::YXZ,
                spin_y.to_radians(),
                tilt_x.to_radians(),
                tilt_z.to_radians(),
            );
            for id in &plant.members {
                if let Some(flower) = self.flowers.get_mut(*id) {
                    flower.position = plant.pivot + rotation * flower.offset;
                    flower.up_axis = (rotation * flower.local_up).normalize_or(WORLD_UP);
                    flower.reset();
                    materials.set_base_color(*id, FULL_BLOSSOM_COLOR);
                }
            }
        }
    }
}

fn sample_jitter(rng: &mut SmallRng, limit: f32) -> f32 {
    if limit <= 0.0 {
        0.0
    } else {
        rng.random_range(-limit..limit)
    }
}

/// Pick the resource-bearing flower closest to the beak tip.
///
/// Every flower is compared; holding the incumbent earns no shortcut. When
/// nothing currently qualifies the incumbent is handed back unchanged, and
/// the caller decides whether to keep or clear it. An empty registry always
/// yields `None`.
#[must_use]
pub fn select_nearest_flower(
    registry: &FlowerRegistry,
    beak_position: Vec3,
    current: Option<FlowerId>,
) -> Option<FlowerId> {
    let best = registry
        .iter()
        .filter(|(_, flower)| flower.has_nectar())
        .min_by_key(|(_, flower)| OrderedFloat(flower.position().distance_squared(beak_position)))
        .map(|(id, _)| id);
    best.or(current)
}

/// Build the fixed-length observation vector.
///
/// Layout: local rotation quaternion (4), unit vector toward the flower (3),
/// position alignment against the blossom face (1), beak orientation
/// alignment (1), distance normalized by the area diameter (1, unclamped).
/// Without a flower the agent perceives nothing and the vector is all zeros.
#[must_use]
pub fn build_observation(
    local_rotation: Quat,
    beak_position: Vec3,
    beak_forward: Vec3,
    flower: Option<&Flower>,
    area_diameter: f32,
) -> [f32; OBSERVATION_SIZE] {
    let Some(flower) = flower else {
        return [0.0; OBSERVATION_SIZE];
    };

    let rotation = local_rotation.normalize();
    let to_flower = flower.position() - beak_position;
    let to_flower_unit = to_flower.normalize_or_zero();
    let blossom_inward = -flower.up_axis().normalize_or_zero();
    let beak_unit = beak_forward.normalize_or_zero();

    [
        rotation.x,
        rotation.y,
        rotation.z,
        rotation.w,
        to_flower_unit.x,
        to_flower_unit.y,
        to_flower_unit.z,
        to_flower_unit.dot(blossom_inward),
        beak_unit.dot(blossom_inward),
        to_flower.length() / area_diameter,
    ]
}

/// Result of translating one action vector into motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteerOutcome {
    /// Unclamped force for the rigid body, in the action's own frame.
    pub force: Vec3,
    /// New rotation as pitch, yaw, roll in degrees; roll is always zero.
    pub euler_degrees: Vec3,
    pub smoothed_pitch_rate: f32,
    pub smoothed_yaw_rate: f32,
}

/// Map a 5-component action onto a force and a smoothed, clamped rotation.
///
/// `action[0..3]` is a raw move vector scaled by the configured force;
/// `action[3]` and `action[4]` are target pitch and yaw rates in `[-1, 1]`.
/// The smoothed rates chase their targets at a bounded rate rather than
/// through a low-pass filter. Pitch wraps past 180 degrees before being
/// clamped, yaw is free, roll is pinned to zero.
#[must_use]
pub fn steer(
    action: &[f32; ACTION_SIZE],
    euler_degrees: Vec3,
    smoothed_pitch_rate: f32,
    smoothed_yaw_rate: f32,
    dt: f32,
    config: &AviaryConfig,
) -> SteerOutcome {
    let force = Vec3::new(action[0], action[1], action[2]) * config.move_force;

    let max_step = config.rate_smoothing * dt;
    let pitch_rate = move_towards(smoothed_pitch_rate, action[3], max_step);
    let yaw_rate = move_towards(smoothed_yaw_rate, action[4], max_step);

    let mut pitch = euler_degrees.x + pitch_rate * dt * config.pitch_speed;
    if pitch > 180.0 {
        pitch -= 360.0;
    }
    pitch = pitch.clamp(-config.max_pitch_degrees, config.max_pitch_degrees);

    let yaw = euler_degrees.y + yaw_rate * dt * config.yaw_speed;

    SteerOutcome {
        force,
        euler_degrees: Vec3::new(pitch, yaw, 0.0),
        smoothed_pitch_rate: pitch_rate,
        smoothed_yaw_rate: yaw_rate,
    }
}

/// How the spawn planner places the agent at episode start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnMode {
    /// In front of a random flower, looking at its center.
    NearFlower,
    /// Anywhere in the flight volume with a random orientation.
    FreeRoam,
}

/// Rejection-sample a collision-free pose for episode start.
///
/// `overlap` reports how many colliders intersect a sphere at the candidate
/// position; zero accepts the candidate. The attempt budget bounds the loop,
/// and exhausting it is surfaced to the caller rather than aborting, so a
/// host may retry with relaxed constraints.
pub fn find_safe_pose(
    mode: SpawnMode,
    registry: &FlowerRegistry,
    config: &AviaryConfig,
    rng: &mut SmallRng,
    overlap: &mut dyn FnMut(Vec3, f32) -> usize,
) -> Result<Pose, SpawnError> {
    // An empty registry degenerates near-flower placement to free roam.
    let mode = if registry.is_empty() {
        SpawnMode::FreeRoam
    } else {
        mode
    };

    for _ in 0..config.spawn_attempts {
        let candidate = match mode {
            SpawnMode::NearFlower => {
                let pick = rng.random_range(0..registry.len());
                let Some((_, flower)) = registry.iter().nth(pick) else {
                    continue;
                };
                let distance = rng
                    .random_range(config.near_spawn_min_distance..=config.near_spawn_max_distance);
                let position = flower.position() + flower.up_axis() * distance;
                let rotation = look_rotation(flower.position() - position, WORLD_UP);
                Pose::new(position, rotation)
            }
            SpawnMode::FreeRoam => {
                let height = rng.random_range(config.roam_min_height..=config.roam_max_height);
                let radius = rng.random_range(config.roam_min_radius..=config.roam_max_radius);
                let azimuth = rng.random_range(-180.0_f32..180.0);
                let position = config.area_origin
                    + Quat::from_rotation_y(azimuth.to_radians()) * (Vec3::Z * radius)
                    + WORLD_UP * height;
                let pitch = if config.roam_pitch_limit_degrees > 0.0 {
                    rng.random_range(
                        -config.roam_pitch_limit_degrees..config.roam_pitch_limit_degrees,
                    )
                } else {
                    0.0
                };
                let yaw = rng.random_range(-180.0_f32..180.0);
                let rotation =
                    Quat::from_euler(EulerRot::YXZ, yaw.to_radians(), pitch.to_radians(), 0.0);
                Pose::new(position, rotation)
            }
        };

        if overlap(candidate.position, config.spawn_clearance_radius) == 0 {
            return Ok(candidate);
        }
    }

    Err(SpawnError::AttemptsExhausted {
        attempts: config.spawn_attempts,
    })
}

/// Narrow boundary to the external rigid-body solver.
///
/// The simulation pushes forces and poses through this trait and reads back
/// integrated positions; it never steps dynamics itself.
pub trait RigidBody {
    /// Apply a force to the body for the current tick.
    fn apply_force(&mut self, force: Vec3);

    /// Current rotation as pitch, yaw, roll in degrees.
    fn euler_rotation(&self) -> Vec3;

    /// Overwrite the body rotation, in degrees.
    fn set_euler_rotation(&mut self, euler_degrees: Vec3);

    /// Current world-space position.
    fn position(&self) -> Vec3;

    /// Teleport the body, clearing any accumulated motion.
    fn set_position(&mut self, position: Vec3);

    /// Park or wake the body.
    fn set_sleeping(&mut self, sleeping: bool);
}

/// Observer invoked with each completed episode summary.
pub trait EpisodeSink: Send {
    fn on_episode(&mut self, summary: &EpisodeSummary);
}

/// No-op episode sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl EpisodeSink for NullSink {
    fn on_episode(&mut self, _summary: &EpisodeSummary) {}
}

/// Outcome of one completed episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode: u64,
    pub steps: u32,
    pub nectar_obtained: f32,
    pub reward: f32,
    pub spawn_mode: SpawnMode,
}

/// Events emitted after processing a fixed simulation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickEvents {
    pub tick: Tick,
    /// The nearest-flower selection changed during this tick.
    pub nearest_changed: bool,
    /// The training step limit was reached; the driver should start a new
    /// episode before processing further actions.
    pub step_limit_reached: bool,
}

/// Result of one feeding contact.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeedOutcome {
    /// Nectar actually obtained from the flower.
    pub consumed: f32,
    /// Reward delta emitted for this contact.
    pub reward: f32,
    /// The contact drained the flower's last nectar.
    pub emptied: bool,
}

/// Mutable per-episode agent state mirrored by the simulation.
#[derive(Debug, Clone)]
pub struct Hummingbird {
    /// World-space position, synced from the rigid body each tick.
    pub position: Vec3,
    /// Pitch in degrees; roll is always zero.
    pub pitch_degrees: f32,
    /// Yaw in degrees, unbounded.
    pub yaw_degrees: f32,
    pub smoothed_pitch_rate: f32,
    pub smoothed_yaw_rate: f32,
    /// Nectar collected this episode.
    pub nectar_obtained: f32,
    /// Reward accumulated this episode.
    pub episode_reward: f32,
    /// While frozen, actions are ignored entirely.
    pub frozen: bool,
    /// Current feeding target; `Some` implies the flower still has nectar.
    pub nearest_flower: Option<FlowerId>,
}

impl Default for Hummingbird {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            pitch_degrees: 0.0,
            yaw_degrees: 0.0,
            smoothed_pitch_rate: 0.0,
            smoothed_yaw_rate: 0.0,
            nectar_obtained: 0.0,
            episode_reward: 0.0,
            frozen: false,
            nearest_flower: None,
        }
    }
}

impl Hummingbird {
    /// Orientation as a quaternion, yaw applied before pitch.
    #[must_use]
    pub fn rotation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            self.yaw_degrees.to_radians(),
            self.pitch_degrees.to_radians(),
            0.0,
        )
    }

    /// Rotation as pitch, yaw, roll in degrees.
    #[must_use]
    pub fn euler_degrees(&self) -> Vec3 {
        Vec3::new(self.pitch_degrees, self.yaw_degrees, 0.0)
    }

    /// World-space beak tip given the configured local offset.
    #[must_use]
    pub fn beak_tip(&self, offset: Vec3) -> Vec3 {
        self.position + self.rotation() * offset
    }

    /// World-space beak direction.
    #[must_use]
    pub fn beak_forward(&self) -> Vec3 {
        self.rotation() * Vec3::Z
    }
}

/// Aggregate environment state for one agent and its flower registry.
///
/// The simulation is single-threaded and tick-driven. Feeding is a plain
/// read-modify-write behind `&mut self`; a host sharing one registry across
/// threads must serialize its calls, there is no interior locking here.
pub struct AviaryState {
    config: AviaryConfig,
    training: bool,
    tick: Tick,
    episode: u64,
    episode_steps: u32,
    started: bool,
    rng: SmallRng,
    registry: FlowerRegistry,
    bird: Hummingbird,
    spawn_mode: SpawnMode,
    history: VecDeque<EpisodeSummary>,
    sink: Box<dyn EpisodeSink>,
    materials: Box<dyn BlossomMaterials>,
}

impl fmt::Debug for AviaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AviaryState")
            .field("config", &self.config)
            .field("training", &self.training)
            .field("tick", &self.tick)
            .field("episode", &self.episode)
            .field("flower_count", &self.registry.len())
            .finish()
    }
}

impl AviaryState {
    /// Instantiate the environment from a validated configuration.
    pub fn new(
        config: AviaryConfig,
        registry: FlowerRegistry,
        training: bool,
    ) -> Result<Self, ConfigError> {
        Self::with_observers(
            config,
            registry,
            training,
            Box::new(NullSink),
            Box::new(NullMaterials),
        )
    }

    /// Instantiate with an episode sink and a material bridge installed.
    pub fn with_observers(
        config: AviaryConfig,
        registry: FlowerRegistry,
        training: bool,
        sink: Box<dyn EpisodeSink>,
        materials: Box<dyn BlossomMaterials>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            training,
            tick: Tick::zero(),
            episode: 0,
            episode_steps: 0,
            started: false,
            rng,
            registry,
            bird: Hummingbird::default(),
            spawn_mode: SpawnMode::NearFlower,
            history: VecDeque::with_capacity(history_capacity),
            sink,
            materials,
        })
    }

    /// Start a new episode: refill and re-jitter the flowers, place the
    /// agent, and recompute its feeding target.
    ///
    /// This is a barrier; all of it completes before the next tick runs. The
    /// previous episode's summary is flushed to history and the sink first.
    pub fn begin_episode(
        &mut self,
        body: &mut dyn RigidBody,
        overlap: &mut dyn FnMut(Vec3, f32) -> usize,
    ) -> Result<(), SpawnError> {
        if self.started {
            self.flush_episode_summary();
        }
        self.started = true;
        self.episode += 1;
        self.episode_steps = 0;
        self.bird.nectar_obtained = 0.0;
        self.bird.episode_reward = 0.0;
        self.bird.smoothed_pitch_rate = 0.0;
        self.bird.smoothed_yaw_rate = 0.0;

        self.registry.reset_all(
            &mut self.rng,
            self.config.plant_tilt_jitter_degrees,
            self.materials.as_mut(),
        );

        // Park the body so stale momentum cannot leak across the boundary.
        body.set_sleeping(true);

        self.spawn_mode = if self.training {
            if self.rng.random::<f32>() < 0.5 {
                SpawnMode::NearFlower
            } else {
                SpawnMode::FreeRoam
            }
        } else {
            SpawnMode::NearFlower
        };

        let pose = find_safe_pose(
            self.spawn_mode,
            &self.registry,
            &self.config,
            &mut self.rng,
            overlap,
        )?;

        let (yaw, pitch, _roll) = pose.rotation.to_euler(EulerRot::YXZ);
        self.bird.position = pose.position;
        self.bird.pitch_degrees = pitch.to_degrees();
        self.bird.yaw_degrees = yaw.to_degrees();
        body.set_position(pose.position);
        body.set_euler_rotation(self.bird.euler_degrees());
        body.set_sleeping(self.bird.frozen);

        self.bird.nearest_flower = None;
        self.refresh_nearest_flower();

        debug!(
            episode = self.episode,
            mode = ?self.spawn_mode,
            flowers = self.registry.len(),
            "episode started"
        );
        Ok(())
    }

    fn flush_episode_summary(&mut self) {
        let summary = EpisodeSummary {
            episode: self.episode,
            steps: self.episode_steps,
            nectar_obtained: self.bird.nectar_obtained,
            reward: self.bird.episode_reward,
            spawn_mode: self.spawn_mode,
        };
        self.sink.on_episode(&summary);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Feed the latest action vector into motion for this tick.
    ///
    /// Ignored entirely while the agent is frozen.
    pub fn apply_action(&mut self, action: &[f32; ACTION_SIZE], body: &mut dyn RigidBody) {
        if self.bird.frozen {
            return;
        }
        let outcome = steer(
            action,
            body.euler_rotation(),
            self.bird.smoothed_pitch_rate,
            self.bird.smoothed_yaw_rate,
            self.config.fixed_dt,
            &self.config,
        );
        body.apply_force(outcome.force);
        self.bird.pitch_degrees = outcome.euler_degrees.x;
        self.bird.yaw_degrees = outcome.euler_degrees.y;
        self.bird.smoothed_pitch_rate = outcome.smoothed_pitch_rate;
        self.bird.smoothed_yaw_rate = outcome.smoothed_yaw_rate;
        body.set_euler_rotation(outcome.euler_degrees);
    }

    /// Simulation-phase tail of one fixed tick.
    ///
    /// Syncs the pose mirror from the body, re-validates the feeding target
    /// when it has gone stale, and advances the clock. Presentation work has
    /// no business here and no hook to attach to.
    pub fn fixed_step(&mut self, body: &dyn RigidBody) -> TickEvents {
        self.bird.position = body.position();

        let stale = match self.bird.nearest_flower {
            None => true,
            Some(id) => !self.registry.flower(id).is_some_and(Flower::has_nectar),
        };
        let nearest_changed = if stale {
            self.refresh_nearest_flower()
        } else {
            false
        };

        self.episode_steps = self.episode_steps.saturating_add(1);
        self.tick = self.tick.next();

        TickEvents {
            tick: self.tick,
            nearest_changed,
            step_limit_reached: self.training
                && self.config.max_episode_steps > 0
                && self.episode_steps >= self.config.max_episode_steps,
        }
    }

    /// Build the observation vector for the current state.
    #[must_use]
    pub fn collect_observations(&self) -> [f32; OBSERVATION_SIZE] {
        let flower = self
            .bird
            .nearest_flower
            .and_then(|id| self.registry.flower(id));
        build_observation(
            self.bird.rotation(),
            self.bird.beak_tip(self.config.beak_tip_offset),
            self.bird.beak_forward(),
            flower,
            self.config.area_diameter,
        )
    }

    /// Resolve a feeding contact reported by the collision system.
    ///
    /// Fully synchronous: nectar is consumed, reward emitted, and the
    /// feeding target reselected before this returns. Contacts against a
    /// drained flower's inert colliders are ignored without reward. Unknown
    /// handles are a caller contract breach.
    pub fn feed_from_collider(
        &mut self,
        handle: ColliderHandle,
        amount: f32,
    ) -> Result<FeedOutcome, RegistryError> {
        let id = self.registry.resolve(handle)?;
        let beak_forward = self.bird.beak_forward();

        let Some(flower) = self.registry.flower_mut(id) else {
            return Err(RegistryError::UnknownCollider(handle));
        };
        if !flower.colliders_active() || !flower.has_nectar() {
            return Ok(FeedOutcome::default());
        }
        let consumed = flower.feed(amount);
        let up_axis = flower.up_axis();
        let emptied = !flower.has_nectar();

        self.bird.nectar_obtained += consumed;
        let alignment = beak_forward
            .normalize_or_zero()
            .dot(-up_axis.normalize_or_zero());
        let reward = self.config.feed_reward(alignment, self.training);
        self.bird.episode_reward += reward;

        if emptied {
            self.materials.set_base_color(id, EMPTY_BLOSSOM_COLOR);
            self.refresh_nearest_flower();
            debug!(flower = ?id, "flower drained");
        }

        Ok(FeedOutcome {
            consumed,
            reward,
            emptied,
        })
    }

    /// Register a collision with the area boundary, returning the reward
    /// delta.
    pub fn boundary_collision(&mut self) -> f32 {
        let reward = self.config.boundary_reward(self.training);
        self.bird.episode_reward += reward;
        reward
    }

    /// Re-evaluate the nearest resource-bearing flower from scratch.
    ///
    /// Returns whether the selection changed. The selection is never left
    /// pointing at a drained flower; with nothing available it collapses to
    /// `None`.
    pub fn refresh_nearest_flower(&mut self) -> bool {
        let beak = self.bird.beak_tip(self.config.beak_tip_offset);
        let next = select_nearest_flower(&self.registry, beak, self.bird.nearest_flower)
            .filter(|id| self.registry.flower(*id).is_some_and(Flower::has_nectar));
        let changed = next != self.bird.nearest_flower;
        self.bird.nearest_flower = next;
        changed
    }

    /// Drop the feeding target outright.
    pub fn clear_nearest_flower(&mut self) {
        self.bird.nearest_flower = None;
    }

    /// Suspend the agent for presentation purposes.
    ///
    /// Only valid outside training mode; training episodes must never stall
    /// on a frozen agent.
    pub fn freeze(&mut self, body: &mut dyn RigidBody) -> Result<(), FreezeError> {
        if self.training {
            return Err(FreezeError::TrainingActive);
        }
        self.bird.frozen = true;
        body.set_sleeping(true);
        Ok(())
    }

    /// Resume a frozen agent.
    pub fn unfreeze(&mut self, body: &mut dyn RigidBody) -> Result<(), FreezeError> {
        if self.training {
            return Err(FreezeError::TrainingActive);
        }
        self.bird.frozen = false;
        body.set_sleeping(false);
        Ok(())
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &AviaryConfig {
        &self.config
    }

    /// Whether the environment runs in training mode.
    #[must_use]
    pub const fn training(&self) -> bool {
        self.training
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Episode counter, starting at 1 after the first `begin_episode`.
    #[must_use]
    pub const fn episode(&self) -> u64 {
        self.episode
    }

    /// Fixed ticks processed in the current episode.
    #[must_use]
    pub const fn episode_steps(&self) -> u32 {
        self.episode_steps
    }

    /// Spawn mode chosen for the current episode.
    #[must_use]
    pub const fn spawn_mode(&self) -> SpawnMode {
        self.spawn_mode
    }

    /// Read-only view of the agent.
    #[must_use]
    pub fn bird(&self) -> &Hummingbird {
        &self.bird
    }

    /// Read-only access to the flower registry.
    #[must_use]
    pub fn registry(&self) -> &FlowerRegistry {
        &self.registry
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Iterate over retained episode summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &EpisodeSummary> {
        self.history.iter()
    }

    /// Replace the episode sink.
    pub fn set_sink(&mut self, sink: Box<dyn EpisodeSink>) {
        self.sink = sink;
    }

    /// Replace the material bridge.
    pub fn set_materials(&mut self, materials: Box<dyn BlossomMaterials>) {
        self.materials = materials;
    }
}
