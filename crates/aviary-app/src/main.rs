//! Headless aviary demo: a scripted chase policy flying the hummingbird
//! against the simulation core, with a toy kinematic body standing in for
//! the host physics engine.

use anyhow::Result;
use aviary_core::{
    ACTION_SIZE, AviaryConfig, AviaryState, BlossomSpec, ColliderHandle, FlowerRegistry,
    OBSERVATION_SIZE, PlantSpec, RigidBody, SceneNode,
};
use glam::Vec3;
use tracing::{debug, info};

const EPISODES: u64 = 5;
/// Nectar drawn per contact tick while the beak touches a blossom.
const SIP_PER_TICK: f32 = 0.01;
/// Beak-to-blossom distance that counts as a feeding contact.
const CONTACT_RADIUS: f32 = 0.12;
/// Stand-in collision radius around each plant stem for spawn clearance.
const STEM_RADIUS: f32 = 0.08;

fn main() -> Result<()> {
    init_tracing();
    run_demo()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Toy semi-implicit Euler integrator. The simulation core never steps
/// dynamics; this driver does, at its own cadence.
struct KinematicBody {
    position: Vec3,
    velocity: Vec3,
    euler: Vec3,
    pending_force: Vec3,
    sleeping: bool,
    mass: f32,
    linear_drag: f32,
}

impl KinematicBody {
    fn new() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            euler: Vec3::ZERO,
            pending_force: Vec3::ZERO,
            sleeping: false,
            mass: 0.05,
            linear_drag: 2.0,
        }
    }

    fn step(&mut self, dt: f32) {
        let force = std::mem::replace(&mut self.pending_force, Vec3::ZERO);
        if self.sleeping {
            return;
        }
        self.velocity += force / self.mass * dt;
        self.velocity *= (1.0 - self.linear_drag * dt).max(0.0);
        self.position += self.velocity * dt;
    }
}

impl RigidBody for KinematicBody {
    fn apply_force(&mut self, force: Vec3) {
        self.pending_force += force;
    }

    fn euler_rotation(&self) -> Vec3 {
        self.euler
    }

    fn set_euler_rotation(&mut self, euler_degrees: Vec3) {
        self.euler = euler_degrees;
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.velocity = Vec3::ZERO;
    }

    fn set_sleeping(&mut self, sleeping: bool) {
        self.sleeping = sleeping;
        if sleeping {
            self.velocity = Vec3::ZERO;
        }
    }
}

/// A ring of flower plants around the area origin, blossoms tilted outward
/// so approach direction matters.
fn demo_scene(plants: usize, radius: f32) -> SceneNode {
    let children = (0..plants)
        .map(|index| {
            let angle = index as f32 / plants as f32 * std::f32::consts::TAU;
            let outward = Vec3::new(angle.cos(), 0.0, angle.sin());
            SceneNode::Plant(PlantSpec {
                pivot: outward * radius + Vec3::Y * 1.0,
                blossoms: vec![BlossomSpec {
                    offset: Vec3::new(0.0, 0.5, 0.0),
                    up: outward * 0.4 + Vec3::Y,
                    nectar_collider: ColliderHandle(index as u64 + 1),
                }],
            })
        })
        .collect();
    SceneNode::Group(children)
}

fn plant_pivots(node: &SceneNode, out: &mut Vec<Vec3>) {
    match node {
        SceneNode::Group(children) => {
            for child in children {
                plant_pivots(child, out);
            }
        }
        SceneNode::Plant(spec) => out.push(spec.pivot),
    }
}

/// Scripted stand-in for a trained policy: push along the observed flower
/// direction and keep the rotation rates centered.
fn chase_action(observation: &[f32; OBSERVATION_SIZE]) -> [f32; ACTION_SIZE] {
    if observation.iter().all(|component| *component == 0.0) {
        return [0.0; ACTION_SIZE];
    }
    [observation[4], observation[5], observation[6], 0.0, 0.0]
}

fn run_demo() -> Result<()> {
    let config = AviaryConfig {
        rng_seed: Some(0x5EED_B1D5),
        max_episode_steps: 1_500,
        ..AviaryConfig::default()
    };
    let scene = demo_scene(8, 4.0);
    let mut pivots = Vec::new();
    plant_pivots(&scene, &mut pivots);

    let registry = FlowerRegistry::discover(&scene)?;
    let mut state = AviaryState::new(config, registry, true)?;
    let mut body = KinematicBody::new();
    info!(
        flowers = state.registry().len(),
        episodes = EPISODES,
        "starting aviary demo"
    );

    for _ in 0..EPISODES {
        let mut probe = |center: Vec3, radius: f32| {
            pivots
                .iter()
                .filter(|pivot| pivot.distance(center) < radius + STEM_RADIUS)
                .count()
        };
        state.begin_episode(&mut body, &mut probe)?;

        loop {
            let observation = state.collect_observations();
            let action = chase_action(&observation);
            state.apply_action(&action, &mut body);
            body.step(state.config().fixed_dt);
            let events = state.fixed_step(&body);

            sip_nearby_flowers(&mut state)?;
            keep_inside_area(&mut state, &mut body);

            if events.step_limit_reached || state.registry().total_nectar() == 0.0 {
                break;
            }
        }

        info!(
            episode = state.episode(),
            steps = state.episode_steps(),
            mode = ?state.spawn_mode(),
            nectar = state.bird().nectar_obtained,
            reward = state.bird().episode_reward,
            "episode complete"
        );
    }

    for summary in state.history() {
        debug!(
            episode = summary.episode,
            steps = summary.steps,
            nectar = summary.nectar_obtained,
            reward = summary.reward,
            "retained summary"
        );
    }
    Ok(())
}

/// Stand-in for the host collision system: any blossom within reach of the
/// beak tip produces a feeding contact this tick.
fn sip_nearby_flowers(state: &mut AviaryState) -> Result<()> {
    let beak = state.bird().beak_tip(state.config().beak_tip_offset);
    let contacts: Vec<ColliderHandle> = state
        .registry()
        .iter()
        .filter(|(_, flower)| {
            flower.colliders_active() && flower.position().distance(beak) < CONTACT_RADIUS
        })
        .map(|(_, flower)| flower.nectar_collider())
        .collect();

    for handle in contacts {
        let outcome = state.feed_from_collider(handle, SIP_PER_TICK)?;
        if outcome.emptied {
            debug!(%handle, "flower drained");
        }
    }
    Ok(())
}

/// Reflect the agent back inside the flight area, charging the boundary
/// penalty the way a wall collider would.
fn keep_inside_area(state: &mut AviaryState, body: &mut KinematicBody) {
    let origin = state.config().area_origin;
    let limit = state.config().area_diameter * 0.5;
    let offset = state.bird().position - origin;
    if offset.length() <= limit {
        return;
    }
    let reward = state.boundary_collision();
    let inside = origin + offset.normalize_or_zero() * (limit - 0.1);
    body.set_position(inside);
    debug!(reward, "boundary strike");
}
