//! Boundary to the simulation engine that hosts the vehicles
//!
//! The server only ever talks to the engine through [`FleetBackend`]. The
//! [`SimulatedBackend`] stands in for a real engine: it owns a fixed set of
//! spawn points and moves every spawned vehicle along a straight line at a
//! constant, randomly chosen velocity.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{round2, Location};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;

/// Identifier of one actor inside the simulation engine.
pub type ActorId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("simulation backend unavailable: {0}")]
    Unavailable(String),
    #[error("actor {0} no longer exists")]
    HandleGone(ActorId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleTelemetry {
    /// Metres per second.
    pub speed: f64,
    pub location: Location,
}

/// Spawn/query/destroy operations the server needs from the engine.
///
/// Implementations must be safe to call from many sessions at once.
pub trait FleetBackend: Send + Sync {
    /// How many more vehicles can be spawned right now.
    fn capacity(&self) -> usize;

    /// Spawns up to `count` vehicles on autopilot. Partial fulfilment is not
    /// an error; only total unavailability is.
    fn spawn(&self, count: usize) -> Result<Vec<ActorId>, BackendError>;

    fn snapshot(&self, actor: ActorId) -> Result<VehicleTelemetry, BackendError>;

    fn destroy(&self, actor: ActorId) -> Result<(), BackendError>;

    /// Every vehicle actor alive in the engine, owned or not.
    fn actors(&self) -> Result<Vec<ActorId>, BackendError>;
}

const SPAWN_GRID_COLUMNS: usize = 10;
const SPAWN_GRID_SPACING: f64 = 12.5;
const MAX_CRUISE_SPEED: f64 = 15.0;

#[derive(Debug, Clone)]
struct SimActor {
    spawn_point: usize,
    origin: Location,
    velocity: (f64, f64),
    spawned_at: Instant,
}

struct SimWorld {
    spawn_points: Vec<Location>,
    actors: HashMap<ActorId, SimActor>,
    next_actor_id: ActorId,
    online: bool,
    destroyed: Vec<ActorId>,
    rng: StdRng,
}

impl SimWorld {
    fn free_spawn_points(&self) -> Vec<usize> {
        let mut occupied = vec![false; self.spawn_points.len()];
        for actor in self.actors.values() {
            occupied[actor.spawn_point] = true;
        }
        (0..self.spawn_points.len())
            .filter(|i| !occupied[*i])
            .collect()
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.online {
            Ok(())
        } else {
            Err(BackendError::Unavailable("simulator offline".to_string()))
        }
    }
}

/// In-process simulation engine with a fixed number of spawn points.
pub struct SimulatedBackend {
    world: Mutex<SimWorld>,
}

impl SimulatedBackend {
    pub fn new(spawn_points: usize) -> Self {
        Self::with_rng(spawn_points, StdRng::from_entropy())
    }

    /// Deterministic velocities, for tests.
    pub fn seeded(spawn_points: usize, seed: u64) -> Self {
        Self::with_rng(spawn_points, StdRng::seed_from_u64(seed))
    }

    fn with_rng(spawn_points: usize, rng: StdRng) -> Self {
        let points = (0..spawn_points)
            .map(|i| Location {
                x: (i % SPAWN_GRID_COLUMNS) as f64 * SPAWN_GRID_SPACING,
                y: (i / SPAWN_GRID_COLUMNS) as f64 * SPAWN_GRID_SPACING,
            })
            .collect();

        Self {
            world: Mutex::new(SimWorld {
                spawn_points: points,
                actors: HashMap::new(),
                next_actor_id: 1,
                online: true,
                destroyed: Vec::new(),
                rng,
            }),
        }
    }

    /// Takes the simulator offline (or back online). While offline every call
    /// fails with [`BackendError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        if let Ok(mut world) = self.lock() {
            world.online = online;
        }
    }

    /// Actors destroyed so far, in destruction order.
    pub fn destroyed(&self) -> Vec<ActorId> {
        self.lock()
            .map(|world| world.destroyed.clone())
            .unwrap_or_default()
    }

    pub fn spawn_point_count(&self) -> usize {
        self.lock()
            .map(|world| world.spawn_points.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimWorld>, BackendError> {
        self.world
            .lock()
            .map_err(|_| BackendError::Unavailable("simulator state poisoned".to_string()))
    }
}

impl FleetBackend for SimulatedBackend {
    fn capacity(&self) -> usize {
        match self.lock() {
            Ok(world) if world.online => world.free_spawn_points().len(),
            _ => 0,
        }
    }

    fn spawn(&self, count: usize) -> Result<Vec<ActorId>, BackendError> {
        let mut world = self.lock()?;
        world.ensure_online()?;

        let free = world.free_spawn_points();
        let mut spawned = Vec::with_capacity(count.min(free.len()));

        for spawn_point in free.into_iter().take(count) {
            let id = world.next_actor_id;
            world.next_actor_id += 1;

            let heading = world.rng.gen_range(0.0..std::f64::consts::TAU);
            let cruise = world.rng.gen_range(0.0..MAX_CRUISE_SPEED);
            let actor = SimActor {
                spawn_point,
                origin: world.spawn_points[spawn_point],
                velocity: (cruise * heading.cos(), cruise * heading.sin()),
                spawned_at: Instant::now(),
            };

            debug!("Spawned actor {} at spawn point {}", id, spawn_point);
            world.actors.insert(id, actor);
            spawned.push(id);
        }

        Ok(spawned)
    }

    fn snapshot(&self, actor: ActorId) -> Result<VehicleTelemetry, BackendError> {
        let world = self.lock()?;
        world.ensure_online()?;

        let sim = world
            .actors
            .get(&actor)
            .ok_or(BackendError::HandleGone(actor))?;
        let elapsed = sim.spawned_at.elapsed().as_secs_f64();
        let (vx, vy) = sim.velocity;

        Ok(VehicleTelemetry {
            speed: round2((vx * vx + vy * vy).sqrt()),
            location: Location {
                x: round2(sim.origin.x + vx * elapsed),
                y: round2(sim.origin.y + vy * elapsed),
            },
        })
    }

    fn destroy(&self, actor: ActorId) -> Result<(), BackendError> {
        let mut world = self.lock()?;
        world.ensure_online()?;

        if world.actors.remove(&actor).is_none() {
            return Err(BackendError::HandleGone(actor));
        }
        world.destroyed.push(actor);
        info!("Actor {} destroyed", actor);
        Ok(())
    }

    fn actors(&self) -> Result<Vec<ActorId>, BackendError> {
        let world = self.lock()?;
        world.ensure_online()?;

        let mut ids: Vec<ActorId> = world.actors.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
