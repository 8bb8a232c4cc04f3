//! Operator-facing administrative operations over the fleet registry

use crate::backend::{ActorId, BackendError};
use crate::cleanup::{CleanupReport, ForcedCleanup};
use crate::context::ServerContext;
use crate::monitor::{ResourceMonitor, ResourceSample};
use crate::registry::{ClientId, SessionRecord, VehicleHandle};
use log::{info, warn};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("vehicle {0} not found")]
    VehicleNotFound(ActorId),
    #[error("client {0} not found")]
    ClientNotFound(ClientId),
    #[error("client {0} is already being disconnected")]
    AlreadyDisconnecting(ClientId),
    #[error("no device info received")]
    NoDeviceInfo,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A vehicle as listed for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleEntry {
    pub owner: ClientId,
    pub handle: VehicleHandle,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DestroyAllReport {
    pub actors_destroyed: usize,
    pub actor_failures: usize,
    /// Clients whose forced cleanup was scheduled.
    pub disconnects: usize,
}

pub struct ControlSurface {
    ctx: Arc<ServerContext>,
    monitor: ResourceMonitor,
}

impl ControlSurface {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let monitor = ResourceMonitor::new(
            ctx.config.monitor_interval,
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.backend),
        );
        Self { ctx, monitor }
    }

    pub async fn list_clients(&self) -> Vec<ClientId> {
        self.ctx.registry.client_ids().await
    }

    /// Every owned vehicle, grouped by owner in client order.
    pub async fn list_vehicles(&self) -> Vec<VehicleEntry> {
        let mut entries = Vec::new();
        self.ctx
            .registry
            .for_each(|client, record| {
                entries.extend(record.vehicles.iter().map(|handle| VehicleEntry {
                    owner: *client,
                    handle: *handle,
                }));
            })
            .await;
        entries.sort_by_key(|entry| entry.owner);
        entries
    }

    /// Detaches the vehicle from its owner and destroys it. If the backend
    /// refuses, the vehicle goes back to its owner.
    pub async fn remove_vehicle(&self, actor: ActorId) -> Result<ClientId, ControlError> {
        let (owner, handle) = self
            .ctx
            .registry
            .find_map(|record| {
                let pos = record.vehicles.iter().position(|v| v.actor == actor)?;
                Some((record.client, record.vehicles.remove(pos)))
            })
            .await
            .ok_or(ControlError::VehicleNotFound(actor))?;

        match self.ctx.backend.destroy(actor) {
            Ok(()) => {}
            Err(BackendError::HandleGone(_)) => {
                info!("Vehicle {} was already gone from the engine", actor);
            }
            Err(e) => {
                warn!("Failed to destroy vehicle {}: {}", actor, e);
                self.ctx
                    .registry
                    .update(&owner, |record| record.vehicles.push(handle))
                    .await;
                return Err(e.into());
            }
        }

        info!("Vehicle {} of client {} removed", actor, owner);
        Ok(owner)
    }

    /// Starts the forced cleanup for one client. The returned handle resolves
    /// once the grace period has passed and the client is gone.
    ///
    /// A repeat call while the grace period is still running returns
    /// `AlreadyDisconnecting`. Once the client is gone it returns `ClientNotFound`.
    pub async fn force_disconnect(
        &self,
        client: ClientId,
    ) -> Result<JoinHandle<Option<CleanupReport>>, ControlError> {
        match self.ctx.cleanup.forced(client).await {
            ForcedCleanup::Scheduled(handle) => Ok(handle),
            ForcedCleanup::AlreadyClosing => Err(ControlError::AlreadyDisconnecting(client)),
            ForcedCleanup::NotFound => Err(ControlError::ClientNotFound(client)),
        }
    }

    pub fn start_monitor(&self) -> bool {
        self.monitor.start()
    }

    pub fn stop_monitor(&self) -> bool {
        self.monitor.stop()
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        self.monitor.latest()
    }

    /// Destroys every live engine actor, owned or not, then force-disconnects
    /// every client.
    pub async fn destroy_all(&self) -> Result<DestroyAllReport, ControlError> {
        let mut report = DestroyAllReport::default();

        for actor in self.ctx.backend.actors()? {
            match self.ctx.backend.destroy(actor) {
                Ok(()) | Err(BackendError::HandleGone(_)) => report.actors_destroyed += 1,
                Err(e) => {
                    warn!("Failed to destroy actor {}: {}", actor, e);
                    report.actor_failures += 1;
                }
            }
        }

        for client in self.ctx.registry.client_ids().await {
            if let ForcedCleanup::Scheduled(_) = self.ctx.cleanup.forced(client).await {
                report.disconnects += 1;
            }
        }

        info!(
            "Destroyed {} actors, disconnecting {} clients",
            report.actors_destroyed, report.disconnects
        );
        Ok(report)
    }

    /// Last device info for one client, or for every client that sent any.
    pub async fn client_info(
        &self,
        client: Option<ClientId>,
    ) -> Result<Vec<(ClientId, Value)>, ControlError> {
        match client {
            Some(client) => {
                let record = self
                    .ctx
                    .registry
                    .get(&client)
                    .await
                    .ok_or(ControlError::ClientNotFound(client))?;
                let info = device_info(&record).ok_or(ControlError::NoDeviceInfo)?;
                Ok(vec![(client, info)])
            }
            None => {
                let mut all = Vec::new();
                self.ctx
                    .registry
                    .for_each(|client, record| {
                        if let Some(info) = device_info(record) {
                            all.push((*client, info));
                        }
                    })
                    .await;
                if all.is_empty() {
                    return Err(ControlError::NoDeviceInfo);
                }
                all.sort_by_key(|(client, _)| *client);
                Ok(all)
            }
        }
    }
}

fn device_info(record: &SessionRecord) -> Option<Value> {
    record.device_info.clone()
}
