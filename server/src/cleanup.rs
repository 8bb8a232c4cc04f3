//! Releasing a client: destroy its vehicles, close its connection, drop its
//! registry entry
//!
//! Graceful cleanup runs the teardown at once. Forced cleanup first warns the
//! client, then runs the same teardown from a separately spawned task once the
//! grace period has passed, whether or not the client reacted. Teardown is
//! best-effort: individual destroy failures are logged and counted, and the
//! registry entry is always removed.

use crate::backend::{BackendError, FleetBackend};
use crate::config::ServerConfig;
use crate::registry::{ClientId, FleetRegistry, SessionRecord, VehicleHandle};
use log::{debug, info, warn};
use shared::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What a teardown did with the client's vehicles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub client: ClientId,
    pub destroyed: usize,
    /// Vehicles the engine had already removed.
    pub already_gone: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub enum ForcedCleanup {
    /// Warning sent (or attempted); the handle resolves after teardown.
    Scheduled(JoinHandle<Option<CleanupReport>>),
    /// A forced cleanup is already counting down for this client.
    AlreadyClosing,
    NotFound,
}

#[derive(Clone)]
pub struct CleanupCoordinator {
    registry: Arc<FleetRegistry>,
    backend: Arc<dyn FleetBackend>,
    grace_period: Duration,
    warning: String,
}

impl CleanupCoordinator {
    pub fn new(
        registry: Arc<FleetRegistry>,
        backend: Arc<dyn FleetBackend>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            grace_period: config.grace_period,
            warning: config.disconnect_warning(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Client asked to leave: tear down now. Returns `None` if someone else
    /// already did.
    pub async fn graceful(&self, client: ClientId) -> Option<CleanupReport> {
        let record = self.registry.remove(&client).await?;
        Some(self.teardown(record).await)
    }

    /// Warns the client and schedules the teardown after the grace period.
    /// Never waits for the grace period itself.
    pub async fn forced(&self, client: ClientId) -> ForcedCleanup {
        let marked = self
            .registry
            .update(&client, |record| {
                if record.closing {
                    None
                } else {
                    record.closing = true;
                    Some(Arc::clone(&record.connection))
                }
            })
            .await;

        let connection = match marked {
            None => return ForcedCleanup::NotFound,
            Some(None) => return ForcedCleanup::AlreadyClosing,
            Some(Some(connection)) => connection,
        };

        info!(
            "Disconnecting client {} in {:.1} seconds",
            client,
            self.grace_period.as_secs_f32()
        );

        let coordinator = self.clone();
        let warning = Command::DisconnectWarning {
            message: self.warning.clone(),
        };

        ForcedCleanup::Scheduled(tokio::spawn(async move {
            let deadline = Instant::now() + coordinator.grace_period;

            match tokio::time::timeout_at(deadline, connection.send(&warning)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Warning to {} not delivered: {}", client, e),
                Err(_) => debug!("Warning to {} still pending at deadline", client),
            }

            tokio::time::sleep_until(deadline).await;
            match coordinator.registry.remove_connection(&client, &connection).await {
                Some(record) => Some(coordinator.teardown(record).await),
                None => {
                    debug!("Client {} already removed or replaced before teardown", client);
                    None
                }
            }
        }))
    }

    /// Destroys every vehicle a removed record owned and closes its
    /// connection. Callers remove the record first, so only one of them gets
    /// to tear it down.
    async fn teardown(&self, record: SessionRecord) -> CleanupReport {
        let client = record.client;
        let report = self.release_vehicles(client, &record.vehicles);
        record.connection.close().await;

        info!(
            "Client {} disconnected ({} destroyed, {} already gone, {} failed)",
            client, report.destroyed, report.already_gone, report.failed
        );
        report
    }

    /// Destroys each vehicle, carrying on past failures.
    pub fn release_vehicles(&self, client: ClientId, vehicles: &[VehicleHandle]) -> CleanupReport {
        let mut report = CleanupReport {
            client,
            destroyed: 0,
            already_gone: 0,
            failed: 0,
        };

        for vehicle in vehicles {
            match self.backend.destroy(vehicle.actor) {
                Ok(()) => {
                    debug!("Destroyed vehicle {} of client {}", vehicle.actor, client);
                    report.destroyed += 1;
                }
                Err(BackendError::HandleGone(_)) => {
                    debug!("Vehicle {} of client {} already gone", vehicle.actor, client);
                    report.already_gone += 1;
                }
                Err(e) => {
                    warn!("Failed to destroy vehicle {} of client {}: {}", vehicle.actor, client, e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::session::Connection;
    use shared::FrameReader;
    use std::net::SocketAddr;
    use tokio::io::{duplex, DuplexStream};

    fn test_client(port: u16) -> ClientId {
        ClientId::new(SocketAddr::from(([192, 168, 0, 10], port)))
    }

    struct Fixture {
        registry: Arc<FleetRegistry>,
        backend: Arc<SimulatedBackend>,
        cleanup: CleanupCoordinator,
    }

    fn fixture(grace: Duration) -> Fixture {
        let registry = Arc::new(FleetRegistry::new());
        let backend = Arc::new(SimulatedBackend::seeded(10, 21));
        let config = ServerConfig {
            grace_period: grace,
            ..ServerConfig::default()
        };
        let cleanup = CleanupCoordinator::new(Arc::clone(&registry), backend.clone(), &config);
        Fixture {
            registry,
            backend,
            cleanup,
        }
    }

    /// Registers a client owning `vehicles` freshly spawned actors and returns
    /// the far end of its connection.
    async fn connect(f: &Fixture, port: u16, vehicles: usize) -> FrameReader<DuplexStream> {
        let (server_side, client_side) = duplex(4096);
        let (connection, _closed) = Connection::new(Box::new(server_side));
        let mut record = SessionRecord::new(test_client(port), connection);
        record.vehicles = f
            .backend
            .spawn(vehicles)
            .unwrap()
            .into_iter()
            .map(VehicleHandle::autopilot)
            .collect();
        f.registry.put(record).await;
        FrameReader::new(client_side)
    }

    #[tokio::test]
    async fn test_graceful_destroys_and_removes() {
        let f = fixture(Duration::from_secs(60));
        let _peer = connect(&f, 1, 3).await;

        let report = f.cleanup.graceful(test_client(1)).await.unwrap();
        assert_eq!(report.destroyed, 3);
        assert_eq!(report.failed, 0);
        assert!(f.registry.get(&test_client(1)).await.is_none());
        assert_eq!(f.backend.destroyed().len(), 3);
    }

    #[tokio::test]
    async fn test_graceful_twice_is_noop() {
        let f = fixture(Duration::from_secs(60));
        let _peer = connect(&f, 1, 1).await;

        assert!(f.cleanup.graceful(test_client(1)).await.is_some());
        assert!(f.cleanup.graceful(test_client(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_forced_warns_then_tears_down_after_grace() {
        let f = fixture(Duration::from_millis(80));
        let mut peer = connect(&f, 2, 2).await;
        let _bystander = connect(&f, 3, 1).await;

        let started = std::time::Instant::now();
        let handle = match f.cleanup.forced(test_client(2)).await {
            ForcedCleanup::Scheduled(handle) => handle,
            other => panic!("Unexpected outcome: {:?}", other),
        };

        match peer.next_command().await.unwrap() {
            Some(Command::DisconnectWarning { message }) => assert!(message.contains("seconds")),
            other => panic!("Unexpected frame: {:?}", other),
        }
        // Still registered (and marked) during the grace period.
        assert!(f.registry.get(&test_client(2)).await.unwrap().closing);

        let report = handle.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(report.destroyed, 2);
        assert!(f.registry.get(&test_client(2)).await.is_none());
        assert!(f.registry.get(&test_client(3)).await.is_some());

        // Connection closed after teardown.
        assert!(peer.next_command().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forced_twice() {
        let f = fixture(Duration::from_millis(20));
        let _peer = connect(&f, 4, 1).await;

        let first = f.cleanup.forced(test_client(4)).await;
        assert!(matches!(
            f.cleanup.forced(test_client(4)).await,
            ForcedCleanup::AlreadyClosing
        ));

        if let ForcedCleanup::Scheduled(handle) = first {
            handle.await.unwrap();
        }
        assert!(matches!(
            f.cleanup.forced(test_client(4)).await,
            ForcedCleanup::NotFound
        ));
    }

    #[tokio::test]
    async fn test_forced_spares_record_replaced_during_grace() {
        let f = fixture(Duration::from_millis(40));
        let _old_peer = connect(&f, 8, 1).await;

        let ForcedCleanup::Scheduled(handle) = f.cleanup.forced(test_client(8)).await else {
            panic!("expected a scheduled cleanup");
        };

        // Same address reconnects before the grace period ends.
        let stale = f.registry.remove(&test_client(8)).await.unwrap();
        f.cleanup.release_vehicles(test_client(8), &stale.vehicles);
        let _new_peer = connect(&f, 8, 2).await;
        let new_vehicles: Vec<_> = f
            .registry
            .get(&test_client(8))
            .await
            .unwrap()
            .vehicles
            .iter()
            .map(|v| v.actor)
            .collect();

        assert!(handle.await.unwrap().is_none());

        let record = f.registry.get(&test_client(8)).await.unwrap();
        assert!(!record.closing);
        assert_eq!(record.vehicles.len(), 2);
        let destroyed = f.backend.destroyed();
        assert_eq!(destroyed.len(), 1);
        assert!(new_vehicles.iter().all(|actor| !destroyed.contains(actor)));
    }

    #[tokio::test]
    async fn test_forced_on_unknown_client() {
        let f = fixture(Duration::from_millis(20));
        assert!(matches!(
            f.cleanup.forced(test_client(9)).await,
            ForcedCleanup::NotFound
        ));
    }

    #[tokio::test]
    async fn test_forced_completes_when_peer_gone() {
        let f = fixture(Duration::from_millis(20));
        let peer = connect(&f, 5, 2).await;
        drop(peer);

        let ForcedCleanup::Scheduled(handle) = f.cleanup.forced(test_client(5)).await else {
            panic!("expected a scheduled cleanup");
        };
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.destroyed, 2);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_teardown_survives_destroy_failures() {
        let f = fixture(Duration::from_secs(60));
        let _peer = connect(&f, 6, 3).await;

        let record = f.registry.get(&test_client(6)).await.unwrap();
        f.backend.destroy(record.vehicles[0].actor).unwrap();

        let report = f.cleanup.graceful(test_client(6)).await.unwrap();
        assert_eq!(report.already_gone, 1);
        assert_eq!(report.destroyed, 2);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_teardown_with_backend_offline_still_removes_entry() {
        let f = fixture(Duration::from_secs(60));
        let _peer = connect(&f, 7, 2).await;
        f.backend.set_online(false);

        let report = f.cleanup.graceful(test_client(7)).await.unwrap();
        assert_eq!(report.failed, 2);
        assert!(f.registry.get(&test_client(7)).await.is_none());
    }
}
