//! One client connection: receive loop, command dispatch and send path

use crate::backend::BackendError;
use crate::context::ServerContext;
use crate::registry::{ClientId, SessionRecord, VehicleHandle};
use log::{debug, info, warn};
use serde_json::Value;
use shared::{Command, FrameError, FrameReader, FrameWriter, VehicleInfo};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound on a single outgoing frame; a peer that stops reading turns
/// into a transport error instead of pinning the writer lock.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Send half of a client connection plus the signal that ends its receive loop.
pub struct Connection {
    writer: FrameWriter<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(writer: BoxedWriter) -> (Arc<Self>, watch::Receiver<bool>) {
        let (closed, closed_rx) = watch::channel(false);
        let connection = Arc::new(Self {
            writer: FrameWriter::new(writer),
            closed,
        });
        (connection, closed_rx)
    }

    pub async fn send(&self, command: &Command) -> Result<(), FrameError> {
        match tokio::time::timeout(WRITE_TIMEOUT, self.writer.send(command)).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer stopped reading",
            ))),
        }
    }

    /// Wakes the receive loop and shuts the write half down. Errors are
    /// swallowed: once closed the registry, not the socket, is authoritative.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.writer.shutdown()).await {
            debug!("Ignoring shutdown error: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

enum Flow {
    Continue,
    Disconnect,
}

/// Why the receive loop stopped reading.
enum Interrupt {
    Closed,
    Eof,
    Idle,
    Failed(FrameError),
}

pub struct Session<R> {
    client: ClientId,
    reader: FrameReader<R>,
    connection: Arc<Connection>,
    closed: watch::Receiver<bool>,
    ctx: Arc<ServerContext>,
    state: SessionState,
}

impl<R: AsyncRead + Unpin> Session<R> {
    /// Registers the connection with an empty vehicle list and returns the
    /// session in the `Active` state.
    pub async fn accept(
        client: ClientId,
        reader: R,
        writer: BoxedWriter,
        ctx: Arc<ServerContext>,
    ) -> Self {
        let (connection, closed) = Connection::new(writer);
        let reader = FrameReader::with_limits(
            reader,
            ctx.config.read_chunk_size,
            ctx.config.max_frame_len,
        );
        let mut session = Self {
            client,
            reader,
            connection: Arc::clone(&connection),
            closed,
            ctx,
            state: SessionState::Connecting,
        };

        let record = SessionRecord::new(client, connection);
        if let Some(stale) = session.ctx.registry.put(record).await {
            warn!("Replacing stale session for {}", client);
            let report = session.ctx.cleanup.release_vehicles(client, &stale.vehicles);
            debug!("Stale session release: {:?}", report);
            stale.connection.close().await;
        }

        info!("Client {} connected", client);
        session.state = SessionState::Active;
        session
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Processes commands in arrival order until the connection ends, and
    /// returns the state the session finished in.
    pub async fn run(mut self) -> SessionState {
        loop {
            let next = match self.next_command().await {
                Ok(command) => command,
                Err(Interrupt::Closed) => {
                    debug!("Receive loop for {} closed by cleanup", self.client);
                    self.state = SessionState::Closed;
                    break;
                }
                Err(Interrupt::Eof) => {
                    info!("Client {} closed the connection without disconnecting", self.client);
                    self.begin_forced_cleanup().await;
                    break;
                }
                Err(Interrupt::Idle) => {
                    warn!("Client {} idle, disconnecting", self.client);
                    self.begin_forced_cleanup().await;
                    break;
                }
                Err(Interrupt::Failed(FrameError::InvalidCommand(e))) => {
                    warn!("Invalid command from {}: {}", self.client, e);
                    continue;
                }
                Err(Interrupt::Failed(e)) => {
                    if e.is_protocol() {
                        warn!("Protocol error from {}: {}", self.client, e);
                    } else {
                        warn!("Transport error on {}: {}", self.client, e);
                    }
                    self.begin_forced_cleanup().await;
                    break;
                }
            };

            match self.dispatch(next).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Disconnect) => {
                    self.state = SessionState::Closing;
                    self.ctx.cleanup.graceful(self.client).await;
                    self.state = SessionState::Closed;
                    break;
                }
                Err(e) => {
                    warn!("Failed to reply to {}: {}", self.client, e);
                    self.begin_forced_cleanup().await;
                    break;
                }
            }
        }

        info!("Session for {} ended ({:?})", self.client, self.state);
        self.state
    }

    async fn next_command(&mut self) -> Result<Command, Interrupt> {
        if *self.closed.borrow() {
            return Err(Interrupt::Closed);
        }

        let idle_timeout = self.ctx.config.idle_timeout;
        let reader = &mut self.reader;
        let closed = &mut self.closed;

        let read = async move {
            let result = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, reader.next_command()).await {
                    Ok(result) => result,
                    Err(_) => return Err(Interrupt::Idle),
                },
                None => reader.next_command().await,
            };
            match result {
                Ok(Some(command)) => Ok(command),
                Ok(None) => Err(Interrupt::Eof),
                Err(e) => Err(Interrupt::Failed(e)),
            }
        };

        tokio::select! {
            _ = closed.changed() => Err(Interrupt::Closed),
            result = read => result,
        }
    }

    async fn begin_forced_cleanup(&mut self) {
        self.state = SessionState::Closing;
        let outcome = self.ctx.cleanup.forced(self.client).await;
        debug!("Forced cleanup for {}: {:?}", self.client, outcome);
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, FrameError> {
        let action = command.action();
        match &command {
            Command::SendDeviceInfo { .. } => debug!("Device info from {}", self.client),
            _ => info!("Command from {}: {}", self.client, action),
        }

        match command {
            Command::RequestSpawn { num_vehicles } => {
                let spawned = self.spawn_vehicles(num_vehicles as usize).await;
                self.connection
                    .send(&Command::SpawnVehicles {
                        num_vehicles: spawned as u32,
                    })
                    .await?;
            }
            Command::GetVehicleInfo => {
                let vehicles = self.vehicle_info().await;
                self.connection
                    .send(&Command::VehicleInfo { vehicles })
                    .await?;
            }
            Command::Disconnect => {
                if let Err(e) = self.connection.send(&Command::Disconnect).await {
                    debug!("Disconnect ack to {} not delivered: {}", self.client, e);
                }
                return Ok(Flow::Disconnect);
            }
            Command::SendDeviceInfo { device_info } => {
                self.store_device_info(device_info).await;
            }
            Command::SpawnVehicles { .. }
            | Command::VehicleInfo { .. }
            | Command::DisconnectWarning { .. } => {
                warn!(
                    "Client {} sent server-only action {}, ignoring",
                    self.client, action
                );
            }
            Command::Unknown => {
                warn!("Unrecognized command from {}", self.client);
            }
        }

        Ok(Flow::Continue)
    }

    /// Spawns up to `requested` vehicles and hands them to this client.
    /// Returns how many the client now owns from this request.
    async fn spawn_vehicles(&self, requested: usize) -> usize {
        let backend = &self.ctx.backend;
        let wanted = requested.min(backend.capacity());
        if wanted == 0 {
            return 0;
        }

        let actors = match backend.spawn(wanted) {
            Ok(actors) => actors,
            Err(e) => {
                warn!("Spawn for {} failed: {}", self.client, e);
                return 0;
            }
        };
        let handles: Vec<VehicleHandle> = actors.into_iter().map(VehicleHandle::autopilot).collect();

        let attached = self
            .ctx
            .registry
            .update(&self.client, |record| {
                if record.closing {
                    false
                } else {
                    record.vehicles.extend(handles.iter().copied());
                    true
                }
            })
            .await
            .unwrap_or(false);

        if !attached {
            warn!(
                "Client {} is closing, releasing {} freshly spawned vehicles",
                self.client,
                handles.len()
            );
            self.ctx.cleanup.release_vehicles(self.client, &handles);
            return 0;
        }

        for handle in &handles {
            info!(
                "Vehicle {} spawned for client {} ({})",
                handle.actor, self.client, handle.control_mode
            );
        }
        handles.len()
    }

    async fn vehicle_info(&self) -> Vec<VehicleInfo> {
        let owned = match self.ctx.registry.get(&self.client).await {
            Some(record) => record.vehicles,
            None => return Vec::new(),
        };

        let mut vehicles = Vec::with_capacity(owned.len());
        for handle in owned {
            match self.ctx.backend.snapshot(handle.actor) {
                Ok(telemetry) => vehicles.push(VehicleInfo {
                    id: handle.actor,
                    speed: telemetry.speed,
                    location: telemetry.location,
                    control_mode: handle.control_mode,
                }),
                Err(BackendError::HandleGone(_)) => {}
                Err(e) => warn!("Telemetry for vehicle {} unavailable: {}", handle.actor, e),
            }
        }
        vehicles
    }

    async fn store_device_info(&self, device_info: Value) {
        let empty = match &device_info {
            Value::Null => true,
            Value::Object(fields) => fields.is_empty(),
            _ => false,
        };
        if empty {
            return;
        }

        self.ctx
            .registry
            .update(&self.client, |record| record.device_info = Some(device_info))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FleetBackend, SimulatedBackend};
    use crate::config::ServerConfig;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        ctx: Arc<ServerContext>,
        backend: Arc<SimulatedBackend>,
        client: ClientId,
        to_server: WriteHalf<DuplexStream>,
        from_server: FrameReader<ReadHalf<DuplexStream>>,
        session: tokio::task::JoinHandle<SessionState>,
    }

    impl Harness {
        async fn start(spawn_points: usize) -> Self {
            let backend = Arc::new(SimulatedBackend::seeded(spawn_points, 11));
            let config = ServerConfig {
                grace_period: Duration::from_millis(50),
                ..ServerConfig::default()
            };
            let ctx = ServerContext::new(config, backend.clone());
            let client = ClientId::new(SocketAddr::from(([10, 0, 0, 1], 40000)));

            let (server_side, client_side) = duplex(4096);
            let (server_read, server_write) = tokio::io::split(server_side);
            let (client_read, client_write) = tokio::io::split(client_side);

            let session =
                Session::accept(client, server_read, Box::new(server_write), Arc::clone(&ctx)).await;
            assert_eq!(session.state(), SessionState::Active);

            Self {
                ctx,
                backend,
                client,
                to_server: client_write,
                from_server: FrameReader::new(client_read),
                session: tokio::spawn(session.run()),
            }
        }

        async fn send_raw(&mut self, raw: &[u8]) {
            self.to_server.write_all(raw).await.unwrap();
        }

        async fn send(&mut self, command: &Command) {
            let frame = shared::framing::encode(command).unwrap();
            self.send_raw(&frame).await;
        }

        async fn recv(&mut self) -> Command {
            self.from_server.next_command().await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_spawn_registers_autopilot_vehicles() {
        let mut h = Harness::start(5).await;

        h.send_raw(b"{\"action\":\"request_spawn\",\"num_vehicles\":3}\n").await;
        assert_eq!(h.recv().await, Command::SpawnVehicles { num_vehicles: 3 });

        let record = h.ctx.registry.get(&h.client).await.unwrap();
        assert_eq!(record.vehicles.len(), 3);
        assert!(record
            .vehicles
            .iter()
            .all(|v| v.control_mode == shared::ControlMode::Autopilot));
    }

    #[tokio::test]
    async fn test_spawn_capped_by_capacity() {
        let mut h = Harness::start(4).await;

        h.send(&Command::RequestSpawn { num_vehicles: 3 }).await;
        assert_eq!(h.recv().await, Command::SpawnVehicles { num_vehicles: 3 });

        h.send(&Command::RequestSpawn { num_vehicles: 3 }).await;
        assert_eq!(h.recv().await, Command::SpawnVehicles { num_vehicles: 1 });

        h.send(&Command::RequestSpawn { num_vehicles: 3 }).await;
        assert_eq!(h.recv().await, Command::SpawnVehicles { num_vehicles: 0 });

        assert_eq!(h.ctx.registry.vehicle_count().await, 4);
    }

    #[tokio::test]
    async fn test_spawn_with_backend_offline_reports_zero() {
        let mut h = Harness::start(4).await;
        h.backend.set_online(false);

        h.send(&Command::RequestSpawn { num_vehicles: 2 }).await;
        assert_eq!(h.recv().await, Command::SpawnVehicles { num_vehicles: 0 });
        assert!(h.ctx.registry.get(&h.client).await.is_some());
    }

    #[tokio::test]
    async fn test_vehicle_info_empty() {
        let mut h = Harness::start(4).await;

        h.send(&Command::GetVehicleInfo).await;
        assert_eq!(h.recv().await, Command::VehicleInfo { vehicles: vec![] });
    }

    #[tokio::test]
    async fn test_vehicle_info_skips_gone_vehicles_without_removing() {
        let mut h = Harness::start(4).await;

        h.send(&Command::RequestSpawn { num_vehicles: 2 }).await;
        h.recv().await;

        let record = h.ctx.registry.get(&h.client).await.unwrap();
        let gone = record.vehicles[0].actor;
        let alive = record.vehicles[1].actor;
        h.backend.destroy(gone).unwrap();

        h.send(&Command::GetVehicleInfo).await;
        match h.recv().await {
            Command::VehicleInfo { vehicles } => {
                assert_eq!(vehicles.len(), 1);
                assert_eq!(vehicles[0].id, alive);
                assert_eq!(vehicles[0].control_mode, shared::ControlMode::Autopilot);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        let record = h.ctx.registry.get(&h.client).await.unwrap();
        assert_eq!(record.vehicles.len(), 2);
    }

    #[tokio::test]
    async fn test_device_info_stored_without_reply() {
        let mut h = Harness::start(4).await;
        let payload = json!({"OS": "Linux", "RAM Usage": "41%"});

        h.send(&Command::SendDeviceInfo {
            device_info: payload.clone(),
        })
        .await;
        h.send(&Command::SendDeviceInfo {
            device_info: json!({}),
        })
        .await;
        h.send(&Command::GetVehicleInfo).await;

        // The first frame back answers get_vehicle_info: device info is silent.
        assert_eq!(h.recv().await, Command::VehicleInfo { vehicles: vec![] });

        let record = h.ctx.registry.get(&h.client).await.unwrap();
        assert_eq!(record.device_info, Some(payload));
    }

    #[tokio::test]
    async fn test_unknown_action_keeps_session_active() {
        let mut h = Harness::start(4).await;

        h.send_raw(b"{\"action\":\"teleport\",\"to\":\"moon\"}\n").await;
        h.send(&Command::GetVehicleInfo).await;
        assert_eq!(h.recv().await, Command::VehicleInfo { vehicles: vec![] });
        assert!(!h.session.is_finished());
    }

    #[tokio::test]
    async fn test_invalid_command_keeps_session_active() {
        let mut h = Harness::start(4).await;

        h.send_raw(b"{\"num_vehicles\":3}\n").await;
        h.send_raw(b"{\"action\":\"request_spawn\",\"num_vehicles\":-1}\n").await;
        h.send_raw(b"[1,2,3]\n").await;
        h.send(&Command::GetVehicleInfo).await;

        assert_eq!(h.recv().await, Command::VehicleInfo { vehicles: vec![] });
        assert!(!h.session.is_finished());
        assert!(h.ctx.registry.get(&h.client).await.is_some());
        assert!(h.backend.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_acks_and_releases_immediately() {
        let mut h = Harness::start(4).await;

        h.send(&Command::RequestSpawn { num_vehicles: 2 }).await;
        h.recv().await;
        let owned: Vec<_> = h
            .ctx
            .registry
            .get(&h.client)
            .await
            .unwrap()
            .vehicles
            .iter()
            .map(|v| v.actor)
            .collect();

        h.send(&Command::Disconnect).await;
        assert_eq!(h.recv().await, Command::Disconnect);

        let state = h.session.await.unwrap();
        assert_eq!(state, SessionState::Closed);
        assert!(h.ctx.registry.get(&h.client).await.is_none());

        let mut destroyed = h.backend.destroyed();
        destroyed.sort_unstable();
        assert_eq!(destroyed, owned);
    }

    #[tokio::test]
    async fn test_malformed_frame_triggers_forced_cleanup() {
        let mut h = Harness::start(4).await;

        h.send(&Command::RequestSpawn { num_vehicles: 1 }).await;
        h.recv().await;

        h.send_raw(b"{not json}\n").await;
        match h.recv().await {
            Command::DisconnectWarning { message } => assert!(message.contains("seconds")),
            other => panic!("Unexpected reply: {:?}", other),
        }

        assert_eq!(h.session.await.unwrap(), SessionState::Closing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.ctx.registry.get(&h.client).await.is_none());
        assert_eq!(h.backend.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_eof_without_disconnect_is_forced() {
        let mut h = Harness::start(4).await;

        h.to_server.shutdown().await.unwrap();
        match h.recv().await {
            Command::DisconnectWarning { .. } => {}
            other => panic!("Unexpected reply: {:?}", other),
        }
        assert_eq!(h.session.await.unwrap(), SessionState::Closing);
        assert!(h.ctx.registry.get(&h.client).await.unwrap().closing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.ctx.registry.get(&h.client).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout_forces_cleanup() {
        let backend = Arc::new(SimulatedBackend::seeded(2, 3));
        let config = ServerConfig {
            grace_period: Duration::from_millis(20),
            idle_timeout: Some(Duration::from_millis(30)),
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(config, backend);
        let client = ClientId::new(SocketAddr::from(([10, 0, 0, 2], 40001)));

        let (server_side, _client_side) = duplex(1024);
        let (read, write) = tokio::io::split(server_side);
        let session = Session::accept(client, read, Box::new(write), Arc::clone(&ctx)).await;

        assert_eq!(session.run().await, SessionState::Closing);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctx.registry.get(&client).await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_after_closing_releases_vehicles() {
        let mut h = Harness::start(4).await;
        h.ctx
            .registry
            .update(&h.client, |record| record.closing = true)
            .await;

        h.send(&Command::RequestSpawn { num_vehicles: 2 }).await;
        assert_eq!(h.recv().await, Command::SpawnVehicles { num_vehicles: 0 });
        assert_eq!(h.backend.destroyed().len(), 2);
        assert_eq!(h.backend.capacity(), 4);
    }

    #[tokio::test]
    async fn test_split_reads_dispatch_in_order() {
        let backend = Arc::new(SimulatedBackend::seeded(2, 4));
        let ctx = ServerContext::new(ServerConfig::default(), backend);
        let client = ClientId::new(SocketAddr::from(([10, 0, 0, 3], 40002)));

        let reader = tokio_test::io::Builder::new()
            .read(b"{\"action\":\"g")
            .read(b"et_vehicle_info\"}\n{\"action\":\"request_")
            .read(b"spawn\"}\n{\"action\":\"disconnect\"}\n")
            .build();
        let (server_side, client_side) = duplex(4096);

        let session = Session::accept(client, reader, Box::new(server_side), Arc::clone(&ctx)).await;
        assert_eq!(session.run().await, SessionState::Closed);

        let mut replies = FrameReader::new(client_side);
        assert_eq!(
            replies.next_command().await.unwrap(),
            Some(Command::VehicleInfo { vehicles: vec![] })
        );
        // Omitted count defaults to 10, capped by the two spawn points.
        assert_eq!(
            replies.next_command().await.unwrap(),
            Some(Command::SpawnVehicles { num_vehicles: 2 })
        );
        assert_eq!(replies.next_command().await.unwrap(), Some(Command::Disconnect));
        assert_eq!(replies.next_command().await.unwrap(), None);
        assert!(ctx.registry.is_empty().await);
    }
}
