//! Client network layer: command sending, response listener and telemetry push

use crate::device::DeviceProbe;
use log::{debug, info, warn};
use shared::{Command, FrameError, FrameReader, FrameWriter, PeriodicTask};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `disconnect` waits for the server's acknowledgement.
const DISCONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FleetClient<W> {
    writer: Arc<FrameWriter<W>>,
    running: Arc<AtomicBool>,
    responses: mpsc::UnboundedReceiver<Command>,
    listener: JoinHandle<()>,
    telemetry: Option<PeriodicTask>,
}

impl FleetClient<OwnedWriteHalf> {
    pub async fn connect(
        server_addr: &str,
        telemetry_interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to server {}", server_addr);

        let (reader, writer) = stream.into_split();
        Ok(Self::start(reader, writer, Some(telemetry_interval)))
    }
}

impl<W> FleetClient<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Starts the response listener and, if an interval is given, the device
    /// telemetry push (first report sent at once).
    pub fn start<R>(reader: R, writer: W, telemetry_interval: Option<Duration>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let writer = Arc::new(FrameWriter::new(writer));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, responses) = mpsc::unbounded_channel();

        let listener = tokio::spawn(listen(FrameReader::new(reader), tx, Arc::clone(&running)));
        let telemetry = telemetry_interval
            .map(|interval| spawn_telemetry(interval, Arc::clone(&writer), Arc::clone(&running)));

        Self {
            writer,
            running,
            responses,
            listener,
            telemetry,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn request_spawn(&self, num_vehicles: u32) -> Result<(), FrameError> {
        self.writer
            .send(&Command::RequestSpawn { num_vehicles })
            .await
    }

    pub async fn get_vehicle_info(&self) -> Result<(), FrameError> {
        self.writer.send(&Command::GetVehicleInfo).await
    }

    /// Next server response, or `None` once the listener has stopped.
    pub async fn next_response(&mut self) -> Option<Command> {
        self.responses.recv().await
    }

    /// Sends `disconnect`, waits briefly for the acknowledgement and closes
    /// the connection.
    pub async fn disconnect(mut self) -> Result<(), FrameError> {
        info!("Disconnecting from server...");
        if let Some(telemetry) = self.telemetry.take() {
            telemetry.stop();
        }

        let sent = self.writer.send(&Command::Disconnect).await;
        if sent.is_ok()
            && tokio::time::timeout(DISCONNECT_ACK_TIMEOUT, &mut self.listener)
                .await
                .is_err()
        {
            warn!("No disconnect acknowledgement from server");
        }

        self.running.store(false, Ordering::Release);
        self.listener.abort();
        if let Err(e) = self.writer.shutdown().await {
            debug!("Ignoring shutdown error: {}", e);
        }
        sent
    }
}

impl<W> Drop for FleetClient<W> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(telemetry) = &self.telemetry {
            telemetry.stop();
        }
        self.listener.abort();
    }
}

/// Logs and forwards every server command until the server says goodbye or the
/// connection ends.
async fn listen<R>(
    mut reader: FrameReader<R>,
    responses: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let command = match reader.next_command().await {
            Ok(Some(command)) => command,
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(FrameError::InvalidCommand(e)) => {
                warn!("Ignoring invalid command from server: {}", e);
                continue;
            }
            Err(e) => {
                warn!("Error receiving from server: {}", e);
                break;
            }
        };

        let last = match &command {
            Command::SpawnVehicles { num_vehicles } => {
                info!("Server spawned {} vehicles", num_vehicles);
                false
            }
            Command::VehicleInfo { vehicles } => {
                info!("Your vehicles ({}):", vehicles.len());
                for v in vehicles {
                    info!(
                        " - ID: {}, speed: {} m/s, location: ({}, {}), mode: {}",
                        v.id, v.speed, v.location.x, v.location.y, v.control_mode
                    );
                }
                false
            }
            Command::Disconnect => {
                info!("Server acknowledged disconnect");
                true
            }
            Command::DisconnectWarning { message } => {
                warn!("Server is disconnecting us: {}", message);
                true
            }
            other => {
                warn!("Unexpected command from server: {}", other.action());
                false
            }
        };

        let _ = responses.send(command);
        if last {
            break;
        }
    }

    running.store(false, Ordering::Release);
}

fn spawn_telemetry<W>(
    interval: Duration,
    writer: Arc<FrameWriter<W>>,
    running: Arc<AtomicBool>,
) -> PeriodicTask
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let probe = Arc::new(Mutex::new(DeviceProbe::new()));

    PeriodicTask::spawn(interval, move || {
        let probe = Arc::clone(&probe);
        let writer = Arc::clone(&writer);
        let running = Arc::clone(&running);
        async move {
            if !running.load(Ordering::Acquire) {
                return ControlFlow::Break(());
            }
            let Some(device_info) = sample(&probe) else {
                return ControlFlow::Break(());
            };

            match writer.send(&Command::SendDeviceInfo { device_info }).await {
                Ok(()) => {
                    debug!("Device info sent");
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    warn!("Failed to send device info: {}", e);
                    ControlFlow::Break(())
                }
            }
        }
    })
}

fn sample(probe: &Mutex<DeviceProbe>) -> Option<serde_json::Value> {
    probe.lock().ok().map(|mut probe| probe.sample().to_value())
}
