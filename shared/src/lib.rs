//! Wire protocol shared by the fleet server and its clients.
//!
//! Every message is a single JSON object carrying an `action` discriminator,
//! terminated by one `\n` byte. [`Command`] is the closed set of actions, decoded
//! once at the transport boundary by [`framing::FrameReader`].

use serde::{Deserialize, Serialize};

pub mod framing;
pub mod schedule;

pub use framing::{FrameError, FrameReader, FrameWriter};
pub use schedule::PeriodicTask;

pub const DEFAULT_PORT: u16 = 52399;
pub const DEFAULT_SPAWN_REQUEST: u32 = 10;
pub const READ_CHUNK_SIZE: usize = 1024;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    // Client -> server
    RequestSpawn {
        #[serde(default = "default_spawn_request")]
        num_vehicles: u32,
    },
    GetVehicleInfo,
    /// Sent by the client to leave, echoed back by the server as the ack.
    Disconnect,
    SendDeviceInfo {
        #[serde(default)]
        device_info: serde_json::Value,
    },

    // Server -> client
    SpawnVehicles {
        num_vehicles: u32,
    },
    VehicleInfo {
        vehicles: Vec<VehicleInfo>,
    },
    DisconnectWarning {
        message: String,
    },

    /// Any action this build does not know about.
    #[serde(other)]
    Unknown,
}

fn default_spawn_request() -> u32 {
    DEFAULT_SPAWN_REQUEST
}

impl Command {
    /// Wire name of the action, as it appears in the `action` field.
    pub fn action(&self) -> &'static str {
        match self {
            Command::RequestSpawn { .. } => "request_spawn",
            Command::GetVehicleInfo => "get_vehicle_info",
            Command::Disconnect => "disconnect",
            Command::SendDeviceInfo { .. } => "send_device_info",
            Command::SpawnVehicles { .. } => "spawn_vehicles",
            Command::VehicleInfo { .. } => "vehicle_info",
            Command::DisconnectWarning { .. } => "disconnect_warning",
            Command::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Autopilot,
    Manual,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Autopilot => write!(f, "autopilot"),
            ControlMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

/// Telemetry for one owned vehicle, as reported in `vehicle_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub id: u32,
    pub speed: f64,
    pub location: Location,
    pub control_mode: ControlMode,
}

/// Rounds to two decimals, the precision telemetry is reported with.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
