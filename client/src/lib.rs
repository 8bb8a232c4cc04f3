//! # Fleet Client Library
//!
//! Headless reference client for the fleet session server. It keeps one TCP
//! connection open, sends operator requests and logs what the server answers.
//!
//! ## Module Organization
//!
//! ### Device Module (`device`)
//! Samples the host with `sysinfo` and shapes the result into the
//! `send_device_info` payload:
//! - OS name and version
//! - CPU brand and current usage
//! - RAM total, used and percentage
//!
//! ### Network Module (`network`)
//! Manages the connection to the server:
//! - Newline-delimited JSON framing on a TCP stream
//! - A listener task that logs and forwards every response
//! - A periodic device telemetry push
//! - Orderly disconnect with acknowledgement
//!
//! The client stops on its own once the server acknowledges a disconnect or
//! announces a forced one with `disconnect_warning`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::FleetClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = FleetClient::connect("127.0.0.1:52399", Duration::from_secs(5)).await?;
//!
//!     client.request_spawn(3).await?;
//!     if let Some(reply) = client.next_response().await {
//!         println!("{:?}", reply);
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod network;
