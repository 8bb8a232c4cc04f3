//! # Fleet Session Server Library
//!
//! This library provides the server side of the fleet session protocol. Remote
//! clients connect over TCP, ask for simulated vehicles, poll their telemetry
//! and push host telemetry of their own. The server tracks which vehicles each
//! client owns and makes sure none of them outlive the client.
//!
//! ## Core Responsibilities
//!
//! ### Session Handling
//! Every accepted connection gets its own receive loop that decodes
//! newline-delimited JSON commands and answers them in arrival order:
//! - `request_spawn` is capped by the backend's free capacity
//! - `get_vehicle_info` snapshots every owned vehicle
//! - `send_device_info` is stored verbatim
//! - `disconnect` is acknowledged and followed by an immediate teardown
//!
//! ### Ownership Tracking
//! The fleet registry maps each client to the vehicles it owns. A vehicle is
//! owned by exactly one client for as long as it exists.
//!
//! ### Cleanup
//! Clients that leave gracefully are torn down at once. Clients that break
//! the protocol, drop the connection, go idle or are kicked by the operator
//! get a `disconnect_warning` and are torn down after a grace period from a
//! separately spawned task. Teardown always removes the registry entry, even
//! when individual vehicles fail to be destroyed.
//!
//! ## Module Organization
//!
//! ### Backend Module (`backend`)
//! The [`backend::FleetBackend`] trait the server drives, and the in-process
//! [`backend::SimulatedBackend`] used by the binary and the tests.
//!
//! ### Registry Module (`registry`)
//! Client identities, vehicle handles and the shared [`registry::FleetRegistry`].
//!
//! ### Session Module (`session`)
//! Per-connection receive loop, dispatch and the locked send path.
//!
//! ### Cleanup Module (`cleanup`)
//! Graceful and forced teardown.
//!
//! ### Monitor Module (`monitor`)
//! Toggleable host CPU, memory and network sampling.
//!
//! ### Control and Console Modules (`control`, `console`)
//! Operator actions over the registry and the stdin menu that drives them.
//!
//! ### Network Module (`network`)
//! TCP listener and accept loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::backend::SimulatedBackend;
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:52399".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config, Arc::new(SimulatedBackend::new(100))).await?;
//!
//!     // Accepts clients until the process exits
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod console;
pub mod context;
pub mod control;
pub mod monitor;
pub mod network;
pub mod registry;
pub mod session;
