//! Line-oriented operator console over the control surface

use crate::backend::ActorId;
use crate::control::{ControlError, ControlSurface};
use crate::registry::ClientId;
use log::debug;
use std::io::{self, BufRead, Write};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;

pub const HELP: &str = "\
Commands:
  clients              list connected clients
  vehicles             list owned vehicles
  remove <id>          destroy one vehicle
  kick <ip:port>       force-disconnect a client
  monitor start|stop   toggle the resource monitor
  destroy-all          destroy every vehicle and disconnect every client
  info [ip:port]       show device info
  help                 show this list
  quit                 stop the server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Clients,
    Vehicles,
    Remove(ActorId),
    Kick(ClientId),
    MonitorStart,
    MonitorStop,
    DestroyAll,
    Info(Option<ClientId>),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a vehicle id")]
    BadVehicleId(String),
    #[error("'{0}' is not a client address (expected ip:port)")]
    BadClientId(String),
}

impl FromStr for AdminCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(ParseCommandError::Empty);
        };
        let verb = verb.to_ascii_lowercase();
        let arg = words.next();
        if words.next().is_some() {
            return Err(ParseCommandError::Usage(usage(&verb)));
        }

        let client = |text: &str| {
            text.parse::<ClientId>()
                .map_err(|_| ParseCommandError::BadClientId(text.to_string()))
        };

        match (verb.as_str(), arg) {
            ("clients", None) => Ok(Self::Clients),
            ("vehicles", None) => Ok(Self::Vehicles),
            ("remove", Some(id)) => id
                .parse()
                .map(Self::Remove)
                .map_err(|_| ParseCommandError::BadVehicleId(id.to_string())),
            ("kick", Some(text)) => client(text).map(Self::Kick),
            ("monitor", Some("start")) => Ok(Self::MonitorStart),
            ("monitor", Some("stop")) => Ok(Self::MonitorStop),
            ("destroy-all", None) => Ok(Self::DestroyAll),
            ("info", None) => Ok(Self::Info(None)),
            ("info", Some(text)) => client(text).map(|c| Self::Info(Some(c))),
            ("help", None) => Ok(Self::Help),
            ("quit" | "exit", None) => Ok(Self::Quit),
            (
                "clients" | "vehicles" | "remove" | "kick" | "monitor" | "destroy-all" | "info"
                | "help" | "quit" | "exit",
                _,
            ) => Err(ParseCommandError::Usage(usage(&verb))),
            _ => Err(ParseCommandError::Unknown(verb)),
        }
    }
}

fn usage(verb: &str) -> &'static str {
    match verb {
        "remove" => "remove <vehicle id>",
        "kick" => "kick <ip:port>",
        "monitor" => "monitor start|stop",
        "info" => "info [ip:port]",
        "clients" => "clients",
        "vehicles" => "vehicles",
        "destroy-all" => "destroy-all",
        _ => "help",
    }
}

/// Reads stdin on a plain thread so a blocked read never holds up runtime
/// shutdown. The channel closes on end of input.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("Console input closed");
    });
    rx
}

pub struct Console<'a, W> {
    control: &'a ControlSurface,
    out: W,
}

impl<'a, W: Write> Console<'a, W> {
    pub fn new(control: &'a ControlSurface, out: W) -> Self {
        Self { control, out }
    }

    /// Executes lines until `quit` or the input closes.
    pub async fn run(&mut self, mut lines: mpsc::Receiver<String>) -> io::Result<()> {
        writeln!(self.out, "{}", HELP)?;
        self.prompt()?;

        while let Some(line) = lines.recv().await {
            match line.parse::<AdminCommand>() {
                Ok(AdminCommand::Quit) => break,
                Ok(command) => self.execute(command).await?,
                Err(ParseCommandError::Empty) => {}
                Err(e) => writeln!(self.out, "{}", e)?,
            }
            self.prompt()?;
        }

        Ok(())
    }

    fn prompt(&mut self) -> io::Result<()> {
        write!(self.out, "> ")?;
        self.out.flush()
    }

    pub async fn execute(&mut self, command: AdminCommand) -> io::Result<()> {
        let control = self.control;
        match command {
            AdminCommand::Clients => {
                let clients = control.list_clients().await;
                if clients.is_empty() {
                    writeln!(self.out, "No clients connected")?;
                }
                for client in clients {
                    writeln!(self.out, "{}", client)?;
                }
            }
            AdminCommand::Vehicles => {
                let vehicles = control.list_vehicles().await;
                if vehicles.is_empty() {
                    writeln!(self.out, "No vehicles")?;
                }
                for entry in vehicles {
                    writeln!(
                        self.out,
                        "vehicle {} owner {} mode {}",
                        entry.handle.actor, entry.owner, entry.handle.control_mode
                    )?;
                }
            }
            AdminCommand::Remove(actor) => match control.remove_vehicle(actor).await {
                Ok(owner) => writeln!(self.out, "Vehicle {} of {} removed", actor, owner)?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            AdminCommand::Kick(client) => match control.force_disconnect(client).await {
                Ok(_) => writeln!(self.out, "Disconnect scheduled for {}", client)?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            AdminCommand::MonitorStart => {
                if control.start_monitor() {
                    writeln!(self.out, "Monitor started")?;
                } else {
                    writeln!(self.out, "Monitor already running")?;
                }
            }
            AdminCommand::MonitorStop => {
                if control.stop_monitor() {
                    writeln!(self.out, "Monitor stopping")?;
                } else {
                    writeln!(self.out, "Monitor not running")?;
                }
            }
            AdminCommand::DestroyAll => match control.destroy_all().await {
                Ok(report) => writeln!(
                    self.out,
                    "Destroyed {} vehicles ({} failed), disconnecting {} clients",
                    report.actors_destroyed, report.actor_failures, report.disconnects
                )?,
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            AdminCommand::Info(client) => match control.client_info(client).await {
                Ok(entries) => {
                    for (client, info) in entries {
                        let pretty = serde_json::to_string_pretty(&info)
                            .unwrap_or_else(|_| info.to_string());
                        writeln!(self.out, "{}:\n{}", client, pretty)?;
                    }
                }
                Err(ControlError::NoDeviceInfo) => {
                    writeln!(self.out, "No device info received yet")?;
                }
                Err(e) => writeln!(self.out, "{}", e)?,
            },
            AdminCommand::Help => writeln!(self.out, "{}", HELP)?,
            AdminCommand::Quit => {}
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FleetBackend, SimulatedBackend};
    use crate::config::ServerConfig;
    use crate::context::ServerContext;
    use crate::registry::{SessionRecord, VehicleHandle};
    use crate::session::Connection;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn client(port: u16) -> ClientId {
        ClientId::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("clients".parse(), Ok(AdminCommand::Clients));
        assert_eq!("  Vehicles ".parse(), Ok(AdminCommand::Vehicles));
        assert_eq!("remove 42".parse(), Ok(AdminCommand::Remove(42)));
        assert_eq!(
            "kick 127.0.0.1:6000".parse(),
            Ok(AdminCommand::Kick(client(6000)))
        );
        assert_eq!("monitor start".parse(), Ok(AdminCommand::MonitorStart));
        assert_eq!("monitor stop".parse(), Ok(AdminCommand::MonitorStop));
        assert_eq!("destroy-all".parse(), Ok(AdminCommand::DestroyAll));
        assert_eq!("info".parse(), Ok(AdminCommand::Info(None)));
        assert_eq!(
            "info 127.0.0.1:6000".parse(),
            Ok(AdminCommand::Info(Some(client(6000))))
        );
        assert_eq!("quit".parse(), Ok(AdminCommand::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<AdminCommand>(), Err(ParseCommandError::Empty));
        assert_eq!(
            "fly".parse::<AdminCommand>(),
            Err(ParseCommandError::Unknown("fly".to_string()))
        );
        assert_eq!(
            "remove".parse::<AdminCommand>(),
            Err(ParseCommandError::Usage("remove <vehicle id>"))
        );
        assert_eq!(
            "remove abc".parse::<AdminCommand>(),
            Err(ParseCommandError::BadVehicleId("abc".to_string()))
        );
        assert_eq!(
            "kick somebody".parse::<AdminCommand>(),
            Err(ParseCommandError::BadClientId("somebody".to_string()))
        );
        assert_eq!(
            "monitor sideways".parse::<AdminCommand>(),
            Err(ParseCommandError::Usage("monitor start|stop"))
        );
        assert_eq!(
            "clients now".parse::<AdminCommand>(),
            Err(ParseCommandError::Usage("clients"))
        );
    }

    #[tokio::test]
    async fn test_console_session() {
        let backend = Arc::new(SimulatedBackend::seeded(10, 3));
        let ctx = ServerContext::new(ServerConfig::default(), backend.clone());

        let (connection, _closed) = Connection::new(Box::new(tokio::io::sink()));
        let mut record = SessionRecord::new(client(6000), connection);
        record.vehicles = backend
            .spawn(2)
            .unwrap()
            .into_iter()
            .map(VehicleHandle::autopilot)
            .collect();
        record.device_info = Some(json!({"OS": "Linux"}));
        ctx.registry.put(record).await;

        let control = ControlSurface::new(ctx);
        let mut console = Console::new(&control, Vec::new());

        let (tx, rx) = mpsc::channel(16);
        for line in ["clients", "vehicles", "remove 1", "remove 1", "bogus", "", "info", "quit", "clients"] {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);

        console.run(rx).await.unwrap();
        let output = String::from_utf8(console.into_inner()).unwrap();

        assert!(output.contains("127.0.0.1:6000\n"));
        assert!(output.contains("vehicle 1 owner 127.0.0.1:6000 mode autopilot"));
        assert!(output.contains("Vehicle 1 of 127.0.0.1:6000 removed"));
        assert!(output.contains("vehicle 1 not found"));
        assert!(output.contains("unknown command 'bogus'"));
        assert!(output.contains("\"OS\": \"Linux\""));
        // Nothing after quit runs.
        assert_eq!(output.matches("127.0.0.1:6000\n").count(), 1);
    }

    #[tokio::test]
    async fn test_kick_unknown_client() {
        let backend = Arc::new(SimulatedBackend::seeded(1, 3));
        let control = ControlSurface::new(ServerContext::new(ServerConfig::default(), backend));
        let mut console = Console::new(&control, Vec::new());

        console.execute(AdminCommand::Kick(client(1))).await.unwrap();
        let output = String::from_utf8(console.into_inner()).unwrap();
        assert_eq!(output, "client 127.0.0.1:1 not found\n");
    }
}
