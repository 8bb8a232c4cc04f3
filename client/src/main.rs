use clap::Parser;
use client::network::FleetClient;
use log::{info, warn};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:52399")]
    server: String,

    /// Seconds between device info reports
    #[arg(short = 't', long, default_value = "5")]
    telemetry_interval_secs: u64,
}

const MENU: &str = "\
Choose an action:
1. Request vehicle spawn
2. Get vehicle info
3. Disconnect";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info to see server responses");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut client = FleetClient::connect(
        &args.server,
        Duration::from_secs(args.telemetry_interval_secs.max(1)),
    )
    .await?;

    let mut lines = spawn_stdin_reader();
    prompt(MENU)?;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line.trim() {
                    "1" => {
                        prompt("Number of vehicles to spawn:")?;
                        let Some(count) = lines.recv().await else {
                            break;
                        };
                        match count.trim().parse::<u32>() {
                            Ok(n) => client.request_spawn(n).await?,
                            Err(_) => println!("Not a number: {}", count.trim()),
                        }
                    }
                    "2" => client.get_vehicle_info().await?,
                    "3" => {
                        client.disconnect().await?;
                        return Ok(());
                    }
                    other => println!("Invalid choice '{}', try again.", other),
                }
                prompt(MENU)?;
            }
            response = client.next_response() => {
                if response.is_none() {
                    warn!("Connection to server ended");
                    return Ok(());
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

fn prompt(text: &str) -> io::Result<()> {
    let mut out = io::stdout();
    writeln!(out, "{}", text)?;
    write!(out, "> ")?;
    out.flush()
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}
