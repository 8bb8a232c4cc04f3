use clap::Parser;
use log::{error, info};
use server::backend::SimulatedBackend;
use server::config::ServerConfig;
use server::console::{spawn_stdin_reader, Console};
use server::control::ControlSurface;
use server::network::Server;
use std::sync::Arc;
use std::time::Duration;

/// Parses command-line arguments, then runs the accept loop next to the
/// operator console until either ends or Ctrl+C arrives.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
        port: u16,
        /// Seconds between a disconnect warning and the forced teardown
        #[clap(long, default_value = "5")]
        grace_secs: f64,
        /// Seconds between resource monitor samples
        #[clap(long, default_value = "5")]
        monitor_interval_secs: f64,
        /// Disconnect clients silent for this many seconds (0 disables)
        #[clap(long, default_value = "0")]
        idle_timeout_secs: u64,
        /// Spawn points in the simulated backend
        #[clap(long, default_value = "100")]
        spawn_points: usize,
        /// Run without the interactive operator console
        #[clap(long)]
        no_console: bool,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        grace_period: Duration::try_from_secs_f64(args.grace_secs)?,
        monitor_interval: Duration::try_from_secs_f64(args.monitor_interval_secs)?,
        idle_timeout: (args.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(args.idle_timeout_secs)),
        ..ServerConfig::default()
    };

    info!("Starting server...");
    info!(
        "Simulated backend with {} spawn points, grace period {:?}",
        args.spawn_points, config.grace_period
    );

    let backend = Arc::new(SimulatedBackend::new(args.spawn_points));
    let server = Server::bind(config, backend).await?;
    let control = ControlSurface::new(server.context());

    let console = async {
        if args.no_console {
            std::future::pending::<()>().await;
        }
        let mut console = Console::new(&control, std::io::stdout());
        if let Err(e) = console.run(spawn_stdin_reader()).await {
            error!("Console failed: {}", e);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = console => {
            info!("Console closed, shutting down...");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
