//! Toggleable host and fleet resource sampling

use crate::backend::FleetBackend;
use crate::registry::FleetRegistry;
use log::{info, warn};
use shared::PeriodicTask;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Networks, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One reading of host load plus the fleet's size at that moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    /// Received since the previous sample.
    pub net_in_mb: f64,
    /// Sent since the previous sample.
    pub net_out_mb: f64,
    pub clients: usize,
    pub vehicles: usize,
    pub free_spawn_points: usize,
}

impl fmt::Display for ResourceSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPU: {:.1}%, RAM: {:.2}/{:.2}GB, Net in {:.2}MB out {:.2}MB | {} clients, {} vehicles, {} free spawn points",
            self.cpu_percent,
            self.ram_used_gb,
            self.ram_total_gb,
            self.net_in_mb,
            self.net_out_mb,
            self.clients,
            self.vehicles,
            self.free_spawn_points
        )
    }
}

/// Host counters carried between samples so network traffic can be reported
/// as a delta.
struct HostMetrics {
    system: System,
    last_received: u64,
    last_transmitted: u64,
}

struct HostReading {
    cpu_percent: f32,
    ram_used_gb: f64,
    ram_total_gb: f64,
    net_in_mb: f64,
    net_out_mb: f64,
}

impl HostMetrics {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        let (last_received, last_transmitted) = network_totals();
        Self {
            system,
            last_received,
            last_transmitted,
        }
    }

    fn read(&mut self) -> HostReading {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let (received, transmitted) = network_totals();

        let reading = HostReading {
            cpu_percent: self.system.global_cpu_usage(),
            ram_used_gb: self.system.used_memory() as f64 / BYTES_PER_GB,
            ram_total_gb: self.system.total_memory() as f64 / BYTES_PER_GB,
            net_in_mb: received.saturating_sub(self.last_received) as f64 / BYTES_PER_MB,
            net_out_mb: transmitted.saturating_sub(self.last_transmitted) as f64 / BYTES_PER_MB,
        };

        self.last_received = received;
        self.last_transmitted = transmitted;
        reading
    }
}

fn network_totals() -> (u64, u64) {
    let networks = Networks::new_with_refreshed_list();
    networks
        .list()
        .values()
        .fold((0, 0), |(rx, tx), data| {
            (rx + data.total_received(), tx + data.total_transmitted())
        })
}

fn read_host(host: &Mutex<HostMetrics>) -> Option<HostReading> {
    host.lock().ok().map(|mut host| host.read())
}

/// Background sampler that logs a [`ResourceSample`] once per interval while
/// running.
pub struct ResourceMonitor {
    interval: Duration,
    registry: Arc<FleetRegistry>,
    backend: Arc<dyn FleetBackend>,
    task: Mutex<Option<PeriodicTask>>,
    latest: Arc<Mutex<Option<ResourceSample>>>,
}

impl ResourceMonitor {
    pub fn new(
        interval: Duration,
        registry: Arc<FleetRegistry>,
        backend: Arc<dyn FleetBackend>,
    ) -> Self {
        Self {
            interval,
            registry,
            backend,
            task: Mutex::new(None),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts sampling. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let Ok(mut task) = self.task.lock() else {
            warn!("Resource monitor state poisoned");
            return false;
        };
        if task.as_ref().is_some_and(PeriodicTask::is_running) {
            return false;
        }

        let host = Arc::new(Mutex::new(HostMetrics::new()));
        let registry = Arc::clone(&self.registry);
        let backend = Arc::clone(&self.backend);
        let latest = Arc::clone(&self.latest);

        *task = Some(PeriodicTask::spawn(self.interval, move || {
            let host = Arc::clone(&host);
            let registry = Arc::clone(&registry);
            let backend = Arc::clone(&backend);
            let latest = Arc::clone(&latest);
            async move {
                let Some(reading) = read_host(&host) else {
                    return ControlFlow::Break(());
                };

                let sample = ResourceSample {
                    cpu_percent: reading.cpu_percent,
                    ram_used_gb: reading.ram_used_gb,
                    ram_total_gb: reading.ram_total_gb,
                    net_in_mb: reading.net_in_mb,
                    net_out_mb: reading.net_out_mb,
                    clients: registry.len().await,
                    vehicles: registry.vehicle_count().await,
                    free_spawn_points: backend.capacity(),
                };
                info!("{}", sample);

                if let Ok(mut latest) = latest.lock() {
                    *latest = Some(sample);
                }
                ControlFlow::Continue(())
            }
        }));

        info!("Resource monitor started ({:?} interval)", self.interval);
        true
    }

    /// Asks the sampler to exit at its next wake. Returns `false` if it was
    /// not running.
    pub fn stop(&self) -> bool {
        let Ok(mut task) = self.task.lock() else {
            return false;
        };
        match task.take() {
            Some(running) if running.is_running() => {
                running.stop();
                info!("Resource monitor stopped");
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(PeriodicTask::is_running))
            .unwrap_or(false)
    }

    /// Most recent sample, if the monitor has ever ticked.
    pub fn latest(&self) -> Option<ResourceSample> {
        self.latest.lock().ok().and_then(|latest| *latest)
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
