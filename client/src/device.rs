//! Host telemetry pushed to the server as `send_device_info`

use serde::Serialize;
use serde_json::Value;
use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One device report. Field names are the keys the operator sees.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceInfo {
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "OS Version")]
    pub os_version: String,
    #[serde(rename = "CPU")]
    pub cpu: String,
    #[serde(rename = "CPU Usage")]
    pub cpu_usage: String,
    #[serde(rename = "RAM Total")]
    pub ram_total: String,
    #[serde(rename = "RAM Used")]
    pub ram_used: String,
    #[serde(rename = "RAM Usage")]
    pub ram_usage: String,
}

impl DeviceInfo {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Keeps a `System` around so CPU usage is measured between reports.
pub struct DeviceProbe {
    system: System,
}

impl DeviceProbe {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    pub fn sample(&mut self) -> DeviceInfo {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };

        DeviceInfo {
            os: System::name().unwrap_or_else(|| "unknown".to_string()),
            os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
            cpu: self
                .system
                .cpus()
                .first()
                .map(|cpu| cpu.brand().trim().to_string())
                .unwrap_or_default(),
            cpu_usage: format!("{:.1}%", self.system.global_cpu_usage()),
            ram_total: format!("{:.2} GB", total as f64 / BYTES_PER_GB),
            ram_used: format!("{:.2} GB", used as f64 / BYTES_PER_GB),
            ram_usage: format!("{:.1}%", percent),
        }
    }
}

impl Default for DeviceProbe {
    fn default() -> Self {
        Self::new()
    }
}
