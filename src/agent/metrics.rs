//! Node resource collection
//!
//! Translates `sysinfo` readings into the cluster's resource units: CPU in
//! tenths of a percent of a virtual core (`(100 - usage%) * 10` available),
//! memory in megabytes. Usage percentages ride along for the control
//! plane's advisory alarms.

use std::sync::Arc;

use sysinfo::{Disks, System};

use crate::cluster::models::NodeResources;

const MIB: u64 = 1024 * 1024;

pub struct ResourceCollector {
    system: System,
    disks: Disks,
}

impl ResourceCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Refresh and report current resources. Called once per heartbeat.
    pub fn collect(&mut self) -> NodeResources {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let cpu_percent = self.system.global_cpu_usage() as f64;

        let total_memory = self.system.total_memory();
        let available_memory = self.system.available_memory();
        let used_memory = total_memory.saturating_sub(available_memory);
        let memory_percent = if total_memory > 0 {
            (used_memory as f64 / total_memory as f64) * 100.0
        } else {
            0.0
        };

        let (total_disk, used_disk) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.total_space() - d.available_space()))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));
        let disk_percent = if total_disk > 0 {
            (used_disk as f64 / total_disk as f64) * 100.0
        } else {
            0.0
        };

        NodeResources {
            cpu: ((100.0 - cpu_percent) * 10.0) as i64,
            memory: (available_memory / MIB) as i64,
            cpu_used: (cpu_percent * 10.0) as i64,
            memory_used: (used_memory / MIB) as i64,
            cpu_usage: Some(cpu_percent),
            memory_usage: Some(memory_percent),
            disk_usage: Some(disk_percent),
        }
    }
}

impl Default for ResourceCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared collector for use across async tasks.
pub type SharedResourceCollector = Arc<tokio::sync::RwLock<ResourceCollector>>;

pub fn new_shared_collector() -> SharedResourceCollector {
    Arc::new(tokio::sync::RwLock::new(ResourceCollector::new()))
}
