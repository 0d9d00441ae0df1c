//! Advisory resource-usage alarms
//!
//! Heartbeat resource percentages are checked against configurable
//! thresholds; breaches are logged and nothing else. No state transition
//! ever follows from an alarm.

use tracing::warn;

use super::models::NodeResources;

/// Usage percentages above which an alarm fires.
#[derive(Debug, Clone, Copy)]
pub struct AlarmThresholds {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 90.0,
            memory_usage: 85.0,
            disk_usage: 80.0,
        }
    }
}

/// A threshold breach, with the observed percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceAlarm {
    Cpu(f64),
    Memory(f64),
    Disk(f64),
}

#[derive(Debug, Default)]
pub struct AlarmManager {
    thresholds: AlarmThresholds,
}

impl AlarmManager {
    pub fn new(thresholds: AlarmThresholds) -> Self {
        Self { thresholds }
    }

    /// Which thresholds the reported usage exceeds.
    pub fn check(&self, resources: &NodeResources) -> Vec<ResourceAlarm> {
        let mut alarms = Vec::new();
        if let Some(cpu) = resources.cpu_usage {
            if cpu > self.thresholds.cpu_usage {
                alarms.push(ResourceAlarm::Cpu(cpu));
            }
        }
        if let Some(memory) = resources.memory_usage {
            if memory > self.thresholds.memory_usage {
                alarms.push(ResourceAlarm::Memory(memory));
            }
        }
        if let Some(disk) = resources.disk_usage {
            if disk > self.thresholds.disk_usage {
                alarms.push(ResourceAlarm::Disk(disk));
            }
        }
        alarms
    }

    /// Log an alarm for every breached threshold in a heartbeat.
    pub fn handle_heartbeat(&self, node_id: &str, resources: &NodeResources) {
        for alarm in self.check(resources) {
            match alarm {
                ResourceAlarm::Cpu(pct) => {
                    warn!(%node_id, usage = pct, "cpu usage above threshold")
                }
                ResourceAlarm::Memory(pct) => {
                    warn!(%node_id, usage = pct, "memory usage above threshold")
                }
                ResourceAlarm::Disk(pct) => {
                    warn!(%node_id, usage = pct, "disk usage above threshold")
                }
            }
        }
    }
}
