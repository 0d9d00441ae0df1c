//! Task runtimes behind a common capability set
//!
//! A [`TaskDriver`] can start a task, observe what the underlying runtime
//! says about it, and stop it. Two drivers exist: plain OS processes
//! (shell-interpreted command, captured output) and docker containers
//! (driven through the docker CLI). New runtimes plug in without touching
//! the supervisor.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cluster::models::{Task, TaskState};

/// Grace period before a stopped process is force-killed.
pub const PROCESS_STOP_TIMEOUT_SECS: u64 = 5;

/// Grace period passed to `docker stop`.
pub const CONTAINER_STOP_TIMEOUT_SECS: u64 = 10;

/// CPU quota period in microseconds (100 ms).
pub const CPU_PERIOD_USEC: u64 = 100_000;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid task config: {0}")]
    InvalidConfig(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("docker error: {0}")]
    Docker(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime handle for a started task. At most one handle exists per
/// (allocation, task); the supervisor owns it.
#[derive(Debug, Clone)]
pub enum TaskHandle {
    Process {
        pid: u32,
        child: Arc<Mutex<Child>>,
    },
    Container {
        container_id: String,
    },
}

impl TaskHandle {
    /// Short human label for status messages.
    pub fn describe(&self) -> String {
        match self {
            TaskHandle::Process { pid, .. } => format!("pid {pid}"),
            TaskHandle::Container { container_id } => format!("container {container_id}"),
        }
    }
}

/// What a poll of the runtime said about a task. `None` from
/// [`TaskDriver::observe`] means "no transition" (e.g. a handle that was
/// never seen running and is now gone).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskObservation {
    pub state: TaskState,
    pub exit_code: Option<i64>,
    pub message: Option<String>,
}

#[async_trait]
pub trait TaskDriver: Send + Sync {
    /// Start the task's runtime and return its handle.
    async fn start(&self, allocation_id: &str, task: &Task) -> Result<TaskHandle, DriverError>;

    /// Poll the runtime. `was_running` tells the driver whether the task
    /// was last seen running, which decides how a vanished runtime is
    /// classified.
    async fn observe(
        &self,
        handle: &TaskHandle,
        was_running: bool,
    ) -> Result<Option<TaskObservation>, DriverError>;

    /// Stop the runtime, gracefully first, then by force.
    async fn stop(&self, handle: &TaskHandle) -> Result<(), DriverError>;
}

// ============================================================================
// Process driver
// ============================================================================

/// Runs tasks as shell-interpreted child processes.
pub struct ProcessDriver;

#[async_trait]
impl TaskDriver for ProcessDriver {
    async fn start(&self, allocation_id: &str, task: &Task) -> Result<TaskHandle, DriverError> {
        let command = task.command().ok_or_else(|| {
            DriverError::InvalidConfig(format!("task '{}' has no command", task.name))
        })?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("failed to spawn '{command}': {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| DriverError::Spawn("process exited before a pid was assigned".into()))?;

        debug!(%allocation_id, task = %task.name, pid, "process started");
        Ok(TaskHandle::Process {
            pid,
            child: Arc::new(Mutex::new(child)),
        })
    }

    async fn observe(
        &self,
        handle: &TaskHandle,
        was_running: bool,
    ) -> Result<Option<TaskObservation>, DriverError> {
        let TaskHandle::Process { child, .. } = handle else {
            return Err(DriverError::InvalidConfig(
                "process driver got a container handle".into(),
            ));
        };
        let mut child = child.lock().await;
        match child.try_wait() {
            Ok(None) => Ok(Some(TaskObservation {
                state: TaskState::Running,
                exit_code: None,
                message: None,
            })),
            Ok(Some(status)) => Ok(Some(TaskObservation {
                state: TaskState::Failed,
                exit_code: status.code().map(i64::from),
                message: Some(format!("process exited: {status}")),
            })),
            Err(e) => {
                if was_running {
                    Ok(Some(TaskObservation {
                        state: TaskState::Failed,
                        exit_code: None,
                        message: Some(format!("process not found: {e}")),
                    }))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<(), DriverError> {
        let TaskHandle::Process { pid, child } = handle else {
            return Err(DriverError::InvalidConfig(
                "process driver got a container handle".into(),
            ));
        };
        let mut child = child.lock().await;
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        // Polite terminate first, force-kill after the grace period.
        let _ = Command::new("kill").arg(pid.to_string()).status().await;
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(PROCESS_STOP_TIMEOUT_SECS);
        while tokio::time::Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                debug!(pid, "process stopped");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        warn!(pid, "process ignored terminate, killing");
        child.kill().await?;
        Ok(())
    }
}

// ============================================================================
// Container driver
// ============================================================================

/// Runs tasks as docker containers via the docker CLI.
pub struct ContainerDriver;

#[async_trait]
impl TaskDriver for ContainerDriver {
    async fn start(&self, allocation_id: &str, task: &Task) -> Result<TaskHandle, DriverError> {
        let container_name = generate_container_name(allocation_id, &task.name);
        let create_args = generate_create_args(&container_name, task)?;

        let output = run_docker(&create_args).await?;
        if !output.status.success() {
            return Err(DriverError::Docker(format!(
                "create failed: {}",
                stderr_of(&output)
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let output = run_docker(&generate_start_args(&container_id)).await?;
        if !output.status.success() {
            return Err(DriverError::Docker(format!(
                "start failed: {}",
                stderr_of(&output)
            )));
        }

        debug!(%allocation_id, task = %task.name, %container_id, "container started");
        Ok(TaskHandle::Container { container_id })
    }

    async fn observe(
        &self,
        handle: &TaskHandle,
        was_running: bool,
    ) -> Result<Option<TaskObservation>, DriverError> {
        let TaskHandle::Container { container_id } = handle else {
            return Err(DriverError::InvalidConfig(
                "container driver got a process handle".into(),
            ));
        };

        let output = run_docker(&generate_inspect_args(container_id)).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("No such") {
                return Ok(if was_running {
                    Some(TaskObservation {
                        state: TaskState::Failed,
                        exit_code: None,
                        message: Some("container not found".to_string()),
                    })
                } else {
                    None
                });
            }
            return Err(DriverError::Docker(format!("inspect failed: {stderr}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (status, exit_code) = parse_inspect_output(stdout.trim()).ok_or_else(|| {
            DriverError::Docker(format!("unparseable inspect output: {}", stdout.trim()))
        })?;
        Ok(Some(container_observation(&status, exit_code)))
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<(), DriverError> {
        let TaskHandle::Container { container_id } = handle else {
            return Err(DriverError::InvalidConfig(
                "container driver got a process handle".into(),
            ));
        };

        let output = run_docker(&generate_stop_args(container_id)).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if !stderr.contains("No such") {
                return Err(DriverError::Docker(format!("stop failed: {stderr}")));
            }
        }

        let output = run_docker(&generate_rm_args(container_id)).await?;
        if !output.status.success() {
            debug!(%container_id, stderr = %stderr_of(&output), "container remove failed");
        }
        Ok(())
    }
}

async fn run_docker(args: &[String]) -> Result<std::process::Output, DriverError> {
    Ok(Command::new("docker").args(args).output().await?)
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

// ============================================================================
// Pure argument builders and output mapping
// ============================================================================

/// Container name derived from the allocation and task names.
pub fn generate_container_name(allocation_id: &str, task_name: &str) -> String {
    let short = allocation_id.get(..8).unwrap_or(allocation_id);
    let sanitized = task_name.replace(['/', ':'], "-").to_lowercase();
    format!("rudder-{short}-{sanitized}")
}

/// `docker create` arguments: image, optional port mapping, memory hard
/// limit in MB, and a CPU quota against a 100 ms period.
pub fn generate_create_args(
    container_name: &str,
    task: &Task,
) -> Result<Vec<String>, DriverError> {
    let image = task.image().ok_or_else(|| {
        DriverError::InvalidConfig(format!("task '{}' has no image", task.name))
    })?;

    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];
    if let Some(port) = task.port() {
        args.push("-p".to_string());
        args.push(format!("{port}:{port}"));
    }
    if task.resources.memory > 0 {
        args.push("--memory".to_string());
        args.push(format!("{}m", task.resources.memory));
    }
    if task.resources.cpu > 0 {
        args.push("--cpu-quota".to_string());
        args.push((task.resources.cpu * 1000).to_string());
        args.push("--cpu-period".to_string());
        args.push(CPU_PERIOD_USEC.to_string());
    }
    args.push(image.to_string());
    Ok(args)
}

pub fn generate_start_args(container_id: &str) -> Vec<String> {
    vec!["start".to_string(), container_id.to_string()]
}

pub fn generate_inspect_args(container_id: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "--format".to_string(),
        "{{.State.Status}} {{.State.ExitCode}}".to_string(),
        container_id.to_string(),
    ]
}

pub fn generate_stop_args(container_id: &str) -> Vec<String> {
    vec![
        "stop".to_string(),
        "-t".to_string(),
        CONTAINER_STOP_TIMEOUT_SECS.to_string(),
        container_id.to_string(),
    ]
}

pub fn generate_rm_args(container_id: &str) -> Vec<String> {
    vec![
        "rm".to_string(),
        "-f".to_string(),
        container_id.to_string(),
    ]
}

/// Parse `docker inspect --format '{{.State.Status}} {{.State.ExitCode}}'`.
pub fn parse_inspect_output(output: &str) -> Option<(String, i64)> {
    let mut parts = output.split_whitespace();
    let status = parts.next()?.to_string();
    let exit_code = parts.next()?.parse().ok()?;
    Some((status, exit_code))
}

/// Map a container state to a task observation: running stays running,
/// exits resolve by code, transient states report as pending.
pub fn container_observation(status: &str, exit_code: i64) -> TaskObservation {
    match status {
        "running" => TaskObservation {
            state: TaskState::Running,
            exit_code: None,
            message: None,
        },
        "exited" if exit_code == 0 => TaskObservation {
            state: TaskState::Complete,
            exit_code: Some(0),
            message: Some("container exited cleanly".to_string()),
        },
        "exited" => TaskObservation {
            state: TaskState::Failed,
            exit_code: Some(exit_code),
            message: Some(format!("container exited with code {exit_code}")),
        },
        other => TaskObservation {
            state: TaskState::Pending,
            exit_code: None,
            message: Some(format!("container state: {other}")),
        },
    }
}
