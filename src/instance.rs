//! Instance types: what the registry tracks for each spawned serve process

use crate::config::ServeConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Derive the registry key for a project, optionally scoped to a model
pub fn instance_key(project_path: &str, model: Option<&str>) -> String {
    match model {
        Some(model) => format!("{}:{}", project_path, model),
        None => project_path.to_string(),
    }
}

/// Per-launch options
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchOptions {
    /// Passed to the child as `--model <name>`
    pub model: Option<String>,
}

impl LaunchOptions {
    pub fn with_model(model: &str) -> Self {
        Self {
            model: Some(model.to_string()),
        }
    }
}

/// Build the child's argument list:
/// `[leading args..] <subcommand> --port <N> --hostname <addr> [--model <name>]`
pub fn build_args(config: &ServeConfig, port: u16, options: &LaunchOptions) -> Vec<String> {
    let mut args = config.args.clone();
    args.push(config.subcommand.clone());
    args.push("--port".to_string());
    args.push(port.to_string());
    args.push("--hostname".to_string());
    args.push(config.hostname.clone());
    if let Some(ref model) = options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    args
}

/// Lifecycle state of a registered instance.
///
/// A process that fails to spawn is never registered; that outcome is only
/// reported through [`InstanceEvent::Errored`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Process is running
    Running,
    /// Process exited on its own
    Exited,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Running => write!(f, "running"),
            InstanceState::Exited => write!(f, "exited"),
        }
    }
}

/// A registered serve process.
///
/// The child handle itself is owned by the instance's supervisor task; the
/// registry reaches it only through `stop_tx`.
#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) id: Uuid,
    pub(crate) key: String,
    pub(crate) port: u16,
    pub(crate) pid: Option<u32>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) state: InstanceState,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Instance {
    pub(crate) fn new(
        id: Uuid,
        key: &str,
        port: u16,
        pid: Option<u32>,
        stop_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            key: key.to_string(),
            port,
            pid,
            started_at: Utc::now(),
            state: InstanceState::Running,
            stop_tx: Some(stop_tx),
        }
    }

    /// Ask the supervisor to terminate the process. Returns false if the supervisor is gone.
    pub(crate) fn request_stop(&mut self) -> bool {
        match self.stop_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub(crate) fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id,
            key: self.key.clone(),
            port: self.port,
            pid: self.pid,
            state: self.state,
            started_at: self.started_at,
        }
    }
}

/// Snapshot of an instance for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub key: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle notifications published by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    /// Process spawned and registered
    Started {
        key: String,
        id: Uuid,
        port: u16,
        pid: Option<u32>,
    },
    /// Process exited on its own
    Exited {
        key: String,
        id: Uuid,
        port: u16,
        code: Option<i32>,
        /// Whether the exit removed the instance from the registry
        deregistered: bool,
    },
    /// Process could not be spawned; never registered past the failed launch
    Errored {
        key: String,
        id: Uuid,
        port: u16,
        message: String,
    },
    /// Instance removed by an explicit stop
    Stopped { key: String, id: Uuid, port: u16 },
}

impl InstanceEvent {
    pub fn key(&self) -> &str {
        match self {
            InstanceEvent::Started { key, .. }
            | InstanceEvent::Exited { key, .. }
            | InstanceEvent::Errored { key, .. }
            | InstanceEvent::Stopped { key, .. } => key,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            InstanceEvent::Started { id, .. }
            | InstanceEvent::Exited { id, .. }
            | InstanceEvent::Errored { id, .. }
            | InstanceEvent::Stopped { id, .. } => *id,
        }
    }
}
