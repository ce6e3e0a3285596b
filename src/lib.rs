//! Serveherd - launches and supervises local serve processes
//!
//! This library manages the lifecycle of locally spawned backend servers:
//! - Allocates a free TCP port from a configured range for each launch
//! - Spawns the serve executable bound to that port and supervises it
//! - Tracks at most one instance per project key (optionally per model)
//! - Polls an HTTP readiness endpoint until a freshly spawned server answers
//! - Stops instances individually or all at once on shutdown
//! - Exposes the registry over a small authenticated HTTP control API

pub mod admin;
pub mod config;
pub mod error;
pub mod instance;
pub mod port;
pub mod probe;
pub mod registry;

pub use config::{Config, ExitPolicy, PortRange, ServeConfig};
pub use error::ServeError;
pub use instance::{instance_key, InstanceEvent, InstanceInfo, InstanceState, LaunchOptions};
pub use registry::InstanceRegistry;
