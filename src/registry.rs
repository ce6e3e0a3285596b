use crate::config::{Config, ExitPolicy, ServeConfig};
use crate::error::ServeError;
use crate::instance::{build_args, Instance, InstanceEvent, InstanceInfo, InstanceState, LaunchOptions};
use crate::port::PortAllocator;
use crate::probe::HealthProbe;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval for polling supervisor shutdown (in milliseconds)
const SHUTDOWN_POLL_INTERVAL_MS: u64 = 50;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shared reference to launch settings (for hot reload support)
pub type SharedServeConfig = Arc<RwLock<ServeConfig>>;

/// Registry of serve processes, at most one per key.
///
/// # Usage
///
/// `InstanceRegistry` is designed to be used behind an `Arc`. The
/// [`new`](InstanceRegistry::new) constructor returns `Arc<Self>` directly
/// because every launched instance gets a supervisor task holding a clone.
///
/// ```ignore
/// let registry = InstanceRegistry::new(ServeConfig::default())?;
/// let port = registry.launch("/proj/a", "/proj/a", LaunchOptions::default()).await?;
/// registry.wait_for_ready(port, Duration::from_secs(10)).await?;
/// ```
///
/// # Concurrency
///
/// Launches are serialized by `launch_lock`, held from the existence check
/// through port allocation, spawn and registration. Two launches for one key
/// therefore observe each other, and launches for different keys never see
/// the same port as free. Lookups and stops never take the lock.
///
/// # Exit handling
///
/// Each instance has one supervisor task that owns the child. When the child
/// exits on its own the instance moves to [`InstanceState::Exited`] and is
/// deregistered according to the configured [`ExitPolicy`].
pub struct InstanceRegistry {
    /// Live instances keyed by project key
    instances: DashMap<String, Instance>,
    /// Launch settings (supports hot reload)
    config: SharedServeConfig,
    /// Readiness probe built from the current settings
    probe: RwLock<HealthProbe>,
    /// Serializes check-allocate-spawn-register
    launch_lock: Mutex<()>,
    /// Lifecycle notifications
    events: broadcast::Sender<InstanceEvent>,
    /// Supervisor tasks still running
    active_supervisors: Arc<AtomicUsize>,
}

impl InstanceRegistry {
    /// Create a new registry, rejecting invalid launch settings.
    ///
    /// Returns `Arc<Self>` because supervisor tasks share ownership.
    pub fn new(config: ServeConfig) -> anyhow::Result<Arc<Self>> {
        validate_serve_config(&config)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            instances: DashMap::new(),
            probe: RwLock::new(HealthProbe::from_config(&config)),
            config: Arc::new(RwLock::new(config)),
            launch_lock: Mutex::new(()),
            events,
            active_supervisors: Arc::new(AtomicUsize::new(0)),
        }))
    }

    /// Get the current launch settings (cloned for thread safety)
    pub fn config(&self) -> ServeConfig {
        self.config.read().clone()
    }

    fn probe(&self) -> HealthProbe {
        self.probe.read().clone()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: InstanceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Get the port of the instance registered under `key`
    pub fn get_port(&self, key: &str) -> Option<u16> {
        self.instances.get(key).map(|i| i.port)
    }

    /// Get the state of the instance registered under `key`
    pub fn get_state(&self, key: &str) -> Option<InstanceState> {
        self.instances.get(key).map(|i| i.state)
    }

    /// Get a snapshot of the instance registered under `key`
    pub fn get_instance(&self, key: &str) -> Option<InstanceInfo> {
        self.instances.get(key).map(|i| i.info())
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Snapshot of all registered instances, sorted by key
    pub fn list_instances(&self) -> Vec<InstanceInfo> {
        let mut instances: Vec<InstanceInfo> =
            self.instances.iter().map(|entry| entry.info()).collect();
        instances.sort_by(|a, b| a.key.cmp(&b.key));
        instances
    }

    /// Launch a serve process for `key`, or return the port of the one already registered.
    ///
    /// Fails only when no port is available. A process that cannot be spawned
    /// is logged, reported as [`InstanceEvent::Errored`] and left unregistered;
    /// the allocated port is still returned and callers detect the failure via
    /// [`get_port`](Self::get_port).
    pub async fn launch(
        self: &Arc<Self>,
        key: &str,
        working_dir: impl AsRef<Path>,
        options: LaunchOptions,
    ) -> Result<u16, ServeError> {
        let _guard = self.launch_lock.lock().await;

        if let Some(port) = self.get_port(key) {
            debug!(key, port, "Instance already registered");
            return Ok(port);
        }

        let config = self.config();
        let bind_host = config.hostname.parse::<IpAddr>().unwrap_or_else(|_| {
            warn!(hostname = %config.hostname, "Invalid hostname, checking ports on all interfaces");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let claimed: HashSet<u16> = self.instances.iter().map(|entry| entry.port).collect();
        let port = PortAllocator::new(config.port_range, bind_host)
            .allocate(&claimed)
            .await
            .map_err(|e| {
                error!(key, error = %e, "Port allocation failed");
                e
            })?;

        let args = build_args(&config, port, &options);
        let working_dir = working_dir.as_ref();
        info!(
            key,
            port,
            command = %config.executable,
            ?args,
            working_dir = %working_dir.display(),
            "Launching serve process"
        );

        let mut cmd = Command::new(&config.executable);
        cmd.args(&args);
        cmd.current_dir(working_dir);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let id = Uuid::new_v4();
        match cmd.spawn() {
            Ok(child) => self.register(key, id, port, child),
            Err(source) => {
                let err = ServeError::SpawnFailure {
                    key: key.to_string(),
                    source,
                };
                error!(key, port, error = %err, "Serve process failed to start, deregistering");
                self.publish(InstanceEvent::Errored {
                    key: key.to_string(),
                    id,
                    port,
                    message: err.to_string(),
                });
            }
        }

        Ok(port)
    }

    /// Launch and wait for readiness using the configured deadline
    pub async fn launch_and_wait(
        self: &Arc<Self>,
        key: &str,
        working_dir: impl AsRef<Path>,
        options: LaunchOptions,
    ) -> Result<u16, ServeError> {
        let port = self.launch(key, working_dir, options).await?;
        let timeout = self.config.read().ready_timeout();
        self.wait_for_ready(port, timeout).await?;
        Ok(port)
    }

    /// Poll the readiness endpoint on `port` until it succeeds or `timeout` elapses
    pub async fn wait_for_ready(&self, port: u16, timeout: Duration) -> Result<(), ServeError> {
        self.probe().wait_for_ready(port, timeout).await
    }

    /// Register a freshly spawned child and start its supervisor
    fn register(self: &Arc<Self>, key: &str, id: Uuid, port: u16, mut child: Child) {
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(key.to_string(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(key.to_string(), "stderr", stderr));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        self.instances
            .insert(key.to_string(), Instance::new(id, key, port, pid, stop_tx));
        info!(key, port, pid, "Serve process spawned");

        self.publish(InstanceEvent::Started {
            key: key.to_string(),
            id,
            port,
            pid,
        });

        self.active_supervisors.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            registry.supervise(&key, id, port, child, stop_rx).await;
            registry.active_supervisors.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Own the child until it exits or a stop is requested
    async fn supervise(
        &self,
        key: &str,
        id: Uuid,
        port: u16,
        mut child: Child,
        stop_rx: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            status = child.wait() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(key, error = %e, "Error waiting for serve process");
                        None
                    }
                };
                self.handle_exit(key, id, port, code).await;
            }
            // A dropped sender means the instance left the registry; treat it as a stop
            _ = stop_rx => {
                let grace_period = self.config.read().shutdown_grace_period();
                terminate_child(key, &mut child, grace_period).await;
            }
        }
    }

    /// Record an unrequested exit and apply the exit policy
    async fn handle_exit(&self, key: &str, id: Uuid, port: u16, code: Option<i32>) {
        let still_registered = match self.instances.get_mut(key) {
            Some(mut instance) if instance.id == id => {
                instance.state = InstanceState::Exited;
                true
            }
            _ => false,
        };

        if !still_registered {
            debug!(key, ?code, "Exit observed for an instance no longer registered");
            return;
        }

        let err = ServeError::ProcessExitedUnexpectedly {
            key: key.to_string(),
            code,
        };
        warn!(key, port, ?code, error = %err, "Serve process exited");

        let policy = self.config.read().exit_policy;
        let should_deregister = match policy {
            ExitPolicy::Always => true,
            ExitPolicy::Verify => {
                let responding = self.probe().is_responding(port).await;
                if responding {
                    info!(key, port, "Port still responding after exit, keeping registration");
                }
                !responding
            }
        };

        // Only remove the instance this supervisor owned
        let deregistered = should_deregister
            && self
                .instances
                .remove_if(key, |_, instance| instance.id == id)
                .is_some();

        if deregistered {
            info!(key, port, "Instance deregistered after exit");
        }

        self.publish(InstanceEvent::Exited {
            key: key.to_string(),
            id,
            port,
            code,
            deregistered,
        });
    }

    /// Deregister the instance under `key` and signal its process to terminate.
    ///
    /// Returns immediately without waiting for the process to die. Returns
    /// false if no instance was registered.
    pub fn stop(&self, key: &str) -> bool {
        let Some((_, mut instance)) = self.instances.remove(key) else {
            debug!(key, "No instance to stop");
            return false;
        };

        info!(key, port = instance.port, pid = instance.pid, "Stopping serve instance");
        if !instance.request_stop() {
            debug!(key, "Supervisor already finished, nothing to signal");
        }

        self.publish(InstanceEvent::Stopped {
            key: key.to_string(),
            id: instance.id,
            port: instance.port,
        });
        true
    }

    /// Stop every registered instance, returning how many were stopped
    pub fn stop_all(&self) -> usize {
        let keys: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for key in keys {
            if self.stop(&key) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every instance and wait for supervisors to reap their processes.
    ///
    /// Waits at most the shutdown grace period plus one second.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.stop_all();
        let deadline = self.config.read().shutdown_grace_period() + Duration::from_secs(1);
        let start = Instant::now();

        while self.active_supervisors.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > deadline {
                warn!(
                    remaining = self.active_supervisors.load(Ordering::SeqCst),
                    "Shutdown deadline exceeded with supervisors still running"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS)).await;
        }

        info!(stopped, "Registry shut down");
        stopped
    }

    /// Reload launch settings from a configuration file
    pub fn reload_config<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let new_config = Config::load(path)?;
        self.apply_config(new_config.serve)
    }

    /// Apply new launch settings.
    ///
    /// Running instances keep their ports; subsequent launches, probes and
    /// exit handling use the new settings.
    pub fn apply_config(&self, new_config: ServeConfig) -> anyhow::Result<()> {
        validate_serve_config(&new_config)?;

        let out_of_range: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| !new_config.port_range.contains(entry.port))
            .map(|entry| entry.key().clone())
            .collect();
        if !out_of_range.is_empty() {
            warn!(instances = ?out_of_range, "Running instances fall outside the new port range");
        }

        *self.probe.write() = HealthProbe::from_config(&new_config);
        info!(
            min_port = new_config.port_range.min,
            max_port = new_config.port_range.max,
            executable = %new_config.executable,
            "Serve configuration reloaded"
        );
        *self.config.write() = new_config;

        Ok(())
    }
}

fn validate_serve_config(config: &ServeConfig) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
    }
    Ok(())
}

/// Forward a child's output to the log line by line
async fn forward_output<R>(key: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(key = %key, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(key = %key, stream, error = %e, "Stopped reading serve output");
                break;
            }
        }
    }
}

/// Terminate a child: SIGTERM, then SIGKILL once the grace period passes
async fn terminate_child(key: &str, child: &mut Child, grace_period: Duration) {
    // id() is None once the child has been reaped
    if let Some(pid) = child.id() {
        info!(key, pid, "Sending SIGTERM to serve process");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(key, ?status, "Serve process exited");
        }
        Ok(Err(e)) => {
            warn!(key, error = %e, "Error waiting for serve process to exit");
        }
        Err(_) => {
            warn!(
                key,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use std::net::TcpListener as StdListener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Find `len` consecutive ports bindable on localhost, starting the search at `from`
    fn free_block(from: u16, len: u16) -> u16 {
        let mut base = from;
        while base < 60000 {
            if (base..base + len).all(|p| StdListener::bind(("127.0.0.1", p)).is_ok()) {
                return base;
            }
            base += len;
        }
        panic!("no free port block found");
    }

    /// `sh -c <script> sh serve --port ..` runs the script and ignores the serve arguments
    fn shell_config(script: &str, base: u16, len: u16) -> ServeConfig {
        let mut config = ServeConfig::with_executable("sh")
            .with_args(vec!["-c".to_string(), script.to_string(), "sh".to_string()])
            .with_port_range(base, base + len - 1);
        config.hostname = "127.0.0.1".to_string();
        config.probe_timeout_ms = 200;
        config.ready_poll_interval_ms = 50;
        config.shutdown_grace_period_secs = 1;
        config
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<InstanceEvent>,
        matches: impl Fn(&InstanceEvent) -> bool,
    ) -> InstanceEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received in time")
    }

    /// Answer every connection with `200 OK`
    async fn serve_ok(listener: TcpListener) {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            });
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = ServeConfig::default();
        config.health_path = "session".to_string();
        config.ready_poll_interval_ms = 0;

        let err = InstanceRegistry::new(config).err().expect("invalid config accepted");
        let message = err.to_string();
        assert!(message.starts_with("Configuration errors:"));
        assert!(message.contains("health_path"));
        assert!(message.contains("ready_poll_interval_ms"));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = InstanceRegistry::new(ServeConfig::default()).unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.get_port("/proj/a"), None);
        assert_eq!(registry.get_state("/proj/a"), None);
        assert!(registry.list_instances().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_key() {
        let registry = InstanceRegistry::new(ServeConfig::default()).unwrap();
        let mut events = registry.subscribe();

        assert!(!registry.stop("/proj/missing"));
        assert!(events.try_recv().is_err());
        assert_eq!(registry.stop_all(), 0);
    }

    #[tokio::test]
    async fn test_launch_and_stop() {
        let base = free_block(46000, 3);
        let registry = InstanceRegistry::new(shell_config("sleep 30", base, 3)).unwrap();
        let mut events = registry.subscribe();

        let port = registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(port, base);
        assert_eq!(registry.get_port("/proj/a"), Some(port));
        assert_eq!(registry.get_state("/proj/a"), Some(InstanceState::Running));

        let started = next_event(&mut events, |e| matches!(e, InstanceEvent::Started { .. })).await;
        assert_eq!(started.key(), "/proj/a");

        // Second launch with the same key reuses the instance
        let again = registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(again, port);
        assert_eq!(registry.len(), 1);

        assert!(registry.stop("/proj/a"));
        assert_eq!(registry.get_port("/proj/a"), None);
        assert!(registry.list_instances().is_empty());
        assert!(!registry.stop("/proj/a"));

        let stopped = next_event(&mut events, |e| matches!(e, InstanceEvent::Stopped { .. })).await;
        assert_eq!(stopped.id(), started.id());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_ports() {
        let base = free_block(46100, 3);
        let registry = InstanceRegistry::new(shell_config("sleep 30", base, 3)).unwrap();

        let a = registry.launch("/proj/a", "/", LaunchOptions::default()).await.unwrap();
        let b = registry
            .launch("/proj/a:model", "/", LaunchOptions::with_model("model"))
            .await
            .unwrap();
        let c = registry.launch("/proj/c", "/", LaunchOptions::default()).await.unwrap();

        assert_eq!((a, b, c), (base, base + 1, base + 2));
        let range = PortRange::new(base, base + 2);
        for info in registry.list_instances() {
            assert!(range.contains(info.port));
        }

        // Range full
        let err = registry
            .launch("/proj/d", "/", LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::NoPortAvailable { .. }));

        let keys: Vec<String> = registry.list_instances().into_iter().map(|i| i.key).collect();
        assert_eq!(keys, vec!["/proj/a", "/proj/a:model", "/proj/c"]);

        assert_eq!(registry.shutdown().await, 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_launches_same_key() {
        let base = free_block(46200, 3);
        let registry = InstanceRegistry::new(shell_config("sleep 30", base, 3)).unwrap();
        let mut events = registry.subscribe();

        let (first, second) = tokio::join!(
            registry.launch("/proj/a", "/", LaunchOptions::default()),
            registry.launch("/proj/a", "/", LaunchOptions::default()),
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(registry.len(), 1);

        registry.stop_all();
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, InstanceEvent::Started { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_immediate_exit_deregisters() {
        let base = free_block(46300, 2);
        let registry = InstanceRegistry::new(shell_config("exit 3", base, 2)).unwrap();
        let mut events = registry.subscribe();

        let port = registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();

        let exited = next_event(&mut events, |e| matches!(e, InstanceEvent::Exited { .. })).await;
        match exited {
            InstanceEvent::Exited {
                port: p,
                code,
                deregistered,
                ..
            } => {
                assert_eq!(p, port);
                assert_eq!(code, Some(3));
                assert!(deregistered);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(registry.get_port("/proj/a"), None);
    }

    #[tokio::test]
    async fn test_exit_policy_always() {
        let base = free_block(46400, 2);
        let mut config = shell_config("exit 0", base, 2);
        config.exit_policy = ExitPolicy::Always;
        let registry = InstanceRegistry::new(config).unwrap();
        let mut events = registry.subscribe();

        registry.launch("/proj/a", "/", LaunchOptions::default()).await.unwrap();
        next_event(&mut events, |e| matches!(e, InstanceEvent::Exited { deregistered: true, .. })).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_registered() {
        let base = free_block(46500, 2);
        let mut config = ServeConfig::with_executable("/nonexistent/serve-binary")
            .with_port_range(base, base + 1);
        config.hostname = "127.0.0.1".to_string();
        let registry = InstanceRegistry::new(config).unwrap();
        let mut events = registry.subscribe();

        let port = registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(port, base);
        assert_eq!(registry.get_port("/proj/a"), None);

        let errored = next_event(&mut events, |e| matches!(e, InstanceEvent::Errored { .. })).await;
        assert_eq!(errored.key(), "/proj/a");
        assert_eq!(registry.get_state("/proj/a"), None);
        assert!(registry.list_instances().is_empty());
    }

    #[tokio::test]
    async fn test_exit_keeps_instance_while_port_responds() {
        let base = free_block(46700, 2);
        let registry = InstanceRegistry::new(shell_config("sleep 0.5; exit 1", base, 2)).unwrap();
        let mut events = registry.subscribe();

        let port = registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();

        // Something else keeps serving on the port after the launcher exits
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let responder = tokio::spawn(serve_ok(listener));

        let exited = next_event(&mut events, |e| matches!(e, InstanceEvent::Exited { .. })).await;
        assert!(matches!(
            exited,
            InstanceEvent::Exited {
                code: Some(1),
                deregistered: false,
                ..
            }
        ));
        assert_eq!(registry.get_state("/proj/a"), Some(InstanceState::Exited));
        assert_eq!(registry.get_port("/proj/a"), Some(port));

        // Still registered, so a relaunch reuses it without spawning
        let again = registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();
        assert_eq!(again, port);
        assert!(events.try_recv().is_err());

        responder.abort();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let base = free_block(46800, 2);
        let registry = InstanceRegistry::new(shell_config(
            "trap '' TERM; while true; do sleep 0.1; done",
            base,
            2,
        ))
        .unwrap();

        registry
            .launch("/proj/a", "/", LaunchOptions::default())
            .await
            .unwrap();
        let pid = registry.get_instance("/proj/a").and_then(|i| i.pid).unwrap();

        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;

        let start = Instant::now();
        assert_eq!(registry.shutdown().await, 1);
        assert!(start.elapsed() >= Duration::from_secs(1));

        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        assert!(!alive, "process {pid} survived the grace period");
    }

    #[tokio::test]
    async fn test_stopped_port_is_reused() {
        let base = free_block(46600, 2);
        let registry = InstanceRegistry::new(shell_config("sleep 30", base, 2)).unwrap();

        let first = registry.launch("/proj/a", "/", LaunchOptions::default()).await.unwrap();
        registry.stop("/proj/a");
        let second = registry.launch("/proj/b", "/", LaunchOptions::default()).await.unwrap();
        assert_eq!(first, second);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_config() {
        let registry = InstanceRegistry::new(ServeConfig::default()).unwrap();

        registry
            .apply_config(ServeConfig::default().with_port_range(20000, 20005))
            .unwrap();
        assert_eq!(registry.config().port_range, PortRange::new(20000, 20005));

        let err = registry
            .apply_config(ServeConfig::default().with_port_range(20005, 20000))
            .unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
        assert_eq!(registry.config().port_range, PortRange::new(20000, 20005));
    }
}
