//! HTTP readiness probing for serve instances

use crate::config::ServeConfig;
use crate::error::ServeError;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Probes `GET http://127.0.0.1:<port><path>` and treats any 2xx as ready
#[derive(Clone)]
pub struct HealthProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    path: String,
    probe_timeout: Duration,
    poll_interval: Duration,
}

impl HealthProbe {
    pub fn new(path: &str, probe_timeout: Duration, poll_interval: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        // Each probe opens its own connection
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            path: path.to_string(),
            probe_timeout,
            poll_interval,
        }
    }

    pub fn from_config(config: &ServeConfig) -> Self {
        Self::new(
            &config.health_path,
            config.probe_timeout(),
            config.ready_poll_interval(),
        )
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://127.0.0.1:{}{}", port, self.path)
    }

    /// Single probe. Connection errors, timeouts and non-2xx statuses all count as not responding.
    pub async fn is_responding(&self, port: u16) -> bool {
        match self.check(port).await {
            Ok(ready) => ready,
            Err(e) => {
                debug!(port, error = %e, "Readiness probe failed");
                false
            }
        }
    }

    async fn check(&self, port: u16) -> anyhow::Result<bool> {
        let request = Request::get(self.url(port)).body(Empty::<Bytes>::new())?;

        let response = tokio::time::timeout(self.probe_timeout, self.client.request(request))
            .await
            .map_err(|_| anyhow::anyhow!("probe timed out after {:?}", self.probe_timeout))??;

        let status = response.status();
        if !status.is_success() {
            debug!(port, %status, "Readiness probe returned non-success status");
        }
        Ok(status.is_success())
    }

    /// Poll until the endpoint answers with a success status or `timeout` elapses
    pub async fn wait_for_ready(&self, port: u16, timeout: Duration) -> Result<(), ServeError> {
        let start = Instant::now();

        debug!(port, url = %self.url(port), timeout_ms = timeout.as_millis() as u64, "Waiting for readiness");

        while start.elapsed() < timeout {
            if self.is_responding(port).await {
                info!(port, elapsed_ms = start.elapsed().as_millis() as u64, "Service is ready");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(ServeError::ReadinessTimeout {
            port,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}
