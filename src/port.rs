//! Port allocation for serve instances
//!
//! Ports are scanned in ascending order so assignment is reproducible for a
//! given sequence of launches. A candidate must be unclaimed by a live
//! instance and bindable on the host the child will listen on.

use crate::config::PortRange;
use crate::error::ServeError;
use std::collections::HashSet;
use std::net::IpAddr;
use tokio::net::TcpListener;
use tracing::{debug, trace};

/// Hands out ports from a fixed range
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    bind_host: IpAddr,
}

impl PortAllocator {
    pub fn new(range: PortRange, bind_host: IpAddr) -> Self {
        Self { range, bind_host }
    }

    /// Return the lowest port in range that is neither in `claimed` nor bound by another process
    pub async fn allocate(&self, claimed: &HashSet<u16>) -> Result<u16, ServeError> {
        for port in self.range.min..=self.range.max {
            if claimed.contains(&port) {
                trace!(port, "Port claimed by a live instance");
                continue;
            }
            if is_port_available(self.bind_host, port).await {
                debug!(port, "Allocated port");
                return Ok(port);
            }
            trace!(port, "Port in use by another process");
        }

        Err(ServeError::NoPortAvailable {
            min: self.range.min,
            max: self.range.max,
        })
    }
}

/// Check if a port can be bound, releasing the transient listener immediately
pub async fn is_port_available(host: IpAddr, port: u16) -> bool {
    TcpListener::bind((host, port)).await.is_ok()
}
