//! Liveness probe transport.
//!
//! The production probe is a bare TCP connect against a fixed port on
//! each node's fleet address. A refused connection still proves the
//! host is up, so it counts as reachable (only the probed service is
//! down, not the node).

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Why a probe failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe did not complete within the per-probe timeout.
    #[error("probe timed out")]
    Timeout,

    /// The host could not be reached (network error, no route, DNS).
    #[error("unreachable: {0}")]
    Unreachable(String),
}

/// Transport used to probe node liveness. Injected so tests can
/// simulate slow, dead, or flapping nodes without a network.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Probe the address, bounded by `timeout`. Returns the observed
    /// round-trip latency on success.
    async fn ping(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// TCP connect probe against a fixed port (default 22 — the fleet is
/// reachable over SSH even when no instance service is listening).
pub struct TcpPinger {
    port: u16,
}

impl TcpPinger {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for TcpPinger {
    fn default() -> Self {
        Self { port: 22 }
    }
}

#[async_trait]
impl Pinger for TcpPinger {
    async fn ping(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let target = format!("{address}:{}", self.port);
        let start = Instant::now();

        let connect = tokio::time::timeout(timeout, TcpStream::connect(&target)).await;
        match connect {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(start.elapsed())
            }
            // Refused means something answered: the host is alive.
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(%target, "connection refused, host considered reachable");
                Ok(start.elapsed())
            }
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
            Err(_) => Err(ProbeError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_listener_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let pinger = TcpPinger::new(port);
        let latency = pinger
            .ping("127.0.0.1", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(latency < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn refused_connection_counts_as_reachable() {
        // Bind then drop to get a port nothing listens on; loopback
        // refuses instead of timing out.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pinger = TcpPinger::new(port);
        let result = pinger.ping("127.0.0.1", Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unroutable_address_times_out() {
        // TEST-NET-1 is guaranteed non-routable.
        let pinger = TcpPinger::new(22);
        let result = pinger.ping("192.0.2.1", Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(ProbeError::Timeout) | Err(ProbeError::Unreachable(_))
        ));
    }
}
