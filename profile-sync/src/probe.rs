//! Relay liveness probe.
//!
//! A single bounded request to the relay's `/health` path. The relay answers
//! it with a plain `426` HTTP response rather than an upgrade; any HTTP answer
//! counts as reachable, connection errors and the time bound do not.

use std::time::Duration;
use futures_util::future::join_all;
use tokio_tungstenite::tungstenite;

use crate::protocol::health_url;

/// Default bound for one probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct HealthProber {
    timeout: Duration,
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HealthProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `relay` answers within the bound.
    pub async fn probe(&self, relay: &str) -> bool {
        let url = health_url(relay);
        match tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((mut ws, _))) => {
                // Something upgraded instead of answering; still alive
                let _ = ws.close(None).await;
                true
            }
            Ok(Err(tungstenite::Error::Http(_))) => true,
            Ok(Err(e)) => {
                log::debug!("Probe of {relay} failed: {e}");
                false
            }
            Err(_) => {
                log::debug!("Probe of {relay} timed out after {:?}", self.timeout);
                false
            }
        }
    }

    /// Probe every relay in parallel, keeping input order.
    pub async fn probe_all(&self, relays: &[String]) -> Vec<(String, bool)> {
        let results = join_all(relays.iter().map(|relay| self.probe(relay))).await;
        relays.iter().cloned().zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_refused_is_unreachable() {
        let port = closed_port().await;
        let prober = HealthProber::new(Duration::from_secs(1));
        assert!(!prober.probe(&format!("ws://127.0.0.1:{port}")).await);
    }

    #[tokio::test]
    async fn test_silent_listener_times_out() {
        // Accepts TCP but never answers the HTTP request
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let prober = HealthProber::new(Duration::from_millis(200));
        let start = std::time::Instant::now();
        assert!(!prober.probe(&format!("ws://127.0.0.1:{port}")).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_probe_all_keeps_order() {
        let a = closed_port().await;
        let b = closed_port().await;
        let relays = vec![format!("ws://127.0.0.1:{a}"), format!("ws://127.0.0.1:{b}")];
        let prober = HealthProber::new(Duration::from_secs(1));

        let results = prober.probe_all(&relays).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, relays[0]);
        assert!(results.iter().all(|(_, up)| !up));
    }

    #[tokio::test]
    async fn test_live_relay_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = crate::server::RelayServer::with_defaults();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let relay = format!("ws://{addr}");
        let prober = HealthProber::new(Duration::from_secs(1));
        assert!(prober.probe(&relay).await);
        assert_eq!(prober.probe_all(&[relay.clone()]).await, vec![(relay, true)]);
    }

    #[test]
    fn test_default_timeout() {
        assert_eq!(HealthProber::default().timeout(), Duration::from_secs(4));
    }
}
