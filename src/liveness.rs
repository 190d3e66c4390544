//! Master liveness monitor.
//!
//! Non-master nodes have no control channel to the master; the only way to
//! learn that the job is over is to watch the master's port stop answering.
//! A single failed probe is decisive: once the master process is down it
//! stays down, so there is no flapping tolerance and no backoff.

use std::time::Duration;

use tokio::net::TcpStream;

/// Default pause between successful probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Block until `master_addr` stops accepting TCP connections.
///
/// There is no upper bound on the wait: a parameter server must outlive a
/// master computation of unknown duration. Returns after the first probe
/// that fails to connect.
pub async fn wait_until_unreachable(master_addr: &str, probe_interval: Duration) {
    loop {
        match TcpStream::connect(master_addr).await {
            Ok(_) => {
                tracing::trace!(master = %master_addr, "master is reachable");
                tokio::time::sleep(probe_interval).await;
            }
            Err(e) => {
                tracing::info!(master = %master_addr, error = %e, "master is down, stopping parameter server");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn returns_immediately_when_master_never_came_up() {
        // Bind-then-drop guarantees an unused port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let started = std::time::Instant::now();
        wait_until_unreachable(&addr.to_string(), Duration::from_secs(5)).await;
        // The first probe fails, so no sleep should have happened.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn waits_while_master_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = tokio::spawn(async move {
            wait_until_unreachable(&addr.to_string(), Duration::from_millis(20)).await;
        });

        // Master stays up for a few probe rounds, then goes away.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!monitor.is_finished(), "monitor must wait while master answers");
        drop(listener);

        tokio::time::timeout(Duration::from_secs(2), monitor)
            .await
            .expect("monitor should detect the master going down")
            .unwrap();
    }
}
