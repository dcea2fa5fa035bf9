// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Poll a TCP endpoint until it accepts a connection.
///
/// Makes at most `retry` attempts. Each attempt is bounded by `attempt_timeout`
/// and a failed attempt sleeps out the rest of its window before the next
/// one. `retry_if` is consulted before every attempt; once it returns false
/// polling stops and the service is reported unavailable.
pub async fn wait_service<F, Fut>(
    host: &str,
    port: u16,
    retry: u32,
    attempt_timeout: Duration,
    mut retry_if: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=retry {
        if !retry_if().await {
            debug!("Stopped waiting for {}:{} after {} attempts", host, port, attempt - 1);
            return false;
        }

        let started = Instant::now();
        match timeout(attempt_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => debug!("Attempt {} to reach {}:{} failed: {}", attempt, host, port, e),
            Err(_) => debug!("Attempt {} to reach {}:{} timed out", attempt, host, port),
        }

        if attempt < retry {
            let remaining = attempt_timeout.saturating_sub(started.elapsed());
            sleep(remaining).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let reachable =
            wait_service("127.0.0.1", port, 3, Duration::from_millis(200), || async { true }).await;
        assert!(reachable);
    }

    #[tokio::test]
    async fn test_predicate_stops_polling_early() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let checks = Arc::new(AtomicU32::new(0));
        let counter = checks.clone();
        let reachable = wait_service("127.0.0.1", port, 10, Duration::from_millis(20), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) < 2 }
        })
        .await;

        assert!(!reachable);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }
}
