use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::protocol::{CloseReason, Notification};
use crate::transport::live::{LiveCredentials, Session, SessionConfig};

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Keeps a room connected by building a fresh [`Session`] after every drop.
///
/// All notifications of every session are forwarded to `tx` in order.
/// Returns `Ok` when `shutdown` fires or the receiver goes away, and an
/// error once `max_attempts` consecutive attempts have failed.
pub async fn run(
    config: SessionConfig,
    credentials: LiveCredentials,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<Notification>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut failures = 0u32;

    loop {
        let session = Session::new(config.clone());
        let mut rx = session.subscribe();

        let connected = tokio::select! {
            result = session.connect(&credentials) => result.is_ok(),
            _ = shutdown.cancelled() => {
                session.disconnect().await?;
                forward_pending(&mut rx, &tx).await;
                return Ok(());
            }
        };

        let reason = if connected {
            match pump(&session, &mut rx, &tx, &shutdown).await? {
                Some(reason) => reason,
                None => return Ok(()),
            }
        } else {
            if !forward_pending(&mut rx, &tx).await {
                return Ok(());
            }
            CloseReason::ServerClosed
        };

        if reason == CloseReason::Requested {
            return Ok(());
        }

        if connected {
            // A session that made it to Connected starts a fresh backoff run.
            failures = 1;
        } else {
            failures += 1;
        }
        if let Some(max) = policy.max_attempts {
            if failures > max {
                bail!("giving up after {max} failed reconnect attempts");
            }
        }

        let delay = policy.delay(failures);
        info!("[{}] Reconnecting in {delay:?} (attempt {failures})", session.id());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Forwards one session's notifications until it disconnects. Returns the
/// close reason, or `None` when supervision should stop.
async fn pump(
    session: &Session,
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    tx: &mpsc::Sender<Notification>,
    shutdown: &CancellationToken,
) -> Result<Option<CloseReason>> {
    loop {
        let notification = tokio::select! {
            n = rx.recv() => n,
            _ = shutdown.cancelled() => {
                session.disconnect().await?;
                forward_pending(rx, tx).await;
                return Ok(None);
            }
        };
        let Some(notification) = notification else {
            return Ok(Some(CloseReason::ServerClosed));
        };

        let reason = match &notification {
            Notification::Disconnected(reason) => Some(reason.clone()),
            _ => None,
        };
        if tx.send(notification).await.is_err() {
            warn!("[{}] Notification receiver dropped, stopping", session.id());
            session.disconnect().await?;
            return Ok(None);
        }
        if let Some(reason) = reason {
            return Ok(Some(reason));
        }
    }
}

/// Forwards whatever is already queued. Returns false if `tx` is closed.
async fn forward_pending(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    tx: &mpsc::Sender<Notification>,
) -> bool {
    while let Ok(notification) = rx.try_recv() {
        if tx.send(notification).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    use super::*;

    fn credentials() -> LiveCredentials {
        LiveCredentials {
            uid: 0,
            room_id: 1,
            token: String::new(),
        }
    }

    fn fast_policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(20),
            max_attempts: None,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(2), Duration::from_secs(6));
        assert_eq!(policy.delay(3), Duration::from_secs(12));
        assert_eq!(policy.delay(4), Duration::from_secs(20));
        assert_eq!(policy.delay(200), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SessionConfig {
            endpoint: format!("ws://{addr}/sub"),
            connect_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let result = run(
            config,
            credentials(),
            fast_policy(Some(2)),
            tx,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());

        let mut errors = 0;
        while let Ok(n) = rx.try_recv() {
            assert!(matches!(n, Notification::Error(_)));
            errors += 1;
        }
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    if n == 0 {
                        // Read the auth frame, then close the first connection.
                        let _ = ws.next().await;
                        let _ = ws.close(None).await;
                    }
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let config = SessionConfig {
            endpoint: format!("ws://{addr}/sub"),
            connect_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            config,
            credentials(),
            fast_policy(None),
            tx,
            shutdown.clone(),
        ));

        let mut seen = Vec::new();
        while seen
            .iter()
            .filter(|n| **n == Notification::Connected)
            .count()
            < 2
        {
            let n = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(n);
        }
        assert_eq!(seen[0], Notification::Connected);
        assert_eq!(seen[1], Notification::Disconnected(CloseReason::ServerClosed));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let mut tail = Vec::new();
        while let Some(n) = rx.recv().await {
            tail.push(n);
        }
        assert_eq!(tail, vec![Notification::Disconnected(CloseReason::Requested)]);
    }
}
