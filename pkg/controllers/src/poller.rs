use std::time::Duration;

use async_trait::async_trait;
use pkg_types::session::Session;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Polls one session's remote API until told to stop.
///
/// Implementations must return promptly once `shutdown` turns `true` (or its
/// sender is dropped). Remote failures are the poller's own business: they
/// are never reported as loss of ownership.
#[async_trait]
pub trait Poller: Send + Sync {
    async fn poll(&self, session: Session, shutdown: watch::Receiver<bool>);
}

/// Session addresses are usually bare `host:port`.
fn endpoint(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Fetches the session address over HTTP on a fixed interval.
pub struct HttpPoller {
    client: reqwest::Client,
    interval: Duration,
}

impl HttpPoller {
    pub fn new(interval: Duration, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client, interval })
    }

    async fn fetch(&self, session: &Session) -> anyhow::Result<usize> {
        let resp = self.client.get(endpoint(&session.address)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {}", status);
        }
        let body = resp.bytes().await?;
        Ok(body.len())
    }
}

#[async_trait]
impl Poller for HttpPoller {
    async fn poll(&self, session: Session, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Poller started for session {} ({}, every {}ms)",
            session.id,
            session.address,
            self.interval.as_millis()
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    tokio::select! {
                        result = self.fetch(&session) => match result {
                            Ok(bytes) => {
                                if failures > 0 {
                                    info!("Session {} reachable again after {} failures", session.id, failures);
                                }
                                failures = 0;
                                debug!("Polled session {} ({} bytes)", session.id, bytes);
                            }
                            Err(e) => {
                                failures += 1;
                                warn!("Poll of session {} failed ({} in a row): {}", session.id, failures, e);
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("Poller stopped for session {}", session.id);
    }
}
