// =============================================================================
// Keep-alive Pinger
// =============================================================================
//
// Some hosting platforms suspend instances that see no inbound HTTP traffic.
// This task periodically requests the service's own health endpoint so the
// process stays warm while upstream trades are flowing. Failures are logged
// and never fatal.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KeepAlivePinger {
    url: String,
    client: reqwest::Client,
}

impl KeepAlivePinger {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build keep-alive HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Local health URL for a service bound to `port`.
    pub fn for_port(port: u16) -> Result<Self> {
        Self::new(format!("http://127.0.0.1:{port}/health"))
    }

    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        if !resp.status().is_success() {
            bail!("GET {} returned {}", self.url, resp.status());
        }
        Ok(())
    }

    /// Ping every `every` until `cancel` fires. The first ping happens one
    /// full period after start.
    pub async fn run(self, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(url = %self.url, period_secs = every.as_secs(), "keep-alive pinger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.ping().await {
                    Ok(()) => debug!(url = %self.url, "keep-alive ping ok"),
                    Err(e) => warn!(error = %e, "keep-alive ping failed"),
                },
            }
        }
    }
}
