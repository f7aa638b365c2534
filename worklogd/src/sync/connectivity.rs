use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use worklog_core::WorklogClient;

/// A single reachability sample. Production code pings the remote store;
/// tests script the answers.
pub trait Probe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Reachability via the ledger API's ping endpoint.
pub struct ApiProbe {
    client: WorklogClient,
}

impl ApiProbe {
    pub fn new(client: WorklogClient) -> Self {
        Self { client }
    }
}

impl Probe for ApiProbe {
    async fn check(&self) -> bool {
        self.client.ping().await.is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// How often the probe is sampled.
    pub interval: Duration,
    /// Minimum time a new reading must hold before the published state
    /// flips. Keeps flapping links from re-triggering sync passes.
    pub dwell: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            dwell: Duration::from_secs(2),
        }
    }
}

/// Starts the monitor task. The returned receiver publishes the debounced
/// online flag; the initial value is offline until the first stable reading.
pub fn start_monitor<P: Probe>(
    probe: P,
    config: MonitorConfig,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut published = false;
        let mut candidate = false;
        let mut candidate_since: Option<Instant> = None;
        loop {
            let observed = probe.check().await;
            if observed == published {
                candidate_since = None;
            } else if candidate_since.is_some() && observed == candidate {
                let held = candidate_since.map(|since| since.elapsed()).unwrap_or_default();
                if held >= config.dwell {
                    published = observed;
                    candidate_since = None;
                    if tx.send(observed).is_err() {
                        return;
                    }
                }
            } else {
                candidate = observed;
                candidate_since = Some(Instant::now());
            }
            tokio::time::sleep(config.interval).await;
        }
    });
    (rx, handle)
}
