use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use worklog_core::{AccountInfo, ApiErrorClass, WorklogClient};

use crate::sync::connectivity::{ApiProbe, MonitorConfig, start_monitor};
use crate::sync::engine::SyncEngine;
use crate::sync::gate::UsageGate;
use crate::sync::store::QueueStore;

const DEFAULT_ACCOUNT: &str = "default";
const DEFAULT_DRAIN_TICK_SECS: u64 = 30;
const DEFAULT_PROBE_SECS: u64 = 15;
const DEFAULT_PROBE_DWELL_SECS: u64 = 2;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_base: Option<String>,
    pub account: String,
    pub db_path: PathBuf,
    pub drain_tick: Duration,
    pub probe_interval: Duration,
    pub probe_dwell: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let account =
            std::env::var("WORKLOG_ACCOUNT").unwrap_or_else(|_| DEFAULT_ACCOUNT.to_string());
        let db_path = match std::env::var("WORKLOG_DB_PATH") {
            Ok(value) => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            Err(_) => default_db_path(&account)?,
        };
        let api_base = std::env::var("WORKLOG_API_BASE").ok();
        let drain_tick = Duration::from_secs(read_u64_env(
            "WORKLOG_DRAIN_TICK_SECS",
            DEFAULT_DRAIN_TICK_SECS,
        ));
        let probe_interval =
            Duration::from_secs(read_u64_env("WORKLOG_PROBE_SECS", DEFAULT_PROBE_SECS));
        let probe_dwell = Duration::from_secs(read_u64_env(
            "WORKLOG_PROBE_DWELL_SECS",
            DEFAULT_PROBE_DWELL_SECS,
        ));

        Ok(Self {
            api_base,
            account,
            db_path,
            drain_tick,
            probe_interval,
            probe_dwell,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: WorklogClient,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create data directory at {parent:?}"))?;
        }

        let token = std::env::var("WORKLOG_TOKEN").context("WORKLOG_TOKEN is not set")?;
        let client = match &config.api_base {
            Some(base) => WorklogClient::with_base_url(base, token)?,
            None => WorklogClient::new(token)?,
        };
        let store = QueueStore::open(&config.db_path)
            .await
            .context("failed to initialize queue store")?;

        let account = fetch_account_with_retry(&client)
            .await
            .context("failed to fetch account info")?;
        eprintln!(
            "[worklogd] account {} on plan {:?}, {} entries used this month",
            account.account_id, account.plan, account.usage.entries_this_month
        );

        let gate = UsageGate::new(account.effective_limits());
        let engine = Arc::new(SyncEngine::new(client.clone(), store, gate));
        engine.set_server_usage(account.usage.entries_this_month);
        engine
            .refresh_from_store()
            .await
            .context("failed to load persisted sync state")?;

        Ok(Self {
            config,
            client,
            engine,
        })
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[worklogd] started: account={}, db={}, drain_tick={}s",
            self.config.account,
            self.config.db_path.display(),
            self.config.drain_tick.as_secs()
        );

        let (mut online_rx, monitor_handle) = start_monitor(
            ApiProbe::new(self.client.clone()),
            MonitorConfig {
                interval: self.config.probe_interval,
                dwell: self.config.probe_dwell,
            },
        );

        let engine_for_online = Arc::clone(&self.engine);
        let online_handle = tokio::spawn(async move {
            while online_rx.changed().await.is_ok() {
                let online = *online_rx.borrow_and_update();
                engine_for_online.set_online(online);
                if online {
                    eprintln!("[worklogd] connectivity restored, draining queue");
                    engine_for_online.request_drain();
                } else {
                    eprintln!("[worklogd] connectivity lost, queue keeps accepting writes");
                }
            }
        });

        let engine_for_worker = Arc::clone(&self.engine);
        let drain_tick = self.config.drain_tick;
        let worker_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine_for_worker.wakeup().notified() => {}
                    _ = tokio::time::sleep(drain_tick) => {}
                }
                if let Err(err) = engine_for_worker.drain().await {
                    eprintln!("[worklogd] drain error: {err}");
                }
            }
        });

        // Anything left over from a previous run drains right away.
        self.engine.request_drain();

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[worklogd] shutting down");

        monitor_handle.abort();
        online_handle.abort();
        worker_handle.abort();

        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
