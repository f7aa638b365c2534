use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;
use worklog_core::{EntryKind, WorklogClient};

use super::backoff::Backoff;
use super::gate::{GateDecision, LocalUsage, UsageGate};
use super::queue::{NewOperation, OperationKind, PendingOperation};
use super::resolver::{self, Disposition};
use super::status::{StatusPublisher, SyncState};
use super::store::{QueueStore, StoreError};

pub const MAX_ATTEMPTS: u32 = 5;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("monthly entry limit reached ({used} of {max})")]
    LimitReached { used: u32, max: u32 },
    #[error("operation not found: {0}")]
    MissingOperation(String),
    #[error("payload carries no record id")]
    MissingRecordId,
}

/// Drives the durable queue against the remote store. Writes are accepted
/// optimistically through [`SyncEngine::enqueue`]; a drain pass then applies
/// them one at a time, classifying every failure as retryable or terminal.
pub struct SyncEngine {
    client: WorklogClient,
    store: QueueStore,
    gate: UsageGate,
    publisher: StatusPublisher,
    backoff: Backoff,
    call_timeout: Duration,
    drain_lock: tokio::sync::Mutex<()>,
    drain_requested: AtomicBool,
    auth_paused: AtomicBool,
    // Entries-this-month as last reported by the server; -1 = unknown.
    server_entries: AtomicI64,
    wakeup: tokio::sync::Notify,
}

impl SyncEngine {
    pub fn new(client: WorklogClient, store: QueueStore, gate: UsageGate) -> Self {
        Self {
            client,
            store,
            gate,
            publisher: StatusPublisher::new(),
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(300)),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            drain_lock: tokio::sync::Mutex::new(()),
            drain_requested: AtomicBool::new(false),
            auth_paused: AtomicBool::new(false),
            server_entries: AtomicI64::new(-1),
            wakeup: tokio::sync::Notify::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<SyncState> {
        self.publisher.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        self.publisher.current()
    }

    /// The daemon's drain worker parks on this and wakes on enqueue or an
    /// explicit trigger.
    pub fn wakeup(&self) -> &tokio::sync::Notify {
        &self.wakeup
    }

    pub fn set_online(&self, online: bool) {
        self.publisher.update(|state| state.is_online = online);
    }

    pub fn set_server_usage(&self, entries_this_month: u32) {
        self.server_entries
            .store(i64::from(entries_this_month), Ordering::SeqCst);
    }

    /// Republishes counts and persisted sync metadata, e.g. after bootstrap.
    pub async fn refresh_from_store(&self) -> Result<(), EngineError> {
        let (last_sync_at, last_error) = self.store.get_last_sync().await?;
        self.publisher.update(|state| {
            state.last_sync_at = last_sync_at;
            state.sync_error = last_error;
        });
        self.refresh_counts().await
    }

    /// Accepts a mutation. The write is durable once this returns: the
    /// operation survives restarts and will reach the remote store or end up
    /// rejected, never vanish. A create may bring its own client-generated
    /// record id in the payload (so the caller can render the optimistic row
    /// and target it later); one is minted otherwise.
    pub async fn enqueue(
        &self,
        entity: EntryKind,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<String, EngineError> {
        let payload_id = payload
            .get("id")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        let record_id = match kind {
            OperationKind::Create => payload_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            OperationKind::Update | OperationKind::Delete => {
                payload_id.ok_or(EngineError::MissingRecordId)?
            }
        };

        if kind == OperationKind::Create {
            // Stale counts fail open; the server re-validates at apply time.
            let usage = self.local_usage().await.unwrap_or_default();
            if let GateDecision::LimitReached { used, max } = self.gate.admit_create(usage) {
                return Err(EngineError::LimitReached { used, max });
            }
        }

        let op_id = Uuid::new_v4().to_string();
        self.store
            .enqueue(&NewOperation {
                op_id: op_id.clone(),
                entity,
                kind,
                record_id,
                payload,
                created_at: now_unix(),
            })
            .await?;
        self.refresh_counts().await?;
        self.drain_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
        Ok(op_id)
    }

    /// User-triggered sync: clears backoff schedules (exhausted operations
    /// stay put), lifts an auth pause, and drains. Never interrupts a call
    /// already in flight.
    pub async fn sync_now(&self) -> Result<(), EngineError> {
        self.auth_paused.store(false, Ordering::SeqCst);
        self.store.make_due(MAX_ATTEMPTS).await?;
        self.request_drain();
        self.drain().await
    }

    pub fn request_drain(&self) {
        self.drain_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    /// Runs drain passes until the request flag stays clear. Mutually
    /// exclusive: a trigger landing while a pass runs is coalesced into one
    /// rerun instead of a concurrent pass.
    pub async fn drain(&self) -> Result<(), EngineError> {
        self.drain_requested.store(true, Ordering::SeqCst);
        loop {
            {
                let Ok(_guard) = self.drain_lock.try_lock() else {
                    // Another pass is active; it will pick up the flag.
                    return Ok(());
                };
                while self.drain_requested.swap(false, Ordering::SeqCst) {
                    self.run_pass().await?;
                }
            }
            // A trigger can slip in between the last flag check and the
            // guard drop; loop back rather than lose it.
            if !self.drain_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    pub async fn list_ops(&self) -> Result<Vec<PendingOperation>, EngineError> {
        Ok(self.store.list_ops().await?)
    }

    /// Drops a failed or rejected operation the user gave up on.
    pub async fn discard(&self, op_id: &str) -> Result<(), EngineError> {
        if !self.store.discard(op_id).await? {
            return Err(EngineError::MissingOperation(op_id.to_string()));
        }
        self.refresh_counts().await
    }

    /// Manual retry for a needs-attention operation: fresh attempt budget,
    /// immediate drain.
    pub async fn retry_op(&self, op_id: &str) -> Result<(), EngineError> {
        if !self.store.retry_op(op_id).await? {
            return Err(EngineError::MissingOperation(op_id.to_string()));
        }
        self.refresh_counts().await?;
        self.request_drain();
        Ok(())
    }

    async fn run_pass(&self) -> Result<(), EngineError> {
        if self.auth_paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let ops = self.store.list_ops().await?;
        let doomed = resolver::collapse_unsynced_deletes(&ops);
        if !doomed.is_empty() {
            eprintln!(
                "[worklogd] collapsed {} operation(s) on records that never left this device",
                doomed.len()
            );
            self.store.remove_ops(&doomed).await?;
            self.refresh_counts().await?;
        }

        self.publisher.update(|state| state.is_syncing = true);
        let outcome = self.apply_due_ops().await;
        self.publisher.update(|state| state.is_syncing = false);
        let clean = outcome?;

        let counts = self.store.status_counts(MAX_ATTEMPTS).await?;
        if counts.pending == 0 {
            // Rejections leave pending at zero too; they must keep their
            // error visible instead of being swept under a clean stamp.
            let now = now_unix();
            let error = if clean {
                None
            } else {
                self.publisher.current().sync_error
            };
            self.store.set_last_sync(Some(now), error.as_deref()).await?;
            self.publisher.update(|state| {
                state.last_sync_at = Some(now);
                state.sync_error = error.clone();
            });
        }
        Ok(())
    }

    /// Returns whether the pass stayed clean, i.e. produced no terminal or
    /// retry-exhausted outcome.
    async fn apply_due_ops(&self) -> Result<bool, EngineError> {
        let mut clean = true;
        loop {
            let Some(op) = self.store.next_due(now_unix(), MAX_ATTEMPTS).await? else {
                return Ok(clean);
            };
            self.store.mark_in_flight(&op.op_id).await?;
            eprintln!(
                "[worklogd] op start: kind={} entity={} record={}",
                op.kind.as_str(),
                op.entity.collection(),
                op.record_id
            );

            match self.apply_remote(&op).await {
                Disposition::Applied => {
                    self.store.mark_applied(&op, now_unix()).await?;
                    eprintln!(
                        "[worklogd] op applied: kind={} record={}",
                        op.kind.as_str(),
                        op.record_id
                    );
                }
                Disposition::Retry {
                    retry_after,
                    reason,
                } => {
                    let attempts = op.attempts.saturating_add(1);
                    if attempts >= MAX_ATTEMPTS {
                        clean = false;
                        self.store
                            .mark_failed(&op.op_id, attempts, None, &reason)
                            .await?;
                        self.publisher
                            .update(|state| state.sync_error = Some(reason.clone()));
                        eprintln!(
                            "[worklogd] op failed permanently after {attempts} attempts: record={} err={reason}",
                            op.record_id
                        );
                    } else {
                        let delay = retry_after
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| self.backoff.delay(op.attempts));
                        let retry_at = now_unix().saturating_add(delay.as_secs() as i64);
                        self.store
                            .mark_failed(&op.op_id, attempts, Some(retry_at), &reason)
                            .await?;
                        eprintln!(
                            "[worklogd] op requeued: record={} attempt={attempts} retry_at={retry_at}",
                            op.record_id
                        );
                    }
                }
                Disposition::Reject { reason } => {
                    clean = false;
                    self.store.mark_rejected(&op.op_id, &reason).await?;
                    self.publisher
                        .update(|state| state.sync_error = Some(reason.clone()));
                    eprintln!(
                        "[worklogd] op rejected: kind={} record={} err={reason}",
                        op.kind.as_str(),
                        op.record_id
                    );
                }
                Disposition::PauseAuth { reason } => {
                    // Outcome unknown territory is fine here: the op goes
                    // back to pending and replays under its idempotency key
                    // once credentials work again.
                    self.store.mark_pending(&op.op_id).await?;
                    self.auth_paused.store(true, Ordering::SeqCst);
                    self.publisher
                        .update(|state| state.sync_error = Some(reason.clone()));
                    eprintln!("[worklogd] queue paused, authentication rejected: {reason}");
                    self.refresh_counts().await?;
                    return Ok(false);
                }
            }
            self.refresh_counts().await?;
        }
    }

    async fn apply_remote(&self, op: &PendingOperation) -> Disposition {
        let call = async {
            match op.kind {
                OperationKind::Create => self
                    .client
                    .create_entry(op.entity, &op.record_id, &op.payload, &op.op_id)
                    .await
                    .map(|_| ()),
                OperationKind::Update => self
                    .client
                    .update_entry(op.entity, &op.record_id, &op.payload, &op.op_id)
                    .await
                    .map(|_| ()),
                OperationKind::Delete => {
                    self.client
                        .delete_entry(op.entity, &op.record_id, &op.op_id)
                        .await
                }
            }
        };
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(())) => Disposition::Applied,
            Ok(Err(err)) => resolver::dispose(op.kind, &err),
            Err(_) => Disposition::Retry {
                retry_after: None,
                reason: "remote call timed out".to_string(),
            },
        }
    }

    async fn refresh_counts(&self) -> Result<(), EngineError> {
        let counts = self.store.status_counts(MAX_ATTEMPTS).await?;
        self.publisher.update(|state| {
            state.pending_count = counts.pending;
            state.needs_attention = counts.exhausted;
        });
        Ok(())
    }

    async fn local_usage(&self) -> Result<LocalUsage, StoreError> {
        let since = month_start_unix(OffsetDateTime::now_utc());
        Ok(LocalUsage {
            applied_this_month: self.store.count_applied_since(since).await?,
            queued_creates: self.store.count_queued_creates_since(since).await?,
            server_reported: match self.server_entries.load(Ordering::SeqCst) {
                n if n >= 0 => Some(n as u32),
                _ => None,
            },
        })
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn month_start_unix(now: OffsetDateTime) -> i64 {
    let first = now.date().replace_day(1).unwrap_or(now.date());
    first.midnight().assume_utc().unix_timestamp()
}


#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
