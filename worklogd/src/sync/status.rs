use tokio::sync::watch;

/// Snapshot of engine health handed to subscribers. Derived from the queue
/// store and the connectivity monitor; never persisted on its own beyond
/// `last_sync_at`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    /// Operations still owed to the remote store.
    pub pending_count: u32,
    /// Retry-exhausted failures waiting for the user to retry or discard.
    pub needs_attention: u32,
    /// Last drain pass that finished with nothing pending or failed.
    pub last_sync_at: Option<i64>,
    pub sync_error: Option<String>,
}

/// Event-driven publication of [`SyncState`]. Subscribers hold a watch
/// receiver; dropping it is the unsubscribe. Consumers that prefer polling
/// can call [`StatusPublisher::current`] instead.
pub struct StatusPublisher {
    tx: watch::Sender<SyncState>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    /// Applies a mutation and notifies subscribers only when something
    /// actually changed.
    pub fn update(&self, apply: impl FnOnce(&mut SyncState)) {
        self.tx.send_if_modified(|state| {
            let before = state.clone();
            apply(state);
            *state != before
        });
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}
