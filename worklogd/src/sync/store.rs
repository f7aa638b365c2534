use std::path::Path;

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use worklog_core::EntryKind;

use super::queue::{NewOperation, OpStatus, OperationKind, PendingOperation};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid entity: {0}")]
    InvalidEntity(String),
    #[error("invalid operation kind: {0}")]
    InvalidKind(String),
    #[error("invalid operation status: {0}")]
    InvalidStatus(String),
}

fn entry_kind_as_str(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Earning => "earning",
        EntryKind::Expense => "expense",
        EntryKind::Shift => "shift",
    }
}

fn parse_entry_kind(value: &str) -> Result<EntryKind, StoreError> {
    match value {
        "earning" => Ok(EntryKind::Earning),
        "expense" => Ok(EntryKind::Expense),
        "shift" => Ok(EntryKind::Shift),
        other => Err(StoreError::InvalidEntity(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusCounts {
    /// Operations still owed to the remote store (pending, in flight, failed).
    pub pending: u32,
    /// Failed operations that exhausted their retry budget.
    pub exhausted: u32,
    /// Rejected operations retained as history.
    pub rejected: u32,
}

pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Runs migrations and resets any operation left in flight by a previous
    /// run. Its remote outcome is unknown, so it goes back to pending and is
    /// replayed through the idempotency path.
    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        self.reset_in_flight().await?;
        Ok(())
    }

    pub async fn enqueue(&self, op: &NewOperation) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&op.payload)?;
        let result = sqlx::query(
            "INSERT INTO ops_queue (op_id, entity, kind, record_id, payload, created_at, attempts, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending')",
        )
        .bind(&op.op_id)
        .bind(entry_kind_as_str(op.entity))
        .bind(op.kind.as_str())
        .bind(&op.record_id)
        .bind(payload)
        .bind(op.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_op(&self, op_id: &str) -> Result<Option<PendingOperation>, StoreError> {
        let row = sqlx::query(
            "SELECT op_id, entity, kind, record_id, payload, created_at, attempts, status, last_error, retry_at
             FROM ops_queue WHERE op_id = ?1",
        )
        .bind(op_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| op_from_row(&row)).transpose()
    }

    /// All queued operations in insertion order, rejected history included.
    pub async fn list_ops(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let rows = sqlx::query(
            "SELECT op_id, entity, kind, record_id, payload, created_at, attempts, status, last_error, retry_at
             FROM ops_queue ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(op_from_row).collect()
    }

    /// Earliest operation that is due now. Skips failed operations still in
    /// backoff or past their retry budget, and never hands out an update or
    /// delete while a create for the same record is still queued.
    pub async fn next_due(
        &self,
        now: i64,
        max_attempts: u32,
    ) -> Result<Option<PendingOperation>, StoreError> {
        let row = sqlx::query(
            "SELECT op_id, entity, kind, record_id, payload, created_at, attempts, status, last_error, retry_at
             FROM ops_queue o
             WHERE o.status IN ('pending', 'failed')
               AND (o.retry_at IS NULL OR o.retry_at <= ?1)
               AND NOT (o.status = 'failed' AND o.attempts >= ?2)
               AND NOT EXISTS (
                   SELECT 1 FROM ops_queue c
                   WHERE c.record_id = o.record_id
                     AND c.kind = 'create'
                     AND c.status IN ('pending', 'failed')
                     AND c.id <> o.id
               )
             ORDER BY o.id ASC
             LIMIT 1",
        )
        .bind(now)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| op_from_row(&row)).transpose()
    }

    pub async fn mark_in_flight(&self, op_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE ops_queue SET status = 'in_flight' WHERE op_id = ?1")
            .bind(op_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_pending(&self, op_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE ops_queue SET status = 'pending' WHERE op_id = ?1")
            .bind(op_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the applied operation; a create also lands in the applied
    /// ledger that feeds the monthly usage count.
    pub async fn mark_applied(
        &self,
        op: &PendingOperation,
        applied_at: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ops_queue WHERE op_id = ?1")
            .bind(&op.op_id)
            .execute(&mut *tx)
            .await?;
        if op.kind == OperationKind::Create {
            sqlx::query(
                "INSERT OR IGNORE INTO applied_entries (entity, record_id, applied_at) VALUES (?1, ?2, ?3)",
            )
            .bind(entry_kind_as_str(op.entity))
            .bind(&op.record_id)
            .bind(applied_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        op_id: &str,
        attempts: u32,
        retry_at: Option<i64>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ops_queue SET status = 'failed', attempts = ?2, retry_at = ?3, last_error = ?4
             WHERE op_id = ?1",
        )
        .bind(op_id)
        .bind(attempts)
        .bind(retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rejected rows stay behind as needs-attention history until discarded.
    pub async fn mark_rejected(&self, op_id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ops_queue SET status = 'rejected', retry_at = NULL, last_error = ?2
             WHERE op_id = ?1",
        )
        .bind(op_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_in_flight(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE ops_queue SET status = 'pending' WHERE status = 'in_flight'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Clears backoff schedules so every retryable failure is due now. Used
    /// by the explicit sync trigger; exhausted operations are left alone.
    pub async fn make_due(&self, max_attempts: u32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ops_queue SET retry_at = NULL WHERE status = 'failed' AND attempts < ?1",
        )
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn discard(&self, op_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ops_queue WHERE op_id = ?1")
            .bind(op_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Manual retry of a failed or rejected operation: back to pending with
    /// a fresh attempt budget.
    pub async fn retry_op(&self, op_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE ops_queue SET status = 'pending', attempts = 0, retry_at = NULL, last_error = NULL
             WHERE op_id = ?1 AND status IN ('failed', 'rejected')",
        )
        .bind(op_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_ops(&self, op_ids: &[String]) -> Result<(), StoreError> {
        for op_id in op_ids {
            sqlx::query("DELETE FROM ops_queue WHERE op_id = ?1")
                .bind(op_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn status_counts(&self, max_attempts: u32) -> Result<StatusCounts, StoreError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN status IN ('pending', 'in_flight', 'failed') THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'failed' AND attempts >= ?1 THEN 1 ELSE 0 END), 0) AS exhausted,
                COALESCE(SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected
             FROM ops_queue",
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending")?;
        let exhausted: i64 = row.try_get("exhausted")?;
        let rejected: i64 = row.try_get("rejected")?;
        Ok(StatusCounts {
            pending: pending as u32,
            exhausted: exhausted as u32,
            rejected: rejected as u32,
        })
    }

    pub async fn count_applied_since(&self, since: i64) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM applied_entries WHERE applied_at >= ?1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    pub async fn count_queued_creates_since(&self, since: i64) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM ops_queue
             WHERE kind = 'create'
               AND status IN ('pending', 'in_flight', 'failed')
               AND created_at >= ?1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    pub async fn set_last_sync(
        &self,
        last_sync_at: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_meta (id, last_sync_at, last_error)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_error = excluded.last_error;",
        )
        .bind(last_sync_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_last_sync(&self) -> Result<(Option<i64>, Option<String>), StoreError> {
        let row = sqlx::query("SELECT last_sync_at, last_error FROM sync_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            Ok((row.try_get("last_sync_at")?, row.try_get("last_error")?))
        } else {
            Ok((None, None))
        }
    }
}

fn op_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PendingOperation, StoreError> {
    let entity: String = row.try_get("entity")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(PendingOperation {
        op_id: row.try_get("op_id")?,
        entity: parse_entry_kind(&entity)?,
        kind: OperationKind::parse(&kind).ok_or_else(|| StoreError::InvalidKind(kind.clone()))?,
        record_id: row.try_get("record_id")?,
        payload: serde_json::from_str(&payload)?,
        created_at: row.try_get("created_at")?,
        attempts: row.try_get("attempts")?,
        status: OpStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidStatus(status.clone()))?,
        last_error: row.try_get("last_error")?,
        retry_at: row.try_get("retry_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn make_store() -> QueueStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = QueueStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn new_op(op_id: &str, kind: OperationKind, record_id: &str, created_at: i64) -> NewOperation {
        NewOperation {
            op_id: op_id.to_string(),
            entity: EntryKind::Earning,
            kind,
            record_id: record_id.to_string(),
            payload: serde_json::json!({"amount_cents": 1000}),
            created_at,
        }
    }

    #[tokio::test]
    async fn enqueue_and_list_preserves_insertion_order() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store
            .enqueue(&new_op("op-2", OperationKind::Create, "rec-2", 20))
            .await
            .unwrap();

        let ops = store.list_ops().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op_id, "op-1");
        assert_eq!(ops[1].op_id, "op-2");
        assert_eq!(ops[0].status, OpStatus::Pending);
        assert_eq!(ops[0].attempts, 0);
        assert_eq!(ops[0].payload["amount_cents"], 1000);
    }

    #[tokio::test]
    async fn next_due_skips_operations_still_in_backoff() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store.mark_failed("op-1", 1, Some(1_000), "timeout").await.unwrap();

        assert!(store.next_due(999, 5).await.unwrap().is_none());
        let due = store.next_due(1_000, 5).await.unwrap().unwrap();
        assert_eq!(due.op_id, "op-1");
        assert_eq!(due.attempts, 1);
        assert_eq!(due.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn next_due_never_returns_exhausted_failures() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store.mark_failed("op-1", 5, None, "gave up").await.unwrap();

        assert!(store.next_due(10_000, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_due_holds_dependents_until_their_create_is_applied() {
        let store = make_store().await;
        // UI timing can enqueue the update ahead of the create it depends on.
        store
            .enqueue(&new_op("op-upd", OperationKind::Update, "rec-1", 5))
            .await
            .unwrap();
        store
            .enqueue(&new_op("op-cre", OperationKind::Create, "rec-1", 6))
            .await
            .unwrap();

        let first = store.next_due(100, 5).await.unwrap().unwrap();
        assert_eq!(first.op_id, "op-cre");

        store.mark_applied(&first, 50).await.unwrap();
        let second = store.next_due(100, 5).await.unwrap().unwrap();
        assert_eq!(second.op_id, "op-upd");
    }

    #[tokio::test]
    async fn mark_applied_removes_create_and_records_ledger_entry() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        let op = store.get_op("op-1").await.unwrap().unwrap();

        store.mark_applied(&op, 42).await.unwrap();

        assert!(store.list_ops().await.unwrap().is_empty());
        assert_eq!(store.count_applied_since(0).await.unwrap(), 1);
        assert_eq!(store.count_applied_since(43).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_applied_for_update_leaves_ledger_alone() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Update, "rec-1", 10))
            .await
            .unwrap();
        let op = store.get_op("op-1").await.unwrap().unwrap();

        store.mark_applied(&op, 42).await.unwrap();

        assert_eq!(store.count_applied_since(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn applied_ledger_deduplicates_replayed_creates() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        let op = store.get_op("op-1").await.unwrap().unwrap();
        store.mark_applied(&op, 42).await.unwrap();

        store
            .enqueue(&new_op("op-2", OperationKind::Create, "rec-1", 11))
            .await
            .unwrap();
        let replay = store.get_op("op-2").await.unwrap().unwrap();
        store.mark_applied(&replay, 43).await.unwrap();

        assert_eq!(store.count_applied_since(0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_rows_are_kept_but_not_counted_as_pending() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store.mark_rejected("op-1", "validation failed").await.unwrap();

        let counts = store.status_counts(5).await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.rejected, 1);

        let op = store.get_op("op-1").await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Rejected);
        assert_eq!(op.last_error.as_deref(), Some("validation failed"));

        assert!(store.discard("op-1").await.unwrap());
        assert!(store.get_op("op-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_counts_track_exhausted_failures() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store
            .enqueue(&new_op("op-2", OperationKind::Create, "rec-2", 11))
            .await
            .unwrap();
        store.mark_failed("op-1", 5, None, "gave up").await.unwrap();

        let counts = store.status_counts(5).await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.exhausted, 1);
    }

    #[tokio::test]
    async fn make_due_clears_backoff_but_not_exhausted_ops() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store
            .enqueue(&new_op("op-2", OperationKind::Create, "rec-2", 11))
            .await
            .unwrap();
        store.mark_failed("op-1", 2, Some(9_999), "timeout").await.unwrap();
        store.mark_failed("op-2", 5, Some(9_999), "gave up").await.unwrap();

        store.make_due(5).await.unwrap();

        let due = store.next_due(0, 5).await.unwrap().unwrap();
        assert_eq!(due.op_id, "op-1");
        let exhausted = store.get_op("op-2").await.unwrap().unwrap();
        assert_eq!(exhausted.retry_at, Some(9_999));
    }

    #[tokio::test]
    async fn retry_op_resets_the_attempt_budget() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
            .await
            .unwrap();
        store.mark_failed("op-1", 5, None, "gave up").await.unwrap();

        assert!(store.retry_op("op-1").await.unwrap());
        let op = store.get_op("op-1").await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.last_error, None);

        assert!(!store.retry_op("op-1").await.unwrap());
    }

    #[tokio::test]
    async fn queued_create_counts_feed_the_usage_gate() {
        let store = make_store().await;
        store
            .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 100))
            .await
            .unwrap();
        store
            .enqueue(&new_op("op-2", OperationKind::Update, "rec-2", 101))
            .await
            .unwrap();
        store
            .enqueue(&new_op("op-3", OperationKind::Create, "rec-3", 50))
            .await
            .unwrap();

        assert_eq!(store.count_queued_creates_since(100).await.unwrap(), 1);
        assert_eq!(store.count_queued_creates_since(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn set_and_get_last_sync() {
        let store = make_store().await;
        assert_eq!(store.get_last_sync().await.unwrap(), (None, None));

        store.set_last_sync(Some(42), None).await.unwrap();
        assert_eq!(store.get_last_sync().await.unwrap(), (Some(42), None));

        store
            .set_last_sync(Some(42), Some("auth rejected"))
            .await
            .unwrap();
        let (at, err) = store.get_last_sync().await.unwrap();
        assert_eq!(at, Some(42));
        assert_eq!(err.as_deref(), Some("auth rejected"));
    }

    #[tokio::test]
    async fn reopening_the_store_resets_in_flight_operations() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("queue.db");

        {
            let store = QueueStore::open(&db_path).await.unwrap();
            store
                .enqueue(&new_op("op-1", OperationKind::Create, "rec-1", 10))
                .await
                .unwrap();
            store.mark_in_flight("op-1").await.unwrap();
            let op = store.get_op("op-1").await.unwrap().unwrap();
            assert_eq!(op.status, OpStatus::InFlight);
        }

        // Simulated crash: the process died with the op in flight.
        let store = QueueStore::open(&db_path).await.unwrap();
        let op = store.get_op("op-1").await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempts, 0);
    }
}
