//! Periodic sweep that reclaims orphaned executions, resets daily per-user
//! cost budgets, and runs the terminal-execution retention policy.
//!
//! `next_check_at`/`started_at` are the single source of truth for "is this
//! execution actually still alive" — the janitor never trusts an in-memory
//! scheduler, only what's persisted, so a crashed worker's orphans are always
//! recoverable by the next sweep.

use chrono::{DateTime, Duration, Utc};
use event_bus::{Event, EventBus, EventType};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use state_store::{Execution, ExecutionFilter, ExecutionStatus, StateStore};
use std::sync::Arc;

/// Stale RUNNING/PENDING threshold, measured from `started_at` (falling back
/// to `created_at`).
pub const MAX_AGE_RUNNING_MINUTES: i64 = 20;

/// Stale MONITORING / retrying-COMMUNICATION_ERROR threshold. Generous
/// because swing-trade monitoring legitimately runs for days; this only
/// catches executions whose self-reschedule loop actually died.
pub const MAX_AGE_MONITORING_MINUTES: i64 = 60 * 25;

/// Default terminal-execution retention window for the janitor's sweep.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub stale_running_failed: usize,
    pub stale_monitoring_failed: usize,
    pub stale_comm_error_failed: usize,
    pub budgets_reset: usize,
    pub retained_deleted: u64,
}

pub struct Janitor {
    store: Arc<StateStore>,
    budgets: AnyPool,
    events: Arc<EventBus>,
}

impl Janitor {
    pub async fn new(store: Arc<StateStore>, events: Arc<EventBus>, database_url: &str) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();
        let budgets = AnyPoolOptions::new().max_connections(5).connect(database_url).await?;
        Self::migrate_budgets(&budgets).await?;
        Ok(Self { store, budgets, events })
    }

    #[cfg(test)]
    async fn with_pool(store: Arc<StateStore>, budgets: AnyPool) -> anyhow::Result<Self> {
        Self::migrate_budgets(&budgets).await?;
        Ok(Self { store, budgets, events: Arc::new(EventBus::new()) })
    }

    async fn migrate_budgets(pool: &AnyPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_budgets (
                user_id TEXT PRIMARY KEY,
                daily_spent REAL NOT NULL,
                daily_reset_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn run_sweep(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::default();

        report.stale_running_failed = self.fail_stale(&[ExecutionStatus::Running, ExecutionStatus::Pending], MAX_AGE_RUNNING_MINUTES, now, false).await?;
        report.stale_monitoring_failed = self.fail_stale(&[ExecutionStatus::Monitoring], MAX_AGE_MONITORING_MINUTES, now, false).await?;
        report.stale_comm_error_failed = self.fail_stale(&[ExecutionStatus::CommunicationError], MAX_AGE_MONITORING_MINUTES, now, true).await?;

        report.budgets_reset = self.reset_daily_budgets(now).await?;
        report.retained_deleted = self
            .store
            .delete_terminal_older_than(now - Duration::days(DEFAULT_RETENTION_DAYS))
            .await?;

        if report.stale_running_failed + report.stale_monitoring_failed + report.stale_comm_error_failed > 0 {
            tracing::warn!(
                running_pending = report.stale_running_failed,
                monitoring = report.stale_monitoring_failed,
                comm_error = report.stale_comm_error_failed,
                "janitor: failed stale executions"
            );
        }

        Ok(report)
    }

    /// Fails executions in any of `statuses` whose age (from `started_at`,
    /// falling back to `created_at`) exceeds `max_age_minutes`.
    ///
    /// When `require_next_check_at` is set (the `communication_error` case),
    /// executions with `next_check_at = null` are skipped: those have
    /// exhausted their retries and are intentionally parked for the user to
    /// reconcile the broker position by hand, not orphaned.
    async fn fail_stale(
        &self,
        statuses: &[ExecutionStatus],
        max_age_minutes: i64,
        now: DateTime<Utc>,
        require_next_check_at: bool,
    ) -> anyhow::Result<usize> {
        let cutoff = now - Duration::minutes(max_age_minutes);
        let mut failed = 0;

        for &status in statuses {
            let candidates = self
                .store
                .list_by(&ExecutionFilter { status: Some(status), ..Default::default() })
                .await?;

            for mut execution in candidates {
                if require_next_check_at && execution.next_check_at.is_none() {
                    continue;
                }

                let age_reference = execution.started_at.unwrap_or(execution.created_at);
                if age_reference >= cutoff {
                    continue;
                }

                let original_status = execution.status.as_str().to_string();
                execution.status = ExecutionStatus::Failed;
                execution.completed_at = Some(now);
                execution.next_check_at = None;
                execution.error_message = Some(format!(
                    "stale execution auto-failed after {max_age_minutes}m (original_status={original_status})"
                ));

                let expected = execution.version;
                self.store.compare_and_save(&mut execution, expected).await?;
                self.events.publish(Event::new(
                    EventType::PipelineFailed,
                    execution.id,
                    execution.user_id,
                    serde_json::json!({ "error_message": execution.error_message, "reason": "stale_auto_failed" }),
                ));
                failed += 1;
            }
        }

        Ok(failed)
    }

    async fn reset_daily_budgets(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let rows = sqlx::query("SELECT user_id, daily_reset_at FROM user_budgets").fetch_all(&self.budgets).await?;

        let mut reset = 0;
        for row in rows {
            let user_id: String = row.try_get("user_id")?;
            let reset_at: String = row.try_get("daily_reset_at")?;
            let last_reset = DateTime::parse_from_rfc3339(&reset_at).map(|t| t.with_timezone(&Utc));

            let needs_reset = match last_reset {
                Ok(t) => now - t >= Duration::days(1),
                Err(_) => true,
            };

            if needs_reset {
                sqlx::query("UPDATE user_budgets SET daily_spent = 0, daily_reset_at = ? WHERE user_id = ?")
                    .bind(now.to_rfc3339())
                    .bind(&user_id)
                    .execute(&self.budgets)
                    .await?;
                reset += 1;
            }
        }

        Ok(reset)
    }

    /// Upserts today's spend for `user_id`; used by the pipeline executor's
    /// cost-guard path (outside this crate) to track spend against the daily
    /// budget this sweep resets.
    pub async fn record_spend(&self, user_id: &str, amount: f64) -> anyhow::Result<()> {
        let existing: Option<AnyRow> = sqlx::query("SELECT daily_spent FROM user_budgets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.budgets)
            .await?;

        match existing {
            Some(row) => {
                let spent: f64 = row.try_get("daily_spent")?;
                sqlx::query("UPDATE user_budgets SET daily_spent = ? WHERE user_id = ?")
                    .bind(spent + amount)
                    .bind(user_id)
                    .execute(&self.budgets)
                    .await?;
            }
            None => {
                sqlx::query("INSERT INTO user_budgets (user_id, daily_spent, daily_reset_at) VALUES (?, ?, ?)")
                    .bind(user_id)
                    .bind(amount)
                    .bind(Utc::now().to_rfc3339())
                    .execute(&self.budgets)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_store::ExecutionMode;
    use uuid::Uuid;

    async fn janitor_with_memory_store() -> (Arc<StateStore>, Janitor) {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let janitor = Janitor::with_pool(store.clone(), pool).await.unwrap();
        (store, janitor)
    }

    #[tokio::test]
    async fn fails_stale_running_execution() {
        let (store, janitor) = janitor_with_memory_store().await;

        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now() - Duration::minutes(25));
        store.create(&execution).await.unwrap();

        let report = janitor.run_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.stale_running_failed, 1);

        let reloaded = store.load(execution.id).await.unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn leaves_fresh_running_execution_alone() {
        let (store, janitor) = janitor_with_memory_store().await;

        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now() - Duration::minutes(2));
        store.create(&execution).await.unwrap();

        let report = janitor.run_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.stale_running_failed, 0);

        let reloaded = store.load(execution.id).await.unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn leaves_exhausted_communication_error_alone() {
        let (store, janitor) = janitor_with_memory_store().await;

        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        execution.status = ExecutionStatus::CommunicationError;
        execution.started_at = Some(Utc::now() - Duration::hours(30));
        execution.next_check_at = None; // retries exhausted, awaiting manual reconciliation
        store.create(&execution).await.unwrap();

        let report = janitor.run_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.stale_comm_error_failed, 0);

        let reloaded = store.load(execution.id).await.unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::CommunicationError);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let (store, janitor) = janitor_with_memory_store().await;

        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now() - Duration::minutes(25));
        store.create(&execution).await.unwrap();

        janitor.run_sweep(Utc::now()).await.unwrap();
        let second = janitor.run_sweep(Utc::now()).await.unwrap();
        assert_eq!(second.stale_running_failed, 0);
    }
}
