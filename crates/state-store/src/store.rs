use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::error::{Result, StateStoreError};
use crate::models::{
    ApprovalStatus, Execution, ExecutionMode, ExecutionPhase, ExecutionStatus, PipelineState,
};

/// Optional filters for `list_by`. All `None` fields are unconstrained.
#[derive(Debug, Default, Clone)]
pub struct ExecutionFilter {
    pub user_id: Option<Uuid>,
    pub pipeline_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub due_before: Option<DateTime<Utc>>,
    pub approval_token: Option<String>,
    pub symbol: Option<String>,
    pub non_terminal_only: bool,
}

/// Durable persistence of `Execution` + embedded `PipelineState`, with
/// optimistic concurrency via the monotonic `version` column.
///
/// Mirrors the key-value + JSON-blob persistence idiom the rest of the
/// workspace uses: idempotent `CREATE TABLE IF NOT EXISTS` migration-in-code,
/// JSON columns for nested structures, plain `sqlx::AnyPool` queries.
pub struct StateStore {
    pool: AnyPool,
}

impl StateStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                execution_phase TEXT NOT NULL,
                version INTEGER NOT NULL,
                approval_status TEXT NOT NULL,
                approval_token TEXT,
                approval_expires_at TEXT,
                approval_responded_at TEXT,
                next_check_at TEXT,
                monitor_interval_seconds INTEGER NOT NULL,
                broker_error_count INTEGER NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                pipeline_state TEXT,
                result TEXT,
                reports TEXT NOT NULL,
                logs TEXT NOT NULL,
                agent_states TEXT NOT NULL,
                cost_breakdown TEXT NOT NULL,
                error_message TEXT,
                cancel_requested INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_user ON executions(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_pipeline_status ON executions(pipeline_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_status_next_check ON executions(status, next_check_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_approval_token ON executions(approval_token) WHERE approval_token IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .ok(); // partial unique indexes aren't supported on every `Any` backend; best-effort.

        Ok(())
    }

    pub async fn create(&self, execution: &Execution) -> Result<()> {
        let row = ExecutionRow::from_model(execution)?;
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, pipeline_id, user_id, symbol, mode, status, execution_phase, version,
                approval_status, approval_token, approval_expires_at, approval_responded_at,
                next_check_at, monitor_interval_seconds, broker_error_count,
                started_at, completed_at, created_at,
                pipeline_state, result, reports, logs, agent_states, cost_breakdown,
                error_message, cancel_requested
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?, ?, ?, ?,
                ?, ?
            )
            "#,
        )
        .bind(row.id)
        .bind(row.pipeline_id)
        .bind(row.user_id)
        .bind(row.symbol)
        .bind(row.mode)
        .bind(row.status)
        .bind(row.execution_phase)
        .bind(row.version)
        .bind(row.approval_status)
        .bind(row.approval_token)
        .bind(row.approval_expires_at)
        .bind(row.approval_responded_at)
        .bind(row.next_check_at)
        .bind(row.monitor_interval_seconds)
        .bind(row.broker_error_count)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.created_at)
        .bind(row.pipeline_state)
        .bind(row.result)
        .bind(row.reports)
        .bind(row.logs)
        .bind(row.agent_states)
        .bind(row.cost_breakdown)
        .bind(row.error_message)
        .bind(row.cancel_requested)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load(&self, id: Uuid) -> Result<Execution> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StateStoreError::NotFound(id))?;

        ExecutionRow::from_db_row(&row)?.into_model()
    }

    /// Compare-and-save: the caller supplies the version it last read. The
    /// update only applies if the row is still at that version; on mismatch
    /// (another writer committed in between) the caller gets `StaleWrite` and
    /// must re-read, re-apply, re-save.
    pub async fn compare_and_save(&self, execution: &mut Execution, expected_version: i64) -> Result<()> {
        let new_version = expected_version + 1;
        execution.version = new_version;
        let row = ExecutionRow::from_model(execution)?;

        let result = sqlx::query(
            r#"
            UPDATE executions SET
                symbol = ?, mode = ?, status = ?, execution_phase = ?, version = ?,
                approval_status = ?, approval_token = ?, approval_expires_at = ?, approval_responded_at = ?,
                next_check_at = ?, monitor_interval_seconds = ?, broker_error_count = ?,
                started_at = ?, completed_at = ?,
                pipeline_state = ?, result = ?, reports = ?, logs = ?, agent_states = ?, cost_breakdown = ?,
                error_message = ?, cancel_requested = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(row.symbol)
        .bind(row.mode)
        .bind(row.status)
        .bind(row.execution_phase)
        .bind(row.version)
        .bind(row.approval_status)
        .bind(row.approval_token)
        .bind(row.approval_expires_at)
        .bind(row.approval_responded_at)
        .bind(row.next_check_at)
        .bind(row.monitor_interval_seconds)
        .bind(row.broker_error_count)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.pipeline_state)
        .bind(row.result)
        .bind(row.reports)
        .bind(row.logs)
        .bind(row.agent_states)
        .bind(row.cost_breakdown)
        .bind(row.error_message)
        .bind(row.cancel_requested)
        .bind(row.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateStoreError::StaleWrite {
                id: execution.id,
                expected: expected_version,
            });
        }

        Ok(())
    }

    /// Retry `compare_and_save` up to `max_retries` times, re-reading and
    /// re-applying `mutate` on each conflict. Bounded to avoid livelock, per
    /// the concurrency model's retry policy for `StaleWrite`.
    pub async fn compare_and_save_with_retry<F>(
        &self,
        id: Uuid,
        max_retries: u32,
        mut mutate: F,
    ) -> Result<Execution>
    where
        F: FnMut(&mut Execution),
    {
        let mut attempt = 0;
        loop {
            let mut execution = self.load(id).await?;
            let expected = execution.version;
            mutate(&mut execution);
            match self.compare_and_save(&mut execution, expected).await {
                Ok(()) => return Ok(execution),
                Err(StateStoreError::StaleWrite { .. }) if attempt < max_retries => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn list_by(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        // The `Any` driver doesn't support fully dynamic query building well,
        // so we fetch broadly and filter in-process; the indexes above keep
        // the common narrow queries (status+next_check_at, pipeline+status)
        // cheap on real backends even though this path is a full scan here.
        let rows = sqlx::query("SELECT * FROM executions").fetch_all(&self.pool).await?;

        let mut out = Vec::new();
        for row in &rows {
            let execution = ExecutionRow::from_db_row(row)?.into_model()?;

            if let Some(uid) = filter.user_id {
                if execution.user_id != uid {
                    continue;
                }
            }
            if let Some(pid) = filter.pipeline_id {
                if execution.pipeline_id != pid {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if execution.status != status {
                    continue;
                }
            }
            if let Some(ref sym) = filter.symbol {
                if &execution.symbol != sym {
                    continue;
                }
            }
            if let Some(ref token) = filter.approval_token {
                if execution.approval_token.as_deref() != Some(token.as_str()) {
                    continue;
                }
            }
            if let Some(due) = filter.due_before {
                match execution.next_check_at {
                    Some(next) if next <= due => {}
                    _ => continue,
                }
            }
            if filter.non_terminal_only && execution.status.is_terminal() {
                continue;
            }

            out.push(execution);
        }

        Ok(out)
    }

    /// Retention sweep: permanently deletes terminal executions whose
    /// `completed_at` predates `cutoff`. Never touches a non-terminal row.
    pub async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM executions
            WHERE status IN ('completed', 'failed', 'skipped', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < ?
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Flat row shape matching the `executions` table; handles the JSON
/// (de)serialization and the legacy-fallback reconstruction of
/// `PipelineState` for rows written before the `pipeline_state` column
/// existed.
struct ExecutionRow {
    id: String,
    pipeline_id: String,
    user_id: String,
    symbol: String,
    mode: String,
    status: String,
    execution_phase: String,
    version: i64,
    approval_status: String,
    approval_token: Option<String>,
    approval_expires_at: Option<String>,
    approval_responded_at: Option<String>,
    next_check_at: Option<String>,
    monitor_interval_seconds: i64,
    broker_error_count: i32,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    pipeline_state: Option<String>,
    result: Option<String>,
    reports: String,
    logs: String,
    agent_states: String,
    cost_breakdown: String,
    error_message: Option<String>,
    cancel_requested: bool,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| StateStoreError::TimestampParse(e.to_string()))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(s: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

impl ExecutionRow {
    fn from_model(e: &Execution) -> Result<Self> {
        Ok(Self {
            id: e.id.to_string(),
            pipeline_id: e.pipeline_id.to_string(),
            user_id: e.user_id.to_string(),
            symbol: e.symbol.clone(),
            mode: e.mode.as_str().to_string(),
            status: e.status.as_str().to_string(),
            execution_phase: e.execution_phase.as_str().to_string(),
            version: e.version,
            approval_status: e.approval_status.as_str().to_string(),
            approval_token: e.approval_token.clone(),
            approval_expires_at: e.approval_expires_at.map(|t| t.to_rfc3339()),
            approval_responded_at: e.approval_responded_at.map(|t| t.to_rfc3339()),
            next_check_at: e.next_check_at.map(|t| t.to_rfc3339()),
            monitor_interval_seconds: e.monitor_interval_seconds,
            broker_error_count: e.broker_error_count,
            started_at: e.started_at.map(|t| t.to_rfc3339()),
            completed_at: e.completed_at.map(|t| t.to_rfc3339()),
            created_at: e.created_at.to_rfc3339(),
            pipeline_state: e
                .pipeline_state
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            result: e.result.as_ref().map(serde_json::to_string).transpose()?,
            reports: serde_json::to_string(&e.reports)?,
            logs: serde_json::to_string(&e.logs)?,
            agent_states: serde_json::to_string(&e.agent_states)?,
            cost_breakdown: serde_json::to_string(&e.cost_breakdown)?,
            error_message: e.error_message.clone(),
            cancel_requested: e.cancel_requested,
        })
    }

    fn from_db_row(row: &sqlx::any::AnyRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            pipeline_id: row.try_get("pipeline_id")?,
            user_id: row.try_get("user_id")?,
            symbol: row.try_get("symbol")?,
            mode: row.try_get("mode")?,
            status: row.try_get("status")?,
            execution_phase: row.try_get("execution_phase")?,
            version: row.try_get("version")?,
            approval_status: row.try_get("approval_status")?,
            approval_token: row.try_get("approval_token")?,
            approval_expires_at: row.try_get("approval_expires_at")?,
            approval_responded_at: row.try_get("approval_responded_at")?,
            next_check_at: row.try_get("next_check_at")?,
            monitor_interval_seconds: row.try_get("monitor_interval_seconds")?,
            broker_error_count: row.try_get("broker_error_count")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            pipeline_state: row.try_get("pipeline_state")?,
            result: row.try_get("result")?,
            reports: row.try_get("reports")?,
            logs: row.try_get("logs")?,
            agent_states: row.try_get("agent_states")?,
            cost_breakdown: row.try_get("cost_breakdown")?,
            error_message: row.try_get("error_message")?,
            cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        })
    }

    fn into_model(self) -> Result<Execution> {
        let id: Uuid = self.id.parse().map_err(|_| StateStoreError::NotFound(Uuid::nil()))?;

        let pipeline_state = match self.pipeline_state {
            Some(raw) => Some(serde_json::from_str::<PipelineState>(&raw)?),
            None => self.reconstruct_legacy_state(id)?,
        };

        Ok(Execution {
            id,
            pipeline_id: self.pipeline_id.parse().unwrap_or_default(),
            user_id: self.user_id.parse().unwrap_or_default(),
            symbol: self.symbol,
            mode: ExecutionMode::parse(&self.mode).unwrap_or(ExecutionMode::Paper),
            status: ExecutionStatus::parse(&self.status).unwrap_or(ExecutionStatus::Failed),
            execution_phase: ExecutionPhase::parse(&self.execution_phase).unwrap_or(ExecutionPhase::Execute),
            version: self.version,
            approval_status: ApprovalStatus::parse(&self.approval_status).unwrap_or(ApprovalStatus::None),
            approval_token: self.approval_token,
            approval_expires_at: parse_ts_opt(&self.approval_expires_at)?,
            approval_responded_at: parse_ts_opt(&self.approval_responded_at)?,
            next_check_at: parse_ts_opt(&self.next_check_at)?,
            monitor_interval_seconds: self.monitor_interval_seconds,
            broker_error_count: self.broker_error_count,
            started_at: parse_ts_opt(&self.started_at)?,
            completed_at: parse_ts_opt(&self.completed_at)?,
            created_at: parse_ts(&self.created_at)?,
            pipeline_state,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            reports: serde_json::from_str(&self.reports)?,
            logs: serde_json::from_str(&self.logs)?,
            agent_states: serde_json::from_str(&self.agent_states)?,
            cost_breakdown: serde_json::from_str(&self.cost_breakdown)?,
            error_message: self.error_message,
            cancel_requested: self.cancel_requested,
        })
    }

    /// Rebuilds a minimal `PipelineState` from the derivative views
    /// (`result`, `reports`, `agent_states`, `cost_breakdown`) for executions
    /// persisted before the `pipeline_state` blob column existed. This is a
    /// best-effort reconstruction: nothing beyond what the derivative views
    /// carry can be recovered (signal/market data inputs are lost).
    fn reconstruct_legacy_state(&self, execution_id: Uuid) -> Result<Option<PipelineState>> {
        let pipeline_id = self.pipeline_id.parse().unwrap_or_default();
        let user_id = self.user_id.parse().unwrap_or_default();
        let mode = ExecutionMode::parse(&self.mode).unwrap_or(ExecutionMode::Paper);

        let mut state = PipelineState::new(pipeline_id, execution_id, user_id, self.symbol.clone(), mode);

        if let Some(result_raw) = &self.result {
            let result: Value = serde_json::from_str(result_raw)?;
            if let Some(strategy) = result.get("strategy") {
                state.strategy = Some(strategy.clone());
            }
            if let Some(risk) = result.get("risk_assessment") {
                state.risk_assessment = Some(risk.clone());
            }
            if let Some(trade) = result.get("trade_execution") {
                state.trade_execution = Some(trade.clone());
            }
        }

        let cost_breakdown: std::collections::HashMap<String, f64> =
            serde_json::from_str(&self.cost_breakdown).unwrap_or_default();
        state.agent_costs = cost_breakdown;
        state.total_cost = state.agent_costs.values().sum();

        Ok(Some(state))
    }
}
