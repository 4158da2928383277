//! Periodic scan of active pipelines that enqueues new executions, and the
//! signal-intake entry point that does the same thing off-cycle.
//!
//! A pipeline's own definition (its graph, ticker universe, trigger mode) is
//! a thin record this crate owns in its own table, mirroring the janitor's
//! self-migrated `user_budgets` table: no pipeline-authoring crate exists in
//! this workspace, so the dispatcher is the natural place to keep the
//! minimal slice of pipeline metadata it needs to decide what to fire.

use std::sync::Arc;

use chrono::Utc;
use event_bus::EventBus;
use pipeline_executor::{Executor, PipelineConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use state_store::{Execution, ExecutionFilter, ExecutionMode, StateStore};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Periodic,
    Signal,
}

impl TriggerMode {
    fn as_str(self) -> &'static str {
        match self {
            TriggerMode::Periodic => "periodic",
            TriggerMode::Signal => "signal",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "signal" => TriggerMode::Signal,
            _ => TriggerMode::Periodic,
        }
    }
}

/// The slice of a pipeline's definition the dispatcher needs: who owns it,
/// how it's triggered, what tickers it watches, and the graph to hand the
/// executor once a new execution is created.
#[derive(Debug, Clone)]
pub struct PipelineRecord {
    pub pipeline_id: Uuid,
    pub user_id: Uuid,
    pub is_active: bool,
    pub trigger_mode: TriggerMode,
    pub tickers: Vec<String>,
    pub monitor_interval_seconds: i64,
    pub mode: ExecutionMode,
    pub config: PipelineConfig,
}

pub struct TriggerDispatcher {
    store: Arc<StateStore>,
    executor: Arc<Executor>,
    #[allow(dead_code)]
    events: Arc<EventBus>,
    pipelines: AnyPool,
}

impl TriggerDispatcher {
    pub async fn new(
        store: Arc<StateStore>,
        executor: Arc<Executor>,
        events: Arc<EventBus>,
        database_url: &str,
    ) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();
        let pipelines = AnyPoolOptions::new().max_connections(5).connect(database_url).await?;
        Self::migrate(&pipelines).await?;
        Ok(Self { store, executor, events, pipelines })
    }

    #[cfg(test)]
    async fn with_pool(store: Arc<StateStore>, executor: Arc<Executor>, pool: AnyPool) -> anyhow::Result<Self> {
        Self::migrate(&pool).await?;
        Ok(Self { store, executor, events: Arc::new(EventBus::new()), pipelines: pool })
    }

    async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatcher_pipelines (
                pipeline_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                trigger_mode TEXT NOT NULL,
                tickers TEXT NOT NULL,
                monitor_interval_seconds INTEGER NOT NULL,
                mode TEXT NOT NULL,
                config TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Upserts a pipeline's dispatcher-visible definition. Called by whatever
    /// owns pipeline authoring (the api-server) whenever a pipeline is
    /// created, edited, activated, or deactivated.
    pub async fn register_pipeline(&self, record: &PipelineRecord) -> anyhow::Result<()> {
        let tickers = serde_json::to_string(&record.tickers)?;
        let config = serde_json::to_string(&record.config)?;

        sqlx::query(
            r#"
            INSERT INTO dispatcher_pipelines
                (pipeline_id, user_id, is_active, trigger_mode, tickers, monitor_interval_seconds, mode, config)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pipeline_id) DO UPDATE SET
                user_id = excluded.user_id,
                is_active = excluded.is_active,
                trigger_mode = excluded.trigger_mode,
                tickers = excluded.tickers,
                monitor_interval_seconds = excluded.monitor_interval_seconds,
                mode = excluded.mode,
                config = excluded.config
            "#,
        )
        .bind(record.pipeline_id.to_string())
        .bind(record.user_id.to_string())
        .bind(record.is_active as i64)
        .bind(record.trigger_mode.as_str())
        .bind(tickers)
        .bind(record.monitor_interval_seconds)
        .bind(record.mode.as_str())
        .bind(config)
        .execute(&self.pipelines)
        .await?;

        Ok(())
    }

    /// Reads back a pipeline's dispatcher-visible definition. Exposed so the
    /// api-server can resolve the `PipelineConfig` an execution needs to
    /// resume after approval, without either binary calling into the other.
    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> anyhow::Result<Option<PipelineRecord>> {
        self.load_pipeline(pipeline_id).await
    }

    async fn load_pipeline(&self, pipeline_id: Uuid) -> anyhow::Result<Option<PipelineRecord>> {
        let row = sqlx::query("SELECT * FROM dispatcher_pipelines WHERE pipeline_id = ?")
            .bind(pipeline_id.to_string())
            .fetch_optional(&self.pipelines)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    fn row_to_record(row: &AnyRow) -> anyhow::Result<PipelineRecord> {
        let tickers: String = row.try_get("tickers")?;
        let config: String = row.try_get("config")?;
        let mode: String = row.try_get("mode")?;

        Ok(PipelineRecord {
            pipeline_id: row.try_get::<String, _>("pipeline_id")?.parse()?,
            user_id: row.try_get::<String, _>("user_id")?.parse()?,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            trigger_mode: TriggerMode::parse(&row.try_get::<String, _>("trigger_mode")?),
            tickers: serde_json::from_str(&tickers)?,
            monitor_interval_seconds: row.try_get("monitor_interval_seconds")?,
            mode: ExecutionMode::parse(&mode).unwrap_or(ExecutionMode::Paper),
            config: serde_json::from_str(&config)?,
        })
    }

    /// Scans every active `periodic` pipeline and fires a new execution for
    /// each (pipeline, ticker) pair that isn't already running. Returns the
    /// ids of newly created executions (spawned, not yet necessarily done).
    pub async fn scan_once(&self) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT * FROM dispatcher_pipelines WHERE is_active = 1 AND trigger_mode = 'periodic'")
            .fetch_all(&self.pipelines)
            .await?;

        let mut fired = Vec::new();
        for row in &rows {
            let record = match Self::row_to_record(row) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "dispatcher: failed to decode pipeline row, skipping");
                    continue;
                }
            };

            for ticker in &record.tickers {
                match self.dispatch(&record, ticker, None).await {
                    Ok(Some(id)) => fired.push(id),
                    Ok(None) => {}
                    Err(e) => tracing::error!(
                        pipeline_id = %record.pipeline_id,
                        symbol = %ticker,
                        error = %e,
                        "dispatcher: failed to dispatch"
                    ),
                }
            }
        }

        Ok(fired)
    }

    /// Entry point for signal-triggered pipelines: bypasses the periodic
    /// scan and the pipeline's own ticker universe, carrying `signal_data`
    /// straight into the new execution's pipeline state. Still honors the
    /// per-(pipeline, symbol) single-flight lock.
    pub async fn dispatch_signal(&self, pipeline_id: Uuid, symbol: &str, signal_data: Value) -> anyhow::Result<Option<Uuid>> {
        let record = match self.load_pipeline(pipeline_id).await? {
            Some(r) if r.is_active => r,
            _ => return Ok(None),
        };

        self.dispatch(&record, symbol, Some(signal_data)).await
    }

    /// Single-flight check plus execution creation, shared by the periodic
    /// scan and signal intake. An active (non-terminal) execution for this
    /// (pipeline, symbol) pair acts as the pipeline-wide lock: a pending
    /// duplicate is silently skipped, not an error.
    async fn dispatch(&self, record: &PipelineRecord, symbol: &str, signal_data: Option<Value>) -> anyhow::Result<Option<Uuid>> {
        let existing = self
            .store
            .list_by(&ExecutionFilter {
                pipeline_id: Some(record.pipeline_id),
                symbol: Some(symbol.to_string()),
                non_terminal_only: true,
                ..Default::default()
            })
            .await?;

        if !existing.is_empty() {
            return Ok(None);
        }

        let mut execution = Execution::new_pending(
            record.pipeline_id,
            record.user_id,
            symbol,
            record.mode,
            record.monitor_interval_seconds,
        );

        if let (Some(data), Some(state)) = (signal_data, execution.pipeline_state.as_mut()) {
            state.signal_data = Some(data);
        }

        let execution_id = execution.id;
        self.store.create(&execution).await?;

        let executor = self.executor.clone();
        let config = record.config.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.run(execution_id, &config).await {
                tracing::error!(execution_id = %execution_id, error = %e, "dispatcher: executor run failed");
            }
        });

        Ok(Some(execution_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime::{builtin, AgentRegistry, PipelineNode, ToolRegistry};
    use pipeline_executor::Edge;
    use std::collections::HashMap;

    fn registry() -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new(ToolRegistry::new());
        builtin::register_builtins(&mut registry);
        Arc::new(registry)
    }

    fn always_completes_config(pipeline_id: Uuid) -> PipelineConfig {
        PipelineConfig {
            pipeline_id,
            nodes: vec![PipelineNode {
                id: "trigger".to_string(),
                agent_type: "time_trigger".to_string(),
                config: HashMap::from([("always".to_string(), serde_json::json!(true))]),
                tools: vec![],
            }],
            edges: vec![],
            approval_ttl_seconds: 3600,
        }
    }

    async fn setup() -> (Arc<StateStore>, TriggerDispatcher) {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventBus::new());
        let executor = Arc::new(Executor::new(store.clone(), registry(), events.clone()));

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let dispatcher = TriggerDispatcher::with_pool(store.clone(), executor, pool).await.unwrap();
        (store, dispatcher)
    }

    #[tokio::test]
    async fn fires_one_execution_per_ticker() {
        let (store, dispatcher) = setup().await;
        let pipeline_id = Uuid::new_v4();

        dispatcher
            .register_pipeline(&PipelineRecord {
                pipeline_id,
                user_id: Uuid::new_v4(),
                is_active: true,
                trigger_mode: TriggerMode::Periodic,
                tickers: vec!["AAPL".to_string(), "MSFT".to_string()],
                monitor_interval_seconds: 300,
                mode: ExecutionMode::Paper,
                config: always_completes_config(pipeline_id),
            })
            .await
            .unwrap();

        let fired = dispatcher.scan_once().await.unwrap();
        assert_eq!(fired.len(), 2);

        let all = store
            .list_by(&ExecutionFilter { pipeline_id: Some(pipeline_id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn single_flight_skips_duplicate_for_same_symbol() {
        let (store, dispatcher) = setup().await;
        let pipeline_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        dispatcher
            .register_pipeline(&PipelineRecord {
                pipeline_id,
                user_id,
                is_active: true,
                trigger_mode: TriggerMode::Periodic,
                tickers: vec!["AAPL".to_string()],
                monitor_interval_seconds: 300,
                mode: ExecutionMode::Paper,
                config: always_completes_config(pipeline_id),
            })
            .await
            .unwrap();

        // Simulate an execution already in flight for (pipeline, AAPL).
        let mut existing = Execution::new_pending(pipeline_id, user_id, "AAPL", ExecutionMode::Paper, 300);
        existing.status = state_store::ExecutionStatus::Monitoring;
        store.create(&existing).await.unwrap();

        let fired = dispatcher.scan_once().await.unwrap();
        assert!(fired.is_empty());

        let all = store
            .list_by(&ExecutionFilter { pipeline_id: Some(pipeline_id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn inactive_pipeline_is_never_scanned() {
        let (store, dispatcher) = setup().await;
        let pipeline_id = Uuid::new_v4();

        dispatcher
            .register_pipeline(&PipelineRecord {
                pipeline_id,
                user_id: Uuid::new_v4(),
                is_active: false,
                trigger_mode: TriggerMode::Periodic,
                tickers: vec!["AAPL".to_string()],
                monitor_interval_seconds: 300,
                mode: ExecutionMode::Paper,
                config: always_completes_config(pipeline_id),
            })
            .await
            .unwrap();

        let fired = dispatcher.scan_once().await.unwrap();
        assert!(fired.is_empty());

        let all = store
            .list_by(&ExecutionFilter { pipeline_id: Some(pipeline_id), ..Default::default() })
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn signal_dispatch_seeds_signal_data_and_honors_single_flight() {
        let (store, dispatcher) = setup().await;
        let pipeline_id = Uuid::new_v4();

        dispatcher
            .register_pipeline(&PipelineRecord {
                pipeline_id,
                user_id: Uuid::new_v4(),
                is_active: true,
                trigger_mode: TriggerMode::Signal,
                tickers: vec![],
                monitor_interval_seconds: 300,
                mode: ExecutionMode::Paper,
                config: always_completes_config(pipeline_id),
            })
            .await
            .unwrap();

        let fired = dispatcher
            .dispatch_signal(pipeline_id, "TSLA", serde_json::json!({ "signal_type": "golden_cross" }))
            .await
            .unwrap();
        assert!(fired.is_some());

        let second = dispatcher
            .dispatch_signal(pipeline_id, "TSLA", serde_json::json!({ "signal_type": "golden_cross" }))
            .await
            .unwrap();
        assert!(second.is_none());

        let all = store
            .list_by(&ExecutionFilter { pipeline_id: Some(pipeline_id), symbol: Some("TSLA".to_string()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
