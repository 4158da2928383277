//! Re-schedulable position monitoring: polls the broker for executions in
//! the `monitoring` phase, closes positions that have hit their stop/target,
//! and classifies broker errors into a bounded retry-with-backoff sequence
//! rather than failing the execution on the first transient error. The
//! backoff table and classification shape are the same idiom the workspace's
//! order-fill poller uses, generalized from "wait for one fill" to
//! "keep checking a position until it closes."

use std::sync::Arc;

use broker_trait::BrokerClient;
use chrono::{DateTime, Duration, Utc};
use event_bus::{Event, EventBus, EventType};
use state_store::{Execution, ExecutionFilter, ExecutionStatus, StateStore};
use uuid::Uuid;

/// How many consecutive broker errors a monitored execution tolerates before
/// it's given up on and marked `failed`.
const MAX_BROKER_ERRORS: i32 = 5;

/// Backoff schedule (seconds) applied after each consecutive broker error,
/// indexed by `broker_error_count - 1` and clamped to the last entry.
const BACKOFF_SECONDS: &[i64] = &[15, 30, 60, 120, 300];

fn backoff_for(error_count: i32) -> i64 {
    let idx = (error_count.max(1) - 1) as usize;
    BACKOFF_SECONDS[idx.min(BACKOFF_SECONDS.len() - 1)]
}

pub struct MonitorLoop {
    store: Arc<StateStore>,
    broker: Arc<dyn BrokerClient>,
    events: Arc<EventBus>,
}

impl MonitorLoop {
    pub fn new(store: Arc<StateStore>, broker: Arc<dyn BrokerClient>, events: Arc<EventBus>) -> Self {
        Self { store, broker, events }
    }

    /// Finds every `monitoring` execution whose `next_check_at` has passed
    /// and advances each independently; one execution's broker error never
    /// blocks another's poll.
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let due = self
            .store
            .list_by(&ExecutionFilter {
                status: Some(ExecutionStatus::Monitoring),
                due_before: Some(now),
                ..Default::default()
            })
            .await?;

        let communication_error_due = self
            .store
            .list_by(&ExecutionFilter {
                status: Some(ExecutionStatus::CommunicationError),
                due_before: Some(now),
                ..Default::default()
            })
            .await?;

        let mut advanced = 0;
        for execution in due.into_iter().chain(communication_error_due) {
            if let Err(e) = self.advance(execution).await {
                tracing::error!(error = %e, "monitor-loop: failed to advance execution");
            } else {
                advanced += 1;
            }
        }

        Ok(advanced)
    }

    async fn advance(&self, mut execution: Execution) -> anyhow::Result<()> {
        if execution.cancel_requested {
            return self.finish_cancelled(execution).await;
        }

        match self.broker.get_position(&execution.symbol).await {
            Ok(None) => self.finish_closed(execution, None).await,
            Ok(Some(position)) => {
                let current_price: f64 = position.current_price.parse().unwrap_or(0.0);
                let exit_reason = self.check_exit_conditions(&execution, current_price);

                if let Some(reason) = exit_reason {
                    match self.broker.close_position(&execution.symbol).await {
                        Ok(order) => {
                            self.finish_closed(execution, Some((current_price, reason, order.id))).await
                        }
                        Err(e) => self.record_broker_error(execution, e.to_string()).await,
                    }
                } else {
                    execution.status = ExecutionStatus::Monitoring;
                    execution.broker_error_count = 0;
                    execution.next_check_at = Some(Utc::now() + Duration::seconds(execution.monitor_interval_seconds));
                    self.save(&mut execution).await
                }
            }
            Err(e) => self.record_broker_error(execution, e.to_string()).await,
        }
    }

    /// Compares the broker's current price against the strategy's stop-loss
    /// and take-profit from the last completed trade_execution step. Returns
    /// the human-readable reason when an exit threshold is crossed.
    fn check_exit_conditions(&self, execution: &Execution, current_price: f64) -> Option<&'static str> {
        if current_price <= 0.0 {
            return None;
        }
        let state = execution.pipeline_state.as_ref()?;
        let strategy = state.strategy.as_ref()?;
        let side = strategy.get("side").and_then(|v| v.as_str()).unwrap_or("buy");
        let stop_loss = strategy.get("stop_loss").and_then(|v| v.as_f64())?;
        let take_profit = strategy.get("take_profit").and_then(|v| v.as_f64())?;

        if side.eq_ignore_ascii_case("sell") {
            if current_price >= stop_loss {
                return Some("stop_loss");
            }
            if current_price <= take_profit {
                return Some("take_profit");
            }
        } else {
            if current_price <= stop_loss {
                return Some("stop_loss");
            }
            if current_price >= take_profit {
                return Some("take_profit");
            }
        }
        None
    }

    async fn record_broker_error(&self, mut execution: Execution, message: String) -> anyhow::Result<()> {
        execution.broker_error_count += 1;
        tracing::warn!(execution_id = %execution.id, error = %message, count = execution.broker_error_count, "monitor-loop: broker error");

        if execution.broker_error_count >= MAX_BROKER_ERRORS {
            // Budget exhausted: stay in communication_error rather than auto-failing.
            // next_check_at = None takes the execution out of run_once's due-list until
            // a human reconciles it (janitor's sweep must leave it alone too).
            execution.status = ExecutionStatus::CommunicationError;
            execution.next_check_at = None;
            execution.error_message = Some(format!("broker unreachable after {} attempts: {message}", execution.broker_error_count));
            self.save(&mut execution).await?;
            self.emit(&execution, EventType::MonitoringStalled, serde_json::json!({ "error_message": message, "broker_error_count": execution.broker_error_count }));
        } else {
            execution.status = ExecutionStatus::CommunicationError;
            execution.next_check_at = Some(Utc::now() + Duration::seconds(backoff_for(execution.broker_error_count)));
            self.save(&mut execution).await?;
        }
        Ok(())
    }

    async fn finish_closed(&self, mut execution: Execution, exit: Option<(f64, &'static str, String)>) -> anyhow::Result<()> {
        execution.status = ExecutionStatus::Completed;
        execution.execution_phase = state_store::ExecutionPhase::Monitoring;
        execution.completed_at = Some(Utc::now());
        execution.next_check_at = None;

        let payload = match &exit {
            Some((price, reason, order_id)) => serde_json::json!({
                "symbol": execution.symbol,
                "exit_price": price,
                "reason": reason,
                "order_id": order_id,
            }),
            None => serde_json::json!({ "symbol": execution.symbol, "reason": "closed_externally" }),
        };

        self.save(&mut execution).await?;
        self.emit(&execution, EventType::PositionClosed, payload);
        Ok(())
    }

    async fn finish_cancelled(&self, mut execution: Execution) -> anyhow::Result<()> {
        if matches!(self.broker.close_position(&execution.symbol).await, Ok(_)) {
            tracing::info!(execution_id = %execution.id, "monitor-loop: cancelled execution's position closed");
        }
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(Utc::now());
        execution.next_check_at = None;
        self.save(&mut execution).await?;
        self.emit(&execution, EventType::ExecutionComplete, serde_json::json!({ "status": "cancelled" }));
        Ok(())
    }

    async fn save(&self, execution: &mut Execution) -> anyhow::Result<()> {
        let expected = execution.version;
        self.store.compare_and_save(execution, expected).await?;
        Ok(())
    }

    fn emit(&self, execution: &Execution, event_type: EventType, payload: serde_json::Value) {
        self.events.publish(Event::new(event_type, execution.id, execution.user_id, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_trait::{BrokerAccount, BrokerOrder, BrokerOrderRequest, BrokerPosition};
    use state_store::{Execution, ExecutionMode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBroker {
        position: Option<BrokerPosition>,
        errors_until: AtomicUsize,
    }

    fn fake_position(price: &str) -> BrokerPosition {
        BrokerPosition {
            symbol: "AAPL".to_string(),
            qty: "10".to_string(),
            side: "long".to_string(),
            avg_entry_price: "100".to_string(),
            market_value: "1000".to_string(),
            cost_basis: "1000".to_string(),
            unrealized_pl: "0".to_string(),
            unrealized_plpc: "0".to_string(),
            unrealized_intraday_pl: "0".to_string(),
            current_price: price.to_string(),
            lastday_price: "100".to_string(),
            change_today: "0".to_string(),
        }
    }

    fn fake_order() -> BrokerOrder {
        BrokerOrder {
            id: "order-1".to_string(),
            client_order_id: "client-1".to_string(),
            created_at: Utc::now(),
            filled_at: Some(Utc::now()),
            symbol: "AAPL".to_string(),
            qty: Some("10".to_string()),
            filled_qty: Some("10".to_string()),
            filled_avg_price: Some("95".to_string()),
            order_type: "market".to_string(),
            side: "sell".to_string(),
            status: "filled".to_string(),
        }
    }

    #[async_trait]
    impl BrokerClient for FakeBroker {
        async fn get_account(&self) -> anyhow::Result<BrokerAccount> {
            unimplemented!()
        }
        async fn get_positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            Ok(self.position.iter().cloned().collect())
        }
        async fn get_position(&self, _symbol: &str) -> anyhow::Result<Option<BrokerPosition>> {
            if self.errors_until.load(Ordering::SeqCst) > 0 {
                self.errors_until.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("broker unreachable"));
            }
            Ok(self.position.clone())
        }
        async fn submit_market_order(&self, _order: BrokerOrderRequest) -> anyhow::Result<BrokerOrder> {
            unimplemented!()
        }
        async fn get_order(&self, _order_id: &str) -> anyhow::Result<BrokerOrder> {
            unimplemented!()
        }
        async fn get_orders(&self, _limit: Option<usize>) -> anyhow::Result<Vec<BrokerOrder>> {
            unimplemented!()
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            unimplemented!()
        }
        async fn close_position(&self, _symbol: &str) -> anyhow::Result<BrokerOrder> {
            Ok(fake_order())
        }
        fn is_paper(&self) -> bool {
            true
        }
        fn broker_name(&self) -> &str {
            "fake"
        }
    }

    async fn monitored_execution(store: &StateStore, stop_loss: f64, take_profit: f64) -> Uuid {
        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 60);
        execution.status = ExecutionStatus::Monitoring;
        execution.execution_phase = state_store::ExecutionPhase::Monitoring;
        execution.next_check_at = Some(Utc::now() - Duration::seconds(1));
        if let Some(state) = execution.pipeline_state.as_mut() {
            state.strategy = Some(serde_json::json!({
                "side": "buy", "entry_price": 100.0, "stop_loss": stop_loss, "take_profit": take_profit,
            }));
        }
        let id = execution.id;
        store.create(&execution).await.unwrap();
        id
    }

    #[tokio::test]
    async fn reschedules_when_position_still_open_and_inside_band() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let id = monitored_execution(&store, 90.0, 120.0).await;
        let broker: Arc<dyn BrokerClient> = Arc::new(FakeBroker { position: Some(fake_position("100")), errors_until: AtomicUsize::new(0) });
        let monitor = MonitorLoop::new(store.clone(), broker, Arc::new(EventBus::new()));

        monitor.run_once(Utc::now()).await.unwrap();

        let execution = store.load(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Monitoring);
        assert!(execution.next_check_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn closes_position_on_stop_loss_hit() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let id = monitored_execution(&store, 90.0, 120.0).await;
        let broker: Arc<dyn BrokerClient> = Arc::new(FakeBroker { position: Some(fake_position("85")), errors_until: AtomicUsize::new(0) });
        let monitor = MonitorLoop::new(store.clone(), broker, Arc::new(EventBus::new()));

        monitor.run_once(Utc::now()).await.unwrap();

        let execution = store.load(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn records_broker_error_and_schedules_backoff() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let id = monitored_execution(&store, 90.0, 120.0).await;
        let broker: Arc<dyn BrokerClient> = Arc::new(FakeBroker { position: None, errors_until: AtomicUsize::new(100) });
        let monitor = MonitorLoop::new(store.clone(), broker, Arc::new(EventBus::new()));

        monitor.run_once(Utc::now()).await.unwrap();

        let execution = store.load(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::CommunicationError);
        assert_eq!(execution.broker_error_count, 1);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_stalls_instead_of_failing() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let id = monitored_execution(&store, 90.0, 120.0).await;
        let broker: Arc<dyn BrokerClient> = Arc::new(FakeBroker { position: None, errors_until: AtomicUsize::new(100) });
        let monitor = MonitorLoop::new(store.clone(), broker, Arc::new(EventBus::new()));

        for _ in 0..MAX_BROKER_ERRORS {
            let execution = store.load(id).await.unwrap();
            monitor.advance(execution).await.unwrap();
        }

        let execution = store.load(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::CommunicationError);
        assert!(execution.next_check_at.is_none());
        assert_eq!(execution.broker_error_count, MAX_BROKER_ERRORS);
    }
}
