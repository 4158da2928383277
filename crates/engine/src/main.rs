use std::sync::Arc;
use std::time::Duration;

use agent_runtime::{builtin, AgentRegistry, BrokerTool, Tool, ToolRegistry};
use alpaca_broker::AlpacaClient;
use anyhow::Result;
use approval_gate::ApprovalGate;
use broker_trait::BrokerClient;
use event_bus::EventBus;
use janitor::Janitor;
use monitor_loop::MonitorLoop;
use notification_service::{NotificationConfig, NotificationService};
use pipeline_executor::Executor;
use state_store::StateStore;
use tokio::signal::unix::SignalKind;
use tokio::time;
use trigger_dispatcher::TriggerDispatcher;

mod config;

use config::EngineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting pipeline orchestration engine");

    let config = EngineConfig::from_env()?;
    tracing::info!(
        trigger_scan_interval = config.trigger_scan_interval_seconds,
        monitor_poll_interval = config.monitor_poll_interval_seconds,
        janitor_sweep_interval = config.janitor_sweep_interval_seconds,
        approval_sweep_interval = config.approval_sweep_interval_seconds,
        max_concurrent_executions = config.max_concurrent_executions,
        "configuration loaded"
    );

    let alpaca = Arc::new(AlpacaClient::new(
        config.alpaca_api_key.clone(),
        config.alpaca_secret_key.clone(),
        config.alpaca_base_url.clone(),
    )?);

    if !alpaca.is_paper() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "ALPACA_BASE_URL points to live trading ({}). Set LIVE_TRADING_APPROVED=yes \
                 to enable, or use https://paper-api.alpaca.markets for paper.",
                alpaca.base_url()
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE — REAL MONEY AT RISK ({})", alpaca.base_url());
    } else {
        tracing::info!("Paper trading mode ({})", alpaca.base_url());
    }

    let store = Arc::new(StateStore::connect(&config.database_url).await?);
    tracing::info!("Startup check: state store OK");

    alpaca
        .get_account()
        .await
        .map_err(|e| anyhow::anyhow!("Alpaca connectivity check failed: {}", e))?;
    tracing::info!("Startup check: Alpaca OK");

    let notifications = Arc::new(NotificationService::new(&NotificationConfig::from_env()));
    let events = Arc::new(EventBus::with_notifications(notifications));

    let mut tool_registry = ToolRegistry::new();
    register_tool_factories(&mut tool_registry, alpaca.clone());

    let mut agent_registry = AgentRegistry::new(tool_registry);
    builtin::register_builtins(&mut agent_registry);
    let agent_registry = Arc::new(agent_registry);

    let executor = Arc::new(Executor::new(store.clone(), agent_registry, events.clone()));

    let dispatcher = Arc::new(
        TriggerDispatcher::new(store.clone(), executor.clone(), events.clone(), &config.database_url).await?,
    );
    let broker_client: Arc<dyn BrokerClient> = alpaca.clone();
    let monitor = MonitorLoop::new(store.clone(), broker_client, events.clone());
    let approvals = ApprovalGate::new(store.clone(), executor.clone(), events.clone());
    let janitor = Janitor::new(store.clone(), events.clone(), &config.database_url).await?;

    tracing::info!("Engine initialized. Entering main loop. Press Ctrl+C to stop.");

    let mut trigger_interval = time::interval(Duration::from_secs(config.trigger_scan_interval_seconds));
    let mut monitor_interval = time::interval(Duration::from_secs(config.monitor_poll_interval_seconds));
    let mut approval_interval = time::interval(Duration::from_secs(config.approval_sweep_interval_seconds));
    let mut janitor_interval = time::interval(Duration::from_secs(config.janitor_sweep_interval_seconds));

    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = trigger_interval.tick() => {
                match dispatcher.scan_once().await {
                    Ok(fired) if !fired.is_empty() => {
                        tracing::info!(count = fired.len(), "trigger scan dispatched executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "trigger scan failed"),
                }
            }
            _ = monitor_interval.tick() => {
                match monitor.run_once(chrono::Utc::now()).await {
                    Ok(advanced) if advanced > 0 => {
                        tracing::info!(count = advanced, "monitor loop advanced executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "monitor loop failed"),
                }
            }
            _ = approval_interval.tick() => {
                match approvals.sweep_timeouts(chrono::Utc::now()).await {
                    Ok(timed_out) if timed_out > 0 => {
                        tracing::info!(count = timed_out, "approval sweep timed out executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "approval timeout sweep failed"),
                }
            }
            _ = janitor_interval.tick() => {
                match janitor.run_sweep(chrono::Utc::now()).await {
                    Ok(report) => tracing::debug!(?report, "janitor sweep complete"),
                    Err(e) => tracing::error!(error = %e, "janitor sweep failed"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                break;
            }
        }
    }

    tracing::info!("Engine shut down.");
    Ok(())
}

/// Registers concrete tool factories. Only the broker adapter has a real
/// implementation in this workspace — fetching quotes and computing
/// indicators are out of scope, so `market_data`/`llm` tool configs are
/// accepted by pipelines but have no factory here and are skipped (logged,
/// not fatal) by `ToolRegistry::load` until a concrete adapter is wired in.
fn register_tool_factories(registry: &mut ToolRegistry, broker: Arc<AlpacaClient>) {
    registry.register("broker", move |_config| {
        let client: Arc<dyn BrokerClient> = broker.clone();
        let tool: Arc<dyn Tool> = Arc::new(BrokerTool { client });
        Ok(tool)
    });
}
