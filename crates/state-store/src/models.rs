use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Execution lifecycle status. See the status machine in the component design:
/// `pending -> running -> {awaiting_approval <-> running} -> {completed|failed|skipped|monitoring|cancelled}`
/// and `monitoring <-> communication_error <-> monitoring -> {completed|failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    AwaitingApproval,
    Monitoring,
    CommunicationError,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::AwaitingApproval => "awaiting_approval",
            ExecutionStatus::Monitoring => "monitoring",
            ExecutionStatus::CommunicationError => "communication_error",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ExecutionStatus::Pending,
            "running" => ExecutionStatus::Running,
            "awaiting_approval" => ExecutionStatus::AwaitingApproval,
            "monitoring" => ExecutionStatus::Monitoring,
            "communication_error" => ExecutionStatus::CommunicationError,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "skipped" => ExecutionStatus::Skipped,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    Paper,
    Simulation,
    Validation,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Live => "live",
            ExecutionMode::Paper => "paper",
            ExecutionMode::Simulation => "simulation",
            ExecutionMode::Validation => "validation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "live" => ExecutionMode::Live,
            "paper" => ExecutionMode::Paper,
            "simulation" => ExecutionMode::Simulation,
            "validation" => ExecutionMode::Validation,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Execute,
    Monitoring,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Execute => "execute",
            ExecutionPhase::Monitoring => "monitoring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "execute" => ExecutionPhase::Execute,
            "monitoring" => ExecutionPhase::Monitoring,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::None => "none",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => ApprovalStatus::None,
            "pending" => ApprovalStatus::Pending,
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            "timed_out" => ApprovalStatus::TimedOut,
            _ => return None,
        })
    }
}

/// One entry in `Execution.agent_states`: the per-node run record the executor
/// maintains as it walks the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateEntry {
    pub agent_id: String,
    pub agent_type: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReportMetric {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub agent_type: String,
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub status: String,
    #[serde(default)]
    pub metrics: Vec<AgentReportMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub agent_id: String,
    pub level: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The envelope passed between agents within one execution; embedded verbatim
/// as `Execution.pipeline_state`. All fields round-trip losslessly through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: Uuid,
    pub execution_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub mode: ExecutionMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data: Option<Value>,

    #[serde(default)]
    pub biases: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_execution: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_position: Option<Value>,

    #[serde(default)]
    pub trigger_met: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<String>,

    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub agent_costs: HashMap<String, f64>,

    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub execution_log: Vec<LogEntry>,

    #[serde(default)]
    pub agent_reports: HashMap<String, AgentReport>,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_phase: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_interval_seconds: Option<i64>,
}

impl Default for ExecutionPhase {
    fn default() -> Self {
        ExecutionPhase::Execute
    }
}

impl PipelineState {
    pub fn new(
        pipeline_id: Uuid,
        execution_id: Uuid,
        user_id: Uuid,
        symbol: impl Into<String>,
        mode: ExecutionMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id,
            execution_id,
            user_id,
            symbol: symbol.into(),
            mode,
            signal_data: None,
            market_data: None,
            biases: HashMap::new(),
            strategy: None,
            risk_assessment: None,
            trade_execution: None,
            current_position: None,
            trigger_met: false,
            trigger_reason: None,
            total_cost: 0.0,
            agent_costs: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            execution_log: Vec::new(),
            agent_reports: HashMap::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            execution_phase: ExecutionPhase::Execute,
            monitor_interval_seconds: None,
        }
    }

    pub fn add_log(&mut self, agent_id: impl Into<String>, message: impl Into<String>, level: &str) {
        self.execution_log.push(LogEntry {
            agent_id: agent_id.into(),
            level: level.to_string(),
            message: message.into(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Track cost for an agent and keep `total_cost` as the sum of `agent_costs`
    /// (invariant 6 in the data model).
    pub fn add_cost(&mut self, agent_id: impl Into<String>, cost: f64) {
        let entry = self.agent_costs.entry(agent_id.into()).or_insert(0.0);
        *entry += cost;
        self.total_cost = self.agent_costs.values().sum();
        self.updated_at = Utc::now();
    }
}

/// The persisted unit of work: one row per pipeline run for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub execution_phase: ExecutionPhase,
    pub version: i64,

    pub approval_status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_responded_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check_at: Option<DateTime<Utc>>,
    pub monitor_interval_seconds: i64,
    #[serde(default)]
    pub broker_error_count: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_state: Option<PipelineState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub reports: Vec<AgentReport>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub agent_states: Vec<AgentStateEntry>,
    #[serde(default)]
    pub cost_breakdown: HashMap<String, f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Execution {
    pub fn new_pending(
        pipeline_id: Uuid,
        user_id: Uuid,
        symbol: impl Into<String>,
        mode: ExecutionMode,
        monitor_interval_seconds: i64,
    ) -> Self {
        let id = Uuid::new_v4();
        let symbol = symbol.into();
        Self {
            id,
            pipeline_id,
            user_id,
            symbol: symbol.clone(),
            mode,
            status: ExecutionStatus::Pending,
            execution_phase: ExecutionPhase::Execute,
            version: 0,
            approval_status: ApprovalStatus::None,
            approval_token: None,
            approval_expires_at: None,
            approval_responded_at: None,
            next_check_at: None,
            monitor_interval_seconds,
            broker_error_count: 0,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            pipeline_state: Some(PipelineState::new(pipeline_id, id, user_id, symbol, mode)),
            result: None,
            reports: Vec::new(),
            logs: Vec::new(),
            agent_states: Vec::new(),
            cost_breakdown: HashMap::new(),
            error_message: None,
            cancel_requested: false,
        }
    }

    /// Invariant 4: `next_check_at` is non-null iff the execution is in
    /// `monitoring`, or in `communication_error` with retries still pending.
    pub fn expects_scheduled_poll(&self) -> bool {
        self.next_check_at.is_some()
    }
}
