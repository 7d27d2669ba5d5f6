use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

// ---------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    /// 0-indexed position within a week starting on Monday, matching the
    /// `chrono::Weekday::num_days_from_monday` convention.
    pub fn index(self) -> u32 {
        match self {
            Weekday::Mon => 0,
            Weekday::Tue => 1,
            Weekday::Wed => 2,
            Weekday::Thu => 3,
            Weekday::Fri => 4,
            Weekday::Sat => 5,
            Weekday::Sun => 6,
        }
    }

    pub fn from_chrono(w: chrono::Weekday) -> Self {
        match w {
            chrono::Weekday::Mon => Weekday::Mon,
            chrono::Weekday::Tue => Weekday::Tue,
            chrono::Weekday::Wed => Weekday::Wed,
            chrono::Weekday::Thu => Weekday::Thu,
            chrono::Weekday::Fri => Weekday::Fri,
            chrono::Weekday::Sat => Weekday::Sat,
            chrono::Weekday::Sun => Weekday::Sun,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A time-of-day hibernation window, e.g. `20:00..06:00` on `MON,TUE`.
/// `start`/`end` are `HH:MM` strings; `end < start` means the window
/// crosses midnight.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct OffHourWindow {
    pub start: String,
    pub end: String,
    pub days_of_week: Vec<Weekday>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ScheduleSpec {
    pub timezone: String,
    #[serde(default)]
    pub windows: Vec<OffHourWindow>,
}

// ---------------------------------------------------------------------
// Execution strategy
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct DagEdge {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    pub targets: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel {
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
    Dag {
        #[serde(default)]
        dependencies: Vec<DagEdge>,
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
    Staged {
        stages: Vec<StageSpec>,
        #[serde(default)]
        max_concurrency: Option<u32>,
    },
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::Sequential
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ExecutionMode {
    Strict,
    BestEffort,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Strict
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct BehaviorSpec {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub retries: u32,
}

impl Default for BehaviorSpec {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Strict,
            fail_fast: false,
            retries: 0,
        }
    }
}

// ---------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TargetSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub connector_ref: String,
    /// Opaque passthrough payload for the target's executor. The reconciler
    /// never parses this; only the admission webhook's per-type validator
    /// peeks into it, and only to surface warnings for unknown fields.
    #[serde(default)]
    pub parameters: ByteString,
}

// ---------------------------------------------------------------------
// Plan CRD
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "hibernator.io",
    version = "v1",
    kind = "Plan",
    plural = "plans",
    derive = "PartialEq",
    status = "PlanStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.currentCycleId\", \"name\": \"CYCLE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct PlanSpec {
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
    #[serde(default)]
    pub behavior: BehaviorSpec,
    #[serde(default)]
    pub suspend: bool,
    pub targets: Vec<TargetSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum PlanPhase {
    #[default]
    Pending,
    Active,
    Hibernating,
    Hibernated,
    WakingUp,
    Suspended,
    Error,
}

impl fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for PlanPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(PlanPhase::Pending),
            "Active" => Ok(PlanPhase::Active),
            "Hibernating" => Ok(PlanPhase::Hibernating),
            "Hibernated" => Ok(PlanPhase::Hibernated),
            "WakingUp" => Ok(PlanPhase::WakingUp),
            "Suspended" => Ok(PlanPhase::Suspended),
            "Error" => Ok(PlanPhase::Error),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Operation {
    Shutdown,
    Wakeup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ExecutionState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct ExecutionStatus {
    pub target: String,
    #[serde(default)]
    pub executor: String,
    #[serde(default)]
    pub state: ExecutionState,
    pub started_at: Option<Time>,
    pub finished_at: Option<Time>,
    #[serde(default)]
    pub attempts: u32,
    pub message: Option<String>,
    pub worker_ref: Option<String>,
    pub logs_ref: Option<String>,
    pub restore_ref: Option<String>,
    pub restore_config_map_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct OperationSummary {
    pub operation: Operation,
    pub start_time: Time,
    pub end_time: Option<Time>,
    #[serde(default)]
    pub target_results: Vec<ExecutionStatus>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct ExecutionCycle {
    pub cycle_id: String,
    pub shutdown: Option<OperationSummary>,
    pub wakeup: Option<OperationSummary>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ActiveExceptionRef {
    pub name: String,
    #[serde(rename = "type")]
    pub exception_type: ExceptionType,
    pub valid_from: Time,
    pub valid_until: Time,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PlanStatus {
    #[serde(default)]
    pub phase: PlanPhase,
    pub current_cycle_id: Option<String>,
    pub current_operation: Option<Operation>,
    #[serde(default)]
    pub current_stage_index: u32,
    #[serde(default)]
    pub executions: Vec<ExecutionStatus>,
    #[serde(default)]
    pub retry_count: u32,
    pub last_retry_time: Option<Time>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub active_exceptions: Vec<ActiveExceptionRef>,
    #[serde(default)]
    pub execution_history: Vec<ExecutionCycle>,
    pub suspended_at_phase: Option<PlanPhase>,
    pub next_transition_time: Option<Time>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub const MAX_ACTIVE_EXCEPTIONS: usize = 10;
pub const MAX_EXECUTION_HISTORY: usize = 5;

// ---------------------------------------------------------------------
// Exception CRD
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ExceptionType {
    Extend,
    Suspend,
    Replace,
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "hibernator.io",
    version = "v1",
    kind = "Exception",
    plural = "exceptions",
    derive = "PartialEq",
    status = "ExceptionStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.state\", \"name\": \"STATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.planRef\", \"name\": \"PLAN\", \"type\": \"string\" }"
)]
pub struct ExceptionSpec {
    pub plan_ref: String,
    #[serde(rename = "type")]
    pub exception_type: ExceptionType,
    pub valid_from: Time,
    pub valid_until: Time,
    /// Only meaningful for `type: suspend`.
    #[serde(default)]
    pub lead_time_seconds: Option<u64>,
    #[serde(default)]
    pub windows: Vec<OffHourWindow>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ExceptionPhase {
    #[default]
    Pending,
    Active,
    Expired,
}

impl fmt::Display for ExceptionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExceptionStatus {
    #[serde(default)]
    pub state: ExceptionPhase,
    pub applied_at: Option<Time>,
    pub expired_at: Option<Time>,
    pub message: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<Time>,
}

/// Arbitrary extra labels merged onto generated subresources (worker Jobs,
/// restore ConfigMaps). Kept as a free-form map rather than a CRD field so
/// adding new label conventions never requires a schema migration.
pub type ExtraLabels = BTreeMap<String, String>;
