//! Pure admission-time checks for `Plan`/`Exception` specs. No I/O: the
//! handler in `mod.rs` gathers whatever live state a check needs (the
//! previous object, sibling exceptions, the referenced plan) and passes it
//! in.

use std::collections::{BTreeSet, HashSet};

use hibernator_types::{DagEdge, Exception, ExceptionPhase, ExceptionType, ExecutionStrategy, Plan, PlanPhase, TargetSpec};

use crate::schedule::parse_hhmm;
use crate::util::time_to_utc;

const MAX_EXCEPTION_DURATION_DAYS: i64 = 90;

pub fn validate_plan(existing: Option<&Plan>, incoming: &Plan) -> Result<(), String> {
    incoming
        .spec
        .schedule
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| format!("unknown timezone: {}", incoming.spec.schedule.timezone))?;

    for window in &incoming.spec.schedule.windows {
        parse_hhmm(&window.start).map_err(|e| e.to_string())?;
        parse_hhmm(&window.end).map_err(|e| e.to_string())?;
        if window.start == window.end {
            return Err(format!(
                "window start must differ from end: {} == {}",
                window.start, window.end
            ));
        }
        if window.days_of_week.is_empty() {
            return Err("window must name at least one day of week".to_string());
        }
    }

    let target_names: BTreeSet<&str> = incoming.spec.targets.iter().map(|t| t.name.as_str()).collect();
    if target_names.len() != incoming.spec.targets.len() {
        return Err("target names must be unique".to_string());
    }

    match &incoming.spec.execution_strategy {
        ExecutionStrategy::Dag { dependencies, .. } => validate_dag(dependencies, &target_names)?,
        ExecutionStrategy::Staged { stages, .. } => {
            let mut seen_names = HashSet::new();
            let mut covered: HashSet<&str> = HashSet::new();
            for stage in stages {
                if !seen_names.insert(stage.name.as_str()) {
                    return Err(format!("duplicate stage name: {}", stage.name));
                }
                for target in &stage.targets {
                    if !target_names.contains(target.as_str()) {
                        return Err(format!("stage {} references unknown target {target}", stage.name));
                    }
                    if !covered.insert(target.as_str()) {
                        return Err(format!("target {target} is assigned to more than one stage"));
                    }
                }
            }
            if covered.len() != target_names.len() {
                return Err("every target must be assigned to exactly one stage".to_string());
            }
        }
        ExecutionStrategy::Sequential | ExecutionStrategy::Parallel { .. } => {}
    }

    if let Some(existing) = existing {
        let phase = existing.status.as_ref().map(|s| s.phase).unwrap_or(PlanPhase::Pending);
        let targets_editable = matches!(phase, PlanPhase::Active | PlanPhase::Suspended | PlanPhase::Error);
        if !targets_editable && incoming.spec.targets != existing.spec.targets {
            return Err(format!(
                "targets cannot be edited while the plan is in phase {phase}; only Active, Suspended, or Error allow it"
            ));
        }
        // A Hibernating/WakingUp cycle's in-flight executions are indexed by
        // the stage list `advance_stage` compiles from `execution_strategy`
        // on every tick; re-laying it out mid-cycle would desync that index
        // from `status.executions`/`currentStageIndex`.
        if !targets_editable && incoming.spec.execution_strategy != existing.spec.execution_strategy {
            return Err(format!(
                "execution strategy cannot be edited while the plan is in phase {phase}; only Active, Suspended, or Error allow it"
            ));
        }
    }

    Ok(())
}

/// Fields a built-in target type's executor understands. A registry entry
/// missing here means the type is unrecognized by this core; that's a
/// warning, not a rejection, since an operator deployment may carry executors
/// this core was never taught about.
fn known_parameter_fields(target_type: &str) -> Option<&'static [&'static str]> {
    match target_type {
        "rds" => Some(&["instanceIdentifier", "region", "snapshotOnShutdown"]),
        "ec2" => Some(&["instanceId", "region"]),
        "generic-job" => Some(&["image", "command", "args"]),
        _ => None,
    }
}

/// Per-executor parameter validation. `TargetSpec.parameters` is opaque to
/// the reconciler, but the admission webhook still peeks at it to warn about
/// fields a target's executor wouldn't recognize — this never denies the
/// request, since parameter shape is the executor's contract, not ours.
pub fn validate_target_parameters(targets: &[TargetSpec]) -> Vec<String> {
    let mut warnings = Vec::new();
    for target in targets {
        let Some(known_fields) = known_parameter_fields(&target.target_type) else {
            warnings.push(format!(
                "target {}: type {:?} is not a recognized executor type; parameters were not validated",
                target.name, target.target_type
            ));
            continue;
        };
        if target.parameters.0.is_empty() {
            continue;
        }
        let parsed: serde_json::Value = match serde_json::from_slice(&target.parameters.0) {
            Ok(v) => v,
            Err(_) => {
                warnings.push(format!(
                    "target {}: parameters are not valid JSON; skipping field validation",
                    target.name
                ));
                continue;
            }
        };
        if let serde_json::Value::Object(fields) = parsed {
            for key in fields.keys() {
                if !known_fields.contains(&key.as_str()) {
                    warnings.push(format!(
                        "target {}: unknown parameter field {key:?} for type {:?}",
                        target.name, target.target_type
                    ));
                }
            }
        }
    }
    warnings
}

fn validate_dag(dependencies: &[DagEdge], target_names: &BTreeSet<&str>) -> Result<(), String> {
    for edge in dependencies {
        if edge.from == edge.to {
            return Err(format!("self-referential dependency: {} -> {}", edge.from, edge.to));
        }
        if !target_names.contains(edge.from.as_str()) {
            return Err(format!("dependency references unknown target: {}", edge.from));
        }
        if !target_names.contains(edge.to.as_str()) {
            return Err(format!("dependency references unknown target: {}", edge.to));
        }
    }

    // Kahn's algorithm, mirroring `planner::dag_stages`, purely to detect a
    // cycle before it reaches the reconciler.
    use std::collections::BTreeMap;
    let mut indegree: BTreeMap<&str, u32> = target_names.iter().map(|&n| (n, 0)).collect();
    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in dependencies {
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
    }
    let mut remaining = indegree;
    let total = remaining.len();
    let mut placed = 0usize;
    while placed < total {
        let layer: Vec<&str> = remaining.iter().filter(|&(_, &d)| d == 0).map(|(&n, _)| n).collect();
        if layer.is_empty() {
            return Err("dependency graph contains a cycle".to_string());
        }
        for n in &layer {
            remaining.remove(n);
        }
        for n in &layer {
            if let Some(next) = adjacency.get(n) {
                for m in next {
                    if let Some(d) = remaining.get_mut(m) {
                        *d = d.saturating_sub(1);
                    }
                }
            }
        }
        placed += layer.len();
    }
    Ok(())
}

pub fn validate_exception(plan: Option<&Plan>, exception: &Exception, siblings: &[Exception]) -> Result<(), String> {
    if plan.is_none() {
        return Err(format!(
            "planRef {} does not name an existing Plan in this namespace",
            exception.spec.plan_ref
        ));
    }

    let valid_from = time_to_utc(&exception.spec.valid_from);
    let valid_until = time_to_utc(&exception.spec.valid_until);
    if valid_until <= valid_from {
        return Err("validUntil must be after validFrom".to_string());
    }
    if (valid_until - valid_from).num_days() > MAX_EXCEPTION_DURATION_DAYS {
        return Err(format!(
            "exception window exceeds the {MAX_EXCEPTION_DURATION_DAYS}-day maximum duration"
        ));
    }

    if exception.spec.lead_time_seconds.is_some() && exception.spec.exception_type != ExceptionType::Suspend {
        return Err("leadTimeSeconds is only meaningful for type: suspend".to_string());
    }

    let candidate_name = exception.metadata.name.clone().unwrap_or_default();
    for other in siblings {
        let other_name = other.metadata.name.clone().unwrap_or_default();
        if other_name == candidate_name || other.spec.plan_ref != exception.spec.plan_ref {
            continue;
        }
        let other_phase = other.status.as_ref().map(|s| s.state).unwrap_or(ExceptionPhase::Pending);
        if other_phase == ExceptionPhase::Expired {
            continue;
        }
        let other_from = time_to_utc(&other.spec.valid_from);
        let other_until = time_to_utc(&other.spec.valid_until);
        if valid_from < other_until && other_from < valid_until {
            return Err(format!("overlaps non-expired exception {other_name} for the same plan"));
        }
    }

    Ok(())
}
