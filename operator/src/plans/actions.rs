//! Write-phase helpers for the `Plan` reconciler. Each function performs one
//! state machine transition: read what it needs, do any required I/O
//! (worker launch/observe, restore store), then patch `status` once.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use hibernator_types::{
    ActiveExceptionRef, Exception, ExceptionPhase, ExecutionCycle, ExecutionState, ExecutionStatus,
    MAX_ACTIVE_EXCEPTIONS, MAX_EXECUTION_HISTORY, Operation, OperationSummary, Plan, PlanPhase, PlanStatus,
};

use super::reconcile::ContextData;
use crate::planner;
use crate::restore::RestoreKey;
use crate::util::status::update_status;
use crate::util::{Error, time_to_utc};
use crate::worker::{WorkerRequest, WorkerState};

fn now_time() -> Time {
    Time::from(k8s_openapi::jiff::Timestamp::now())
}

pub async fn activate(ctx: Arc<ContextData>, namespace: &str, name: &str) -> Result<(), Error> {
    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, |s| {
        s.phase = PlanPhase::Active;
        s.error_message = None;
    })
    .await?;
    Ok(())
}

pub async fn suspend(ctx: Arc<ContextData>, plan: &Plan, namespace: &str, name: &str) -> Result<(), Error> {
    let current_phase = plan.status.as_ref().map(|s| s.phase).unwrap_or(PlanPhase::Pending);
    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
        s.suspended_at_phase = Some(current_phase);
        s.phase = PlanPhase::Suspended;
    })
    .await?;
    Ok(())
}

pub async fn resume(
    ctx: Arc<ContextData>,
    plan: &Plan,
    namespace: &str,
    name: &str,
    force_wake: bool,
    fallback_to_active: bool,
) -> Result<(), Error> {
    if force_wake {
        // A restore artifact exists for at least one target and the schedule
        // is Active again: forcibly finish the interrupted hibernation by
        // running the plan's targets through a Wakeup, rather than leaving
        // them hibernated until the next off-hours window closes.
        start_operation(ctx, plan, namespace, name, Operation::Wakeup).await
    } else if fallback_to_active {
        // The schedule is Active again but no restore data survived for any
        // target, so there's nothing for a Wakeup to restore: skip straight
        // to Active rather than leaving the plan stuck back in its old
        // mid-operation phase with no operation left to advance.
        update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, |s| {
            s.phase = PlanPhase::Active;
            s.suspended_at_phase = None;
            s.current_operation = None;
            s.current_stage_index = 0;
            s.executions = Vec::new();
        })
        .await?;
        Ok(())
    } else {
        let resumed_phase = plan
            .status
            .as_ref()
            .and_then(|s| s.suspended_at_phase)
            .unwrap_or(PlanPhase::Active);
        update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
            s.phase = resumed_phase;
            s.suspended_at_phase = None;
        })
        .await?;
        Ok(())
    }
}

/// Whether at least one of the plan's targets has a surviving restore
/// artifact. Consulted before force-waking an unsuspended plan that was
/// mid-hibernation: with nothing to restore, a Wakeup has no work to do.
pub async fn any_restore_data_exists(
    ctx: Arc<ContextData>,
    namespace: &str,
    name: &str,
    plan: &Plan,
) -> Result<bool, Error> {
    for target in &plan.spec.targets {
        let key = RestoreKey {
            namespace: namespace.to_string(),
            plan: name.to_string(),
            target: target.name.clone(),
        };
        if ctx.restore.has(&key).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub async fn start_operation(
    ctx: Arc<ContextData>,
    plan: &Plan,
    namespace: &str,
    name: &str,
    operation: Operation,
) -> Result<(), Error> {
    let stages = match planner::compile(&plan.spec.execution_strategy, &plan.spec.targets, operation) {
        Ok(stages) => stages,
        Err(e) => return transition_to_error(ctx, namespace, name, e.to_string()).await,
    };
    if stages.is_empty() {
        // No targets: nothing to do, settle directly into the terminal phase.
        let terminal = match operation {
            Operation::Shutdown => PlanPhase::Hibernated,
            Operation::Wakeup => PlanPhase::Active,
        };
        update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
            s.phase = terminal;
            s.current_operation = None;
            s.current_stage_index = 0;
            s.executions = Vec::new();
        })
        .await?;
        return Ok(());
    }

    let cycle_id = match operation {
        Operation::Shutdown => uuid::Uuid::new_v4().to_string(),
        Operation::Wakeup => plan
            .status
            .as_ref()
            .and_then(|s| s.current_cycle_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    };

    let executions: Vec<ExecutionStatus> = plan
        .spec
        .targets
        .iter()
        .map(|t| ExecutionStatus {
            target: t.name.clone(),
            ..Default::default()
        })
        .collect();

    let generation = plan.meta().generation.unwrap_or(0);
    let new_phase = match operation {
        Operation::Shutdown => PlanPhase::Hibernating,
        Operation::Wakeup => PlanPhase::WakingUp,
    };

    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
        s.phase = new_phase;
        s.current_cycle_id = Some(cycle_id.clone());
        s.current_operation = Some(operation);
        s.current_stage_index = 0;
        s.executions = executions.clone();
        s.retry_count = 0;
        s.last_retry_time = None;
        s.error_message = None;
        s.suspended_at_phase = None;
        s.observed_generation = generation;
    })
    .await?;
    Ok(())
}

/// One tick of in-flight stage execution: launch newly-eligible targets up
/// to the stage's concurrency cap, observe targets already running, and
/// advance the stage/operation when the completion rule for the behavior
/// mode is satisfied.
pub async fn advance_stage(ctx: Arc<ContextData>, plan: &Plan, namespace: &str, name: &str) -> Result<(), Error> {
    let status = plan.status.clone().unwrap_or_default();
    let Some(operation) = status.current_operation else {
        return transition_to_error(ctx, namespace, name, "no active operation to advance".to_string()).await;
    };

    let stages = match planner::compile(&plan.spec.execution_strategy, &plan.spec.targets, operation) {
        Ok(stages) => stages,
        Err(e) => return transition_to_error(ctx, namespace, name, e.to_string()).await,
    };

    let stage_idx = status.current_stage_index as usize;
    let Some(stage) = stages.get(stage_idx) else {
        return transition_to_error(ctx, namespace, name, "stage index out of range".to_string()).await;
    };

    let mut executions = status.executions.clone();
    let now = Utc::now();
    let cap = stage.max_concurrency.unwrap_or(u32::MAX) as usize;
    let cycle_id = status
        .current_cycle_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let running_count = stage
        .targets
        .iter()
        .filter_map(|t| executions.iter().find(|e| &e.target == t))
        .filter(|e| e.state == ExecutionState::Running)
        .count();
    let mut available = cap.saturating_sub(running_count);

    for target_name in &stage.targets {
        if available == 0 {
            break;
        }
        let Some(idx) = executions.iter().position(|e| &e.target == target_name) else {
            continue;
        };
        if executions[idx].state != ExecutionState::Pending {
            continue;
        }
        if let Some(started_at) = &executions[idx].started_at
            && executions[idx].attempts > 0
        {
            let gate = time_to_utc(started_at) + jittered_backoff(executions[idx].attempts, name, target_name);
            if now < gate {
                continue;
            }
        }
        let Some(target_spec) = plan.spec.targets.iter().find(|t| &t.name == target_name) else {
            continue;
        };
        let req = WorkerRequest {
            namespace: namespace.to_string(),
            plan: name.to_string(),
            target: target_name.clone(),
            target_type: target_spec.target_type.clone(),
            connector_ref: target_spec.connector_ref.clone(),
            parameters: target_spec.parameters.0.clone(),
            operation,
            cycle_id: cycle_id.clone(),
            attempt: executions[idx].attempts + 1,
        };
        let worker_ref = ctx.workers.launch(&req).await?;
        executions[idx].state = ExecutionState::Running;
        executions[idx].attempts += 1;
        executions[idx].started_at = Some(now_time());
        executions[idx].worker_ref = Some(worker_ref);
        executions[idx].message = None;
        available -= 1;
    }

    let mut strict_failure: Option<String> = None;
    for target_name in &stage.targets {
        let Some(idx) = executions.iter().position(|e| &e.target == target_name) else {
            continue;
        };
        if executions[idx].state != ExecutionState::Running {
            continue;
        }
        let Some(worker_ref) = executions[idx].worker_ref.clone() else {
            continue;
        };
        match ctx.workers.observe(namespace, &worker_ref).await? {
            WorkerState::Succeeded => {
                let key = RestoreKey {
                    namespace: namespace.to_string(),
                    plan: name.to_string(),
                    target: target_name.clone(),
                };
                match operation {
                    Operation::Shutdown => {
                        if ctx.restore.has(&key).await.map_err(|_| Error::Storage(format!(
                            "failed probing restore state for {target_name}"
                        )))? {
                            executions[idx].restore_config_map_ref = Some(key.config_map_name());
                        }
                    }
                    Operation::Wakeup => {
                        ctx.restore
                            .delete(&key)
                            .await
                            .map_err(|_| Error::Storage(format!("failed clearing restore state for {target_name}")))?;
                        executions[idx].restore_config_map_ref = None;
                    }
                }
                executions[idx].state = ExecutionState::Completed;
                executions[idx].finished_at = Some(now_time());
            }
            WorkerState::Failed => {
                let retries_allowed = plan.spec.behavior.retries;
                if executions[idx].attempts <= retries_allowed {
                    executions[idx].state = ExecutionState::Pending;
                    executions[idx].worker_ref = None;
                } else if plan.spec.behavior.mode == hibernator_types::ExecutionMode::BestEffort
                    && !plan.spec.behavior.fail_fast
                {
                    executions[idx].state = ExecutionState::Failed;
                    executions[idx].finished_at = Some(now_time());
                    executions[idx].message = Some(format!("{target_name} exhausted retries"));
                } else {
                    executions[idx].state = ExecutionState::Failed;
                    executions[idx].finished_at = Some(now_time());
                    executions[idx].message = Some(format!("{target_name} exhausted retries"));
                    strict_failure = Some(target_name.clone());
                }
            }
            WorkerState::Running | WorkerState::Pending => {}
        }
    }

    if let Some(failed_target) = strict_failure {
        persist_executions(ctx.clone(), namespace, name, executions).await?;
        return transition_to_error(
            ctx,
            namespace,
            name,
            format!("target {failed_target} failed and execution mode is strict"),
        )
        .await;
    }

    let stage_done = stage.targets.iter().all(|t| {
        executions
            .iter()
            .find(|e| &e.target == t)
            .map(|e| match plan.spec.behavior.mode {
                hibernator_types::ExecutionMode::Strict => e.state == ExecutionState::Completed,
                hibernator_types::ExecutionMode::BestEffort => {
                    matches!(e.state, ExecutionState::Completed | ExecutionState::Failed)
                }
            })
            .unwrap_or(false)
    });

    if !stage_done {
        persist_executions(ctx, namespace, name, executions).await?;
        return Ok(());
    }

    if stage_idx + 1 < stages.len() {
        let next_index = stage_idx as u32 + 1;
        update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
            s.current_stage_index = next_index;
            s.executions = executions.clone();
        })
        .await?;
        return Ok(());
    }

    complete_operation(ctx, plan, namespace, name, operation, cycle_id, executions).await
}

async fn persist_executions(
    ctx: Arc<ContextData>,
    namespace: &str,
    name: &str,
    executions: Vec<ExecutionStatus>,
) -> Result<(), Error> {
    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
        s.executions = executions.clone();
    })
    .await?;
    Ok(())
}

async fn complete_operation(
    ctx: Arc<ContextData>,
    plan: &Plan,
    namespace: &str,
    name: &str,
    operation: Operation,
    cycle_id: String,
    executions: Vec<ExecutionStatus>,
) -> Result<(), Error> {
    let success = executions.iter().all(|e| e.state == ExecutionState::Completed);
    let start_time = executions
        .iter()
        .filter_map(|e| e.started_at.clone())
        .min_by_key(|t| t.0)
        .unwrap_or_else(now_time);

    let summary = OperationSummary {
        operation,
        start_time,
        end_time: Some(now_time()),
        target_results: executions.clone(),
        success,
        error_message: if success {
            None
        } else {
            Some("one or more targets failed under best-effort execution".to_string())
        },
    };

    let new_phase = match operation {
        Operation::Shutdown => PlanPhase::Hibernated,
        Operation::Wakeup => PlanPhase::Active,
    };

    let mut history = plan.status.as_ref().map(|s| s.execution_history.clone()).unwrap_or_default();
    if let Some(entry) = history.iter_mut().find(|c| c.cycle_id == cycle_id) {
        match operation {
            Operation::Shutdown => entry.shutdown = Some(summary.clone()),
            Operation::Wakeup => entry.wakeup = Some(summary.clone()),
        }
    } else {
        let mut entry = ExecutionCycle {
            cycle_id: cycle_id.clone(),
            shutdown: None,
            wakeup: None,
        };
        match operation {
            Operation::Shutdown => entry.shutdown = Some(summary.clone()),
            Operation::Wakeup => entry.wakeup = Some(summary.clone()),
        }
        history.insert(0, entry);
    }
    history.truncate(MAX_EXECUTION_HISTORY);

    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
        s.phase = new_phase;
        s.current_operation = None;
        s.current_stage_index = 0;
        s.executions = Vec::new();
        s.execution_history = history.clone();
        s.retry_count = 0;
        s.last_retry_time = None;
        s.error_message = None;
    })
    .await?;
    Ok(())
}

pub async fn retry_from_error(ctx: Arc<ContextData>, plan: &Plan, namespace: &str, name: &str) -> Result<(), Error> {
    let status = plan.status.clone().unwrap_or_default();
    let retries_allowed = plan.spec.behavior.retries;
    if status.retry_count > retries_allowed {
        return Ok(());
    }
    let now = Utc::now();
    if let Some(last) = &status.last_retry_time {
        let gate = time_to_utc(last) + jittered_backoff(status.retry_count + 1, name, "plan");
        if now < gate {
            return Ok(());
        }
    }
    let Some(operation) = status.current_operation else {
        // No in-flight operation to resume: fall back to Pending so the next
        // reconcile re-evaluates the schedule from scratch.
        update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, |s| {
            s.phase = PlanPhase::Pending;
            s.error_message = None;
        })
        .await?;
        return Ok(());
    };
    let new_retry_count = status.retry_count + 1;
    let new_phase = match operation {
        Operation::Shutdown => PlanPhase::Hibernating,
        Operation::Wakeup => PlanPhase::WakingUp,
    };
    // Revert any rows still marked Failed in this stage back to Pending so
    // `advance_stage` relaunches them on the next tick.
    let executions: Vec<ExecutionStatus> = status
        .executions
        .into_iter()
        .map(|mut e| {
            if e.state == ExecutionState::Failed {
                e.state = ExecutionState::Pending;
                e.worker_ref = None;
            }
            e
        })
        .collect();
    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
        s.phase = new_phase;
        s.retry_count = new_retry_count;
        s.last_retry_time = Some(now_time());
        s.error_message = None;
        s.executions = executions.clone();
    })
    .await?;
    Ok(())
}

pub async fn transition_to_error(
    ctx: Arc<ContextData>,
    namespace: &str,
    name: &str,
    message: String,
) -> Result<(), Error> {
    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, name, move |s| {
        s.phase = PlanPhase::Error;
        s.error_message = Some(message.clone());
    })
    .await?;
    Ok(())
}

pub async fn finalize(ctx: Arc<ContextData>, plan: &Plan, namespace: &str, name: &str) -> Result<(), Error> {
    if let Some(status) = &plan.status {
        for exec in &status.executions {
            let key = RestoreKey {
                namespace: namespace.to_string(),
                plan: name.to_string(),
                target: exec.target.clone(),
            };
            ctx.restore
                .delete(&key)
                .await
                .map_err(|_| Error::Storage(format!("failed deleting restore entry for {}", exec.target)))?;
        }
    }
    crate::util::finalizer::delete::<Plan>(ctx.client.clone(), name, namespace).await?;
    Ok(())
}

pub async fn mirror_active_exceptions(ctx: Arc<ContextData>, namespace: &str, plan_name: &str) -> Result<(), Error> {
    let api: Api<Exception> = Api::namespaced(ctx.client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("hibernator.io/plan={plan_name}"));
    let list = api.list(&lp).await?;
    let mut refs: Vec<ActiveExceptionRef> = list
        .items
        .into_iter()
        .filter(|e| e.spec.plan_ref == plan_name)
        .filter(|e| {
            e.status.as_ref().map(|s| s.state) == Some(ExceptionPhase::Active)
        })
        .map(|e| ActiveExceptionRef {
            name: e.name_any(),
            exception_type: e.spec.exception_type,
            valid_from: e.spec.valid_from.clone(),
            valid_until: e.spec.valid_until.clone(),
        })
        .collect();
    refs.sort_by(|a, b| a.name.cmp(&b.name));
    refs.truncate(MAX_ACTIVE_EXCEPTIONS);

    update_status::<PlanStatus, Plan>(ctx.client.clone(), namespace, plan_name, move |s| {
        s.active_exceptions = refs.clone();
    })
    .await?;
    Ok(())
}

/// Exponential backoff capped at five minutes, with a deterministic
/// pseudo-jitter (derived from a hash of the retry key rather than `rand`,
/// since nothing else in this crate needs a random source) spreading
/// concurrent retries by roughly ±20%.
fn jittered_backoff(attempt: u32, plan_name: &str, target_name: &str) -> chrono::Duration {
    let base_secs = 2f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = base_secs.min(300.0);

    let mut hasher = Sha256::new();
    hasher.update(plan_name.as_bytes());
    hasher.update(target_name.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let frac = digest[0] as f64 / 255.0;
    let jitter = 0.8 + frac * 0.4;

    chrono::Duration::milliseconds((capped * jitter * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_grows_exponentially_and_caps_at_five_minutes() {
        let first = jittered_backoff(1, "nightly", "db");
        let second = jittered_backoff(2, "nightly", "db");
        assert!(second > first);
        let high = jittered_backoff(20, "nightly", "db");
        assert!(high <= chrono::Duration::seconds(300) + chrono::Duration::seconds(60));
    }

    #[test]
    fn jittered_backoff_is_deterministic_for_the_same_key() {
        let a = jittered_backoff(3, "nightly", "db");
        let b = jittered_backoff(3, "nightly", "db");
        assert_eq!(a, b);
    }

    #[test]
    fn jittered_backoff_varies_by_target() {
        let db = jittered_backoff(3, "nightly", "db");
        let web = jittered_backoff(3, "nightly", "web");
        assert_ne!(db, web);
    }
}
