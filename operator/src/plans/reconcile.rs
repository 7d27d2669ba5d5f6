use chrono::Utc;
use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    api::ListParams,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use hibernator_types::{Exception, ExceptionPhase, Operation, Plan, PlanPhase};

use super::actions;
use crate::restore::{ConfigMapRestoreStore, RestoreStore};
use crate::schedule::{self, ExceptionInput};
use crate::util::{
    Error, PROBE_INTERVAL, time_to_utc,
    colors::{FG1, FG2},
};
use crate::worker::{JobWorkerLauncher, WorkerLauncher};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub async fn run(client: Client, worker_image: String) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Plan controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), worker_image));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("hibernator-plan-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "hibernator-plan-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        hibernator_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    println!("{}", "🌱 Plan controller ready to acquire leadership.".green());
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted Plan controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting Plan controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let crd_api: Api<Plan> = Api::namespaced(client_for_controller.clone(), &lease_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Plan controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .owns(
                            Api::<Exception>::namespaced(client_for_controller, &lease_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Plan controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile`/`on_error` invocation.
pub struct ContextData {
    pub client: Client,
    pub restore: Arc<dyn RestoreStore>,
    pub workers: Arc<dyn WorkerLauncher>,

    #[cfg(feature = "metrics")]
    pub metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (PlanActionKind, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, worker_image: String) -> Self {
        let restore: Arc<dyn RestoreStore> = Arc::new(ConfigMapRestoreStore::new(client.clone()));
        let workers: Arc<dyn WorkerLauncher> = Arc::new(JobWorkerLauncher::new(client.clone(), worker_image));
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                restore,
                workers,
                metrics: ControllerMetrics::new("plans"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                restore,
                workers,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// The action a reconcile takes, decided from the plan's current phase plus
/// the schedule evaluator's verdict. `determine_action` is intentionally
/// small: every interesting state machine transition is implemented inside
/// the corresponding `actions::*` function, not here.
#[derive(Debug, Clone)]
pub enum PlanAction {
    AddFinalizer,
    Finalize,
    Suspend,
    Resume { force_wake: bool, fallback_to_active: bool },
    Activate,
    StartOperation { operation: Operation },
    AdvanceStage,
    RetryFromError,
    NoOp,
    Requeue(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PlanActionKind {
    AddFinalizer,
    Finalize,
    Suspend,
    Resume,
    Activate,
    StartOperation,
    AdvanceStage,
    RetryFromError,
    NoOp,
    Requeue,
}

impl PlanAction {
    fn kind(&self) -> PlanActionKind {
        match self {
            PlanAction::AddFinalizer => PlanActionKind::AddFinalizer,
            PlanAction::Finalize => PlanActionKind::Finalize,
            PlanAction::Suspend => PlanActionKind::Suspend,
            PlanAction::Resume { .. } => PlanActionKind::Resume,
            PlanAction::Activate => PlanActionKind::Activate,
            PlanAction::StartOperation { .. } => PlanActionKind::StartOperation,
            PlanAction::AdvanceStage => PlanActionKind::AdvanceStage,
            PlanAction::RetryFromError => PlanActionKind::RetryFromError,
            PlanAction::NoOp => PlanActionKind::NoOp,
            PlanAction::Requeue(_) => PlanActionKind::Requeue,
        }
    }

    fn to_str(&self) -> &'static str {
        match self {
            PlanAction::AddFinalizer => "AddFinalizer",
            PlanAction::Finalize => "Finalize",
            PlanAction::Suspend => "Suspend",
            PlanAction::Resume { .. } => "Resume",
            PlanAction::Activate => "Activate",
            PlanAction::StartOperation { .. } => "StartOperation",
            PlanAction::AdvanceStage => "AdvanceStage",
            PlanAction::RetryFromError => "RetryFromError",
            PlanAction::NoOp => "NoOp",
            PlanAction::Requeue(_) => "Requeue",
        }
    }
}

async fn reconcile(plan: Arc<Plan>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();

    let namespace = plan.namespace().ok_or_else(|| {
        Error::UserInput("Expected Plan resource to be namespaced.".to_owned())
    })?;
    let name = plan.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.record_reconcile(&namespace, &name);
    #[cfg(feature = "metrics")]
    let read_timer = context.metrics.time_read();

    if plan.meta().deletion_timestamp.is_some() {
        let action = PlanAction::Finalize;
        log_action(&context, &namespace, &name, &action).await;
        actions::finalize(context.clone(), &plan, &namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !crate::util::finalizer::has_finalizer(plan.as_ref()) {
        crate::util::finalizer::add::<Plan>(client.clone(), &name, &namespace).await?;
        return Ok(Action::requeue(Duration::from_secs(0)));
    }

    let now = Utc::now();
    let exceptions = list_exception_inputs(client.clone(), &namespace, &name).await?;
    let suspend_until = suspend_until_annotation(&plan);
    let decision = schedule::evaluate(&plan.spec.schedule, &exceptions, suspend_until, now);

    #[cfg(feature = "metrics")]
    read_timer.observe_duration();

    let status = plan.status.clone().unwrap_or_default();
    let has_restore_data = if !plan.spec.suspend && status.phase == PlanPhase::Suspended {
        actions::any_restore_data_exists(context.clone(), &namespace, &name, &plan).await?
    } else {
        false
    };
    let action = match &decision {
        Ok(d) => determine_action(&plan, &status, Some(d.state), has_restore_data),
        Err(_) => determine_action(&plan, &status, None, has_restore_data),
    };

    log_action(&context, &namespace, &name, &action).await;

    #[cfg(feature = "metrics")]
    context.metrics.record_action(action.to_str());
    #[cfg(feature = "metrics")]
    let write_timer = context.metrics.time_write();

    actions::mirror_active_exceptions(context.clone(), &namespace, &name).await?;

    let result = match &action {
        PlanAction::AddFinalizer => Action::requeue(Duration::from_secs(0)),
        PlanAction::Finalize => Action::await_change(),
        PlanAction::Suspend => {
            actions::suspend(context.clone(), &plan, &namespace, &name).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        PlanAction::Resume { force_wake, fallback_to_active } => {
            actions::resume(context.clone(), &plan, &namespace, &name, *force_wake, *fallback_to_active).await?;
            Action::requeue(Duration::from_secs(0))
        }
        PlanAction::Activate => {
            actions::activate(context.clone(), &namespace, &name).await?;
            Action::requeue(Duration::from_secs(0))
        }
        PlanAction::StartOperation { operation } => {
            actions::start_operation(context.clone(), &plan, &namespace, &name, *operation).await?;
            Action::requeue(Duration::from_secs(0))
        }
        PlanAction::AdvanceStage => {
            actions::advance_stage(context.clone(), &plan, &namespace, &name).await?;
            Action::requeue(Duration::from_secs(2))
        }
        PlanAction::RetryFromError => {
            actions::retry_from_error(context.clone(), &plan, &namespace, &name).await?;
            Action::requeue(Duration::from_secs(2))
        }
        PlanAction::NoOp => {
            let requeue = match &decision {
                Ok(d) => (d.next_transition - now).to_std().unwrap_or(PROBE_INTERVAL).min(PROBE_INTERVAL),
                Err(_) => PROBE_INTERVAL,
            };
            Action::requeue(requeue)
        }
        PlanAction::Requeue(d) => Action::requeue(*d),
    };

    #[cfg(feature = "metrics")]
    write_timer.observe_duration();

    Ok(result)
}

async fn log_action(context: &Arc<ContextData>, namespace: &str, name: &str, action: &PlanAction) {
    let kind = action.kind();
    let mut la = context.last_action.lock().await;
    let key = (namespace.to_string(), name.to_string());
    let should_log = match la.get(&key) {
        Some((last_kind, last_instant)) => {
            *last_kind != kind || last_instant.elapsed() > Duration::from_secs(300)
        }
        None => true,
    };
    la.insert(key, (kind, Instant::now()));
    drop(la);
    if should_log && kind != PlanActionKind::NoOp {
        println!(
            "🧊 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            action.to_str().color(FG2),
        );
    }
}

fn determine_action(
    plan: &Plan,
    status: &hibernator_types::PlanStatus,
    schedule_state: Option<schedule::ScheduleState>,
    has_restore_data: bool,
) -> PlanAction {
    use schedule::ScheduleState::*;

    if plan.spec.suspend && status.phase != PlanPhase::Suspended {
        return PlanAction::Suspend;
    }

    if !plan.spec.suspend && status.phase == PlanPhase::Suspended {
        let was_mid_operation = matches!(
            status.suspended_at_phase,
            Some(PlanPhase::Hibernating) | Some(PlanPhase::Hibernated) | Some(PlanPhase::WakingUp)
        );
        let schedule_active = was_mid_operation && matches!(schedule_state, Some(Active));
        let force_wake = schedule_active && has_restore_data;
        let fallback_to_active = schedule_active && !has_restore_data;
        return PlanAction::Resume { force_wake, fallback_to_active };
    }

    match status.phase {
        PlanPhase::Pending => PlanAction::Activate,
        PlanPhase::Active => match schedule_state {
            Some(ShouldHibernate) => PlanAction::StartOperation {
                operation: Operation::Shutdown,
            },
            _ => PlanAction::NoOp,
        },
        PlanPhase::Hibernating | PlanPhase::WakingUp => PlanAction::AdvanceStage,
        PlanPhase::Hibernated => match schedule_state {
            Some(Active) => PlanAction::StartOperation {
                operation: Operation::Wakeup,
            },
            _ => PlanAction::NoOp,
        },
        PlanPhase::Error => PlanAction::RetryFromError,
        PlanPhase::Suspended => PlanAction::NoOp,
    }
}

fn suspend_until_annotation(plan: &Plan) -> Option<chrono::DateTime<Utc>> {
    plan.meta()
        .annotations
        .as_ref()?
        .get(hibernator_common::annotations::SUSPEND_UNTIL)
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Lists the `Exception` resources labeled for this plan and converts each
/// into the evaluator's input shape. Exception state/windows are always
/// read live from the `Exception` resources, never from the plan's own
/// `status.activeExceptions` mirror (which exists for observability only).
async fn list_exception_inputs(
    client: Client,
    namespace: &str,
    plan_name: &str,
) -> Result<Vec<ExceptionInput>, Error> {
    let api: Api<Exception> = Api::namespaced(client, namespace);
    let lp = ListParams::default().labels(&format!("hibernator.io/plan={}", plan_name));
    let list = api.list(&lp).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|exc| exc.spec.plan_ref == plan_name)
        .map(|exc| {
            let state = exc.status.as_ref().map(|s| s.state).unwrap_or(ExceptionPhase::Pending);
            ExceptionInput {
                exception_type: exc.spec.exception_type,
                state,
                valid_from: time_to_utc(&exc.spec.valid_from),
                valid_until: time_to_utc(&exc.spec.valid_until),
                lead_time: exc
                    .spec
                    .lead_time_seconds
                    .map(std::time::Duration::from_secs),
                windows: exc.spec.windows.clone(),
            }
        })
        .collect())
}

fn on_error(plan: Arc<Plan>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Plan reconciliation error: {:?} {:?}", error, plan.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernator_types::{PlanSpec, PlanStatus, ScheduleSpec};

    fn plan_with(suspend: bool) -> Plan {
        Plan::new(
            "nightly",
            PlanSpec {
                schedule: ScheduleSpec {
                    timezone: "UTC".to_string(),
                    windows: vec![],
                },
                execution_strategy: Default::default(),
                behavior: Default::default(),
                suspend,
                targets: vec![],
            },
        )
    }

    fn status_with(phase: PlanPhase) -> PlanStatus {
        PlanStatus {
            phase,
            ..Default::default()
        }
    }

    #[test]
    fn pending_plan_activates_regardless_of_schedule() {
        let plan = plan_with(false);
        let status = status_with(PlanPhase::Pending);
        assert!(matches!(determine_action(&plan, &status, None, false), PlanAction::Activate));
    }

    #[test]
    fn active_plan_starts_shutdown_when_schedule_says_hibernate() {
        let plan = plan_with(false);
        let status = status_with(PlanPhase::Active);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::ShouldHibernate), false);
        assert!(matches!(
            action,
            PlanAction::StartOperation {
                operation: Operation::Shutdown
            }
        ));
    }

    #[test]
    fn active_plan_is_a_noop_when_schedule_says_active() {
        let plan = plan_with(false);
        let status = status_with(PlanPhase::Active);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::Active), false);
        assert!(matches!(action, PlanAction::NoOp));
    }

    #[test]
    fn hibernated_plan_wakes_up_once_schedule_turns_active() {
        let plan = plan_with(false);
        let status = status_with(PlanPhase::Hibernated);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::Active), false);
        assert!(matches!(
            action,
            PlanAction::StartOperation {
                operation: Operation::Wakeup
            }
        ));
    }

    #[test]
    fn suspending_a_plan_takes_priority_over_everything_else() {
        let plan = plan_with(true);
        let status = status_with(PlanPhase::Hibernating);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::ShouldHibernate), false);
        assert!(matches!(action, PlanAction::Suspend));
    }

    #[test]
    fn unsuspending_mid_hibernation_forces_a_wake_if_schedule_is_active_and_restore_data_exists() {
        let plan = plan_with(false);
        let mut status = status_with(PlanPhase::Suspended);
        status.suspended_at_phase = Some(PlanPhase::Hibernating);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::Active), true);
        assert!(matches!(
            action,
            PlanAction::Resume {
                force_wake: true,
                fallback_to_active: false
            }
        ));
    }

    #[test]
    fn unsuspending_mid_hibernation_falls_back_to_active_with_no_restore_data() {
        let plan = plan_with(false);
        let mut status = status_with(PlanPhase::Suspended);
        status.suspended_at_phase = Some(PlanPhase::Hibernating);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::Active), false);
        assert!(matches!(
            action,
            PlanAction::Resume {
                force_wake: false,
                fallback_to_active: true
            }
        ));
    }

    #[test]
    fn unsuspending_a_plan_that_was_active_never_forces_a_wake() {
        let plan = plan_with(false);
        let mut status = status_with(PlanPhase::Suspended);
        status.suspended_at_phase = Some(PlanPhase::Active);
        let action = determine_action(&plan, &status, Some(schedule::ScheduleState::ShouldHibernate), true);
        assert!(matches!(
            action,
            PlanAction::Resume {
                force_wake: false,
                fallback_to_active: false
            }
        ));
    }

    #[test]
    fn error_phase_always_tries_to_retry() {
        let plan = plan_with(false);
        let status = status_with(PlanPhase::Error);
        assert!(matches!(determine_action(&plan, &status, None, false), PlanAction::RetryFromError));
    }

    #[test]
    fn in_flight_stages_always_advance_regardless_of_schedule() {
        let plan = plan_with(false);
        for phase in [PlanPhase::Hibernating, PlanPhase::WakingUp] {
            let status = status_with(phase);
            assert!(matches!(determine_action(&plan, &status, None, false), PlanAction::AdvanceStage));
        }
    }
}
