use chrono::Utc;
use futures::stream::StreamExt;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use hibernator_types::{Exception, ExceptionPhase};

use super::actions;
use crate::util::{
    Error, PROBE_INTERVAL, time_to_utc,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Exception controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("hibernator-exception-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "hibernator-exception-controller-lock".to_string();
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

    println!("{}", "🌱 Exception controller ready to acquire leadership.".green());
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
                    eprintln!("aborted Exception controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting Exception controller".green());
                let context_for_controller = context.clone();
                let crd_api: Api<Exception> = Api::namespaced(client.clone(), &lease_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Exception controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping Exception controller");
            task.abort();
        }
    }
}

pub struct ContextData {
    pub client: Client,

    #[cfg(feature = "metrics")]
    pub metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (&'static str, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                metrics: ControllerMetrics::new("exceptions"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

#[derive(Debug, Clone)]
enum ExceptionAction {
    AddFinalizer,
    Finalize,
    Activate,
    Expire,
    BlockedByOverlap(String),
    NoOp,
}

impl ExceptionAction {
    fn to_str(&self) -> &'static str {
        match self {
            ExceptionAction::AddFinalizer => "AddFinalizer",
            ExceptionAction::Finalize => "Finalize",
            ExceptionAction::Activate => "Activate",
            ExceptionAction::Expire => "Expire",
            ExceptionAction::BlockedByOverlap(_) => "BlockedByOverlap",
            ExceptionAction::NoOp => "NoOp",
        }
    }
}

async fn reconcile(exception: Arc<Exception>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = exception
        .namespace()
        .ok_or_else(|| Error::UserInput("Expected Exception resource to be namespaced.".to_owned()))?;
    let name = exception.name_any();

    #[cfg(feature = "metrics")]
    context.metrics.record_reconcile(&namespace, &name);

    if exception.meta().deletion_timestamp.is_some() {
        log_action(&context, &namespace, &name, &ExceptionAction::Finalize).await;
        actions::finalize(client, &exception, &namespace, &name).await?;
        return Ok(Action::await_change());
    }

    if !crate::util::finalizer::has_finalizer(exception.as_ref()) {
        crate::util::finalizer::add::<Exception>(client.clone(), &name, &namespace).await?;
        actions::label_with_plan(client, &namespace, &name, &exception.spec.plan_ref).await?;
        return Ok(Action::requeue(Duration::from_secs(0)));
    }

    let now = Utc::now();
    let valid_from = time_to_utc(&exception.spec.valid_from);
    let valid_until = time_to_utc(&exception.spec.valid_until);
    let phase = exception.status.as_ref().map(|s| s.state).unwrap_or(ExceptionPhase::Pending);

    let action = if now >= valid_until {
        if phase == ExceptionPhase::Expired {
            ExceptionAction::NoOp
        } else {
            ExceptionAction::Expire
        }
    } else if now >= valid_from {
        match phase {
            ExceptionPhase::Active => ExceptionAction::NoOp,
            _ => {
                if let Some(conflict) = actions::find_overlap(client.clone(), &namespace, &exception).await? {
                    ExceptionAction::BlockedByOverlap(conflict)
                } else {
                    ExceptionAction::Activate
                }
            }
        }
    } else {
        ExceptionAction::NoOp
    };

    log_action(&context, &namespace, &name, &action).await;

    #[cfg(feature = "metrics")]
    context.metrics.record_action(action.to_str());

    match &action {
        ExceptionAction::AddFinalizer => {}
        ExceptionAction::Finalize => {}
        ExceptionAction::Activate => {
            actions::activate(client.clone(), &exception, &namespace, &name).await?;
            actions::write_trigger_annotation(client, &namespace, &exception, ExceptionPhase::Active, now).await?;
        }
        ExceptionAction::Expire => {
            actions::expire(client.clone(), &namespace, &name).await?;
            actions::write_trigger_annotation(client, &namespace, &exception, ExceptionPhase::Expired, now).await?;
        }
        ExceptionAction::BlockedByOverlap(conflict) => {
            actions::mark_blocked(client, &namespace, &name, conflict).await?;
        }
        ExceptionAction::NoOp => {}
    }

    let requeue = if now < valid_from {
        (valid_from - now).to_std().unwrap_or(PROBE_INTERVAL)
    } else if now < valid_until {
        (valid_until - now).to_std().unwrap_or(PROBE_INTERVAL)
    } else {
        PROBE_INTERVAL
    }
    .min(PROBE_INTERVAL);

    Ok(Action::requeue(requeue))
}

async fn log_action(context: &Arc<ContextData>, namespace: &str, name: &str, action: &ExceptionAction) {
    let kind = action.to_str();
    let mut la = context.last_action.lock().await;
    let key = (namespace.to_string(), name.to_string());
    let should_log = match la.get(&key) {
        Some((last_kind, last_instant)) => *last_kind != kind || last_instant.elapsed() > Duration::from_secs(300),
        None => true,
    };
    la.insert(key, (kind, Instant::now()));
    drop(la);
    if should_log && kind != "NoOp" {
        println!(
            "⏳ {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            kind.color(FG2),
        );
    }
}

fn on_error(exception: Arc<Exception>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Exception reconciliation error: {:?} {:?}", error, exception.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_to_str_is_stable_for_throttled_logging() {
        assert_eq!(ExceptionAction::Activate.to_str(), "Activate");
        assert_eq!(ExceptionAction::BlockedByOverlap("other".to_string()).to_str(), "BlockedByOverlap");
        assert_eq!(ExceptionAction::NoOp.to_str(), "NoOp");
    }
}
