//! Write-phase helpers for the `Exception` reconciler.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;

use hibernator_types::{Exception, ExceptionPhase, ExceptionStatus};

use crate::util::status::update_status;
use crate::util::{Error, MANAGER_NAME, time_to_utc};

fn now_time() -> Time {
    Time::from(k8s_openapi::jiff::Timestamp::now())
}

pub async fn label_with_plan(client: Client, namespace: &str, name: &str, plan_ref: &str) -> Result<(), Error> {
    let api: Api<Exception> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({ "metadata": { "labels": { "hibernator.io/plan": plan_ref } } });
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

pub async fn activate(client: Client, _exception: &Exception, namespace: &str, name: &str) -> Result<(), Error> {
    update_status::<ExceptionStatus, Exception>(client, namespace, name, |s| {
        s.state = ExceptionPhase::Active;
        s.applied_at = Some(now_time());
        s.message = None;
    })
    .await?;
    Ok(())
}

pub async fn expire(client: Client, namespace: &str, name: &str) -> Result<(), Error> {
    update_status::<ExceptionStatus, Exception>(client, namespace, name, |s| {
        s.state = ExceptionPhase::Expired;
        s.expired_at = Some(now_time());
        s.message = None;
    })
    .await?;
    Ok(())
}

pub async fn mark_blocked(client: Client, namespace: &str, name: &str, conflict: &str) -> Result<(), Error> {
    let message = format!("blocked: overlaps active exception {conflict} for the same plan");
    update_status::<ExceptionStatus, Exception>(client, namespace, name, move |s| {
        s.message = Some(message.clone());
    })
    .await?;
    Ok(())
}

pub async fn finalize(client: Client, _exception: &Exception, namespace: &str, name: &str) -> Result<(), Error> {
    crate::util::finalizer::delete::<Exception>(client, name, namespace).await?;
    Ok(())
}

/// Checks every other non-expired `Exception` labeled for the same plan for
/// a `[validFrom, validUntil)` overlap with `candidate`. This is
/// defense-in-depth: the admission webhook is the primary place this
/// invariant is enforced, but exceptions can still be created faster than
/// the webhook observes sibling state, so the reconciler re-checks before
/// activating.
pub async fn find_overlap(client: Client, namespace: &str, candidate: &Exception) -> Result<Option<String>, Error> {
    let api: Api<Exception> = Api::namespaced(client, namespace);
    let lp = ListParams::default().labels(&format!("hibernator.io/plan={}", candidate.spec.plan_ref));
    let list = api.list(&lp).await?;

    let candidate_name = candidate.metadata.name.clone().unwrap_or_default();
    let candidate_from = time_to_utc(&candidate.spec.valid_from);
    let candidate_until = time_to_utc(&candidate.spec.valid_until);

    for other in list.items {
        let other_name = other.metadata.name.clone().unwrap_or_default();
        if other_name == candidate_name {
            continue;
        }
        if other.spec.plan_ref != candidate.spec.plan_ref {
            continue;
        }
        let other_phase = other.status.as_ref().map(|s| s.state).unwrap_or(ExceptionPhase::Pending);
        if other_phase == ExceptionPhase::Expired {
            continue;
        }
        let other_from = time_to_utc(&other.spec.valid_from);
        let other_until = time_to_utc(&other.spec.valid_until);
        if candidate_from < other_until && other_from < candidate_until {
            return Ok(Some(other_name));
        }
    }
    Ok(None)
}

pub async fn write_trigger_annotation(
    client: Client,
    namespace: &str,
    exception: &Exception,
    state: ExceptionPhase,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), Error> {
    use hibernator_types::Plan;

    let plan_name = &exception.spec.plan_ref;
    let exception_name = exception.metadata.name.clone().unwrap_or_default();
    let state_str = match state {
        ExceptionPhase::Pending => "pending",
        ExceptionPhase::Active => "active",
        ExceptionPhase::Expired => "expired",
    };
    let value = format!("{}/{}/{}", exception_name, state_str, now.timestamp());

    let api: Api<Plan> = Api::namespaced(client.clone(), namespace);
    let Some(plan) = api.get_opt(plan_name).await? else {
        return Ok(());
    };
    let current = plan
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get("hibernator.io/exception-trigger"))
        .cloned();
    if current.as_deref() == Some(value.as_str()) {
        return Ok(());
    }

    let patch = serde_json::json!({
        "metadata": { "annotations": { "hibernator.io/exception-trigger": value } }
    });
    api.patch(plan_name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
