//! Validating admission webhook HTTP server.
//!
//! Mirrors the plain axum `Router`/`AppState`/`axum::serve` shape used by the
//! other HTTP-serving components in this workspace: a couple of routes, one
//! piece of shared state, graceful shutdown wired through
//! `hibernator_common::shutdown`.

pub mod validate;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use kube::api::{Api, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::client::Client;
use owo_colors::OwoColorize;
use std::net::SocketAddr;

use hibernator_types::{Exception, Plan};

use crate::util::Error;

#[derive(Clone)]
pub struct AppState {
    pub client: Client,
}

pub async fn run(client: Client, port: u16) -> Result<(), Error> {
    let state = AppState { client };
    let router = Router::new()
        .route("/healthz", get(health))
        .route("/validate/plan", post(validate_plan))
        .route("/validate/exception", post(validate_exception))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid webhook bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Configuration(format!("failed to bind webhook listener on {addr}: {e}")))?;

    println!("{}", format!("🔒 Admission webhook listening on {addr}").green());
    hibernator_common::signal_ready();
    axum::serve(listener, router)
        .with_graceful_shutdown(hibernator_common::shutdown::shutdown_signal())
        .await
        .map_err(|e| Error::Configuration(format!("webhook server error: {e}")))?;
    println!("{}", "🔒 Admission webhook stopped gracefully.".green());
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn validate_plan(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview<Plan>>,
) -> Json<AdmissionReview<Plan>> {
    let Some(request): Option<AdmissionRequest<Plan>> = review.request else {
        return Json(AdmissionResponse::invalid("missing admission request").into_review());
    };

    let response = AdmissionResponse::from(&request);
    let Some(incoming) = request.object.as_ref() else {
        return Json(response.deny("admission request carried no object").into_review());
    };

    let namespace = incoming.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let existing = match fetch_existing_plan(&state, &namespace, incoming).await {
        Ok(existing) => existing,
        Err(e) => return Json(response.deny(format!("failed to look up existing plan: {e}")).into_review()),
    };

    let mut outcome = match validate::validate_plan(existing.as_ref(), incoming) {
        Ok(()) => response,
        Err(reason) => response.deny(reason),
    };
    let warnings = validate::validate_target_parameters(&incoming.spec.targets);
    if !warnings.is_empty() {
        outcome.warnings = Some(warnings);
    }
    Json(outcome.into_review())
}

async fn validate_exception(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview<Exception>>,
) -> Json<AdmissionReview<Exception>> {
    let Some(request): Option<AdmissionRequest<Exception>> = review.request else {
        return Json(AdmissionResponse::invalid("missing admission request").into_review());
    };

    let response = AdmissionResponse::from(&request);
    let Some(incoming) = request.object.as_ref() else {
        return Json(response.deny("admission request carried no object").into_review());
    };

    let namespace = incoming.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let plan_api: Api<Plan> = Api::namespaced(state.client.clone(), &namespace);
    let plan = match plan_api.get_opt(&incoming.spec.plan_ref).await {
        Ok(plan) => plan,
        Err(e) => return Json(response.deny(format!("failed to look up referenced plan: {e}")).into_review()),
    };

    let exception_api: Api<Exception> = Api::namespaced(state.client.clone(), &namespace);
    let lp = ListParams::default().labels(&format!("hibernator.io/plan={}", incoming.spec.plan_ref));
    let siblings = match exception_api.list(&lp).await {
        Ok(list) => list.items,
        Err(e) => return Json(response.deny(format!("failed to list sibling exceptions: {e}")).into_review()),
    };

    let outcome = match validate::validate_exception(plan.as_ref(), incoming, &siblings) {
        Ok(()) => response,
        Err(reason) => response.deny(reason),
    };
    Json(outcome.into_review())
}

async fn fetch_existing_plan(state: &AppState, namespace: &str, incoming: &Plan) -> Result<Option<Plan>, Error> {
    let Some(name) = incoming.metadata.name.as_ref() else {
        return Ok(None);
    };
    let api: Api<Plan> = Api::namespaced(state.client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}
