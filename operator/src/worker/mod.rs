//! Launches and observes the isolated worker tasks that actually hibernate
//! or wake a target. The default implementation is a one-shot Kubernetes
//! `Job` per `(plan, cycleID, operation, target, attempt)`; terminal state
//! is read from the Job's `Complete`/`Failed` conditions only, never from
//! application-level signals.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use kube::Client;
use kube::api::{Api, ObjectMeta, PostParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use hibernator_types::Operation;

use crate::util::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub namespace: String,
    pub plan: String,
    pub target: String,
    pub target_type: String,
    pub connector_ref: String,
    pub parameters: Vec<u8>,
    pub operation: Operation,
    pub cycle_id: String,
    pub attempt: u32,
}

fn operation_str(op: Operation) -> &'static str {
    match op {
        Operation::Shutdown => "shutdown",
        Operation::Wakeup => "wakeup",
    }
}

/// `{plan}-{operation}-{target}-{cycleID-suffix}-{attempt}`, sanitized and
/// truncated to fit the 63-character Kubernetes name limit.
pub fn worker_name(req: &WorkerRequest) -> String {
    let cycle_suffix: String = req.cycle_id.chars().take(8).collect();
    let raw = format!(
        "{}-{}-{}-{}-{}",
        req.plan,
        operation_str(req.operation),
        req.target,
        cycle_suffix,
        req.attempt
    );
    sanitize_name(&raw)
}

fn sanitize_name(raw: &str) -> String {
    let mut s: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    s.truncate(63);
    s.trim_end_matches('-').to_string()
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Exactly-once per key: a second call for the same request returns the
    /// already-existing worker's ref instead of creating a duplicate.
    async fn launch(&self, req: &WorkerRequest) -> Result<String, Error>;
    async fn observe(&self, namespace: &str, worker_ref: &str) -> Result<WorkerState, Error>;
}

pub struct JobWorkerLauncher {
    client: Client,
    worker_image: String,
}

impl JobWorkerLauncher {
    pub fn new(client: Client, worker_image: String) -> Self {
        Self { client, worker_image }
    }

    fn api(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkerLauncher for JobWorkerLauncher {
    async fn launch(&self, req: &WorkerRequest) -> Result<String, Error> {
        let api = self.api(&req.namespace);
        let name = worker_name(req);

        if api.get_opt(&name).await?.is_some() {
            return Ok(name);
        }

        let labels = BTreeMap::from([
            ("hibernator.io/plan".to_string(), req.plan.clone()),
            (
                "hibernator.io/operation".to_string(),
                operation_str(req.operation).to_string(),
            ),
            ("hibernator.io/target".to_string(), req.target.clone()),
            ("hibernator.io/cycle-id".to_string(), req.cycle_id.clone()),
        ]);

        let env = vec![
            EnvVar {
                name: "HIBERNATOR_CYCLE_ID".into(),
                value: Some(req.cycle_id.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "HIBERNATOR_OPERATION".into(),
                value: Some(operation_str(req.operation).to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "HIBERNATOR_TARGET_NAME".into(),
                value: Some(req.target.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "HIBERNATOR_TARGET_TYPE".into(),
                value: Some(req.target_type.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "HIBERNATOR_CONNECTOR_REF".into(),
                value: Some(req.connector_ref.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "HIBERNATOR_PARAMETERS".into(),
                value: Some(hex::encode(&req.parameters)),
                ..Default::default()
            },
        ];

        let job = Job {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(req.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "worker".to_string(),
                            image: Some(self.worker_image.clone()),
                            env: Some(env),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };

        api.create(&PostParams::default(), &job).await?;
        Ok(name)
    }

    async fn observe(&self, namespace: &str, worker_ref: &str) -> Result<WorkerState, Error> {
        let job = match self.api(namespace).get_opt(worker_ref).await? {
            Some(j) => j,
            None => return Ok(WorkerState::Failed),
        };
        let status = job.status.unwrap_or_default();
        let conditions = status.conditions.unwrap_or_default();
        if conditions.iter().any(|c| c.type_ == "Complete" && c.status == "True") {
            return Ok(WorkerState::Succeeded);
        }
        if conditions.iter().any(|c| c.type_ == "Failed" && c.status == "True") {
            return Ok(WorkerState::Failed);
        }
        if status.active.unwrap_or(0) > 0 {
            return Ok(WorkerState::Running);
        }
        Ok(WorkerState::Pending)
    }
}

/// In-memory double for tests: `launch` records the request, `observe`
/// returns whatever state the test has set, defaulting to `Pending`.
#[derive(Default, Clone)]
pub struct FakeWorkerLauncher {
    launched: Arc<Mutex<BTreeMap<String, WorkerState>>>,
}

impl FakeWorkerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, worker_ref: &str, state: WorkerState) {
        self.launched.lock().await.insert(worker_ref.to_string(), state);
    }
}

#[async_trait]
impl WorkerLauncher for FakeWorkerLauncher {
    async fn launch(&self, req: &WorkerRequest) -> Result<String, Error> {
        let name = worker_name(req);
        let mut guard = self.launched.lock().await;
        guard.entry(name.clone()).or_insert(WorkerState::Pending);
        Ok(name)
    }

    async fn observe(&self, _namespace: &str, worker_ref: &str) -> Result<WorkerState, Error> {
        Ok(self
            .launched
            .lock()
            .await
            .get(worker_ref)
            .copied()
            .unwrap_or(WorkerState::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(attempt: u32) -> WorkerRequest {
        WorkerRequest {
            namespace: "default".to_string(),
            plan: "nightly".to_string(),
            target: "database".to_string(),
            target_type: "rds".to_string(),
            connector_ref: "conn".to_string(),
            parameters: vec![1, 2, 3],
            operation: Operation::Shutdown,
            cycle_id: "11112222-aaaa-bbbb-cccc-dddddddddddd".to_string(),
            attempt,
        }
    }

    #[test]
    fn worker_name_is_stable_and_sanitized() {
        let name = worker_name(&request(1));
        assert_eq!(name, "nightly-shutdown-database-11112222-1");
    }

    #[tokio::test]
    async fn relaunching_same_key_is_a_no_op() {
        let launcher = FakeWorkerLauncher::new();
        let req = request(1);
        let first = launcher.launch(&req).await.unwrap();
        launcher.set_state(&first, WorkerState::Running).await;
        let second = launcher.launch(&req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            launcher.observe("default", &second).await.unwrap(),
            WorkerState::Running
        );
    }
}
