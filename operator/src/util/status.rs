//! Optimistic-concurrency status mutator: re-read, apply the mutator
//! function, patch, retry on conflict. Generalizes the single-shot
//! `patch_status` helper this author's operators usually carry into a
//! capped-retry version, since `PlanReconciler`/`ExceptionReconciler` run
//! concurrently with exception feedback and admission-triggered retries.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams, Resource};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client};
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt::Debug, time::Duration};

use hibernator_types::{Exception, ExceptionStatus, Plan, PlanStatus};

use super::{Error, MANAGER_NAME};

const MAX_ATTEMPTS: u32 = 5;

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing it
    /// with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    fn set_last_updated(&mut self, last_updated: Time);
}

impl Object<PlanStatus> for Plan {
    fn mut_status(&mut self) -> &mut PlanStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for PlanStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<ExceptionStatus> for Exception {
    fn mut_status(&mut self) -> &mut ExceptionStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for ExceptionStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

/// Applies `f` to the status of the named object, retrying on API conflicts
/// (capped at 5 attempts, default backoff). A 404 observed on a retry (the
/// object was deleted concurrently) is treated as success.
pub async fn update_status<S, T>(
    client: Client,
    namespace: &str,
    name: &str,
    mut f: impl FnMut(&mut S),
) -> Result<Option<T>, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource<Scope = NamespaceResourceScope> + Object<S> + Serialize + DeserializeOwned + Debug,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let current = match api.get_opt(name).await? {
            Some(obj) => obj,
            None if attempt > 1 => return Ok(None),
            None => return Ok(None),
        };

        let mut modified = current.clone();
        let status = modified.mut_status();
        f(status);
        status.set_last_updated(Time::from(k8s_openapi::jiff::Timestamp::now()));

        let patch = Patch::Json::<T>(json_patch::diff(
            &serde_json::to_value(&current).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        ));

        match api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < MAX_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
