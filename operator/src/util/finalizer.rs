//! Manual finalizer add/remove, following the same convention used across
//! this author's other operators: patch `metadata.finalizers` directly
//! rather than reach for a generic finalizer-wrapping combinator.

use kube::api::{Api, Patch, PatchParams, Resource};
use kube::core::NamespaceResourceScope;
use kube::Client;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use super::{Error, MANAGER_NAME};

pub const FINALIZER_NAME: &str = "hibernator.io/finalizer";

pub fn has_finalizer<T: Resource>(obj: &T) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|f| f == FINALIZER_NAME))
        .unwrap_or(false)
}

pub async fn add<T>(client: Client, name: &str, namespace: &str) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Debug,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    let current = api.get(name).await?;
    if has_finalizer(&current) {
        return Ok(current);
    }
    let mut finalizers = current.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER_NAME.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    Ok(api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
        .await?)
}

pub async fn delete<T>(client: Client, name: &str, namespace: &str) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Debug,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    let current = api.get(name).await?;
    let finalizers: Vec<String> = current
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER_NAME)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    Ok(api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
        .await?)
}
