//! Opaque restore-artifact storage, keyed by `(namespace, plan, target)`.
//! The default implementation wraps a Kubernetes `ConfigMap` per key, named
//! so `restoreConfigMapRef` on a ledger row can point straight at it; an
//! in-memory double backs unit tests.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Client;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::util::{Error, MANAGER_NAME};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RestoreKey {
    pub namespace: String,
    pub plan: String,
    pub target: String,
}

impl RestoreKey {
    pub fn config_map_name(&self) -> String {
        format!("{}-restore-{}", self.plan, sanitize(&self.target))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[async_trait]
pub trait RestoreStore: Send + Sync {
    /// Idempotent upsert.
    async fn save(&self, key: &RestoreKey, bytes: Vec<u8>) -> Result<(), Error>;
    async fn load(&self, key: &RestoreKey) -> Result<Option<Vec<u8>>, Error>;
    async fn has(&self, key: &RestoreKey) -> Result<bool, Error> {
        Ok(self.load(key).await?.is_some())
    }
    async fn delete(&self, key: &RestoreKey) -> Result<(), Error>;
}

pub struct ConfigMapRestoreStore {
    client: Client,
}

impl ConfigMapRestoreStore {
    const DATA_KEY: &'static str = "restore";

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RestoreStore for ConfigMapRestoreStore {
    async fn save(&self, key: &RestoreKey, bytes: Vec<u8>) -> Result<(), Error> {
        let name = key.config_map_name();
        let mut binary_data = BTreeMap::new();
        binary_data.insert(Self::DATA_KEY.to_string(), ByteString(bytes));
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(key.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("hibernator.io/plan".to_string(), key.plan.clone()),
                    ("hibernator.io/target".to_string(), key.target.clone()),
                ])),
                ..Default::default()
            },
            binary_data: Some(binary_data),
            ..Default::default()
        };
        self.api(&key.namespace)
            .patch(&name, &PatchParams::apply(MANAGER_NAME), &Patch::Apply(&cm))
            .await?;
        Ok(())
    }

    async fn load(&self, key: &RestoreKey) -> Result<Option<Vec<u8>>, Error> {
        match self.api(&key.namespace).get(&key.config_map_name()).await {
            Ok(cm) => Ok(cm
                .binary_data
                .and_then(|mut m| m.remove(Self::DATA_KEY))
                .map(|b| b.0)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &RestoreKey) -> Result<(), Error> {
        match self
            .api(&key.namespace)
            .delete(&key.config_map_name(), &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default, Clone)]
pub struct InMemoryRestoreStore {
    inner: Arc<Mutex<BTreeMap<(String, String, String), Vec<u8>>>>,
}

fn tuple_key(key: &RestoreKey) -> (String, String, String) {
    (key.namespace.clone(), key.plan.clone(), key.target.clone())
}

#[async_trait]
impl RestoreStore for InMemoryRestoreStore {
    async fn save(&self, key: &RestoreKey, bytes: Vec<u8>) -> Result<(), Error> {
        self.inner.lock().await.insert(tuple_key(key), bytes);
        Ok(())
    }

    async fn load(&self, key: &RestoreKey) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.inner.lock().await.get(&tuple_key(key)).cloned())
    }

    async fn delete(&self, key: &RestoreKey) -> Result<(), Error> {
        self.inner.lock().await.remove(&tuple_key(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(target: &str) -> RestoreKey {
        RestoreKey {
            namespace: "default".to_string(),
            plan: "nightly".to_string(),
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryRestoreStore::default();
        let k = key("database");
        assert!(!store.has(&k).await.unwrap());
        store.save(&k, b"payload".to_vec()).await.unwrap();
        assert!(store.has(&k).await.unwrap());
        assert_eq!(store.load(&k).await.unwrap(), Some(b"payload".to_vec()));
        store.delete(&k).await.unwrap();
        assert!(!store.has(&k).await.unwrap());
    }

    #[test]
    fn config_map_name_is_sanitized() {
        let k = RestoreKey {
            namespace: "default".to_string(),
            plan: "nightly".to_string(),
            target: "weird.name/here".to_string(),
        };
        assert_eq!(k.config_map_name(), "nightly-restore-weird-name-here");
    }
}
