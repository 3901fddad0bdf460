use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use mlops_api::consts::STARTED_FINALIZER_PREFIX;
use mlops_api::crd::{self, State};

use crate::client::ApiClient;
use crate::controller::daemon;
use crate::controller::watch::EventHandler;
use crate::diff::Diff;
use crate::error::Result;
use crate::resources::endpoint::Endpoint;
use crate::resources::endpoint_config::EndpointConfig;
use crate::resources::model::Model;
use crate::resources::strip_finalizers;

/// Record a permanent failure on the object status
async fn set_failed<K>(api: &ApiClient, object: &K)
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let name = object.name_any();
    let namespace = object.namespace().unwrap_or_default();
    if let Err(err) = api
        .patch_namespaced_status::<K, _>(
            &name,
            &namespace,
            &json!({"status": {"state": State::Failed}}),
        )
        .await
    {
        error!("failed to record failure on {name}: {err}");
    }
}

/// Bindings of the Endpoint kind
pub(crate) struct EndpointHandler {
    /// Cluster api
    api: ApiClient,
}

impl EndpointHandler {
    /// Constructor
    pub(crate) fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EventHandler<crd::Endpoint> for EndpointHandler {
    async fn created(&self, object: &crd::Endpoint) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("creating endpoint {name} in namespace {namespace}");
        Endpoint::new(self.api.clone(), &name, &namespace)
            .await?
            .create_handler()
            .await
    }

    async fn updated(&self, object: &crd::Endpoint, diff: &Diff) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("updating endpoint {name} in namespace {namespace}");
        Endpoint::new(self.api.clone(), &name, &namespace)
            .await?
            .update_handler(diff)
            .await
    }

    async fn deleted(&self, object: &crd::Endpoint) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("deleting endpoint {name} in namespace {namespace}");
        Endpoint::new(self.api.clone(), &name, &namespace)
            .await?
            .delete_handler()
            .await
    }

    /// Endpoints carry only the operator finalizer; drop it directly
    async fn clear_finalizers(&self, object: &crd::Endpoint, tokens: &[String]) -> Result<()> {
        let remaining = strip_finalizers(object.metadata.finalizers.as_ref(), tokens);
        let _patched: crd::Endpoint = self
            .api
            .patch_namespaced(
                &object.name_any(),
                &object.namespace().unwrap_or_default(),
                &json!({"metadata": {"finalizers": remaining}}),
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, object: &crd::Endpoint) {
        set_failed(&self.api, object).await;
    }
}

/// Bindings of the EndpointConfig kind. There is no create binding: a
/// user-created config stays dormant until an endpoint references it.
pub(crate) struct EndpointConfigHandler {
    /// Cluster api
    api: ApiClient,
}

impl EndpointConfigHandler {
    /// Constructor
    pub(crate) fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EventHandler<crd::EndpointConfig> for EndpointConfigHandler {
    async fn created(&self, object: &crd::EndpointConfig) -> Result<()> {
        debug!("endpoint config {} created, staying dormant", object.name_any());
        Ok(())
    }

    async fn updated(&self, object: &crd::EndpointConfig, diff: &Diff) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("updating endpoint config {name} in namespace {namespace}");
        EndpointConfig::new(self.api.clone(), &name, &namespace, "")
            .await?
            .update_handler(diff)
            .await
    }

    async fn deleted(&self, object: &crd::EndpointConfig) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("deleting endpoint config {name} in namespace {namespace}");
        EndpointConfig::new(self.api.clone(), &name, &namespace, "")
            .await?
            .delete_handler()
            .await
    }

    fn owns_finalizer(&self, token: &str) -> bool {
        token.starts_with(STARTED_FINALIZER_PREFIX)
    }

    /// A `started:{name}` breadcrumb clears once the successor config is
    /// available (or is gone altogether)
    async fn finalizer_cleared(&self, token: &str, namespace: &str) -> Result<bool> {
        let successor = token.trim_start_matches(STARTED_FINALIZER_PREFIX);
        let config = EndpointConfig::new(self.api.clone(), successor, namespace, "").await?;
        Ok(config.body.is_none() || config.is_available())
    }

    async fn clear_finalizers(&self, object: &crd::EndpointConfig, tokens: &[String]) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        EndpointConfig::new(self.api.clone(), &name, &namespace, "")
            .await?
            .remove_finalizers(tokens)
            .await
    }

    async fn mark_failed(&self, object: &crd::EndpointConfig) {
        set_failed(&self.api, object).await;
    }
}

/// Bindings of the Model kind. There is no create binding either, but every
/// live Model object gets a readiness daemon.
pub(crate) struct ModelHandler {
    /// Cluster api
    api: ApiClient,
    /// Readiness daemon per live Model object
    daemons: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ModelHandler {
    /// Constructor
    pub(crate) fn new(api: ApiClient) -> Self {
        Self {
            api,
            daemons: Mutex::new(HashMap::new()),
        }
    }

    /// Start the readiness daemon for one model, unless it already runs
    fn spawn_daemon(&self, object: &crd::Model) {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        let key = format!("{namespace}/{name}");
        let mut daemons = self
            .daemons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if daemons
            .get(&key)
            .map_or(false, |handle| !handle.is_finished())
        {
            return;
        }
        debug!("starting readiness daemon for model {key}");
        let handle = tokio::spawn(daemon::monitor_deployment(self.api.clone(), name, namespace));
        let _previous = daemons.insert(key, handle);
    }

    /// Stop the readiness daemon for one model
    fn abort_daemon(&self, object: &crd::Model) {
        let key = format!(
            "{}/{}",
            object.namespace().unwrap_or_default(),
            object.name_any()
        );
        let mut daemons = self
            .daemons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = daemons.remove(&key) {
            handle.abort();
        }
    }
}

#[async_trait]
impl EventHandler<crd::Model> for ModelHandler {
    async fn created(&self, object: &crd::Model) -> Result<()> {
        debug!("model {} created, staying dormant", object.name_any());
        self.spawn_daemon(object);
        Ok(())
    }

    async fn updated(&self, object: &crd::Model, diff: &Diff) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("updating model {name} in namespace {namespace}");
        let _clone = Model::new(self.api.clone(), &name, &namespace, "")
            .await?
            .update_handler(diff)
            .await?;
        Ok(())
    }

    async fn deleted(&self, object: &crd::Model) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        info!("deleting model {name} in namespace {namespace}");
        Model::new(self.api.clone(), &name, &namespace, "")
            .await?
            .delete_handler()
            .await
    }

    async fn resumed(&self, object: &crd::Model) -> Result<()> {
        self.spawn_daemon(object);
        Ok(())
    }

    async fn purged(&self, object: &crd::Model) {
        self.abort_daemon(object);
    }

    /// Rollout breadcrumbs are bare successor object names; anything
    /// qualified with a domain or a prefix belongs to somebody else
    fn owns_finalizer(&self, token: &str) -> bool {
        !token.contains('/') && !token.contains(':')
    }

    /// A rollout breadcrumb clears once the successor model is available
    /// (or is gone altogether)
    async fn finalizer_cleared(&self, token: &str, namespace: &str) -> Result<bool> {
        let successor = Model::new(self.api.clone(), token, namespace, "").await?;
        let Some(body) = successor.body.as_ref() else {
            return Ok(true);
        };
        Ok(matches!(
            body.status.as_ref().and_then(|status| status.state),
            Some(State::Available)
        ))
    }

    async fn clear_finalizers(&self, object: &crd::Model, tokens: &[String]) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        Model::new(self.api.clone(), &name, &namespace, "")
            .await?
            .remove_finalizers(tokens)
            .await
    }

    async fn mark_failed(&self, object: &crd::Model) {
        set_failed(&self.api, object).await;
    }
}
