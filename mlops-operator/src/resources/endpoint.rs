use garde::Validate;
use serde_json::json;
use tracing::{debug, info};

use mlops_api::consts::{MODEL_SERVING_PORT, STARTED_FINALIZER_PREFIX};
use mlops_api::crd::{self, State};

use crate::client::ApiClient;
use crate::diff::{Diff, DiffAction};
use crate::error::{Error, Result};
use crate::resources::endpoint_config::EndpointConfig;
use crate::resources::gateway::MeshGateway;

/// One Endpoint object together with its ingress gateway. The active
/// EndpointConfig clone is a back-reference held in the status, resolved
/// through the cluster store on every use.
pub(crate) struct Endpoint {
    /// Object name
    pub(crate) name: String,
    /// Namespace
    pub(crate) namespace: String,
    /// Current object, absent when not created
    pub(crate) body: Option<crd::Endpoint>,
    /// Cluster api
    api: ApiClient,
    /// Ingress gateway owned by this endpoint
    gateway: MeshGateway,
}

impl Endpoint {
    /// Read current state on construction
    pub(crate) async fn new(api: ApiClient, name: &str, namespace: &str) -> Result<Self> {
        let body = api.read_namespaced::<crd::Endpoint>(name, namespace).await?;
        let gateway = MeshGateway::new(api.clone(), &format!("{name}-gw"), namespace).await?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            body,
            api,
            gateway,
        })
    }

    /// Patch own status
    async fn patch_status(&mut self, patch: &serde_json::Value) -> Result<()> {
        self.body = Some(
            self.api
                .patch_namespaced_status::<crd::Endpoint, _>(&self.name, &self.namespace, patch)
                .await?,
        );
        Ok(())
    }

    /// An existing clone of `config` already bound to this endpoint, if any.
    /// Looking it up keeps re-entered handlers from cloning twice.
    async fn bound_clone(&self, config: &str) -> Result<Option<EndpointConfig>> {
        let configs = self
            .api
            .list_namespaced::<crd::EndpointConfig>(&self.namespace)
            .await?;
        let bound = configs.into_iter().find(|candidate| {
            let Some(status) = candidate.status.as_ref() else {
                return false;
            };
            status.endpoint.as_deref() == Some(self.name.as_str())
                && status.endpoint_config.as_deref() == Some(config)
        });
        let Some(bound) = bound else {
            return Ok(None);
        };
        let Some(name) = bound.metadata.name.as_ref() else {
            return Err(Error::MissingObject(".metadata.name"));
        };
        Ok(Some(
            EndpointConfig::new(self.api.clone(), name, &self.namespace, "").await?,
        ))
    }

    /// Create the gateway and bind a fresh clone of the referenced config.
    /// The clone's `create_handler` allocates the models and the routing
    /// rule.
    pub(crate) async fn create_handler(&mut self) -> Result<()> {
        let Some(body) = self.body.clone() else {
            return Ok(());
        };
        body.spec
            .validate(&())
            .map_err(|report| Error::Validation(report.to_string()))?;
        let host = body.spec.host.clone();
        self.gateway
            .create(&self.name, &[host], MODEL_SERVING_PORT)
            .await?;

        let mut active = match self.bound_clone(&body.spec.config).await? {
            Some(active) => active,
            None => {
                let base =
                    EndpointConfig::new(self.api.clone(), &body.spec.config, &self.namespace, "")
                        .await?;
                if base.body.is_none() {
                    return Err(Error::AbsentReferent(body.spec.config.clone()));
                }
                base.clone_for(&self.name).await?
            }
        };
        self.patch_status(&json!({"status": {
            "endpoint_config_version": active.named_version,
            "state": State::Creating,
        }}))
        .await?;
        active.create_handler().await?;
        self.patch_status(&json!({"status": {"state": State::Available}}))
            .await?;
        info!("endpoint {} is serving through {}", self.name, active.named_version);
        Ok(())
    }

    /// Refresh the gateway, then dispatch a config swap if the diff carries
    /// one: the new clone is brought up and only retires its predecessor
    /// once it is available.
    pub(crate) async fn update_handler(&mut self, diff: &Diff) -> Result<()> {
        let Some(body) = self.body.clone() else {
            return Ok(());
        };
        body.spec
            .validate(&())
            .map_err(|report| Error::Validation(report.to_string()))?;
        self.gateway
            .update(&self.name, &[body.spec.host.clone()], MODEL_SERVING_PORT)
            .await?;

        let Some(config_line) = diff.find(&[DiffAction::Change], &["spec", "config"]) else {
            return Ok(());
        };
        let Some(new_config) = config_line.new_as::<String>() else {
            return Ok(());
        };

        let previous = body
            .status
            .as_ref()
            .and_then(|status| status.endpoint_config_version.clone())
            .filter(|version| !version.is_empty());
        self.patch_status(&json!({"status": {"state": State::Updating}}))
            .await?;

        let mut next = match self.bound_clone(&new_config).await? {
            Some(next) => next,
            None => {
                let base =
                    EndpointConfig::new(self.api.clone(), &new_config, &self.namespace, "").await?;
                if base.body.is_none() {
                    return Err(Error::AbsentReferent(new_config));
                }
                base.clone_for(&self.name).await?
            }
        };
        next.create_handler().await?;
        next.await_available().await?;

        if let Some(previous_name) = previous {
            if previous_name != next.named_version {
                let mut old =
                    EndpointConfig::new(self.api.clone(), &previous_name, &self.namespace, "")
                        .await?;
                old.add_finalizers(&[format!(
                    "{STARTED_FINALIZER_PREFIX}{}",
                    next.named_version
                )])
                .await?;
                old.delete().await?;
                debug!("endpoint {} retired {previous_name}", self.name);
            }
        }
        self.patch_status(&json!({"status": {
            "endpoint_config_version": next.named_version,
            "state": State::Available,
        }}))
        .await?;
        info!("endpoint {} swapped to {}", self.name, next.named_version);
        Ok(())
    }

    /// Tear down the active config clone, then the gateway
    pub(crate) async fn delete_handler(&mut self) -> Result<()> {
        let active = self
            .body
            .as_ref()
            .and_then(|body| body.status.as_ref())
            .and_then(|status| status.endpoint_config_version.clone())
            .filter(|version| !version.is_empty());
        if let Some(active_name) = active {
            let mut config =
                EndpointConfig::new(self.api.clone(), &active_name, &self.namespace, "").await?;
            config.delete_handler().await?;
            config.delete().await?;
        }
        self.gateway.delete().await?;
        Ok(())
    }
}
