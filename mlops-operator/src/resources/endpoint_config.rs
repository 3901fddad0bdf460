use std::collections::{BTreeMap, HashMap, HashSet};

use garde::Validate;
use serde_json::json;
use tracing::{debug, info};

use mlops_api::consts::MODEL_SERVING_PORT;
use mlops_api::crd::{self, State};
use mlops_api::istio::weighted_route;

use crate::client::ApiClient;
use crate::diff::{Diff, DiffAction};
use crate::error::{Error, Result};
use crate::resources::deployment::ModelDeployment;
use crate::resources::model::Model;
use crate::resources::storage::ModelStorage;
use crate::resources::virtual_service::MeshVirtualService;
use crate::resources::{merge_finalizers, named_version, strip_finalizers};
use crate::version::get_version;

/// One EndpointConfig object together with its routing rule. `name` is the
/// logical config family; versioned clones are what endpoints actually
/// serve from.
pub(crate) struct EndpointConfig {
    /// Logical config family name
    pub(crate) name: String,
    /// Namespace
    pub(crate) namespace: String,
    /// Version suffix, empty for the user-declared original
    pub(crate) version: String,
    /// Physical object name
    pub(crate) named_version: String,
    /// Current object, absent when not created
    pub(crate) body: Option<crd::EndpointConfig>,
    /// Cluster api
    api: ApiClient,
    /// Routing rule owned by this clone
    virtual_service: MeshVirtualService,
}

impl EndpointConfig {
    /// Read the object `{name}-{version}` (or `{name}` when the version is
    /// empty), restoring the logical identity from its status when present
    pub(crate) async fn new(
        api: ApiClient,
        name: &str,
        namespace: &str,
        version: &str,
    ) -> Result<Self> {
        let named_version = named_version(name, version);
        let body = api
            .read_namespaced::<crd::EndpointConfig>(&named_version, namespace)
            .await?;
        let mut name = name.to_owned();
        let mut version = version.to_owned();
        if let Some(status) = body.as_ref().and_then(|object| object.status.as_ref()) {
            if let Some(config) = status.endpoint_config.as_ref().filter(|c| !c.is_empty()) {
                name = config.clone();
            }
            if let Some(suffix) = status.version.as_ref() {
                version = suffix.clone();
            }
        }
        let virtual_service = MeshVirtualService::new(api.clone(), &named_version, namespace).await?;
        Ok(Self {
            name,
            namespace: namespace.to_owned(),
            version,
            named_version,
            body,
            api,
            virtual_service,
        })
    }

    /// Create the ML object; collaborators are allocated by `create_handler`
    pub(crate) async fn create(
        &mut self,
        models: Vec<crd::ModelVariant>,
        mut status: crd::EndpointConfigStatus,
    ) -> Result<()> {
        if self.body.is_some() {
            return Ok(());
        }
        let spec = crd::EndpointConfigSpec { models };
        spec.validate(&())
            .map_err(|report| Error::Validation(report.to_string()))?;
        let mut object = crd::EndpointConfig::new(&self.named_version, spec);
        object.metadata.namespace = Some(self.namespace.clone());
        let mut labels = BTreeMap::from([("endpoint_config".to_owned(), self.name.clone())]);
        if !self.version.is_empty() {
            let _ = labels.insert("version".to_owned(), self.version.clone());
        }
        object.metadata.labels = Some(labels);
        status.endpoint_config = Some(self.name.clone());
        if !self.version.is_empty() {
            status.version = Some(self.version.clone());
        }
        if status.state.is_none() {
            status.state = Some(State::Creating);
        }
        let _created: crd::EndpointConfig = self
            .api
            .create_namespaced_idempotent(&self.namespace, &self.named_version, &object)
            .await?;
        self.body = Some(
            self.api
                .patch_namespaced_status(
                    &self.named_version,
                    &self.namespace,
                    &json!({ "status": status }),
                )
                .await?,
        );
        Ok(())
    }

    /// Clone this config into a fresh version bound to `endpoint`
    pub(crate) async fn clone_for(&self, endpoint: &str) -> Result<EndpointConfig> {
        let Some(body) = self.body.as_ref() else {
            return Err(Error::AbsentReferent(self.named_version.clone()));
        };
        let mut clone =
            EndpointConfig::new(self.api.clone(), &self.name, &self.namespace, &get_version())
                .await?;
        clone
            .create(
                body.spec.models.clone(),
                crd::EndpointConfigStatus {
                    endpoint: Some(endpoint.to_owned()),
                    ..crd::EndpointConfigStatus::default()
                },
            )
            .await?;
        Ok(clone)
    }

    /// Delete the ML object; collaborator teardown is `delete_handler`
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.body.is_none() {
            return Ok(());
        }
        let _deleted = self
            .api
            .delete_namespaced::<crd::EndpointConfig>(&self.named_version, &self.namespace)
            .await?;
        self.body = None;
        Ok(())
    }

    /// Endpoint whose spec references this config family
    pub(crate) async fn attached_endpoint(&self) -> Result<Option<crd::Endpoint>> {
        let endpoints = self
            .api
            .list_namespaced::<crd::Endpoint>(&self.namespace)
            .await?;
        Ok(endpoints
            .into_iter()
            .find(|endpoint| endpoint.spec.config == self.name))
    }

    /// Whether this clone's rollout has been published as available
    pub(crate) fn is_available(&self) -> bool {
        matches!(
            self.body
                .as_ref()
                .and_then(|body| body.status.as_ref())
                .and_then(|status| status.state),
            Some(State::Available)
        )
    }

    /// Clone each referenced base model into a version owned by this config
    /// and publish the routing rule. A no-op when the model versions are
    /// already recorded, which is what makes re-entry after a partial
    /// failure resume instead of duplicate.
    pub(crate) async fn create_handler(&mut self) -> Result<()> {
        let Some(body) = self.body.clone() else {
            return Ok(());
        };
        let status = body.status.clone().unwrap_or_default();
        if status
            .model_versions
            .as_ref()
            .map_or(false, |versions| !versions.is_empty())
        {
            debug!("endpoint config {} is already allocated", self.named_version);
            return Ok(());
        }
        let Some(endpoint_name) = status.endpoint.clone().filter(|name| !name.is_empty()) else {
            debug!(
                "endpoint config {} has no endpoint attached, staying dormant",
                self.named_version
            );
            return Ok(());
        };
        let Some(endpoint) = self
            .api
            .read_namespaced::<crd::Endpoint>(&endpoint_name, &self.namespace)
            .await?
        else {
            return Err(Error::AbsentReferent(endpoint_name));
        };

        let mut model_versions = Vec::with_capacity(body.spec.models.len());
        let mut routes = Vec::with_capacity(body.spec.models.len());
        for variant in &body.spec.models {
            let model = self.materialize_variant(variant).await?;
            routes.push(weighted_route(
                &model.named_version,
                MODEL_SERVING_PORT,
                variant.weight,
            ));
            model_versions.push(model.named_version);
        }
        self.virtual_service
            .create(
                &format!("{endpoint_name}-gw"),
                &[endpoint.spec.host.clone()],
                routes,
            )
            .await?;
        self.body = Some(
            self.api
                .patch_namespaced_status(
                    &self.named_version,
                    &self.namespace,
                    &json!({"status": {"model_versions": model_versions, "state": State::Available}}),
                )
                .await?,
        );
        info!("endpoint config {} allocated", self.named_version);
        Ok(())
    }

    /// Clone the variant's base model into a version owned by this config,
    /// or resume with the clone an interrupted earlier pass created
    async fn materialize_variant(&self, variant: &crd::ModelVariant) -> Result<Model> {
        let endpoint = self
            .body
            .as_ref()
            .and_then(|body| body.status.as_ref())
            .and_then(|status| status.endpoint.clone());
        if let Some(existing) = self.find_variant(&variant.model).await? {
            let mut model = Model::new(self.api.clone(), &existing, &self.namespace, "").await?;
            model.create_handler().await?;
            return Ok(model);
        }
        let Some(base) = self
            .api
            .read_namespaced::<crd::Model>(&variant.model, &self.namespace)
            .await?
        else {
            return Err(Error::AbsentReferent(variant.model.clone()));
        };
        let mut model = Model::new(
            self.api.clone(),
            &variant.model,
            &self.namespace,
            &get_version(),
        )
        .await?;
        model
            .create(
                base.spec.clone(),
                crd::ModelStatus {
                    endpoint,
                    endpoint_config: Some(self.name.clone()),
                    endpoint_config_version: Some(self.version.clone()),
                    ..crd::ModelStatus::default()
                },
            )
            .await?;
        model.create_handler().await?;
        Ok(model)
    }

    /// Object name of an existing versioned clone of `model` owned by this
    /// config version, if any
    async fn find_variant(&self, model: &str) -> Result<Option<String>> {
        let models = self.api.list_namespaced::<crd::Model>(&self.namespace).await?;
        Ok(models
            .into_iter()
            .filter_map(|candidate| {
                let name = candidate.metadata.name?;
                let status = candidate.status?;
                if status.model.as_deref() == Some(model)
                    && status.endpoint_config.as_deref() == Some(self.name.as_str())
                    && status.endpoint_config_version.as_deref() == Some(self.version.as_str())
                {
                    Some(name)
                } else {
                    None
                }
            })
            .next())
    }

    /// Dispatch a spec edit. Only the active clone of an attached endpoint
    /// is acted on; membership changes take priority over weight changes.
    pub(crate) async fn update_handler(&mut self, diff: &Diff) -> Result<()> {
        let Some(endpoint) = self.attached_endpoint().await? else {
            debug!("endpoint config {} is not attached, ignoring update", self.name);
            return Ok(());
        };
        let Some(models_line) = diff.find(
            &[DiffAction::Change, DiffAction::Add],
            &["spec", "models"],
        ) else {
            return Ok(());
        };
        let old_models: Vec<crd::ModelVariant> = models_line.old_as().unwrap_or_default();
        let new_models: Vec<crd::ModelVariant> = models_line.new_as().unwrap_or_default();
        crd::EndpointConfigSpec {
            models: new_models.clone(),
        }
        .validate(&())
        .map_err(|report| Error::Validation(report.to_string()))?;

        let Some(active_name) = endpoint
            .status
            .as_ref()
            .and_then(|status| status.endpoint_config_version.clone())
            .filter(|version| !version.is_empty())
        else {
            debug!(
                "endpoint config {} has no active clone yet, ignoring update",
                self.name
            );
            return Ok(());
        };
        let mut active = EndpointConfig::new(self.api.clone(), &active_name, &self.namespace, "")
            .await?;
        if active.body.is_none() {
            return Err(Error::AbsentReferent(active_name));
        }
        if membership_changed(&old_models, &new_models) {
            active.replace_members(&old_models, &new_models).await
        } else {
            active.update_weights(&new_models).await
        }
    }

    /// Re-weight the existing routes; the model set is unchanged
    async fn update_weights(&mut self, models: &[crd::ModelVariant]) -> Result<()> {
        let status = self
            .body
            .as_ref()
            .and_then(|body| body.status.clone())
            .unwrap_or_default();
        let model_versions = status.model_versions.unwrap_or_default();
        let routes = model_versions
            .iter()
            .zip(models.iter())
            .map(|(host, variant)| weighted_route(host, MODEL_SERVING_PORT, variant.weight))
            .collect();
        self.virtual_service.reroute(routes).await?;
        // grown artifact volumes expand in place; capacity never shrinks
        for (version, variant) in model_versions.iter().zip(models.iter()) {
            let mut storage = ModelStorage::new(self.api.clone(), version, &self.namespace).await?;
            storage.update(&variant.size).await?;
        }
        info!("endpoint config {} re-weighted", self.named_version);
        Ok(())
    }

    /// Roll the served model set from `old` to `new`: materialize additions,
    /// wait for them to be routable, shift traffic, then tear down removals
    async fn replace_members(
        &mut self,
        old: &[crd::ModelVariant],
        new: &[crd::ModelVariant],
    ) -> Result<()> {
        let status = self
            .body
            .as_ref()
            .and_then(|body| body.status.clone())
            .unwrap_or_default();
        let old_versions = status.model_versions.unwrap_or_default();
        let existing: HashMap<&str, &str> = old
            .iter()
            .zip(old_versions.iter())
            .map(|(variant, version)| (variant.model.as_str(), version.as_str()))
            .collect();

        let mut model_versions = Vec::with_capacity(new.len());
        let mut routes = Vec::with_capacity(new.len());
        let mut added = Vec::new();
        for variant in new {
            match existing.get(variant.model.as_str()) {
                Some(version) => {
                    routes.push(weighted_route(version, MODEL_SERVING_PORT, variant.weight));
                    model_versions.push((*version).to_owned());
                }
                None => {
                    let model = self.materialize_variant(variant).await?;
                    routes.push(weighted_route(
                        &model.named_version,
                        MODEL_SERVING_PORT,
                        variant.weight,
                    ));
                    model_versions.push(model.named_version.clone());
                    added.push(model);
                }
            }
        }
        // new members must be able to serve before traffic shifts to them
        for model in &added {
            model.await_ready().await?;
        }
        self.virtual_service.reroute(routes).await?;
        self.body = Some(
            self.api
                .patch_namespaced_status(
                    &self.named_version,
                    &self.namespace,
                    &json!({"status": {"model_versions": model_versions}}),
                )
                .await?,
        );
        // traffic is off the removed versions now, tear them down
        let kept: HashSet<&str> = new.iter().map(|variant| variant.model.as_str()).collect();
        for (variant, version) in old.iter().zip(old_versions.iter()) {
            if !kept.contains(variant.model.as_str()) {
                let mut model = Model::new(self.api.clone(), version, &self.namespace, "").await?;
                model.delete_handler().await?;
                model.delete().await?;
                info!("endpoint config {} retired {version}", self.named_version);
            }
        }
        Ok(())
    }

    /// Tear down every versioned model, then the routing rule
    pub(crate) async fn delete_handler(&mut self) -> Result<()> {
        if self.body.is_some() {
            if let Err(err) = self
                .api
                .patch_namespaced_status::<crd::EndpointConfig, _>(
                    &self.named_version,
                    &self.namespace,
                    &json!({"status": {"state": State::Deleting}}),
                )
                .await
            {
                debug!("could not mark {} as deleting: {err}", self.named_version);
            }
        }
        let versions = self
            .body
            .as_ref()
            .and_then(|body| body.status.as_ref())
            .and_then(|status| status.model_versions.clone())
            .unwrap_or_default();
        for version in versions {
            let mut model = Model::new(self.api.clone(), &version, &self.namespace, "").await?;
            model.delete_handler().await?;
            model.delete().await?;
        }
        self.virtual_service.delete().await?;
        Ok(())
    }

    /// Block until every served deployment is ready, then publish
    /// availability on the status
    pub(crate) async fn await_available(&mut self) -> Result<()> {
        let versions = self
            .body
            .as_ref()
            .and_then(|body| body.status.as_ref())
            .and_then(|status| status.model_versions.clone())
            .unwrap_or_default();
        for version in &versions {
            let deployment = ModelDeployment::new(self.api.clone(), version, &self.namespace)
                .await?;
            deployment.await_ready().await?;
        }
        self.body = Some(
            self.api
                .patch_namespaced_status(
                    &self.named_version,
                    &self.namespace,
                    &json!({"status": {"state": State::Available}}),
                )
                .await?,
        );
        Ok(())
    }

    /// Union `finalizers` into the object metadata
    pub(crate) async fn add_finalizers(&mut self, finalizers: &[String]) -> Result<()> {
        let Some(body) = self.body.as_ref() else {
            return Ok(());
        };
        let merged = merge_finalizers(body.metadata.finalizers.as_ref(), finalizers);
        self.body = Some(
            self.api
                .patch_namespaced(
                    &self.named_version,
                    &self.namespace,
                    &json!({"metadata": {"finalizers": merged}}),
                )
                .await?,
        );
        Ok(())
    }

    /// Remove `finalizers` from the object metadata
    pub(crate) async fn remove_finalizers(&mut self, finalizers: &[String]) -> Result<()> {
        let Some(body) = self.body.as_ref() else {
            return Ok(());
        };
        let remaining = strip_finalizers(body.metadata.finalizers.as_ref(), finalizers);
        self.body = Some(
            self.api
                .patch_namespaced(
                    &self.named_version,
                    &self.namespace,
                    &json!({"metadata": {"finalizers": remaining}}),
                )
                .await?,
        );
        Ok(())
    }
}

/// Whether an edit of `spec.models` changes the served model set rather
/// than just the weights. Membership dispatch has priority: an edit that
/// touches both weights and members is a membership change.
pub(crate) fn membership_changed(old: &[crd::ModelVariant], new: &[crd::ModelVariant]) -> bool {
    old.len() != new.len()
        || old
            .iter()
            .zip(new.iter())
            .any(|(old_variant, new_variant)| old_variant.model != new_variant.model)
}

#[cfg(test)]
mod test {
    use mlops_api::crd::ModelVariant;

    use super::membership_changed;

    fn variant(model: &str, weight: i32) -> ModelVariant {
        ModelVariant {
            model: model.to_owned(),
            weight,
            cpus: "100m".to_owned(),
            memory: "100Mi".to_owned(),
            instances: 1,
            size: "1Gi".to_owned(),
            path: "/mnt/nfs/models".to_owned(),
        }
    }

    #[test]
    fn test_weight_only_edit() {
        let old = [variant("a", 100)];
        let new = [variant("a", 50)];
        assert!(!membership_changed(&old, &new));
    }

    #[test]
    fn test_swap_is_membership() {
        let old = [variant("a", 100)];
        let new = [variant("b", 100)];
        assert!(membership_changed(&old, &new));
    }

    #[test]
    fn test_add_remove_are_membership() {
        let old = [variant("a", 50)];
        let new = [variant("a", 50), variant("b", 50)];
        assert!(membership_changed(&old, &new));
        assert!(membership_changed(&new, &old));
    }

    #[test]
    fn test_mixed_edit_is_membership() {
        // weights move and a member is swapped at the same time
        let old = [variant("a", 50), variant("b", 50)];
        let new = [variant("a", 80), variant("c", 20)];
        assert!(membership_changed(&old, &new));
    }
}
