use std::collections::BTreeMap;

use garde::Validate;
use serde_json::json;
use tracing::{debug, info};

use mlops_api::crd::{self, State};

use crate::client::ApiClient;
use crate::diff::{Diff, DiffAction};
use crate::error::{Error, Result};
use crate::resources::deployment::{DeploymentParams, ModelDeployment};
use crate::resources::service::ModelService;
use crate::resources::storage::ModelStorage;
use crate::resources::virtual_service::MeshVirtualService;
use crate::resources::{merge_finalizers, named_version, strip_finalizers};
use crate::version::get_version;

/// One Model object together with its collaborators. `name` and `version`
/// are the logical identity; the object name is `{name}-{version}` when the
/// version is non-empty.
pub(crate) struct Model {
    /// Logical model family name
    pub(crate) name: String,
    /// Namespace
    pub(crate) namespace: String,
    /// Version suffix, empty for the user-declared original
    pub(crate) version: String,
    /// Physical object name
    pub(crate) named_version: String,
    /// Current object, absent when not created
    pub(crate) body: Option<crd::Model>,
    /// Cluster api
    api: ApiClient,
    /// Artifact volume pair
    storage: ModelStorage,
    /// Serving deployment
    deployment: ModelDeployment,
    /// Serving service
    service: ModelService,
}

impl Model {
    /// Read the object `{name}-{version}` (or `{name}` when the version is
    /// empty). When it exists, the logical identity is restored from its
    /// status so callers may construct from a bare object name.
    pub(crate) async fn new(
        api: ApiClient,
        name: &str,
        namespace: &str,
        version: &str,
    ) -> Result<Self> {
        let named_version = named_version(name, version);
        let body = api
            .read_namespaced::<crd::Model>(&named_version, namespace)
            .await?;
        let mut name = name.to_owned();
        let mut version = version.to_owned();
        if let Some(status) = body.as_ref().and_then(|object| object.status.as_ref()) {
            if let Some(model) = status.model.as_ref().filter(|m| !m.is_empty()) {
                name = model.clone();
            }
            if let Some(suffix) = status.version.as_ref() {
                version = suffix.clone();
            }
        }
        let storage = ModelStorage::new(api.clone(), &named_version, namespace).await?;
        let deployment = ModelDeployment::new(api.clone(), &named_version, namespace).await?;
        let service = ModelService::new(api.clone(), &named_version, namespace).await?;
        Ok(Self {
            name,
            namespace: namespace.to_owned(),
            version,
            named_version,
            body,
            api,
            storage,
            deployment,
            service,
        })
    }

    /// Create the ML object. Collaborators are not allocated here; that is
    /// the job of `create_handler`.
    pub(crate) async fn create(
        &mut self,
        spec: crd::ModelSpec,
        mut status: crd::ModelStatus,
    ) -> Result<()> {
        if self.body.is_some() {
            return Ok(());
        }
        spec.validate(&())
            .map_err(|report| Error::Validation(report.to_string()))?;
        let mut object = crd::Model::new(&self.named_version, spec);
        object.metadata.namespace = Some(self.namespace.clone());
        object.metadata.labels = Some(BTreeMap::from([
            ("model".to_owned(), self.name.clone()),
            ("version".to_owned(), self.version.clone()),
        ]));
        status.model = Some(self.name.clone());
        status.version = Some(self.version.clone());
        if status.state.is_none() {
            status.state = Some(State::Creating);
        }
        let _created: crd::Model = self
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

    /// Delete the ML object; collaborator teardown is `delete_handler`
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.body.is_none() {
            return Ok(());
        }
        let _deleted = self
            .api
            .delete_namespaced::<crd::Model>(&self.named_version, &self.namespace)
            .await?;
        self.body = None;
        Ok(())
    }

    /// Resolve the EndpointConfig clone this version belongs to
    async fn endpoint_config(&self) -> Result<Option<crd::EndpointConfig>> {
        let Some(status) = self.body.as_ref().and_then(|body| body.status.as_ref()) else {
            return Ok(None);
        };
        let (Some(config), Some(config_version)) = (
            status.endpoint_config.as_ref().filter(|c| !c.is_empty()),
            status
                .endpoint_config_version
                .as_ref()
                .filter(|v| !v.is_empty()),
        ) else {
            return Ok(None);
        };
        self.api
            .read_namespaced(&format!("{config}-{config_version}"), &self.namespace)
            .await
    }

    /// Allocate storage, deployment and service for this version. A no-op
    /// when no endpoint config references this model.
    pub(crate) async fn create_handler(&mut self) -> Result<()> {
        let Some(config) = self.endpoint_config().await? else {
            debug!(
                "model {} has no active endpoint config, nothing to allocate",
                self.named_version
            );
            return Ok(());
        };
        let Some(variant) = config
            .spec
            .models
            .iter()
            .find(|variant| variant.model == self.name)
        else {
            debug!(
                "model {} is not referenced by its endpoint config, nothing to allocate",
                self.named_version
            );
            return Ok(());
        };
        let Some(body) = self.body.as_ref() else {
            return Ok(());
        };
        let spec = body.spec.clone();
        self.storage.create(&variant.size, &variant.path).await?;
        self.deployment
            .create(&DeploymentParams {
                image: spec.image,
                artifact: spec.artifact.unwrap_or_default(),
                command: spec.command,
                args: spec.args,
                instances: variant.instances,
                cpus: variant.cpus.clone(),
                memory: variant.memory.clone(),
            })
            .await?;
        self.service.create().await?;
        Ok(())
    }

    /// Classify the structured diff. An artifact change rolls the model to a
    /// fresh version and returns the clone; image, command or args changes
    /// patch the existing deployment in place; everything else is a no-op.
    pub(crate) async fn update_handler(&mut self, diff: &Diff) -> Result<Option<Model>> {
        if self.body.is_none() || self.deployment.body().is_none() {
            debug!("model {} owns no collaborators, ignoring update", self.named_version);
            return Ok(None);
        }
        if diff
            .find(&[DiffAction::Change], &["spec", "artifact"])
            .is_some()
        {
            return self.redeploy().await.map(Some);
        }
        let image = diff.find(&[DiffAction::Change], &["spec", "image"]);
        let command = diff.find(&[DiffAction::Add, DiffAction::Change], &["spec", "command"]);
        let args = diff.find(&[DiffAction::Add, DiffAction::Change], &["spec", "args"]);
        if image.is_none() && command.is_none() && args.is_none() {
            return Ok(None);
        }
        let Some(body) = self.body.clone() else {
            return Ok(None);
        };
        let Some((instances, cpus, memory)) = self.deployment.current_shape() else {
            return Err(Error::MissingObject(".spec.template.spec.containers"));
        };
        // the deployment rolls the new pod template out itself
        self.deployment
            .update(&DeploymentParams {
                image: body.spec.image.clone(),
                artifact: body.spec.artifact.clone().unwrap_or_default(),
                command: body.spec.command.clone(),
                args: body.spec.args.clone(),
                instances,
                cpus,
                memory,
            })
            .await?;
        Ok(None)
    }

    /// Roll this version over to a fresh clone: create and warm the clone,
    /// repoint the owning config's routing, then retire self behind a
    /// breadcrumb finalizer naming the successor.
    async fn redeploy(&mut self) -> Result<Model> {
        let Some(body) = self.body.clone() else {
            return Err(Error::MissingObject("model body"));
        };
        let status = body.status.clone().unwrap_or_default();
        // an interrupted earlier rollout may have left a matching clone
        let clone_version = match self.find_existing_clone(&body).await? {
            Some(version) => version,
            None => get_version(),
        };
        let mut clone = Model::new(self.api.clone(), &self.name, &self.namespace, &clone_version)
            .await?;
        clone
            .create(
                body.spec.clone(),
                crd::ModelStatus {
                    endpoint: status.endpoint.clone(),
                    endpoint_config: status.endpoint_config.clone(),
                    endpoint_config_version: status.endpoint_config_version.clone(),
                    ..crd::ModelStatus::default()
                },
            )
            .await?;
        clone.create_handler().await?;
        // traffic may only shift once the clone can actually serve it
        clone.await_ready().await?;
        self.repoint_routing(&clone).await?;
        info!(
            "model {} rolled over to {}",
            self.named_version, clone.named_version
        );
        self.add_finalizers(&[clone.named_version.clone()]).await?;
        self.delete().await?;
        Ok(clone)
    }

    /// Version suffix of a clone a previous interrupted rollout created for
    /// the same artifact, if any
    async fn find_existing_clone(&self, body: &crd::Model) -> Result<Option<String>> {
        let models = self.api.list_namespaced::<crd::Model>(&self.namespace).await?;
        let current = body.status.clone().unwrap_or_default();
        Ok(models
            .into_iter()
            .filter_map(|candidate| {
                let status = candidate.status?;
                let version = status.version.filter(|version| !version.is_empty())?;
                if status.model.as_deref() == Some(self.name.as_str())
                    && version != self.version
                    && status.endpoint_config_version == current.endpoint_config_version
                    && candidate.spec.artifact == body.spec.artifact
                {
                    Some(version)
                } else {
                    None
                }
            })
            .next())
    }

    /// Swap this version's host for the clone's in the owning config's
    /// routing rule and recorded model versions
    async fn repoint_routing(&self, clone: &Model) -> Result<()> {
        let Some(config) = self.endpoint_config().await? else {
            return Ok(());
        };
        let Some(config_name) = config.metadata.name.clone() else {
            return Err(Error::MissingObject(".metadata.name"));
        };
        let status = config.status.clone().unwrap_or_default();
        let model_versions: Vec<String> = status
            .model_versions
            .unwrap_or_default()
            .into_iter()
            .map(|version| {
                if version == self.named_version {
                    clone.named_version.clone()
                } else {
                    version
                }
            })
            .collect();
        let mut virtual_service =
            MeshVirtualService::new(self.api.clone(), &config_name, &self.namespace).await?;
        virtual_service
            .swap_host(&self.named_version, &clone.named_version)
            .await?;
        let _config: crd::EndpointConfig = self
            .api
            .patch_namespaced_status(
                &config_name,
                &self.namespace,
                &json!({"status": {"model_versions": model_versions}}),
            )
            .await?;
        Ok(())
    }

    /// Tear down service, deployment and storage, in that order
    pub(crate) async fn delete_handler(&mut self) -> Result<()> {
        self.service.delete().await?;
        self.deployment.delete().await?;
        self.storage.delete().await?;
        Ok(())
    }

    /// Block until the serving deployment is ready
    pub(crate) async fn await_ready(&self) -> Result<()> {
        self.deployment.await_ready().await
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
