use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tokio::time::{sleep, Instant};

use mlops_api::consts::{
    MODEL_INIT_IMAGE, MODEL_MOUNT_PATH, MODEL_PATH_ENV, MODEL_SERVING_PORT, MODEL_URL_ENV,
};

use crate::client::ApiClient;
use crate::consts::{READY_POLL_INTERVAL, READY_TIMEOUT};
use crate::error::{Error, Result};
use crate::resources::{merge_finalizers, strip_finalizers};

/// Everything the deployment body is built from
#[derive(Clone, Debug, Default)]
pub(crate) struct DeploymentParams {
    /// Serving container image
    pub(crate) image: String,
    /// Artifact location handed to the init container
    pub(crate) artifact: String,
    /// Serving container entrypoint override
    pub(crate) command: Option<Vec<String>>,
    /// Serving container arguments
    pub(crate) args: Option<Vec<String>>,
    /// Replica count
    pub(crate) instances: i32,
    /// CPU limit and request
    pub(crate) cpus: String,
    /// Memory limit and request
    pub(crate) memory: String,
}

/// Deployment running one model version
pub(crate) struct ModelDeployment {
    /// Object name, equals the model version it serves
    name: String,
    /// Namespace
    namespace: String,
    /// Cluster api
    api: ApiClient,
    /// Current deployment, absent when not created
    body: Option<Deployment>,
}

impl ModelDeployment {
    /// Read current state on construction
    pub(crate) async fn new(api: ApiClient, name: &str, namespace: &str) -> Result<Self> {
        let body = api.read_namespaced::<Deployment>(name, namespace).await?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            api,
            body,
        })
    }

    /// Current deployment body
    pub(crate) fn body(&self) -> Option<&Deployment> {
        self.body.as_ref()
    }

    /// Replica count and resource shape of the live deployment
    pub(crate) fn current_shape(&self) -> Option<(i32, String, String)> {
        let spec = self.body.as_ref()?.spec.as_ref()?;
        let container = spec.template.spec.as_ref()?.containers.first()?;
        let limits = container.resources.as_ref()?.limits.as_ref()?;
        Some((
            spec.replicas.unwrap_or(1),
            limits.get("cpu")?.0.clone(),
            limits.get("memory")?.0.clone(),
        ))
    }

    /// Build the deployment body: one artifact init container, one serving
    /// container, both mounting the model volume
    fn build(name: &str, namespace: &str, params: &DeploymentParams) -> Deployment {
        let labels = BTreeMap::from([("model".to_owned(), name.to_owned())]);
        let resources = BTreeMap::from([
            ("cpu".to_owned(), Quantity(params.cpus.clone())),
            ("memory".to_owned(), Quantity(params.memory.clone())),
        ]);
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(params.instances),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_owned()),
                    ..DeploymentStrategy::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers: Some(vec![Container {
                            name: format!("{name}-init"),
                            image: Some(MODEL_INIT_IMAGE.to_owned()),
                            env: Some(vec![
                                EnvVar {
                                    name: MODEL_URL_ENV.to_owned(),
                                    value: Some(params.artifact.clone()),
                                    value_from: None,
                                },
                                EnvVar {
                                    name: MODEL_PATH_ENV.to_owned(),
                                    value: Some(MODEL_MOUNT_PATH.to_owned()),
                                    value_from: None,
                                },
                            ]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: name.to_owned(),
                                mount_path: MODEL_MOUNT_PATH.to_owned(),
                                ..VolumeMount::default()
                            }]),
                            ..Container::default()
                        }]),
                        containers: vec![Container {
                            name: name.to_owned(),
                            image: Some(params.image.clone()),
                            command: params.command.clone(),
                            args: params.args.clone(),
                            resources: Some(ResourceRequirements {
                                limits: Some(resources.clone()),
                                requests: Some(resources),
                                ..ResourceRequirements::default()
                            }),
                            ports: Some(vec![ContainerPort {
                                container_port: MODEL_SERVING_PORT,
                                ..ContainerPort::default()
                            }]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: name.to_owned(),
                                mount_path: MODEL_MOUNT_PATH.to_owned(),
                                read_only: Some(true),
                                ..VolumeMount::default()
                            }]),
                            ..Container::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: name.to_owned(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: format!("{name}-pvc"),
                                read_only: None,
                            }),
                            ..Volume::default()
                        }]),
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    /// Create the deployment; a no-op when it already exists
    pub(crate) async fn create(&mut self, params: &DeploymentParams) -> Result<()> {
        if self.body.is_some() {
            return Ok(());
        }
        let body = Self::build(&self.name, &self.namespace, params);
        self.body = Some(
            self.api
                .create_namespaced_idempotent(&self.namespace, &self.name, &body)
                .await?,
        );
        Ok(())
    }

    /// Patch with the rebuilt body; falls through to create when absent
    pub(crate) async fn update(&mut self, params: &DeploymentParams) -> Result<()> {
        if self.body.is_none() {
            return self.create(params).await;
        }
        let body = Self::build(&self.name, &self.namespace, params);
        self.body = Some(
            self.api
                .patch_namespaced(&self.name, &self.namespace, &body)
                .await?,
        );
        Ok(())
    }

    /// Delete the deployment; a no-op when it is already gone
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.body.is_none() {
            return Ok(());
        }
        let _deleted = self
            .api
            .delete_namespaced::<Deployment>(&self.name, &self.namespace)
            .await?;
        self.body = None;
        Ok(())
    }

    /// Union `finalizers` into the deployment metadata
    pub(crate) async fn add_finalizers(&mut self, finalizers: &[String]) -> Result<()> {
        let Some(body) = self.body.as_ref() else {
            return Ok(());
        };
        let merged = merge_finalizers(body.metadata.finalizers.as_ref(), finalizers);
        self.body = Some(
            self.api
                .patch_namespaced(
                    &self.name,
                    &self.namespace,
                    &serde_json::json!({"metadata": {"finalizers": merged}}),
                )
                .await?,
        );
        Ok(())
    }

    /// Remove `finalizers` from the deployment metadata
    pub(crate) async fn remove_finalizers(&mut self, finalizers: &[String]) -> Result<()> {
        let Some(body) = self.body.as_ref() else {
            return Ok(());
        };
        let remaining = strip_finalizers(body.metadata.finalizers.as_ref(), finalizers);
        self.body = Some(
            self.api
                .patch_namespaced(
                    &self.name,
                    &self.namespace,
                    &serde_json::json!({"metadata": {"finalizers": remaining}}),
                )
                .await?,
        );
        Ok(())
    }

    /// All replicas rolled out and serving
    pub(crate) fn is_ready(deployment: &Deployment) -> bool {
        let Some(status) = deployment.status.as_ref() else {
            return false;
        };
        let replicas = status.replicas.unwrap_or(0);
        replicas > 0
            && status.updated_replicas.unwrap_or(0) == replicas
            && status.available_replicas.unwrap_or(0) == replicas
    }

    /// Poll until the rollout is ready, bounded by `READY_TIMEOUT`
    pub(crate) async fn await_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(current) = self
                .api
                .read_namespaced::<Deployment>(&self.name, &self.namespace)
                .await?
            {
                if Self::is_ready(&current) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::NotReady(self.name.clone(), READY_TIMEOUT));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod test {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};

    use super::{DeploymentParams, ModelDeployment};

    fn params() -> DeploymentParams {
        DeploymentParams {
            image: "mltools:model-latest".to_owned(),
            artifact: "https://ublo.ro/wp-content/friends/titanic.tar.gz".to_owned(),
            command: Some(vec!["serve".to_owned()]),
            args: None,
            instances: 2,
            cpus: "100m".to_owned(),
            memory: "100Mi".to_owned(),
        }
    }

    #[test]
    fn test_deployment_body() {
        let deployment = ModelDeployment::build("titanic-rfc-0abc-00", "titanic", &params());
        assert_eq!(deployment.metadata.name.as_deref(), Some("titanic-rfc-0abc-00"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(
            spec.selector.match_labels.unwrap().get("model").map(String::as_str),
            Some("titanic-rfc-0abc-00")
        );
        let pod = spec.template.spec.unwrap();

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "titanic-rfc-0abc-00-init");
        assert_eq!(
            init.image.as_deref(),
            Some("quay.io/bdobrica/ml-operator-tools:model-init-latest")
        );
        let env = init.env.as_ref().unwrap();
        assert_eq!(env[0].name, "MODEL_URL");
        assert_eq!(
            env[0].value.as_deref(),
            Some("https://ublo.ro/wp-content/friends/titanic.tar.gz")
        );
        assert_eq!(env[1].name, "MODEL_PATH");
        assert_eq!(env[1].value.as_deref(), Some("/opt/ml"));
        // the init container writes the artifact, so its mount is writable
        assert_eq!(init.volume_mounts.as_ref().unwrap()[0].read_only, None);

        let serving = &pod.containers[0];
        assert_eq!(serving.image.as_deref(), Some("mltools:model-latest"));
        assert_eq!(serving.command.as_ref().unwrap(), &["serve"]);
        let resources = serving.resources.as_ref().unwrap();
        assert_eq!(resources.limits, resources.requests);
        assert_eq!(resources.limits.as_ref().unwrap().get("cpu").unwrap().0, "100m");
        assert_eq!(serving.ports.as_ref().unwrap()[0].container_port, 8080);
        let mount = &serving.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/opt/ml");
        assert_eq!(mount.read_only, Some(true));

        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "titanic-rfc-0abc-00-pvc"
        );
    }

    fn with_status(replicas: i32, updated: i32, available: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                updated_replicas: Some(updated),
                available_replicas: Some(available),
                ..DeploymentStatus::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn test_readiness() {
        assert!(ModelDeployment::is_ready(&with_status(2, 2, 2)));
        assert!(!ModelDeployment::is_ready(&with_status(2, 2, 1)));
        assert!(!ModelDeployment::is_ready(&with_status(2, 1, 2)));
        assert!(!ModelDeployment::is_ready(&with_status(0, 0, 0)));
        assert!(!ModelDeployment::is_ready(&Deployment::default()));
    }
}
