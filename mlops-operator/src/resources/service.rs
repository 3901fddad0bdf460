use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use mlops_api::consts::MODEL_SERVING_PORT;

use crate::client::ApiClient;
use crate::error::Result;
use crate::resources::{merge_finalizers, strip_finalizers};

/// ClusterIP service in front of one model version's pods
pub(crate) struct ModelService {
    /// Object name, equals the model version it fronts
    name: String,
    /// Namespace
    namespace: String,
    /// Cluster api
    api: ApiClient,
    /// Current service, absent when not created
    body: Option<Service>,
}

impl ModelService {
    /// Read current state on construction
    pub(crate) async fn new(api: ApiClient, name: &str, namespace: &str) -> Result<Self> {
        let body = api.read_namespaced::<Service>(name, namespace).await?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            api,
            body,
        })
    }

    /// Build the service body
    fn build(name: &str, namespace: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                selector: Some(BTreeMap::from([("model".to_owned(), name.to_owned())])),
                ports: Some(vec![ServicePort {
                    port: MODEL_SERVING_PORT,
                    target_port: Some(IntOrString::Int(MODEL_SERVING_PORT)),
                    protocol: Some("TCP".to_owned()),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    /// Create the service; a no-op when it already exists
    pub(crate) async fn create(&mut self) -> Result<()> {
        if self.body.is_some() {
            return Ok(());
        }
        let body = Self::build(&self.name, &self.namespace);
        self.body = Some(
            self.api
                .create_namespaced_idempotent(&self.namespace, &self.name, &body)
                .await?,
        );
        Ok(())
    }

    /// Union `finalizers` into the service metadata
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

    /// Remove `finalizers` from the service metadata
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

    /// Delete the service; a no-op when it is already gone
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.body.is_none() {
            return Ok(());
        }
        let _deleted = self
            .api
            .delete_namespaced::<Service>(&self.name, &self.namespace)
            .await?;
        self.body = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use super::ModelService;

    #[test]
    fn test_service_body() {
        let service = ModelService::build("titanic-rfc-0abc-00", "titanic");
        assert_eq!(service.metadata.name.as_deref(), Some("titanic-rfc-0abc-00"));
        assert_eq!(service.metadata.namespace.as_deref(), Some("titanic"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector.unwrap().get("model").map(String::as_str),
            Some("titanic-rfc-0abc-00")
        );
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
    }
}
