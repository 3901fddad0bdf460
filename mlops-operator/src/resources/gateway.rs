use std::collections::BTreeMap;

use mlops_api::consts::{INGRESS_SELECTOR_KEY, INGRESS_SELECTOR_VALUE};
use mlops_api::istio::{Gateway, GatewaySpec, Server, ServerPort};

use crate::client::ApiClient;
use crate::error::Result;
use crate::resources::{merge_finalizers, strip_finalizers};

/// Mesh ingress gateway in front of one endpoint
pub(crate) struct MeshGateway {
    /// Object name, `{endpoint}-gw`
    name: String,
    /// Namespace
    namespace: String,
    /// Cluster api
    api: ApiClient,
    /// Current gateway, absent when not created
    body: Option<Gateway>,
}

impl MeshGateway {
    /// Read current state on construction
    pub(crate) async fn new(api: ApiClient, name: &str, namespace: &str) -> Result<Self> {
        let body = api.read_namespaced::<Gateway>(name, namespace).await?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            api,
            body,
        })
    }

    /// Build the gateway body: the standard ingress pods, one HTTP server
    fn build(name: &str, namespace: &str, endpoint: &str, hosts: &[String], port: i32) -> Gateway {
        let mut gateway = Gateway::new(
            name,
            GatewaySpec {
                selector: BTreeMap::from([(
                    INGRESS_SELECTOR_KEY.to_owned(),
                    INGRESS_SELECTOR_VALUE.to_owned(),
                )]),
                servers: vec![Server {
                    hosts: hosts.to_vec(),
                    port: ServerPort {
                        name: "http".to_owned(),
                        number: port,
                        protocol: "HTTP".to_owned(),
                    },
                }],
            },
        );
        gateway.metadata.namespace = Some(namespace.to_owned());
        gateway.metadata.labels = Some(BTreeMap::from([(
            "endpoint".to_owned(),
            endpoint.to_owned(),
        )]));
        gateway
    }

    /// Create the gateway; a no-op when it already exists
    pub(crate) async fn create(
        &mut self,
        endpoint: &str,
        hosts: &[String],
        port: i32,
    ) -> Result<()> {
        if self.body.is_some() {
            return Ok(());
        }
        let body = Self::build(&self.name, &self.namespace, endpoint, hosts, port);
        self.body = Some(
            self.api
                .create_namespaced_idempotent(&self.namespace, &self.name, &body)
                .await?,
        );
        Ok(())
    }

    /// Patch with the rebuilt body; falls through to create when absent
    pub(crate) async fn update(
        &mut self,
        endpoint: &str,
        hosts: &[String],
        port: i32,
    ) -> Result<()> {
        if self.body.is_none() {
            return self.create(endpoint, hosts, port).await;
        }
        let body = Self::build(&self.name, &self.namespace, endpoint, hosts, port);
        self.body = Some(
            self.api
                .patch_namespaced(&self.name, &self.namespace, &body)
                .await?,
        );
        Ok(())
    }

    /// Union `finalizers` into the gateway metadata
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

    /// Remove `finalizers` from the gateway metadata
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

    /// Delete the gateway; a no-op when it is already gone
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.body.is_none() {
            return Ok(());
        }
        let _deleted = self
            .api
            .delete_namespaced::<Gateway>(&self.name, &self.namespace)
            .await?;
        self.body = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::MeshGateway;

    #[test]
    fn test_gateway_body() {
        let hosts = vec!["titanic-rfc.titanic.svc.cluster.local".to_owned()];
        let gateway = MeshGateway::build("titanic-rfc-gw", "titanic", "titanic-rfc", &hosts, 8080);
        assert_eq!(gateway.metadata.name.as_deref(), Some("titanic-rfc-gw"));
        assert_eq!(
            gateway
                .metadata
                .labels
                .unwrap()
                .get("endpoint")
                .map(String::as_str),
            Some("titanic-rfc")
        );
        assert_eq!(
            gateway.spec.selector.get("istio").map(String::as_str),
            Some("ingressgateway")
        );
        let server = &gateway.spec.servers[0];
        assert_eq!(server.hosts, hosts);
        assert_eq!(server.port.name, "http");
        assert_eq!(server.port.number, 8080);
        assert_eq!(server.port.protocol, "HTTP");
    }
}
