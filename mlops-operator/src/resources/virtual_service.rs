use mlops_api::istio::{HttpRoute, VirtualService, VirtualServiceSpec, WeightedDestination};

use crate::client::ApiClient;
use crate::error::{Error, Result};
use crate::resources::{merge_finalizers, strip_finalizers};

/// Mesh routing rule of one endpoint config: a single HTTP route splitting
/// traffic over the config's model versions
pub(crate) struct MeshVirtualService {
    /// Object name, equals the owning config clone
    name: String,
    /// Namespace
    namespace: String,
    /// Cluster api
    api: ApiClient,
    /// Current rule, absent when not created
    body: Option<VirtualService>,
}

impl MeshVirtualService {
    /// Read current state on construction
    pub(crate) async fn new(api: ApiClient, name: &str, namespace: &str) -> Result<Self> {
        let body = api.read_namespaced::<VirtualService>(name, namespace).await?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            api,
            body,
        })
    }

    /// Build the rule body; exactly one http element, routes in given order
    fn build(
        name: &str,
        namespace: &str,
        gateway: &str,
        hosts: &[String],
        routes: Vec<WeightedDestination>,
    ) -> VirtualService {
        let mut virtual_service = VirtualService::new(
            name,
            VirtualServiceSpec {
                gateways: vec![gateway.to_owned()],
                hosts: hosts.to_vec(),
                http: vec![HttpRoute { route: routes }],
            },
        );
        virtual_service.metadata.namespace = Some(namespace.to_owned());
        virtual_service
    }

    /// Create the rule; a no-op when it already exists
    pub(crate) async fn create(
        &mut self,
        gateway: &str,
        hosts: &[String],
        routes: Vec<WeightedDestination>,
    ) -> Result<()> {
        if self.body.is_some() {
            return Ok(());
        }
        let body = Self::build(&self.name, &self.namespace, gateway, hosts, routes);
        self.body = Some(
            self.api
                .create_namespaced_idempotent(&self.namespace, &self.name, &body)
                .await?,
        );
        Ok(())
    }

    /// Replace the weighted routes, keeping gateway and hosts
    pub(crate) async fn reroute(&mut self, routes: Vec<WeightedDestination>) -> Result<()> {
        if self.body.is_none() {
            return Err(Error::AbsentReferent(self.name.clone()));
        }
        let patch = serde_json::json!({"spec": {"http": [{"route": routes}]}});
        self.body = Some(
            self.api
                .patch_namespaced(&self.name, &self.namespace, &patch)
                .await?,
        );
        Ok(())
    }

    /// Point the route serving `old_host` at `new_host`, weights unchanged
    pub(crate) async fn swap_host(&mut self, old_host: &str, new_host: &str) -> Result<()> {
        let Some(body) = self.body.as_ref() else {
            return Err(Error::AbsentReferent(self.name.clone()));
        };
        let routes: Vec<WeightedDestination> = body
            .spec
            .http
            .first()
            .map(|http| http.route.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|mut route| {
                if route.destination.host == old_host {
                    route.destination.host = new_host.to_owned();
                }
                route
            })
            .collect();
        self.reroute(routes).await
    }

    /// Union `finalizers` into the rule metadata
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

    /// Remove `finalizers` from the rule metadata
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

    /// Delete the rule; a no-op when it is already gone
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.body.is_none() {
            return Ok(());
        }
        let _deleted = self
            .api
            .delete_namespaced::<VirtualService>(&self.name, &self.namespace)
            .await?;
        self.body = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use mlops_api::istio::weighted_route;

    use super::MeshVirtualService;

    #[test]
    fn test_virtual_service_body() {
        let hosts = vec!["titanic-rfc.titanic.svc.cluster.local".to_owned()];
        let routes = vec![
            weighted_route("titanic-rfc-0abc-00", 8080, 70),
            weighted_route("titanic-xgb-0abd-01", 8080, 30),
        ];
        let virtual_service = MeshVirtualService::build(
            "titanic-rfc-0abb-0k",
            "titanic",
            "titanic-rfc-gw",
            &hosts,
            routes,
        );
        assert_eq!(
            virtual_service.metadata.name.as_deref(),
            Some("titanic-rfc-0abb-0k")
        );
        assert_eq!(virtual_service.spec.gateways, ["titanic-rfc-gw"]);
        assert_eq!(virtual_service.spec.hosts, hosts);
        // exactly one http element, routes in user-declared order
        assert_eq!(virtual_service.spec.http.len(), 1);
        let route = &virtual_service.spec.http[0].route;
        assert_eq!(route[0].destination.host, "titanic-rfc-0abc-00");
        assert_eq!(route[0].weight, 70);
        assert_eq!(route[1].destination.host, "titanic-xgb-0abd-01");
        assert_eq!(route[1].weight, 30);
    }
}
