use std::fmt::Debug;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;

use crate::consts::{API_TIMEOUT, LIST_PAGE_LIMIT};
use crate::error::{Error, Result};

/// Thin typed gateway to the cluster api. Reads translate not-found into
/// absence; every call is bounded by `API_TIMEOUT`.
#[derive(Clone)]
pub(crate) struct ApiClient {
    /// Kubernetes client
    client: Client,
}

impl ApiClient {
    /// Constructor
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Namespaced api handle
    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Cluster-wide api handle
    fn clusterwide<K>(&self) -> Api<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    /// Translate a not-found response into an absent value
    fn absent_on_404<K>(result: kube::Result<K>) -> Result<Option<K>> {
        match result {
            Ok(object) => Ok(Some(object)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Read an object, `None` when it does not exist
    pub(crate) async fn read_namespaced<K>(&self, name: &str, namespace: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.namespaced::<K>(namespace);
        Self::absent_on_404(
            timeout(API_TIMEOUT, api.get(name))
                .await
                .map_err(|_elapsed| Error::Timeout)?,
        )
    }

    /// Read a cluster-scoped object, `None` when it does not exist
    pub(crate) async fn read_clusterwide<K>(&self, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.clusterwide::<K>();
        Self::absent_on_404(
            timeout(API_TIMEOUT, api.get(name))
                .await
                .map_err(|_elapsed| Error::Timeout)?,
        )
    }

    /// List all objects of a kind, following pagination to the end
    pub(crate) async fn list_namespaced<K>(&self, namespace: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.namespaced::<K>(namespace);
        let mut params = ListParams::default().limit(LIST_PAGE_LIMIT);
        let mut items = Vec::new();
        loop {
            let page = timeout(API_TIMEOUT, api.list(&params))
                .await
                .map_err(|_elapsed| Error::Timeout)??;
            items.extend(page.items);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => params.continue_token = Some(token),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Create an object, returning the server-stored body
    pub(crate) async fn create_namespaced<K>(&self, namespace: &str, body: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api = self.namespaced::<K>(namespace);
        Ok(timeout(API_TIMEOUT, api.create(&PostParams::default(), body))
            .await
            .map_err(|_elapsed| Error::Timeout)??)
    }

    /// Create, treating a lost already-exists race as success by re-reading
    pub(crate) async fn create_namespaced_idempotent<K>(
        &self,
        namespace: &str,
        name: &str,
        body: &K,
    ) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        match self.create_namespaced(namespace, body).await {
            Ok(object) => Ok(object),
            Err(Error::Kube(kube::Error::Api(response))) if response.code == 409 => self
                .read_namespaced(name, namespace)
                .await?
                .ok_or(Error::MissingObject("concurrently created object")),
            Err(err) => Err(err),
        }
    }

    /// Create a cluster-scoped object
    pub(crate) async fn create_clusterwide<K>(&self, name: &str, body: &K) -> Result<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api = self.clusterwide::<K>();
        match timeout(API_TIMEOUT, api.create(&PostParams::default(), body))
            .await
            .map_err(|_elapsed| Error::Timeout)?
        {
            Ok(object) => Ok(object),
            Err(kube::Error::Api(response)) if response.code == 409 => self
                .read_clusterwide(name)
                .await?
                .ok_or(Error::MissingObject("concurrently created object")),
            Err(err) => Err(err.into()),
        }
    }

    /// Merge-patch an object; not-found propagates
    pub(crate) async fn patch_namespaced<K, P>(
        &self,
        name: &str,
        namespace: &str,
        body: &P,
    ) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
        P: Serialize + Debug,
    {
        let api = self.namespaced::<K>(namespace);
        let patch = Patch::Merge(body);
        Ok(
            timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &patch))
                .await
                .map_err(|_elapsed| Error::Timeout)??,
        )
    }

    /// Merge-patch the status subresource of an object
    pub(crate) async fn patch_namespaced_status<K, P>(
        &self,
        name: &str,
        namespace: &str,
        body: &P,
    ) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
        P: Serialize + Debug,
    {
        let api = self.namespaced::<K>(namespace);
        let patch = Patch::Merge(body);
        Ok(timeout(
            API_TIMEOUT,
            api.patch_status(name, &PatchParams::default(), &patch),
        )
        .await
        .map_err(|_elapsed| Error::Timeout)??)
    }

    /// Merge-patch a cluster-scoped object
    pub(crate) async fn patch_clusterwide<K, P>(&self, name: &str, body: &P) -> Result<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
        P: Serialize + Debug,
    {
        let api = self.clusterwide::<K>();
        let patch = Patch::Merge(body);
        Ok(
            timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &patch))
                .await
                .map_err(|_elapsed| Error::Timeout)??,
        )
    }

    /// Delete an object; `false` when it was already gone
    pub(crate) async fn delete_namespaced<K>(&self, name: &str, namespace: &str) -> Result<bool>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.namespaced::<K>(namespace);
        match timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default()))
            .await
            .map_err(|_elapsed| Error::Timeout)?
        {
            Ok(_status) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a cluster-scoped object; `false` when it was already gone
    pub(crate) async fn delete_clusterwide<K>(&self, name: &str) -> Result<bool>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = self.clusterwide::<K>();
        match timeout(API_TIMEOUT, api.delete(name, &DeleteParams::default()))
            .await
            .map_err(|_elapsed| Error::Timeout)?
        {
            Ok(_status) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
