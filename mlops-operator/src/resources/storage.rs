use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::debug;

use crate::client::ApiClient;
use crate::error::{Error, Result};
use crate::resources::{merge_finalizers, strip_finalizers};

/// PersistentVolume + PersistentVolumeClaim pair backing one model version.
/// The two are managed as a unit; the claim binds to the volume through a
/// label selector.
pub(crate) struct ModelStorage {
    /// Object name of the owning model version
    name: String,
    /// Namespace of the claim; the volume itself is cluster-scoped
    namespace: String,
    /// Cluster api
    api: ApiClient,
    /// Current volume, absent when not created
    pv: Option<PersistentVolume>,
    /// Current claim, absent when not created
    pvc: Option<PersistentVolumeClaim>,
}

impl ModelStorage {
    /// Read current state on construction
    pub(crate) async fn new(api: ApiClient, name: &str, namespace: &str) -> Result<Self> {
        let pv = api
            .read_clusterwide::<PersistentVolume>(&format!("{name}-pv"))
            .await?;
        let pvc = api
            .read_namespaced::<PersistentVolumeClaim>(&format!("{name}-pvc"), namespace)
            .await?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            api,
            pv,
            pvc,
        })
    }

    /// Volume object name
    fn pv_name(&self) -> String {
        format!("{}-pv", self.name)
    }

    /// Claim object name
    fn pvc_name(&self) -> String {
        format!("{}-pvc", self.name)
    }

    /// Labels shared by the pair, also used as the claim selector
    fn labels(name: &str, namespace: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("type".to_owned(), "local".to_owned()),
            ("namespace".to_owned(), namespace.to_owned()),
            ("model".to_owned(), name.to_owned()),
        ])
    }

    /// Build the volume body
    fn build_pv(name: &str, namespace: &str, size: &str, path: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(format!("{name}-pv")),
                labels: Some(Self::labels(name, namespace)),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeSpec {
                storage_class_name: Some("manual".to_owned()),
                capacity: Some(BTreeMap::from([(
                    "storage".to_owned(),
                    Quantity(size.to_owned()),
                )])),
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                host_path: Some(HostPathVolumeSource {
                    path: format!("{}/{name}", path.trim_end_matches('/')),
                    type_: None,
                }),
                ..PersistentVolumeSpec::default()
            }),
            ..PersistentVolume::default()
        }
    }

    /// Build the claim body
    fn build_pvc(name: &str, namespace: &str, size: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(format!("{name}-pvc")),
                namespace: Some(namespace.to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("manual".to_owned()),
                access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_owned(),
                        Quantity(size.to_owned()),
                    )])),
                    ..ResourceRequirements::default()
                }),
                selector: Some(LabelSelector {
                    match_labels: Some(Self::labels(name, namespace)),
                    match_expressions: None,
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        }
    }

    /// Create the pair; already-present halves are kept as they are
    pub(crate) async fn create(&mut self, size: &str, path: &str) -> Result<()> {
        if self.pv.is_none() {
            let body = Self::build_pv(&self.name, &self.namespace, size, path);
            self.pv = Some(self.api.create_clusterwide(&self.pv_name(), &body).await?);
        }
        if self.pvc.is_none() {
            let body = Self::build_pvc(&self.name, &self.namespace, size);
            self.pvc = Some(
                self.api
                    .create_namespaced_idempotent(&self.namespace, &self.pvc_name(), &body)
                    .await?,
            );
        }
        Ok(())
    }

    /// Expand the pair to `size`. Capacity never shrinks: a smaller request
    /// leaves the pair unchanged. The host path is immutable after creation.
    pub(crate) async fn update(&mut self, size: &str) -> Result<()> {
        let Some(pv) = self.pv.as_ref() else {
            debug!("storage {} does not exist, nothing to expand", self.name);
            return Ok(());
        };
        let current = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.capacity.as_ref())
            .and_then(|capacity| capacity.get("storage"))
            .map(|quantity| quantity.0.clone())
            .unwrap_or_default();
        if parse_quantity(size)? <= parse_quantity(&current)? {
            debug!(
                "storage {} stays at {current}, requested {size} does not expand it",
                self.name
            );
            return Ok(());
        }
        let patch = serde_json::json!({"spec": {"capacity": {"storage": size}}});
        self.pv = Some(
            self.api
                .patch_clusterwide::<PersistentVolume, _>(&self.pv_name(), &patch)
                .await?,
        );
        let patch = serde_json::json!({"spec": {"resources": {"requests": {"storage": size}}}});
        self.pvc = Some(
            self.api
                .patch_namespaced::<PersistentVolumeClaim, _>(
                    &self.pvc_name(),
                    &self.namespace,
                    &patch,
                )
                .await?,
        );
        Ok(())
    }

    /// Union `finalizers` into both halves' metadata
    pub(crate) async fn add_finalizers(&mut self, finalizers: &[String]) -> Result<()> {
        if let Some(pv) = self.pv.as_ref() {
            let merged = merge_finalizers(pv.metadata.finalizers.as_ref(), finalizers);
            self.pv = Some(
                self.api
                    .patch_clusterwide::<PersistentVolume, _>(
                        &self.pv_name(),
                        &serde_json::json!({"metadata": {"finalizers": merged}}),
                    )
                    .await?,
            );
        }
        if let Some(pvc) = self.pvc.as_ref() {
            let merged = merge_finalizers(pvc.metadata.finalizers.as_ref(), finalizers);
            self.pvc = Some(
                self.api
                    .patch_namespaced::<PersistentVolumeClaim, _>(
                        &self.pvc_name(),
                        &self.namespace,
                        &serde_json::json!({"metadata": {"finalizers": merged}}),
                    )
                    .await?,
            );
        }
        Ok(())
    }

    /// Remove `finalizers` from both halves' metadata
    pub(crate) async fn remove_finalizers(&mut self, finalizers: &[String]) -> Result<()> {
        if let Some(pv) = self.pv.as_ref() {
            let remaining = strip_finalizers(pv.metadata.finalizers.as_ref(), finalizers);
            self.pv = Some(
                self.api
                    .patch_clusterwide::<PersistentVolume, _>(
                        &self.pv_name(),
                        &serde_json::json!({"metadata": {"finalizers": remaining}}),
                    )
                    .await?,
            );
        }
        if let Some(pvc) = self.pvc.as_ref() {
            let remaining = strip_finalizers(pvc.metadata.finalizers.as_ref(), finalizers);
            self.pvc = Some(
                self.api
                    .patch_namespaced::<PersistentVolumeClaim, _>(
                        &self.pvc_name(),
                        &self.namespace,
                        &serde_json::json!({"metadata": {"finalizers": remaining}}),
                    )
                    .await?,
            );
        }
        Ok(())
    }

    /// Delete the claim first, then the volume
    pub(crate) async fn delete(&mut self) -> Result<()> {
        if self.pvc.is_some() {
            let _deleted = self
                .api
                .delete_namespaced::<PersistentVolumeClaim>(&self.pvc_name(), &self.namespace)
                .await?;
            self.pvc = None;
        }
        if self.pv.is_some() {
            let _deleted = self
                .api
                .delete_clusterwide::<PersistentVolume>(&self.pv_name())
                .await?;
            self.pv = None;
        }
        Ok(())
    }
}

/// Parse a kubernetes storage quantity into bytes
pub(crate) fn parse_quantity(quantity: &str) -> Result<u128> {
    let trimmed = quantity.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: f64 = digits
        .parse()
        .map_err(|_err| Error::Quantity(quantity.to_owned()))?;
    let scale: f64 = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        _ => return Err(Error::Quantity(quantity.to_owned())),
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((value * scale) as u128)
}

#[cfg(test)]
mod test {
    use super::{parse_quantity, ModelStorage};

    #[test]
    fn test_pv_body() {
        let pv = ModelStorage::build_pv("titanic-rfc-0abc-00", "titanic", "1Gi", "/mnt/nfs/models");
        assert_eq!(pv.metadata.name.as_deref(), Some("titanic-rfc-0abc-00-pv"));
        let spec = pv.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("manual"));
        assert_eq!(spec.capacity.unwrap().get("storage").unwrap().0, "1Gi");
        assert_eq!(spec.access_modes.unwrap(), ["ReadWriteOnce"]);
        assert_eq!(
            spec.host_path.unwrap().path,
            "/mnt/nfs/models/titanic-rfc-0abc-00"
        );
        let labels = pv.metadata.labels.unwrap();
        assert_eq!(labels.get("type").map(String::as_str), Some("local"));
        assert_eq!(labels.get("namespace").map(String::as_str), Some("titanic"));
        assert_eq!(
            labels.get("model").map(String::as_str),
            Some("titanic-rfc-0abc-00")
        );
    }

    #[test]
    fn test_pvc_body() {
        let pvc = ModelStorage::build_pvc("titanic-rfc-0abc-00", "titanic", "1Gi");
        assert_eq!(pvc.metadata.name.as_deref(), Some("titanic-rfc-0abc-00-pvc"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("titanic"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), ["ReadWriteOnce"]);
        assert_eq!(
            spec.resources
                .unwrap()
                .requests
                .unwrap()
                .get("storage")
                .unwrap()
                .0,
            "1Gi"
        );
        let selector = spec.selector.unwrap().match_labels.unwrap();
        assert_eq!(selector.get("type").map(String::as_str), Some("local"));
        assert_eq!(
            selector.get("model").map(String::as_str),
            Some("titanic-rfc-0abc-00")
        );
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1024").unwrap(), 1024);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_quantity("1.5Ki").unwrap(), 1536);
        assert!(parse_quantity("one gig").is_err());
        assert!(parse_quantity("1Qi").is_err());
    }

    #[test]
    fn test_quantity_ordering_across_units() {
        // the expand-only check compares across units
        assert!(parse_quantity("2Gi").unwrap() > parse_quantity("1Gi").unwrap());
        assert!(parse_quantity("1Gi").unwrap() > parse_quantity("900Mi").unwrap());
        assert!(parse_quantity("1G").unwrap() < parse_quantity("1Gi").unwrap());
    }
}
