use garde::Validate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state published on every mlops kind
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Collaborator resources are being allocated
    #[default]
    Creating,
    /// A new version is rolling out
    Updating,
    /// Serving traffic
    Available,
    /// Collaborator resources are being torn down
    Deleting,
    /// Reconciliation hit a permanent error
    Failed,
}

/// Spec of a deployable model image + artifact
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[kube(
    group = "blue.intranet",
    version = "v1alpha1",
    kind = "Model",
    namespaced,
    status = "ModelStatus"
)]
pub struct ModelSpec {
    /// Serving container image reference
    #[garde(length(min = 1))]
    pub image: String,
    /// Artifact location downloaded by the init container, may be empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub artifact: Option<String>,
    /// Serving container entrypoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub command: Option<Vec<String>>,
    /// Serving container arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub args: Option<Vec<String>>,
}

/// Status of a Model object
///
/// `model` and `version` carry the logical identity: the object name of a
/// versioned Model is `{model}-{version}` while `model` alone names the
/// family the user declared.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ModelStatus {
    /// Endpoint this version ultimately serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Logical name of the owning endpoint config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_config: Option<String>,
    /// Version suffix of the owning endpoint config clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_config_version: Option<String>,
    /// Logical model family name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Version suffix of this object, empty for the user-declared original
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}

/// One weighted model reference inside an endpoint config
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
pub struct ModelVariant {
    /// Logical name of the referenced Model object
    #[garde(pattern(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"))]
    pub model: String,
    /// Relative routing weight, the sum over all variants need not be 100
    #[garde(range(min = 0))]
    pub weight: i32,
    /// CPU limit and request of one serving pod
    #[garde(pattern(r"^[0-9]+(\.[0-9]+)?m?$"))]
    pub cpus: String,
    /// Memory limit and request of one serving pod
    #[garde(pattern(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|k|M|G|T)?$"))]
    pub memory: String,
    /// Number of serving replicas
    #[garde(range(min = 1))]
    pub instances: i32,
    /// Capacity of the artifact volume
    #[garde(pattern(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|k|M|G|T)?$"))]
    pub size: String,
    /// Host directory the artifact volume lives under
    #[garde(length(min = 1))]
    pub path: String,
}

/// Spec of an endpoint config: an ordered, weighted bag of model references
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[kube(
    group = "blue.intranet",
    version = "v1alpha1",
    kind = "EndpointConfig",
    namespaced,
    status = "EndpointConfigStatus"
)]
pub struct EndpointConfigSpec {
    /// Model variants served by this config, in routing order
    #[garde(dive)]
    pub models: Vec<ModelVariant>,
}

/// Status of an EndpointConfig object
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct EndpointConfigStatus {
    /// Endpoint this clone is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Logical config family name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_config: Option<String>,
    /// Version suffix of this clone, empty for the user-declared original
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Object names of the versioned Models, parallel to `spec.models`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_versions: Option<Vec<String>>,
    /// Lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}

/// Spec of an endpoint: a host name served by a config
#[derive(CustomResource, Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize, Validate)]
#[kube(
    group = "blue.intranet",
    version = "v1alpha1",
    kind = "Endpoint",
    namespaced,
    status = "EndpointStatus"
)]
pub struct EndpointSpec {
    /// Logical name of the EndpointConfig to serve
    #[garde(pattern(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"))]
    pub config: String,
    /// DNS name traffic for this endpoint arrives at
    #[garde(pattern(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$"))]
    pub host: String,
}

/// Status of an Endpoint object
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct EndpointStatus {
    /// Object name of the active EndpointConfig clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_config_version: Option<String>,
    /// Lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}

#[cfg(test)]
mod test {
    use garde::Validate;

    use super::{EndpointSpec, ModelVariant};

    fn variant() -> ModelVariant {
        ModelVariant {
            model: "titanic-rfc".to_owned(),
            weight: 100,
            cpus: "100m".to_owned(),
            memory: "100Mi".to_owned(),
            instances: 2,
            size: "1Gi".to_owned(),
            path: "/mnt/nfs/models".to_owned(),
        }
    }

    #[test]
    fn test_variant_validation() {
        assert!(variant().validate(&()).is_ok());

        let mut bad_instances = variant();
        bad_instances.instances = 0;
        assert!(bad_instances.validate(&()).is_err());

        let mut bad_size = variant();
        bad_size.size = "one gig".to_owned();
        assert!(bad_size.validate(&()).is_err());

        let mut bad_name = variant();
        bad_name.model = "Titanic_RFC".to_owned();
        assert!(bad_name.validate(&()).is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        let spec = EndpointSpec {
            config: "titanic-rfc".to_owned(),
            host: "titanic-rfc.titanic.svc.cluster.local".to_owned(),
        };
        assert!(spec.validate(&()).is_ok());

        let spec = EndpointSpec {
            config: "titanic-rfc".to_owned(),
            host: "no spaces allowed".to_owned(),
        };
        assert!(spec.validate(&()).is_err());
    }

    #[test]
    fn test_state_wire_format() {
        let encoded = serde_json::to_string(&super::State::Available).unwrap();
        assert_eq!(encoded, "\"available\"");
    }
}
