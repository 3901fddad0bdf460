/// Port every serving container listens on
pub const MODEL_SERVING_PORT: i32 = 8080;
/// Mount path of the model artifact volume inside serving pods
pub const MODEL_MOUNT_PATH: &str = "/opt/ml";
/// Image of the init container that downloads model artifacts
pub const MODEL_INIT_IMAGE: &str = "quay.io/bdobrica/ml-operator-tools:model-init-latest";
/// Env var naming the artifact location, read by the init container
pub const MODEL_URL_ENV: &str = "MODEL_URL";
/// Env var naming the artifact mount path, read by the init container
pub const MODEL_PATH_ENV: &str = "MODEL_PATH";
/// Label key selecting the mesh ingress pods
pub const INGRESS_SELECTOR_KEY: &str = "istio";
/// Label value selecting the mesh ingress pods
pub const INGRESS_SELECTOR_VALUE: &str = "ingressgateway";
/// Finalizer owned by the operator, gates collaborator teardown
pub const TEARDOWN_FINALIZER: &str = "mlops.blue.intranet/teardown";
/// Prefix of the breadcrumb finalizer naming a started successor config
pub const STARTED_FINALIZER_PREFIX: &str = "started:";
