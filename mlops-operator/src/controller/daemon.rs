use k8s_openapi::api::apps::v1::Deployment;
use serde_json::json;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use mlops_api::crd::{self, State};

use crate::client::ApiClient;
use crate::consts::{DAEMON_INTERVAL, READY_TIMEOUT};
use crate::resources::deployment::ModelDeployment;

/// Watch one model's same-named deployment and publish readiness to the
/// model status: `available` on first full readiness, `failed` when a
/// deployment exists but never becomes ready within the window. Models
/// without a deployment are dormant and get no verdict.
pub(crate) async fn monitor_deployment(api: ApiClient, name: String, namespace: String) {
    let mut ticker = interval(DAEMON_INTERVAL);
    let mut first_seen: Option<Instant> = None;
    loop {
        let _tick = ticker.tick().await;
        let deployment = match api.read_namespaced::<Deployment>(&name, &namespace).await {
            Ok(deployment) => deployment,
            Err(err) => {
                warn!("failed to read deployment {name}: {err}");
                continue;
            }
        };
        let Some(deployment) = deployment else {
            debug!("deployment {name} does not exist yet");
            continue;
        };
        let started = *first_seen.get_or_insert_with(Instant::now);
        if ModelDeployment::is_ready(&deployment) {
            info!("deployment {name} is ready");
            publish_state(&api, &name, &namespace, State::Available).await;
            return;
        }
        let status = deployment.status.unwrap_or_default();
        debug!(
            "deployment {name} is not ready yet, replicas: {:?}, updated: {:?}, available: {:?}",
            status.replicas, status.updated_replicas, status.available_replicas
        );
        if started.elapsed() >= READY_TIMEOUT {
            warn!("deployment {name} never became ready within {READY_TIMEOUT:?}");
            publish_state(&api, &name, &namespace, State::Failed).await;
            return;
        }
    }
}

/// Patch the model status with the verdict
async fn publish_state(api: &ApiClient, name: &str, namespace: &str, state: State) {
    if let Err(err) = api
        .patch_namespaced_status::<crd::Model, _>(
            name,
            namespace,
            &json!({"status": {"state": state}}),
        )
        .await
    {
        warn!("failed to publish state of model {name}: {err}");
    }
}
