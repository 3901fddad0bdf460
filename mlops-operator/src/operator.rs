use std::time::Duration;

use anyhow::Result;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt};
use tokio::signal;
use tracing::{debug, info};

use mlops_api::crd::{Endpoint, EndpointConfig, Model};

use crate::client::ApiClient;
use crate::config::Config;
use crate::controller::handlers::{EndpointConfigHandler, EndpointHandler, ModelHandler};
use crate::controller::watch;

/// wait crd to establish timeout
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);

/// MLOps operator for k8s
#[derive(Debug)]
pub struct Operator {
    /// Config of this operator
    config: Config,
}

impl Operator {
    /// Constructor
    #[inline]
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run operator
    ///
    /// # Errors
    ///
    /// Return `Err` when run failed
    #[inline]
    pub async fn run(&self) -> Result<()> {
        let kube_client: Client = Client::try_default().await?;
        self.prepare_crd::<Model>(&kube_client).await?;
        self.prepare_crd::<EndpointConfig>(&kube_client).await?;
        self.prepare_crd::<Endpoint>(&kube_client).await?;

        let api = ApiClient::new(kube_client.clone());
        let (endpoint_api, config_api, model_api): (
            Api<Endpoint>,
            Api<EndpointConfig>,
            Api<Model>,
        ) = if self.config.cluster_wide {
            (
                Api::all(kube_client.clone()),
                Api::all(kube_client.clone()),
                Api::all(kube_client),
            )
        } else {
            (
                Api::namespaced(kube_client.clone(), &self.config.namespace),
                Api::namespaced(kube_client.clone(), &self.config.namespace),
                Api::namespaced(kube_client, &self.config.namespace),
            )
        };

        let _endpoint_task = tokio::spawn(watch::run(
            endpoint_api,
            api.clone(),
            EndpointHandler::new(api.clone()),
        ));
        let _config_task = tokio::spawn(watch::run(
            config_api,
            api.clone(),
            EndpointConfigHandler::new(api.clone()),
        ));
        let _model_task = tokio::spawn(watch::run(
            model_api,
            api.clone(),
            ModelHandler::new(api.clone()),
        ));

        info!("operator started, press ctrl+c to shut down");
        signal::ctrl_c().await?;
        info!("shutting down");
        Ok(())
    }

    /// Initialize one CRD if it does not already exist, optionally force
    /// patching it, then wait for it to be established
    async fn prepare_crd<K>(&self, kube_client: &Client) -> Result<()>
    where
        K: CustomResourceExt,
    {
        let crd_api: Api<CustomResourceDefinition> = Api::all(kube_client.clone());
        let definition = K::crd();
        let name = K::crd_name();
        match crd_api.get_opt(name).await? {
            None => {
                debug!("cannot find {name} CRD, try to init it");
                let _crd = crd_api.create(&PostParams::default(), &definition).await?;
            }
            Some(_existing) => {
                if self.config.create_crd {
                    debug!("create_crd set to true, force patch {name}");
                    let _crd = crd_api
                        .patch(name, &PatchParams::default(), &Patch::Merge(definition))
                        .await?;
                }
            }
        }
        let establish = await_condition(crd_api, name, conditions::is_crd_established());
        let _crd = tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, establish).await??;
        debug!("{name} crd established");
        Ok(())
    }
}
