use std::future::Future;

use k8s_openapi::api::core::v1::Namespace;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

use crate::error::Error;
use crate::policy::Annotations;

/// Source of namespace annotations for the webhook's policy resolution.
pub trait NamespaceLookup: Send + Sync + 'static {
    fn annotations(&self, namespace: &str) -> impl Future<Output = Result<Annotations, Error>> + Send;
}

pub struct KubeNamespaces {
    api: Api<Namespace>,
}

impl KubeNamespaces {
    /// Connects with the given kubeconfig file, or the in-cluster / default
    /// configuration when none is set.
    pub async fn connect(kube_config: Option<&str>) -> Result<Self, Error> {
        let client = match kube_config {
            Some(path) => {
                let kubeconfig =
                    Kubeconfig::read_from(path).map_err(|e| Error::KubeConfig(e.to_string()))?;
                let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::KubeConfig(e.to_string()))?;
                Client::try_from(config).map_err(|e| Error::KubeConfig(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| Error::KubeConfig(e.to_string()))?,
        };

        Ok(Self {
            api: Api::all(client),
        })
    }
}

impl NamespaceLookup for KubeNamespaces {
    async fn annotations(&self, namespace: &str) -> Result<Annotations, Error> {
        let ns = self
            .api
            .get(namespace)
            .await
            .map_err(|source| Error::NamespaceLookup {
                namespace: namespace.to_string(),
                source,
            })?;
        Ok(ns.metadata.annotations.unwrap_or_default())
    }
}
