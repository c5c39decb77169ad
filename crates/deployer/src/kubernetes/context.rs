//! Cluster connections scoped to one rollout.
//!
//! Connections are resolved once per distinct cluster before any parallel
//! section, then shared by every worker through the context.

use super::client::{ClusterApi, KubeCluster, RetryingCluster};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Cluster name that selects the in-cluster service account
pub const IN_CLUSTER: &str = "in-cluster";

/// Opens a connection to a named cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn ClusterApi>>;
}

/// Connects to clusters by kubeconfig context name
pub struct KubeconfigConnector {
    kubeconfig: Option<PathBuf>,
    transient_retries: u32,
}

impl KubeconfigConnector {
    pub fn new(kubeconfig: Option<PathBuf>, transient_retries: u32) -> Self {
        Self {
            kubeconfig,
            transient_retries,
        }
    }

    async fn config_for(&self, cluster: &str) -> Result<kube::Config> {
        if cluster == IN_CLUSTER {
            return kube::Config::incluster()
                .map_err(|e| Error::Config(format!("in-cluster configuration: {e}")));
        }

        let kubeconfig = match &self.kubeconfig {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| Error::Config(format!("failed to read kubeconfig: {e}")))?;

        let options = KubeConfigOptions {
            context: Some(cluster.to_string()),
            ..KubeConfigOptions::default()
        };
        kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::Config(format!("kubeconfig context {cluster}: {e}")))
    }
}

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn ClusterApi>> {
        let config = self.config_for(cluster).await?;
        let client = Client::try_from(config).map_err(|e| Error::from_kube("connect", e))?;
        info!(cluster, "Connected to cluster");
        let kube: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(cluster, client));
        Ok(Arc::new(RetryingCluster::new(kube, self.transient_retries)))
    }
}

/// Fixed set of already-connected clusters
#[derive(Default)]
pub struct StaticConnector {
    clusters: HashMap<String, Arc<dyn ClusterApi>>,
}

impl StaticConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cluster(mut self, name: impl Into<String>, api: Arc<dyn ClusterApi>) -> Self {
        self.clusters.insert(name.into(), api);
        self
    }
}

#[async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn ClusterApi>> {
        self.clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown cluster: {cluster}")))
    }
}

/// Per-rollout cache of cluster connections
pub struct ClusterContext {
    connector: Arc<dyn ClusterConnector>,
    clients: Mutex<HashMap<String, Arc<dyn ClusterApi>>>,
}

impl ClusterContext {
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to every distinct cluster up front
    pub async fn warm<'a>(&self, clusters: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let distinct: BTreeSet<&str> = clusters.into_iter().collect();
        for cluster in distinct {
            self.client(cluster).await?;
        }
        Ok(())
    }

    /// Cached connection for `cluster`, connecting on first use
    pub async fn client(&self, cluster: &str) -> Result<Arc<dyn ClusterApi>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(cluster) {
            return Ok(Arc::clone(client));
        }
        debug!(cluster, "Resolving cluster connection");
        let client = self.connector.connect(cluster).await?;
        clients.insert(cluster.to_string(), Arc::clone(&client));
        Ok(client)
    }
}
