//! Cluster-facing pieces: API client, per-rollout connection cache,
//! resources and pod snapshots.

pub mod client;
pub mod context;
pub mod pod;
pub mod resource;

pub use client::{ClusterApi, KubeCluster, ResourceIdentity, RetryingCluster};
pub use context::{ClusterConnector, ClusterContext, KubeconfigConnector, StaticConnector};
pub use pod::{ContainerSnapshot, PodSnapshot};
pub use resource::{AppliedResource, Resource, ResourceKind};

/// Labels stamped onto every deployed object and pod template
pub mod labels {
    pub const PROJECT: &str = "project";
    pub const ROLE: &str = "role";
    pub const DEPLOY_GROUP: &str = "deploy_group";
    pub const RELEASE_ID: &str = "release_id";
    pub const BLUE_GREEN: &str = "blue_green";
}
