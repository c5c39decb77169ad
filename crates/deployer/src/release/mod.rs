//! Releases: what gets rolled out, how it is assembled and where it is kept.

pub mod builder;
pub mod model;
pub mod store;
pub mod template;

pub use builder::{
    BuildResolver, BuildSelector, DirectoryRoleConfigSource, ReleaseBuilder, ReleaseRequest,
    RoleConfigSource, StaticBuildResolver,
};
pub use model::{Build, Color, DeployGroup, DeployGroupRole, Release, ReleaseDoc, Role};
pub use store::{InMemoryReleaseStore, JsonFileReleaseStore, ReleaseStore};
