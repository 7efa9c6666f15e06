//! Client and in-memory caches for the directory of tenant stacks and instances.

pub mod api;
pub mod auth_cache;
pub mod client;
pub mod config;
pub mod instance_cache;
pub mod metrics_defs;
pub mod mock;
pub mod multi_cache;
pub mod types;

pub use auth_cache::{AuthCache, AuthError};
pub use client::{
    ClientError, ClusterListOptions, DirectoryClient, HttpDirectoryClient, ListOptions,
    OrgListOptions,
};
pub use config::{ClientConfig, RefreshConfig};
pub use instance_cache::{
    CacheConfig, CacheError, EntityLookup, InstanceCache, LookupError, NOT_FOUND,
};
pub use multi_cache::MultiInstanceCache;
pub use types::{ApiKey, Cluster, ContractType, Entity, EntityStatus, EntityType, Org, Role};

use std::sync::Arc;

/// Builds the client selected by `config`: fixture data in dry-run mode, the HTTP
/// directory otherwise, identifying itself as `service_name`.
pub fn new_client(
    config: &ClientConfig,
    service_name: &str,
) -> Result<Arc<dyn DirectoryClient>, ClientError> {
    if config.is_dry_run() {
        tracing::warn!("Dry-run mode, serving fixture data instead of the directory");
        return Ok(Arc::new(mock::MockDirectoryClient::with_fixtures()));
    }

    Ok(Arc::new(HttpDirectoryClient::new(config, service_name)?))
}
