use crate::client::DirectoryClient;
use crate::config::RefreshConfig;
use crate::instance_cache::{
    CacheConfig, CacheError, EntityLookup, InstanceCache, LookupError, NOT_FOUND,
};
use crate::types::{Entity, EntityType};
use std::sync::Arc;

/// Stack lookups spread over one [`InstanceCache`] per cluster.
///
/// Shards are tried in the order their cluster filters were configured.
pub struct MultiInstanceCache {
    shards: Vec<InstanceCache>,
}

impl MultiInstanceCache {
    /// Builds one stack cache per entry of `cluster_filters`, sharing `client`.
    pub async fn new(
        refresh: &RefreshConfig,
        cluster_filters: &[String],
        client: Arc<dyn DirectoryClient>,
    ) -> Result<Self, CacheError> {
        if cluster_filters.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "configure at least 1 cluster filter",
            ));
        }

        let mut shards = Vec::with_capacity(cluster_filters.len());
        for cluster in cluster_filters {
            tracing::info!(cluster = %cluster, "Building stack cache shard");

            let config = CacheConfig {
                stack_cluster_filter: Some(cluster.clone()),
                ..CacheConfig::new(refresh, vec![EntityType::Stack])
            };

            match InstanceCache::new(config, client.clone()).await {
                Ok(shard) => shards.push(shard),
                Err(e) => {
                    // Stop the shards that were already running.
                    for shard in &shards {
                        shard.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(MultiInstanceCache { shards })
    }

    pub fn from_shards(shards: Vec<InstanceCache>) -> Result<Self, CacheError> {
        if shards.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "configure at least 1 cluster filter",
            ));
        }
        Ok(MultiInstanceCache { shards })
    }

    pub fn shards(&self) -> &[InstanceCache] {
        &self.shards
    }

    pub async fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown().await;
        }
    }
}

impl EntityLookup for MultiInstanceCache {
    fn get_by_id(&self, entity_type: EntityType, id: i64) -> Result<Entity, LookupError> {
        let mut last_error = LookupError::NoCache(entity_type);
        for shard in &self.shards {
            match shard.get_by_id(entity_type, id) {
                Ok(entity) => return Ok(entity),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn get_metrics_id_by_org_and_name(&self, org_id: i64, name: &str) -> i64 {
        self.shards
            .iter()
            .map(|shard| shard.get_metrics_id_by_org_and_name(org_id, name))
            .find(|id| *id != NOT_FOUND)
            .unwrap_or(NOT_FOUND)
    }
}
