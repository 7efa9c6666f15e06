//! Self-refreshing in-memory index of directory entities.
//!
//! Every configured entity type is indexed by id and by `(org_id, name)`. Two
//! background tasks keep the indexes current: a complete refresh rebuilds a
//! type's indexes from a full listing and swaps them in, an incremental refresh
//! applies only the entities changed since the watermark, including deletions.
//! Lookups never perform I/O and return copies of the cached entities.

use crate::client::{ClientError, DEFAULT_PAGE_SIZE, DirectoryClient, ListOptions};
use crate::config::RefreshConfig;
use crate::metrics_defs::{CACHE_ENTITIES, CACHE_REFRESH_DURATION, CACHE_REFRESH_ERRORS};
use crate::types::{Entity, EntityType};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use shared::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Returned by [`EntityLookup::get_metrics_id_by_org_and_name`] when nothing matches.
pub const NOT_FOUND: i64 = -1;

/// Synchronous lookups served from memory.
pub trait EntityLookup: Send + Sync {
    fn get_by_id(&self, entity_type: EntityType, id: i64) -> Result<Entity, LookupError>;

    /// Id of the metrics instance named `name` in org `org_id`, or [`NOT_FOUND`].
    fn get_metrics_id_by_org_and_name(&self, org_id: i64, name: &str) -> i64;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("{0} instance cache doesn't exist")]
    NoCache(EntityType),

    #[error("{entity_type} instance with ID {id} does not exist")]
    NotFound { entity_type: EntityType, id: i64 },
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("{0} instance cache is not configured")]
    NotConfigured(EntityType),

    #[error("directory error: {0}")]
    Client(#[from] ClientError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub complete_refresh_interval: Duration,
    pub incremental_refresh_interval: Duration,
    /// Only stack entities placed in this cluster are loaded.
    pub stack_cluster_filter: Option<String>,
    pub entity_types: Vec<EntityType>,
}

impl CacheConfig {
    pub fn new(refresh: &RefreshConfig, entity_types: Vec<EntityType>) -> Self {
        CacheConfig {
            complete_refresh_interval: refresh.complete_refresh_interval(),
            incremental_refresh_interval: refresh.incremental_refresh_interval(),
            stack_cluster_filter: None,
            entity_types,
        }
    }

    fn validate(&self) -> Result<(), CacheError> {
        if self.entity_types.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "configure at least 1 instance cache type",
            ));
        }
        if self.complete_refresh_interval.is_zero() || self.incremental_refresh_interval.is_zero()
        {
            return Err(CacheError::InvalidConfiguration(
                "refresh intervals must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum RefreshKind {
    Complete,
    Incremental,
}

impl RefreshKind {
    const fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::Complete => "complete",
            RefreshKind::Incremental => "incremental",
        }
    }
}

type OrgAndName = (i64, String);

#[derive(Default)]
struct TypeIndex {
    by_id: HashMap<i64, Entity>,
    id_by_org_and_name: HashMap<OrgAndName, i64>,
}

impl TypeIndex {
    fn upsert(&mut self, entity: Entity) {
        let key = (entity.org_id, entity.name.clone());

        // A renamed entity must not keep answering for its old name.
        let previous_key = self
            .by_id
            .get(&entity.id)
            .map(|previous| (previous.org_id, previous.name.clone()))
            .filter(|previous_key| *previous_key != key);
        if let Some(previous_key) = previous_key {
            self.release_name(&previous_key, entity.id);
        }

        self.id_by_org_and_name.insert(key, entity.id);
        self.by_id.insert(entity.id, entity);
    }

    /// Returns whether the entity was present.
    fn remove(&mut self, id: i64) -> bool {
        match self.by_id.remove(&id) {
            Some(previous) => {
                self.release_name(&(previous.org_id, previous.name), id);
                true
            }
            None => false,
        }
    }

    // Drops the name mapping if it points at `id`, handing it over to another
    // entity with the same org and name if one is still cached.
    fn release_name(&mut self, key: &OrgAndName, id: i64) {
        if self.id_by_org_and_name.get(key) != Some(&id) {
            return;
        }

        let successor = self
            .by_id
            .values()
            .find(|e| e.id != id && e.org_id == key.0 && e.name == key.1)
            .map(|e| e.id);

        match successor {
            Some(successor) => {
                self.id_by_org_and_name.insert(key.clone(), successor);
            }
            None => {
                self.id_by_org_and_name.remove(key);
            }
        }
    }
}

#[derive(Default)]
struct CacheState {
    indexes: HashMap<EntityType, TypeIndex>,
    // Latest creation or update time seen across all entity types.
    watermark: Option<DateTime<Utc>>,
}

fn advance(watermark: &mut Option<DateTime<Utc>>, seen: DateTime<Utc>) {
    if watermark.is_none_or(|current| seen > current) {
        *watermark = Some(seen);
    }
}

struct Inner {
    config: CacheConfig,
    client: Arc<dyn DirectoryClient>,
    state: RwLock<CacheState>,
    // Held across fetch and apply. A complete listing must not be swapped in
    // after deltas newer than it were applied.
    update_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn list_options(&self, entity_type: EntityType) -> ListOptions {
        let cluster = match entity_type {
            EntityType::Stack => self.config.stack_cluster_filter.clone(),
            _ => None,
        };

        ListOptions::new(entity_type)
            .with_page_size(DEFAULT_PAGE_SIZE)
            .with_cluster(cluster)
    }

    async fn complete_refresh(&self, entity_type: EntityType) -> Result<(), ClientError> {
        tracing::info!(entity_type = %entity_type, "Attempting to build instance cache");

        let options = self.list_options(entity_type);
        let entities = self.client.list_entities_paged(&options).await?;

        let mut index = TypeIndex::default();
        let mut newest = None;

        for entity in entities {
            advance(&mut newest, entity.last_modified());

            if entity.is_deleted() {
                continue;
            }

            tracing::debug!(
                id = entity.id,
                org_id = entity.org_id,
                name = %entity.name,
                "Adding instance to cache"
            );
            index.upsert(entity);
        }

        let count = index.by_id.len();

        {
            let mut state = self.state.write();
            state.indexes.insert(entity_type, index);
            // The fetch may predate an incremental refresh that already moved the
            // watermark, so never move it backwards.
            if let Some(newest) = newest {
                advance(&mut state.watermark, newest);
            }
        }

        gauge!(CACHE_ENTITIES, "entity_type" => entity_type.as_str()).set(count as f64);
        tracing::info!(entity_type = %entity_type, count, "Instance cache built");

        Ok(())
    }

    async fn incremental_refresh(&self, entity_type: EntityType) -> Result<(), ClientError> {
        let since = self.state.read().watermark;
        tracing::info!(
            entity_type = %entity_type,
            since = ?since,
            "Attempting to update instance cache"
        );

        let options = self
            .list_options(entity_type)
            .including_deleted()
            .updated_since(since);
        let entities = self.client.list_entities_paged(&options).await?;

        let mut state = self.state.write();
        let CacheState { indexes, watermark } = &mut *state;
        let index = indexes.entry(entity_type).or_default();

        for entity in entities {
            advance(watermark, entity.last_modified());

            if entity.is_deleted() {
                if index.remove(entity.id) {
                    tracing::debug!(id = entity.id, "Removing deleted instance from cache");
                }
                continue;
            }

            tracing::debug!(id = entity.id, "Adding/updating instance in cache");
            index.upsert(entity);
        }

        gauge!(CACHE_ENTITIES, "entity_type" => entity_type.as_str())
            .set(index.by_id.len() as f64);

        Ok(())
    }

    async fn refresh(&self, kind: RefreshKind, entity_type: EntityType) -> Result<(), CacheError> {
        if !self.config.entity_types.contains(&entity_type) {
            return Err(CacheError::NotConfigured(entity_type));
        }

        let _update = self.update_lock.lock().await;
        let start = Instant::now();

        let result = match kind {
            RefreshKind::Complete => self.complete_refresh(entity_type).await,
            RefreshKind::Incremental => self.incremental_refresh(entity_type).await,
        };

        histogram!(
            CACHE_REFRESH_DURATION,
            "kind" => kind.as_str(),
            "entity_type" => entity_type.as_str()
        )
        .record(start.elapsed().as_secs_f64());

        if result.is_err() {
            counter!(
                CACHE_REFRESH_ERRORS,
                "kind" => kind.as_str(),
                "entity_type" => entity_type.as_str()
            )
            .increment(1);
        }

        result.map_err(CacheError::from)
    }

    // A failing entity type is logged and skipped, the others still refresh.
    async fn refresh_all(&self, kind: RefreshKind) {
        for entity_type in &self.config.entity_types {
            if let Err(e) = self.refresh(kind, *entity_type).await {
                tracing::error!(
                    entity_type = %entity_type,
                    kind = kind.as_str(),
                    error = %e,
                    "Unable to refresh instance cache"
                );
            }
        }
    }

    async fn run_refresh_loop(self: Arc<Self>, kind: RefreshKind, cxl: CancellationToken) {
        let period = match kind {
            RefreshKind::Complete => self.config.complete_refresh_interval,
            RefreshKind::Incremental => self.config.incremental_refresh_interval,
        };

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cxl.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Refreshes only mutate the indexes after their fetch completed, so
            // dropping one mid-flight leaves the cache untouched.
            tokio::select! {
                _ = cxl.cancelled() => break,
                _ = self.refresh_all(kind) => {}
            }
        }

        tracing::debug!(kind = kind.as_str(), "Refresh loop stopped");
    }
}

struct Workers {
    cxl: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.cxl.cancel();
    }
}

/// Cache of directory entities, refreshed in the background until
/// [`InstanceCache::shutdown`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct InstanceCache {
    inner: Arc<Inner>,
    workers: Arc<Workers>,
}

impl InstanceCache {
    /// Builds the cache with a complete refresh of every configured entity type and
    /// starts the refresh tasks. Fails if any initial refresh fails.
    pub async fn new(
        config: CacheConfig,
        client: Arc<dyn DirectoryClient>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let inner = Arc::new(Inner {
            config,
            client,
            state: RwLock::new(CacheState::default()),
            update_lock: tokio::sync::Mutex::new(()),
        });

        for entity_type in &inner.config.entity_types {
            inner.complete_refresh(*entity_type).await?;
        }

        let cxl = CancellationToken::new();
        let handles = vec![
            tokio::spawn(
                inner
                    .clone()
                    .run_refresh_loop(RefreshKind::Complete, cxl.clone()),
            ),
            tokio::spawn(
                inner
                    .clone()
                    .run_refresh_loop(RefreshKind::Incremental, cxl.clone()),
            ),
        ];

        Ok(InstanceCache {
            inner,
            workers: Arc::new(Workers {
                cxl,
                handles: Mutex::new(handles),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Rebuilds the indexes of `entity_type` from a full listing.
    ///
    /// Fails with [`CacheError::NotConfigured`] for a type this cache was not built for.
    pub async fn complete_refresh(&self, entity_type: EntityType) -> Result<(), CacheError> {
        self.inner.refresh(RefreshKind::Complete, entity_type).await
    }

    /// Applies the changes to `entity_type` made since the watermark.
    pub async fn incremental_refresh(&self, entity_type: EntityType) -> Result<(), CacheError> {
        self.inner
            .refresh(RefreshKind::Incremental, entity_type)
            .await
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.inner.state.read().watermark
    }

    /// Number of cached entities of `entity_type`.
    pub fn len(&self, entity_type: EntityType) -> usize {
        self.inner
            .state
            .read()
            .indexes
            .get(&entity_type)
            .map_or(0, |index| index.by_id.len())
    }

    /// Stops the refresh tasks and waits for them to exit.
    pub async fn shutdown(&self) {
        self.workers.cxl.cancel();

        let handles = std::mem::take(&mut *self.workers.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Refresh task panicked: {e}");
            }
        }
    }
}

impl EntityLookup for InstanceCache {
    fn get_by_id(&self, entity_type: EntityType, id: i64) -> Result<Entity, LookupError> {
        let state = self.inner.state.read();

        let index = state
            .indexes
            .get(&entity_type)
            .ok_or(LookupError::NoCache(entity_type))?;

        index
            .by_id
            .get(&id)
            .cloned()
            .ok_or(LookupError::NotFound { entity_type, id })
    }

    fn get_metrics_id_by_org_and_name(&self, org_id: i64, name: &str) -> i64 {
        tracing::debug!(org_id, name, "Looking up metrics instance");

        let state = self.inner.state.read();
        state
            .indexes
            .get(&EntityType::Metrics)
            .and_then(|index| index.id_by_org_and_name.get(&(org_id, name.to_string())))
            .copied()
            .unwrap_or(NOT_FOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClusterListOptions, OrgListOptions};
    use crate::mock::MockDirectoryClient;
    use crate::types::{ApiKey, Cluster, EntityStatus, Org};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Notify, Semaphore};

    const SOME_CLUSTER: &str = "cluster";
    const OTHER_CLUSTER: &str = "cluster_other";
    const LONG: Duration = Duration::from_secs(3600);
    const SHORT: Duration = Duration::from_millis(30);

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn entity(id: i64, org_id: i64, cluster: &str) -> Entity {
        Entity {
            id,
            org_id,
            name: format!("instance-{id}"),
            cluster_name: cluster.into(),
            created_at: created(),
            ..Default::default()
        }
    }

    fn updated(mut entity: Entity, hours: i64) -> Entity {
        entity.updated_at = Some(created() + chrono::Duration::hours(hours));
        entity
    }

    fn deleted(entity: Entity, hours: i64) -> Entity {
        let mut entity = updated(entity, hours);
        entity.status = EntityStatus::Deleted;
        entity
    }

    fn mock_entities() -> HashMap<EntityType, Vec<Entity>> {
        HashMap::from([
            (
                EntityType::Metrics,
                vec![entity(1, 1, OTHER_CLUSTER), entity(2, 2, OTHER_CLUSTER)],
            ),
            (
                EntityType::Logs,
                vec![entity(3, 3, OTHER_CLUSTER), entity(4, 4, OTHER_CLUSTER)],
            ),
            (
                EntityType::Traces,
                vec![entity(5, 5, OTHER_CLUSTER), entity(6, 6, OTHER_CLUSTER)],
            ),
            (
                EntityType::Alerts,
                vec![entity(7, 7, OTHER_CLUSTER), entity(8, 8, OTHER_CLUSTER)],
            ),
            (
                EntityType::Stack,
                vec![entity(9, 9, SOME_CLUSTER), entity(10, 10, OTHER_CLUSTER)],
            ),
        ])
    }

    fn config(entity_types: Vec<EntityType>) -> CacheConfig {
        CacheConfig {
            complete_refresh_interval: LONG,
            incremental_refresh_interval: LONG,
            stack_cluster_filter: None,
            entity_types,
        }
    }

    async fn build(
        config: CacheConfig,
        entities: HashMap<EntityType, Vec<Entity>>,
    ) -> (Arc<MockDirectoryClient>, InstanceCache) {
        let client = Arc::new(MockDirectoryClient::new(entities));
        let cache = InstanceCache::new(config, client.clone()).await.unwrap();
        (client, cache)
    }

    #[tokio::test]
    async fn test_requires_entity_types() {
        let client = Arc::new(MockDirectoryClient::default());
        let result = InstanceCache::new(config(vec![]), client).await;
        assert!(matches!(result, Err(CacheError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_initial_refresh_failure_is_fatal() {
        let client = Arc::new(MockDirectoryClient::new(mock_entities()));
        client.set_unavailable(true);

        let result = InstanceCache::new(config(vec![EntityType::Stack]), client).await;
        assert!(matches!(result, Err(CacheError::Client(_))));
    }

    #[tokio::test]
    async fn test_selected_entity_types() {
        let enabled = [EntityType::Alerts, EntityType::Stack];
        let (_client, cache) = build(config(enabled.to_vec()), mock_entities()).await;

        for (entity_type, entities) in mock_entities() {
            for entity in entities {
                let result = cache.get_by_id(entity_type, entity.id);
                if enabled.contains(&entity_type) {
                    let cached = result.unwrap();
                    assert_eq!(cached.id, entity.id);
                    assert_eq!(cached.org_id, entity.org_id);
                } else {
                    assert_eq!(result, Err(LookupError::NoCache(entity_type)));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_cluster_filter_applies_to_stacks_only() {
        let mut config = config(vec![EntityType::Alerts, EntityType::Stack]);
        config.stack_cluster_filter = Some(SOME_CLUSTER.into());
        let (_client, cache) = build(config, mock_entities()).await;

        assert!(cache.get_by_id(EntityType::Stack, 9).is_ok());
        assert_eq!(
            cache.get_by_id(EntityType::Stack, 10),
            Err(LookupError::NotFound {
                entity_type: EntityType::Stack,
                id: 10
            })
        );
        // Alerts live in the other cluster but are not filtered.
        assert!(cache.get_by_id(EntityType::Alerts, 7).is_ok());
        assert!(cache.get_by_id(EntityType::Alerts, 8).is_ok());
    }

    #[tokio::test]
    async fn test_lookup_error_messages() {
        let (_client, cache) = build(config(vec![EntityType::Stack]), mock_entities()).await;

        assert_eq!(
            cache.get_by_id(EntityType::Logs, 3).unwrap_err().to_string(),
            "logs instance cache doesn't exist"
        );
        assert_eq!(
            cache.get_by_id(EntityType::Stack, 3).unwrap_err().to_string(),
            "grafana instance with ID 3 does not exist"
        );
    }

    #[tokio::test]
    async fn test_complete_refresh_replaces_snapshot() {
        let (client, cache) = build(config(vec![EntityType::Metrics]), mock_entities()).await;

        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![entity(3, 1, OTHER_CLUSTER), entity(4, 1, OTHER_CLUSTER)],
        )]));
        cache.complete_refresh(EntityType::Metrics).await.unwrap();

        assert!(cache.get_by_id(EntityType::Metrics, 1).is_err());
        assert!(cache.get_by_id(EntityType::Metrics, 2).is_err());
        assert!(cache.get_by_id(EntityType::Metrics, 3).is_ok());
        assert!(cache.get_by_id(EntityType::Metrics, 4).is_ok());
        assert_eq!(cache.len(EntityType::Metrics), 2);
        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "instance-1"), NOT_FOUND);
        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "instance-3"), 3);
    }

    #[tokio::test]
    async fn test_complete_refresh_on_interval() {
        let mut config = config(vec![EntityType::Metrics]);
        config.complete_refresh_interval = SHORT;

        let (client, cache) = build(
            config,
            HashMap::from([(
                EntityType::Metrics,
                vec![entity(1, 1, OTHER_CLUSTER), entity(2, 1, OTHER_CLUSTER)],
            )]),
        )
        .await;

        assert!(cache.get_by_id(EntityType::Metrics, 1).is_ok());
        assert!(cache.get_by_id(EntityType::Metrics, 3).is_err());

        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![entity(3, 1, OTHER_CLUSTER), entity(4, 1, OTHER_CLUSTER)],
        )]));

        tokio::time::sleep(SHORT * 5).await;

        assert!(cache.get_by_id(EntityType::Metrics, 1).is_err());
        assert!(cache.get_by_id(EntityType::Metrics, 3).is_ok());
    }

    #[tokio::test]
    async fn test_incremental_refresh_on_interval() {
        let mut config = config(vec![EntityType::Metrics]);
        config.incremental_refresh_interval = SHORT;

        let (client, cache) = build(
            config,
            HashMap::from([(
                EntityType::Metrics,
                vec![entity(1, 1, OTHER_CLUSTER), entity(2, 1, OTHER_CLUSTER)],
            )]),
        )
        .await;

        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![
                deleted(entity(1, 1, OTHER_CLUSTER), 1),
                entity(2, 1, OTHER_CLUSTER),
            ],
        )]));

        tokio::time::sleep(SHORT * 5).await;

        assert!(cache.get_by_id(EntityType::Metrics, 1).is_err());
        assert!(cache.get_by_id(EntityType::Metrics, 2).is_ok());
    }

    #[tokio::test]
    async fn test_incremental_refresh_upserts_and_advances_watermark() {
        let (client, cache) = build(config(vec![EntityType::Logs]), mock_entities()).await;
        assert_eq!(cache.watermark(), Some(created()));

        let mut renamed = updated(entity(3, 3, OTHER_CLUSTER), 2);
        renamed.url = "https://logs.example.net".into();
        client.reset_entities(HashMap::from([(
            EntityType::Logs,
            vec![renamed, updated(entity(12, 3, OTHER_CLUSTER), 1)],
        )]));

        cache.incremental_refresh(EntityType::Logs).await.unwrap();

        assert_eq!(
            cache.get_by_id(EntityType::Logs, 3).unwrap().url,
            "https://logs.example.net"
        );
        assert!(cache.get_by_id(EntityType::Logs, 12).is_ok());
        // Entity 4 was not part of the delta and stays cached.
        assert!(cache.get_by_id(EntityType::Logs, 4).is_ok());
        assert_eq!(
            cache.watermark(),
            Some(created() + chrono::Duration::hours(2))
        );
    }

    #[tokio::test]
    async fn test_incremental_refresh_is_idempotent() {
        let (client, cache) = build(config(vec![EntityType::Metrics]), mock_entities()).await;

        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![
                deleted(entity(1, 1, OTHER_CLUSTER), 1),
                updated(entity(2, 2, SOME_CLUSTER), 1),
                updated(entity(20, 2, SOME_CLUSTER), 1),
            ],
        )]));

        let snapshot = |cache: &InstanceCache| {
            [1, 2, 20]
                .map(|id| cache.get_by_id(EntityType::Metrics, id).ok())
                .to_vec()
        };

        cache.incremental_refresh(EntityType::Metrics).await.unwrap();
        let once = snapshot(&cache);
        let watermark = cache.watermark();

        cache.incremental_refresh(EntityType::Metrics).await.unwrap();
        assert_eq!(snapshot(&cache), once);
        assert_eq!(cache.watermark(), watermark);
        assert_eq!(cache.len(EntityType::Metrics), 2);
    }

    #[tokio::test]
    async fn test_deleting_unknown_entity_is_noop() {
        let (client, cache) = build(config(vec![EntityType::Traces]), mock_entities()).await;

        client.add_entity(EntityType::Traces, deleted(entity(99, 5, OTHER_CLUSTER), 1));
        cache.incremental_refresh(EntityType::Traces).await.unwrap();

        assert!(cache.get_by_id(EntityType::Traces, 99).is_err());
        assert_eq!(cache.len(EntityType::Traces), 2);
    }

    #[tokio::test]
    async fn test_metrics_id_by_org_and_name() {
        let (client, cache) = build(
            config(vec![EntityType::Metrics, EntityType::Logs]),
            mock_entities(),
        )
        .await;

        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "instance-1"), 1);
        assert_eq!(cache.get_metrics_id_by_org_and_name(2, "instance-2"), 2);
        assert_eq!(cache.get_metrics_id_by_org_and_name(2, "instance-1"), NOT_FOUND);
        // Only the metrics entity type answers name lookups.
        assert_eq!(cache.get_metrics_id_by_org_and_name(3, "instance-3"), NOT_FOUND);

        let mut renamed = updated(entity(2, 2, OTHER_CLUSTER), 1);
        renamed.name = "renamed".into();
        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![deleted(entity(1, 1, OTHER_CLUSTER), 1), renamed],
        )]));
        cache.incremental_refresh(EntityType::Metrics).await.unwrap();

        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "instance-1"), NOT_FOUND);
        assert_eq!(cache.get_metrics_id_by_org_and_name(2, "instance-2"), NOT_FOUND);
        assert_eq!(cache.get_metrics_id_by_org_and_name(2, "renamed"), 2);
    }

    #[tokio::test]
    async fn test_name_conflicts_last_write_wins() {
        let mut first = entity(1, 1, OTHER_CLUSTER);
        first.name = "shared".into();
        let (client, cache) = build(
            config(vec![EntityType::Metrics]),
            HashMap::from([(EntityType::Metrics, vec![first.clone()])]),
        )
        .await;

        let mut second = updated(entity(2, 1, OTHER_CLUSTER), 1);
        second.name = "shared".into();
        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![second.clone()],
        )]));
        cache.incremental_refresh(EntityType::Metrics).await.unwrap();
        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "shared"), 2);

        // Deleting the newer entity hands the name back to the one still active.
        client.reset_entities(HashMap::from([(
            EntityType::Metrics,
            vec![deleted(second, 2)],
        )]));
        cache.incremental_refresh(EntityType::Metrics).await.unwrap();
        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "shared"), 1);
    }

    #[tokio::test]
    async fn test_complete_refresh_never_regresses_watermark() {
        let (client, cache) = build(config(vec![EntityType::Metrics]), mock_entities()).await;

        client.add_entity(EntityType::Metrics, updated(entity(30, 1, OTHER_CLUSTER), 5));
        cache.incremental_refresh(EntityType::Metrics).await.unwrap();
        let advanced = cache.watermark();
        assert_eq!(advanced, Some(created() + chrono::Duration::hours(5)));

        // A full listing that only holds older records.
        client.reset_entities(mock_entities());
        cache.complete_refresh(EntityType::Metrics).await.unwrap();

        assert_eq!(cache.watermark(), advanced);
        assert!(cache.get_by_id(EntityType::Metrics, 30).is_err());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_data() {
        let (client, cache) = build(config(vec![EntityType::Stack]), mock_entities()).await;

        client.set_unavailable(true);
        assert!(cache.complete_refresh(EntityType::Stack).await.is_err());
        assert!(cache.incremental_refresh(EntityType::Stack).await.is_err());

        assert!(cache.get_by_id(EntityType::Stack, 9).is_ok());
        assert!(cache.get_by_id(EntityType::Stack, 10).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_loop_survives_errors() {
        let mut config = config(vec![EntityType::Stack]);
        config.complete_refresh_interval = SHORT;
        let (client, cache) = build(config, mock_entities()).await;

        client.set_unavailable(true);
        tokio::time::sleep(SHORT * 3).await;
        assert!(cache.get_by_id(EntityType::Stack, 9).is_ok());

        client.set_unavailable(false);
        client.reset_entities(HashMap::from([(
            EntityType::Stack,
            vec![entity(11, 11, SOME_CLUSTER)],
        )]));
        tokio::time::sleep(SHORT * 5).await;

        assert!(cache.get_by_id(EntityType::Stack, 9).is_err());
        assert!(cache.get_by_id(EntityType::Stack, 11).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_refresh() {
        let mut config = config(vec![EntityType::Stack]);
        config.complete_refresh_interval = SHORT;
        config.incremental_refresh_interval = SHORT;
        let (client, cache) = build(config, mock_entities()).await;

        cache.shutdown().await;
        let calls = client.list_calls();

        client.reset_entities(HashMap::new());
        tokio::time::sleep(SHORT * 4).await;

        assert_eq!(client.list_calls(), calls);
        assert!(cache.get_by_id(EntityType::Stack, 9).is_ok());
    }

    #[tokio::test]
    async fn test_drop_stops_refresh() {
        let mut config = config(vec![EntityType::Stack]);
        config.incremental_refresh_interval = SHORT;
        let (client, cache) = build(config, mock_entities()).await;

        drop(cache);
        // Let the cancelled tasks observe the token.
        tokio::time::sleep(SHORT).await;
        let calls = client.list_calls();
        tokio::time::sleep(SHORT * 4).await;

        assert_eq!(client.list_calls(), calls);
    }

    #[tokio::test]
    async fn test_refresh_of_unconfigured_type() {
        let (_client, cache) = build(config(vec![EntityType::Stack]), mock_entities()).await;

        assert!(matches!(
            cache.complete_refresh(EntityType::Logs).await,
            Err(CacheError::NotConfigured(EntityType::Logs))
        ));
        assert!(matches!(
            cache.incremental_refresh(EntityType::Logs).await,
            Err(CacheError::NotConfigured(EntityType::Logs))
        ));

        assert_eq!(
            cache.get_by_id(EntityType::Logs, 3),
            Err(LookupError::NoCache(EntityType::Logs))
        );
        assert_eq!(cache.len(EntityType::Logs), 0);
    }

    /// Holds complete listings back after they were fetched until released.
    struct GatedClient {
        inner: MockDirectoryClient,
        armed: AtomicBool,
        fetched: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl DirectoryClient for GatedClient {
        async fn check_api_key(&self, key: &str) -> Result<ApiKey, ClientError> {
            self.inner.check_api_key(key).await
        }

        async fn list_entities(&self, options: &ListOptions) -> Result<Vec<Entity>, ClientError> {
            let entities = self.inner.list_entities(options).await?;

            if !options.include_deleted && self.armed.swap(false, Ordering::SeqCst) {
                self.fetched.notify_one();
                self.gate.acquire().await.unwrap().forget();
            }

            Ok(entities)
        }

        async fn list_orgs(&self, options: &OrgListOptions) -> Result<Vec<Org>, ClientError> {
            self.inner.list_orgs(options).await
        }

        async fn list_clusters(
            &self,
            options: &ClusterListOptions,
        ) -> Result<Vec<Cluster>, ClientError> {
            self.inner.list_clusters(options).await
        }
    }

    #[tokio::test]
    async fn test_incremental_refresh_waits_for_complete_refresh() {
        let client = Arc::new(GatedClient {
            inner: MockDirectoryClient::new(HashMap::from([(
                EntityType::Metrics,
                vec![entity(1, 1, OTHER_CLUSTER)],
            )])),
            armed: AtomicBool::new(false),
            fetched: Notify::new(),
            gate: Semaphore::new(0),
        });
        let cache = InstanceCache::new(config(vec![EntityType::Metrics]), client.clone())
            .await
            .unwrap();

        client.armed.store(true, Ordering::SeqCst);
        let complete = tokio::spawn({
            let cache = cache.clone();
            async move { cache.complete_refresh(EntityType::Metrics).await }
        });
        client.fetched.notified().await;

        // Created after the complete listing was fetched.
        client
            .inner
            .add_entity(EntityType::Metrics, updated(entity(2, 1, OTHER_CLUSTER), 1));
        client
            .inner
            .add_entity(EntityType::Metrics, updated(entity(3, 1, OTHER_CLUSTER), 2));

        let incremental = tokio::spawn({
            let cache = cache.clone();
            async move { cache.incremental_refresh(EntityType::Metrics).await }
        });
        tokio::time::sleep(SHORT).await;
        assert!(!incremental.is_finished());

        client.gate.add_permits(1);
        complete.await.unwrap().unwrap();
        incremental.await.unwrap().unwrap();

        assert!(cache.get_by_id(EntityType::Metrics, 1).is_ok());
        assert!(cache.get_by_id(EntityType::Metrics, 2).is_ok());
        assert!(cache.get_by_id(EntityType::Metrics, 3).is_ok());
        assert_eq!(
            cache.watermark(),
            Some(created() + chrono::Duration::hours(2))
        );

        // Nothing is left for the next delta to pick up.
        cache.incremental_refresh(EntityType::Metrics).await.unwrap();
        assert_eq!(cache.len(EntityType::Metrics), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lookups_during_concurrent_refreshes() {
        let mut config = config(vec![EntityType::Metrics]);
        config.complete_refresh_interval = Duration::from_millis(5);
        config.incremental_refresh_interval = Duration::from_millis(3);
        let (client, cache) = build(
            config,
            HashMap::from([(
                EntityType::Metrics,
                vec![entity(1, 1, OTHER_CLUSTER), entity(2, 2, OTHER_CLUSTER)],
            )]),
        )
        .await;

        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let mut reads = 0;
                    while !done.load(Ordering::SeqCst) {
                        // Entity 1 is in every listing and is never deleted.
                        let stable = cache.get_by_id(EntityType::Metrics, 1).unwrap();
                        assert_eq!(stable.name, "instance-1");
                        assert_eq!(stable.org_id, 1);
                        assert_eq!(cache.get_metrics_id_by_org_and_name(1, "instance-1"), 1);

                        // Entity 2 comes and goes but is always whole.
                        if let Ok(churn) = cache.get_by_id(EntityType::Metrics, 2) {
                            assert_eq!(churn.org_id, 2);
                            assert_eq!(churn.name, "instance-2");
                        }
                        match cache.get_metrics_id_by_org_and_name(2, "instance-2") {
                            NOT_FOUND | 2 => {}
                            other => panic!("unexpected id {other}"),
                        }

                        reads += 1;
                        tokio::task::yield_now().await;
                    }
                    reads
                })
            })
            .collect();

        let refreshers: Vec<_> = [RefreshKind::Complete, RefreshKind::Incremental]
            .into_iter()
            .map(|kind| {
                let cache = cache.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    while !done.load(Ordering::SeqCst) {
                        let result = match kind {
                            RefreshKind::Complete => {
                                cache.complete_refresh(EntityType::Metrics).await
                            }
                            RefreshKind::Incremental => {
                                cache.incremental_refresh(EntityType::Metrics).await
                            }
                        };
                        result.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for round in 1..=50 {
            let mut stable = updated(entity(1, 1, OTHER_CLUSTER), round);
            stable.url = format!("https://round-{round}.example.net");
            let churn = match round % 2 {
                0 => deleted(entity(2, 2, OTHER_CLUSTER), round),
                _ => updated(entity(2, 2, OTHER_CLUSTER), round),
            };
            client.reset_entities(HashMap::from([(EntityType::Metrics, vec![stable, churn])]));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        done.store(true, Ordering::SeqCst);
        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        for refresher in refreshers {
            refresher.await.unwrap();
        }

        cache.complete_refresh(EntityType::Metrics).await.unwrap();
        assert_eq!(
            cache.get_by_id(EntityType::Metrics, 1).unwrap().url,
            "https://round-50.example.net"
        );
        assert_eq!(cache.watermark(), Some(created() + chrono::Duration::hours(50)));
        cache.shutdown().await;
    }
}
