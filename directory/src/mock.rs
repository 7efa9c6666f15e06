//! In-memory directory used by tests and by dry-run mode.

use crate::client::{ClientError, ClusterListOptions, DirectoryClient, ListOptions, OrgListOptions};
use crate::types::{ApiKey, Cluster, Entity, EntityType, Org};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

pub const FIXTURE_CLUSTER: &str = "1";
pub const FIXTURE_STACK_ID: i64 = 1;
pub const FIXTURE_ORG_ID: i64 = 10;

#[derive(Default)]
struct MockState {
    entities: HashMap<EntityType, Vec<Entity>>,
    keys: HashMap<String, ApiKey>,
    orgs: Vec<Org>,
    // Keyed by listing endpoint.
    clusters: HashMap<&'static str, Vec<Cluster>>,
    unavailable: bool,
    list_calls: usize,
    key_checks: usize,
}

/// Serves entities from memory and honours the same filters as the HTTP API.
#[derive(Default)]
pub struct MockDirectoryClient {
    state: Mutex<MockState>,
}

impl MockDirectoryClient {
    pub fn new(entities: HashMap<EntityType, Vec<Entity>>) -> Self {
        MockDirectoryClient {
            state: Mutex::new(MockState {
                entities,
                ..Default::default()
            }),
        }
    }

    /// A directory holding one stack with a metrics, a logs and a traces instance.
    pub fn with_fixtures() -> Self {
        Self::new(fixtures())
    }

    pub fn add_entity(&self, entity_type: EntityType, entity: Entity) {
        self.state
            .lock()
            .entities
            .entry(entity_type)
            .or_default()
            .push(entity);
    }

    pub fn reset_entities(&self, entities: HashMap<EntityType, Vec<Entity>>) {
        self.state.lock().entities = entities;
    }

    pub fn add_api_key(&self, token: &str, key: ApiKey) {
        self.state.lock().keys.insert(token.to_string(), key);
    }

    pub fn add_org(&self, org: Org) {
        self.state.lock().orgs.push(org);
    }

    /// Registers a cluster hosting entities of `entity_type`.
    pub fn add_cluster(&self, entity_type: EntityType, cluster: Cluster) {
        let path = ClusterListOptions::new(entity_type).path();
        self.state
            .lock()
            .clusters
            .entry(path)
            .or_default()
            .push(cluster);
    }

    /// Makes every call fail with an access error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn key_checks(&self) -> usize {
        self.state.lock().key_checks
    }
}

fn matches(entity: &Entity, options: &ListOptions) -> bool {
    if options.id.is_some_and(|id| id != 0 && entity.id != id) {
        return false;
    }
    if options.org_id.is_some_and(|org_id| entity.org_id != org_id) {
        return false;
    }
    if options.name.as_ref().is_some_and(|name| &entity.name != name) {
        return false;
    }
    if let Some(cluster) = options.cluster.as_ref().filter(|c| !c.is_empty())
        && &entity.cluster_name != cluster
    {
        return false;
    }
    if !options.include_deleted && entity.is_deleted() {
        return false;
    }
    if let Some(min) = options.updated_or_created_at_min
        && entity.last_modified() < min
    {
        return false;
    }
    if options.cursor.is_some_and(|cursor| entity.id < cursor) {
        return false;
    }
    true
}

#[async_trait]
impl DirectoryClient for MockDirectoryClient {
    async fn check_api_key(&self, key: &str) -> Result<ApiKey, ClientError> {
        let mut state = self.state.lock();
        state.key_checks += 1;

        if state.unavailable {
            return Err(ClientError::Access("directory unavailable".into()));
        }

        state.keys.get(key).cloned().ok_or(ClientError::InvalidKey)
    }

    async fn list_entities(&self, options: &ListOptions) -> Result<Vec<Entity>, ClientError> {
        let mut state = self.state.lock();
        state.list_calls += 1;

        if state.unavailable {
            return Err(ClientError::Access("directory unavailable".into()));
        }

        // Concrete metrics backends are all served from the metrics listing.
        let source = match options.entity_type {
            t if t.is_metrics() => EntityType::Metrics,
            t => t,
        };

        let mut found: Vec<Entity> = state
            .entities
            .get(&source)
            .map(|entities| {
                entities
                    .iter()
                    .filter(|e| matches(e, options))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        found.sort_by_key(|e| e.id);
        if options.page_size > 0 {
            found.truncate(options.page_size);
        }

        Ok(found)
    }

    async fn list_orgs(&self, options: &OrgListOptions) -> Result<Vec<Org>, ClientError> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(ClientError::Access("directory unavailable".into()));
        }

        Ok(state
            .orgs
            .iter()
            .filter(|org| options.id.is_none_or(|id| org.id == id))
            .filter(|org| options.slug.as_ref().is_none_or(|slug| &org.slug == slug))
            .filter(|org| {
                options
                    .contract_type
                    .is_none_or(|contract_type| org.contract_type == contract_type)
            })
            .filter(|org| {
                options.cloud_subscriptions.is_empty()
                    || options.cloud_subscriptions.contains(&org.cloud_subscription)
            })
            .cloned()
            .collect())
    }

    async fn list_clusters(
        &self,
        options: &ClusterListOptions,
    ) -> Result<Vec<Cluster>, ClientError> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(ClientError::Access("directory unavailable".into()));
        }

        Ok(state
            .clusters
            .get(options.path())
            .into_iter()
            .flatten()
            .filter(|c| options.slugs.is_empty() || options.slugs.contains(&c.slug))
            .cloned()
            .collect())
    }
}

pub fn fixtures() -> HashMap<EntityType, Vec<Entity>> {
    let metrics_url = "https://prometheus-dev-01-dev-us-central-0.grafana.net";
    let logs_url = "https://logs-dev-01-dev-us-central-0.grafana.net";
    let traces_url = "https://tempo-dev-01-dev-us-central-0.grafana.net";

    let instance = |id: i64, entity_type: EntityType, url: &str| Entity {
        id,
        org_id: FIXTURE_ORG_ID,
        entity_type: entity_type.to_string(),
        cluster_id: 1,
        cluster_slug: "dev-01-dev-us-central-0".into(),
        cluster_name: FIXTURE_CLUSTER.into(),
        name: format!("{entity_type}-{id}"),
        url: url.into(),
        stack_instance_id: FIXTURE_STACK_ID,
        ..Default::default()
    };

    let stack = Entity {
        id: FIXTURE_STACK_ID,
        org_id: FIXTURE_ORG_ID,
        entity_type: EntityType::Stack.to_string(),
        cluster_id: 1,
        cluster_name: FIXTURE_CLUSTER.into(),
        name: "stack-1".into(),
        logs_instance_id: 1111,
        logs_instance_url: logs_url.into(),
        prom_instance_id: 11,
        prom_instance_url: metrics_url.into(),
        graphite_instance_id: 11111,
        traces_instance_id: 111111,
        traces_instance_url: traces_url.into(),
        stack_instance_id: FIXTURE_STACK_ID,
        ..Default::default()
    };

    HashMap::from([
        (
            EntityType::Metrics,
            vec![instance(11, EntityType::Prometheus, metrics_url)],
        ),
        (
            EntityType::Logs,
            vec![instance(1111, EntityType::Logs, logs_url)],
        ),
        (
            EntityType::Traces,
            vec![instance(111111, EntityType::Traces, traces_url)],
        ),
        (EntityType::Stack, vec![stack]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContractType, EntityStatus};
    use chrono::{TimeZone, Utc};

    fn entity(id: i64, cluster: &str) -> Entity {
        Entity {
            id,
            cluster_name: cluster.into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_filters() {
        let mut deleted = entity(3, "a");
        deleted.status = EntityStatus::Deleted;
        deleted.updated_at = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());

        let client = MockDirectoryClient::new(HashMap::from([(
            EntityType::Stack,
            vec![entity(2, "b"), entity(1, "a"), deleted],
        )]));

        let all = ListOptions::new(EntityType::Stack);
        let ids = |entities: Vec<Entity>| entities.iter().map(|e| e.id).collect::<Vec<_>>();

        assert_eq!(ids(client.list_entities(&all).await.unwrap()), vec![1, 2]);
        assert_eq!(
            ids(client
                .list_entities(&all.clone().with_cluster(Some("a".into())))
                .await
                .unwrap()),
            vec![1]
        );
        assert_eq!(
            ids(client
                .list_entities(&all.clone().including_deleted())
                .await
                .unwrap()),
            vec![1, 2, 3]
        );

        let since = Some(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
        assert_eq!(
            ids(client
                .list_entities(&all.clone().including_deleted().updated_since(since))
                .await
                .unwrap()),
            vec![3]
        );

        assert_eq!(client.list_calls(), 4);
    }

    #[tokio::test]
    async fn test_paging() {
        let client = MockDirectoryClient::new(HashMap::from([(
            EntityType::Logs,
            (1..=5).map(|id| entity(id, "a")).collect(),
        )]));

        let options = ListOptions::new(EntityType::Logs).with_page_size(2);
        let entities = client.list_entities_paged(&options).await.unwrap();
        assert_eq!(entities.len(), 5);
        // Pages of 2, 2, 1.
        assert_eq!(client.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_metrics_backends_share_listing() {
        let client = MockDirectoryClient::with_fixtures();
        let prometheus = client
            .list_entities(&ListOptions::new(EntityType::Prometheus))
            .await
            .unwrap();
        assert_eq!(prometheus[0].id, 11);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let client = MockDirectoryClient::with_fixtures();
        client.add_api_key("token", ApiKey::default());
        assert!(client.check_api_key("token").await.is_ok());
        assert!(matches!(
            client.check_api_key("other").await,
            Err(ClientError::InvalidKey)
        ));

        client.set_unavailable(true);
        assert!(client.check_api_key("token").await.unwrap_err().is_access_error());
        assert!(client
            .list_entities(&ListOptions::new(EntityType::Stack))
            .await
            .is_err());
        assert_eq!(client.key_checks(), 3);
    }

    #[tokio::test]
    async fn test_orgs_and_clusters() {
        let client = MockDirectoryClient::default();
        client.add_org(Org {
            id: 1,
            slug: "acme".into(),
            contract_type: ContractType::Contracted,
            ..Default::default()
        });
        client.add_org(Org {
            id: 2,
            slug: "initech".into(),
            cloud_subscription: 4,
            ..Default::default()
        });
        client.add_cluster(
            EntityType::Stack,
            Cluster {
                id: 1,
                slug: "prod-us-central-0".into(),
            },
        );
        client.add_cluster(
            EntityType::Metrics,
            Cluster {
                id: 7,
                slug: "prod-eu-west-0".into(),
            },
        );

        let slugs = |orgs: Vec<Org>| orgs.into_iter().map(|o| o.slug).collect::<Vec<_>>();
        assert_eq!(
            slugs(client.list_orgs(&OrgListOptions::default()).await.unwrap()),
            vec!["acme", "initech"]
        );
        let contracted = OrgListOptions {
            contract_type: Some(ContractType::Contracted),
            ..Default::default()
        };
        assert_eq!(slugs(client.list_orgs(&contracted).await.unwrap()), vec!["acme"]);
        let trial = OrgListOptions {
            cloud_subscriptions: vec![4],
            ..Default::default()
        };
        assert_eq!(slugs(client.list_orgs(&trial).await.unwrap()), vec!["initech"]);

        let stacks = client
            .list_clusters(&ClusterListOptions::new(EntityType::Stack))
            .await
            .unwrap();
        assert_eq!(stacks[0].id, 1);
        // Logs share the metrics clusters.
        let logs = client
            .list_clusters(&ClusterListOptions::new(EntityType::Logs))
            .await
            .unwrap();
        assert_eq!(logs[0].id, 7);
        let none = client
            .list_clusters(
                &ClusterListOptions::new(EntityType::Logs).with_slugs(vec!["other".into()]),
            )
            .await
            .unwrap();
        assert!(none.is_empty());

        client.set_unavailable(true);
        assert!(client.list_orgs(&OrgListOptions::default()).await.is_err());
        assert!(client
            .list_clusters(&ClusterListOptions::new(EntityType::Stack))
            .await
            .is_err());
    }
}
