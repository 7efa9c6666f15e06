use crate::config::ClientConfig;
use crate::metrics_defs::DIRECTORY_REQUEST_DURATION;
use crate::types::{ApiKey, Cluster, ContractType, Entity, EntityType, ItemList, Org};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::histogram;
use std::time::Instant;
use url::Url;

/// Page size used by the caches when listing entities.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

const API_KEYS_PATH: &str = "api-keys";
const ORGS_PATH: &str = "orgs";

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid response, url={url} status={status}, msg={body}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },
    #[error("error decoding {resource} response, {reason}")]
    Decode {
        resource: &'static str,
        reason: String,
    },
    #[error("unable to access the directory: {0}")]
    Access(String),
    #[error("invalid api key")]
    InvalidKey,
    #[error("specified instance ID is invalid")]
    InvalidEntityId,
    #[error("specified instance ID does not exist")]
    EntityNotFound,
}

impl ClientError {
    /// The directory could not be reached or answered with something unusable.
    pub fn is_access_error(&self) -> bool {
        matches!(self, ClientError::Access(_))
    }
}

/// Filters for a list request against the directory.
#[derive(Clone, Debug, PartialEq)]
pub struct ListOptions {
    pub entity_type: EntityType,
    pub id: Option<i64>,
    pub org_id: Option<i64>,
    pub name: Option<String>,
    pub cluster: Option<String>,
    pub include_deleted: bool,
    /// Only entities created, updated or deleted at or after this instant.
    pub updated_or_created_at_min: Option<DateTime<Utc>>,
    pub cursor: Option<i64>,
    pub page_size: usize,
}

impl ListOptions {
    pub fn new(entity_type: EntityType) -> Self {
        ListOptions {
            entity_type,
            id: None,
            org_id: None,
            name: None,
            cluster: None,
            include_deleted: false,
            updated_or_created_at_min: None,
            cursor: None,
            page_size: 0,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_cluster(mut self, cluster: Option<String>) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn updated_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.updated_or_created_at_min = since;
        self
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if !has_dedicated_endpoint(self.entity_type) {
            pairs.push(("type", self.entity_type.to_string()));
        }
        if let Some(id) = self.id {
            pairs.push(("id", id.to_string()));
        }
        if let Some(org_id) = self.org_id {
            pairs.push(("orgId", org_id.to_string()));
        }
        if let Some(name) = &self.name {
            pairs.push(("name", name.clone()));
        }
        if let Some(cluster) = self.cluster.as_ref().filter(|c| !c.is_empty()) {
            pairs.push(("cluster", cluster.clone()));
        }
        if self.include_deleted {
            pairs.push(("includeDeleted", "true".into()));
        }
        if let Some(min) = self.updated_or_created_at_min {
            pairs.push((
                "updatedOrCreatedAtMin",
                min.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        if let Some(cursor) = self.cursor {
            pairs.push(("cursor", cursor.to_string()));
        }
        if self.page_size > 0 {
            pairs.push(("pageSize", self.page_size.to_string()));
        }

        pairs
    }
}

/// Filters for listing organizations. Unset fields match every org.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrgListOptions {
    pub id: Option<i64>,
    pub slug: Option<String>,
    pub contract_type: Option<ContractType>,
    /// Only orgs in one of these cloud subscription states.
    pub cloud_subscriptions: Vec<i64>,
}

impl OrgListOptions {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(id) = self.id {
            pairs.push(("id", id.to_string()));
        }
        if let Some(slug) = &self.slug {
            pairs.push(("slug", slug.clone()));
        }
        if let Some(contract_type) = self.contract_type {
            pairs.push(("contractType", contract_type.as_str().to_string()));
        }
        for subscription in &self.cloud_subscriptions {
            pairs.push(("grafanaCloudIn", subscription.to_string()));
        }

        pairs
    }
}

/// Filters for listing the clusters hosting one kind of entity.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterListOptions {
    /// Picks the endpoint: stacks have their own clusters, every other type
    /// shares the hosted metrics clusters.
    pub entity_type: EntityType,
    pub slugs: Vec<String>,
}

impl ClusterListOptions {
    pub fn new(entity_type: EntityType) -> Self {
        ClusterListOptions {
            entity_type,
            slugs: Vec::new(),
        }
    }

    pub fn with_slugs(mut self, slugs: Vec<String>) -> Self {
        self.slugs = slugs;
        self
    }

    pub(crate) fn path(&self) -> &'static str {
        match self.entity_type {
            EntityType::Stack => "hg-clusters",
            _ => "hm-clusters",
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        self.slugs
            .iter()
            .map(|slug| ("slugIn", slug.clone()))
            .collect()
    }
}

fn endpoint_path(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Logs => "hosted-logs",
        EntityType::Alerts => "hosted-alerts",
        EntityType::Traces => "hosted-traces",
        EntityType::Stack => "instances",
        EntityType::Metrics => "hosted-metrics",
        EntityType::Profiles => "hosted-profiles",
        _ => "hosted-metrics",
    }
}

// Types without their own endpoint are listed from the metrics endpoint and
// filtered by a `type` query parameter.
fn has_dedicated_endpoint(entity_type: EntityType) -> bool {
    matches!(
        entity_type,
        EntityType::Logs
            | EntityType::Alerts
            | EntityType::Traces
            | EntityType::Stack
            | EntityType::Metrics
            | EntityType::Profiles
    )
}

/// Read access to the remote directory.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Checks an API key and returns its parsed representation.
    async fn check_api_key(&self, key: &str) -> Result<ApiKey, ClientError>;

    /// Lists a single page of entities.
    async fn list_entities(&self, options: &ListOptions) -> Result<Vec<Entity>, ClientError>;

    async fn list_orgs(&self, options: &OrgListOptions) -> Result<Vec<Org>, ClientError>;

    async fn list_clusters(
        &self,
        options: &ClusterListOptions,
    ) -> Result<Vec<Cluster>, ClientError>;

    /// Lists every entity matching `options`, one page at a time.
    ///
    /// The cursor for the next page is the last returned id plus one, so the
    /// directory must return entities in strictly increasing id order. A page
    /// shorter than `page_size` ends the listing. A `page_size` of zero issues a
    /// single unpaginated request.
    async fn list_entities_paged(&self, options: &ListOptions) -> Result<Vec<Entity>, ClientError> {
        if options.page_size == 0 {
            return self.list_entities(options).await;
        }

        let mut options = options.clone();
        let mut entities: Vec<Entity> = Vec::new();
        let mut cursor = 1;

        loop {
            tracing::debug!(
                entity_type = %options.entity_type,
                cursor,
                "Fetching page of entities"
            );

            options.cursor = Some(cursor);
            let page = self.list_entities(&options).await?;
            let page_len = page.len();
            entities.extend(page);

            if page_len < options.page_size {
                break;
            }

            match entities.last() {
                Some(last) => cursor = last.id + 1,
                None => break,
            }
        }

        Ok(entities)
    }

    /// Fetches the single entity whose id is set in `options`.
    async fn get_entity(&self, options: &ListOptions) -> Result<Entity, ClientError> {
        if options.id.unwrap_or(0) == 0 {
            return Err(ClientError::InvalidEntityId);
        }

        let mut entities = self.list_entities(options).await?;

        if entities.len() > 1 {
            tracing::warn!(
                id = ?options.id,
                count = entities.len(),
                "Multiple instances returned with same ID. Using first instance"
            );
        }

        if entities.is_empty() {
            tracing::debug!(id = ?options.id, "No instances found with specified ID");
            return Err(ClientError::EntityNotFound);
        }

        Ok(entities.swap_remove(0))
    }
}

/// Directory client talking to the HTTP API.
pub struct HttpDirectoryClient {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

impl HttpDirectoryClient {
    /// `service_name` is sent as the user agent of every request.
    pub fn new(config: &ClientConfig, service_name: &str) -> Result<Self, ClientError> {
        let endpoint =
            Url::parse(&config.endpoint).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(service_name)
            .build()?;

        tracing::info!(
            endpoint = %endpoint,
            service_name,
            "Directory client configured"
        );

        Ok(HttpDirectoryClient {
            client,
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            key: config.key.clone(),
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, ClientError> {
        Url::parse(&format!("{}/{}", self.endpoint, path))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    // Sends the request and records its latency under the logical path.
    async fn send(&self, path: &'static str, request: RequestBuilder) -> reqwest::Result<Response> {
        let start = Instant::now();
        let result = request.send().await;

        let code = match &result {
            Ok(response) => response.status().as_u16(),
            Err(_) => 500,
        };
        histogram!(DIRECTORY_REQUEST_DURATION, "code" => code.to_string(), "path" => path)
            .record(start.elapsed().as_secs_f64());

        result
    }

    // Fetches one `items` envelope from `path`.
    async fn get_items<T: DeserializeOwned>(
        &self,
        path: &'static str,
        query: &[(&'static str, String)],
        resource: &'static str,
    ) -> Result<Vec<T>, ClientError> {
        let url = self.url_for(path)?;

        let mut request = self.client.get(url.clone()).query(query);
        if !self.key.is_empty() {
            request = request.bearer_auth(&self.key);
        }

        let response = self.send(path, request).await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => e.to_string(),
            };
            return Err(ClientError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let list = response
            .json::<ItemList<T>>()
            .await
            .map_err(|e| ClientError::Decode {
                resource,
                reason: e.to_string(),
            })?;

        Ok(list.items)
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn check_api_key(&self, key: &str) -> Result<ApiKey, ClientError> {
        let url = self.url_for(&format!("{API_KEYS_PATH}/check"))?;
        let request = self.client.post(url).form(&[("token", key)]);

        let response = self
            .send(API_KEYS_PATH, request)
            .await
            .map_err(|e| ClientError::Access(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK {
            return response
                .json::<ApiKey>()
                .await
                .map_err(|e| ClientError::Access(e.to_string()));
        }

        // The body may say "Invalid token" even for valid tokens.
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %body,
            "Invalid response when checking key"
        );

        match status {
            StatusCode::CONFLICT => Err(ClientError::InvalidKey),
            _ => {
                tracing::warn!(status = status.as_u16(), "Error for api key check");
                Err(ClientError::Access(format!("unexpected status {status}")))
            }
        }
    }

    async fn list_entities(&self, options: &ListOptions) -> Result<Vec<Entity>, ClientError> {
        let path = endpoint_path(options.entity_type);
        self.get_items(path, &options.query_pairs(), "instance").await
    }

    async fn list_orgs(&self, options: &OrgListOptions) -> Result<Vec<Org>, ClientError> {
        self.get_items(ORGS_PATH, &options.query_pairs(), "org").await
    }

    async fn list_clusters(
        &self,
        options: &ClusterListOptions,
    ) -> Result<Vec<Cluster>, ClientError> {
        self.get_items(options.path(), &options.query_pairs(), "cluster")
            .await
    }
}
