use directory::{ClientConfig, RefreshConfig};
use serde::Deserialize;
use url::Url;

const DEFAULT_SERVICE_NAME: &str = "otlp-gateway";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("directory API endpoint is missing")]
    MissingEndpoint,
    #[error("directory API endpoint is invalid: {0}")]
    InvalidEndpoint(String),
    #[error("directory API key is missing")]
    MissingKey,
    #[error("cluster filters are missing")]
    MissingClusterFilters,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ResolverConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub cache: RefreshConfig,
    /// One stack cache is kept per cluster, tried in this order.
    #[serde(default)]
    pub cluster_filters: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            service_name: default_service_name(),
            client: ClientConfig::default(),
            cache: RefreshConfig::default(),
            cluster_filters: Vec::new(),
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.client.endpoint.is_empty() {
            return Err(ValidationError::MissingEndpoint);
        }
        if !self.client.is_dry_run() {
            Url::parse(&self.client.endpoint)
                .map_err(|e| ValidationError::InvalidEndpoint(e.to_string()))?;
            if self.client.key.is_empty() {
                return Err(ValidationError::MissingKey);
            }
        }
        if self.cluster_filters.iter().all(|c| c.trim().is_empty()) {
            return Err(ValidationError::MissingClusterFilters);
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.into()
}
