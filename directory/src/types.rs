use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of entity kept by the remote directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Prometheus,
    Graphite,
    #[serde(rename = "graphite-shared")]
    GraphiteShared,
    /// Any hosted metrics instance, regardless of its backend.
    Metrics,
    Logs,
    Alerts,
    Traces,
    /// The root of a tenant's stack. Every other entity type hangs off a stack.
    #[serde(rename = "grafana")]
    Stack,
    #[serde(rename = "oncall")]
    OnCall,
    Profiles,
}

impl EntityType {
    pub const ALL: &[EntityType] = &[
        EntityType::Prometheus,
        EntityType::Graphite,
        EntityType::GraphiteShared,
        EntityType::Metrics,
        EntityType::Logs,
        EntityType::Alerts,
        EntityType::Traces,
        EntityType::Stack,
        EntityType::OnCall,
        EntityType::Profiles,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Prometheus => "prometheus",
            EntityType::Graphite => "graphite",
            EntityType::GraphiteShared => "graphite-shared",
            EntityType::Metrics => "metrics",
            EntityType::Logs => "logs",
            EntityType::Alerts => "alerts",
            EntityType::Traces => "traces",
            EntityType::Stack => "grafana",
            EntityType::OnCall => "oncall",
            EntityType::Profiles => "profiles",
        }
    }

    /// True for the concrete hosted metrics backends.
    pub const fn is_metrics(&self) -> bool {
        matches!(
            self,
            EntityType::Prometheus | EntityType::Graphite | EntityType::GraphiteShared
        )
    }

    /// Parses a comma separated list such as `"grafana,logs"`.
    pub fn parse_list(value: &str) -> Result<Vec<EntityType>, InvalidEntityType> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(EntityType::from_str)
            .collect()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("instance type '{0}' is not valid")]
pub struct InvalidEntityType(pub String);

impl FromStr for EntityType {
    type Err = InvalidEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| InvalidEntityType(s.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Active,
    Deleted,
    #[serde(other)]
    Other,
}

/// A provisioned resource as returned by the directory, with its routing metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Entity {
    pub id: i64,
    pub org_id: i64,
    pub org_slug: String,
    pub org_name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub cluster_id: i64,
    pub cluster_slug: String,
    pub cluster_name: String,
    pub name: String,
    pub url: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub plan: String,
    #[serde(rename = "amInstanceId")]
    pub alerts_instance_id: i64,
    #[serde(rename = "hlInstanceId")]
    pub logs_instance_id: i64,
    #[serde(rename = "hlInstanceUrl")]
    pub logs_instance_url: String,
    #[serde(rename = "hmInstancePromId")]
    pub prom_instance_id: i64,
    #[serde(rename = "hmInstancePromUrl")]
    pub prom_instance_url: String,
    #[serde(rename = "hmInstanceGraphiteId")]
    pub graphite_instance_id: i64,
    #[serde(rename = "htInstanceId")]
    pub traces_instance_id: i64,
    #[serde(rename = "htInstanceUrl")]
    pub traces_instance_url: String,
    #[serde(rename = "grafanaInstanceId")]
    pub stack_instance_id: i64,
    #[serde(rename = "grafanaInstanceUrl")]
    pub stack_instance_url: String,
    #[serde(rename = "hpInstanceId")]
    pub profiles_instance_id: i64,
    #[serde(rename = "hpInstanceUrl")]
    pub profiles_instance_url: String,
    pub status: EntityStatus,
}

impl Entity {
    /// The stack this entity belongs to. A stack entity is its own stack.
    pub fn stack_id(&self) -> i64 {
        if self.entity_type == EntityType::Stack.as_str() {
            self.id
        } else {
            self.stack_instance_id
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }

    /// Latest of the creation and update timestamps.
    pub fn last_modified(&self) -> DateTime<Utc> {
        match self.updated_at {
            Some(updated_at) if updated_at > self.created_at => updated_at,
            _ => self.created_at,
        }
    }
}

/// The `items` envelope around every list response.
#[derive(Debug, Deserialize)]
pub struct ItemList<T> {
    pub items: Vec<T>,
}

pub type EntityList = ItemList<Entity>;

/// Permission level attached to an API key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Viewer,
    Editor,
    MetricsPublisher,
    Admin,
    /// A role this client does not know about. Grants nothing.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    /// May push data.
    pub fn is_publisher(&self) -> bool {
        matches!(self, Role::MetricsPublisher | Role::Editor | Role::Admin)
    }

    pub fn is_viewer(&self) -> bool {
        matches!(self, Role::Viewer | Role::Editor | Role::Admin)
    }

    pub fn is_editor(&self) -> bool {
        matches!(self, Role::Editor | Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        *self == Role::Admin
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    #[default]
    None,
    SelfServe,
    Contracted,
}

impl ContractType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ContractType::None => "none",
            ContractType::SelfServe => "self_serve",
            ContractType::Contracted => "contracted",
        }
    }
}

/// An organization owning stacks, with its usage figures.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Org {
    pub id: i64,
    pub slug: String,
    pub name: String,
    /// Cloud subscription state, as the directory's numeric code.
    #[serde(rename = "grafanaCloud")]
    pub cloud_subscription: i64,
    pub contract_type: ContractType,
    #[serde(rename = "hmUsage")]
    pub metrics_usage: i64,
    #[serde(rename = "hmIncludedSeries")]
    pub metrics_included_series: i64,
    #[serde(rename = "hmOverageAmount")]
    pub metrics_overage_amount: f64,
    #[serde(rename = "hlUsage")]
    pub logs_usage: f64,
    #[serde(rename = "hlOverageAmount")]
    pub logs_overage_amount: f64,
    #[serde(rename = "hlIncludedUsage")]
    pub logs_included_usage: f64,
}

/// A cluster hosting entities. Only the id and slug are decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cluster {
    pub id: i64,
    pub slug: String,
}

/// A directory API key, as returned by the key check endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiKey {
    pub id: i64,
    pub org_id: i64,
    pub org_slug: String,
    pub org_name: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_admin_org(&self) -> bool {
        self.org_id == 1
    }
}
