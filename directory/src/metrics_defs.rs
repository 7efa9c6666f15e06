//! Metrics definitions for the directory client and caches.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DIRECTORY_REQUEST_DURATION: MetricDef = MetricDef {
    name: "directory.api.request.duration",
    metric_type: MetricType::Histogram,
    description: "Directory API request latency in seconds. Tagged with code, path.",
};

pub const CACHE_REFRESH_DURATION: MetricDef = MetricDef {
    name: "cache.refresh.duration",
    metric_type: MetricType::Histogram,
    description: "Time to refresh one entity type in seconds. Tagged with kind, entity_type.",
};

pub const CACHE_REFRESH_ERRORS: MetricDef = MetricDef {
    name: "cache.refresh.errors",
    metric_type: MetricType::Counter,
    description: "Number of failed cache refreshes. Tagged with kind, entity_type.",
};

pub const CACHE_ENTITIES: MetricDef = MetricDef {
    name: "cache.entities",
    metric_type: MetricType::Gauge,
    description: "Number of cached entities after a refresh. Tagged with entity_type.",
};

pub const AUTH_CACHE_HIT: MetricDef = MetricDef {
    name: "auth_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of API key checks answered from the auth cache",
};

pub const AUTH_CACHE_MISS: MetricDef = MetricDef {
    name: "auth_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of API key checks forwarded to the directory",
};

pub const ALL_METRICS: &[MetricDef] = &[
    DIRECTORY_REQUEST_DURATION,
    CACHE_REFRESH_DURATION,
    CACHE_REFRESH_ERRORS,
    CACHE_ENTITIES,
    AUTH_CACHE_HIT,
    AUTH_CACHE_MISS,
];
