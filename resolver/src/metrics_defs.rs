//! Metrics definitions for the tenant resolver.

use shared::metrics_defs::{MetricDef, MetricType};

pub const METRICS_REQUESTS: MetricDef = MetricDef {
    name: "gateway.metrics.requests",
    metric_type: MetricType::Counter,
    description: "The number of authenticated metrics requests. Tagged with org_id, tenant_id, cluster_url.",
};

pub const LOGS_REQUESTS: MetricDef = MetricDef {
    name: "gateway.logs.requests",
    metric_type: MetricType::Counter,
    description: "The number of authenticated logs requests. Tagged with org_id, tenant_id, cluster_url.",
};

pub const TRACES_REQUESTS: MetricDef = MetricDef {
    name: "gateway.traces.requests",
    metric_type: MetricType::Counter,
    description: "The number of authenticated traces requests. Tagged with org_id, tenant_id, cluster_url.",
};

pub const ALL_METRICS: &[MetricDef] = &[METRICS_REQUESTS, LOGS_REQUESTS, TRACES_REQUESTS];
