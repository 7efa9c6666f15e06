use crate::metrics_defs::{LOGS_REQUESTS, METRICS_REQUESTS, TRACES_REQUESTS};
use directory::Entity;
use serde::Deserialize;
use shared::metrics_defs::MetricDef;
use std::fmt;

/// Kind of telemetry flowing through a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Metrics,
    Logs,
    Traces,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Metrics, Signal::Logs, Signal::Traces];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
            Signal::Traces => "traces",
        }
    }

    /// The tenant id and the instance URL that receive this signal for `stack`.
    pub fn tenant<'a>(&self, stack: &'a Entity) -> (i64, &'a str) {
        match self {
            Signal::Metrics => (stack.prom_instance_id, &stack.prom_instance_url),
            Signal::Logs => (stack.logs_instance_id, &stack.logs_instance_url),
            Signal::Traces => (stack.traces_instance_id, &stack.traces_instance_url),
        }
    }

    pub(crate) const fn requests_metric(&self) -> MetricDef {
        match self {
            Signal::Metrics => METRICS_REQUESTS,
            Signal::Logs => LOGS_REQUESTS,
            Signal::Traces => TRACES_REQUESTS,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
