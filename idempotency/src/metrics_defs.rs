use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with method, status.",
};

pub const ACQUIRE: MetricDef = MetricDef {
    name: "idempotency.acquire",
    metric_type: MetricType::Counter,
    description: "Acquire outcomes. Tagged with outcome: first, in_flight, done, mismatch, error.",
};

pub const COMPLETE: MetricDef = MetricDef {
    name: "idempotency.complete",
    metric_type: MetricType::Counter,
    description: "Completion attempts. Tagged with result: stored, skipped, error.",
};

pub const CLEAR: MetricDef = MetricDef {
    name: "idempotency.clear",
    metric_type: MetricType::Counter,
    description: "Processing slots released. Tagged with reason: client_error, server_error, other_status, poisoned.",
};

pub const BYPASS: MetricDef = MetricDef {
    name: "idempotency.bypass",
    metric_type: MetricType::Counter,
    description: "Requests forwarded without protection because the store was unavailable",
};

pub const STORE_DURATION: MetricDef = MetricDef {
    name: "idempotency.store.duration",
    metric_type: MetricType::Histogram,
    description: "Store call duration in seconds. Tagged with op.",
};

pub const STORE_HEALTHY: MetricDef = MetricDef {
    name: "idempotency.store.healthy",
    metric_type: MetricType::Gauge,
    description: "1 when the last store health check succeeded, 0 otherwise",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    ACQUIRE,
    COMPLETE,
    CLEAR,
    BYPASS,
    STORE_DURATION,
    STORE_HEALTHY,
];
