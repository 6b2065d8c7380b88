//! Metrics definitions for the reconciler.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RECONCILE_PASSES: MetricDef = MetricDef {
    name: "reconcile.passes",
    metric_type: MetricType::Counter,
    description: "Number of events handled, tagged by event kind",
};

pub const RECONCILE_DEFERRED: MetricDef = MetricDef {
    name: "reconcile.deferred",
    metric_type: MetricType::Counter,
    description: "Number of events deferred because required facts were missing",
};

pub const RECONCILE_FAILED: MetricDef = MetricDef {
    name: "reconcile.failed",
    metric_type: MetricType::Counter,
    description: "Number of events that failed, tagged by whether they can be retried",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to handle one event in seconds",
};

pub const PUBLISH_RELOADS: MetricDef = MetricDef {
    name: "publish.reloads",
    metric_type: MetricType::Counter,
    description: "Number of times the local workers were re-rendered and reloaded",
};

pub const PEER_SYNC_SKIPPED: MetricDef = MetricDef {
    name: "peer_sync.skipped",
    metric_type: MetricType::Counter,
    description: "Number of follower syncs skipped because the content was unchanged",
};

pub const FLEET_CLIENTS: MetricDef = MetricDef {
    name: "fleet.clients",
    metric_type: MetricType::Gauge,
    description: "Number of client relations in the last published state",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RECONCILE_PASSES,
    RECONCILE_DEFERRED,
    RECONCILE_FAILED,
    RECONCILE_DURATION,
    PUBLISH_RELOADS,
    PEER_SYNC_SKIPPED,
    FLEET_CLIENTS,
];
