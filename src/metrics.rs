use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::git::Service;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ServiceLabel {
    UploadPack,
    ReceivePack,
}

impl From<Service> for ServiceLabel {
    fn from(service: Service) -> Self {
        match service {
            Service::UploadPack => Self::UploadPack,
            Service::ReceivePack => Self::ReceivePack,
        }
    }
}

/// How a protocol request ended.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RpcOutcome {
    Ok,
    /// Subprocess exited non-zero or a pipe failed.
    Failed,
    TimedOut,
    /// Client went away before the subprocess finished.
    Aborted,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthzOutcome {
    Allowed,
    Denied,
    Unauthenticated,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RepoOperation {
    Create,
    Mirror,
    Generate,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OpOutcome {
    Ok,
    AlreadyExists,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcLabels {
    pub service: ServiceLabel,
    pub outcome: RpcOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: ServiceLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthzLabels {
    pub outcome: AuthzOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RepoOpLabels {
    pub operation: RepoOperation,
    pub outcome: OpOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- protocol --
    pub rpc_requests_total: Family<RpcLabels, Counter>,
    pub rpc_duration_seconds: Family<ServiceLabels, Histogram>,
    pub rpc_active: Family<ServiceLabels, Gauge>,

    // -- authz --
    pub authz_decisions_total: Family<AuthzLabels, Counter>,

    // -- repository lifecycle --
    pub repo_operations_total: Family<RepoOpLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let rpc_requests_total = Family::<RpcLabels, Counter>::default();
        registry.register(
            "githost_rpc_requests",
            "Completed smart-HTTP protocol requests by service and outcome",
            rpc_requests_total.clone(),
        );

        let rpc_duration_seconds =
            Family::<ServiceLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 16))
            });
        registry.register(
            "githost_rpc_duration_seconds",
            "Lifetime of protocol subprocesses in seconds",
            rpc_duration_seconds.clone(),
        );

        let rpc_active = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "githost_rpc_active",
            "Protocol subprocesses currently running",
            rpc_active.clone(),
        );

        let authz_decisions_total = Family::<AuthzLabels, Counter>::default();
        registry.register(
            "githost_authz_decisions",
            "Authorization decisions by outcome",
            authz_decisions_total.clone(),
        );

        let repo_operations_total = Family::<RepoOpLabels, Counter>::default();
        registry.register(
            "githost_repo_operations",
            "Repository lifecycle operations by kind and outcome",
            repo_operations_total.clone(),
        );

        Self {
            rpc_requests_total,
            rpc_duration_seconds,
            rpc_active,
            authz_decisions_total,
            repo_operations_total,
        }
    }

    pub fn record_authz(&self, outcome: AuthzOutcome) {
        self.authz_decisions_total
            .get_or_create(&AuthzLabels { outcome })
            .inc();
    }

    pub fn record_repo_op(&self, operation: RepoOperation, outcome: OpOutcome) {
        self.repo_operations_total
            .get_or_create(&RepoOpLabels { operation, outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition of the registry.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}
