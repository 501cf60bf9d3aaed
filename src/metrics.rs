use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BundleKind {
    Full,
    Incremental,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BundleSyncLabels {
    pub kind: BundleKind,
    pub result: Outcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every metric the server exposes.
pub struct Metrics {
    pub pushes_total: Family<ResultLabels, Counter>,
    pub auth_rejections_total: Family<ReasonLabels, Counter>,
    pub restores_total: Family<ResultLabels, Counter>,
    pub bundle_syncs_total: Family<BundleSyncLabels, Counter>,
    pub ref_syncs_total: Family<ResultLabels, Counter>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let pushes_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "sovgit_pushes",
            "receive-pack invocations by result",
            pushes_total.clone(),
        );

        let auth_rejections_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "sovgit_auth_rejections",
            "Rejected push credentials by reason",
            auth_rejections_total.clone(),
        );

        let restores_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "sovgit_restores",
            "Repository restores from bundles by result",
            restores_total.clone(),
        );

        let bundle_syncs_total = Family::<BundleSyncLabels, Counter>::default();
        registry.register(
            "sovgit_bundle_syncs",
            "Post-push bundle uploads by kind and result",
            bundle_syncs_total.clone(),
        );

        let ref_syncs_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "sovgit_ref_syncs",
            "Post-push ref mirror updates by result",
            ref_syncs_total.clone(),
        );

        Self {
            pushes_total,
            auth_rejections_total,
            restores_total,
            bundle_syncs_total,
            ref_syncs_total,
        }
    }

    pub fn record_push(&self, result: Outcome) {
        self.pushes_total.get_or_create(&ResultLabels { result }).inc();
    }

    pub fn record_auth_rejection(&self, reason: &str) {
        self.auth_rejections_total
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn record_restore(&self, result: Outcome) {
        self.restores_total.get_or_create(&ResultLabels { result }).inc();
    }

    pub fn record_bundle_sync(&self, kind: BundleKind, result: Outcome) {
        self.bundle_syncs_total
            .get_or_create(&BundleSyncLabels { kind, result })
            .inc();
    }

    pub fn record_ref_sync(&self, result: Outcome) {
        self.ref_syncs_total.get_or_create(&ResultLabels { result }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Registry plus typed metric handles, shared through `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_push(Outcome::Success);
        registry.metrics.record_auth_rejection("replayed");
        registry
            .metrics
            .record_bundle_sync(BundleKind::Full, Outcome::Failure);

        let text = registry.encode().unwrap();
        assert!(text.contains("sovgit_pushes_total{result=\"Success\"} 1"));
        assert!(text.contains("sovgit_auth_rejections_total{reason=\"replayed\"} 1"));
        assert!(text.contains("sovgit_bundle_syncs_total{kind=\"Full\",result=\"Failure\"} 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
