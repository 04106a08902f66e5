//! Controller runner
//!
//! Each `build_*` function returns the controller futures for one subcommand,
//! to be driven by the caller alongside the HTTP servers.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};

use kserve_common::crd::{LLMInferenceService, LocalModelNodeGroup};
use kserve_common::kube_utils::HasApiResource;
use kserve_common::network::HttpRoute;
use kserve_llmisvc::controller::{self as llmisvc_ctrl, LlmContext};
use kserve_localmodel::nodegroup::{self as nodegroup_ctrl, NodeGroupContext};

/// Watch timeout, kept below the client read timeout so idle watches are
/// closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// LLMInferenceService controller, re-triggered by changes to its children
pub fn build_llmisvc_controllers(
    client: Client,
    namespace: &str,
    metrics: Arc<ReconcileMetrics>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(LlmContext::from_client(client.clone(), namespace));
    let route_ar = HttpRoute::api_resource();

    let controller = Controller::new(Api::<LLMInferenceService>::all(client.clone()), watcher_config())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config())
        .owns(Api::<Service>::all(client.clone()), watcher_config())
        .owns(Api::<ServiceAccount>::all(client.clone()), watcher_config())
        .owns_with(
            Api::<DynamicObject>::all_with(client, &route_ar),
            route_ar.clone(),
            watcher_config(),
        )
        .shutdown_on_signal()
        .run(llmisvc_ctrl::reconcile, llmisvc_ctrl::error_policy, ctx)
        .for_each(log_reconcile_result("LLMInferenceService", metrics));

    tracing::info!("- LLMInferenceService controller");
    vec![Box::pin(controller)]
}

/// LocalModelNodeGroup controller, re-triggered by changes to its agent DaemonSet
pub fn build_localmodelnode_controllers(
    client: Client,
    namespace: &str,
    metrics: Arc<ReconcileMetrics>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(NodeGroupContext::from_client(client.clone(), namespace));

    let controller = Controller::new(Api::<LocalModelNodeGroup>::all(client.clone()), watcher_config())
        .owns(Api::<DaemonSet>::namespaced(client, namespace), watcher_config())
        .shutdown_on_signal()
        .run(nodegroup_ctrl::reconcile, nodegroup_ctrl::error_policy, ctx)
        .for_each(log_reconcile_result("LocalModelNodeGroup", metrics));

    tracing::info!("- LocalModelNodeGroup controller");
    vec![Box::pin(controller)]
}

/// Logs each reconcile outcome and counts it
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
    metrics: Arc<ReconcileMetrics>,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match &result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        metrics.record(controller_name, result.is_ok());
        std::future::ready(())
    }
}

// =============================================================================
// Metrics
// =============================================================================

const RECONCILE_TOTAL: &str = "kserve_controller_reconcile_total";

/// Reconcile counters, exported through OpenTelemetry and served in Prometheus text format
pub struct ReconcileMetrics {
    counts: Mutex<BTreeMap<(&'static str, &'static str), u64>>,
    reconciles: Counter<u64>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            counts: Mutex::default(),
            reconciles: global::meter("kserve")
                .u64_counter(RECONCILE_TOTAL)
                .with_description("Reconciliations per controller and result")
                .with_unit("{reconciles}")
                .build(),
        }
    }
}

impl ReconcileMetrics {
    /// Count one reconcile of `controller`
    pub fn record(&self, controller: &'static str, success: bool) {
        let result = if success { "success" } else { "error" };
        self.reconciles.add(
            1,
            &[KeyValue::new("controller", controller), KeyValue::new("result", result)],
        );
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry((controller, result)).or_default() += 1;
        }
    }

    /// Exposition text for every counter recorded so far
    pub fn render(&self) -> String {
        let mut out = format!(
            "# HELP {RECONCILE_TOTAL} Reconciliations per controller and result\n\
             # TYPE {RECONCILE_TOTAL} counter\n"
        );
        if let Ok(counts) = self.counts.lock() {
            for ((controller, result), count) in counts.iter() {
                let _ = writeln!(
                    out,
                    "{RECONCILE_TOTAL}{{controller=\"{controller}\",result=\"{result}\"}} {count}"
                );
            }
        }
        out
    }
}
