//! LocalModelNodeGroup controller
//!
//! Keeps the storage and node agent of each node group in place:
//!
//! - a PersistentVolume built from `persistentVolumeSpec` (created once, never overwritten)
//! - a PersistentVolumeClaim in the KServe namespace bound to that volume (created once)
//! - the agent DaemonSet, created or updated to match the operator ConfigMap
//!
//! Children carry controller references, so deletion is left to the garbage
//! collector. The finalizer only marks groups this controller has seen.

mod builders;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use kserve_common::config::{ConfigMapReader, KubeConfigMapReader};
use kserve_common::crd::LocalModelNodeGroup;
use kserve_common::kube_utils::{finalizers_with, finalizers_without, has_finalizer, ignore_not_found};
use kserve_common::{Error, Result, FIELD_MANAGER};

pub use builders::{
    agent_name, build_agent_daemon_set, build_persistent_volume, build_persistent_volume_claim,
    semantic_equals, AGENT_CONTAINER, AGENT_SERVICE_ACCOUNT, AGENT_SUFFIX,
};

/// Finalizer placed on every reconciled node group
pub const NODE_GROUP_FINALIZER: &str = "localmodelnodegroup.kserve.io/finalizer";

// =============================================================================
// Finalizer state
// =============================================================================

/// Lifecycle position of a node group with respect to the finalizer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// Not being deleted
    Active,
    /// Deletion requested, finalizer still present
    Terminating,
    /// Deletion requested, finalizer already gone
    Removed,
}

impl FinalizerState {
    /// Classify `group`
    pub fn of(group: &LocalModelNodeGroup) -> Self {
        match (
            group.metadata.deletion_timestamp.is_some(),
            has_finalizer(&group.metadata, NODE_GROUP_FINALIZER),
        ) {
            (false, _) => Self::Active,
            (true, true) => Self::Terminating,
            (true, false) => Self::Removed,
        }
    }
}

// =============================================================================
// Kube client seam
// =============================================================================

/// Kubernetes operations performed by the node group reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeGroupKubeClient: Send + Sync {
    /// Get a cluster-scoped PersistentVolume, `None` if absent
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Create a PersistentVolume
    async fn create_persistent_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    /// Get a PersistentVolumeClaim, `None` if absent
    async fn get_persistent_volume_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a PersistentVolumeClaim
    async fn create_persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Get a DaemonSet, `None` if absent
    async fn get_daemon_set(&self, name: &str, namespace: &str) -> Result<Option<DaemonSet>>;

    /// Create a DaemonSet
    async fn create_daemon_set(&self, ds: &DaemonSet) -> Result<()>;

    /// Replace a DaemonSet, returning the object as the API server stored it.
    ///
    /// With `dry_run` nothing is persisted but server defaults are filled in.
    async fn update_daemon_set(&self, ds: &DaemonSet, dry_run: bool) -> Result<DaemonSet>;

    /// Merge-patch the finalizer list of a node group
    async fn patch_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct NodeGroupKubeClientImpl {
    client: Client,
}

impl NodeGroupKubeClientImpl {
    /// Create a new NodeGroupKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn object_namespace(ns: Option<&String>) -> Result<&str> {
    ns.map(String::as_str)
        .ok_or_else(|| Error::internal("namespaced child has no namespace"))
}

#[async_trait]
impl NodeGroupKubeClient for NodeGroupKubeClientImpl {
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(ignore_not_found(api.get(name).await)?)
    }

    async fn create_persistent_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), pv).await?)
    }

    async fn get_persistent_volume_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(ignore_not_found(api.get(name).await)?)
    }

    async fn create_persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let namespace = object_namespace(pvc.metadata.namespace.as_ref())?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn get_daemon_set(&self, name: &str, namespace: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(ignore_not_found(api.get(name).await)?)
    }

    async fn create_daemon_set(&self, ds: &DaemonSet) -> Result<()> {
        let namespace = object_namespace(ds.metadata.namespace.as_ref())?;
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), ds).await?;
        Ok(())
    }

    async fn update_daemon_set(&self, ds: &DaemonSet, dry_run: bool) -> Result<DaemonSet> {
        let namespace = object_namespace(ds.metadata.namespace.as_ref())?;
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        Ok(api.replace(&ds.name_any(), &params, ds).await?)
    }

    async fn patch_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<()> {
        let api: Api<LocalModelNodeGroup> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared state for the LocalModelNodeGroup controller
pub struct NodeGroupContext {
    /// Kubernetes operations on children and finalizers
    pub kube: Arc<dyn NodeGroupKubeClient>,
    /// Operator ConfigMap
    pub config_map: Arc<dyn ConfigMapReader>,
    /// Namespace the claim and agent are created in
    pub namespace: String,
}

impl NodeGroupContext {
    /// Create a new context from its parts
    pub fn new(
        kube: Arc<dyn NodeGroupKubeClient>,
        config_map: Arc<dyn ConfigMapReader>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            config_map,
            namespace: namespace.into(),
        }
    }

    /// Create a context backed by a real client
    pub fn from_client(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self::new(
            Arc::new(NodeGroupKubeClientImpl::new(client.clone())),
            Arc::new(KubeConfigMapReader::new(client, namespace.clone())),
            namespace,
        )
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn NodeGroupKubeClient>,
        config_map: Arc<dyn ConfigMapReader>,
    ) -> Self {
        Self::new(kube, config_map, "kserve")
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile a LocalModelNodeGroup
#[instrument(skip(group, ctx), fields(name = %group.name_any()))]
pub async fn reconcile(group: Arc<LocalModelNodeGroup>, ctx: Arc<NodeGroupContext>) -> Result<Action> {
    let name = group.name_any();

    match FinalizerState::of(&group) {
        FinalizerState::Removed => {
            debug!("node group is gone, nothing to do");
            return Ok(Action::await_change());
        }
        FinalizerState::Terminating => {
            info!("removing finalizer, children are garbage collected");
            ctx.kube
                .patch_finalizers(&name, finalizers_without(&group.metadata, NODE_GROUP_FINALIZER))
                .await?;
            return Ok(Action::await_change());
        }
        FinalizerState::Active if !has_finalizer(&group.metadata, NODE_GROUP_FINALIZER) => {
            info!("adding finalizer");
            ctx.kube
                .patch_finalizers(&name, finalizers_with(&group.metadata, NODE_GROUP_FINALIZER))
                .await?;
            return Ok(Action::await_change());
        }
        FinalizerState::Active => {}
    }

    if group.uid().is_none() {
        return Err(Error::internal_with_context(name, "LocalModelNodeGroup has no UID"));
    }

    let config = ctx.config_map.inference_service_config().await?.local_model;

    let pv = ensure_persistent_volume(&group, ctx.kube.as_ref()).await?;
    let pv_name = pv.name_any();
    let pvc = ensure_persistent_volume_claim(&group, &ctx.namespace, &pv_name, ctx.kube.as_ref()).await?;

    let desired = build_agent_daemon_set(&group, &config, &ctx.namespace, &pvc.name_any());
    reconcile_daemon_set(desired, &ctx.namespace, ctx.kube.as_ref()).await?;

    Ok(Action::await_change())
}

/// Error policy for the LocalModelNodeGroup controller
pub fn error_policy(
    group: Arc<LocalModelNodeGroup>,
    error: &Error,
    _ctx: Arc<NodeGroupContext>,
) -> Action {
    error!(
        ?error,
        name = %group.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

/// Get the group's PersistentVolume, creating it if absent
async fn ensure_persistent_volume(
    group: &LocalModelNodeGroup,
    kube: &dyn NodeGroupKubeClient,
) -> Result<PersistentVolume> {
    let name = agent_name(&group.name_any());
    if let Some(existing) = kube.get_persistent_volume(&name).await? {
        return Ok(existing);
    }

    info!(pv = %name, "creating PersistentVolume");
    kube.create_persistent_volume(&build_persistent_volume(group))
        .await
        .inspect_err(|e| error!(pv = %name, error = %e, "failed to create PersistentVolume"))
}

/// Get the group's PersistentVolumeClaim, creating it bound to `pv_name` if absent
async fn ensure_persistent_volume_claim(
    group: &LocalModelNodeGroup,
    namespace: &str,
    pv_name: &str,
    kube: &dyn NodeGroupKubeClient,
) -> Result<PersistentVolumeClaim> {
    let name = agent_name(&group.name_any());
    if let Some(existing) = kube.get_persistent_volume_claim(&name, namespace).await? {
        return Ok(existing);
    }

    info!(pvc = %name, namespace = %namespace, "creating PersistentVolumeClaim");
    kube.create_persistent_volume_claim(&build_persistent_volume_claim(group, namespace, pv_name))
        .await
        .inspect_err(|e| error!(pvc = %name, error = %e, "failed to create PersistentVolumeClaim"))
}

/// Create the agent DaemonSet or bring it in line with `desired`.
///
/// An existing DaemonSet is first replaced in dry-run mode so server-side
/// defaults are present on both sides of the comparison.
async fn reconcile_daemon_set(
    mut desired: DaemonSet,
    namespace: &str,
    kube: &dyn NodeGroupKubeClient,
) -> Result<()> {
    let name = desired.name_any();

    let Some(existing) = kube.get_daemon_set(&name, namespace).await? else {
        kube.create_daemon_set(&desired).await?;
        info!(daemonset = %name, namespace = %namespace, "created agent DaemonSet");
        return Ok(());
    };

    desired.metadata.resource_version = existing.metadata.resource_version.clone();
    let defaulted = kube.update_daemon_set(&desired, true).await?;

    if semantic_equals(&defaulted, &existing) {
        debug!(daemonset = %name, "agent DaemonSet up to date");
        return Ok(());
    }

    kube.update_daemon_set(&desired, false).await?;
    info!(daemonset = %name, namespace = %namespace, "updated agent DaemonSet");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::builders::test_fixtures::sample_node_group;
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kserve_common::config::{InferenceServiceConfig, LocalModelConfig};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    struct StaticConfigMap(InferenceServiceConfig);

    #[async_trait]
    impl ConfigMapReader for StaticConfigMap {
        async fn inference_service_config(&self) -> Result<InferenceServiceConfig> {
            Ok(self.0.clone())
        }
    }

    fn config_map(agent_image: &str) -> Arc<dyn ConfigMapReader> {
        Arc::new(StaticConfigMap(InferenceServiceConfig {
            local_model: LocalModelConfig {
                local_model_agent_image: agent_image.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    fn finalized_group() -> LocalModelNodeGroup {
        let mut group = sample_node_group();
        group.metadata.finalizers = Some(vec![NODE_GROUP_FINALIZER.to_string()]);
        group
    }

    fn deleting(mut group: LocalModelNodeGroup) -> LocalModelNodeGroup {
        group.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        group
    }

    fn context(kube: MockNodeGroupKubeClient, agent_image: &str) -> Arc<NodeGroupContext> {
        Arc::new(NodeGroupContext::for_testing(Arc::new(kube), config_map(agent_image)))
    }

    // =========================================================================
    // Mock Setup
    // =========================================================================

    /// In-memory cluster state plus every mutating call
    #[derive(Default)]
    struct Captured {
        pv: Mutex<Option<PersistentVolume>>,
        pvc: Mutex<Option<PersistentVolumeClaim>>,
        daemon_set: Mutex<Option<DaemonSet>>,
        calls: Mutex<Vec<String>>,
    }

    impl Captured {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn count(&self, call: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
        }
    }

    /// Mock backed by `captured`, behaving like an API server without defaulting
    fn stateful_kube(captured: Arc<Captured>) -> MockNodeGroupKubeClient {
        let mut mock = MockNodeGroupKubeClient::new();

        let c = captured.clone();
        mock.expect_get_persistent_volume()
            .returning(move |_| Ok(c.pv.lock().unwrap().clone()));
        let c = captured.clone();
        mock.expect_create_persistent_volume().returning(move |pv| {
            c.record("create-pv");
            *c.pv.lock().unwrap() = Some(pv.clone());
            Ok(pv.clone())
        });
        let c = captured.clone();
        mock.expect_get_persistent_volume_claim()
            .returning(move |_, _| Ok(c.pvc.lock().unwrap().clone()));
        let c = captured.clone();
        mock.expect_create_persistent_volume_claim().returning(move |pvc| {
            c.record("create-pvc");
            *c.pvc.lock().unwrap() = Some(pvc.clone());
            Ok(pvc.clone())
        });
        let c = captured.clone();
        mock.expect_get_daemon_set()
            .returning(move |_, _| Ok(c.daemon_set.lock().unwrap().clone()));
        let c = captured.clone();
        mock.expect_create_daemon_set().returning(move |ds| {
            c.record("create-ds");
            *c.daemon_set.lock().unwrap() = Some(ds.clone());
            Ok(())
        });
        let c = captured;
        mock.expect_update_daemon_set().returning(move |ds, dry_run| {
            if dry_run {
                c.record("dry-run-update-ds");
            } else {
                c.record("update-ds");
                *c.daemon_set.lock().unwrap() = Some(ds.clone());
            }
            Ok(ds.clone())
        });
        mock
    }

    // =========================================================================
    // Finalizer state machine
    // =========================================================================

    mod finalizer {
        use super::*;

        #[test]
        fn states_are_classified() {
            assert_eq!(FinalizerState::of(&sample_node_group()), FinalizerState::Active);
            assert_eq!(FinalizerState::of(&finalized_group()), FinalizerState::Active);
            assert_eq!(
                FinalizerState::of(&deleting(finalized_group())),
                FinalizerState::Terminating
            );
            assert_eq!(
                FinalizerState::of(&deleting(sample_node_group())),
                FinalizerState::Removed
            );
        }

        #[tokio::test]
        async fn new_group_only_gets_finalizer() {
            let mut kube = MockNodeGroupKubeClient::new();
            kube.expect_patch_finalizers()
                .withf(|name, finalizers| name == "gpu" && finalizers == &[NODE_GROUP_FINALIZER.to_string()])
                .times(1)
                .returning(|_, _| Ok(()));

            let action = reconcile(Arc::new(sample_node_group()), context(kube, "agent:v1"))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn terminating_group_releases_finalizer_without_deleting_children() {
            let mut group = deleting(finalized_group());
            group
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push("other.io/keep".to_string());

            let mut kube = MockNodeGroupKubeClient::new();
            kube.expect_patch_finalizers()
                .withf(|_, finalizers| finalizers == &["other.io/keep".to_string()])
                .times(1)
                .returning(|_, _| Ok(()));

            reconcile(Arc::new(group), context(kube, "agent:v1"))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn removed_group_is_left_alone() {
            let kube = MockNodeGroupKubeClient::new();
            let action = reconcile(Arc::new(deleting(sample_node_group())), context(kube, "agent:v1"))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    // =========================================================================
    // Story: steady state is idempotent
    // =========================================================================

    #[tokio::test]
    async fn story_second_reconcile_changes_nothing() {
        let captured = Arc::new(Captured::default());
        let ctx = context(stateful_kube(captured.clone()), "agent:v1");
        let group = Arc::new(finalized_group());

        reconcile(group.clone(), ctx.clone()).await.unwrap();
        assert_eq!(captured.count("create-pv"), 1);
        assert_eq!(captured.count("create-pvc"), 1);
        assert_eq!(captured.count("create-ds"), 1);

        let pvc = captured.pvc.lock().unwrap().clone().unwrap();
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("kserve"));
        assert_eq!(pvc.spec.unwrap().volume_name.as_deref(), Some("gpu-agent"));

        reconcile(group, ctx).await.unwrap();
        assert_eq!(captured.count("create-pv"), 1);
        assert_eq!(captured.count("create-pvc"), 1);
        assert_eq!(captured.count("create-ds"), 1);
        assert_eq!(captured.count("dry-run-update-ds"), 1);
        assert_eq!(captured.count("update-ds"), 0);
    }

    #[tokio::test]
    async fn story_new_agent_image_updates_daemon_set() {
        let captured = Arc::new(Captured::default());
        let group = Arc::new(finalized_group());

        reconcile(group.clone(), context(stateful_kube(captured.clone()), "agent:v1"))
            .await
            .unwrap();
        reconcile(group, context(stateful_kube(captured.clone()), "agent:v2"))
            .await
            .unwrap();

        assert_eq!(captured.count("update-ds"), 1);
        let ds = captured.daemon_set.lock().unwrap().clone().unwrap();
        let image = ds.spec.unwrap().template.spec.unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some("agent:v2"));
    }

    #[tokio::test]
    async fn existing_volume_is_never_overwritten() {
        let captured = Arc::new(Captured::default());
        let mut existing = build_persistent_volume(&finalized_group());
        existing.metadata.name = Some("gpu-agent".to_string());
        existing.spec.get_or_insert_with(Default::default).storage_class_name = Some("manual".to_string());
        *captured.pv.lock().unwrap() = Some(existing);

        reconcile(Arc::new(finalized_group()), context(stateful_kube(captured.clone()), "agent:v1"))
            .await
            .unwrap();

        assert_eq!(captured.count("create-pv"), 0);
        let pv = captured.pv.lock().unwrap().clone().unwrap();
        assert_eq!(pv.spec.unwrap().storage_class_name.as_deref(), Some("manual"));
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[tokio::test]
    async fn get_error_aborts_and_requeues() {
        let mut kube = MockNodeGroupKubeClient::new();
        kube.expect_get_persistent_volume()
            .returning(|_| Err(Error::internal("apiserver unavailable")));

        let group = Arc::new(finalized_group());
        let ctx = context(kube, "agent:v1");
        let err = reconcile(group.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.to_string().contains("apiserver unavailable"));
        assert_eq!(
            error_policy(group, &err, ctx),
            Action::requeue(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn group_without_uid_is_rejected() {
        let mut group = finalized_group();
        group.metadata.uid = None;
        let err = reconcile(Arc::new(group), context(MockNodeGroupKubeClient::new(), "agent:v1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no UID"));
    }
}
