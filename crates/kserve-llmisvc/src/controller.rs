//! LLMInferenceService controller
//!
//! Each reconcile resolves the effective spec from presets and `baseRefs`,
//! compiles it into child objects, applies the ones that must exist and
//! deletes the owned ones that must not. Status is then derived from the
//! children: workload readiness, route acceptance and the URLs discovered
//! through the parent Gateways.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kserve_common::config::{ConfigMapReader, KubeConfigMapReader, StorageInitializerConfig};
use kserve_common::crd::{
    set_condition, Addressable, Condition, ConditionStatus, LLMInferenceService,
    LLMInferenceServiceConfig, LLMInferenceServiceSpec, LLMInferenceServiceStatus,
};
use kserve_common::kube_utils::{child_name, ignore_not_found, HasApiResource};
use kserve_common::network::{Gateway, HttpRoute, InferenceModel, InferencePool, LeaderWorkerSet};
use kserve_common::{Error, Result, FIELD_MANAGER};

use crate::config_merge::{combine_base_refs_config, ConfigLookup, GlobalConfig};
use crate::discovery::{discover_urls, filter_external_urls, DiscoveredUrl, GatewayReader};
use crate::router::{build_http_route, referenced_routes, ROUTE_SUFFIX};
use crate::scheduler::{
    build_scheduler, EPP_SERVICE_ACCOUNT_SUFFIX, EPP_SERVICE_SUFFIX, INFERENCE_MODEL_SUFFIX,
    INFERENCE_POOL_SUFFIX, SCHEDULER_SUFFIX,
};
use crate::workload::{
    deployment_readiness, leader_worker_set_readiness, suffix, Readiness, WorkloadCompiler,
};

/// Condition set once presets and `baseRefs` merged cleanly
pub const PRESETS_COMBINED: &str = "PresetsCombined";
/// Condition aggregating every serving workload
pub const WORKLOAD_READY: &str = "WorkloadReady";
/// Condition aggregating the scheduler and HTTP routes
pub const ROUTER_READY: &str = "RouterReady";
/// Top-level readiness
pub const READY: &str = "Ready";

const READY_REQUEUE: Duration = Duration::from_secs(60);
const PROGRESSING_REQUEUE: Duration = Duration::from_secs(10);

// =============================================================================
// Child plan
// =============================================================================

/// Apply ordering: infrastructure objects land before the pods that use them
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyLayer {
    /// ServiceAccounts, Services, pools, models and routes
    Infrastructure,
    /// Deployments and LeaderWorkerSets
    Workloads,
}

/// A child object that must exist, serialized for server-side apply
#[derive(Clone, Debug)]
pub struct ChildObject {
    /// Object kind, for logging
    pub kind: String,
    /// Object name
    pub name: String,
    /// API resource the object is applied through
    pub api_resource: ApiResource,
    /// Apply layer
    pub layer: ApplyLayer,
    /// Serialized object
    pub body: Value,
}

/// A child object that must not exist
#[derive(Clone, Debug, PartialEq)]
pub struct ChildRef {
    /// Object kind, for logging
    pub kind: String,
    /// Object name
    pub name: String,
    /// API resource the object is deleted through
    pub api_resource: ApiResource,
}

/// Workload whose readiness feeds `WorkloadReady`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadRef {
    /// Single-node Deployment
    Deployment(String),
    /// Multi-node LeaderWorkerSet
    LeaderWorkerSet(String),
}

/// Everything a reconcile applies, deletes and then inspects for status
#[derive(Clone, Debug, Default)]
pub struct ChildPlan {
    /// Objects to apply
    pub apply: Vec<ChildObject>,
    /// Owned objects to remove
    pub delete: Vec<ChildRef>,
    /// Serving workloads
    pub workloads: Vec<WorkloadRef>,
    /// Scheduler Deployment name, when a scheduler is deployed
    pub scheduler: Option<String>,
    /// HTTPRoutes the service is exposed through, managed or referenced
    pub routes: Vec<String>,
}

impl ChildPlan {
    fn add<T: Serialize>(
        &mut self,
        kind: &str,
        name: String,
        api_resource: ApiResource,
        layer: ApplyLayer,
        object: Option<&T>,
    ) -> Result<()> {
        match object {
            Some(obj) => {
                let body = serde_json::to_value(obj)
                    .map_err(|e| Error::serialization_for(kind, e.to_string()))?;
                self.apply.push(ChildObject {
                    kind: kind.to_string(),
                    name,
                    api_resource,
                    layer,
                    body,
                });
            }
            None => self.delete.push(ChildRef {
                kind: kind.to_string(),
                name,
                api_resource,
            }),
        }
        Ok(())
    }

    /// Objects to apply in `layer`
    pub fn layer(&self, layer: ApplyLayer) -> impl Iterator<Item = &ChildObject> {
        self.apply.iter().filter(move |c| c.layer == layer)
    }
}

fn object_name<K: Resource>(obj: Option<&K>, fallback: String) -> String {
    obj.and_then(|o| o.meta().name.clone()).unwrap_or(fallback)
}

/// Compile the merged spec of `svc` into the full child plan
pub fn plan_children(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    storage: &StorageInitializerConfig,
    global: &GlobalConfig,
) -> Result<ChildPlan> {
    use ApplyLayer::{Infrastructure, Workloads};

    let name = svc.name_any();
    let deployment_ar = ApiResource::erase::<Deployment>(&());
    let service_ar = ApiResource::erase::<Service>(&());
    let sa_ar = ApiResource::erase::<ServiceAccount>(&());
    let lws_ar = LeaderWorkerSet::api_resource();

    let workloads = WorkloadCompiler::compile(svc, spec, storage)?;
    let scheduler = build_scheduler(svc, spec);
    let route = build_http_route(svc, spec, global);

    let mut plan = ChildPlan::default();

    // Workloads
    let main = child_name(&name, suffix::MAIN);
    let prefill = child_name(&name, suffix::PREFILL);
    let multi_node = child_name(&name, suffix::MULTI_NODE);
    let multi_node_prefill = child_name(&name, suffix::MULTI_NODE_PREFILL);

    plan.add("ServiceAccount", main.clone(), sa_ar.clone(), Infrastructure, workloads.service_account.as_ref())?;
    plan.add("ServiceAccount", multi_node.clone(), sa_ar.clone(), Infrastructure, workloads.multi_node_service_account.as_ref())?;
    plan.add("ServiceAccount", multi_node_prefill.clone(), sa_ar.clone(), Infrastructure, workloads.prefill_multi_node_service_account.as_ref())?;
    plan.add("Service", child_name(&name, suffix::WORKLOAD_SERVICE), service_ar.clone(), Infrastructure, workloads.service.as_ref())?;

    for (deploy_name, deployment) in [
        (main, workloads.deployment.as_ref()),
        (prefill, workloads.prefill_deployment.as_ref()),
    ] {
        if deployment.is_some() {
            plan.workloads.push(WorkloadRef::Deployment(deploy_name.clone()));
        }
        plan.add("Deployment", deploy_name, deployment_ar.clone(), Workloads, deployment)?;
    }
    for (lws_name, lws) in [
        (multi_node, workloads.leader_worker_set.as_ref()),
        (multi_node_prefill, workloads.prefill_leader_worker_set.as_ref()),
    ] {
        if lws.is_some() {
            plan.workloads.push(WorkloadRef::LeaderWorkerSet(lws_name.clone()));
        }
        plan.add("LeaderWorkerSet", lws_name, lws_ar.clone(), Workloads, lws)?;
    }

    // Scheduler
    let scheduler_name = child_name(&name, SCHEDULER_SUFFIX);
    if scheduler.deployment.is_some() {
        plan.scheduler = Some(scheduler_name.clone());
    }
    let sa_name = object_name(
        scheduler.service_account.as_ref(),
        child_name(&name, EPP_SERVICE_ACCOUNT_SUFFIX),
    );
    plan.add("ServiceAccount", sa_name, sa_ar, Infrastructure, scheduler.service_account.as_ref())?;
    plan.add("Service", child_name(&name, EPP_SERVICE_SUFFIX), service_ar, Infrastructure, scheduler.service.as_ref())?;
    plan.add(
        InferencePool::KIND,
        child_name(&name, INFERENCE_POOL_SUFFIX),
        InferencePool::api_resource(),
        Infrastructure,
        scheduler.inference_pool.as_ref(),
    )?;
    plan.add(
        InferenceModel::KIND,
        child_name(&name, INFERENCE_MODEL_SUFFIX),
        InferenceModel::api_resource(),
        Infrastructure,
        scheduler.inference_model.as_ref(),
    )?;
    plan.add("Deployment", scheduler_name, deployment_ar, Workloads, scheduler.deployment.as_ref())?;

    // Router
    let route_name = child_name(&name, ROUTE_SUFFIX);
    if route.is_some() {
        plan.routes.push(route_name.clone());
    } else {
        plan.routes.extend(referenced_routes(spec));
    }
    plan.add(HttpRoute::KIND, route_name, HttpRoute::api_resource(), Infrastructure, route.as_ref())?;

    Ok(plan)
}

// =============================================================================
// Kube client seam
// =============================================================================

/// Kubernetes operations performed by the LLMInferenceService reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LlmKubeClient: Send + Sync {
    /// Server-side apply every object of the plan, infrastructure layer first
    async fn apply_children(&self, namespace: &str, children: &[ChildObject]) -> Result<()>;

    /// Delete objects that exist and are controlled by `owner_uid`
    async fn delete_children(
        &self,
        namespace: &str,
        owner_uid: &str,
        children: &[ChildRef],
    ) -> Result<()>;

    /// Get a Deployment, `None` if absent
    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>>;

    /// Get a LeaderWorkerSet, `None` if absent
    async fn get_leader_worker_set(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<LeaderWorkerSet>>;

    /// Get an HTTPRoute, `None` if absent
    async fn get_http_route(&self, name: &str, namespace: &str) -> Result<Option<HttpRoute>>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &LLMInferenceServiceStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct LlmKubeClientImpl {
    client: Client,
}

impl LlmKubeClientImpl {
    /// Create a new LlmKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_dynamic<T: DeserializeOwned>(
        &self,
        ar: &ApiResource,
        name: &str,
        namespace: &str,
    ) -> Result<Option<T>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, ar);
        match ignore_not_found(api.get(name).await)? {
            Some(obj) => {
                let value = serde_json::to_value(&obj)
                    .map_err(|e| Error::serialization_for(&ar.kind, e.to_string()))?;
                let typed = serde_json::from_value(value)
                    .map_err(|e| Error::serialization_for(&ar.kind, e.to_string()))?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LlmKubeClient for LlmKubeClientImpl {
    async fn apply_children(&self, namespace: &str, children: &[ChildObject]) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        for (layer, label) in [
            (ApplyLayer::Infrastructure, "infrastructure"),
            (ApplyLayer::Workloads, "workloads"),
        ] {
            let mut batch = ApplyBatch::new(self.client.clone(), namespace, &params);
            for child in children.iter().filter(|c| c.layer == layer) {
                batch.push(child);
            }
            batch.run(label).await?;
        }
        Ok(())
    }

    async fn delete_children(
        &self,
        namespace: &str,
        owner_uid: &str,
        children: &[ChildRef],
    ) -> Result<()> {
        for child in children {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &child.api_resource);
            let Some(existing) = ignore_not_found(api.get(&child.name).await)? else {
                continue;
            };
            let owned = existing
                .owner_references()
                .iter()
                .any(|r| r.uid == owner_uid && r.controller == Some(true));
            if !owned {
                debug!(kind = %child.kind, name = %child.name, "skipping deletion of unowned object");
                continue;
            }
            info!(kind = %child.kind, name = %child.name, "deleting stale child");
            ignore_not_found(api.delete(&child.name, &DeleteParams::background()).await)?;
        }
        Ok(())
    }

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(ignore_not_found(api.get(name).await)?)
    }

    async fn get_leader_worker_set(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<LeaderWorkerSet>> {
        self.get_dynamic(&LeaderWorkerSet::api_resource(), name, namespace)
            .await
    }

    async fn get_http_route(&self, name: &str, namespace: &str) -> Result<Option<HttpRoute>> {
        self.get_dynamic(&HttpRoute::api_resource(), name, namespace)
            .await
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &LLMInferenceServiceStatus,
    ) -> Result<()> {
        let api: Api<LLMInferenceService> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GatewayReader for LlmKubeClientImpl {
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>> {
        self.get_dynamic(&Gateway::api_resource(), name, namespace)
            .await
    }
}

#[async_trait]
impl ConfigLookup for LlmKubeClientImpl {
    async fn get_config(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<LLMInferenceServiceConfig>> {
        let api: Api<LLMInferenceServiceConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(ignore_not_found(api.get(name).await)?)
    }
}

// =============================================================================
// ApplyBatch: parallel server-side apply
// =============================================================================

type ApplyFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// Collects server-side-apply patches and runs them concurrently
struct ApplyBatch<'a> {
    client: Client,
    futures: Vec<ApplyFuture>,
    namespace: &'a str,
    params: &'a PatchParams,
}

impl<'a> ApplyBatch<'a> {
    fn new(client: Client, namespace: &'a str, params: &'a PatchParams) -> Self {
        Self {
            client,
            futures: Vec::new(),
            namespace,
            params,
        }
    }

    /// Queue a patch for `child`, pinning `apiVersion` to its ApiResource
    fn push(&mut self, child: &ChildObject) {
        let mut body = child.body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "apiVersion".to_string(),
                Value::String(child.api_resource.api_version.clone()),
            );
            obj.insert(
                "kind".to_string(),
                Value::String(child.api_resource.kind.clone()),
            );
        }

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), self.namespace, &child.api_resource);
        let params = self.params.clone();
        let name = child.name.clone();
        let kind = child.kind.clone();
        self.futures.push(Box::pin(async move {
            debug!(name = %name, kind = %kind, "applying resource");
            api.patch(&name, &params, &Patch::Apply(&body)).await?;
            Ok(())
        }));
    }

    /// Execute all queued patches, returning the count applied
    async fn run(self, layer: &str) -> Result<usize> {
        use futures::future::join_all;

        let count = self.futures.len();
        if count == 0 {
            return Ok(0);
        }

        debug!(count, layer, "applying resources in parallel");
        let results = join_all(self.futures).await;

        let mut errors: Vec<_> = results.into_iter().filter_map(|r| r.err()).collect();
        if !errors.is_empty() {
            for (i, err) in errors.iter().enumerate() {
                error!(error = %err, index = i, layer, "resource application failed");
            }
            return Err(errors.swap_remove(0));
        }

        Ok(count)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared state for the LLMInferenceService controller
pub struct LlmContext {
    /// Kubernetes operations on children and status
    pub kube: Arc<dyn LlmKubeClient>,
    /// Gateway access for URL discovery
    pub gateways: Arc<dyn GatewayReader>,
    /// LLMInferenceServiceConfig access for preset merging
    pub configs: Arc<dyn ConfigLookup>,
    /// Operator ConfigMap
    pub config_map: Arc<dyn ConfigMapReader>,
    /// Namespace KServe runs in
    pub system_namespace: String,
}

impl LlmContext {
    /// Create a new context from its parts
    pub fn new(
        kube: Arc<dyn LlmKubeClient>,
        gateways: Arc<dyn GatewayReader>,
        configs: Arc<dyn ConfigLookup>,
        config_map: Arc<dyn ConfigMapReader>,
        system_namespace: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            gateways,
            configs,
            config_map,
            system_namespace: system_namespace.into(),
        }
    }

    /// Create a context backed by a real client
    pub fn from_client(client: Client, system_namespace: impl Into<String>) -> Self {
        let system_namespace = system_namespace.into();
        let real = Arc::new(LlmKubeClientImpl::new(client.clone()));
        Self::new(
            real.clone(),
            real.clone(),
            real,
            Arc::new(KubeConfigMapReader::new(client, system_namespace.clone())),
            system_namespace,
        )
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn LlmKubeClient>,
        gateways: Arc<dyn GatewayReader>,
        configs: Arc<dyn ConfigLookup>,
        config_map: Arc<dyn ConfigMapReader>,
    ) -> Self {
        Self::new(kube, gateways, configs, config_map, "kserve")
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile an LLMInferenceService
#[instrument(skip(svc, ctx), fields(name = %svc.name_any(), namespace = ?svc.namespace()))]
pub async fn reconcile(svc: Arc<LLMInferenceService>, ctx: Arc<LlmContext>) -> Result<Action> {
    let name = svc.name_any();
    let Some(namespace) = svc.namespace() else {
        return Err(Error::validation_for(
            &name,
            "LLMInferenceService must be namespaced",
        ));
    };

    if svc.metadata.deletion_timestamp.is_some() {
        debug!("service is being deleted, children are garbage collected");
        return Ok(Action::await_change());
    }

    let config = ctx.config_map.inference_service_config().await?;
    let global = GlobalConfig::from_ingress(&config.ingress, ctx.system_namespace.as_str())?;

    let mut status = svc.status.clone().unwrap_or_default();
    status.observed_generation = svc.metadata.generation;

    let merged = match combine_base_refs_config(ctx.configs.as_ref(), &svc, &global).await {
        Ok(merged) => merged,
        Err(e) => {
            warn!(error = %e, "failed to combine base configurations");
            let message = e.to_string();
            set_condition(
                &mut status.conditions,
                Condition::new(PRESETS_COMBINED, ConditionStatus::False, "CombineBaseError", &message),
            );
            set_condition(
                &mut status.conditions,
                Condition::new(READY, ConditionStatus::False, "CombineBaseError", &message),
            );
            update_status(&svc, &ctx, &name, &namespace, status).await?;
            return Err(e);
        }
    };
    set_condition(
        &mut status.conditions,
        Condition::new(PRESETS_COMBINED, ConditionStatus::True, "", ""),
    );
    let spec = merged.spec.service;

    let plan = plan_children(&svc, &spec, &config.storage_initializer, &global)?;
    info!(
        apply = plan.apply.len(),
        delete = plan.delete.len(),
        "reconciling children"
    );
    ctx.kube.apply_children(&namespace, &plan.apply).await?;
    let uid = svc.uid().unwrap_or_default();
    ctx.kube
        .delete_children(&namespace, &uid, &plan.delete)
        .await?;

    let workload = workload_readiness(ctx.kube.as_ref(), &namespace, &plan.workloads).await?;
    let (router, urls) = router_readiness(&ctx, &namespace, &plan).await?;

    set_readiness_condition(&mut status, WORKLOAD_READY, &workload);
    set_readiness_condition(&mut status, ROUTER_READY, &router);
    let ready = workload.is_ready() && router.is_ready();
    let overall = if ready {
        Readiness::Ready
    } else if !workload.is_ready() {
        workload
    } else {
        router
    };
    set_readiness_condition(&mut status, READY, &overall);

    status.url = primary_url(&urls);
    status.addresses = urls
        .iter()
        .map(|u| Addressable {
            name: None,
            url: Some(u.to_string()),
        })
        .collect();

    update_status(&svc, &ctx, &name, &namespace, status).await?;

    if ready {
        info!("service is ready");
        Ok(Action::requeue(READY_REQUEUE))
    } else {
        debug!("service is progressing");
        Ok(Action::requeue(PROGRESSING_REQUEUE))
    }
}

/// Error policy for the LLMInferenceService controller
pub fn error_policy(svc: Arc<LLMInferenceService>, error: &Error, _ctx: Arc<LlmContext>) -> Action {
    error!(
        ?error,
        name = %svc.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        // Spec errors need a user change to resolve
        Action::await_change()
    }
}

/// First not-ready workload wins; no workloads at all counts as ready
async fn workload_readiness(
    kube: &dyn LlmKubeClient,
    namespace: &str,
    workloads: &[WorkloadRef],
) -> Result<Readiness> {
    for workload in workloads {
        let readiness = match workload {
            WorkloadRef::Deployment(name) => kube
                .get_deployment(name, namespace)
                .await?
                .map(|d| deployment_readiness(&d)),
            WorkloadRef::LeaderWorkerSet(name) => kube
                .get_leader_worker_set(name, namespace)
                .await?
                .map(|lws| leader_worker_set_readiness(&lws)),
        }
        .unwrap_or(Readiness::Progressing);

        if !readiness.is_ready() {
            return Ok(readiness);
        }
    }
    Ok(Readiness::Ready)
}

/// Router readiness and the URLs discovered from its routes
async fn router_readiness(
    ctx: &LlmContext,
    namespace: &str,
    plan: &ChildPlan,
) -> Result<(Readiness, Vec<DiscoveredUrl>)> {
    let mut readiness = Readiness::Ready;

    if let Some(scheduler) = &plan.scheduler {
        let r = ctx
            .kube
            .get_deployment(scheduler, namespace)
            .await?
            .map(|d| deployment_readiness(&d))
            .unwrap_or(Readiness::Progressing);
        if !r.is_ready() {
            readiness = r;
        }
    }

    let mut urls = Vec::new();
    for route_name in &plan.routes {
        let Some(route) = ctx.kube.get_http_route(route_name, namespace).await? else {
            if readiness.is_ready() {
                readiness = Readiness::NotReady {
                    reason: "HTTPRouteNotFound".to_string(),
                    message: format!("HTTPRoute {namespace}/{route_name} does not exist"),
                };
            }
            continue;
        };

        if !route.is_accepted() && readiness.is_ready() {
            readiness = Readiness::NotReady {
                reason: "HTTPRouteNotReady".to_string(),
                message: format!("HTTPRoute {namespace}/{route_name} is not accepted by its parents"),
            };
        }

        match discover_urls(ctx.gateways.as_ref(), &route).await {
            Ok(found) => urls.extend(found),
            Err(e) => {
                warn!(route = %route_name, error = %e, "URL discovery failed");
                if readiness.is_ready() {
                    readiness = Readiness::NotReady {
                        reason: "URLDiscoveryFailed".to_string(),
                        message: e.to_string(),
                    };
                }
            }
        }
    }

    Ok((readiness, urls))
}

/// First external URL, else the first URL of any kind
fn primary_url(urls: &[DiscoveredUrl]) -> Option<String> {
    let external = filter_external_urls(urls);
    external
        .first()
        .or_else(|| urls.first())
        .map(ToString::to_string)
}

fn set_readiness_condition(status: &mut LLMInferenceServiceStatus, type_: &str, readiness: &Readiness) {
    let condition = if readiness.is_ready() {
        Condition::new(type_, ConditionStatus::True, "", "")
    } else {
        let (reason, message) = readiness.reason_and_message();
        Condition::new(type_, ConditionStatus::False, reason, message)
    };
    set_condition(&mut status.conditions, condition);
}

/// Patch status unless nothing changed.
///
/// `set_condition` keeps transition times of unchanged conditions, so an
/// identical status compares equal and no watch event is generated.
async fn update_status(
    svc: &LLMInferenceService,
    ctx: &LlmContext,
    name: &str,
    namespace: &str,
    status: LLMInferenceServiceStatus,
) -> Result<()> {
    if svc.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.kube.patch_status(name, namespace, &status).await
}
