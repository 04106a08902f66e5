//! LocalModelCache and LocalModelNamespaceCache admission rules

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use kserve_common::admission::{AdmissionError, AdmissionResult, AdmissionValidator, Warnings};
use kserve_common::crd::{CacheSpec, LocalModelCache, LocalModelNamespaceCache, NamespacedName};
use kserve_common::Error;

use super::LocalModelReader;

/// Reject `spec` if another cache of the same model already has an equal or newer version.
///
/// `peers` yields every existing cache as `(name, spec)`; the object being
/// admitted is skipped by name.
fn check_version<'a, S>(
    name: &str,
    spec: &dyn CacheSpec,
    peers: impl IntoIterator<Item = (String, &'a S)>,
    verb: &str,
) -> Result<(), AdmissionError>
where
    S: CacheSpec + 'a,
{
    let conflict = peers.into_iter().find(|(peer, peer_spec)| {
        peer != name
            && peer_spec.source_model_uri() == spec.source_model_uri()
            && peer_spec.version() >= spec.version()
    });

    match conflict {
        Some((peer, peer_spec)) => {
            debug!(
                cache = %name,
                existing = %peer,
                existing_version = peer_spec.version(),
                "rejecting stale cache version"
            );
            Err(AdmissionError::Denied(format!(
                "cannot {verb} version {}",
                spec.version()
            )))
        }
        None => Ok(()),
    }
}

/// Deny deletion while any listed InferenceService is labeled with `cache`.
///
/// A listed service that cannot be read, including one that no longer
/// exists, fails the request.
async fn ensure_unused(
    reader: &dyn LocalModelReader,
    cache: &str,
    bound: impl IntoIterator<Item = &NamespacedName>,
) -> Result<(), AdmissionError> {
    for svc in bound {
        let isvc = reader
            .get_inference_service(&svc.name, &svc.namespace)
            .await?
            .ok_or_else(|| Error::not_found("InferenceService", format!("{}/{}", svc.namespace, svc.name)))?;
        if isvc.local_model() == Some(cache) {
            return Err(AdmissionError::Denied(format!(
                "LocalModelCache {cache} is being used by InferenceService {}",
                svc.name
            )));
        }
    }
    Ok(())
}

// =============================================================================
// LocalModelCache
// =============================================================================

/// Version monotonicity and deletion guard for cluster-wide caches
pub struct LocalModelCacheValidator {
    reader: Arc<dyn LocalModelReader>,
}

impl LocalModelCacheValidator {
    /// Create a validator reading cluster state through `reader`
    pub fn new(reader: Arc<dyn LocalModelReader>) -> Self {
        Self { reader }
    }

    async fn validate_version(&self, cache: &LocalModelCache, verb: &str) -> AdmissionResult {
        let existing = self.reader.list_caches().await?;
        let name = cache.name_any();
        check_version(
            &name,
            &cache.spec,
            existing.iter().map(|c| (c.name_any(), &c.spec)),
            verb,
        )?;
        Ok(Warnings::new())
    }
}

#[async_trait]
impl AdmissionValidator<LocalModelCache> for LocalModelCacheValidator {
    async fn validate_create(&self, obj: &LocalModelCache) -> AdmissionResult {
        self.validate_version(obj, "create").await
    }

    async fn validate_update(&self, _old: &LocalModelCache, new: &LocalModelCache) -> AdmissionResult {
        self.validate_version(new, "update to").await
    }

    async fn validate_delete(&self, obj: &LocalModelCache) -> AdmissionResult {
        let bound: Vec<&NamespacedName> =
            obj.status.iter().flat_map(|s| s.inference_services.iter()).collect();
        ensure_unused(self.reader.as_ref(), &obj.name_any(), bound).await?;
        Ok(Warnings::new())
    }
}

// =============================================================================
// LocalModelNamespaceCache
// =============================================================================

/// Node group existence, version monotonicity and deletion guard for namespaced caches
pub struct LocalModelNamespaceCacheValidator {
    reader: Arc<dyn LocalModelReader>,
}

impl LocalModelNamespaceCacheValidator {
    /// Create a validator reading cluster state through `reader`
    pub fn new(reader: Arc<dyn LocalModelReader>) -> Self {
        Self { reader }
    }

    async fn validate(&self, cache: &LocalModelNamespaceCache, verb: &str) -> AdmissionResult {
        for group in cache.spec.node_groups() {
            if self.reader.get_node_group(group).await?.is_none() {
                return Err(AdmissionError::Denied(format!(
                    "LocalModelNodeGroup {group} does not exist"
                )));
            }
        }

        let namespace = cache.namespace().unwrap_or_default();
        let existing = self.reader.list_namespace_caches(&namespace).await?;
        check_version(
            &cache.name_any(),
            &cache.spec,
            existing.iter().map(|c| (c.name_any(), &c.spec)),
            verb,
        )?;
        Ok(Warnings::new())
    }
}

#[async_trait]
impl AdmissionValidator<LocalModelNamespaceCache> for LocalModelNamespaceCacheValidator {
    async fn validate_create(&self, obj: &LocalModelNamespaceCache) -> AdmissionResult {
        self.validate(obj, "create").await
    }

    async fn validate_update(
        &self,
        _old: &LocalModelNamespaceCache,
        new: &LocalModelNamespaceCache,
    ) -> AdmissionResult {
        self.validate(new, "update to").await
    }

    async fn validate_delete(&self, obj: &LocalModelNamespaceCache) -> AdmissionResult {
        let namespace = obj.namespace().unwrap_or_default();
        let bound = obj
            .status
            .iter()
            .flat_map(|s| s.inference_services.iter())
            .filter(|svc| svc.namespace == namespace)
            .collect::<Vec<&NamespacedName>>();
        ensure_unused(self.reader.as_ref(), &obj.name_any(), bound).await?;
        Ok(Warnings::new())
    }
}
