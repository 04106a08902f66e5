//! Kubernetes utility helpers shared by the controllers
//!
//! - `HasApiResource` for external CRDs whose Rust types are plain serde structs
//! - `child_name` for DNS-1123-safe derived object names
//! - metadata builders and finalizer helpers

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::ApiResource;
use kube::Resource;

/// Longest DNS-1123 label allowed for derived names
pub const MAX_NAME_LENGTH: usize = 63;

/// Hex characters of the hash kept by `child_name`
const HASH_LENGTH: usize = 32;

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implemented by the Gateway API, inference extension and LeaderWorkerSet
/// types which are not generated by `kube::CustomResource`.
pub trait HasApiResource {
    /// Full API version (e.g., "gateway.networking.k8s.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "HTTPRoute")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split `group/version` into its parts; core types have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower
        .strip_suffix('y')
        .filter(|s| !s.ends_with(['a', 'e', 'i', 'o', 'u']))
    {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Derive a child object name from `parent` and `suffix`.
///
/// Short names are simply concatenated. When the result would exceed 63
/// characters the parent is truncated and a hash of the full parent is
/// spliced in, so distinct long parents never collide.
pub fn child_name(parent: &str, suffix: &str) -> String {
    if parent.len() + suffix.len() <= MAX_NAME_LENGTH {
        return format!("{parent}{suffix}");
    }

    // Suffix alone leaves no room for parent + hash
    let head = MAX_NAME_LENGTH.saturating_sub(suffix.len());
    if head <= HASH_LENGTH {
        let hash = deterministic_hash(&format!("{parent}{suffix}"), HASH_LENGTH);
        return hash;
    }

    let keep = head - HASH_LENGTH;
    let truncated: String = parent.chars().take(keep).collect();
    let truncated = truncated.trim_end_matches('-');
    format!(
        "{}{}{}",
        truncated,
        deterministic_hash(parent, HASH_LENGTH),
        suffix
    )
}

/// Hex-encoded SHA-256 of `input`, truncated to `len` characters.
pub fn deterministic_hash(input: &str, len: usize) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    let mut out = hash
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        });
    out.truncate(len);
    out
}

// =============================================================================
// Metadata
// =============================================================================

/// Metadata for an object owned (as controller) by `owner`.
pub fn owned_meta<K>(
    owner: &K,
    name: impl Into<String>,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
) -> ObjectMeta
where
    K: Resource<DynamicType = ()>,
{
    ObjectMeta {
        name: Some(name.into()),
        namespace,
        labels: if labels.is_empty() { None } else { Some(labels) },
        owner_references: controller_ref(owner).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Controller owner reference pointing at `owner`, if it has a UID.
pub fn controller_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

/// Build a label map from static pairs.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Finalizers
// =============================================================================

/// Whether the object's metadata lists `finalizer`.
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Finalizer list with `finalizer` appended (no duplicates).
pub fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizer list with `finalizer` removed.
pub fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default()
}

/// `Ok(None)` for a 404, otherwise pass the result through.
pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, kube::Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}
