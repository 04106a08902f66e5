//! Model artifact attachment
//!
//! Configures a pod so that the model named by `spec.model.uri` is available
//! at `/mnt/models` in the `main` container, and appends that path to the
//! container command (vLLM takes the model location positionally).
//!
//! | scheme   | mechanism                                         |
//! |----------|---------------------------------------------------|
//! | `pvc://` | claim mounted read-only, optional sub path        |
//! | `oci://` | modelcar sidecar sharing the process namespace    |
//! | `hf://`  | storage-initializer init container + emptyDir     |
//! | `s3://`  | as `hf://`, with anonymous credentials            |

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, PodSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use kserve_common::config::StorageInitializerConfig;
use kserve_common::crd::LLMInferenceServiceSpec;
use kserve_common::{Error, Result, DEFAULT_MODEL_LOCAL_MOUNT_PATH};

use super::{main_container_mut, set_env, MAIN_CONTAINER};

/// Volume holding the downloaded or linked model
pub const STORAGE_INITIALIZER_VOLUME: &str = "kserve-provision-location";
/// Init container downloading the model
pub const STORAGE_INITIALIZER_CONTAINER: &str = "storage-initializer";
/// Volume backed by the model PVC
pub const PVC_SOURCE_VOLUME: &str = "kserve-pvc-source";
/// Sidecar exposing an OCI model image
pub const MODELCAR_CONTAINER: &str = "modelcar";
/// Init container pre-pulling the OCI model image
pub const MODELCAR_INIT_CONTAINER: &str = "modelcar-init";

const MODEL_INIT_MODE_ENV: &str = "MODEL_INIT_MODE";
const AWS_ANONYMOUS_CREDENTIAL_ENV: &str = "AWS_ANONYMOUS_CREDENTIAL";

const DEFAULT_CPU_REQUEST: &str = "100m";
const DEFAULT_CPU_LIMIT: &str = "1";
const DEFAULT_MEMORY_REQUEST: &str = "100Mi";
const DEFAULT_MEMORY_LIMIT: &str = "1Gi";
const MODELCAR_CPU: &str = "10m";
const MODELCAR_MEMORY: &str = "15Mi";

/// Configure `pod` to serve the model of `spec`.
pub fn attach_model_artifacts(
    spec: &LLMInferenceServiceSpec,
    pod: &mut PodSpec,
    storage: &StorageInitializerConfig,
) -> Result<()> {
    let uri = spec.model.uri.as_str();
    let Some((scheme, _)) = uri.split_once("://") else {
        return Err(Error::validation_for_field(
            "LLMInferenceService",
            "spec.model.uri",
            format!("invalid model URI: {uri}"),
        ));
    };

    match scheme {
        "pvc" => attach_pvc(uri, pod),
        "oci" => {
            if !storage.enable_oci_image_source {
                return Err(Error::validation("OCI modelcars is not enabled"));
            }
            attach_modelcar(uri, pod)?;
        }
        "hf" if spec.storage_initializer_enabled() => {
            attach_storage_initializer(uri, pod, storage);
        }
        "s3" if spec.storage_initializer_enabled() => {
            attach_storage_initializer(uri, pod, storage);
            if let Some(init) = init_container_mut(pod, STORAGE_INITIALIZER_CONTAINER) {
                set_env(init, AWS_ANONYMOUS_CREDENTIAL_ENV, "true");
            }
        }
        "hf" | "s3" => return Ok(()),
        _ => {
            return Err(Error::validation_for_field(
                "LLMInferenceService",
                "spec.model.uri",
                format!("unsupported schema in model URI: {uri}"),
            ))
        }
    }

    if let Some(main) = main_container_mut(pod) {
        main.command
            .get_or_insert_with(Vec::new)
            .push(DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string());
    }
    Ok(())
}

/// Split `pvc://claim[/path]` into claim and sub path
fn parse_pvc_uri(uri: &str) -> (&str, &str) {
    let rest = uri.strip_prefix("pvc://").unwrap_or(uri);
    rest.split_once('/').unwrap_or((rest, ""))
}

fn attach_pvc(uri: &str, pod: &mut PodSpec) {
    let (claim, sub_path) = parse_pvc_uri(uri);

    let Some(main) = main_container_mut(pod) else {
        return;
    };
    add_volume_mount(
        main,
        VolumeMount {
            name: PVC_SOURCE_VOLUME.to_string(),
            mount_path: DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
            sub_path: (!sub_path.is_empty()).then(|| sub_path.to_string()),
            read_only: Some(true),
            ..Default::default()
        },
    );

    add_volume(
        pod,
        Volume {
            name: PVC_SOURCE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: None,
            }),
            ..Default::default()
        },
    );
}

fn attach_storage_initializer(uri: &str, pod: &mut PodSpec, storage: &StorageInitializerConfig) {
    add_empty_dir(pod, STORAGE_INITIALIZER_VOLUME);

    if init_container_mut(pod, STORAGE_INITIALIZER_CONTAINER).is_none() {
        let init = Container {
            name: STORAGE_INITIALIZER_CONTAINER.to_string(),
            image: Some(storage.image.clone()),
            args: Some(vec![
                uri.to_string(),
                DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
            ]),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            volume_mounts: Some(vec![VolumeMount {
                name: STORAGE_INITIALIZER_VOLUME.to_string(),
                mount_path: DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
                read_only: Some(false),
                ..Default::default()
            }]),
            resources: Some(resources(
                storage.cpu_request.as_deref().unwrap_or(DEFAULT_CPU_REQUEST),
                storage.cpu_limit.as_deref().unwrap_or(DEFAULT_CPU_LIMIT),
                storage.memory_request.as_deref().unwrap_or(DEFAULT_MEMORY_REQUEST),
                storage.memory_limit.as_deref().unwrap_or(DEFAULT_MEMORY_LIMIT),
            )),
            ..Default::default()
        };
        pod.init_containers.get_or_insert_with(Vec::new).push(init);
    }

    if let Some(main) = main_container_mut(pod) {
        add_volume_mount(
            main,
            VolumeMount {
                name: STORAGE_INITIALIZER_VOLUME.to_string(),
                mount_path: DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        );
    }
}

fn attach_modelcar(uri: &str, pod: &mut PodSpec) -> Result<()> {
    let image = uri.strip_prefix("oci://").unwrap_or(uri).to_string();
    let parent = parent_directory(DEFAULT_MODEL_LOCAL_MOUNT_PATH);

    let main = main_container_mut(pod)
        .ok_or_else(|| Error::validation(format!("no container found with name {MAIN_CONTAINER}")))?;
    set_env(main, MODEL_INIT_MODE_ENV, "async");
    add_volume_mount(
        main,
        VolumeMount {
            name: STORAGE_INITIALIZER_VOLUME.to_string(),
            mount_path: parent.to_string(),
            read_only: Some(false),
            ..Default::default()
        },
    );
    add_empty_dir(pod, STORAGE_INITIALIZER_VOLUME);

    if !pod.containers.iter().any(|c| c.name == MODELCAR_CONTAINER) {
        pod.containers.push(Container {
            name: MODELCAR_CONTAINER.to_string(),
            image: Some(image.clone()),
            args: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("ln -sf /proc/$$$$/root/models {DEFAULT_MODEL_LOCAL_MOUNT_PATH} && sleep infinity"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: STORAGE_INITIALIZER_VOLUME.to_string(),
                mount_path: parent.to_string(),
                read_only: Some(false),
                ..Default::default()
            }]),
            resources: Some(resources(MODELCAR_CPU, MODELCAR_CPU, MODELCAR_MEMORY, MODELCAR_MEMORY)),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            ..Default::default()
        });
        pod.init_containers.get_or_insert_with(Vec::new).push(Container {
            name: MODELCAR_INIT_CONTAINER.to_string(),
            image: Some(image.clone()),
            args: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "echo 'Pre-fetching modelcar {image}: ' && [ -d /models ] && [ \"$$(ls -A /models)\" ] && echo 'OK ... Prefetched and valid (/models exists)' || (echo 'NOK ... Prefetched but modelcar is invalid (/models does not exist or is empty)' && exit 1)"
                ),
            ]),
            resources: Some(resources(MODELCAR_CPU, MODELCAR_CPU, MODELCAR_MEMORY, MODELCAR_MEMORY)),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            ..Default::default()
        });
    }

    pod.share_process_namespace = Some(true);
    Ok(())
}

// =============================================================================
// Pod spec helpers
// =============================================================================

fn init_container_mut<'a>(pod: &'a mut PodSpec, name: &str) -> Option<&'a mut Container> {
    pod.init_containers
        .as_mut()?
        .iter_mut()
        .find(|c| c.name == name)
}

fn add_volume(pod: &mut PodSpec, volume: Volume) {
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == volume.name) {
        volumes.push(volume);
    }
}

fn add_empty_dir(pod: &mut PodSpec, name: &str) {
    add_volume(
        pod,
        Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    );
}

fn add_volume_mount(container: &mut Container, mount: VolumeMount) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if !mounts.iter().any(|m| m.name == mount.name) {
        mounts.push(mount);
    }
}

fn parent_directory(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn resources(cpu_request: &str, cpu_limit: &str, mem_request: &str, mem_limit: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu_request.to_string())),
            ("memory".to_string(), Quantity(mem_request.to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu_limit.to_string())),
            ("memory".to_string(), Quantity(mem_limit.to_string())),
        ])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec_with_uri(uri: &str) -> LLMInferenceServiceSpec {
        serde_json::from_value(json!({"model": {"uri": uri}})).unwrap()
    }

    fn main_pod() -> PodSpec {
        serde_json::from_value(json!({
            "containers": [{"name": "main", "image": "vllm", "command": ["vllm", "serve"]}]
        }))
        .unwrap()
    }

    fn main(pod: &PodSpec) -> &Container {
        pod.containers.iter().find(|c| c.name == MAIN_CONTAINER).unwrap()
    }

    #[test]
    fn pvc_mounts_claim_with_sub_path() {
        let mut pod = main_pod();
        attach_model_artifacts(
            &spec_with_uri("pvc://models/llama/v1"),
            &mut pod,
            &StorageInitializerConfig::default(),
        )
        .unwrap();

        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "models"
        );
        let mount = &main(&pod).volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/mnt/models");
        assert_eq!(mount.sub_path.as_deref(), Some("llama/v1"));
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(
            main(&pod).command.as_ref().unwrap(),
            &vec!["vllm".to_string(), "serve".into(), "/mnt/models".into()]
        );
    }

    #[test]
    fn hf_adds_storage_initializer() {
        let mut pod = main_pod();
        let storage = StorageInitializerConfig {
            image: "si:v1".into(),
            ..Default::default()
        };
        attach_model_artifacts(&spec_with_uri("hf://org/llama"), &mut pod, &storage).unwrap();

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, STORAGE_INITIALIZER_CONTAINER);
        assert_eq!(init.image.as_deref(), Some("si:v1"));
        assert_eq!(
            init.args.as_ref().unwrap(),
            &vec!["hf://org/llama".to_string(), "/mnt/models".into()]
        );
        assert!(init.env.is_none());
        assert!(pod.volumes.as_ref().unwrap()[0].empty_dir.is_some());
        assert_eq!(main(&pod).volume_mounts.as_ref().unwrap()[0].read_only, Some(true));
    }

    #[test]
    fn s3_sets_anonymous_credentials() {
        let mut pod = main_pod();
        attach_model_artifacts(
            &spec_with_uri("s3://bucket/llama"),
            &mut pod,
            &StorageInitializerConfig::default(),
        )
        .unwrap();
        let init = &pod.init_containers.as_ref().unwrap()[0];
        let env = init.env.as_ref().unwrap();
        assert_eq!(env[0].name, "AWS_ANONYMOUS_CREDENTIAL");
        assert_eq!(env[0].value.as_deref(), Some("true"));
    }

    #[test]
    fn attachment_is_idempotent() {
        let mut pod = main_pod();
        let storage = StorageInitializerConfig::default();
        let spec = spec_with_uri("hf://org/llama");
        attach_model_artifacts(&spec, &mut pod, &storage).unwrap();
        attach_model_artifacts(&spec, &mut pod, &storage).unwrap();
        assert_eq!(pod.init_containers.as_ref().unwrap().len(), 1);
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn oci_requires_opt_in() {
        let mut pod = main_pod();
        let err = attach_model_artifacts(
            &spec_with_uri("oci://registry/model:1"),
            &mut pod,
            &StorageInitializerConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("OCI modelcars is not enabled"));
    }

    #[test]
    fn oci_adds_modelcar() {
        let mut pod = main_pod();
        let storage = StorageInitializerConfig {
            enable_oci_image_source: true,
            ..Default::default()
        };
        attach_model_artifacts(&spec_with_uri("oci://registry/model:1"), &mut pod, &storage)
            .unwrap();

        let modelcar = pod.containers.iter().find(|c| c.name == MODELCAR_CONTAINER).unwrap();
        assert_eq!(modelcar.image.as_deref(), Some("registry/model:1"));
        assert_eq!(pod.share_process_namespace, Some(true));
        assert_eq!(
            pod.init_containers.as_ref().unwrap()[0].name,
            MODELCAR_INIT_CONTAINER
        );
        let mount = &main(&pod).volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/mnt");
    }

    #[test]
    fn bad_uris_are_rejected() {
        let storage = StorageInitializerConfig::default();
        let err = attach_model_artifacts(&spec_with_uri("no-scheme"), &mut main_pod(), &storage)
            .unwrap_err();
        assert!(err.to_string().contains("invalid model URI: no-scheme"));

        let err = attach_model_artifacts(&spec_with_uri("gs://bucket/m"), &mut main_pod(), &storage)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("unsupported schema in model URI: gs://bucket/m"));
    }

    #[test]
    fn disabled_storage_initializer_leaves_pod_untouched() {
        let mut spec = spec_with_uri("hf://org/llama");
        spec.storage_initializer = Some(kserve_common::crd::StorageInitializerSpec {
            enabled: Some(false),
        });
        let mut pod = main_pod();
        attach_model_artifacts(&spec, &mut pod, &StorageInitializerConfig::default()).unwrap();
        assert_eq!(pod, main_pod());
    }

    #[test]
    fn parent_directory_of_mount() {
        assert_eq!(parent_directory("/mnt/models"), "/mnt");
        assert_eq!(parent_directory("/models"), "/");
    }
}
