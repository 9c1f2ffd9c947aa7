//! Builds the JSON Patch that appends the virtiofs sidecar to a pod.

use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::Pointer;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ResourceRequirements, SecurityContext, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

use crate::config::Config;

pub const SIDECAR_NAME: &str = "virtiofs-aws-iam-token";

/// virtiofsd runs unprivileged inside the launcher pod as the qemu user.
const VIRTIOFSD_UID: i64 = 107;
const VIRTIOFSD_GID: i64 = 107;

const VIRTIOFSD_ARGS: &[&str] = &[
    "--socket-path=/var/run/kubevirt/virtiofs-containers/aws-iam-token.sock",
    "--shared-dir=/var/run/secrets/eks.amazonaws.com/serviceaccount",
    "--sandbox=none",
    "--cache=auto",
    "--migration-on-error=guest-error",
    "--migration-mode=find-paths",
];

fn resource_list(cpu: &Quantity, memory: &Quantity) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), cpu.clone()),
        ("memory".to_string(), memory.clone()),
    ])
}

/// The sidecar template. Everything request-independent; the only variable
/// parts come from the static configuration.
fn virtiofs_sidecar(config: &Config) -> Container {
    Container {
        name: SIDECAR_NAME.to_string(),
        image: Some(config.virtiofs_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/libexec/virtiofsd".to_string()]),
        args: Some(VIRTIOFSD_ARGS.iter().map(|arg| arg.to_string()).collect()),
        resources: Some(ResourceRequirements {
            requests: Some(resource_list(
                &config.resource_requests.cpu,
                &config.resource_requests.memory,
            )),
            limits: Some(resource_list(
                &config.resource_limits.cpu,
                &config.resource_limits.memory,
            )),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "virtiofs-containers".to_string(),
            mount_path: "/var/run/kubevirt/virtiofs-containers".to_string(),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            run_as_user: Some(VIRTIOFSD_UID),
            run_as_group: Some(VIRTIOFSD_GID),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the single-operation patch appending the sidecar to the pod's
/// container list. The path is always the `-` append token: an index-based
/// insert would race with other mutating webhooks editing the same array.
pub fn build_patch(config: &Config) -> anyhow::Result<Patch> {
    let value = serde_json::to_value(virtiofs_sidecar(config))?;
    Ok(Patch(vec![PatchOperation::Add(AddOperation {
        path: Pointer::new(["spec", "containers", "-"]),
        value,
    })]))
}
