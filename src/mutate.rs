//! The mutation decision engine: decides whether an incoming pod gets the
//! virtiofs sidecar appended and produces the admission response.

use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse},
    DynamicObject,
};

use crate::config::Config;
use crate::patch::build_patch;
use crate::resolve::ServiceAccounts;

/// A pod is a KubeVirt pod iff its labels contain the exact `kubevirt.io` key
/// or any key prefixed `kubevirt.io`/`vm.kubevirt.io`. Key scan only, values
/// are never inspected, so the result is independent of iteration order.
fn is_kubevirt_pod(pod: &Pod) -> bool {
    let Some(labels) = &pod.metadata.labels else {
        return false;
    };
    if labels.contains_key("kubevirt.io") {
        return true;
    }
    labels
        .keys()
        .any(|key| key.starts_with("kubevirt.io") || key.starts_with("vm.kubevirt.io"))
}

/// Decide on a single admission request. Every outcome is terminal: the engine
/// never retries, and every failure denies the request with a message rather
/// than aborting. Pods outside the webhook's remit are allowed untouched.
pub async fn mutate<S: ServiceAccounts>(
    request: &AdmissionRequest<DynamicObject>,
    accounts: &S,
    config: &Config,
) -> AdmissionResponse {
    // Registered for pods only, but no-op on anything else rather than erroring.
    if request.kind.kind != "Pod" {
        return AdmissionResponse::from(request);
    }

    let pod: Pod = match request.object.as_ref().map(|obj| obj.clone().try_parse()) {
        Some(Ok(pod)) => pod,
        Some(Err(err)) => {
            tracing::warn!("Rejecting request {}: unparseable pod: {}", request.uid, err);
            return AdmissionResponse::from(request)
                .deny(format!("could not parse pod object: {err}"));
        }
        None => {
            tracing::warn!("Rejecting request {}: no object attached", request.uid);
            return AdmissionResponse::from(request).deny("no pod object in request");
        }
    };

    if !is_kubevirt_pod(&pod) {
        tracing::debug!(
            "Skipping pod {:?} in namespace={:?}: not a KubeVirt pod",
            pod.metadata.name,
            pod.metadata.namespace
        );
        return AdmissionResponse::from(request);
    }

    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let account_name = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string());

    // Fail closed on lookup errors: letting an IRSA workload start without its
    // sidecar because the control plane was briefly unreachable would be a
    // silent misconfiguration.
    let account = match accounts.get(&namespace, &account_name).await {
        Ok(account) => account,
        Err(err) => {
            tracing::error!(
                "Denying pod {:?}: service account lookup {}/{} failed: {}",
                pod.metadata.name,
                namespace,
                account_name,
                err
            );
            return AdmissionResponse::from(request).deny(format!(
                "failed to get service account {namespace}/{account_name}: {err}"
            ));
        }
    };

    // The role value gates whether to patch; the sidecar body never embeds it
    // (credentials come from the projected token mount).
    let Some(role_arn) = account
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&config.role_annotation))
    else {
        tracing::debug!(
            "Skipping pod {:?}: service account {}/{} has no {} annotation",
            pod.metadata.name,
            namespace,
            account_name,
            config.role_annotation
        );
        return AdmissionResponse::from(request);
    };

    let patch = match build_patch(config) {
        Ok(patch) => patch,
        Err(err) => {
            return AdmissionResponse::from(request).deny(format!("failed to create patch: {err}"));
        }
    };

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => {
            tracing::info!(
                "Injecting virtiofs sidecar into pod {:?} in namespace={:?} (role {})",
                pod.metadata.name,
                namespace,
                role_arn
            );
            response
        }
        Err(err) => AdmissionResponse::from(request).deny(format!("failed to create patch: {err}")),
    }
}
