//! The Pod mutating webhook, which injects the matched sidecar templates.
use std::sync::Arc;

use k8s_openapi::{
    api::{
        admissionregistration::v1::{
            MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations,
        },
        core::v1::Pod,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    Client,
    core::admission::{AdmissionRequest, AdmissionResponse},
};
use sidecargo_engine::{Matcher, TemplateRegistry, injector};
use sidecargo_webhook::{
    constants::ADMISSION_REVIEW_VERSION,
    webhooks::{
        self, MutatingWebhookError, MutatingWebhookOptions,
        response::{bad_request, internal_error},
    },
};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::cli::WebhookOptions;

/// Name of the MutatingWebhookConfiguration maintained by the operator.
pub const MUTATING_WEBHOOK_CONFIGURATION_NAME: &str = "sidecargo-mutating-webhook";

/// Name of the single webhook inside the configuration.
pub const MUTATING_WEBHOOK_NAME: &str = "mpod.apps.togettoyou.com";

#[derive(Debug, Snafu)]
pub enum MutationError {
    #[snafu(display("failed to serialize Pod"))]
    SerializePod { source: serde_json::Error },
}

/// State shared by all admission requests.
#[derive(Clone, Debug)]
pub struct WebhookContext {
    matcher: Matcher,
}

impl WebhookContext {
    pub fn new(registry: Arc<TemplateRegistry>) -> Self {
        Self {
            matcher: Matcher::new(registry),
        }
    }
}

/// Creates the [`webhooks::MutatingWebhook`] serving [`mutate_pod`].
pub fn create_webhook(
    ctx: Arc<WebhookContext>,
    client: Client,
    options: &WebhookOptions,
) -> Result<Box<dyn webhooks::Webhook + Send + Sync>, MutatingWebhookError> {
    let webhook = webhooks::MutatingWebhook::new(
        mutating_webhook_configuration(),
        mutate_pod,
        ctx,
        client,
        MutatingWebhookOptions {
            disable_mwc_maintenance: options.disable_mwc_maintenance,
            field_manager: options.field_manager.clone(),
        },
    )?;

    Ok(Box::new(webhook))
}

/// The configuration registering the webhook for Pod creations and updates.
///
/// The client config is filled in when the configuration is applied.
pub fn mutating_webhook_configuration() -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(MUTATING_WEBHOOK_CONFIGURATION_NAME.to_owned()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_owned(),
                    "sidecargo-operator".to_owned(),
                )]
                .into(),
            ),
            ..ObjectMeta::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: MUTATING_WEBHOOK_NAME.to_owned(),
            admission_review_versions: vec![ADMISSION_REVIEW_VERSION.to_owned()],
            side_effects: "None".to_owned(),
            failure_policy: Some("Fail".to_owned()),
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_owned()]),
                operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
                resources: Some(vec!["pods".to_owned()]),
                scope: None,
            }]),
            ..MutatingWebhook::default()
        }]),
    }
}

/// Injects all matching templates into the submitted Pod.
///
/// The Pod namespace falls back to the namespace of the request, because it
/// is usually not set on Pods created through a controller.
#[instrument(
    skip_all,
    fields(
        request.uid = %request.uid,
        request.operation = ?request.operation,
        pod.namespace = request.namespace.as_deref().unwrap_or_default(),
    )
)]
pub async fn mutate_pod(
    ctx: Arc<WebhookContext>,
    request: AdmissionRequest<Pod>,
) -> AdmissionResponse {
    let Some(pod) = &request.object else {
        tracing::debug!("admission request without Pod");
        return bad_request(
            Some(&request.uid),
            "admission request does not contain a Pod",
        );
    };

    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .or(request.namespace.as_deref())
        .unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();

    let matched = ctx.matcher.matches_labels(namespace, &labels);
    if matched.is_empty() {
        tracing::debug!("no template matched, admitting Pod unchanged");
        return AdmissionResponse::from(&request);
    }

    tracing::info!(
        templates = ?matched.iter().map(|m| m.key.to_string()).collect::<Vec<_>>(),
        "injecting templates"
    );

    let result = injector::apply(pod, matched.iter().map(|m| m.template.as_ref()));
    patch_response(&request, pod_patch(pod, result))
}

/// Admits `request` with `patch` attached. Failing to compute or serialize
/// the patch rejects the request with code 500.
pub fn patch_response(
    request: &AdmissionRequest<Pod>,
    patch: Result<json_patch::Patch, MutationError>,
) -> AdmissionResponse {
    let patch = match patch {
        Ok(patch) => patch,
        Err(err) => {
            tracing::error!(error = &err as &dyn std::error::Error, "failed to compute patch");
            return internal_error(request, err);
        }
    };

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = &err as &dyn std::error::Error, "failed to serialize patch");
            internal_error(request, format!("failed to serialize patch: {err}"))
        }
    }
}

/// Computes the JSON Patch turning `pod` into `pod` with `result` applied.
pub fn pod_patch(
    pod: &Pod,
    result: injector::MutationResult,
) -> Result<json_patch::Patch, MutationError> {
    let original = serde_json::to_value(pod).context(SerializePodSnafu)?;
    let mutated = serde_json::to_value(result.into_pod(pod.clone())).context(SerializePodSnafu)?;

    Ok(json_patch::diff(&original, &mutated))
}
