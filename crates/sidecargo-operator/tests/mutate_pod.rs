use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::core::v1::{Container, Pod, Volume},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use rstest::rstest;
use serde_json::{Value, json};
use sidecargo_engine::{Matcher, Template, TemplateKey, TemplateRegistry, injector};
use sidecargo_operator::webhook::{
    MUTATING_WEBHOOK_CONFIGURATION_NAME, MUTATING_WEBHOOK_NAME, MutationError, WebhookContext,
    mutate_pod, mutating_webhook_configuration, patch_response, pod_patch,
};

fn review(object: Value) -> AdmissionRequest<Pod> {
    let review: AdmissionReview<Pod> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "web",
            "namespace": "default",
            "operation": "CREATE",
            "userInfo": {"username": "admin"},
            "object": object,
            "oldObject": null,
            "dryRun": false,
        }
    }))
    .expect("valid AdmissionReview");

    review.try_into().expect("review contains a request")
}

fn pod(labels: Value) -> Value {
    // Pods created by controllers usually don't carry a namespace
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "web", "labels": labels},
        "spec": {
            "containers": [{"name": "app", "image": "nginx"}]
        }
    })
}

fn registry_with_sidecar() -> Arc<TemplateRegistry> {
    let registry = Arc::new(TemplateRegistry::new());
    registry
        .put(
            TemplateKey::new("default", "logging"),
            Template {
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_owned(), "web".to_owned())])),
                    match_expressions: None,
                }),
                containers: vec![Container {
                    name: "log-shipper".to_owned(),
                    image: Some("fluent-bit".to_owned()),
                    ..Container::default()
                }],
                volumes: vec![Volume {
                    name: "logs".to_owned(),
                    ..Volume::default()
                }],
                ..Template::default()
            },
        )
        .expect("valid template");

    registry
}

async fn respond(registry: Arc<TemplateRegistry>, object: Value) -> Value {
    let ctx = Arc::new(WebhookContext::new(registry));
    let response = mutate_pod(ctx, review(object)).await;

    let review = serde_json::to_value(response.into_review()).expect("response serializes");
    review["response"].clone()
}

/// Runs the same steps as the handler and applies the resulting patch.
fn patched(registry: Arc<TemplateRegistry>, original: &Value) -> Value {
    let mut pod: Pod = serde_json::from_value(original.clone()).expect("valid Pod");
    pod.metadata.namespace = Some("default".to_owned());

    let matched = Matcher::new(registry).matches(&pod);
    let result = injector::apply(&pod, matched.iter().map(|m| m.template.as_ref()));
    let patch = pod_patch(&pod, result).expect("patch can be computed");

    let mut mutated = serde_json::to_value(&pod).expect("Pod serializes");
    json_patch::patch(&mut mutated, &patch.0).expect("patch applies");
    mutated
}

#[rstest]
#[case::no_template(Arc::new(TemplateRegistry::new()), json!({"app": "web"}))]
#[case::labels_dont_match(registry_with_sidecar(), json!({"app": "api"}))]
#[tokio::test]
async fn unmatched_pod_is_admitted_without_patch(
    #[case] registry: Arc<TemplateRegistry>,
    #[case] labels: Value,
) {
    let response = respond(registry, pod(labels)).await;

    assert_eq!(response["allowed"], true);
    assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    assert!(response.get("patch").is_none_or(Value::is_null));
}

#[tokio::test]
async fn matched_pod_is_admitted_with_patch() {
    let response = respond(registry_with_sidecar(), pod(json!({"app": "web"}))).await;

    assert_eq!(response["allowed"], true);
    assert_eq!(response["patchType"], "JSONPatch");
    assert!(response["patch"].is_string() || response["patch"].is_array());
}

#[test]
fn patch_adds_sidecar_and_volume() {
    let mutated = patched(registry_with_sidecar(), &pod(json!({"app": "web"})));

    assert_eq!(
        mutated["spec"]["containers"],
        json!([
            {"name": "app", "image": "nginx"},
            {"name": "log-shipper", "image": "fluent-bit"}
        ])
    );
    assert_eq!(mutated["spec"]["volumes"], json!([{"name": "logs"}]));
    assert!(mutated["spec"].get("initContainers").is_none());
}

#[tokio::test]
async fn request_namespace_is_used_for_namespaced_templates() {
    let registry = Arc::new(TemplateRegistry::new());
    registry
        .put(
            TemplateKey::new("default", "scoped"),
            Template {
                scope_namespace: Some("default".to_owned()),
                init_containers: vec![Container {
                    name: "setup".to_owned(),
                    ..Container::default()
                }],
                ..Template::default()
            },
        )
        .expect("valid template");

    // The Pod itself carries no namespace, only the request does
    let response = respond(registry.clone(), pod(json!({}))).await;
    assert_eq!(response["patchType"], "JSONPatch");

    let mutated = patched(registry, &pod(json!({})));
    assert_eq!(mutated["spec"]["initContainers"], json!([{"name": "setup"}]));
}

#[tokio::test]
async fn request_without_pod_is_bad_request() {
    let response = respond(registry_with_sidecar(), Value::Null).await;

    assert_eq!(response["allowed"], false);
    assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    assert_eq!(response["status"]["code"], 400);
    assert!(response.get("patch").is_none_or(Value::is_null));
}

#[test]
fn failed_patch_is_internal_error() {
    let request = review(pod(json!({"app": "web"})));
    let source = serde_json::from_str::<Value>("{").expect_err("truncated JSON");

    let response = patch_response(&request, Err(MutationError::SerializePod { source }));
    let response = serde_json::to_value(response.into_review()).expect("response serializes");
    let response = &response["response"];

    assert_eq!(response["allowed"], false);
    assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    assert_eq!(response["status"]["code"], 500);
    assert_eq!(response["status"]["message"], "failed to serialize Pod");
}

#[test]
fn webhook_configuration() {
    let configuration = mutating_webhook_configuration();
    assert_eq!(
        configuration.metadata.name.as_deref(),
        Some(MUTATING_WEBHOOK_CONFIGURATION_NAME)
    );

    let webhooks = configuration.webhooks.expect("webhooks are set");
    assert_eq!(webhooks.len(), 1);

    let webhook = &webhooks[0];
    assert_eq!(webhook.name, MUTATING_WEBHOOK_NAME);
    assert_eq!(webhook.admission_review_versions, ["v1"]);
    assert_eq!(webhook.side_effects, "None");
    assert_eq!(webhook.failure_policy.as_deref(), Some("Fail"));

    let rules = webhook.rules.as_ref().expect("rules are set");
    assert_eq!(
        rules[0].operations.as_deref(),
        Some(&["CREATE".to_owned(), "UPDATE".to_owned()][..])
    );
    assert_eq!(rules[0].resources.as_deref(), Some(&["pods".to_owned()][..]));
}
