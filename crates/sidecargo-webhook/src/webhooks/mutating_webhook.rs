use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use axum::{Json, Router, body::Bytes, routing::post};
use k8s_openapi::{ByteString, api::admissionregistration::v1::MutatingWebhookConfiguration};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu, ensure};
use tracing::instrument;

use super::{Webhook, WebhookError, response::bad_request};
use crate::{
    WebhookServerOptions, constants::ADMISSION_REVIEW_VERSION,
    webhooks::create_webhook_client_config,
};

#[derive(Debug, Snafu)]
pub enum MutatingWebhookError {
    #[snafu(display(
        "webhook {webhook_name:?} must only accept AdmissionReview version {ADMISSION_REVIEW_VERSION:?}, got {versions:?}"
    ))]
    UnsupportedAdmissionReviewVersions {
        webhook_name: String,
        versions: Vec<String>,
    },

    #[snafu(display("failed to patch MutatingWebhookConfiguration {mwc_name:?}"))]
    PatchMutatingWebhookConfiguration {
        source: kube::Error,
        mwc_name: String,
    },
}

/// Mutating webhook, which lets you intercept object creations/modifications and modify the
/// object on the fly.
///
/// As the webhook is typed with the Resource type `R`, it can only handle a single resource
/// mutation. Use multiple [`MutatingWebhook`]s if you need to mutate multiple resource kinds.
///
/// ### Example usage
///
/// ```no_run
/// use std::sync::Arc;
///
/// use k8s_openapi::api::{
///     admissionregistration::v1::{self, MutatingWebhookConfiguration},
///     core::v1::Pod,
/// };
/// use kube::{
///     Client,
///     core::admission::{AdmissionRequest, AdmissionResponse},
/// };
/// use sidecargo_webhook::{
///     WebhookServer, WebhookServerOptions,
///     webhooks::{MutatingWebhook, MutatingWebhookOptions},
/// };
///
/// # async fn docs() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::try_default().await?;
/// let ctx = Arc::new(());
///
/// let mutating_webhook = MutatingWebhook::new(
///     MutatingWebhookConfiguration {
///         webhooks: Some(vec![v1::MutatingWebhook {
///             name: "mpod.example.com".to_owned(),
///             admission_review_versions: vec!["v1".to_owned()],
///             ..Default::default()
///         }]),
///         ..Default::default()
///     },
///     my_handler,
///     ctx,
///     client,
///     MutatingWebhookOptions {
///         disable_mwc_maintenance: true,
///         field_manager: "my-field-manager".to_owned(),
///     },
/// )?;
///
/// let webhook_server =
///     WebhookServer::new(vec![Box::new(mutating_webhook)], WebhookServerOptions::default())
///         .await?;
/// webhook_server.run().await?;
/// # Ok(())
/// # }
///
/// // Basic no-op implementation
/// pub async fn my_handler(_ctx: Arc<()>, request: AdmissionRequest<Pod>) -> AdmissionResponse {
///     AdmissionResponse::from(&request)
/// }
/// ```
pub struct MutatingWebhook<H, S, R> {
    options: MutatingWebhookOptions,

    /// The [`MutatingWebhookConfiguration`] that is applied to the Kubernetes cluster.
    ///
    /// The clientConfig of all contained webhooks is set to the same service, port and HTTP
    /// path. All of them need to set `admissionReviewVersions` to `["v1"]`.
    mutating_webhook_configuration: MutatingWebhookConfiguration,

    /// The async handler that gets an [`AdmissionRequest`] and returns an [`AdmissionResponse`]
    handler: H,

    /// The state passed to every handler invocation.
    handler_state: Arc<S>,

    /// The Kubernetes client used to maintain the MutatingWebhookConfiguration
    client: Client,

    _resource: PhantomData<R>,
}

/// Configuration of a [`MutatingWebhook`], which is passed to [`MutatingWebhook::new`]
#[derive(Clone, Debug)]
pub struct MutatingWebhookOptions {
    /// Whether the MutatingWebhookConfiguration should be left untouched
    pub disable_mwc_maintenance: bool,

    /// The field manager used when maintaining the MutatingWebhookConfiguration
    pub field_manager: String,
}

impl<H, S, R> MutatingWebhook<H, S, R> {
    pub fn new(
        mutating_webhook_configuration: MutatingWebhookConfiguration,
        handler: H,
        handler_state: Arc<S>,
        client: Client,
        options: MutatingWebhookOptions,
    ) -> Result<Self, MutatingWebhookError> {
        // We decide how the JSON is deserialized, so only v1 reviews can be accepted
        check_admission_review_versions(&mutating_webhook_configuration)?;

        Ok(Self {
            options,
            mutating_webhook_configuration,
            handler,
            handler_state,
            client,
            _resource: PhantomData,
        })
    }

    fn http_path(&self) -> String {
        http_path(&self.mutating_webhook_configuration.name_any())
    }
}

#[async_trait]
impl<H, S, R, Fut> Webhook for MutatingWebhook<H, S, R>
where
    H: Fn(Arc<S>, AdmissionRequest<R>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = AdmissionResponse> + Send + 'static,
    R: Resource + Send + Sync + DeserializeOwned + Serialize + 'static,
    S: Send + Sync + 'static,
{
    fn register_routes(&self, router: Router) -> Router {
        let handler_state = self.handler_state.clone();
        let handler = self.handler.clone();
        // The body is decoded by hand, as the API server expects an AdmissionReview even for
        // requests that could not be decoded.
        let handler_fn = |body: Bytes| async move {
            let response = match decode_request::<R>(&body) {
                Ok(request) => handler(handler_state, request).await,
                Err(response) => response,
            };

            Json(response.into_review())
        };

        let route = self.http_path();
        tracing::debug!(route, "registering route for mutating webhook");
        router.route(&route, post(handler_fn))
    }

    fn ignore_configuration_maintenance(&self) -> bool {
        self.options.disable_mwc_maintenance
    }

    #[instrument(skip(self, ca_bundle, options))]
    async fn maintain_configuration(
        &mut self,
        ca_bundle: &ByteString,
        options: &WebhookServerOptions,
    ) -> Result<(), WebhookError> {
        let mut mutating_webhook_configuration = self.mutating_webhook_configuration.clone();
        let mwc_name = mutating_webhook_configuration.name_any();
        tracing::info!(
            k8s.mutatingwebhookconfiguration.name = mwc_name,
            "applying mutating webhook configuration"
        );

        let http_path = self.http_path();
        for webhook in mutating_webhook_configuration.webhooks.iter_mut().flatten() {
            webhook.client_config =
                create_webhook_client_config(options, ca_bundle.clone(), http_path.clone());
        }

        let mwc_api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let patch = Patch::Apply(&mutating_webhook_configuration);
        let patch_params = PatchParams::apply(&self.options.field_manager);

        mwc_api
            .patch(&mwc_name, &patch_params, &patch)
            .await
            .with_context(|_| PatchMutatingWebhookConfigurationSnafu { mwc_name })?;

        Ok(())
    }
}

/// Decodes an AdmissionReview body into its request, or returns the response rejecting it
/// with code 400.
fn decode_request<R>(body: &[u8]) -> Result<AdmissionRequest<R>, AdmissionResponse>
where
    R: Resource + DeserializeOwned,
{
    let review: AdmissionReview<R> = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(err) => {
            tracing::warn!(%err, "failed to decode admission review");
            return Err(bad_request(
                request_uid(body).as_deref(),
                format!("failed to decode admission review: {err}"),
            ));
        }
    };

    review
        .try_into()
        .map_err(|err| bad_request(None, format!("failed to convert to request: {err}")))
}

/// Recovers `request.uid` from a body which does not decode as a whole.
fn request_uid(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .pointer("/request/uid")
        .and_then(serde_json::Value::as_str)
        .map(ToOwned::to_owned)
}

fn http_path(mutating_webhook_configuration_name: &str) -> String {
    format!("/mutate/{mutating_webhook_configuration_name}")
}

fn check_admission_review_versions(
    mutating_webhook_configuration: &MutatingWebhookConfiguration,
) -> Result<(), MutatingWebhookError> {
    for webhook in mutating_webhook_configuration.webhooks.iter().flatten() {
        ensure!(
            webhook.admission_review_versions == [ADMISSION_REVIEW_VERSION],
            UnsupportedAdmissionReviewVersionsSnafu {
                webhook_name: &webhook.name,
                versions: webhook.admission_review_versions.clone(),
            }
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{admissionregistration::v1, core::v1::Pod};
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn configuration(versions: &[&str]) -> MutatingWebhookConfiguration {
        MutatingWebhookConfiguration {
            webhooks: Some(vec![v1::MutatingWebhook {
                name: "mpod.example.com".to_owned(),
                admission_review_versions: versions.iter().map(|v| (*v).to_owned()).collect(),
                ..v1::MutatingWebhook::default()
            }]),
            ..MutatingWebhookConfiguration::default()
        }
    }

    #[rstest]
    #[case(&["v1"], true)]
    #[case(&["v1beta1"], false)]
    #[case(&["v1", "v1beta1"], false)]
    #[case(&[], false)]
    fn admission_review_versions(#[case] versions: &[&str], #[case] valid: bool) {
        let result = check_admission_review_versions(&configuration(versions));
        assert_eq!(result.is_ok(), valid);
    }

    #[test]
    fn configuration_without_webhooks_is_accepted() {
        let result = check_admission_review_versions(&MutatingWebhookConfiguration::default());
        assert!(result.is_ok());
    }

    #[test]
    fn http_path_contains_configuration_name() {
        assert_eq!(
            http_path("sidecargo-mutating-webhook"),
            "/mutate/sidecargo-mutating-webhook"
        );
    }

    fn review_body(object: serde_json::Value) -> Vec<u8> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "requestKind": { "group": "", "version": "v1", "kind": "Pod" },
                "requestResource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": { "username": "admin" },
                "object": object,
                "dryRun": false,
            },
        });
        serde_json::to_vec(&review).expect("review serializes")
    }

    #[test]
    fn decode_valid_request() {
        let body = review_body(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "containers": [{ "name": "app", "image": "nginx" }] },
        }));

        let request = decode_request::<Pod>(&body).expect("request decodes");
        assert_eq!(request.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(request.object.is_some());
    }

    #[test]
    fn undecodable_object_is_bad_request() {
        let body = review_body(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web" },
            "spec": { "containers": "not a list" },
        }));

        let response = decode_request::<Pod>(&body).expect_err("object does not decode");
        assert!(!response.allowed);
        assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response.result.code, 400);
    }

    #[rstest]
    #[case(b"not json".as_slice())]
    #[case(br#"{"apiVersion":"admission.k8s.io/v1","kind":"AdmissionReview"}"#.as_slice())]
    fn malformed_body_is_bad_request(#[case] body: &[u8]) {
        let response = decode_request::<Pod>(body).expect_err("body is rejected");
        assert!(!response.allowed);
        assert_eq!(response.uid, "");
        assert_eq!(response.result.code, 400);

        // The rejection is still a well-formed AdmissionReview
        let review = serde_json::to_value(response.into_review()).expect("review serializes");
        assert_eq!(review["kind"], "AdmissionReview");
        assert_eq!(review["response"]["status"]["code"], 400);
    }
}
