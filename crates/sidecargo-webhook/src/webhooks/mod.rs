use async_trait::async_trait;
use axum::Router;
use k8s_openapi::{
    ByteString,
    api::admissionregistration::v1::{ServiceReference, WebhookClientConfig},
};
pub use mutating_webhook::{MutatingWebhook, MutatingWebhookError, MutatingWebhookOptions};
use snafu::Snafu;

use crate::WebhookServerOptions;

mod mutating_webhook;
pub mod response;

#[derive(Snafu, Debug)]
pub enum WebhookError {
    #[snafu(display("mutating webhook error"), context(false))]
    MutatingWebhookError {
        source: mutating_webhook::MutatingWebhookError,
    },
}

/// An admission webhook served by the [`WebhookServer`][crate::WebhookServer]
/// needs to implement this trait.
//
// async-trait is still required, as async functions in traits are not dyn
// compatible.
#[async_trait]
pub trait Webhook {
    /// The webhook can add arbitrary routes to the passed [`Router`] and needs to return the
    /// resulting [`Router`].
    fn register_routes(&self, router: Router) -> Router;

    /// Whether [`Self::maintain_configuration`] should be called or not.
    fn ignore_configuration_maintenance(&self) -> bool;

    /// Applies the webhook configuration object to the cluster, pointing it at
    /// this server and trusting `ca_bundle`.
    async fn maintain_configuration(
        &mut self,
        ca_bundle: &ByteString,
        options: &WebhookServerOptions,
    ) -> Result<(), WebhookError>;
}

/// Returns the client config that can be used in admission webhooks.
///
/// It is used to contact the correct HTTP endpoint, which is determined from the given parameters.
/// A configured webhook URL is used verbatim and takes precedence over the Service, so
/// `http_path` only applies to the latter.
fn create_webhook_client_config(
    options: &WebhookServerOptions,
    ca_bundle: ByteString,
    http_path: impl Into<String>,
) -> WebhookClientConfig {
    // Here, ByteString takes care of encoding the provided content as base64.
    let ca_bundle = Some(ca_bundle);

    if let Some(url) = &options.webhook_url {
        return WebhookClientConfig {
            service: None,
            ca_bundle,
            url: Some(url.to_string()),
        };
    }

    WebhookClientConfig {
        service: Some(ServiceReference {
            name: options.webhook_service_name.clone(),
            namespace: options.webhook_namespace.clone(),
            path: Some(http_path.into()),
            port: Some(options.socket_addr.port().into()),
        }),
        ca_bundle,
        url: None,
    }
}
