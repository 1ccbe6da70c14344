//! Utility types and functions to create ready-to-use admission webhook
//! servers. All webhook servers use HTTPS. This library is fully compatible
//! with the [`tracing`] crate and emits debug level tracing data.
//!
//! Most users will only use the top-level exported [`WebhookServer`], which
//! serves one or more [`Webhook`]s:
//!
//! ```no_run
//! use sidecargo_webhook::{WebhookServer, WebhookServerOptions};
//!
//! # async fn docs() -> Result<(), sidecargo_webhook::WebhookServerError> {
//! let options = WebhookServerOptions::builder()
//!     .bind_address([127, 0, 0, 1], 8443)
//!     .webhook_service("sidecargo-operator", "sidecargo")
//!     .generate_certificate(Some("/certs".into()))
//!     .build();
//!
//! let server = WebhookServer::new(vec![], options).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
use axum::{Router, routing::get};
use futures_util::{FutureExt as _, pin_mut, select};
use k8s_openapi::ByteString;
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{SignalKind, signal};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    tls::{TlsServer, certificate::ServerCertificate},
    webhooks::Webhook,
};

pub mod constants;
pub mod options;
pub mod tls;
pub mod webhooks;

// Selected re-exports
pub use crate::options::WebhookServerOptions;

/// A result type alias with the [`WebhookServerError`] type as the default error type.
pub type Result<T, E = WebhookServerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WebhookServerError {
    #[snafu(display("failed to load TLS certificate"))]
    LoadCertificate {
        source: tls::certificate::CertificateError,
    },

    #[snafu(display("failed to create TLS server"))]
    CreateTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to run TLS server"))]
    RunTlsServer { source: tls::TlsServerError },

    #[snafu(display("failed to maintain webhook configuration"))]
    MaintainWebhookConfiguration { source: webhooks::WebhookError },

    #[snafu(display("failed to create {signal} listener"))]
    CreateSignalListener {
        source: std::io::Error,
        signal: &'static str,
    },
}

/// A ready-to-use webhook server.
///
/// This server abstracts away lower-level details like TLS termination and
/// request tracing. The routes and their handlers are contributed by the
/// [`Webhook`]s passed to [`WebhookServer::new`].
pub struct WebhookServer {
    options: WebhookServerOptions,
    webhooks: Vec<Box<dyn Webhook + Send + Sync>>,
    tls_server: TlsServer,
    ca_bundle: Option<ByteString>,
}

impl WebhookServer {
    /// Creates a new ready-to-use webhook server.
    ///
    /// The server listens on the socket address provided via the
    /// [`WebhookServerOptions`] and presents either the certificate read from
    /// the configured PEM files or a freshly generated one. To start the
    /// server, use [`WebhookServer::run`].
    pub async fn new(
        webhooks: Vec<Box<dyn Webhook + Send + Sync>>,
        options: WebhookServerOptions,
    ) -> Result<Self> {
        tracing::trace!("create new webhook server");

        let mut router = Router::new();
        for webhook in &webhooks {
            router = webhook.register_routes(router);
        }

        // Use a service builder to provide multiple layers at once. Recommended
        // by the Axum project.
        //
        // See https://docs.rs/axum/latest/axum/middleware/index.html#applying-multiple-middleware
        let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());

        let router = router
            .layer(service_builder)
            // The health route is below the TraceLayer so as not to be instrumented
            .route("/health", get(|| async { "ok" }));

        let certificate =
            ServerCertificate::load(&options.tls, options.subject_alternative_names())
                .await
                .context(LoadCertificateSnafu)?;

        tracing::debug!("create TLS server");
        let tls_server = TlsServer::new(
            options.socket_addr,
            router,
            certificate.certificate_chain,
            certificate.private_key,
        )
        .context(CreateTlsServerSnafu)?;

        Ok(Self {
            options,
            webhooks,
            tls_server,
            ca_bundle: certificate.ca_bundle,
        })
    }

    /// Applies the webhook configurations and runs the server until SIGINT or
    /// SIGTERM is received.
    ///
    /// This does not implement graceful shutdown of the underlying server.
    pub async fn run(mut self) -> Result<()> {
        self.maintain_configurations().await?;

        let mut sigint = signal(SignalKind::interrupt())
            .context(CreateSignalListenerSnafu { signal: "SIGINT" })?;
        let mut sigterm = signal(SignalKind::terminate())
            .context(CreateSignalListenerSnafu { signal: "SIGTERM" })?;
        tracing::debug!("created unix signal handlers");

        let future_server = self.tls_server.run().fuse();
        let future_signal = async {
            select! {
                signal = sigint.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGINT");
                    }
                },
                signal = sigterm.recv().fuse() => {
                    if signal.is_some() {
                        tracing::debug!("received SIGTERM");
                    }
                },
            };
        }
        .fuse();

        pin_mut!(future_server);
        pin_mut!(future_signal);

        select! {
            result = future_server => result.context(RunTlsServerSnafu),
            () = future_signal => Ok(()),
        }
    }

    /// Points all webhook configurations at this server, unless the CA
    /// bundle which signed the server certificate is unknown.
    async fn maintain_configurations(&mut self) -> Result<()> {
        let Some(ca_bundle) = &self.ca_bundle else {
            tracing::info!("no CA bundle known, skipping webhook configuration maintenance");
            return Ok(());
        };

        for webhook in &mut self.webhooks {
            if webhook.ignore_configuration_maintenance() {
                continue;
            }

            webhook
                .maintain_configuration(ca_bundle, &self.options)
                .await
                .context(MaintainWebhookConfigurationSnafu)?;
        }

        Ok(())
    }
}
