//! Command line options of the `sidecargo-operator` binary, parsed with `clap`.
use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use sidecargo_webhook::{WebhookServerOptions, constants::DEFAULT_SOCKET_ADDRESS};
use url::Url;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "sidecargo-operator",
    version,
    about = "Injects sidecar containers into Pods based on SidecarGo templates"
)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command {
    /// Print the SidecarGo CustomResourceDefinition as YAML.
    Crd,

    /// Watch SidecarGo templates and serve the Pod mutating webhook.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Only watch SidecarGo templates in this namespace. Watches all
    /// namespaces if empty.
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Write log output to rolling files in this directory, in addition to
    /// stdout.
    #[arg(long, env = "SIDECARGO_LOG_DIRECTORY")]
    pub log_directory: Option<PathBuf>,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub webhook: WebhookOptions,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Webhook Options")]
pub struct WebhookOptions {
    /// The socket address the HTTPS webhook server binds to.
    #[arg(long, env, default_value_t = DEFAULT_SOCKET_ADDRESS)]
    pub webhook_bind_address: SocketAddr,

    /// PEM encoded certificate chain presented by the webhook server.
    ///
    /// Without it, a self-signed certificate is generated on startup.
    #[arg(long, env, requires = "webhook_tls_key_file")]
    pub webhook_tls_cert_file: Option<PathBuf>,

    /// PEM encoded private key of the webhook server certificate.
    #[arg(long, env, requires = "webhook_tls_cert_file")]
    pub webhook_tls_key_file: Option<PathBuf>,

    /// PEM encoded CA bundle which signed the certificate given by
    /// `--webhook-tls-cert-file`.
    ///
    /// With certificate files, the MutatingWebhookConfiguration is only maintained if this is
    /// set. A generated certificate always comes with its CA bundle.
    #[arg(long, env, requires = "webhook_tls_cert_file")]
    pub webhook_ca_file: Option<PathBuf>,

    /// Directory the generated certificate, its key and CA are written to as `tls.crt`, `tls.key`
    /// and `ca.crt`.
    #[arg(long, env, conflicts_with = "webhook_tls_cert_file")]
    pub webhook_cert_dir: Option<PathBuf>,

    /// URL the API server uses to contact the webhook, instead of the Service.
    ///
    /// Its host is added to the generated certificate.
    #[arg(long, env)]
    pub webhook_url: Option<Url>,

    /// Name of the Service pointing at the webhook server.
    #[arg(long, env, default_value = "sidecargo-operator")]
    pub webhook_service_name: String,

    /// Namespace of the Service pointing at the webhook server.
    #[arg(long, env, default_value = "default")]
    pub webhook_namespace: String,

    /// Don't maintain the MutatingWebhookConfiguration the operator is responsible for.
    ///
    /// Maintenance includes creating the configuration initially and keeping the CA bundle up to
    /// date. Turning this off can be desirable to reduce the RBAC permissions of the operator.
    #[arg(long, env)]
    pub disable_mwc_maintenance: bool,

    /// The field manager used for server-side apply.
    #[arg(long, env, default_value = "sidecargo-operator")]
    pub field_manager: String,
}

impl WebhookOptions {
    pub fn server_options(&self) -> WebhookServerOptions {
        let builder = WebhookServerOptions::builder()
            .socket_addr(self.webhook_bind_address)
            .webhook_service(&self.webhook_service_name, &self.webhook_namespace)
            .webhook_url(self.webhook_url.clone());

        let builder = match (&self.webhook_tls_cert_file, &self.webhook_tls_key_file) {
            (Some(certificate_path), Some(private_key_path)) => builder.tls_files(
                certificate_path,
                private_key_path,
                self.webhook_ca_file.clone(),
            ),
            _ => builder.generate_certificate(self.webhook_cert_dir.clone()),
        };

        builder.build()
    }
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::All
        } else {
            Self::One(s.to_owned())
        }
    }
}

impl WatchNamespace {
    /// Gets an API object for the namespace in question or for all namespaces,
    /// depending on which variant we are.
    pub fn get_api<T>(&self, client: &Client) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            Self::All => Api::all(client.clone()),
            Self::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}
