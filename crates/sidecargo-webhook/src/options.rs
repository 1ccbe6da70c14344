//! Contains available options to configure the [WebhookServer][crate::WebhookServer].
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use url::{Host, Url};

use crate::{constants::DEFAULT_SOCKET_ADDRESS, tls::certificate::SubjectAlternativeNames};

/// Specifies available webhook server options.
///
/// The [`Default`] implementation for this struct contains the following values:
///
/// - The socket binds to 0.0.0.0 on port 8443 (HTTPS)
/// - A self-signed certificate is generated on startup and kept in memory
/// - Webhook configurations point at a Service, not at a URL
///
/// ### Example with Custom HTTPS IP Address and Port
///
/// ```
/// use sidecargo_webhook::WebhookServerOptions;
///
/// // Set IP address and port at the same time
/// let options = WebhookServerOptions::builder()
///     .bind_address([0, 0, 0, 0], 12345)
///     .build();
///
/// // Set port only
/// let options = WebhookServerOptions::builder()
///     .bind_port(12345)
///     .build();
/// assert_eq!(options.socket_addr.port(), 12345);
/// ```
#[derive(Clone, Debug)]
pub struct WebhookServerOptions {
    /// The HTTPS socket address the [`TcpListener`][tokio::net::TcpListener]
    /// binds to.
    pub socket_addr: SocketAddr,

    /// Where the certificate presented by the server comes from.
    pub tls: TlsCertificateSource,

    /// If set, webhook configurations contact the server at this URL instead
    /// of going through the Service.
    pub webhook_url: Option<Url>,

    /// The name of the Kubernetes Service pointing at this server.
    pub webhook_service_name: String,

    /// The namespace of the Kubernetes Service pointing at this server.
    pub webhook_namespace: String,
}

/// The source of the TLS certificate presented by the webhook server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsCertificateSource {
    /// PEM files provisioned by someone else, for example cert-manager.
    Files {
        certificate_path: PathBuf,
        private_key_path: PathBuf,

        /// PEM encoded CA bundle which signed the server certificate. It is
        /// put into the `caBundle` of maintained webhook configurations.
        /// Without it, webhook configurations are not maintained.
        ca_bundle_path: Option<PathBuf>,
    },

    /// A CA and server certificate generated on startup. The files are
    /// additionally written to `output_dir` if it is set.
    Generated { output_dir: Option<PathBuf> },
}

impl Default for TlsCertificateSource {
    fn default() -> Self {
        Self::Generated { output_dir: None }
    }
}

impl Default for WebhookServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WebhookServerOptions {
    /// Returns the default [`WebhookServerOptionsBuilder`] which allows to
    /// selectively customize the options.
    pub fn builder() -> WebhookServerOptionsBuilder {
        WebhookServerOptionsBuilder::default()
    }

    /// Returns the names a generated server certificate must be valid for:
    /// `<service>.<namespace>.svc` and the host of the webhook URL, if any.
    pub fn subject_alternative_names(&self) -> SubjectAlternativeNames {
        let mut names = SubjectAlternativeNames::default();

        if !self.webhook_service_name.is_empty() && !self.webhook_namespace.is_empty() {
            names.dns_names.push(format!(
                "{}.{}.svc",
                self.webhook_service_name, self.webhook_namespace
            ));
        }

        match self.webhook_url.as_ref().and_then(Url::host) {
            Some(Host::Domain(domain)) => names.dns_names.push(domain.to_owned()),
            Some(Host::Ipv4(ip)) => names.ip_addresses.push(ip.into()),
            Some(Host::Ipv6(ip)) => names.ip_addresses.push(ip.into()),
            None => {}
        }

        names
    }
}

/// The [`WebhookServerOptionsBuilder`] which allows to selectively customize
/// the webhook server [`WebhookServerOptions`].
#[derive(Debug, Default)]
pub struct WebhookServerOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    tls: Option<TlsCertificateSource>,
    webhook_url: Option<Url>,
    webhook_service_name: Option<String>,
    webhook_namespace: Option<String>,
}

impl WebhookServerOptionsBuilder {
    /// Sets the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    /// Sets the IP address of the socket address the webhook server uses to
    /// bind for HTTPS.
    pub fn bind_ip(mut self, bind_ip: impl Into<IpAddr>) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_ip(bind_ip.into());
        self
    }

    /// Sets the port of the socket address the webhook server uses to bind
    /// for HTTPS.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_port(bind_port);
        self
    }

    pub fn socket_addr(mut self, socket_addr: SocketAddr) -> Self {
        self.socket_addr = Some(socket_addr);
        self
    }

    /// Presents the certificate chain and private key read from PEM files.
    pub fn tls_files(
        mut self,
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
        ca_bundle_path: Option<PathBuf>,
    ) -> Self {
        self.tls = Some(TlsCertificateSource::Files {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
            ca_bundle_path,
        });
        self
    }

    /// Generates a self-signed certificate on startup, optionally writing it
    /// to `output_dir`.
    pub fn generate_certificate(mut self, output_dir: Option<PathBuf>) -> Self {
        self.tls = Some(TlsCertificateSource::Generated { output_dir });
        self
    }

    pub fn webhook_url(mut self, url: Option<Url>) -> Self {
        self.webhook_url = url;
        self
    }

    pub fn webhook_service(
        mut self,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        self.webhook_service_name = Some(name.into());
        self.webhook_namespace = Some(namespace.into());
        self
    }

    /// Builds the final [`WebhookServerOptions`] by using default values for
    /// any not explicitly set option.
    pub fn build(self) -> WebhookServerOptions {
        WebhookServerOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            tls: self.tls.unwrap_or_default(),
            webhook_url: self.webhook_url,
            webhook_service_name: self.webhook_service_name.unwrap_or_default(),
            webhook_namespace: self.webhook_namespace.unwrap_or_default(),
        }
    }
}
