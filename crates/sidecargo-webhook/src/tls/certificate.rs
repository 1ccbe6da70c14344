//! The certificate presented by the [`TlsServer`](super::TlsServer), either
//! read from PEM files or generated when the server starts.
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use k8s_openapi::ByteString;
use sidecargo_certs::{
    CertificatePair, CertificatePairError,
    ca::{self, CertificateAuthority, DEFAULT_CA_SUBJECT, DEFAULT_CA_VALIDITY, DEFAULT_CERTIFICATE_VALIDITY},
};
use snafu::{ResultExt, Snafu, ensure};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use tracing::instrument;

use crate::options::TlsCertificateSource;

/// File name of the server certificate chain inside a certificate directory.
pub const CERTIFICATE_FILE_NAME: &str = "tls.crt";

/// File name of the server private key inside a certificate directory.
pub const PRIVATE_KEY_FILE_NAME: &str = "tls.key";

/// File name of the generated CA certificate inside a certificate directory.
pub const CA_CERTIFICATE_FILE_NAME: &str = "ca.crt";

const LEAF_CERTIFICATE_SUBJECT: &str = "CN=sidecargo-webhook,O=sidecargo";

pub type Result<T, E = CertificateError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CertificateError {
    #[snafu(display("failed to read file {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse PEM encoded certificate chain from {path:?}"))]
    ParseCertificateChain {
        source: tokio_rustls::rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("no certificate found in {path:?}"))]
    NoCertificate { path: PathBuf },

    #[snafu(display("failed to parse PEM encoded private key from {path:?}"))]
    ParsePrivateKey {
        source: tokio_rustls::rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create CA to sign the webhook certificate"))]
    CreateCertificateAuthority { source: ca::Error },

    #[snafu(display("failed to generate webhook leaf certificate"))]
    GenerateLeafCertificate { source: ca::Error },

    #[snafu(display("failed to encode generated certificate"))]
    EncodeCertificate { source: CertificatePairError },

    #[snafu(display("failed to create certificate directory {path:?}"))]
    CreateCertificateDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write file {path:?}"))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to run task in blocking thread"))]
    TokioSpawnBlocking { source: tokio::task::JoinError },
}

/// The names a generated server certificate is valid for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectAlternativeNames {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

/// A certificate chain with its private key, plus the CA bundle clients need
/// to trust it if that is known.
#[derive(Debug)]
pub struct ServerCertificate {
    pub certificate_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,

    /// PEM encoded CA certificate(s), as expected by `caBundle` fields.
    pub ca_bundle: Option<ByteString>,
}

impl ServerCertificate {
    pub async fn load(
        source: &TlsCertificateSource,
        subject_alternative_names: SubjectAlternativeNames,
    ) -> Result<Self> {
        match source {
            TlsCertificateSource::Files {
                certificate_path,
                private_key_path,
                ca_bundle_path,
            } => {
                Self::from_files(certificate_path, private_key_path, ca_bundle_path.as_deref())
                    .await
            }
            TlsCertificateSource::Generated { output_dir } => {
                Self::generate(subject_alternative_names, output_dir.as_deref()).await
            }
        }
    }

    /// Reads a PEM encoded certificate chain and private key. Without
    /// `ca_bundle_path` the CA bundle stays unknown.
    #[instrument(name = "read_server_certificate")]
    pub async fn from_files(
        certificate_path: &Path,
        private_key_path: &Path,
        ca_bundle_path: Option<&Path>,
    ) -> Result<Self> {
        let certificate_chain = read_certificate_chain(certificate_path).await?;
        let private_key = read_private_key(private_key_path).await?;

        let ca_bundle = match ca_bundle_path {
            Some(path) => {
                let pem = tokio::fs::read(path).await.context(ReadFileSnafu { path })?;
                Some(ByteString(pem))
            }
            None => None,
        };

        Ok(Self {
            certificate_chain,
            private_key,
            ca_bundle,
        })
    }

    /// Generates a self-signed CA and a server certificate signed by it.
    ///
    /// If `output_dir` is set, the server certificate, its private key and
    /// the CA certificate are written into it as PEM files.
    #[instrument(name = "generate_server_certificate", skip(subject_alternative_names))]
    pub async fn generate(
        subject_alternative_names: SubjectAlternativeNames,
        output_dir: Option<&Path>,
    ) -> Result<Self> {
        // Key generation and signing can take a while, so we use `spawn_blocking`
        let (ca, certificate) = tokio::task::spawn_blocking(move || -> Result<_> {
            let ca = CertificateAuthority::new(DEFAULT_CA_SUBJECT, DEFAULT_CA_VALIDITY)
                .context(CreateCertificateAuthoritySnafu)?;
            let certificate = ca
                .generate_leaf_certificate(
                    LEAF_CERTIFICATE_SUBJECT,
                    subject_alternative_names.dns_names.iter().map(String::as_str),
                    &subject_alternative_names.ip_addresses,
                    DEFAULT_CERTIFICATE_VALIDITY,
                )
                .context(GenerateLeafCertificateSnafu)?;

            Ok((ca, certificate))
        })
        .await
        .context(TokioSpawnBlockingSnafu)??;

        let ca_pem = ca
            .certificate_pair()
            .certificate_pem()
            .context(EncodeCertificateSnafu)?;

        if let Some(output_dir) = output_dir {
            write_pem_files(output_dir, &certificate, &ca_pem).await?;
            tracing::info!(?output_dir, "wrote generated certificate files");
        }

        Ok(Self {
            certificate_chain: vec![certificate.certificate_der().context(EncodeCertificateSnafu)?],
            private_key: certificate.private_key_der().context(EncodeCertificateSnafu)?,
            ca_bundle: Some(ByteString(ca_pem.into_bytes())),
        })
    }
}

async fn read_certificate_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = tokio::fs::read(path).await.context(ReadFileSnafu { path })?;

    let certificate_chain = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .context(ParseCertificateChainSnafu { path })?;
    ensure!(!certificate_chain.is_empty(), NoCertificateSnafu { path });

    Ok(certificate_chain)
}

async fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = tokio::fs::read(path).await.context(ReadFileSnafu { path })?;
    PrivateKeyDer::from_pem_slice(&pem).context(ParsePrivateKeySnafu { path })
}

async fn write_pem_files(
    output_dir: &Path,
    certificate: &CertificatePair,
    ca_pem: &str,
) -> Result<()> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .context(CreateCertificateDirectorySnafu { path: output_dir })?;

    let certificate_pem = certificate
        .certificate_pem()
        .context(EncodeCertificateSnafu)?;
    let private_key_pem = certificate
        .private_key_pem()
        .context(EncodeCertificateSnafu)?;

    for (file_name, content) in [
        (CERTIFICATE_FILE_NAME, certificate_pem.as_bytes()),
        (PRIVATE_KEY_FILE_NAME, private_key_pem.as_bytes()),
        (CA_CERTIFICATE_FILE_NAME, ca_pem.as_bytes()),
    ] {
        let path = output_dir.join(file_name);
        tokio::fs::write(&path, content)
            .await
            .context(WriteFileSnafu { path: &path })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::Ipv4Addr};

    use super::*;

    const NOT_PEM: &str = "this is not a certificate\n";

    fn file_with(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file can be created");
        file.write_all(content.as_bytes())
            .expect("temp file is writable");
        file
    }

    fn names() -> SubjectAlternativeNames {
        SubjectAlternativeNames {
            dns_names: vec!["sidecargo-operator.sidecargo.svc".to_owned()],
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }

    #[tokio::test]
    async fn missing_certificate_file() {
        let err = read_certificate_chain(Path::new("/does/not/exist.crt"))
            .await
            .unwrap_err();
        assert!(matches!(err, CertificateError::ReadFile { .. }));
    }

    #[tokio::test]
    async fn certificate_file_without_pem_blocks() {
        let file = file_with(NOT_PEM);
        let err = read_certificate_chain(file.path()).await.unwrap_err();
        assert!(matches!(err, CertificateError::NoCertificate { .. }));
    }

    #[tokio::test]
    async fn private_key_file_without_pem_blocks() {
        let file = file_with(NOT_PEM);
        let err = read_private_key(file.path()).await.unwrap_err();
        assert!(matches!(err, CertificateError::ParsePrivateKey { .. }));
    }

    #[tokio::test]
    async fn generated_certificate_comes_with_ca_bundle() {
        let certificate = ServerCertificate::generate(names(), None)
            .await
            .expect("certificate is generated");

        assert_eq!(certificate.certificate_chain.len(), 1);

        let ca_bundle = certificate.ca_bundle.expect("CA bundle is known");
        let ca_bundle = String::from_utf8(ca_bundle.0).expect("CA bundle is PEM");
        assert!(ca_bundle.starts_with("-----BEGIN CERTIFICATE-----\n"));
    }

    #[tokio::test]
    async fn generated_certificate_can_be_read_back() {
        let dir = tempfile::tempdir().expect("temp dir can be created");
        let output_dir = dir.path().join("certs");

        let generated = ServerCertificate::generate(names(), Some(&output_dir))
            .await
            .expect("certificate is generated");

        let source = TlsCertificateSource::Files {
            certificate_path: output_dir.join(CERTIFICATE_FILE_NAME),
            private_key_path: output_dir.join(PRIVATE_KEY_FILE_NAME),
            ca_bundle_path: Some(output_dir.join(CA_CERTIFICATE_FILE_NAME)),
        };
        let read = ServerCertificate::load(&source, SubjectAlternativeNames::default())
            .await
            .expect("written files can be read");

        assert_eq!(read.certificate_chain, generated.certificate_chain);
        assert_eq!(
            read.private_key.secret_der(),
            generated.private_key.secret_der()
        );
        assert_eq!(read.ca_bundle, generated.ca_bundle);
    }
}
