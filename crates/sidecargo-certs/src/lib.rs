//! This crate provides types and functions to work with X.509 TLS
//! certificates. It creates self-signed certificate authorities (CAs) which
//! sign the leaf certificate presented by the webhook server.
//!
//! All keys are ECDSA keys on the NIST P-256 curve, see [`keys`].
//!
//! ```
//! use std::time::Duration;
//!
//! use sidecargo_certs::ca::{CertificateAuthority, DEFAULT_CA_SUBJECT};
//!
//! let ca = CertificateAuthority::new(DEFAULT_CA_SUBJECT, Duration::from_secs(3600))
//!     .expect("failed to create CA");
//! let certificate = ca
//!     .generate_leaf_certificate(
//!         "CN=sidecargo-webhook",
//!         ["sidecargo-operator.default.svc"],
//!         &[],
//!         Duration::from_secs(1800),
//!     )
//!     .expect("failed to create leaf certificate");
//!
//! assert!(certificate.certificate_pem().unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
//! ```
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
use p256::pkcs8::EncodePrivateKey;
use snafu::{ResultExt, Snafu};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_cert::{
    Certificate,
    der::{Encode, EncodePem},
};
use zeroize::Zeroizing;

use crate::{ca::PEM_LINE_ENDING, keys::SigningKey};

pub mod ca;
pub mod keys;

/// Error variants which can be encountered when encoding a
/// [`CertificatePair`].
#[derive(Debug, Snafu)]
pub enum CertificatePairError {
    #[snafu(display("failed to serialize certificate as {key_encoding}"))]
    SerializeCertificate {
        source: x509_cert::der::Error,
        key_encoding: KeyEncoding,
    },

    #[snafu(display("failed to serialize private key as PKCS8 {key_encoding}"))]
    SerializePrivateKey {
        source: p256::pkcs8::Error,
        key_encoding: KeyEncoding,
    },
}

/// Contains the certificate and the signing / embedded key pair.
///
/// A [`CertificateAuthority`](crate::ca::CertificateAuthority) uses this struct
/// internally to store the key pair which signs the CA itself (self-signed)
/// and all leaf certificates. Leaf certificates on the other hand use this to
/// store the bound key pair.
#[derive(Debug)]
pub struct CertificatePair {
    certificate: Certificate,
    key_pair: SigningKey,
}

impl CertificatePair {
    /// Returns a reference to the [`Certificate`].
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a reference to the (signing) key pair.
    pub fn key_pair(&self) -> &SigningKey {
        &self.key_pair
    }

    pub fn certificate_der(&self) -> Result<CertificateDer<'static>, CertificatePairError> {
        let der = self
            .certificate
            .to_der()
            .context(SerializeCertificateSnafu {
                key_encoding: KeyEncoding::Der,
            })?;

        Ok(CertificateDer::from(der))
    }

    pub fn private_key_der(&self) -> Result<PrivateKeyDer<'static>, CertificatePairError> {
        let document = self
            .key_pair
            .signing_key()
            .to_pkcs8_der()
            .context(SerializePrivateKeySnafu {
                key_encoding: KeyEncoding::Der,
            })?;

        let der = PrivatePkcs8KeyDer::from(document.as_bytes().to_vec());
        Ok(PrivateKeyDer::from(der))
    }

    /// Returns the certificate as a PEM envelope, which is the format
    /// Kubernetes expects in `caBundle` fields.
    pub fn certificate_pem(&self) -> Result<String, CertificatePairError> {
        self.certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu {
                key_encoding: KeyEncoding::Pem,
            })
    }

    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CertificatePairError> {
        self.key_pair
            .signing_key()
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(SerializePrivateKeySnafu {
                key_encoding: KeyEncoding::Pem,
            })
    }
}

/// Private and public key encoding, either DER or PEM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEncoding {
    Pem,
    Der,
}

impl std::fmt::Display for KeyEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pem => write!(f, "PEM"),
            Self::Der => write!(f, "DER"),
        }
    }
}
