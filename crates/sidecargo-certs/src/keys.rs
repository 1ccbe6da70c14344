//! Abstraction layer around the [`ecdsa`] and [`p256`] crates. This module
//! provides the key type used to sign CAs and bound to leaf certificates.
use p256::NistP256;
use rand_core::{CryptoRngCore, OsRng};
use tracing::instrument;

/// The signature encoding used in certificates, a DER encoded ECDSA
/// signature.
pub type Signature = ecdsa::der::Signature<NistP256>;

#[derive(Debug)]
pub struct SigningKey(ecdsa::SigningKey<NistP256>);

impl Default for SigningKey {
    fn default() -> Self {
        Self::new()
    }
}

impl SigningKey {
    /// Generates a new ECDSA key with the default random-number generator
    /// [`OsRng`].
    #[instrument(name = "create_ecdsa_signing_key")]
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self::new_with_rng(&mut csprng)
    }

    /// Generates a new ECDSA key with a custom random-number generator.
    #[instrument(name = "create_ecdsa_signing_key_custom_rng", skip_all)]
    pub fn new_with_rng<Rng>(rng: &mut Rng) -> Self
    where
        Rng: CryptoRngCore,
    {
        Self(ecdsa::SigningKey::random(rng))
    }

    /// Returns the signing (private) key half of the key pair.
    pub fn signing_key(&self) -> &ecdsa::SigningKey<NistP256> {
        &self.0
    }

    /// Returns the verifying (public) half of the key pair.
    pub fn verifying_key(&self) -> ecdsa::VerifyingKey<NistP256> {
        *self.0.verifying_key()
    }

    pub const fn algorithm_name() -> &'static str {
        "ecdsa"
    }

    /// The key length in bits
    pub const fn key_size() -> usize {
        256
    }
}
