//! MuSig2 key aggregation and the single-use nonce lifecycle.
//!
//! Both parties' asset script keys are sorted and aggregated with a BIP-86
//! taproot tweak; the result is the key of the asset layer's cooperative leaf.
//! Each contract carries one [`SessionNonce`] per party. The public half can
//! be read any number of times; the secret half moves out exactly once.

use bitcoin::secp256k1::{PublicKey, XOnlyPublicKey};
use musig2::{KeyAggContext, PubNonce, SecNonce};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Sort signer keys by their compressed encoding.
pub fn sorted_signers(a: PublicKey, b: PublicKey) -> [PublicKey; 2] {
    let mut keys = [a, b];
    keys.sort_by_key(|k| k.serialize());
    keys
}

/// Key aggregation context over the sorted keys with the BIP-86 tweak applied.
pub fn key_agg_context(signers: &[PublicKey; 2]) -> Result<KeyAggContext> {
    KeyAggContext::new(signers.iter().copied())
        .map_err(|e| Error::Construction(format!("MuSig2 key aggregation: {e}")))?
        .with_unspendable_taproot_tweak()
        .map_err(|e| Error::Construction(format!("MuSig2 BIP-86 tweak: {e}")))
}

/// The tweaked aggregate key as an x-only key.
pub fn aggregate_key(signers: &[PublicKey; 2]) -> Result<XOnlyPublicKey> {
    let ctx = key_agg_context(signers)?;
    let key: PublicKey = ctx.aggregated_pubkey();
    Ok(key.x_only_public_key().0)
}

/// One party's nonce pair for one contract's asset leaf.
pub struct SessionNonce {
    public: PubNonce,
    secret: Option<SecNonce>,
}

impl SessionNonce {
    /// Generate a fresh nonce bound to the signer's key and the aggregate key.
    pub fn generate(signer: PublicKey, aggregate: PublicKey) -> Self {
        let seed: [u8; 32] = rand::random();
        let secret = SecNonce::build_with_pubkey(seed, signer)
            .with_aggregated_pubkey(aggregate)
            .build();
        Self {
            public: secret.public_nonce(),
            secret: Some(secret),
        }
    }

    /// The exchangeable public half.
    pub fn public(&self) -> &PubNonce {
        &self.public
    }

    pub fn is_consumed(&self) -> bool {
        self.secret.is_none()
    }

    /// Move the secret half out. A second call fails with
    /// [`Error::NonceConsumed`].
    pub fn take_secret(&mut self) -> Result<SecNonce> {
        self.secret.take().ok_or(Error::NonceConsumed)
    }
}

impl std::fmt::Debug for SessionNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNonce")
            .field("public", &hex::encode(self.public.serialize()))
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Identifier of a signer-side MuSig2 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MuSig2SessionId(pub [u8; 32]);

impl MuSig2SessionId {
    /// `SHA256(local_key || signer_0 || signer_1 || local_nonce)`.
    pub fn derive(local_key: &PublicKey, signers: &[PublicKey; 2], local_nonce: &PubNonce) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(local_key.serialize());
        for signer in signers {
            hasher.update(signer.serialize());
        }
        hasher.update(local_nonce.serialize());
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for MuSig2SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taproot::secp;
    use bitcoin::secp256k1::SecretKey;

    fn key(byte: u8) -> PublicKey {
        SecretKey::from_slice(&[byte; 32]).unwrap().public_key(secp())
    }

    #[test]
    fn aggregation_is_order_independent() {
        let a = aggregate_key(&sorted_signers(key(3), key(4))).unwrap();
        let b = aggregate_key(&sorted_signers(key(4), key(3))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn aggregate_differs_from_untweaked() {
        let signers = sorted_signers(key(3), key(4));
        let untweaked: PublicKey = KeyAggContext::new(signers).unwrap().aggregated_pubkey();
        let tweaked = aggregate_key(&signers).unwrap();
        assert_ne!(untweaked.x_only_public_key().0, tweaked);
    }

    #[test]
    fn secret_nonce_moves_out_once() {
        let signers = sorted_signers(key(3), key(4));
        let agg: PublicKey = key_agg_context(&signers).unwrap().aggregated_pubkey();
        let mut nonce = SessionNonce::generate(key(3), agg);
        let public = nonce.public().clone();

        assert!(!nonce.is_consumed());
        assert!(nonce.take_secret().is_ok());
        assert!(nonce.is_consumed());
        assert!(matches!(nonce.take_secret(), Err(Error::NonceConsumed)));
        assert_eq!(nonce.public(), &public);
    }

    #[test]
    fn fresh_nonces_differ() {
        let agg = key(9);
        let n1 = SessionNonce::generate(key(3), agg);
        let n2 = SessionNonce::generate(key(3), agg);
        assert_ne!(n1.public(), n2.public());
    }
}
