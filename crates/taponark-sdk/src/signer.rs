use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, SecretKey, schnorr};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash};
use bitcoin::{Script, TxOut};
use musig2::{AggNonce, KeyAggContext, PartialSignature, PubNonce, SecNonce};

use crate::error::{Error, Result};
use crate::musig::{self, MuSig2SessionId};
use crate::taproot::secp;

/// Everything a signer needs to open a two-party MuSig2 session.
pub struct MuSig2SessionRequest {
    /// Key this signer signs with; must be one of `signers`.
    pub local_key: PublicKey,
    /// Both parties' keys in aggregation order.
    pub signers: [PublicKey; 2],
    pub secret_nonce: SecNonce,
    pub local_nonce: PubNonce,
    /// The counterparty's exchanged public nonce.
    pub remote_nonce: PubNonce,
}

/// Signing half of a wallet daemon.
pub trait Signer: Send + Sync {
    fn musig2_create_session(&self, request: MuSig2SessionRequest) -> Result<MuSig2SessionId>;

    /// Produce this party's partial signature over `digest`. Spends the
    /// session's secret nonce.
    fn musig2_partial_sign(&self, id: &MuSig2SessionId, digest: [u8; 32])
    -> Result<PartialSignature>;

    /// Verify the counterparty's partial signatures and combine them with
    /// this party's own into a final Schnorr signature. Ends the session.
    fn musig2_combine(
        &self,
        id: &MuSig2SessionId,
        remote: &[PartialSignature],
    ) -> Result<schnorr::Signature>;

    /// End a session that will not be combined by this signer.
    fn musig2_cleanup(&self, id: &MuSig2SessionId) -> Result<()>;

    /// Sign a tapscript spend of input `index` with `key`.
    fn sign_psbt_input(
        &self,
        psbt: &Psbt,
        index: usize,
        key: &PublicKey,
        leaf_script: &Script,
        control_block: &ControlBlock,
    ) -> Result<schnorr::Signature>;
}

struct Session {
    local_key: PublicKey,
    remote_key: PublicKey,
    ctx: KeyAggContext,
    secret_nonce: Option<SecNonce>,
    remote_nonce: PubNonce,
    agg_nonce: AggNonce,
    signed: Option<([u8; 32], PartialSignature)>,
}

/// In-memory [`Signer`] over a set of secret keys.
#[derive(Default)]
pub struct KeyringSigner {
    keys: Mutex<HashMap<PublicKey, SecretKey>>,
    sessions: Mutex<HashMap<MuSig2SessionId, Session>>,
    /// Ended sessions; their nonces must never be reopened.
    ended: Mutex<HashSet<MuSig2SessionId>>,
}

impl KeyringSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and retain a fresh random key.
    pub fn generate_key(&self) -> Result<PublicKey> {
        let secret = SecretKey::new(&mut rand::thread_rng());
        self.insert_secret(secret)
    }

    pub fn insert_secret(&self, secret: SecretKey) -> Result<PublicKey> {
        let public = secret.public_key(secp());
        self.keys
            .lock()
            .map_err(|_| Error::Signing("keyring lock poisoned".into()))?
            .insert(public, secret);
        Ok(public)
    }

    fn secret_for(&self, key: &PublicKey) -> Result<SecretKey> {
        self.keys
            .lock()
            .map_err(|_| Error::Signing("keyring lock poisoned".into()))?
            .get(key)
            .copied()
            .ok_or_else(|| Error::Signing(format!("no secret key for {key}")))
    }

    fn with_session<T>(
        &self,
        id: &MuSig2SessionId,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| Error::Signing("session lock poisoned".into()))?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::Signing(format!("unknown MuSig2 session {id}")))?;
        f(session)
    }

    fn end_session(&self, id: &MuSig2SessionId) -> Result<Session> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| Error::Signing("session lock poisoned".into()))?;
        let session = sessions
            .remove(id)
            .ok_or_else(|| Error::Signing(format!("unknown MuSig2 session {id}")))?;
        self.ended
            .lock()
            .map_err(|_| Error::Signing("session lock poisoned".into()))?
            .insert(*id);
        Ok(session)
    }
}

impl Signer for KeyringSigner {
    fn musig2_create_session(&self, request: MuSig2SessionRequest) -> Result<MuSig2SessionId> {
        let MuSig2SessionRequest {
            local_key,
            signers,
            secret_nonce,
            local_nonce,
            remote_nonce,
        } = request;

        let remote_key = match signers {
            [a, b] if a == local_key => b,
            [a, b] if b == local_key => a,
            _ => {
                return Err(Error::Signing(format!(
                    "local key {local_key} is not a session signer"
                )));
            }
        };
        if secret_nonce.public_nonce() != local_nonce {
            return Err(Error::Signing("secret nonce does not match public nonce".into()));
        }
        self.secret_for(&local_key)?;

        let ctx = musig::key_agg_context(&signers)?;
        let agg_nonce = AggNonce::sum([&local_nonce, &remote_nonce]);
        let id = MuSig2SessionId::derive(&local_key, &signers, &local_nonce);

        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| Error::Signing("session lock poisoned".into()))?;
        let ended = self
            .ended
            .lock()
            .map_err(|_| Error::Signing("session lock poisoned".into()))?
            .contains(&id);
        if ended || sessions.contains_key(&id) {
            return Err(Error::NonceConsumed);
        }
        sessions.insert(
            id,
            Session {
                local_key,
                remote_key,
                ctx,
                secret_nonce: Some(secret_nonce),
                remote_nonce,
                agg_nonce,
                signed: None,
            },
        );
        Ok(id)
    }

    fn musig2_partial_sign(
        &self,
        id: &MuSig2SessionId,
        digest: [u8; 32],
    ) -> Result<PartialSignature> {
        let (local_key, secret_nonce) = self.with_session(id, |s| {
            let nonce = s.secret_nonce.take().ok_or(Error::NonceConsumed)?;
            Ok((s.local_key, nonce))
        })?;
        let secret = self.secret_for(&local_key)?;

        self.with_session(id, |s| {
            let partial: PartialSignature =
                musig2::sign_partial(&s.ctx, secret, secret_nonce, &s.agg_nonce, digest)
                    .map_err(|e| Error::Signing(format!("partial sign: {e}")))?;
            s.signed = Some((digest, partial));
            Ok(partial)
        })
    }

    fn musig2_combine(
        &self,
        id: &MuSig2SessionId,
        remote: &[PartialSignature],
    ) -> Result<schnorr::Signature> {
        let s = self.end_session(id)?;
        let (digest, own) = s
            .signed
            .ok_or_else(|| Error::Signing(format!("session {id} has no local signature")))?;
        let [theirs] = remote else {
            return Err(Error::Signing(format!(
                "expected one counterparty partial signature, got {}",
                remote.len()
            )));
        };
        musig2::verify_partial(
            &s.ctx,
            *theirs,
            &s.agg_nonce,
            s.remote_key,
            &s.remote_nonce,
            digest,
        )
        .map_err(|e| Error::Signing(format!("counterparty partial signature: {e}")))?;

        let combined: [u8; 64] =
            musig2::aggregate_partial_signatures(&s.ctx, &s.agg_nonce, [own, *theirs], digest)
                .map_err(|e| Error::Signing(format!("combine: {e}")))?;
        schnorr::Signature::from_slice(&combined)
            .map_err(|e| Error::Signing(format!("combined signature: {e}")))
    }

    fn musig2_cleanup(&self, id: &MuSig2SessionId) -> Result<()> {
        self.end_session(id).map(drop)
    }

    fn sign_psbt_input(
        &self,
        psbt: &Psbt,
        index: usize,
        key: &PublicKey,
        leaf_script: &Script,
        control_block: &ControlBlock,
    ) -> Result<schnorr::Signature> {
        let secret = self.secret_for(key)?;
        let prevouts = psbt
            .inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                input
                    .witness_utxo
                    .clone()
                    .ok_or_else(|| Error::Signing(format!("input {i} has no witness utxo")))
            })
            .collect::<Result<Vec<TxOut>>>()?;

        let leaf_hash = TapLeafHash::from_script(leaf_script, control_block.leaf_version);
        if control_block.leaf_version != LeafVersion::TapScript {
            return Err(Error::Signing("unsupported leaf version".into()));
        }
        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(|e| Error::Signing(format!("sighash for input {index}: {e}")))?;

        let keypair = Keypair::from_secret_key(secp(), &secret);
        let msg = Message::from_digest(sighash.to_byte_array());
        Ok(secp().sign_schnorr(&msg, &keypair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::musig::SessionNonce;

    fn session_pair(
        signer: &KeyringSigner,
    ) -> (PublicKey, PublicKey, MuSig2SessionId, MuSig2SessionId) {
        let a = signer.generate_key().unwrap();
        let b = signer.generate_key().unwrap();
        let signers = musig::sorted_signers(a, b);
        let agg: PublicKey = musig::key_agg_context(&signers).unwrap().aggregated_pubkey();
        let mut na = SessionNonce::generate(a, agg);
        let mut nb = SessionNonce::generate(b, agg);

        let id_a = signer
            .musig2_create_session(MuSig2SessionRequest {
                local_key: a,
                signers,
                local_nonce: na.public().clone(),
                secret_nonce: na.take_secret().unwrap(),
                remote_nonce: nb.public().clone(),
            })
            .unwrap();
        let id_b = signer
            .musig2_create_session(MuSig2SessionRequest {
                local_key: b,
                signers,
                local_nonce: nb.public().clone(),
                secret_nonce: nb.take_secret().unwrap(),
                remote_nonce: na.public().clone(),
            })
            .unwrap();
        (a, b, id_a, id_b)
    }

    #[test]
    fn combined_signature_verifies_under_aggregate_key() {
        let signer = KeyringSigner::new();
        let (a, b, id_a, id_b) = session_pair(&signer);
        let digest = [42u8; 32];

        let pa = signer.musig2_partial_sign(&id_a, digest).unwrap();
        let pb = signer.musig2_partial_sign(&id_b, digest).unwrap();
        let sig = signer.musig2_combine(&id_a, &[pb]).unwrap();

        let agg = musig::aggregate_key(&musig::sorted_signers(a, b)).unwrap();
        let msg = Message::from_digest(digest);
        assert!(secp().verify_schnorr(&sig, &msg, &agg).is_ok());
        assert!(signer.musig2_combine(&id_b, &[pa]).is_ok());
    }

    #[test]
    fn second_partial_sign_fails() {
        let signer = KeyringSigner::new();
        let (_, _, id_a, _) = session_pair(&signer);
        signer.musig2_partial_sign(&id_a, [1u8; 32]).unwrap();
        assert!(matches!(
            signer.musig2_partial_sign(&id_a, [2u8; 32]),
            Err(Error::NonceConsumed)
        ));
    }

    #[test]
    fn combine_rejects_wrong_partial() {
        let signer = KeyringSigner::new();
        let (_, _, id_a, _) = session_pair(&signer);
        let own = signer.musig2_partial_sign(&id_a, [3u8; 32]).unwrap();
        // Our own partial is not a valid counterparty partial.
        assert!(matches!(
            signer.musig2_combine(&id_a, &[own]),
            Err(Error::Signing(_))
        ));
    }

    #[test]
    fn combine_and_cleanup_end_sessions() {
        let signer = KeyringSigner::new();
        let (_, _, id_a, id_b) = session_pair(&signer);
        let digest = [7u8; 32];

        signer.musig2_partial_sign(&id_a, digest).unwrap();
        let pb = signer.musig2_partial_sign(&id_b, digest).unwrap();
        signer.musig2_cleanup(&id_b).unwrap();
        signer.musig2_combine(&id_a, &[pb]).unwrap();

        assert!(signer.sessions.lock().unwrap().is_empty());
        assert_eq!(signer.ended.lock().unwrap().len(), 2);
        assert!(matches!(
            signer.musig2_combine(&id_a, &[pb]),
            Err(Error::Signing(_))
        ));
        assert!(signer.musig2_cleanup(&id_b).is_err());
    }

    #[test]
    fn session_requires_known_key() {
        let signer = KeyringSigner::new();
        let other = KeyringSigner::new();
        let a = other.generate_key().unwrap();
        let b = signer.generate_key().unwrap();
        let signers = musig::sorted_signers(a, b);
        let agg: PublicKey = musig::key_agg_context(&signers).unwrap().aggregated_pubkey();
        let mut na = SessionNonce::generate(a, agg);
        let nb = SessionNonce::generate(b, agg);
        let result = signer.musig2_create_session(MuSig2SessionRequest {
            local_key: a,
            signers,
            local_nonce: na.public().clone(),
            secret_nonce: na.take_secret().unwrap(),
            remote_nonce: nb.public().clone(),
        });
        assert!(matches!(result, Err(Error::Signing(_))));
    }
}
