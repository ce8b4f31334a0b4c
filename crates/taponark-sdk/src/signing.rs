//! Two-party signing of Ark contract spends.
//!
//! The asset layer is spent with one MuSig2 signature under the aggregated
//! key; the server coordinates and combines. The Bitcoin layer is spent
//! through the raw 2-of-2 leaf, so each party signs every anchor input on
//! its own and the coordinator assembles the witness.

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, PublicKey, schnorr};
use bitcoin::taproot::{ControlBlock, LeafVersion};
use bitcoin::{Script, Witness};

use crate::anchor;
use crate::contract::ArkContract;
use crate::error::{Error, Result};
use crate::signer::MuSig2SessionRequest;
use crate::taproot::secp;
use crate::vpacket::VirtualPacket;
use crate::wallet::Party;

pub struct SigningCoordinator<'a> {
    user: &'a Party,
    server: &'a Party,
}

impl<'a> SigningCoordinator<'a> {
    pub fn new(user: &'a Party, server: &'a Party) -> Self {
        Self { user, server }
    }

    /// Sign `packet`'s spend of `contract`'s asset output through the
    /// aggregated-key leaf and attach the witness.
    ///
    /// Consumes both parties' nonces for the contract; a second call fails
    /// with [`Error::NonceConsumed`].
    pub fn sign_asset_transfer(
        &self,
        contract: &mut ArkContract,
        packet: &mut VirtualPacket,
    ) -> Result<()> {
        if packet.inputs.len() != 1 {
            return Err(Error::Signing(format!(
                "asset spend expects one input, packet has {}",
                packet.inputs.len()
            )));
        }
        let asset_script = contract.asset_script();
        let leaf = asset_script.leaves().cooperative_leaf().to_owned();
        let leaf_hash = asset_script.leaves().cooperative_leaf_hash();
        let control_block = asset_script.control_block_for(&leaf)?;
        let aggregate_key = asset_script.aggregate_key();
        let signers = *asset_script.signers();
        if packet.inputs[0].prev_id.script_key != asset_script.output_key() {
            return Err(Error::Signing(
                "packet input is not locked to the contract's asset script".into(),
            ));
        }
        let digest = packet.sighash(0, leaf_hash)?;

        let user_key = contract.user_keys().script_key;
        let server_key = contract.server_keys().script_key;
        let (user_nonce, server_nonce) = contract.asset_script_mut().nonces_mut();
        let user_public = user_nonce.public().clone();
        let server_public = server_nonce.public().clone();

        let server_session = self.server.signer.musig2_create_session(MuSig2SessionRequest {
            local_key: server_key,
            signers,
            secret_nonce: server_nonce.take_secret()?,
            local_nonce: server_public.clone(),
            remote_nonce: user_public.clone(),
        })?;
        let user_session = self.user.signer.musig2_create_session(MuSig2SessionRequest {
            local_key: user_key,
            signers,
            secret_nonce: user_nonce.take_secret()?,
            local_nonce: user_public,
            remote_nonce: server_public,
        })?;

        let user_partial = self.user.signer.musig2_partial_sign(&user_session, digest)?;
        self.user.signer.musig2_cleanup(&user_session)?;
        self.server.signer.musig2_partial_sign(&server_session, digest)?;
        let signature = self
            .server
            .signer
            .musig2_combine(&server_session, &[user_partial])?;

        secp()
            .verify_schnorr(&signature, &Message::from_digest(digest), &aggregate_key)
            .map_err(|e| Error::Signing(format!("combined asset signature: {e}")))?;

        let mut witness = Witness::new();
        witness.push(signature.serialize());
        witness.push(leaf.as_bytes());
        witness.push(control_block.serialize());
        packet.set_witness(witness);

        log::debug!("signing: asset spend signed under {aggregate_key}");
        Ok(())
    }

    /// Collect both parties' signatures for each `(input index, contract)`
    /// and finalize those inputs with the cooperative-leaf witness
    /// `[server_sig, user_sig, script, control_block]`.
    pub fn sign_anchor_inputs(
        &self,
        template: &mut Psbt,
        inputs: &[(usize, &ArkContract)],
    ) -> Result<()> {
        let mut witnesses = Vec::with_capacity(inputs.len());
        for (index, contract) in inputs {
            let pair = contract.btc_script();
            let control_block = pair.require_control_block()?;
            let script = pair.cooperative_leaf();

            let (server_sig, user_sig) = rayon::join(
                || {
                    sign_as(
                        self.server,
                        template,
                        *index,
                        &contract.server_keys().internal_key,
                        script,
                        control_block,
                    )
                },
                || {
                    sign_as(
                        self.user,
                        template,
                        *index,
                        &contract.user_keys().internal_key,
                        script,
                        control_block,
                    )
                },
            );

            let mut witness = Witness::new();
            witness.push(server_sig?.serialize());
            witness.push(user_sig?.serialize());
            witness.push(script.as_bytes());
            witness.push(control_block.serialize());
            witnesses.push((*index, witness));
        }

        // All signatures commit to the unsigned transaction, so finalize last.
        for (index, witness) in witnesses {
            anchor::finalize_input(template, index, witness)?;
        }
        Ok(())
    }
}

/// Have `party` sign input `index` with `key` on a copy of the template
/// whose input metadata names only that key and leaf.
fn sign_as(
    party: &Party,
    template: &Psbt,
    index: usize,
    key: &PublicKey,
    script: &Script,
    control_block: &ControlBlock,
) -> Result<schnorr::Signature> {
    let mut scoped = template.clone();
    let input = scoped
        .inputs
        .get_mut(index)
        .ok_or_else(|| Error::Signing(format!("template has no input {index}")))?;
    let leaf_hash = bitcoin::taproot::TapLeafHash::from_script(script, LeafVersion::TapScript);
    input.tap_key_origins.clear();
    input.tap_key_origins.insert(
        key.x_only_public_key().0,
        (
            vec![leaf_hash],
            (Fingerprint::default(), DerivationPath::default()),
        ),
    );
    input.tap_scripts.clear();
    input.tap_scripts.insert(
        control_block.clone(),
        (script.to_owned(), LeafVersion::TapScript),
    );

    party
        .signer
        .sign_psbt_input(&scoped, index, key, script, control_block)
        .map_err(|e| match e {
            Error::Signing(msg) => Error::Signing(format!("{} signer: {msg}", party.role)),
            other => other,
        })
}
