use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Amount, OutPoint, Transaction};

use crate::anchor;
use crate::error::{Error, Result};
use crate::proof::TransitionProof;
use crate::taproot::{self, TapscriptPreimage};
use crate::vpacket::VOutput;
use crate::wallet::TransferOutput;

/// A signed, not necessarily broadcast, asset-carrying output: everything
/// needed to spend it as the next level's input and later to publish it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransfer {
    pub final_tx: Transaction,
    pub outpoint: OutPoint,
    pub proof_suffix: TransitionProof,
    pub merkle_root: TapNodeHash,
    pub tapscript_sibling: Option<TapscriptPreimage>,
    pub internal_key: XOnlyPublicKey,
    pub script_key: XOnlyPublicKey,
    pub anchor_value: Amount,
    pub taproot_asset_root: TapNodeHash,
    pub asset_amount: u64,
}

/// Derive the transfer for `output` from a fully signed anchor template.
///
/// Pure: reads the template's committed roots and the output's proof suffix.
/// The outpoint references the template's computed txid, so the result can
/// fund a further transaction before anything is broadcast.
pub fn derive_chain_transfer(template: &Psbt, output: &VOutput) -> Result<ChainTransfer> {
    let index = output.anchor_output_index as usize;
    let txout = template
        .unsigned_tx
        .output
        .get(index)
        .ok_or_else(|| Error::Derivation(format!("template has no output {index}")))?;
    let internal_key = template.outputs[index]
        .tap_internal_key
        .ok_or_else(|| Error::Derivation(format!("output {index} has no internal key")))?;
    let merkle_root = anchor::output_merkle_root(template, index)?;
    let taproot_asset_root = anchor::output_asset_root(template, index)?;

    let expected = taproot::anchor_merkle_root(
        taproot_asset_root,
        output.tapscript_sibling.map(|s| s.tap_hash()),
    );
    if expected != merkle_root {
        return Err(Error::Derivation(format!(
            "output {index} merkle root does not match its asset root and sibling"
        )));
    }

    let proof_suffix = output
        .proof_suffix
        .clone()
        .ok_or_else(|| Error::Derivation(format!("output {index} has no proof suffix")))?;
    let anchor_value = txout.value;
    let final_tx = anchor::extract_final_tx(template)?;

    Ok(ChainTransfer {
        outpoint: OutPoint {
            txid: final_tx.compute_txid(),
            vout: output.anchor_output_index,
        },
        final_tx,
        proof_suffix,
        merkle_root,
        tapscript_sibling: output.tapscript_sibling,
        internal_key,
        script_key: output.script_key,
        anchor_value,
        taproot_asset_root,
        asset_amount: output.amount,
    })
}

impl ChainTransfer {
    /// A transfer for an output of an already published asset send.
    pub fn from_sent_output(tx: &Transaction, output: &TransferOutput) -> Result<Self> {
        let txout = tx
            .output
            .get(output.anchor_output_index as usize)
            .ok_or_else(|| {
                Error::Derivation(format!(
                    "send {} has no output {}",
                    tx.compute_txid(),
                    output.anchor_output_index
                ))
            })?;
        Ok(Self {
            final_tx: tx.clone(),
            outpoint: OutPoint {
                txid: tx.compute_txid(),
                vout: output.anchor_output_index,
            },
            proof_suffix: output.proof_suffix.clone(),
            merkle_root: output.merkle_root,
            tapscript_sibling: output.tapscript_sibling,
            internal_key: output.internal_key,
            script_key: output.script_key,
            anchor_value: txout.value,
            taproot_asset_root: output.asset_root,
            asset_amount: output.amount,
        })
    }

    pub fn txid(&self) -> bitcoin::Txid {
        self.outpoint.txid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{apply_output_commitment, finalize_input, prepare_anchor_template};
    use crate::taproot::secp;
    use crate::vpacket::{AssetId, InputAnchor, PrevId, VInput, VOutputKind, VirtualPacket};
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Keypair, SecretKey};
    use bitcoin::{Txid, Witness};

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(secp(), &sk).x_only_public_key().0
    }

    fn sibling() -> TapscriptPreimage {
        TapscriptPreimage::Branch(
            TapNodeHash::from_byte_array([1u8; 32]),
            TapNodeHash::from_byte_array([2u8; 32]),
        )
    }

    fn signed_template() -> (Psbt, VirtualPacket) {
        let mut packet = VirtualPacket::interactive_send(AssetId([3u8; 32]));
        packet.inputs.push(VInput {
            prev_id: PrevId {
                outpoint: OutPoint::new(Txid::from_byte_array([4u8; 32]), 0),
                asset_id: packet.asset_id,
                script_key: xonly(1),
            },
            anchor: InputAnchor {
                value: Amount::from_sat(50_000),
                pk_script: taproot::p2tr_script(xonly(2), None),
                internal_key: xonly(2),
                merkle_root: TapNodeHash::from_byte_array([5u8; 32]),
            },
            amount: 20,
        });
        packet.add_output(VOutput::ark(10, VOutputKind::SplitRoot, xonly(6), 0, sibling()));
        packet.add_output(VOutput::ark(10, VOutputKind::Simple, xonly(7), 1, sibling()));

        let mut template = prepare_anchor_template(&[packet.clone()], Amount::from_sat(1_000)).unwrap();
        for (i, out) in packet.outputs.iter_mut().enumerate() {
            let root = TapNodeHash::from_byte_array([10 + i as u8; 32]);
            apply_output_commitment(&mut template, i, root, Some(&sibling())).unwrap();
            out.proof_suffix = Some(TransitionProof::new(vec![i as u8]));
        }
        finalize_input(&mut template, 0, Witness::from_slice(&[vec![0u8; 64]])).unwrap();
        (template, packet)
    }

    #[test]
    fn derives_outpoint_from_unbroadcast_txid() {
        let (template, packet) = signed_template();
        let left = derive_chain_transfer(&template, &packet.outputs[0]).unwrap();
        let right = derive_chain_transfer(&template, &packet.outputs[1]).unwrap();

        assert_eq!(left.txid(), right.txid());
        assert_eq!(left.txid(), template.unsigned_tx.compute_txid());
        assert_eq!(left.outpoint.vout, 0);
        assert_eq!(right.outpoint.vout, 1);
        assert_eq!(left.taproot_asset_root, TapNodeHash::from_byte_array([10u8; 32]));
        assert_eq!(right.asset_amount, 10);
        assert_eq!(right.internal_key, taproot::nums_internal_key());
        assert_eq!(right.proof_suffix, TransitionProof::new(vec![1]));
    }

    #[test]
    fn derivation_is_deterministic() {
        let (template, packet) = signed_template();
        assert_eq!(
            derive_chain_transfer(&template, &packet.outputs[1]).unwrap(),
            derive_chain_transfer(&template, &packet.outputs[1]).unwrap()
        );
    }

    #[test]
    fn missing_metadata_is_a_derivation_error() {
        let (mut template, packet) = signed_template();
        template.outputs[1].unknown.clear();
        assert!(matches!(
            derive_chain_transfer(&template, &packet.outputs[1]),
            Err(Error::Derivation(_))
        ));

        let (template, mut packet) = signed_template();
        packet.outputs[0].proof_suffix = None;
        assert!(matches!(
            derive_chain_transfer(&template, &packet.outputs[0]),
            Err(Error::Derivation(_))
        ));
    }

    #[test]
    fn sibling_mismatch_is_rejected() {
        let (template, mut packet) = signed_template();
        packet.outputs[0].tapscript_sibling = None;
        assert!(matches!(
            derive_chain_transfer(&template, &packet.outputs[0]),
            Err(Error::Derivation(_))
        ));
    }
}
