//! Anchor transaction templates.
//!
//! A template is a [`Psbt`] whose outputs carry asset commitments. The asset
//! wallet writes each output's taproot merkle root and asset root into
//! proprietary output fields when it commits the template; the transfer
//! deriver reads them back.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{self, Psbt, raw};
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::taproot::{LeafVersion, TapNodeHash};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::contract::TaprootScriptPair;
use crate::error::{Error, Result};
use crate::taproot::{self, TapscriptPreimage};
use crate::vpacket::VirtualPacket;

/// Output field holding the committed taproot merkle root.
pub const OUTPUT_MERKLE_ROOT_TYPE: u8 = 0x72;
/// Output field holding the asset commitment root.
pub const OUTPUT_ASSET_ROOT_TYPE: u8 = 0x73;

fn field_key(type_value: u8) -> raw::Key {
    raw::Key {
        type_value,
        key: Vec::new(),
    }
}

fn read_root(template: &Psbt, index: usize, type_value: u8, what: &str) -> Result<TapNodeHash> {
    let output = template
        .outputs
        .get(index)
        .ok_or_else(|| Error::Derivation(format!("template has no output {index}")))?;
    let bytes = output
        .unknown
        .get(&field_key(type_value))
        .ok_or_else(|| Error::Derivation(format!("output {index} has no {what}")))?;
    TapNodeHash::from_slice(bytes)
        .map_err(|e| Error::Derivation(format!("output {index} {what}: {e}")))
}

/// Build an unsigned template spending the packets' anchor inputs into one
/// dust-valued placeholder output per anchor index.
pub fn prepare_anchor_template(packets: &[VirtualPacket], dust: Amount) -> Result<Psbt> {
    let mut inputs: Vec<(OutPoint, psbt::Input)> = Vec::new();
    let mut outputs: BTreeMap<u32, XOnlyPublicKey> = BTreeMap::new();

    for packet in packets {
        packet.validate()?;
        for vin in &packet.inputs {
            if inputs.iter().any(|(op, _)| *op == vin.prev_id.outpoint) {
                continue;
            }
            let anchor = &vin.anchor;
            let input = psbt::Input {
                witness_utxo: Some(TxOut {
                    value: anchor.value,
                    script_pubkey: anchor.pk_script.clone(),
                }),
                tap_internal_key: Some(anchor.internal_key),
                tap_merkle_root: Some(anchor.merkle_root),
                ..Default::default()
            };
            inputs.push((vin.prev_id.outpoint, input));
        }
        for vout in &packet.outputs {
            match outputs.get(&vout.anchor_output_index) {
                Some(key) if *key != vout.anchor_internal_key => {
                    return Err(Error::Construction(format!(
                        "anchor output {} has conflicting internal keys",
                        vout.anchor_output_index
                    )));
                }
                Some(_) => {}
                None => {
                    outputs.insert(vout.anchor_output_index, vout.anchor_internal_key);
                }
            }
        }
    }

    let count = outputs.len() as u32;
    if outputs.keys().copied().ne(0..count) {
        return Err(Error::Construction(
            "anchor output indices are not contiguous".into(),
        ));
    }

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|(outpoint, _)| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .values()
            .map(|key| TxOut {
                value: dust,
                script_pubkey: taproot::p2tr_script(*key, None),
            })
            .collect(),
    };

    let mut template = Psbt::from_unsigned_tx(unsigned_tx)
        .map_err(|e| Error::Construction(format!("anchor template: {e}")))?;
    for (slot, (_, input)) in template.inputs.iter_mut().zip(inputs) {
        *slot = input;
    }
    for (slot, key) in template.outputs.iter_mut().zip(outputs.values()) {
        slot.tap_internal_key = Some(*key);
    }
    Ok(template)
}

/// Append an input spent through `pair`'s cooperative leaf. Returns its index.
pub fn add_btc_input(
    template: &mut Psbt,
    outpoint: OutPoint,
    txout: TxOut,
    pair: &TaprootScriptPair,
) -> Result<usize> {
    let control_block = pair.require_control_block()?.clone();
    let merkle_root = taproot::control_block_root(&control_block, pair.cooperative_leaf());

    template.unsigned_tx.input.push(TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    });
    let mut input = psbt::Input {
        witness_utxo: Some(txout),
        tap_internal_key: Some(control_block.internal_key),
        tap_merkle_root: Some(merkle_root),
        ..Default::default()
    };
    input.tap_scripts.insert(
        control_block,
        (pair.cooperative_leaf().to_owned(), LeafVersion::TapScript),
    );
    template.inputs.push(input);
    Ok(template.inputs.len() - 1)
}

/// Append a key-path-only P2TR output. Returns its index.
pub fn add_btc_output(template: &mut Psbt, amount: Amount, internal_key: XOnlyPublicKey) -> usize {
    template.unsigned_tx.output.push(TxOut {
        value: amount,
        script_pubkey: taproot::p2tr_script(internal_key, None),
    });
    template.outputs.push(psbt::Output {
        tap_internal_key: Some(internal_key),
        ..Default::default()
    });
    template.outputs.len() - 1
}

pub fn set_output_value(template: &mut Psbt, index: usize, amount: Amount) -> Result<()> {
    let output = template
        .unsigned_tx
        .output
        .get_mut(index)
        .ok_or_else(|| Error::Construction(format!("template has no output {index}")))?;
    output.value = amount;
    Ok(())
}

/// Commit output `index` to `asset_root`, optionally next to `sibling`.
pub fn apply_output_commitment(
    template: &mut Psbt,
    index: usize,
    asset_root: TapNodeHash,
    sibling: Option<&TapscriptPreimage>,
) -> Result<()> {
    let internal_key = template
        .outputs
        .get(index)
        .and_then(|o| o.tap_internal_key)
        .ok_or_else(|| Error::Derivation(format!("output {index} has no internal key")))?;
    let merkle_root = taproot::anchor_merkle_root(asset_root, sibling.map(|s| s.tap_hash()));

    template.unsigned_tx.output[index].script_pubkey =
        taproot::p2tr_script(internal_key, Some(merkle_root));
    let output = &mut template.outputs[index];
    output.unknown.insert(
        field_key(OUTPUT_MERKLE_ROOT_TYPE),
        merkle_root.to_byte_array().to_vec(),
    );
    output.unknown.insert(
        field_key(OUTPUT_ASSET_ROOT_TYPE),
        asset_root.to_byte_array().to_vec(),
    );
    Ok(())
}

pub fn output_merkle_root(template: &Psbt, index: usize) -> Result<TapNodeHash> {
    read_root(template, index, OUTPUT_MERKLE_ROOT_TYPE, "merkle root")
}

pub fn output_asset_root(template: &Psbt, index: usize) -> Result<TapNodeHash> {
    read_root(template, index, OUTPUT_ASSET_ROOT_TYPE, "asset root")
}

/// Set the final witness of input `index` and drop its signing metadata.
pub fn finalize_input(template: &mut Psbt, index: usize, witness: Witness) -> Result<()> {
    let input = template
        .inputs
        .get_mut(index)
        .ok_or_else(|| Error::Signing(format!("template has no input {index}")))?;
    input.final_script_witness = Some(witness);
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
    Ok(())
}

/// The signed transaction. Every input must be finalized.
pub fn extract_final_tx(template: &Psbt) -> Result<Transaction> {
    if let Some(index) = template
        .inputs
        .iter()
        .position(|i| i.final_script_witness.is_none())
    {
        return Err(Error::Derivation(format!("input {index} is not finalized")));
    }
    Ok(template.clone().extract_tx_unchecked_fee_rate())
}
