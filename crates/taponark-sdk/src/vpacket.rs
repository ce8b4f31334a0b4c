//! Asset-level transfer descriptor ("virtual packet").
//!
//! A packet spends one or more asset inputs into outputs that are each placed
//! in an anchor transaction output. The asset-level spend is authorised by a
//! BIP-341 tapscript signature over a virtual transaction derived from the
//! packet; the derivation is deterministic and lives entirely in this module.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::script::Builder;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{TapLeafHash, TapNodeHash};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::proof::TransitionProof;
use crate::taproot::{self, TapscriptPreimage};
use crate::transfer::ChainTransfer;
use crate::wallet::AssetAddress;

/// 32-byte asset identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(#[serde(with = "hex::serde")] pub [u8; 32]);

impl AssetId {
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::Config(format!("asset id {s}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetId({self})")
    }
}

/// Identity of a previous asset output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevId {
    pub outpoint: OutPoint,
    pub asset_id: AssetId,
    pub script_key: XOnlyPublicKey,
}

impl PrevId {
    /// Txid of the virtual input spending this asset: `SHA256(outpoint || asset_id || script_key)`.
    fn virtual_txid(&self) -> Txid {
        let mut hasher = Sha256::new();
        hasher.update(self.outpoint.txid.to_byte_array());
        hasher.update(self.outpoint.vout.to_be_bytes());
        hasher.update(self.asset_id.0);
        hasher.update(self.script_key.serialize());
        Txid::from_byte_array(hasher.finalize().into())
    }
}

/// The on-chain output an asset input is anchored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputAnchor {
    pub value: Amount,
    pub pk_script: ScriptBuf,
    pub internal_key: XOnlyPublicKey,
    pub merkle_root: TapNodeHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VInput {
    pub prev_id: PrevId,
    pub anchor: InputAnchor,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VOutputKind {
    Simple,
    /// Carries the spend witness; the other outputs commit to it.
    SplitRoot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VOutput {
    pub amount: u64,
    pub kind: VOutputKind,
    pub script_key: XOnlyPublicKey,
    pub anchor_output_index: u32,
    pub anchor_internal_key: XOnlyPublicKey,
    pub tapscript_sibling: Option<TapscriptPreimage>,
    pub witness: Option<Witness>,
    /// Filled in by the asset wallet when the anchor template is committed.
    pub proof_suffix: Option<TransitionProof>,
}

impl VOutput {
    /// An output anchored under the NUMS internal key.
    pub fn ark(
        amount: u64,
        kind: VOutputKind,
        script_key: XOnlyPublicKey,
        anchor_output_index: u32,
        sibling: TapscriptPreimage,
    ) -> Self {
        Self {
            amount,
            kind,
            script_key,
            anchor_output_index,
            anchor_internal_key: taproot::nums_internal_key(),
            tapscript_sibling: Some(sibling),
            witness: None,
            proof_suffix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPacket {
    pub asset_id: AssetId,
    pub inputs: Vec<VInput>,
    pub outputs: Vec<VOutput>,
}

impl VirtualPacket {
    /// An empty packet for an interactive (non-address) send.
    pub fn interactive_send(asset_id: AssetId) -> Self {
        Self {
            asset_id,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// A packet paying `address` in full: zero-value split-root change at
    /// anchor 0 and the recipient at anchor 1.
    pub fn from_address(address: &AssetAddress) -> Self {
        let nums = taproot::nums_internal_key();
        let mut packet = Self::interactive_send(address.asset_id);
        packet.add_output(VOutput {
            amount: 0,
            kind: VOutputKind::SplitRoot,
            script_key: nums,
            anchor_output_index: 0,
            anchor_internal_key: nums,
            tapscript_sibling: None,
            witness: None,
            proof_suffix: None,
        });
        packet.add_output(VOutput {
            amount: address.amount,
            kind: VOutputKind::Simple,
            script_key: address.script_key,
            anchor_output_index: 1,
            anchor_internal_key: address.internal_key,
            tapscript_sibling: address.tapscript_sibling,
            witness: None,
            proof_suffix: None,
        });
        packet
    }

    pub fn add_output(&mut self, output: VOutput) {
        self.outputs.push(output);
    }

    /// Make `transfer`'s asset output the packet's sole input.
    pub fn bind_input(&mut self, transfer: &ChainTransfer) -> Result<()> {
        let pk_script = transfer
            .final_tx
            .output
            .get(transfer.outpoint.vout as usize)
            .map(|out| out.script_pubkey.clone())
            .ok_or_else(|| {
                Error::Construction(format!("transfer has no output {}", transfer.outpoint))
            })?;
        self.inputs = vec![VInput {
            prev_id: PrevId {
                outpoint: transfer.outpoint,
                asset_id: self.asset_id,
                script_key: transfer.script_key,
            },
            anchor: InputAnchor {
                value: transfer.anchor_value,
                pk_script,
                internal_key: transfer.internal_key,
                merkle_root: transfer.merkle_root,
            },
            amount: transfer.asset_amount,
        }];
        Ok(())
    }

    /// Attach the spend witness: to the split root when there is one,
    /// otherwise to every output.
    pub fn set_witness(&mut self, witness: Witness) {
        let has_split_root = self
            .outputs
            .iter()
            .any(|o| o.kind == VOutputKind::SplitRoot);
        for output in &mut self.outputs {
            if !has_split_root || output.kind == VOutputKind::SplitRoot {
                output.witness = Some(witness.clone());
            }
        }
    }

    pub fn is_signed(&self) -> bool {
        self.outputs.iter().any(|o| o.witness.is_some())
    }

    pub fn input_amount(&self) -> u64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    pub fn output_amount(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Inputs and outputs must balance and anchor indices must be contiguous.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::Construction("packet has no inputs".into()));
        }
        if self.input_amount() != self.output_amount() {
            return Err(Error::Construction(format!(
                "packet does not balance: inputs {} != outputs {}",
                self.input_amount(),
                self.output_amount()
            )));
        }
        let count = self.anchor_output_count();
        for index in 0..count {
            if !self.outputs.iter().any(|o| o.anchor_output_index == index) {
                return Err(Error::Construction(format!(
                    "anchor output {index} carries no asset output"
                )));
            }
        }
        Ok(())
    }

    /// Number of anchor outputs the packet's outputs occupy.
    pub fn anchor_output_count(&self) -> u32 {
        self.outputs
            .iter()
            .map(|o| o.anchor_output_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// The virtual transaction whose signature authorises the asset spend.
    ///
    /// Each input spends `SHA256(prev id)`; the single output commits to all
    /// asset outputs, excluding witnesses.
    pub fn virtual_tx(&self) -> Transaction {
        let input = self
            .inputs
            .iter()
            .map(|vin| TxIn {
                previous_output: OutPoint {
                    txid: vin.prev_id.virtual_txid(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(self.asset_id.0);
        for out in &self.outputs {
            hasher.update(out.amount.to_be_bytes());
            hasher.update([matches!(out.kind, VOutputKind::SplitRoot) as u8]);
            hasher.update(out.script_key.serialize());
            hasher.update(out.anchor_output_index.to_be_bytes());
        }
        let commitment: [u8; 32] = hasher.finalize().into();
        let script_pubkey = Builder::new()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(commitment)
            .into_script();

        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: vec![TxOut {
                value: Amount::from_sat(self.output_amount()),
                script_pubkey,
            }],
        }
    }

    /// Prevouts of the virtual transaction: a P2TR output of each input's
    /// script key, valued at the input's asset amount.
    pub fn virtual_prevouts(&self) -> Vec<TxOut> {
        self.inputs
            .iter()
            .map(|vin| TxOut {
                value: Amount::from_sat(vin.amount),
                script_pubkey: ScriptBuf::new_p2tr_tweaked(
                    TweakedPublicKey::dangerous_assume_tweaked(vin.prev_id.script_key),
                ),
            })
            .collect()
    }

    /// Tapscript sighash (`SIGHASH_DEFAULT`) of virtual input `index` spent via `leaf`.
    pub fn sighash(&self, index: usize, leaf: TapLeafHash) -> Result<[u8; 32]> {
        let tx = self.virtual_tx();
        let prevouts = self.virtual_prevouts();
        let sighash = SighashCache::new(&tx)
            .taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                leaf,
                TapSighashType::Default,
            )
            .map_err(|e| Error::Signing(format!("virtual sighash for input {index}: {e}")))?;
        Ok(sighash.to_byte_array())
    }
}
