use std::sync::Arc;
use std::time::Duration;

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Amount, OutPoint, Script, Transaction};
use serde::{Deserialize, Serialize};

use crate::chain::BlockAnchor;
use crate::contract::PartyKeys;
use crate::error::Result;
use crate::proof::{ProofFile, TransitionProof};
use crate::signer::Signer;
use crate::taproot::TapscriptPreimage;
use crate::vpacket::{AssetId, VirtualPacket};

/// Parameters of an asset address request. Keys left unset are derived by
/// the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    pub asset_id: AssetId,
    pub amount: u64,
    pub script_key: Option<XOnlyPublicKey>,
    pub internal_key: Option<XOnlyPublicKey>,
    pub tapscript_sibling: Option<TapscriptPreimage>,
}

impl AddressRequest {
    /// A plain address with wallet-derived keys.
    pub fn plain(asset_id: AssetId, amount: u64) -> Self {
        Self {
            asset_id,
            amount,
            script_key: None,
            internal_key: None,
            tapscript_sibling: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetAddress {
    pub asset_id: AssetId,
    pub amount: u64,
    pub script_key: XOnlyPublicKey,
    pub internal_key: XOnlyPublicKey,
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// The wallet's string encoding of the address.
    pub encoded: String,
}

/// One output of a completed asset send, as reported by the sending wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutput {
    pub anchor_output_index: u32,
    pub anchor_value: Amount,
    pub internal_key: XOnlyPublicKey,
    pub merkle_root: TapNodeHash,
    pub asset_root: TapNodeHash,
    pub tapscript_sibling: Option<TapscriptPreimage>,
    pub script_key: XOnlyPublicKey,
    pub amount: u64,
    pub proof_suffix: TransitionProof,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub anchor_tx: Transaction,
    pub outputs: Vec<TransferOutput>,
}

impl SendReceipt {
    /// The output paying `script_key`, if any.
    pub fn output_for(&self, script_key: &XOnlyPublicKey) -> Option<&TransferOutput> {
        self.outputs.iter().find(|o| &o.script_key == script_key)
    }
}

/// Asset daemon operations the settlement core depends on.
pub trait AssetWallet: Send + Sync {
    /// Fresh script key and internal key.
    fn next_keys(&self) -> Result<PartyKeys>;

    fn new_address(&self, request: AddressRequest) -> Result<AssetAddress>;

    /// Fund, sign and publish a send to `address`.
    fn send_asset(&self, address: &AssetAddress) -> Result<SendReceipt>;

    /// Block until `address` has received its asset or `timeout` passes.
    fn wait_for_receive(&self, address: &AssetAddress, timeout: Duration) -> Result<()>;

    fn export_proof(&self, asset_id: &AssetId, script_key: &XOnlyPublicKey) -> Result<ProofFile>;

    fn import_proof(&self, file: &ProofFile, genesis_point: OutPoint) -> Result<()>;

    /// Genesis outpoint of `asset_id`, needed to import proofs for it.
    fn asset_genesis(&self, asset_id: &AssetId) -> Result<OutPoint>;

    /// Commit the packets' assets into the anchor template outputs and fill
    /// each output's proof suffix. Packets must already be signed.
    fn commit_anchor_template(&self, template: &mut Psbt, packets: &mut [VirtualPacket])
    -> Result<()>;

    /// Complete `suffix` with the confirming block and append it to `file`.
    fn append_transition_proof(
        &self,
        file: &ProofFile,
        suffix: &TransitionProof,
        tx: &Transaction,
        anchor: &BlockAnchor,
    ) -> Result<ProofFile>;
}

/// Bitcoin wallet daemon operations.
pub trait BitcoinWallet: Send + Sync {
    /// Fund, sign and publish a transaction paying `amount` to `pk_script`.
    fn send_output(&self, amount: Amount, pk_script: &Script) -> Result<Transaction>;

    /// A fresh key-path-only taproot key, imported into the wallet as
    /// watch-only.
    fn next_taproot_key(&self) -> Result<XOnlyPublicKey>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// One participant's long-lived collaborator connections.
#[derive(Clone)]
pub struct Party {
    pub role: Role,
    pub assets: Arc<dyn AssetWallet>,
    pub wallet: Arc<dyn BitcoinWallet>,
    pub signer: Arc<dyn Signer>,
}

impl Party {
    pub fn new(
        role: Role,
        assets: Arc<dyn AssetWallet>,
        wallet: Arc<dyn BitcoinWallet>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            role,
            assets,
            wallet,
            signer,
        }
    }
}

impl std::fmt::Debug for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Party").field("role", &self.role).finish_non_exhaustive()
    }
}
