//! In-memory collaborators for exercising a full round without a node.
//!
//! [`MockChain`] validates every broadcast the way a node would for the
//! transactions a round produces: inputs must exist and be unspent, and
//! cooperative-leaf witnesses must verify. [`MockAssetWallet`] keeps proof
//! files as JSON so tests can inspect the transition chain.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Message, XOnlyPublicKey, schnorr};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{ControlBlock, TapLeafHash, TapNodeHash};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, Script, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::anchor;
use crate::chain::{BlockAnchor, ChainBackend};
use crate::contract::PartyKeys;
use crate::error::{Error, Result};
use crate::proof::{ProofFile, TransitionProof};
use crate::signer::KeyringSigner;
use crate::taproot::{self, secp};
use crate::vpacket::{AssetId, VirtualPacket};
use crate::wallet::{
    AddressRequest, AssetAddress, AssetWallet, BitcoinWallet, Party, Role, SendReceipt,
    TransferOutput,
};

/// Value of the anchor output a mock asset send creates.
pub const MOCK_SEND_ANCHOR_SATS: u64 = 1_000;

/// A wait short enough for tests that expect a timeout.
pub fn fast_wait() -> crate::params::WaitConfig {
    crate::params::WaitConfig {
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
    }
}

fn random_txid() -> Txid {
    Txid::from_byte_array(rand::random())
}

fn funding_input() -> TxIn {
    TxIn {
        previous_output: OutPoint::new(random_txid(), 0),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    }
}

// ---------------------------------------------------------------------------
// Witness checks
// ---------------------------------------------------------------------------

fn p2tr_output_key(script: &Script) -> Result<XOnlyPublicKey> {
    if !script.is_p2tr() {
        return Err(Error::Signing("prevout is not P2TR".into()));
    }
    XOnlyPublicKey::from_slice(&script.as_bytes()[2..34]).map_err(|e| Error::Signing(e.to_string()))
}

/// Verify a `[server_sig, user_sig, script, control_block]` spend of input
/// `index` through a 2-of-2 cooperative leaf.
pub fn verify_cooperative_spend(tx: &Transaction, index: usize, prevouts: &[TxOut]) -> Result<()> {
    let elements: Vec<&[u8]> = tx.input[index].witness.iter().collect();
    let [server_sig, user_sig, script, control_block] = elements[..] else {
        return Err(Error::Signing(format!(
            "input {index}: expected 4 witness elements, got {}",
            elements.len()
        )));
    };
    let script = Script::from_bytes(script);
    let bytes = script.as_bytes();
    if bytes.len() != 70 {
        return Err(Error::Signing(format!("input {index}: not a cooperative leaf")));
    }
    let user = XOnlyPublicKey::from_slice(&bytes[1..33]).map_err(|e| Error::Signing(e.to_string()))?;
    let server =
        XOnlyPublicKey::from_slice(&bytes[35..67]).map_err(|e| Error::Signing(e.to_string()))?;
    let control_block =
        ControlBlock::decode(control_block).map_err(|e| Error::Signing(e.to_string()))?;

    let output_key = p2tr_output_key(&prevouts[index].script_pubkey)?;
    if !control_block.verify_taproot_commitment(secp(), output_key, script) {
        return Err(Error::Signing(format!(
            "input {index}: control block does not commit to the spent output"
        )));
    }

    let leaf = TapLeafHash::from_script(script, control_block.leaf_version);
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            leaf,
            TapSighashType::Default,
        )
        .map_err(|e| Error::Signing(e.to_string()))?;
    let msg = Message::from_digest(sighash.to_byte_array());
    for (sig, key, who) in [(server_sig, server, "server"), (user_sig, user, "user")] {
        let sig = schnorr::Signature::from_slice(sig).map_err(|e| Error::Signing(e.to_string()))?;
        secp()
            .verify_schnorr(&sig, &msg, &key)
            .map_err(|e| Error::Signing(format!("input {index}: {who} signature: {e}")))?;
    }
    Ok(())
}

/// Verify a packet's `[signature, script, control_block]` asset witness
/// against its single input.
pub fn verify_asset_witness(packet: &VirtualPacket) -> Result<()> {
    let witness = packet
        .outputs
        .iter()
        .find_map(|o| o.witness.as_ref())
        .ok_or_else(|| Error::Wallet("packet is not signed".into()))?;
    let elements: Vec<&[u8]> = witness.iter().collect();
    let [sig, script, control_block] = elements[..] else {
        return Err(Error::Signing("expected 3 asset witness elements".into()));
    };
    let script = Script::from_bytes(script);
    if script.len() != 34 {
        return Err(Error::Signing("asset leaf is not a single-key leaf".into()));
    }
    let key = XOnlyPublicKey::from_slice(&script.as_bytes()[1..33])
        .map_err(|e| Error::Signing(e.to_string()))?;
    let control_block =
        ControlBlock::decode(control_block).map_err(|e| Error::Signing(e.to_string()))?;
    let input_key = packet.inputs[0].prev_id.script_key;
    if !control_block.verify_taproot_commitment(secp(), input_key, script) {
        return Err(Error::Signing("asset control block does not commit to the input".into()));
    }
    let digest = packet.sighash(0, TapLeafHash::from_script(script, control_block.leaf_version))?;
    let sig = schnorr::Signature::from_slice(sig).map_err(|e| Error::Signing(e.to_string()))?;
    secp()
        .verify_schnorr(&sig, &Message::from_digest(digest), &key)
        .map_err(|e| Error::Signing(format!("asset signature: {e}")))
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChainState {
    utxos: HashMap<OutPoint, TxOut>,
    spent: HashSet<OutPoint>,
    confirmed: HashMap<Txid, BlockAnchor>,
    broadcasts: Vec<Txid>,
    rejected: HashSet<Txid>,
    stalled: HashSet<Txid>,
    height: u32,
    prev_block: Option<BlockHash>,
}

impl ChainState {
    fn mine(&mut self, tx: &Transaction) -> BlockAnchor {
        self.height += 1;
        let coinbase = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Builder::new().push_int(self.height as i64).into_script(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: Vec::new(),
        };
        let block = Block {
            header: Header {
                version: BlockVersion::TWO,
                prev_blockhash: self.prev_block.unwrap_or_else(BlockHash::all_zeros),
                merkle_root: TxMerkleNode::all_zeros(),
                time: self.height,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata: vec![coinbase, tx.clone()],
        };
        self.prev_block = Some(block.block_hash());

        let txid = tx.compute_txid();
        for (vout, out) in tx.output.iter().enumerate() {
            self.utxos.insert(OutPoint::new(txid, vout as u32), out.clone());
        }
        let anchor = BlockAnchor {
            block,
            height: self.height,
            tx_index: 1,
        };
        self.confirmed.insert(txid, anchor.clone());
        anchor
    }
}

/// A chain that mines one block per accepted transaction.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm a wallet-funded transaction without input checks.
    pub fn fund(&self, tx: &Transaction) -> BlockAnchor {
        self.state.lock().expect("chain lock").mine(tx)
    }

    /// Make every future broadcast of `txid` fail.
    pub fn reject(&self, txid: Txid) {
        self.state.lock().expect("chain lock").rejected.insert(txid);
    }

    /// Accept `txid` but never confirm it.
    pub fn stall(&self, txid: Txid) {
        self.state.lock().expect("chain lock").stalled.insert(txid);
    }

    /// Txids of accepted broadcasts, in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state.lock().expect("chain lock").broadcasts.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state.lock().expect("chain lock").broadcasts.len()
    }

    pub fn is_confirmed(&self, txid: &Txid) -> bool {
        self.state.lock().expect("chain lock").confirmed.contains_key(txid)
    }

    pub fn height(&self) -> u32 {
        self.state.lock().expect("chain lock").height
    }
}

impl ChainBackend for MockChain {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let mut state = self.state.lock().map_err(|_| Error::Broadcast("chain lock".into()))?;
        let txid = tx.compute_txid();
        if state.rejected.contains(&txid) {
            return Err(Error::Broadcast(format!("{txid} rejected")));
        }

        let prevouts = tx
            .input
            .iter()
            .map(|input| {
                let outpoint = input.previous_output;
                if state.spent.contains(&outpoint) {
                    return Err(Error::Broadcast(format!("{txid}: {outpoint} already spent")));
                }
                state
                    .utxos
                    .get(&outpoint)
                    .cloned()
                    .ok_or_else(|| Error::Broadcast(format!("{txid}: unknown input {outpoint}")))
            })
            .collect::<Result<Vec<_>>>()?;
        for index in 0..tx.input.len() {
            verify_cooperative_spend(tx, index, &prevouts)
                .map_err(|e| Error::Broadcast(format!("{txid}: {e}")))?;
        }

        for input in &tx.input {
            state.spent.insert(input.previous_output);
        }
        state.broadcasts.push(txid);
        if !state.stalled.contains(&txid) {
            state.mine(tx);
        }
        Ok(txid)
    }

    fn confirmation(&self, txid: &Txid) -> Result<Option<BlockAnchor>> {
        let state = self.state.lock().map_err(|_| Error::Rpc("chain lock".into()))?;
        Ok(state.confirmed.get(txid).cloned())
    }
}

// ---------------------------------------------------------------------------
// Asset wallet
// ---------------------------------------------------------------------------

/// One transition in a mock proof file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofEntry {
    pub txid: Txid,
    pub vout: u32,
    pub height: u32,
    pub tx_index: u32,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockProofFile {
    asset_id: AssetId,
    genesis: OutPoint,
    entries: Vec<ProofEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockSuffix {
    txid: Txid,
    vout: u32,
    amount: u64,
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Proof(e.to_string()))
}

fn decode_file(file: &ProofFile) -> Result<MockProofFile> {
    serde_json::from_slice(file.as_bytes()).map_err(|e| Error::Proof(format!("proof file: {e}")))
}

/// The transition entries recorded in a mock proof file.
pub fn proof_entries(file: &ProofFile) -> Result<Vec<ProofEntry>> {
    Ok(decode_file(file)?.entries)
}

/// Deterministic asset commitment root over the assets at one anchor output.
pub fn mock_asset_root<'a>(
    asset_id: &AssetId,
    assets: impl IntoIterator<Item = (u64, &'a XOnlyPublicKey)>,
) -> TapNodeHash {
    let mut hasher = Sha256::new();
    hasher.update(b"taponark/mock-asset-root");
    hasher.update(asset_id.0);
    for (amount, key) in assets {
        hasher.update(amount.to_be_bytes());
        hasher.update(key.serialize());
    }
    TapNodeHash::from_byte_array(hasher.finalize().into())
}

pub fn genesis_point(asset_id: &AssetId) -> OutPoint {
    OutPoint::new(Txid::from_byte_array(Sha256::digest(asset_id.0).into()), 0)
}

/// State shared by every mock asset wallet: delivered addresses and the
/// proofs of received assets.
#[derive(Default)]
pub struct AssetUniverse {
    delivered: Mutex<HashSet<String>>,
    proofs: Mutex<HashMap<(AssetId, XOnlyPublicKey), ProofFile>>,
}

impl AssetUniverse {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MockAssetWallet {
    universe: Arc<AssetUniverse>,
    chain: Arc<MockChain>,
    signer: Arc<KeyringSigner>,
    withhold_deliveries: bool,
    imported: Mutex<Vec<ProofFile>>,
    next_address: AtomicU64,
}

impl MockAssetWallet {
    pub fn new(universe: Arc<AssetUniverse>, chain: Arc<MockChain>, signer: Arc<KeyringSigner>) -> Self {
        Self {
            universe,
            chain,
            signer,
            withhold_deliveries: false,
            imported: Mutex::new(Vec::new()),
            next_address: AtomicU64::new(0),
        }
    }

    /// Sends from this wallet are published but never reported as received.
    pub fn withholding_deliveries(mut self) -> Self {
        self.withhold_deliveries = true;
        self
    }

    pub fn imported(&self) -> Vec<ProofFile> {
        self.imported.lock().expect("imported lock").clone()
    }

    fn fresh_key(&self) -> Result<XOnlyPublicKey> {
        Ok(self.signer.generate_key()?.x_only_public_key().0)
    }
}

impl AssetWallet for MockAssetWallet {
    fn next_keys(&self) -> Result<PartyKeys> {
        Ok(PartyKeys {
            script_key: self.signer.generate_key()?,
            internal_key: self.signer.generate_key()?,
        })
    }

    fn new_address(&self, request: AddressRequest) -> Result<AssetAddress> {
        let script_key = match request.script_key {
            Some(key) => key,
            None => self.fresh_key()?,
        };
        let internal_key = match request.internal_key {
            Some(key) => key,
            None => self.fresh_key()?,
        };
        let n = self.next_address.fetch_add(1, Ordering::SeqCst);
        Ok(AssetAddress {
            asset_id: request.asset_id,
            amount: request.amount,
            script_key,
            internal_key,
            tapscript_sibling: request.tapscript_sibling,
            encoded: format!("taprt1{}{n}", hex::encode(&script_key.serialize()[..8])),
        })
    }

    fn send_asset(&self, address: &AssetAddress) -> Result<SendReceipt> {
        let asset_root = mock_asset_root(&address.asset_id, [(address.amount, &address.script_key)]);
        let merkle_root =
            taproot::anchor_merkle_root(asset_root, address.tapscript_sibling.map(|s| s.tap_hash()));
        let anchor_value = Amount::from_sat(MOCK_SEND_ANCHOR_SATS);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![funding_input()],
            output: vec![
                TxOut {
                    value: anchor_value,
                    script_pubkey: taproot::p2tr_script(self.fresh_key()?, None),
                },
                TxOut {
                    value: anchor_value,
                    script_pubkey: taproot::p2tr_script(address.internal_key, Some(merkle_root)),
                },
            ],
        };
        let anchor = self.chain.fund(&tx);
        let txid = tx.compute_txid();

        let genesis = genesis_point(&address.asset_id);
        let file = MockProofFile {
            asset_id: address.asset_id,
            genesis,
            entries: vec![
                ProofEntry {
                    txid: genesis.txid,
                    vout: genesis.vout,
                    height: 0,
                    tx_index: 0,
                    amount: address.amount,
                },
                ProofEntry {
                    txid,
                    vout: 1,
                    height: anchor.height,
                    tx_index: anchor.tx_index,
                    amount: address.amount,
                },
            ],
        };
        self.universe
            .proofs
            .lock()
            .map_err(|_| Error::Wallet("universe lock".into()))?
            .insert(
                (address.asset_id, address.script_key),
                ProofFile::new(encode_json(&file)?),
            );
        if !self.withhold_deliveries {
            self.universe
                .delivered
                .lock()
                .map_err(|_| Error::Wallet("universe lock".into()))?
                .insert(address.encoded.clone());
        }

        let suffix = MockSuffix {
            txid,
            vout: 1,
            amount: address.amount,
        };
        Ok(SendReceipt {
            outputs: vec![TransferOutput {
                anchor_output_index: 1,
                anchor_value,
                internal_key: address.internal_key,
                merkle_root,
                asset_root,
                tapscript_sibling: address.tapscript_sibling,
                script_key: address.script_key,
                amount: address.amount,
                proof_suffix: TransitionProof::new(encode_json(&suffix)?),
            }],
            anchor_tx: tx,
        })
    }

    fn wait_for_receive(&self, address: &AssetAddress, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let delivered = self
                .universe
                .delivered
                .lock()
                .map_err(|_| Error::Wallet("universe lock".into()))?
                .contains(&address.encoded);
            if delivered {
                return Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::Timeout(format!("asset receive at {}", address.encoded)));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn export_proof(&self, asset_id: &AssetId, script_key: &XOnlyPublicKey) -> Result<ProofFile> {
        self.universe
            .proofs
            .lock()
            .map_err(|_| Error::Wallet("universe lock".into()))?
            .get(&(*asset_id, *script_key))
            .cloned()
            .ok_or_else(|| Error::Proof(format!("no proof for {asset_id} at {script_key}")))
    }

    fn import_proof(&self, file: &ProofFile, genesis_point: OutPoint) -> Result<()> {
        let decoded = decode_file(file)?;
        if decoded.genesis != genesis_point {
            return Err(Error::Proof("genesis point mismatch".into()));
        }
        self.imported
            .lock()
            .map_err(|_| Error::Wallet("imported lock".into()))?
            .push(file.clone());
        Ok(())
    }

    fn asset_genesis(&self, asset_id: &AssetId) -> Result<OutPoint> {
        Ok(genesis_point(asset_id))
    }

    fn commit_anchor_template(&self, template: &mut Psbt, packets: &mut [VirtualPacket]) -> Result<()> {
        for packet in packets.iter() {
            packet.validate()?;
            verify_asset_witness(packet)?;
        }

        let count = template.outputs.len();
        for index in 0..count {
            let at_index: Vec<_> = packets
                .iter()
                .flat_map(|p| p.outputs.iter().map(move |o| (p.asset_id, o)))
                .filter(|(_, o)| o.anchor_output_index as usize == index)
                .collect();
            let Some((asset_id, first)) = at_index.first() else {
                continue;
            };
            let root = mock_asset_root(asset_id, at_index.iter().map(|(_, o)| (o.amount, &o.script_key)));
            anchor::apply_output_commitment(template, index, root, first.tapscript_sibling.as_ref())?;
        }

        let txid = template.unsigned_tx.compute_txid();
        for packet in packets.iter_mut() {
            for output in &mut packet.outputs {
                let suffix = MockSuffix {
                    txid,
                    vout: output.anchor_output_index,
                    amount: output.amount,
                };
                output.proof_suffix = Some(TransitionProof::new(encode_json(&suffix)?));
            }
        }
        Ok(())
    }

    fn append_transition_proof(
        &self,
        file: &ProofFile,
        suffix: &TransitionProof,
        tx: &Transaction,
        anchor: &BlockAnchor,
    ) -> Result<ProofFile> {
        let mut decoded = decode_file(file)?;
        let suffix: MockSuffix = serde_json::from_slice(suffix.as_bytes())
            .map_err(|e| Error::Proof(format!("transition proof: {e}")))?;
        let txid = tx.compute_txid();
        if suffix.txid != txid {
            return Err(Error::Proof(format!("suffix is for {}, not {txid}", suffix.txid)));
        }
        let in_block = anchor
            .block
            .txdata
            .get(anchor.tx_index as usize)
            .map(|t| t.compute_txid());
        if in_block != Some(txid) {
            return Err(Error::Proof(format!("{txid} is not at index {} of its block", anchor.tx_index)));
        }
        let parent = decoded
            .entries
            .last()
            .ok_or_else(|| Error::Proof("empty proof file".into()))?;
        let parent_outpoint = OutPoint::new(parent.txid, parent.vout);
        if !tx.input.iter().any(|i| i.previous_output == parent_outpoint) {
            return Err(Error::Proof(format!("{txid} does not spend {parent_outpoint}")));
        }

        decoded.entries.push(ProofEntry {
            txid,
            vout: suffix.vout,
            height: anchor.height,
            tx_index: anchor.tx_index,
            amount: suffix.amount,
        });
        Ok(ProofFile::new(encode_json(&decoded)?))
    }
}

// ---------------------------------------------------------------------------
// Bitcoin wallet
// ---------------------------------------------------------------------------

pub struct MockBitcoinWallet {
    chain: Arc<MockChain>,
    signer: Arc<KeyringSigner>,
}

impl MockBitcoinWallet {
    pub fn new(chain: Arc<MockChain>, signer: Arc<KeyringSigner>) -> Self {
        Self { chain, signer }
    }
}

impl BitcoinWallet for MockBitcoinWallet {
    fn send_output(&self, amount: Amount, pk_script: &Script) -> Result<Transaction> {
        let change_key = self.signer.generate_key()?.x_only_public_key().0;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![funding_input()],
            output: vec![
                TxOut {
                    value: Amount::from_sat(50_000),
                    script_pubkey: taproot::p2tr_script(change_key, None),
                },
                TxOut {
                    value: amount,
                    script_pubkey: pk_script.to_owned(),
                },
            ],
        };
        self.chain.fund(&tx);
        Ok(tx)
    }

    fn next_taproot_key(&self) -> Result<XOnlyPublicKey> {
        Ok(self.signer.generate_key()?.x_only_public_key().0)
    }
}

// ---------------------------------------------------------------------------
// Parties
// ---------------------------------------------------------------------------

/// A party wired to mocks, with handles for inspection.
pub struct TestParty {
    pub party: Party,
    pub assets: Arc<MockAssetWallet>,
    pub signer: Arc<KeyringSigner>,
}

/// A shared chain and asset universe that test parties connect to.
#[derive(Clone, Default)]
pub struct MockNetwork {
    pub chain: Arc<MockChain>,
    pub universe: Arc<AssetUniverse>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn party(&self, role: Role) -> TestParty {
        self.build_party(role, false)
    }

    /// A party whose asset sends are never reported as received.
    pub fn withholding_party(&self, role: Role) -> TestParty {
        self.build_party(role, true)
    }

    fn build_party(&self, role: Role, withhold: bool) -> TestParty {
        let signer = Arc::new(KeyringSigner::new());
        let mut assets = MockAssetWallet::new(self.universe.clone(), self.chain.clone(), signer.clone());
        if withhold {
            assets = assets.withholding_deliveries();
        }
        let assets = Arc::new(assets);
        let wallet = Arc::new(MockBitcoinWallet::new(self.chain.clone(), signer.clone()));
        TestParty {
            party: Party::new(role, assets.clone(), wallet, signer.clone()),
            assets,
            signer,
        }
    }
}

/// A single party on a fresh mock network.
pub fn test_party(role: Role) -> Party {
    MockNetwork::new().party(role).party
}
