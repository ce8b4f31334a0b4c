use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_CLTV, OP_EQUAL};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, XOnlyPublicKey};
use bitcoin::taproot::{
    ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootBuilder, TaprootSpendInfo,
};
use bitcoin::{Script, ScriptBuf};
use musig2::PubNonce;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::musig::{self, SessionNonce};
use crate::params::{ContractFlavor, ExitKeyHolder, RoundPolicy};
use crate::taproot::{self, TapscriptPreimage};
use crate::wallet::Party;

/// One party's keys for one contract: the asset-layer script key and the
/// wallet internal key used on the Bitcoin layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyKeys {
    pub script_key: PublicKey,
    pub internal_key: PublicKey,
}

/// `<user> CHECKSIG <server> CHECKSIGADD 2 EQUAL`.
pub fn cooperative_script(user: XOnlyPublicKey, server: XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(&user)
        .push_opcode(OP_CHECKSIG)
        .push_x_only_key(&server)
        .push_opcode(OP_CHECKSIGADD)
        .push_int(2)
        .push_opcode(OP_EQUAL)
        .into_script()
}

/// `<aggregate> CHECKSIG`.
pub fn aggregate_key_script(aggregate: XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(&aggregate)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `<locktime> CHECKLOCKTIMEVERIFY <key> CHECKSIG`.
pub fn unilateral_script(locktime: u32, key: XOnlyPublicKey) -> Result<ScriptBuf> {
    let height = LockTime::from_height(locktime)
        .map_err(|e| Error::Construction(format!("locktime {locktime}: {e}")))?;
    Ok(Builder::new()
        .push_lock_time(height)
        .push_opcode(OP_CLTV)
        .push_x_only_key(&key)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

/// The two-leaf script pair of one layer of an [`ArkContract`].
///
/// The control block stays unset until the sibling asset root is known;
/// see [`TaprootScriptPair::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaprootScriptPair {
    cooperative_leaf: ScriptBuf,
    unilateral_leaf: ScriptBuf,
    branch: TapNodeHash,
    control_block: Option<ControlBlock>,
}

impl TaprootScriptPair {
    pub fn new(cooperative_leaf: ScriptBuf, unilateral_leaf: ScriptBuf) -> Self {
        let branch = TapNodeHash::from_node_hashes(
            TapLeafHash::from_script(&cooperative_leaf, LeafVersion::TapScript).into(),
            TapLeafHash::from_script(&unilateral_leaf, LeafVersion::TapScript).into(),
        );
        Self {
            cooperative_leaf,
            unilateral_leaf,
            branch,
            control_block: None,
        }
    }

    pub fn cooperative_leaf(&self) -> &Script {
        &self.cooperative_leaf
    }

    pub fn unilateral_leaf(&self) -> &Script {
        &self.unilateral_leaf
    }

    pub fn cooperative_leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.cooperative_leaf, LeafVersion::TapScript)
    }

    pub fn unilateral_leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.unilateral_leaf, LeafVersion::TapScript)
    }

    /// Hash of the branch joining both leaves.
    pub fn branch(&self) -> TapNodeHash {
        self.branch
    }

    /// The branch as a tapscript sibling preimage.
    pub fn sibling_preimage(&self) -> TapscriptPreimage {
        TapscriptPreimage::from_leaves(self.cooperative_leaf_hash(), self.unilateral_leaf_hash())
    }

    pub fn control_block(&self) -> Option<&ControlBlock> {
        self.control_block.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.control_block.is_some()
    }

    /// Bind the control block to `asset_root`, replacing any earlier binding.
    pub fn bind(&mut self, asset_root: TapNodeHash) -> Result<&ControlBlock> {
        let control_block = taproot::bind_control_block(self, asset_root)?;
        Ok(self.control_block.insert(control_block))
    }

    pub fn require_control_block(&self) -> Result<&ControlBlock> {
        self.control_block
            .as_ref()
            .ok_or_else(|| Error::ControlBlockUnbound(format!("branch {}", self.branch)))
    }

    /// P2TR script of the output this pair protects, once bound.
    pub fn output_script(&self) -> Result<ScriptBuf> {
        let control_block = self.require_control_block()?;
        let key = taproot::bound_output_key(control_block, &self.cooperative_leaf);
        Ok(ScriptBuf::new_p2tr_tweaked(key))
    }
}

fn exit_key(
    flavor: ContractFlavor,
    policy: &RoundPolicy,
    user: XOnlyPublicKey,
    server: XOnlyPublicKey,
) -> XOnlyPublicKey {
    match policy.exit_key_holder(flavor) {
        ExitKeyHolder::User => user,
        ExitKeyHolder::Server => server,
    }
}

/// Bitcoin-layer pair: raw 2-of-2 cooperative leaf plus the CLTV leaf.
pub fn btc_script_pair(
    user: XOnlyPublicKey,
    server: XOnlyPublicKey,
    flavor: ContractFlavor,
    policy: &RoundPolicy,
) -> Result<TaprootScriptPair> {
    let cooperative = cooperative_script(user, server);
    let unilateral = unilateral_script(policy.locktime, exit_key(flavor, policy, user, server))?;
    Ok(TaprootScriptPair::new(cooperative, unilateral))
}

/// Asset-layer script tree: aggregate-key leaf plus the CLTV leaf, under the
/// NUMS internal key, with one pre-generated nonce per party.
#[derive(Debug)]
pub struct AssetScript {
    leaves: TaprootScriptPair,
    spend_info: TaprootSpendInfo,
    signers: [PublicKey; 2],
    aggregate_key: XOnlyPublicKey,
    user_nonce: SessionNonce,
    server_nonce: SessionNonce,
}

impl AssetScript {
    pub fn new(
        user_script_key: PublicKey,
        server_script_key: PublicKey,
        flavor: ContractFlavor,
        policy: &RoundPolicy,
    ) -> Result<Self> {
        let signers = musig::sorted_signers(user_script_key, server_script_key);
        let ctx = musig::key_agg_context(&signers)?;
        let aggregate: PublicKey = ctx.aggregated_pubkey();
        let aggregate_key = aggregate.x_only_public_key().0;

        let user = user_script_key.x_only_public_key().0;
        let server = server_script_key.x_only_public_key().0;
        let cooperative = aggregate_key_script(aggregate_key);
        let unilateral =
            unilateral_script(policy.locktime, exit_key(flavor, policy, user, server))?;

        let spend_info = TaprootBuilder::new()
            .add_leaf(1, cooperative.clone())
            .and_then(|b| b.add_leaf(1, unilateral.clone()))
            .map_err(|e| Error::Construction(format!("asset script tree: {e}")))?
            .finalize(taproot::secp(), taproot::nums_internal_key())
            .map_err(|_| Error::Construction("asset script tree is incomplete".into()))?;

        Ok(Self {
            leaves: TaprootScriptPair::new(cooperative, unilateral),
            spend_info,
            signers,
            aggregate_key,
            user_nonce: SessionNonce::generate(user_script_key, aggregate),
            server_nonce: SessionNonce::generate(server_script_key, aggregate),
        })
    }

    pub fn leaves(&self) -> &TaprootScriptPair {
        &self.leaves
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn merkle_root(&self) -> Option<TapNodeHash> {
        self.spend_info.merkle_root()
    }

    /// Tweaked output key; this is the asset script key funds are sent to.
    pub fn output_key(&self) -> XOnlyPublicKey {
        self.spend_info.output_key().to_x_only_public_key()
    }

    pub fn aggregate_key(&self) -> XOnlyPublicKey {
        self.aggregate_key
    }

    /// Signer keys in aggregation order.
    pub fn signers(&self) -> &[PublicKey; 2] {
        &self.signers
    }

    pub fn user_public_nonce(&self) -> &PubNonce {
        self.user_nonce.public()
    }

    pub fn server_public_nonce(&self) -> &PubNonce {
        self.server_nonce.public()
    }

    pub(crate) fn nonces_mut(&mut self) -> (&mut SessionNonce, &mut SessionNonce) {
        (&mut self.user_nonce, &mut self.server_nonce)
    }

    /// Replace both nonces with fresh ones; the tree and keys do not depend
    /// on them.
    fn renew_nonces(&mut self, user_script_key: PublicKey, server_script_key: PublicKey) -> Result<()> {
        let aggregate: PublicKey = musig::key_agg_context(&self.signers)?.aggregated_pubkey();
        self.user_nonce = SessionNonce::generate(user_script_key, aggregate);
        self.server_nonce = SessionNonce::generate(server_script_key, aggregate);
        Ok(())
    }

    /// Control block for `leaf`, found by matching its tap hash against the
    /// tree's leaf inclusion proofs.
    pub fn control_block_for(&self, leaf: &Script) -> Result<ControlBlock> {
        let target = TapLeafHash::from_script(leaf, LeafVersion::TapScript);
        self.spend_info
            .script_map()
            .keys()
            .find(|(script, version)| TapLeafHash::from_script(script, *version) == target)
            .and_then(|key| self.spend_info.control_block(key))
            .ok_or_else(|| Error::Signing(format!("leaf {target} is not part of the asset tree")))
    }
}

/// Spend conditions of one boarding or round output.
#[derive(Debug)]
pub struct ArkContract {
    flavor: ContractFlavor,
    user: PartyKeys,
    server: PartyKeys,
    btc_script: TaprootScriptPair,
    asset_script: AssetScript,
}

impl ArkContract {
    pub fn new(
        flavor: ContractFlavor,
        user: PartyKeys,
        server: PartyKeys,
        policy: &RoundPolicy,
    ) -> Result<Self> {
        let btc_script = btc_script_pair(
            user.internal_key.x_only_public_key().0,
            server.internal_key.x_only_public_key().0,
            flavor,
            policy,
        )?;
        let asset_script = AssetScript::new(user.script_key, server.script_key, flavor, policy)?;
        Ok(Self {
            flavor,
            user,
            server,
            btc_script,
            asset_script,
        })
    }

    /// Draw fresh keys from both parties' asset wallets and build a contract.
    pub fn issue(
        flavor: ContractFlavor,
        user: &Party,
        server: &Party,
        policy: &RoundPolicy,
    ) -> Result<Self> {
        let user_keys = user.assets.next_keys()?;
        let server_keys = server.assets.next_keys()?;
        Self::new(flavor, user_keys, server_keys, policy)
    }

    pub fn flavor(&self) -> ContractFlavor {
        self.flavor
    }

    pub fn user_keys(&self) -> &PartyKeys {
        &self.user
    }

    pub fn server_keys(&self) -> &PartyKeys {
        &self.server
    }

    pub fn btc_script(&self) -> &TaprootScriptPair {
        &self.btc_script
    }

    pub fn btc_script_mut(&mut self) -> &mut TaprootScriptPair {
        &mut self.btc_script
    }

    pub fn asset_script(&self) -> &AssetScript {
        &self.asset_script
    }

    pub(crate) fn asset_script_mut(&mut self) -> &mut AssetScript {
        &mut self.asset_script
    }

    /// Draw a fresh nonce pair for the asset leaf, discarding the old one
    /// whether or not it was spent.
    pub fn renew_nonces(&mut self) -> Result<()> {
        self.asset_script
            .renew_nonces(self.user.script_key, self.server.script_key)
    }
}
