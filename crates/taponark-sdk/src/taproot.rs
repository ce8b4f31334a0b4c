use bitcoin::hashes::Hash;
use bitcoin::key::{Parity, TapTweak, TweakedPublicKey};
use bitcoin::secp256k1::{All, SECP256K1, Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootMerkleBranch};
use bitcoin::{Script, ScriptBuf};

use crate::contract::TaprootScriptPair;
use crate::error::{Error, Result};

/// NUMS (Nothing Up My Sleeve) key: the provably unspendable BIP-341 internal key.
pub const NUMS_KEY_BYTES: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

/// Shared global secp256k1 context.
pub(crate) fn secp() -> &'static Secp256k1<All> {
    SECP256K1
}

pub fn nums_internal_key() -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&NUMS_KEY_BYTES).expect("NUMS key is a valid x-only public key")
}

/// Tweak `internal_key` by `merkle_root` (BIP-341 `TapTweak`).
pub fn output_key(
    internal_key: XOnlyPublicKey,
    merkle_root: Option<TapNodeHash>,
) -> (TweakedPublicKey, Parity) {
    internal_key.tap_tweak(secp(), merkle_root)
}

/// P2TR script paying to `internal_key` tweaked by `merkle_root`.
pub fn p2tr_script(internal_key: XOnlyPublicKey, merkle_root: Option<TapNodeHash>) -> ScriptBuf {
    ScriptBuf::new_p2tr(secp(), internal_key, merkle_root)
}

/// Merkle root of an anchor output: the asset commitment leaf, optionally
/// paired with a tapscript sibling.
pub fn anchor_merkle_root(asset_root: TapNodeHash, sibling: Option<TapNodeHash>) -> TapNodeHash {
    match sibling {
        Some(sibling) => TapNodeHash::from_node_hashes(asset_root, sibling),
        None => asset_root,
    }
}

/// Fold `script`'s leaf hash up through the control block's inclusion proof.
pub fn control_block_root(control_block: &ControlBlock, script: &Script) -> TapNodeHash {
    let leaf = TapLeafHash::from_script(script, control_block.leaf_version);
    control_block
        .merkle_branch
        .iter()
        .fold(TapNodeHash::from(leaf), |node, sibling| {
            TapNodeHash::from_node_hashes(node, *sibling)
        })
}

/// Build the Bitcoin-side control block for `pair`'s cooperative leaf under
/// an output whose tree is `Branch(Branch(cooperative, unilateral), asset_root)`.
///
/// The inclusion proof is `unilateral_leaf_hash || asset_root`; the output key
/// parity is taken from the NUMS key tweaked by the resulting root. A control
/// block built for one asset root does not verify against any other.
pub fn bind_control_block(pair: &TaprootScriptPair, asset_root: TapNodeHash) -> Result<ControlBlock> {
    let unilateral = TapNodeHash::from(pair.unilateral_leaf_hash());

    let mut proof = Vec::with_capacity(64);
    proof.extend_from_slice(unilateral.as_byte_array());
    proof.extend_from_slice(asset_root.as_byte_array());
    let merkle_branch = TaprootMerkleBranch::decode(&proof)
        .map_err(|e| Error::Construction(format!("inclusion proof: {e}")))?;

    let internal_key = nums_internal_key();
    let mut control_block = ControlBlock {
        leaf_version: LeafVersion::TapScript,
        output_key_parity: Parity::Even,
        internal_key,
        merkle_branch,
    };

    let root = control_block_root(&control_block, pair.cooperative_leaf());
    let (_, parity) = output_key(internal_key, Some(root));
    control_block.output_key_parity = parity;

    Ok(control_block)
}

/// Output key committed to by a bound control block.
pub fn bound_output_key(control_block: &ControlBlock, script: &Script) -> TweakedPublicKey {
    let root = control_block_root(control_block, script);
    output_key(control_block.internal_key, Some(root)).0
}

/// A tapscript sibling placed next to the asset commitment in an anchor output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapscriptPreimage {
    /// An inner branch, given by its two child hashes.
    Branch(TapNodeHash, TapNodeHash),
}

impl TapscriptPreimage {
    pub fn from_leaves(left: TapLeafHash, right: TapLeafHash) -> Self {
        TapscriptPreimage::Branch(TapNodeHash::from(left), TapNodeHash::from(right))
    }

    pub fn tap_hash(&self) -> TapNodeHash {
        match self {
            TapscriptPreimage::Branch(left, right) => TapNodeHash::from_node_hashes(*left, *right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::btc_script_pair;
    use crate::params::{ContractFlavor, RoundPolicy};
    use bitcoin::secp256k1::{Keypair, SecretKey};

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(secp(), &sk).x_only_public_key().0
    }

    fn pair() -> TaprootScriptPair {
        btc_script_pair(
            xonly(1),
            xonly(2),
            ContractFlavor::Round,
            &RoundPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn nums_key_is_the_constant() {
        assert_eq!(nums_internal_key().serialize(), NUMS_KEY_BYTES);
    }

    #[test]
    fn binder_proof_is_unilateral_then_asset_root() {
        let pair = pair();
        let root = TapNodeHash::from_byte_array([7u8; 32]);
        let cb = bind_control_block(&pair, root).unwrap();
        let branch: Vec<_> = cb.merkle_branch.iter().copied().collect();
        assert_eq!(branch, vec![TapNodeHash::from(pair.unilateral_leaf_hash()), root]);
        assert_eq!(cb.internal_key, nums_internal_key());
    }

    #[test]
    fn binder_root_matches_anchor_merkle_root() {
        let pair = pair();
        let asset_root = TapNodeHash::from_byte_array([9u8; 32]);
        let cb = bind_control_block(&pair, asset_root).unwrap();
        let expected = anchor_merkle_root(asset_root, Some(pair.branch()));
        assert_eq!(control_block_root(&cb, pair.cooperative_leaf()), expected);
    }

    #[test]
    fn distinct_roots_give_distinct_non_interchangeable_blocks() {
        let pair = pair();
        let r1 = TapNodeHash::from_byte_array([1u8; 32]);
        let r2 = TapNodeHash::from_byte_array([2u8; 32]);
        let cb1 = bind_control_block(&pair, r1).unwrap();
        let cb2 = bind_control_block(&pair, r2).unwrap();

        let key1 = bound_output_key(&cb1, pair.cooperative_leaf());
        let key2 = bound_output_key(&cb2, pair.cooperative_leaf());
        assert_ne!(key1, key2);

        let script = pair.cooperative_leaf();
        assert!(cb1.verify_taproot_commitment(secp(), key1.to_x_only_public_key(), script));
        assert!(cb2.verify_taproot_commitment(secp(), key2.to_x_only_public_key(), script));
        assert!(!cb1.verify_taproot_commitment(secp(), key2.to_x_only_public_key(), script));
        assert!(!cb2.verify_taproot_commitment(secp(), key1.to_x_only_public_key(), script));
    }

    #[test]
    fn sibling_preimage_hashes_to_branch() {
        let pair = pair();
        let preimage = pair.sibling_preimage();
        assert_eq!(preimage.tap_hash(), pair.branch());
        assert_ne!(
            preimage.tap_hash(),
            TapscriptPreimage::from_leaves(pair.unilateral_leaf_hash(), pair.unilateral_leaf_hash())
                .tap_hash()
        );
    }
}
