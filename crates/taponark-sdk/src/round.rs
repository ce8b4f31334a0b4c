use std::slice;

use bitcoin::Transaction;

use crate::anchor::{self, add_btc_input, add_btc_output, prepare_anchor_template, set_output_value};
use crate::boarding::BoardingTransfer;
use crate::contract::ArkContract;
use crate::error::{Error, Result};
use crate::params::{ContractFlavor, RoundPolicy};
use crate::signing::SigningCoordinator;
use crate::transfer::{ChainTransfer, derive_chain_transfer};
use crate::tree::{NodeKind, NodeOutput, OutputKind, RoundTree, RoundTreeNode};
use crate::vpacket::{AssetId, VOutput, VOutputKind, VirtualPacket};
use crate::wallet::{AddressRequest, Party};

/// The signed but unpublished round-root transaction and the contract that
/// protects its output.
#[derive(Debug)]
pub struct RoundRoot {
    pub contract: ArkContract,
    pub transfer: ChainTransfer,
}

impl RoundRoot {
    pub fn transaction(&self) -> &Transaction {
        &self.transfer.final_tx
    }
}

/// Builds a round root and the settlement tree below it, entirely off-chain.
///
/// Construction is sequential: each node is funded by the transfer derived
/// from its parent, and every contract's nonces are spent exactly once.
pub struct RoundTreeBuilder {
    asset_id: AssetId,
    user: Party,
    server: Party,
    policy: RoundPolicy,
}

impl RoundTreeBuilder {
    pub fn new(asset_id: AssetId, user: Party, server: Party, policy: RoundPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            asset_id,
            user,
            server,
            policy,
        })
    }

    pub fn policy(&self) -> &RoundPolicy {
        &self.policy
    }

    fn signer(&self) -> SigningCoordinator<'_> {
        SigningCoordinator::new(&self.user, &self.server)
    }

    fn new_contract(&self) -> Result<ArkContract> {
        ArkContract::issue(ContractFlavor::Round, &self.user, &self.server, &self.policy)
    }

    /// Spend both boarding legs into one round-root output worth the sum of
    /// the deposits minus the fee.
    ///
    /// Each call signs with fresh boarding nonces, so a round that failed
    /// further down can be rebuilt from the same boarding.
    pub fn build_round_root(&self, boarding: &mut BoardingTransfer) -> Result<RoundRoot> {
        boarding.asset.contract.renew_nonces()?;
        let mut contract = self.new_contract()?;
        let deposit = &boarding.asset.transfer;

        let mut packet = VirtualPacket::interactive_send(self.asset_id);
        packet.bind_input(deposit)?;
        packet.add_output(VOutput::ark(
            deposit.asset_amount,
            VOutputKind::Simple,
            contract.asset_script().output_key(),
            0,
            contract.btc_script().sibling_preimage(),
        ));
        self.signer()
            .sign_asset_transfer(&mut boarding.asset.contract, &mut packet)?;

        let mut template = prepare_anchor_template(slice::from_ref(&packet), self.policy.asset_dust())?;
        let btc_index = add_btc_input(
            &mut template,
            boarding.btc.outpoint,
            boarding.btc.txout.clone(),
            boarding.btc.contract.btc_script(),
        )?;
        let value = (deposit.anchor_value + boarding.btc.txout.value)
            .checked_sub(self.policy.fee())
            .ok_or_else(|| Error::Construction("boarding deposits do not cover the fee".into()))?;
        set_output_value(&mut template, 0, value)?;

        self.server
            .assets
            .commit_anchor_template(&mut template, slice::from_mut(&mut packet))?;
        self.signer().sign_anchor_inputs(
            &mut template,
            &[(0, &boarding.asset.contract), (btc_index, &boarding.btc.contract)],
        )?;

        let transfer = derive_chain_transfer(&template, &packet.outputs[0])?;
        contract.btc_script_mut().bind(transfer.taproot_asset_root)?;
        log::info!(
            "round: root {} anchors {} units and {}",
            transfer.outpoint,
            transfer.asset_amount,
            transfer.anchor_value
        );
        Ok(RoundRoot { contract, transfer })
    }

    /// Build the settlement tree of depth `level` spending the round root.
    pub fn build_tree(&self, root: &mut RoundRoot, level: u32) -> Result<RoundTree> {
        let node = self.build_node(&mut root.contract, &root.transfer, level)?;
        let tree = RoundTree {
            root: Box::new(node),
            level,
        };
        log::info!(
            "round: built tree with {} branches and {} leaves",
            tree.branch_count(),
            tree.leaf_count()
        );
        Ok(tree)
    }

    pub fn build_node(
        &self,
        contract: &mut ArkContract,
        input: &ChainTransfer,
        level: u32,
    ) -> Result<RoundTreeNode> {
        if level == 0 {
            self.build_leaf(contract, input)
        } else {
            self.build_branch(contract, input, level)
        }
    }

    fn build_branch(
        &self,
        contract: &mut ArkContract,
        input: &ChainTransfer,
        level: u32,
    ) -> Result<RoundTreeNode> {
        let mut left = self.new_contract()?;
        let mut right = self.new_contract()?;

        let right_asset = input.asset_amount / 2;
        let left_asset = input.asset_amount - right_asset;
        if right_asset == 0 {
            return Err(Error::Construction(format!(
                "asset amount {} is too small to split",
                input.asset_amount
            )));
        }
        let (left_btc, right_btc) = self.policy.branch_split(input.anchor_value)?;

        let mut packet = VirtualPacket::interactive_send(self.asset_id);
        packet.bind_input(input)?;
        packet.add_output(VOutput::ark(
            left_asset,
            VOutputKind::SplitRoot,
            left.asset_script().output_key(),
            0,
            left.btc_script().sibling_preimage(),
        ));
        packet.add_output(VOutput::ark(
            right_asset,
            VOutputKind::Simple,
            right.asset_script().output_key(),
            1,
            right.btc_script().sibling_preimage(),
        ));
        self.signer().sign_asset_transfer(contract, &mut packet)?;

        let mut template = prepare_anchor_template(slice::from_ref(&packet), self.policy.asset_dust())?;
        set_output_value(&mut template, 0, left_btc)?;
        set_output_value(&mut template, 1, right_btc)?;
        self.server
            .assets
            .commit_anchor_template(&mut template, slice::from_mut(&mut packet))?;
        self.signer()
            .sign_anchor_inputs(&mut template, &[(0, &*contract)])?;

        let left_transfer = derive_chain_transfer(&template, &packet.outputs[0])?;
        let right_transfer = derive_chain_transfer(&template, &packet.outputs[1])?;
        left.btc_script_mut().bind(left_transfer.taproot_asset_root)?;
        right.btc_script_mut().bind(right_transfer.taproot_asset_root)?;
        log::debug!(
            "round: branch {} at level {level} splits {}/{} units",
            left_transfer.txid(),
            left_asset,
            right_asset
        );

        let left_child = self.build_node(&mut left, &left_transfer, level - 1)?;
        let right_child = self.build_node(&mut right, &right_transfer, level - 1)?;

        Ok(RoundTreeNode {
            kind: NodeKind::Branch,
            transaction: left_transfer.final_tx.clone(),
            left_output: combined_output(&left_transfer),
            right_output: combined_output(&right_transfer),
            left_child: Some(Box::new(left_child)),
            right_child: Some(Box::new(right_child)),
        })
    }

    /// Pay the input's asset to a fresh user address and the remaining
    /// bitcoin to a fresh user key.
    fn build_leaf(&self, contract: &mut ArkContract, input: &ChainTransfer) -> Result<RoundTreeNode> {
        let btc_amount = self.policy.leaf_btc(input.anchor_value)?;
        let address = self
            .user
            .assets
            .new_address(AddressRequest::plain(self.asset_id, input.asset_amount))?;

        let mut packet = VirtualPacket::from_address(&address);
        packet.bind_input(input)?;
        self.signer().sign_asset_transfer(contract, &mut packet)?;

        let mut template = prepare_anchor_template(slice::from_ref(&packet), self.policy.asset_dust())?;
        set_output_value(&mut template, 0, self.policy.change_dust())?;
        set_output_value(&mut template, 1, self.policy.asset_dust())?;
        let payout_key = self.user.wallet.next_taproot_key()?;
        let btc_vout = add_btc_output(&mut template, btc_amount, payout_key);

        self.server
            .assets
            .commit_anchor_template(&mut template, slice::from_mut(&mut packet))?;
        self.signer()
            .sign_anchor_inputs(&mut template, &[(0, &*contract)])?;

        let asset_transfer = derive_chain_transfer(&template, &packet.outputs[1])?;
        let transaction = anchor::extract_final_tx(&template)?;
        log::debug!(
            "round: leaf {} pays {} units and {btc_amount}",
            asset_transfer.txid(),
            asset_transfer.asset_amount
        );

        Ok(RoundTreeNode {
            kind: NodeKind::Leaf,
            transaction,
            left_output: NodeOutput {
                kind: OutputKind::Asset,
                vout: asset_transfer.outpoint.vout,
                asset_amount: asset_transfer.asset_amount,
                btc_amount: asset_transfer.anchor_value,
                proof_suffix: Some(asset_transfer.proof_suffix),
                proof: None,
            },
            right_output: NodeOutput {
                kind: OutputKind::Btc,
                vout: btc_vout as u32,
                asset_amount: 0,
                btc_amount,
                proof_suffix: None,
                proof: None,
            },
            left_child: None,
            right_child: None,
        })
    }
}

fn combined_output(transfer: &ChainTransfer) -> NodeOutput {
    NodeOutput {
        kind: OutputKind::CombinedAssetAndBtc,
        vout: transfer.outpoint.vout,
        asset_amount: transfer.asset_amount,
        btc_amount: transfer.anchor_value,
        proof_suffix: Some(transfer.proof_suffix.clone()),
        proof: None,
    }
}
