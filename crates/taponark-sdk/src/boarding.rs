//! Boarding: a user's asset and bitcoin deposits into Ark contracts.
//!
//! The asset leg goes to a server-issued address whose script key is the
//! boarding contract's asset output key and whose tapscript sibling is the
//! contract's bitcoin branch. The bitcoin leg pays a second boarding
//! contract bound to the same asset root, so both legs can later be spent
//! together by the round root.

use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};

use crate::chain::{self, BlockAnchor, ChainBackend};
use crate::contract::ArkContract;
use crate::error::{Error, Result};
use crate::params::{ContractFlavor, RoundPolicy, WaitConfig};
use crate::proof::ProofFile;
use crate::taproot;
use crate::transfer::ChainTransfer;
use crate::vpacket::AssetId;
use crate::wallet::{AddressRequest, AssetAddress, AssetWallet, Party};

/// The asset leg of a boarding.
#[derive(Debug)]
pub struct AssetDeposit {
    pub contract: ArkContract,
    pub address: AssetAddress,
    pub transfer: ChainTransfer,
}

/// The bitcoin leg of a boarding.
#[derive(Debug)]
pub struct BtcDeposit {
    pub contract: ArkContract,
    pub tx: Transaction,
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

/// Both deposit legs of one user, ready to seed a round root.
#[derive(Debug)]
pub struct BoardingTransfer {
    pub asset: AssetDeposit,
    pub btc: BtcDeposit,
    pub user: Party,
}

impl BoardingTransfer {
    /// Create both boarding contracts and send both deposits. Does not wait
    /// for either to settle.
    pub fn open(
        user: &Party,
        server: &Party,
        asset_id: AssetId,
        asset_amount: u64,
        btc_amount: Amount,
        policy: &RoundPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        if asset_amount == 0 {
            return Err(Error::Construction("boarding asset amount is zero".into()));
        }

        let mut asset_contract = ArkContract::issue(ContractFlavor::Boarding, user, server, policy)?;
        let address = server.assets.new_address(AddressRequest {
            asset_id,
            amount: asset_amount,
            script_key: Some(asset_contract.asset_script().output_key()),
            internal_key: Some(taproot::nums_internal_key()),
            tapscript_sibling: Some(asset_contract.btc_script().sibling_preimage()),
        })?;

        let receipt = user.assets.send_asset(&address)?;
        let output = receipt.output_for(&address.script_key).ok_or_else(|| {
            Error::Wallet(format!(
                "send {} has no output for {}",
                receipt.anchor_tx.compute_txid(),
                address.encoded
            ))
        })?;
        let transfer = ChainTransfer::from_sent_output(&receipt.anchor_tx, output)?;

        asset_contract
            .btc_script_mut()
            .bind(transfer.taproot_asset_root)?;
        let anchored = &receipt.anchor_tx.output[transfer.outpoint.vout as usize].script_pubkey;
        if asset_contract.btc_script().output_script()? != *anchored {
            return Err(Error::Construction(format!(
                "asset deposit {} does not commit to the boarding contract",
                transfer.outpoint
            )));
        }
        log::info!(
            "boarding: asset deposit {} ({} units)",
            transfer.outpoint,
            asset_amount
        );

        let (btc_contract, tx, outpoint) =
            Self::send_btc_leg(user, server, policy, &transfer, btc_amount).map_err(|e| {
                Error::BoardingIncomplete {
                    asset_outpoint: transfer.outpoint,
                    address: address.encoded.clone(),
                    source: Box::new(e),
                }
            })?;
        let txout = tx.output[outpoint.vout as usize].clone();
        log::info!("boarding: btc deposit {outpoint} ({})", txout.value);

        Ok(Self {
            asset: AssetDeposit {
                contract: asset_contract,
                address,
                transfer,
            },
            btc: BtcDeposit {
                contract: btc_contract,
                tx,
                outpoint,
                txout,
            },
            user: user.clone(),
        })
    }

    fn send_btc_leg(
        user: &Party,
        server: &Party,
        policy: &RoundPolicy,
        asset: &ChainTransfer,
        btc_amount: Amount,
    ) -> Result<(ArkContract, Transaction, OutPoint)> {
        let mut contract = ArkContract::issue(ContractFlavor::Boarding, user, server, policy)?;
        contract.btc_script_mut().bind(asset.taproot_asset_root)?;
        let pk_script = contract.btc_script().output_script()?;
        let tx = user.wallet.send_output(btc_amount, &pk_script)?;
        let vout = tx
            .output
            .iter()
            .position(|o| o.script_pubkey == pk_script)
            .ok_or_else(|| {
                Error::Wallet(format!(
                    "btc deposit {} does not pay the boarding contract",
                    tx.compute_txid()
                ))
            })?;
        let outpoint = OutPoint::new(tx.compute_txid(), vout as u32);
        Ok((contract, tx, outpoint))
    }

    pub fn btc_txid(&self) -> Txid {
        self.btc.outpoint.txid
    }

    /// Wait for the bitcoin deposit to confirm, then for the server to
    /// receive the asset deposit. Each wait runs to its own deadline;
    /// [`TaponarkNode::board_user`](crate::node::TaponarkNode::board_user)
    /// runs the two side by side.
    pub fn wait_for_deposits(
        &self,
        chain: &dyn ChainBackend,
        server: &Party,
        wait: &WaitConfig,
    ) -> Result<BlockAnchor> {
        let anchor = wait_for_btc_deposit(chain, &self.btc_txid(), wait)?;
        wait_for_asset_deposit(server.assets.as_ref(), &self.asset.address, wait)?;
        Ok(anchor)
    }

    /// The server's proof file for the boarded asset.
    pub fn export_proof(&self, server: &Party) -> Result<ProofFile> {
        server
            .assets
            .export_proof(&self.asset.address.asset_id, &self.asset.address.script_key)
    }
}

pub fn wait_for_btc_deposit(
    chain: &dyn ChainBackend,
    txid: &Txid,
    wait: &WaitConfig,
) -> Result<BlockAnchor> {
    chain::wait_for_confirmation(chain, txid, wait)
}

pub fn wait_for_asset_deposit(
    assets: &dyn AssetWallet,
    address: &AssetAddress,
    wait: &WaitConfig,
) -> Result<()> {
    assets.wait_for_receive(address, wait.timeout)?;
    log::info!("boarding: asset received at {}", address.encoded);
    Ok(())
}
