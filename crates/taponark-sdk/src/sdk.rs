use std::sync::Arc;

use bitcoin::Amount;

use crate::boarding::BoardingTransfer;
use crate::chain::ChainBackend;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::params::{RoundPolicy, WaitConfig};
use crate::proof::ProofFile;
use crate::round::{RoundRoot, RoundTreeBuilder};
use crate::settlement::{ExitReport, NodePath, RoundCommitment, SettlementWalker};
use crate::tree::RoundTree;
use crate::vpacket::AssetId;
use crate::wallet::{Party, Role};

/// Result of a completed boarding: the deposits and the server's proof of
/// the boarded asset.
#[derive(Debug)]
pub struct BoardingResult {
    pub transfer: BoardingTransfer,
    pub proof: ProofFile,
}

/// A built but unpublished round.
#[derive(Debug)]
pub struct RoundResult {
    pub root: RoundRoot,
    pub tree: RoundTree,
}

/// Server-side settlement operations for one asset, with every wait bounded
/// by the configured [`WaitConfig`].
///
/// All methods block; [`TaponarkNode`](crate::node::TaponarkNode) runs them
/// off the async runtime.
pub struct TaponarkSdk {
    network: Network,
    asset_id: AssetId,
    server: Party,
    chain: Arc<dyn ChainBackend>,
    policy: RoundPolicy,
    wait: WaitConfig,
}

impl TaponarkSdk {
    pub fn new(
        network: Network,
        asset_id: AssetId,
        server: Party,
        chain: Arc<dyn ChainBackend>,
        policy: RoundPolicy,
        wait: WaitConfig,
    ) -> Result<Self> {
        policy.validate()?;
        if server.role != Role::Server {
            return Err(Error::Config(format!(
                "settlement party must be the server, got {}",
                server.role
            )));
        }
        Ok(Self {
            network,
            asset_id,
            server,
            chain,
            policy,
            wait,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn server(&self) -> &Party {
        &self.server
    }

    pub fn chain(&self) -> Arc<dyn ChainBackend> {
        self.chain.clone()
    }

    pub fn policy(&self) -> &RoundPolicy {
        &self.policy
    }

    pub fn wait(&self) -> WaitConfig {
        self.wait
    }

    /// Create the boarding contracts and send both deposits.
    pub fn open_boarding(
        &self,
        user: &Party,
        asset_amount: u64,
        btc_amount: Amount,
    ) -> Result<BoardingTransfer> {
        BoardingTransfer::open(
            user,
            &self.server,
            self.asset_id,
            asset_amount,
            btc_amount,
            &self.policy,
        )
    }

    /// Wait for both deposits and export the boarding proof.
    pub fn finish_boarding(&self, transfer: BoardingTransfer) -> Result<BoardingResult> {
        let anchor = transfer.wait_for_deposits(self.chain.as_ref(), &self.server, &self.wait)?;
        log::info!(
            "sdk: boarding {} settled at height {}",
            transfer.btc_txid(),
            anchor.height
        );
        let proof = transfer.export_proof(&self.server)?;
        Ok(BoardingResult { transfer, proof })
    }

    pub fn board(&self, user: &Party, asset_amount: u64, btc_amount: Amount) -> Result<BoardingResult> {
        let transfer = self.open_boarding(user, asset_amount, btc_amount)?;
        self.finish_boarding(transfer)
    }

    /// Build the round root from a settled boarding and the tree of the
    /// configured depth below it. Nothing is broadcast.
    pub fn build_round(&self, boarding: &mut BoardingTransfer) -> Result<RoundResult> {
        let builder = RoundTreeBuilder::new(
            self.asset_id,
            boarding.user.clone(),
            self.server.clone(),
            self.policy,
        )?;
        let mut root = builder.build_round_root(boarding)?;
        let tree = builder.build_tree(&mut root, self.policy.level)?;
        Ok(RoundResult { root, tree })
    }

    pub fn commit_round(&self, root: &RoundRoot, boarding_proof: &ProofFile) -> Result<RoundCommitment> {
        SettlementWalker::new(self.chain.as_ref(), self.server.assets.as_ref(), self.wait)
            .commit_round(root, boarding_proof)
    }

    /// Publish the whole tree and import every leaf proof it yields into
    /// `user`'s asset wallet.
    ///
    /// Never fails as a whole: node and import failures are recorded in the
    /// report next to every proof that was produced.
    pub fn unilateral_exit(
        &self,
        user: &Party,
        tree: &mut RoundTree,
        commitment: &RoundCommitment,
        parallel: bool,
    ) -> ExitReport {
        let mut report = SettlementWalker::new(self.chain.as_ref(), self.server.assets.as_ref(), self.wait)
            .parallel(parallel)
            .unilateral_exit(tree, &commitment.base_proof);

        let failed: Vec<(NodePath, Error)> = match user.assets.asset_genesis(&self.asset_id) {
            Ok(genesis) => report
                .proofs
                .iter()
                .filter_map(|(path, proof)| {
                    let err = user.assets.import_proof(proof, genesis).err()?;
                    Some((path.clone(), err))
                })
                .collect(),
            Err(e) => report
                .proofs
                .iter()
                .map(|(path, _)| (path.clone(), Error::Proof(format!("asset genesis: {e}"))))
                .collect(),
        };
        let imported = report.proofs.len() - failed.len();
        for (path, err) in failed {
            report.record_import_failure(path, err);
        }
        log::info!("sdk: imported {imported} leaf proofs for {}", user.role);
        report
    }
}
