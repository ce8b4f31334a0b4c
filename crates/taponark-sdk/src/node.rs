//! `TaponarkNode`: async coordinator over [`TaponarkSdk`].
//!
//! Every round operation blocks on wallet daemons or the chain, so each one
//! runs on `tokio::task::spawn_blocking`. The SDK sits behind a mutex that is
//! held for the whole blocking call; deposit waits run outside it.

use std::sync::{Arc, Mutex};

use bitcoin::Amount;

use crate::boarding::{self, BoardingTransfer};
use crate::chain::ChainBackend;
use crate::error::{Error, NodeError};
use crate::network::Network;
use crate::params::WaitConfig;
use crate::proof::ProofFile;
use crate::round::RoundRoot;
use crate::sdk::{BoardingResult, RoundResult, TaponarkSdk};
use crate::settlement::{ExitReport, RoundCommitment};
use crate::tree::RoundTree;
use crate::wallet::Party;

// ── Struct ──────────────────────────────────────────────────────────────────

pub struct TaponarkNode {
    sdk: Arc<Mutex<TaponarkSdk>>,
    chain: Arc<dyn ChainBackend>,
    server: Party,
    wait: WaitConfig,
    network: Network,
}

// ── Construction ────────────────────────────────────────────────────────────

impl TaponarkNode {
    pub fn new(sdk: TaponarkSdk) -> Self {
        let chain = sdk.chain();
        let server = sdk.server().clone();
        let wait = sdk.wait();
        let network = sdk.network();
        Self {
            sdk: Arc::new(Mutex::new(sdk)),
            chain,
            server,
            wait,
            network,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // ── Internal: spawn_blocking helpers ────────────────────────────────

    /// Run a closure against the SDK on a blocking thread.
    async fn with_sdk<F, R>(&self, f: F) -> Result<R, NodeError>
    where
        F: FnOnce(&mut TaponarkSdk) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let sdk = self.sdk.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = sdk.lock().map_err(|_| NodeError::MutexPoisoned)?;
            f(&mut *guard).map_err(NodeError::Sdk)
        })
        .await
        .map_err(|e| NodeError::Task(e.to_string()))?
    }

    /// Run a blocking closure that does not need the SDK.
    async fn blocking<F, R>(f: F) -> Result<R, NodeError>
    where
        F: FnOnce() -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| NodeError::Task(e.to_string()))?
            .map_err(NodeError::Sdk)
    }

    // ── Boarding ────────────────────────────────────────────────────────

    /// Open a boarding for `user`, wait for both deposits concurrently and
    /// export the boarding proof.
    ///
    /// The first failing wait ends the call; the other is not cancelled and
    /// runs out on its own deadline.
    pub async fn board_user(
        &self,
        user: Party,
        asset_amount: u64,
        btc_amount: Amount,
    ) -> Result<BoardingResult, NodeError> {
        let transfer = self
            .with_sdk(move |sdk| sdk.open_boarding(&user, asset_amount, btc_amount))
            .await?;

        let chain = self.chain.clone();
        let txid = transfer.btc_txid();
        let wait = self.wait;
        let assets = self.server.assets.clone();
        let address = transfer.asset.address.clone();

        let (anchor, ()) = tokio::try_join!(
            Self::blocking(move || boarding::wait_for_btc_deposit(chain.as_ref(), &txid, &wait)),
            Self::blocking(move || boarding::wait_for_asset_deposit(
                assets.as_ref(),
                &address,
                &wait
            )),
        )?;
        log::info!("node: boarding {txid} settled at height {}", anchor.height);

        let server = self.server.clone();
        Self::blocking(move || {
            let proof = transfer.export_proof(&server)?;
            Ok(BoardingResult { transfer, proof })
        })
        .await
    }

    // ── Round ───────────────────────────────────────────────────────────

    /// Build the round root and tree for a settled boarding.
    pub async fn build_round(&self, mut boarding: BoardingTransfer) -> Result<RoundResult, NodeError> {
        self.with_sdk(move |sdk| sdk.build_round(&mut boarding)).await
    }

    /// Publish the round root. The root is handed back for later use.
    pub async fn commit_round(
        &self,
        root: RoundRoot,
        boarding_proof: ProofFile,
    ) -> Result<(RoundRoot, RoundCommitment), NodeError> {
        self.with_sdk(move |sdk| {
            let commitment = sdk.commit_round(&root, &boarding_proof)?;
            Ok((root, commitment))
        })
        .await
    }

    /// Publish the tree and import the leaf proofs into `user`'s wallet.
    /// The tree comes back with every proof recorded so far, even when some
    /// nodes or imports failed.
    pub async fn unilateral_exit(
        &self,
        user: Party,
        mut tree: RoundTree,
        commitment: RoundCommitment,
        parallel: bool,
    ) -> Result<(RoundTree, ExitReport), NodeError> {
        self.with_sdk(move |sdk| {
            let report = sdk.unilateral_exit(&user, &mut tree, &commitment, parallel);
            Ok((tree, report))
        })
        .await
    }
}
