use std::time::Instant;

use bitcoin::{Block, Transaction, Txid};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Auth, Client, RpcApi};

use crate::error::{Error, Result};
use crate::params::WaitConfig;

/// RPC error code for a transaction the node does not know (yet).
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Where a transaction was confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAnchor {
    pub block: Block,
    pub height: u32,
    /// Position of the transaction inside `block`.
    pub tx_index: u32,
}

/// Backend for interacting with the Bitcoin chain.
pub trait ChainBackend: Send + Sync {
    /// Broadcast a signed transaction and return its txid.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// The confirming block of `txid`, or `None` while unconfirmed or unknown.
    fn confirmation(&self, txid: &Txid) -> Result<Option<BlockAnchor>>;
}

/// Poll `chain` until `txid` confirms or the configured deadline passes.
pub fn wait_for_confirmation(
    chain: &dyn ChainBackend,
    txid: &Txid,
    wait: &WaitConfig,
) -> Result<BlockAnchor> {
    // A timeout too large to represent never expires.
    let deadline = Instant::now().checked_add(wait.timeout);
    loop {
        if let Some(anchor) = chain.confirmation(txid)? {
            log::info!(
                "chain: {txid} confirmed at height {} (index {})",
                anchor.height,
                anchor.tx_index
            );
            return Ok(anchor);
        }
        let mut pause = wait.poll_interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!("confirmation of {txid}")));
            }
            pause = pause.min(deadline - now);
        }
        std::thread::sleep(pause);
    }
}

/// Broadcast `tx` and wait for its first confirmation.
pub fn publish(chain: &dyn ChainBackend, tx: &Transaction, wait: &WaitConfig) -> Result<BlockAnchor> {
    let txid = chain.broadcast(tx)?;
    log::info!("chain: broadcast {txid}");
    wait_for_confirmation(chain, &txid, wait)
}

/// Bitcoin Core JSON-RPC backend.
pub struct BitcoindBackend {
    client: Client,
    url: String,
}

impl BitcoindBackend {
    pub fn new(url: &str, auth: Auth) -> Result<Self> {
        let client = Client::new(url, auth).map_err(|e| Error::Rpc(format!("{url}: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_unknown_tx(err: &bitcoincore_rpc::Error) -> bool {
        matches!(
            err,
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e))
                if e.code == RPC_INVALID_ADDRESS_OR_KEY
        )
    }
}

impl ChainBackend for BitcoindBackend {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        self.client
            .send_raw_transaction(tx)
            .map_err(|e| Error::Broadcast(format!("{}: {e}", tx.compute_txid())))
    }

    fn confirmation(&self, txid: &Txid) -> Result<Option<BlockAnchor>> {
        let info = match self.client.get_raw_transaction_info(txid, None) {
            Ok(info) => info,
            Err(e) if Self::is_unknown_tx(&e) => return Ok(None),
            Err(e) => return Err(Error::Rpc(format!("getrawtransaction {txid}: {e}"))),
        };
        let Some(hash) = info.blockhash else {
            return Ok(None);
        };

        let block = self
            .client
            .get_block(&hash)
            .map_err(|e| Error::Rpc(format!("getblock {hash}: {e}")))?;
        let header = self
            .client
            .get_block_header_info(&hash)
            .map_err(|e| Error::Rpc(format!("getblockheader {hash}: {e}")))?;
        let tx_index = block
            .txdata
            .iter()
            .position(|tx| tx.compute_txid() == *txid)
            .ok_or_else(|| Error::Rpc(format!("{txid} missing from block {hash}")))?;

        Ok(Some(BlockAnchor {
            block,
            height: header.height as u32,
            tx_index: tx_index as u32,
        }))
    }
}
