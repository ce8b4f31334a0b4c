pub use bitcoin;
pub use musig2;
pub use bitcoincore_rpc;

pub mod anchor;
pub mod boarding;
pub mod chain;
pub mod contract;
pub mod error;
pub mod musig;
pub mod network;
pub mod node;
pub mod params;
pub mod proof;
pub mod round;
pub mod sdk;
pub mod settlement;
pub mod signer;
pub mod signing;
pub mod taproot;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transfer;
pub mod tree;
pub mod vpacket;
pub mod wallet;

// Core types
pub use error::{Error, NodeError, Result};
pub use network::Network;
pub use node::TaponarkNode;
pub use params::{ContractFlavor, ExitKeyHolder, RoundPolicy, WaitConfig};
pub use sdk::{BoardingResult, RoundResult, TaponarkSdk};

// Collaborators
pub use chain::{BitcoindBackend, BlockAnchor, ChainBackend, publish, wait_for_confirmation};
pub use signer::{KeyringSigner, MuSig2SessionRequest, Signer};
pub use wallet::{
    AddressRequest, AssetAddress, AssetWallet, BitcoinWallet, Party, Role, SendReceipt,
    TransferOutput,
};

// Contracts and binding
pub use contract::{ArkContract, AssetScript, PartyKeys, TaprootScriptPair, btc_script_pair};
pub use musig::{MuSig2SessionId, SessionNonce};
pub use taproot::{TapscriptPreimage, bind_control_block, nums_internal_key};

// Asset transfers and anchor templates
pub use anchor::{
    add_btc_input, add_btc_output, apply_output_commitment, extract_final_tx, finalize_input,
    prepare_anchor_template, set_output_value,
};
pub use proof::{ProofFile, TransitionProof};
pub use transfer::{ChainTransfer, derive_chain_transfer};
pub use vpacket::{AssetId, VInput, VOutput, VOutputKind, VirtualPacket};

// Rounds and settlement
pub use boarding::BoardingTransfer;
pub use round::{RoundRoot, RoundTreeBuilder};
pub use settlement::{
    ExitReport, ImportFailure, NodeFailure, NodePath, RoundCommitment, SettlementWalker,
};
pub use signing::SigningCoordinator;
pub use tree::{NodeKind, NodeOutput, OutputKind, RoundTree, RoundTreeNode};
