use std::collections::HashMap;
use std::sync::Arc;

use taponark_sdk::bitcoin::secp256k1::XOnlyPublicKey;
use taponark_sdk::bitcoin::{Amount, OutPoint, Script, Transaction, TxOut, Txid};
use taponark_sdk::testing::{
    MockNetwork, TestParty, fast_wait, proof_entries, verify_cooperative_spend,
};
use taponark_sdk::{
    AssetId, BitcoinWallet, BoardingResult, Error, Network, NodeKind, OutputKind, Party, Role,
    RoundPolicy, RoundResult, RoundTree, SigningCoordinator, TaponarkSdk, VOutput, VOutputKind,
    VirtualPacket, WaitConfig,
};

const ASSET_ID: AssetId = AssetId([0x42; 32]);

struct Fixture {
    net: MockNetwork,
    server: TestParty,
    user: TestParty,
    sdk: TaponarkSdk,
}

fn fixture_with(level: u32, wait: WaitConfig) -> Fixture {
    let net = MockNetwork::new();
    let server = net.party(Role::Server);
    let user = net.party(Role::User);
    let policy = RoundPolicy {
        level,
        ..RoundPolicy::default()
    };
    let sdk = TaponarkSdk::new(
        Network::Regtest,
        ASSET_ID,
        server.party.clone(),
        net.chain.clone(),
        policy,
        wait,
    )
    .expect("sdk");
    Fixture {
        net,
        server,
        user,
        sdk,
    }
}

fn fixture(level: u32) -> Fixture {
    fixture_with(level, fast_wait())
}

fn board(f: &Fixture) -> BoardingResult {
    f.sdk
        .board(&f.user.party, 40, Amount::from_sat(100_000))
        .expect("boarding should settle")
}

fn build(f: &Fixture) -> (BoardingResult, RoundResult) {
    let mut boarding = board(f);
    let round = f.sdk.build_round(&mut boarding.transfer).expect("round");
    (boarding, round)
}

fn leaf_btc(tree: &RoundTree) -> Vec<Amount> {
    tree.leaves()
        .map(|leaf| {
            let out = leaf
                .outputs()
                .into_iter()
                .find(|o| o.kind == OutputKind::Btc)
                .expect("btc output");
            leaf.transaction.output[out.vout as usize].value
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[test]
fn construction_broadcasts_nothing() {
    let f = fixture(2);
    let (_, round) = build(&f);

    assert_eq!(f.net.chain.broadcast_count(), 0);
    assert!(!f.net.chain.is_confirmed(&round.root.transaction().compute_txid()));
    for node in round.tree.iter() {
        assert!(!f.net.chain.is_confirmed(&node.txid()));
    }
}

#[test]
fn round_root_sums_deposits_minus_fee() {
    let f = fixture(2);
    let (boarding, round) = build(&f);

    let root_tx = round.root.transaction();
    assert_eq!(root_tx.input.len(), 2);
    assert_eq!(root_tx.output.len(), 1);
    assert_eq!(root_tx.output[0].value, Amount::from_sat(91_000));
    assert_eq!(round.root.transfer.asset_amount, 40);

    let spent: Vec<OutPoint> = root_tx.input.iter().map(|i| i.previous_output).collect();
    assert!(spent.contains(&boarding.transfer.asset.transfer.outpoint));
    assert!(spent.contains(&boarding.transfer.btc.outpoint));
}

#[test]
fn anchor_witness_is_server_then_user() {
    let f = fixture(0);
    let (boarding, round) = build(&f);

    let root_tx = round.root.transaction();
    let prevouts: Vec<TxOut> = root_tx
        .input
        .iter()
        .map(|input| {
            if input.previous_output == boarding.transfer.btc.outpoint {
                boarding.transfer.btc.txout.clone()
            } else {
                let deposit = &boarding.transfer.asset.transfer;
                deposit.final_tx.output[deposit.outpoint.vout as usize].clone()
            }
        })
        .collect();

    for (index, input) in root_tx.input.iter().enumerate() {
        let elements: Vec<&[u8]> = input.witness.iter().collect();
        assert_eq!(elements.len(), 4);
        verify_cooperative_spend(root_tx, index, &prevouts).expect("valid 2-of-2 spend");
    }

    let btc_index = root_tx
        .input
        .iter()
        .position(|i| i.previous_output == boarding.transfer.btc.outpoint)
        .expect("btc input");
    let script = root_tx.input[btc_index].witness.nth(2).expect("script");
    assert_eq!(
        script,
        boarding
            .transfer
            .btc
            .contract
            .btc_script()
            .cooperative_leaf()
            .as_bytes()
    );
}

#[test]
fn tree_shape_by_level() {
    for (level, leaf_value, leaf_asset) in [(0, 79_000, 40), (1, 28_500, 20), (2, 3_250, 10)] {
        let f = fixture(level);
        let (_, round) = build(&f);
        let tree = &round.tree;

        assert_eq!(tree.level, level);
        assert_eq!(tree.leaf_count(), 1 << level);
        assert_eq!(tree.branch_count(), (1 << level) - 1);
        assert_eq!(tree.root.kind == NodeKind::Leaf, level == 0);
        assert!(
            leaf_btc(tree)
                .iter()
                .all(|v| *v == Amount::from_sat(leaf_value))
        );
        for leaf in tree.leaves() {
            assert_eq!(leaf.transaction.output.len(), 3);
            let asset = leaf.asset_output().expect("asset output");
            assert_eq!(asset.asset_amount, leaf_asset);
            assert_eq!(asset.vout, 1);
        }
    }
}

#[test]
fn value_and_assets_are_conserved() {
    let f = fixture(2);
    let (_, round) = build(&f);
    let fee = RoundPolicy::default().fee();

    let mut txs: HashMap<Txid, Transaction> = HashMap::new();
    txs.insert(
        round.root.transaction().compute_txid(),
        round.root.transaction().clone(),
    );
    for node in round.tree.iter() {
        txs.insert(node.txid(), node.transaction.clone());
    }

    for node in round.tree.iter() {
        let tx = &node.transaction;
        assert_eq!(tx.input.len(), 1);
        let prev = tx.input[0].previous_output;
        let parent = txs.get(&prev.txid).expect("parent is part of the round");
        let spent = parent.output[prev.vout as usize].value;
        let paid: Amount = tx.output.iter().map(|o| o.value).sum();
        assert_eq!(spent, paid + fee, "node {}", node.txid());
    }

    for node in round.tree.iter().filter(|n| !n.is_leaf()) {
        let left = node.left_child.as_deref().expect("left child");
        let right = node.right_child.as_deref().expect("right child");
        assert_eq!(left.transaction.input[0].previous_output.txid, node.txid());
        assert_eq!(right.transaction.input[0].previous_output.vout, 1);
        let children: u64 = left
            .outputs()
            .into_iter()
            .chain(right.outputs())
            .map(|o| o.asset_amount)
            .sum();
        assert_eq!(
            node.left_output.asset_amount + node.right_output.asset_amount,
            children
        );
    }
    let leaf_assets: u64 = round
        .tree
        .leaves()
        .filter_map(|l| l.asset_output())
        .map(|o| o.asset_amount)
        .sum();
    assert_eq!(leaf_assets, 40);
}

#[test]
fn contract_nonces_are_single_use() {
    let f = fixture(0);
    let (mut boarding, _) = build(&f);
    let deposit = boarding.transfer.asset.transfer.clone();
    let contract = &mut boarding.transfer.asset.contract;

    let mut packet = VirtualPacket::interactive_send(ASSET_ID);
    packet.bind_input(&deposit).expect("bind");
    packet.add_output(VOutput::ark(
        deposit.asset_amount,
        VOutputKind::Simple,
        contract.asset_script().output_key(),
        0,
        contract.btc_script().sibling_preimage(),
    ));

    let err = SigningCoordinator::new(&f.user.party, &f.server.party)
        .sign_asset_transfer(contract, &mut packet)
        .expect_err("nonces were spent by the round root");
    assert!(matches!(err, Error::NonceConsumed), "got {err}");
    assert!(!packet.is_signed());
}

#[test]
fn branch_amount_too_small_to_split() {
    let f = fixture(2);
    let mut boarding = f
        .sdk
        .board(&f.user.party, 2, Amount::from_sat(100_000))
        .expect("boarding");
    let err = f
        .sdk
        .build_round(&mut boarding.transfer)
        .expect_err("one unit cannot split again");
    assert!(matches!(err, Error::Construction(_)), "got {err}");
}

#[test]
fn failed_round_is_rebuilt_from_boarding() {
    let f = fixture(2);
    let mut boarding = f
        .sdk
        .board(&f.user.party, 2, Amount::from_sat(100_000))
        .expect("boarding");
    f.sdk
        .build_round(&mut boarding.transfer)
        .expect_err("one unit cannot split again");

    let shallow = TaponarkSdk::new(
        Network::Regtest,
        ASSET_ID,
        f.server.party.clone(),
        f.net.chain.clone(),
        RoundPolicy {
            level: 1,
            ..RoundPolicy::default()
        },
        fast_wait(),
    )
    .expect("sdk");
    let mut round = shallow
        .build_round(&mut boarding.transfer)
        .expect("retry signs with fresh nonces");
    assert_eq!(round.tree.leaf_count(), 2);

    let commitment = shallow
        .commit_round(&round.root, &boarding.proof)
        .expect("commit");
    let report = shallow.unilateral_exit(&f.user.party, &mut round.tree, &commitment, false);
    assert!(report.is_complete(), "failures: {:?}", report.failures);
    assert_eq!(report.broadcasts, 3);
    assert_eq!(f.user.assets.imported().len(), 2);
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

#[test]
fn scenario_full_exit() {
    let f = fixture(2);
    let (boarding, mut round) = build(&f);

    let commitment = f
        .sdk
        .commit_round(&round.root, &boarding.proof)
        .expect("commit");
    assert_eq!(f.net.chain.broadcast_count(), 1);
    assert_eq!(commitment.txid, round.root.transaction().compute_txid());
    let base_entries = proof_entries(&commitment.base_proof).expect("base proof").len();
    assert_eq!(
        base_entries,
        proof_entries(&boarding.proof).expect("boarding proof").len() + 1
    );

    let report = f
        .sdk
        .unilateral_exit(&f.user.party, &mut round.tree, &commitment, false);
    assert!(report.is_complete(), "failures: {:?}", report.failures);
    assert_eq!(report.broadcasts, 7);
    assert_eq!(f.net.chain.broadcast_count(), 8);
    assert_eq!(report.proofs.len(), 4);

    for (path, proof) in &report.proofs {
        assert_eq!(path.depth(), 2);
        let entries = proof_entries(proof).expect("leaf proof");
        assert_eq!(entries.len(), base_entries + 3, "leaf {path}");
        assert_eq!(entries.last().map(|e| e.amount), Some(10));
    }
    assert_eq!(round.tree.leaf_proofs().count(), 4);
    assert_eq!(f.user.assets.imported().len(), 4);
    assert!(
        leaf_btc(&round.tree)
            .iter()
            .all(|v| *v == Amount::from_sat(3_250))
    );
}

#[test]
fn parallel_exit_keeps_parent_before_child() {
    let f = fixture(2);
    let (boarding, mut round) = build(&f);
    let commitment = f.sdk.commit_round(&round.root, &boarding.proof).expect("commit");

    let report = f
        .sdk
        .unilateral_exit(&f.user.party, &mut round.tree, &commitment, true);
    assert!(report.is_complete());
    assert_eq!(report.proofs.len(), 4);

    let order: HashMap<Txid, usize> = f
        .net
        .chain
        .broadcasts()
        .into_iter()
        .enumerate()
        .map(|(i, txid)| (txid, i))
        .collect();
    for node in round.tree.iter() {
        let parent = node.transaction.input[0].previous_output.txid;
        assert!(order[&parent] < order[&node.txid()]);
    }
}

#[test]
fn failed_node_only_skips_its_subtree() {
    let f = fixture(2);
    let (boarding, mut round) = build(&f);
    let commitment = f.sdk.commit_round(&round.root, &boarding.proof).expect("commit");

    let rejected = round.tree.root.left_child.as_ref().expect("left").txid();
    f.net.chain.reject(rejected);

    let report = f
        .sdk
        .unilateral_exit(&f.user.party, &mut round.tree, &commitment, false);
    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path.to_string(), "L");
    assert_eq!(report.failures[0].txid, rejected);
    assert!(matches!(report.failures[0].error, Error::Broadcast(_)));

    assert_eq!(report.broadcasts, 4);
    let paths: Vec<String> = report.proofs.iter().map(|(p, _)| p.to_string()).collect();
    assert_eq!(paths, vec!["RL", "RR"]);
    assert_eq!(f.user.assets.imported().len(), 2);
}

#[test]
fn rejected_imports_keep_every_leaf_proof() {
    let f = fixture(2);
    let (boarding, mut round) = build(&f);
    let commitment = f.sdk.commit_round(&round.root, &boarding.proof).expect("commit");

    // Proofs are rooted at ASSET_ID's genesis; this SDK asks the wallet to
    // import them under another asset's genesis.
    let other = TaponarkSdk::new(
        Network::Regtest,
        AssetId([0x43; 32]),
        f.server.party.clone(),
        f.net.chain.clone(),
        RoundPolicy {
            level: 2,
            ..RoundPolicy::default()
        },
        fast_wait(),
    )
    .expect("sdk");
    let report = other.unilateral_exit(&f.user.party, &mut round.tree, &commitment, false);

    assert!(report.failures.is_empty());
    assert!(!report.is_complete());
    assert_eq!(report.broadcasts, 7);
    assert_eq!(report.proofs.len(), 4);
    assert_eq!(report.import_failures.len(), 4);
    assert!(
        report
            .import_failures
            .iter()
            .all(|failure| matches!(failure.error, Error::Proof(_)))
    );
    assert_eq!(round.tree.leaf_proofs().count(), 4);
    assert!(f.user.assets.imported().is_empty());
}

#[test]
fn unconfirmed_leaf_times_out() {
    let f = fixture(1);
    let (boarding, mut round) = build(&f);
    let commitment = f.sdk.commit_round(&round.root, &boarding.proof).expect("commit");

    let stalled = round.tree.root.right_child.as_ref().expect("right").txid();
    f.net.chain.stall(stalled);

    let report = f
        .sdk
        .unilateral_exit(&f.user.party, &mut round.tree, &commitment, false);
    assert_eq!(report.broadcasts, 3);
    assert_eq!(report.proofs.len(), 1);
    assert_eq!(report.failures.len(), 1);
    match &report.failures[0].error {
        Error::Timeout(what) => assert!(what.contains(&stalled.to_string())),
        other => panic!("expected timeout, got {other}"),
    }
}

#[test]
fn boarding_settles_both_deposits() {
    let f = fixture(0);
    let transfer = f
        .sdk
        .open_boarding(&f.user.party, 40, Amount::from_sat(100_000))
        .expect("open");
    let btc_txid = transfer.btc_txid();

    let boarding = f.sdk.finish_boarding(transfer).expect("finish");
    assert!(f.net.chain.is_confirmed(&btc_txid));
    assert_eq!(proof_entries(&boarding.proof).expect("proof").len(), 2);
}

struct EmptyWallet;

impl BitcoinWallet for EmptyWallet {
    fn send_output(&self, amount: Amount, _: &Script) -> taponark_sdk::Result<Transaction> {
        Err(Error::Wallet(format!("insufficient funds for {amount}")))
    }

    fn next_taproot_key(&self) -> taponark_sdk::Result<XOnlyPublicKey> {
        Err(Error::Wallet("no keys".into()))
    }
}

#[test]
fn failed_btc_leg_names_the_sent_asset_deposit() {
    let f = fixture(0);
    let user = Party::new(
        Role::User,
        f.user.assets.clone(),
        Arc::new(EmptyWallet),
        f.user.signer.clone(),
    );

    let err = f
        .sdk
        .open_boarding(&user, 40, Amount::from_sat(100_000))
        .expect_err("btc leg cannot be funded");
    let (asset_outpoint, address, source) = match err {
        Error::BoardingIncomplete {
            asset_outpoint,
            address,
            source,
        } => (asset_outpoint, address, source),
        other => panic!("expected incomplete boarding, got {other}"),
    };
    assert!(f.net.chain.is_confirmed(&asset_outpoint.txid));
    assert!(address.starts_with("taprt1"));
    assert!(matches!(*source, Error::Wallet(_)));
}

#[test]
fn withheld_asset_deposit_times_out() {
    let net = MockNetwork::new();
    let server = net.party(Role::Server);
    let user = net.withholding_party(Role::User);
    let sdk = TaponarkSdk::new(
        Network::Regtest,
        ASSET_ID,
        server.party.clone(),
        net.chain.clone(),
        RoundPolicy::default(),
        fast_wait(),
    )
    .expect("sdk");

    let err = sdk
        .board(&user.party, 40, Amount::from_sat(100_000))
        .expect_err("asset never arrives");
    match err {
        Error::Timeout(what) => assert!(what.contains("taprt1")),
        other => panic!("expected timeout, got {other}"),
    }
}

#[test]
fn sdk_requires_server_party() {
    let net = MockNetwork::new();
    let user = net.party(Role::User);
    let result = TaponarkSdk::new(
        Network::Regtest,
        ASSET_ID,
        user.party,
        net.chain.clone(),
        RoundPolicy::default(),
        WaitConfig::default(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}
