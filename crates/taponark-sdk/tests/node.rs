use taponark_sdk::bitcoin::Amount;
use taponark_sdk::testing::{MockNetwork, fast_wait, proof_entries};
use taponark_sdk::{AssetId, Network, NodeError, Role, RoundPolicy, TaponarkNode, TaponarkSdk};

fn setup(net: &MockNetwork, level: u32) -> TaponarkNode {
    let server = net.party(Role::Server);
    let sdk = TaponarkSdk::new(
        Network::Regtest,
        AssetId([0x07; 32]),
        server.party,
        net.chain.clone(),
        RoundPolicy {
            level,
            ..RoundPolicy::default()
        },
        fast_wait(),
    )
    .expect("sdk");
    TaponarkNode::new(sdk)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn node_round_lifecycle() {
    let net = MockNetwork::new();
    let node = setup(&net, 1);
    let user = net.party(Role::User);
    assert_eq!(node.network(), Network::Regtest);

    let boarding = node
        .board_user(user.party.clone(), 30, Amount::from_sat(60_000))
        .await
        .expect("boarding");
    assert_eq!(proof_entries(&boarding.proof).expect("proof").len(), 2);

    let round = node.build_round(boarding.transfer).await.expect("round");
    assert_eq!(net.chain.broadcast_count(), 0);
    assert_eq!(round.tree.leaf_count(), 2);

    let (_root, commitment) = node
        .commit_round(round.root, boarding.proof)
        .await
        .expect("commit");
    assert_eq!(net.chain.broadcast_count(), 1);

    let (tree, report) = node
        .unilateral_exit(user.party.clone(), round.tree, commitment, true)
        .await
        .expect("exit");
    assert!(report.is_complete());
    assert_eq!(report.broadcasts, 3);
    assert_eq!(tree.leaf_proofs().count(), 2);
    assert_eq!(user.assets.imported().len(), 2);

    let amounts: Vec<u64> = tree
        .leaves()
        .filter_map(|l| l.asset_output())
        .map(|o| o.asset_amount)
        .collect();
    assert_eq!(amounts, vec![15, 15]);
}

#[tokio::test(flavor = "multi_thread")]
async fn board_user_reports_first_failed_wait() {
    let net = MockNetwork::new();
    let node = setup(&net, 1);
    let user = net.withholding_party(Role::User);

    let err = node
        .board_user(user.party, 30, Amount::from_sat(60_000))
        .await
        .expect_err("asset is never delivered");
    match err {
        NodeError::Sdk(taponark_sdk::Error::Timeout(_)) => {}
        other => panic!("expected timeout, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn board_user_rejects_empty_deposit() {
    let net = MockNetwork::new();
    let node = setup(&net, 1);
    let user = net.party(Role::User);

    let err = node
        .board_user(user.party, 0, Amount::from_sat(60_000))
        .await
        .expect_err("zero asset amount");
    assert!(matches!(
        err,
        NodeError::Sdk(taponark_sdk::Error::Construction(_))
    ));
}
