use alloy::primitives::U256;
use clearnode::{
    cfg::Amount,
    channels,
    ledger::{Account, Ledger},
};
use custody::{
    chain::CustodyCall,
    state::{BROKER, CREATOR, ChannelId, State},
};
use serde_json::json;

use crate::{CHAIN_ID, Network, TOKEN};

fn signed_state(response: &serde_json::Value) -> (ChannelId, State) {
    (
        serde_json::from_value(response["channel_id"].clone()).unwrap(),
        serde_json::from_value(response["state"].clone()).unwrap(),
    )
}

fn escrow_balance(network: &Network, channel_id: ChannelId) -> Amount {
    network
        .broker
        .db()
        .read(|conn| Ledger::new(conn, 0).balance(&Account::escrow(channel_id), "usdc"))
        .unwrap()
}

#[tokio::test]
async fn open_resize_and_close() {
    let network = Network::new();
    let mut alice = network.client(500);
    let key = alice.key.clone();
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    network.execute(
        &key,
        CustodyCall::Deposit {
            token: TOKEN,
            amount: U256::from(500),
        },
    );

    // Created without the broker's signature, so the broker joins once it sees the channel.
    let prepared = network
        .request(
            &mut alice,
            "create_channel",
            json!({ "chain_id": CHAIN_ID, "token": TOKEN, "amount": "100" }),
            &[&key],
        )
        .await
        .unwrap();
    let (channel_id, mut initial) = signed_state(&prepared);
    let channel = serde_json::from_value(prepared["channel"].clone()).unwrap();
    initial.sigs.remove(&BROKER);
    initial.sign(&key, channel_id, CREATOR);
    network.execute(&key, CustodyCall::Create { channel, initial });
    network.sync().await;
    assert_eq!(network.balance(&mut alice).await, 0);
    network.sync().await;
    assert_eq!(network.balance(&mut alice).await, 100);

    let resize = network
        .request(
            &mut alice,
            "resize_channel",
            json!({ "channel_id": channel_id, "resize_amount": "50", "allocate_amount": "-50" }),
            &[&key],
        )
        .await
        .unwrap();
    let (_, mut candidate) = signed_state(&resize);
    assert_eq!(candidate.version, 1);
    assert_eq!(candidate.allocations[CREATOR].amount, U256::from(150));
    candidate.sign(&key, channel_id, CREATOR);
    network.execute(
        &key,
        CustodyCall::Resize {
            channel_id,
            candidate,
            proofs: vec![],
        },
    );
    network.sync().await;
    assert_eq!(network.balance(&mut alice).await, 150);

    let close = network
        .request(
            &mut alice,
            "close_channel",
            json!({ "channel_id": channel_id }),
            &[&key],
        )
        .await
        .unwrap();
    let (_, mut candidate) = signed_state(&close);
    assert_eq!(candidate.allocations[CREATOR].amount, U256::from(150));
    assert_eq!(candidate.allocations[BROKER].amount, U256::ZERO);
    candidate.sign(&key, channel_id, CREATOR);
    network.execute(&key, CustodyCall::Close { channel_id, candidate });
    network.sync().await;

    assert_eq!(
        network.chain.lock().available(alice.address(), TOKEN),
        U256::from(500)
    );
    assert_eq!(network.balance(&mut alice).await, 0);
    assert!(escrow_balance(&network, channel_id).is_zero());
    let alice_address = alice.address();
    let listed = network
        .request(
            &mut alice,
            "get_channels",
            json!({ "participant": alice_address }),
            &[&key],
        )
        .await
        .unwrap();
    assert_eq!(listed["channels"][0]["status"], "closed");
}

#[tokio::test]
async fn replayed_events_are_applied_once() {
    let network = Network::new();
    let mut alice = network.client(200);
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    network.open_channel(&mut alice, 200, 80).await;
    assert_eq!(network.balance(&mut alice).await, 80);

    let logs = {
        let chain = network.chain.lock();
        chain.logs(0, chain.head().number)
    };
    assert!(!logs.is_empty());
    for log in &logs {
        let applied = network
            .broker
            .db()
            .with_transaction(|tx| {
                channels::apply_log(
                    tx,
                    &network.config,
                    network.broker_address(),
                    log,
                    1_700_000_000,
                )
            })
            .unwrap();
        assert!(applied.follow_ups.is_empty());
        assert!(applied.channel.is_none());
    }
    assert_eq!(network.balance(&mut alice).await, 80);
}

#[tokio::test]
async fn pending_resize_freezes_the_unified_balance() {
    let network = Network::new();
    let mut alice = network.client(300);
    let bob = network.client(0);
    let key = alice.key.clone();
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    let channel_id = network.open_channel(&mut alice, 300, 100).await;

    // Moving 30 from the unified balance back to custody reserves it until the resize is confirmed.
    let resize = network
        .request(
            &mut alice,
            "resize_channel",
            json!({ "channel_id": channel_id, "resize_amount": "-30", "allocate_amount": "30" }),
            &[&key],
        )
        .await
        .unwrap();
    assert_eq!(network.balance(&mut alice).await, 70);

    let transfer = json!({
        "destination": bob.address(),
        "allocations": [{ "asset": "usdc", "amount": "10" }],
    });
    let (code, _) = network
        .request(&mut alice, "transfer", transfer.clone(), &[&key])
        .await
        .unwrap_err();
    assert_eq!(code, 409);
    let (code, _) = network
        .request(
            &mut alice,
            "resize_channel",
            json!({ "channel_id": channel_id, "resize_amount": "-10", "allocate_amount": "10" }),
            &[&key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 409);

    let (_, mut candidate) = signed_state(&resize);
    candidate.sign(&key, channel_id, CREATOR);
    network.execute(
        &key,
        CustodyCall::Resize {
            channel_id,
            candidate,
            proofs: vec![],
        },
    );
    network.sync().await;
    assert_eq!(network.balance(&mut alice).await, 70);
    assert_eq!(
        network.chain.lock().available(alice.address(), TOKEN),
        U256::from(230)
    );
    assert!(escrow_balance(&network, channel_id).is_zero());

    network
        .request(&mut alice, "transfer", transfer, &[&key])
        .await
        .unwrap();
    assert_eq!(network.balance(&mut alice).await, 60);
}

#[tokio::test]
async fn channels_of_other_wallets_cannot_be_operated() {
    let network = Network::new();
    let mut alice = network.client(100);
    let mut mallory = network.client(0);
    let mallory_key = mallory.key.clone();
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    network.login(&mut mallory, None, "wallet", vec![]).await.unwrap();
    let channel_id = network.open_channel(&mut alice, 100, 100).await;

    let (code, _) = network
        .request(
            &mut mallory,
            "close_channel",
            json!({ "channel_id": channel_id }),
            &[&mallory_key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 401);

    let (code, _) = network
        .request(
            &mut mallory,
            "create_channel",
            json!({ "chain_id": CHAIN_ID + 1, "token": TOKEN, "amount": "0" }),
            &[&mallory_key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 400);
}

#[tokio::test]
async fn close_supersedes_a_pending_resize() {
    let network = Network::new();
    let mut alice = network.client(500);
    let key = alice.key.clone();
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    let channel_id = network.open_channel(&mut alice, 500, 100).await;

    let resize = network
        .request(
            &mut alice,
            "resize_channel",
            json!({ "channel_id": channel_id, "resize_amount": "-30", "allocate_amount": "30" }),
            &[&key],
        )
        .await
        .unwrap();
    let close = network
        .request(&mut alice, "close_channel", json!({ "channel_id": channel_id }), &[&key])
        .await
        .unwrap();
    let (_, mut finalize) = signed_state(&close);
    assert_eq!(finalize.version, 2);
    assert_eq!(finalize.allocations[CREATOR].amount, U256::from(100));
    finalize.sign(&key, channel_id, CREATOR);
    network.execute(&key, CustodyCall::Close { channel_id, candidate: finalize });
    network.sync().await;

    assert_eq!(
        network.chain.lock().available(alice.address(), TOKEN),
        U256::from(500)
    );
    assert_eq!(network.balance(&mut alice).await, 0);
    assert!(escrow_balance(&network, channel_id).is_zero());
    // The abandoned resize has nothing left to apply to.
    let (_, mut candidate) = signed_state(&resize);
    candidate.sign(&key, channel_id, CREATOR);
    let late = network.chain.lock().execute(
        alice.address(),
        CustodyCall::Resize {
            channel_id,
            candidate,
            proofs: vec![],
        },
    );
    assert!(late.is_err());
}

#[tokio::test]
async fn resize_confirmed_while_closing_reopens_the_channel() {
    let network = Network::new();
    let mut alice = network.client(500);
    let key = alice.key.clone();
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    let channel_id = network.open_channel(&mut alice, 500, 100).await;

    let resize = network
        .request(
            &mut alice,
            "resize_channel",
            json!({ "channel_id": channel_id, "resize_amount": "-30", "allocate_amount": "30" }),
            &[&key],
        )
        .await
        .unwrap();
    let close = network
        .request(&mut alice, "close_channel", json!({ "channel_id": channel_id }), &[&key])
        .await
        .unwrap();
    assert_eq!(network.balance(&mut alice).await, 0);

    // The wallet submits the resize after all.
    let (_, mut candidate) = signed_state(&resize);
    candidate.sign(&key, channel_id, CREATOR);
    network.execute(
        &key,
        CustodyCall::Resize {
            channel_id,
            candidate,
            proofs: vec![],
        },
    );
    network.sync().await;
    assert_eq!(network.balance(&mut alice).await, 70);
    assert!(escrow_balance(&network, channel_id).is_zero());
    assert_eq!(
        network.chain.lock().available(alice.address(), TOKEN),
        U256::from(430)
    );

    // The earlier close no longer matches the channel's funds.
    let (_, mut stale) = signed_state(&close);
    stale.sign(&key, channel_id, CREATOR);
    let rejected = network.chain.lock().execute(
        alice.address(),
        CustodyCall::Close {
            channel_id,
            candidate: stale,
        },
    );
    assert!(rejected.is_err());

    let close = network
        .request(&mut alice, "close_channel", json!({ "channel_id": channel_id }), &[&key])
        .await
        .unwrap();
    let (_, mut finalize) = signed_state(&close);
    assert_eq!(finalize.allocations[CREATOR].amount, U256::from(70));
    finalize.sign(&key, channel_id, CREATOR);
    network.execute(&key, CustodyCall::Close { channel_id, candidate: finalize });
    network.sync().await;
    assert_eq!(
        network.chain.lock().available(alice.address(), TOKEN),
        U256::from(500)
    );
    assert_eq!(network.balance(&mut alice).await, 0);
    assert!(escrow_balance(&network, channel_id).is_zero());
}
