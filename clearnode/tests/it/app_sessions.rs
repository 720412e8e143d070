use alloy::primitives::Address;
use custody::crypto::SecretKey;
use serde_json::{Value, json};

use crate::Network;

fn allocations(participants: [Address; 2], amounts: [u64; 2]) -> Value {
    json!([
        { "participant": participants[0], "asset": "usdc", "amount": amounts[0].to_string() },
        { "participant": participants[1], "asset": "usdc", "amount": amounts[1].to_string() },
    ])
}

#[tokio::test]
async fn two_party_session_lifecycle() {
    let network = Network::new();
    let mut alice = network.client(100);
    let mut bob = network.client(50);
    let (alice_key, bob_key) = (alice.key.clone(), bob.key.clone());
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    network.login(&mut bob, None, "wallet", vec![]).await.unwrap();
    network.open_channel(&mut alice, 100, 100).await;
    network.open_channel(&mut bob, 50, 50).await;
    let participants = [alice.address(), bob.address()];

    let definition = json!({
        "application": "chess",
        "protocol": "chess/v1",
        "participants": participants,
        "weights": [50, 50],
        "quorum": 100,
        "challenge": 0,
        "nonce": 7,
    });
    let session = network
        .request(
            &mut alice,
            "create_app_session",
            json!({ "definition": definition, "allocations": allocations(participants, [40, 10]) }),
            &[&alice_key, &bob_key],
        )
        .await
        .unwrap();
    let app_session_id = session["app_session_id"].clone();
    assert_eq!(session["version"], 1);
    assert_eq!(session["status"], "open");
    assert_eq!(network.balance(&mut alice).await, 60);
    assert_eq!(network.balance(&mut bob).await, 40);
    let held = network
        .request(
            &mut alice,
            "get_ledger_balances",
            json!({ "account_id": app_session_id }),
            &[&alice_key],
        )
        .await
        .unwrap();
    assert_eq!(held["ledger_balances"][0]["amount"], "50");

    let submit = |version: u64, amounts: [u64; 2]| {
        json!({
            "app_session_id": app_session_id,
            "version": version,
            "allocations": allocations(participants, amounts),
        })
    };
    // Half the weight is not enough.
    let (code, _) = network
        .request(&mut alice, "submit_app_state", submit(2, [20, 30]), &[&alice_key])
        .await
        .unwrap_err();
    assert_eq!(code, 401);
    let (code, _) = network
        .request(
            &mut alice,
            "submit_app_state",
            submit(2, [20, 40]),
            &[&alice_key, &bob_key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 400);
    let updated = network
        .request(
            &mut alice,
            "submit_app_state",
            submit(2, [20, 30]),
            &[&alice_key, &bob_key],
        )
        .await
        .unwrap();
    assert_eq!(updated["version"], 2);
    let (code, _) = network
        .request(
            &mut bob,
            "submit_app_state",
            submit(2, [25, 25]),
            &[&alice_key, &bob_key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 409);

    let closed = network
        .request(
            &mut bob,
            "close_app_session",
            json!({
                "app_session_id": app_session_id,
                "allocations": allocations(participants, [20, 30]),
            }),
            &[&alice_key, &bob_key],
        )
        .await
        .unwrap();
    assert_eq!(closed["status"], "closed");
    assert_eq!(network.balance(&mut alice).await, 80);
    assert_eq!(network.balance(&mut bob).await, 70);

    let sessions = network
        .request(
            &mut alice,
            "get_app_sessions",
            json!({ "participant": participants[0], "status": "closed" }),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(sessions["app_sessions"].as_array().unwrap().len(), 1);
    let definition = network
        .request(
            &mut alice,
            "get_app_definition",
            json!({ "app_session_id": app_session_id }),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(definition["quorum"], 100);
}

#[tokio::test]
async fn session_keys_act_only_for_their_application() {
    let network = Network::new();
    let mut alice = network.client(100);
    let bob = network.client(0);
    let session_key = SecretKey::new();
    network
        .login(&mut alice, Some(&session_key), "poker", vec![])
        .await
        .unwrap();
    network.open_channel(&mut alice, 100, 100).await;
    let participants = [alice.address(), bob.address()];

    let create = |application: &str| {
        json!({
            "definition": {
                "application": application,
                "protocol": "v1",
                "participants": participants,
                "weights": [100, 0],
                "quorum": 100,
            },
            "allocations": [],
        })
    };
    let (code, _) = network
        .request(&mut alice, "create_app_session", create("chess"), &[&session_key])
        .await
        .unwrap_err();
    assert_eq!(code, 401);
    network
        .request(&mut alice, "create_app_session", create("poker"), &[&session_key])
        .await
        .unwrap();
}
