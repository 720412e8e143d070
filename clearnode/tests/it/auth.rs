use std::time::Duration;

use clearnode::{
    auth::AuthRequest,
    cfg::Amount,
    error::RpcError,
    session_keys::Allowance,
    time::{advance, unix_secs},
};
use custody::crypto::SecretKey;
use serde_json::json;

use crate::Network;

fn usdc(amount: u128) -> Vec<Allowance> {
    vec![Allowance {
        asset: "usdc".to_owned(),
        amount: Amount(amount),
    }]
}

#[tokio::test]
async fn session_key_spends_within_its_allowance() {
    let network = Network::new();
    let mut alice = network.client(100);
    let bob = network.client(0);
    let session_key = SecretKey::new();
    let verified = network
        .login(&mut alice, Some(&session_key), "game", usdc(50))
        .await
        .unwrap();
    assert_eq!(verified["session_key"], json!(session_key.address()));
    assert_eq!(verified["success"], json!(true));
    network.open_channel(&mut alice, 100, 100).await;

    let transfer = |amount: &str| {
        json!({
            "destination": bob.address(),
            "allocations": [{ "asset": "usdc", "amount": amount }],
        })
    };
    network
        .request(&mut alice, "transfer", transfer("30"), &[&session_key])
        .await
        .unwrap();
    let (code, message) = network
        .request(&mut alice, "transfer", transfer("30"), &[&session_key])
        .await
        .unwrap_err();
    assert_eq!(code, 402);
    assert!(message.contains("used 30 of 50"), "{message}");

    // The wallet itself is not bound by the allowance.
    let wallet = alice.key.clone();
    network
        .request(&mut alice, "transfer", transfer("30"), &[&wallet])
        .await
        .unwrap();
    assert_eq!(network.balance(&mut alice).await, 40);

    let keys = network
        .request(&mut alice, "get_session_keys", json!({}), &[&wallet])
        .await
        .unwrap();
    let key = &keys["session_keys"][0];
    assert_eq!(key["session_key"], json!(session_key.address()));
    assert_eq!(key["application"], "game");
    assert_eq!(key["allowances"][0]["used"], "30");
}

#[tokio::test]
async fn challenges_are_single_use() {
    let network = Network::new();
    let wallet = SecretKey::new();
    let session_key = SecretKey::new();
    let request = AuthRequest {
        address: wallet.address(),
        session_key: session_key.address(),
        application: "game".to_owned(),
        scope: "app".to_owned(),
        allowances: vec![],
        expires_at: unix_secs() + 60,
    };
    let sign = |signer: &SecretKey, challenge: &str| {
        let hash = request.policy_hash(challenge);
        vec![signer.sign_hash(hash), session_key.sign_hash(hash)]
    };
    let challenge = network.broker.auth_request(&request).unwrap();
    let signatures = sign(&wallet, &challenge);
    let authenticated = network.broker.auth_verify(&challenge, &signatures).unwrap();
    assert_eq!(authenticated.wallet, wallet.address());
    assert!(network.broker.auth_verify(&challenge, &signatures).is_err());

    // Signed by anyone but the wallet, a fresh challenge is refused.
    let challenge = network.broker.auth_request(&request).unwrap();
    let forged = sign(&SecretKey::new(), &challenge);
    assert!(network.broker.auth_verify(&challenge, &forged).is_err());
}

#[tokio::test]
async fn signed_methods_need_an_authenticated_connection() {
    let network = Network::new();
    let mut alice = network.client(0);
    let key = alice.key.clone();
    let (code, _) = network
        .request(
            &mut alice,
            "transfer",
            json!({
                "destination": SecretKey::new().address(),
                "allocations": [{ "asset": "usdc", "amount": "1" }],
            }),
            &[&key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 401);

    // Public methods answer anyone.
    network.request(&mut alice, "ping", json!([]), &[]).await.unwrap();
    let config = network
        .request(&mut alice, "get_config", json!({}), &[])
        .await
        .unwrap();
    assert_eq!(config["broker_address"], json!(network.broker_address()));
    let (code, _) = network
        .request(&mut alice, "no_such_method", json!({}), &[])
        .await
        .unwrap_err();
    assert_eq!(code, 404);
}

#[tokio::test]
async fn revoked_session_keys_stop_signing() {
    let network = Network::new();
    let mut alice = network.client(0);
    let wallet = alice.key.clone();
    let session_key = SecretKey::new();
    network
        .login(&mut alice, Some(&session_key), "game", vec![])
        .await
        .unwrap();
    network
        .request(&mut alice, "get_session_keys", json!({}), &[&session_key])
        .await
        .unwrap();

    let revoked = network
        .request(
            &mut alice,
            "revoke_session_key",
            json!({ "session_key": session_key.address() }),
            &[&wallet],
        )
        .await
        .unwrap();
    assert_eq!(revoked["session_key"], json!(session_key.address()));

    let (code, _) = network
        .request(
            &mut alice,
            "transfer",
            json!({
                "destination": SecretKey::new().address(),
                "allocations": [{ "asset": "usdc", "amount": "1" }],
            }),
            &[&session_key],
        )
        .await
        .unwrap_err();
    assert_eq!(code, 401);
    let keys = network
        .request(&mut alice, "get_session_keys", json!({}), &[&wallet])
        .await
        .unwrap();
    assert_eq!(keys["session_keys"], json!([]));
}

#[tokio::test]
async fn history_records_authenticated_requests() {
    let network = Network::new();
    let mut alice = network.client(0);
    let wallet = alice.key.clone();
    network.login(&mut alice, None, "wallet", vec![]).await.unwrap();
    network.request(&mut alice, "ping", json!({}), &[&wallet]).await.unwrap();

    let history = network
        .request(&mut alice, "get_rpc_history", json!({}), &[&wallet])
        .await
        .unwrap();
    let entries = history["rpc_entries"].as_array().unwrap();
    let methods: Vec<_> = entries.iter().map(|e| e["method"].as_str().unwrap()).collect();
    assert_eq!(methods, ["ping", "auth_verify"]);
    assert_eq!(entries[0]["sender"], json!(alice.address()));
    assert_eq!(entries[0]["req_sig"].as_array().unwrap().len(), 1);

    // Other wallets see only their own.
    let mut bob = network.client(0);
    let bob_key = bob.key.clone();
    network.login(&mut bob, None, "wallet", vec![]).await.unwrap();
    let history = network
        .request(&mut bob, "get_rpc_history", json!({}), &[&bob_key])
        .await
        .unwrap();
    assert_eq!(history["rpc_entries"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn wallets_cannot_be_claimed_as_session_keys() {
    let network = Network::new();
    let mut mallory = network.client(0);
    let mut victim = network.client(100);
    let victim_key = victim.key.clone();
    network.login(&mut mallory, None, "wallet", vec![]).await.unwrap();

    // Without the victim's countersignature the claim is refused.
    let request = AuthRequest {
        address: mallory.address(),
        session_key: victim.address(),
        application: "game".to_owned(),
        scope: "app".to_owned(),
        allowances: vec![],
        expires_at: unix_secs() + 3_600,
    };
    let challenge = network.broker.auth_request(&request).unwrap();
    let signature = mallory.key.sign_hash(request.policy_hash(&challenge));
    assert!(matches!(
        network.broker.auth_verify(&challenge, &[signature]),
        Err(RpcError::Authentication(_))
    ));

    // Once an address has logged in as a wallet it stays one, whoever signs.
    network.login(&mut victim, None, "wallet", vec![]).await.unwrap();
    let (code, _) = network
        .login(&mut mallory, Some(&victim_key), "game", vec![])
        .await
        .unwrap_err();
    assert_eq!(code, 401);

    network.open_channel(&mut victim, 100, 100).await;
    assert_eq!(network.balance(&mut victim).await, 100);
    assert_eq!(network.balance(&mut mallory).await, 0);
    let keys = network
        .request(&mut victim, "get_session_keys", json!({}), &[&victim_key])
        .await
        .unwrap();
    assert_eq!(keys["session_keys"], json!([]));
}

#[tokio::test]
async fn session_key_expiry_cannot_be_extended() {
    let network = Network::new();
    let mut alice = network.client(0);
    let wallet = alice.key.clone();
    let session_key = SecretKey::new();
    network
        .login(&mut alice, Some(&session_key), "game", vec![])
        .await
        .unwrap();
    let expiry = |keys: serde_json::Value| keys["session_keys"][0]["expires_at"].clone();
    let keys = network
        .request(&mut alice, "get_session_keys", json!({}), &[&wallet])
        .await
        .unwrap();
    let original = expiry(keys);

    advance(Duration::from_secs(1_800));
    network
        .login(&mut alice, Some(&session_key), "game", vec![])
        .await
        .unwrap();
    let keys = network
        .request(&mut alice, "get_session_keys", json!({}), &[&wallet])
        .await
        .unwrap();
    assert_eq!(expiry(keys), original);

    advance(Duration::from_secs(1_800));
    let (code, _) = network
        .request(&mut alice, "get_session_keys", json!({}), &[&session_key])
        .await
        .unwrap_err();
    assert_eq!(code, 401);
    let (code, _) = network
        .login(&mut alice, Some(&session_key), "game", vec![])
        .await
        .unwrap_err();
    assert_eq!(code, 401);
}
