mod app_sessions;
mod auth;
mod channels;

use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, U256, keccak256};
use clearnode::{
    auth::AuthRequest,
    broker::Broker,
    cfg::{AssetConfig, AuthConfig, ChainConfig, Config, SyncConfig},
    db::Db,
    notify::Notifier,
    rpc::handler::{ConnectionState, handle},
    session_keys::Allowance,
    settlement::LocalSettlement,
    sync::Synchronizer,
    time::{pause_at_epoch, unix_millis, unix_secs},
};
use custody::{
    CustodyConfig,
    adjudicator::Consensus,
    chain::{CustodyCall, LocalChain, Receipt},
    crypto::{SecretKey, recover_signer},
    state::ChannelId,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

pub const CHAIN_ID: u64 = 31337;
pub const TOKEN: Address = Address::repeat_byte(0x70);
pub const ADJUDICATOR: Address = Address::repeat_byte(0xad);
pub const GENESIS: u64 = 1_700_000_000;

/// A broker wired to an in-process chain, driven through the same request handler the WebSocket server uses.
pub struct Network {
    pub config: Arc<Config>,
    pub chain: Arc<Mutex<LocalChain>>,
    pub broker: Arc<Broker>,
    pub synchronizer: Synchronizer,
}

pub struct Client {
    pub key: SecretKey,
    pub state: ConnectionState,
    next_id: u64,
}

impl Client {
    pub fn address(&self) -> Address {
        self.key.address()
    }
}

/// An RPC error: its code and message.
pub type Denial = (i64, String);

impl Network {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        pause_at_epoch(Duration::from_secs(GENESIS));

        let config = Arc::new(Config {
            listen_address: clearnode::cfg::listen_address_default(),
            database_path: None,
            chain: ChainConfig {
                chain_id: CHAIN_ID,
                custody_address: Address::repeat_byte(0xcc),
                adjudicator_address: ADJUDICATOR,
                challenge_period: 3_600,
                eip712: true,
            },
            assets: vec![AssetConfig {
                symbol: "usdc".to_owned(),
                token: TOKEN,
                decimals: 6,
            }],
            auth: AuthConfig::default(),
            sync: SyncConfig::default(),
        });
        let mut chain = LocalChain::new(
            CustodyConfig {
                chain_id: CHAIN_ID,
                address: Address::repeat_byte(0xcc),
                min_challenge_period: 60,
                eip712: true,
            },
            GENESIS,
        );
        chain
            .custody_mut()
            .register_adjudicator(ADJUDICATOR, Arc::new(Consensus));
        let chain = Arc::new(Mutex::new(chain));

        let key = SecretKey::new();
        let db = Arc::new(Db::new_in_memory().unwrap());
        let notifier = Notifier::new(64);
        let synchronizer = Synchronizer::new(
            db.clone(),
            Arc::new(LocalSettlement::new(chain.clone(), key.address())),
            config.clone(),
            key.clone(),
            notifier.clone(),
        );
        Network {
            config: config.clone(),
            chain,
            broker: Arc::new(Broker::new(db, config, key, notifier)),
            synchronizer,
        }
    }

    pub fn broker_address(&self) -> Address {
        self.broker.key().address()
    }

    /// A client whose wallet holds `tokens` on chain.
    pub fn client(&self, tokens: u64) -> Client {
        let key = SecretKey::new();
        self.chain
            .lock()
            .mint(key.address(), TOKEN, U256::from(tokens));
        Client {
            key,
            state: ConnectionState::default(),
            next_id: 1,
        }
    }

    pub fn execute(&self, from: &SecretKey, call: CustodyCall) -> Receipt {
        self.chain.lock().execute(from.address(), call).unwrap()
    }

    pub async fn sync(&self) {
        self.synchronizer.sync_once().await.unwrap();
    }

    /// Sends `method` signed by each of `signers` and checks the broker's signature on the response.
    pub async fn request(
        &self,
        client: &mut Client,
        method: &str,
        params: Value,
        signers: &[&SecretKey],
    ) -> Result<Value, Denial> {
        let id = client.next_id;
        client.next_id += 1;
        let req = serde_json::to_string(&json!([id, method, params, unix_millis()])).unwrap();
        let sig: Vec<_> = signers
            .iter()
            .map(|key| key.sign_hash(keccak256(req.as_bytes())))
            .collect();
        // Signatures cover the exact request text, so it goes into the envelope verbatim.
        let text = format!(
            r#"{{"req":{req},"sig":{}}}"#,
            serde_json::to_string(&sig).unwrap()
        );

        let response: Value = serde_json::from_str(&handle(&self.broker, &mut client.state, &text).await).unwrap();
        if let Some(err) = response.get("err") {
            return Err((err[1].as_i64().unwrap(), err[2].as_str().unwrap().to_owned()));
        }
        let res = &response["res"];
        assert_eq!(res[0], json!(id));
        let signature: alloy::primitives::Bytes = serde_json::from_value(response["sig"][0].clone()).unwrap();
        let signer = recover_signer(keccak256(serde_json::to_string(res).unwrap().as_bytes()), &signature).unwrap();
        assert_eq!(signer, self.broker_address());
        Ok(res[2].clone())
    }

    /// Authenticates `client` with `session_key` for `application`. Logs in with the wallet itself if no key is
    /// given.
    pub async fn login(
        &self,
        client: &mut Client,
        session_key: Option<&SecretKey>,
        application: &str,
        allowances: Vec<Allowance>,
    ) -> Result<Value, Denial> {
        let request = AuthRequest {
            address: client.address(),
            session_key: session_key.map_or(client.address(), SecretKey::address),
            application: application.to_owned(),
            scope: "app".to_owned(),
            allowances,
            expires_at: unix_secs() + 3_600,
        };
        let challenge = self
            .request(client, "auth_request", serde_json::to_value(&request).unwrap(), &[])
            .await?;
        let challenge = challenge["challenge_message"].as_str().unwrap().to_owned();
        let policy_hash = request.policy_hash(&challenge);
        let mut signatures = vec![client.key.sign_hash(policy_hash)];
        signatures.extend(session_key.map(|key| key.sign_hash(policy_hash)));
        let text = format!(
            r#"{{"req":[{},"auth_verify",{{"challenge":"{challenge}"}},{}],"sig":{}}}"#,
            client.next_id,
            unix_millis(),
            serde_json::to_string(&signatures).unwrap()
        );
        client.next_id += 1;
        let response: Value = serde_json::from_str(&handle(&self.broker, &mut client.state, &text).await).unwrap();
        match response.get("err") {
            Some(err) => Err((err[1].as_i64().unwrap(), err[2].as_str().unwrap().to_owned())),
            None => Ok(response["res"][2].clone()),
        }
    }

    pub async fn balance(&self, client: &mut Client) -> u128 {
        let key = client.key.clone();
        let balances = self
            .request(client, "get_ledger_balances", json!({}), &[&key])
            .await
            .unwrap();
        balances["ledger_balances"]
            .as_array()
            .unwrap()
            .iter()
            .find(|b| b["asset"] == "usdc")
            .map_or(0, |b| b["amount"].as_str().unwrap().parse().unwrap())
    }

    /// Deposits `deposit` into custody, opens a channel of `amount` the broker co-signed and applies the events.
    pub async fn open_channel(&self, client: &mut Client, deposit: u64, amount: u64) -> ChannelId {
        self.execute(
            &client.key,
            CustodyCall::Deposit {
                token: TOKEN,
                amount: U256::from(deposit),
            },
        );
        let key = client.key.clone();
        let prepared = self
            .request(
                client,
                "create_channel",
                json!({ "chain_id": CHAIN_ID, "token": TOKEN, "amount": amount.to_string() }),
                &[&key],
            )
            .await
            .unwrap();
        let channel_id: ChannelId = serde_json::from_value(prepared["channel_id"].clone()).unwrap();
        let channel = serde_json::from_value(prepared["channel"].clone()).unwrap();
        let mut initial: custody::state::State = serde_json::from_value(prepared["state"].clone()).unwrap();
        initial.sign(&client.key, channel_id, custody::state::CREATOR);
        self.execute(&client.key, CustodyCall::Create { channel, initial });
        self.sync().await;
        channel_id
    }
}
