//! Dispatches one request text to the broker and renders the response text.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::*;

use super::envelope::{RpcErrorResponse, RpcPayload, RpcRequest, RpcResponse, parse_params};
use crate::{
    app_session::{CloseAppSession, CreateAppSession, SubmitAppState},
    auth::AuthRequest,
    broker::{
        Broker, GetAppDefinition, GetAppSessions, GetAssets, GetChannels, GetLedgerBalances,
        GetLedgerEntries, GetLedgerTransactions, GetRpcHistory, RevokeSessionKey, Transfer,
    },
    channels::{CloseChannel, CreateChannel, ResizeChannel},
    error::RpcError,
    session_keys::Signer,
    time::unix_millis,
};

/// What a connection has proven about itself.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    /// Set once `auth_verify` succeeds.
    pub wallet: Option<Address>,
    pub session_key: Option<Address>,
}

impl ConnectionState {
    fn wallet(&self) -> Result<Address, RpcError> {
        self.wallet
            .ok_or_else(|| RpcError::authentication("connection is not authenticated"))
    }
}

#[derive(Debug, Deserialize)]
struct AuthVerify {
    challenge: String,
}

#[derive(Debug, Serialize)]
struct AuthVerified {
    address: Address,
    session_key: Address,
    success: bool,
}

fn value(v: impl Serialize) -> Result<Value, RpcError> {
    serde_json::to_value(v).map_err(|e| RpcError::Internal(e.into()))
}

/// Resolves the request's signers. At least one must act for the connection's wallet, and that one is returned.
fn actor(broker: &Broker, state: &ConnectionState, request: &RpcRequest) -> Result<Signer, RpcError> {
    let wallet = state.wallet()?;
    broker
        .resolve_signers(&request.signers()?)?
        .into_iter()
        .find(|signer| signer.wallet() == wallet)
        .ok_or_else(|| {
            RpcError::authentication(format!(
                "request must be signed by {wallet} or one of its session keys"
            ))
        })
}

/// Every resolved signer of a request on an authenticated connection.
fn signers(broker: &Broker, state: &ConnectionState, request: &RpcRequest) -> Result<Vec<Signer>, RpcError> {
    state.wallet()?;
    let signers = broker.resolve_signers(&request.signers()?)?;
    if signers.is_empty() {
        return Err(RpcError::authentication("request is not signed"));
    }
    Ok(signers)
}

async fn dispatch(
    broker: &Broker,
    state: &mut ConnectionState,
    request: &RpcRequest,
    payload: &RpcPayload,
) -> Result<(&'static str, Value), RpcError> {
    let params = &payload.params;
    let response = match payload.method.as_str() {
        "ping" => ("pong", json!({})),
        "get_config" => ("get_config", value(broker.config_info())?),
        "get_assets" => {
            let params: GetAssets = parse_params(params)?;
            ("get_assets", json!({ "assets": broker.assets(&params) }))
        }
        "auth_request" => {
            let params: AuthRequest = parse_params(params)?;
            let challenge = broker.auth_request(&params)?;
            ("auth_challenge", json!({ "challenge_message": challenge }))
        }
        "auth_verify" => {
            let params: AuthVerify = parse_params(params)?;
            let authenticated = broker.auth_verify(&params.challenge, &request.sig)?;
            let session_key = authenticated
                .session_key
                .map_or(authenticated.wallet, |key| key.address);
            state.wallet = Some(authenticated.wallet);
            state.session_key = Some(session_key);
            (
                "auth_verify",
                value(AuthVerified {
                    address: authenticated.wallet,
                    session_key,
                    success: true,
                })?,
            )
        }
        "get_ledger_balances" => {
            let params: GetLedgerBalances = parse_params(params)?;
            let balances = broker.balances(state.wallet, &params)?;
            ("get_ledger_balances", json!({ "ledger_balances": balances }))
        }
        "get_ledger_entries" => {
            let params: GetLedgerEntries = parse_params(params)?;
            ("get_ledger_entries", json!({ "ledger_entries": broker.entries(&params)? }))
        }
        "get_ledger_transactions" => {
            let params: GetLedgerTransactions = parse_params(params)?;
            (
                "get_ledger_transactions",
                json!({ "ledger_transactions": broker.transactions(&params)? }),
            )
        }
        "get_channels" => {
            let params: GetChannels = parse_params(params)?;
            ("get_channels", json!({ "channels": broker.channels(&params)? }))
        }
        "get_app_sessions" => {
            let params: GetAppSessions = parse_params(params)?;
            ("get_app_sessions", json!({ "app_sessions": broker.app_sessions(&params)? }))
        }
        "get_app_definition" => {
            let params: GetAppDefinition = parse_params(params)?;
            ("get_app_definition", value(broker.app_definition(&params)?)?)
        }
        "get_session_keys" => (
            "get_session_keys",
            json!({ "session_keys": broker.session_keys(state.wallet()?)? }),
        ),
        "get_rpc_history" => {
            let params: GetRpcHistory = parse_params(params)?;
            (
                "get_rpc_history",
                json!({ "rpc_entries": broker.rpc_history(state.wallet()?, &params)? }),
            )
        }
        "revoke_session_key" => {
            let params: RevokeSessionKey = parse_params(params)?;
            let signer = actor(broker, state, request)?;
            let revoked = broker.revoke_session_key(&signer, &params).await?;
            ("revoke_session_key", json!({ "session_key": revoked }))
        }
        "transfer" => {
            let params: Transfer = parse_params(params)?;
            let signer = actor(broker, state, request)?;
            let transactions = broker.transfer(&signer, &params).await?;
            ("transfer", json!({ "transactions": transactions }))
        }
        "create_channel" => {
            let params: CreateChannel = parse_params(params)?;
            let signer = actor(broker, state, request)?;
            ("create_channel", value(broker.create_channel(&signer, &params).await?)?)
        }
        "resize_channel" => {
            let params: ResizeChannel = parse_params(params)?;
            let signer = actor(broker, state, request)?;
            ("resize_channel", value(broker.resize_channel(&signer, &params).await?)?)
        }
        "close_channel" => {
            let params: CloseChannel = parse_params(params)?;
            let signer = actor(broker, state, request)?;
            ("close_channel", value(broker.close_channel(&signer, &params).await?)?)
        }
        "create_app_session" => {
            let params: CreateAppSession = parse_params(params)?;
            let signers = signers(broker, state, request)?;
            (
                "create_app_session",
                value(broker.create_app_session(&signers, &params).await?)?,
            )
        }
        "submit_app_state" => {
            let params: SubmitAppState = parse_params(params)?;
            let signers = signers(broker, state, request)?;
            (
                "submit_app_state",
                value(broker.submit_app_state(&signers, &params).await?)?,
            )
        }
        "close_app_session" => {
            let params: CloseAppSession = parse_params(params)?;
            let signers = signers(broker, state, request)?;
            (
                "close_app_session",
                value(broker.close_app_session(&signers, &params).await?)?,
            )
        }
        other => return Err(RpcError::not_found(format!("method {other}"))),
    };
    Ok(response)
}

fn error_text(id: u64, error: &RpcError) -> String {
    let response = RpcErrorResponse::new(id, error, unix_millis());
    serde_json::to_string(&response).unwrap_or_else(|_| {
        format!(r#"{{"err":[{id},{},"internal error",0]}}"#, error.error_code())
    })
}

/// Handles one request text, returning the response text to send back.
pub async fn handle(broker: &Broker, state: &mut ConnectionState, text: &str) -> String {
    let request = match RpcRequest::parse(text) {
        Ok(request) => request,
        Err(e) => return error_text(0, &e),
    };
    let payload = match request.payload() {
        Ok(payload) => payload,
        Err(e) => return error_text(0, &e),
    };

    let result = dispatch(broker, state, &request, &payload).await;
    let (text, res_sig) = match result.and_then(|(method, params)| {
        let res = RpcPayload {
            id: payload.id,
            method: method.to_owned(),
            params,
            timestamp: unix_millis(),
        };
        let response = RpcResponse::signed(res, broker.key())?;
        let text = serde_json::to_string(&response).map_err(|e| RpcError::Internal(e.into()))?;
        Ok((text, response.sig))
    }) {
        Ok(ok) => ok,
        Err(e) => {
            match &e {
                RpcError::Internal(e) => error!(method = %payload.method, id = payload.id, %e, "request failed"),
                e => debug!(method = %payload.method, id = payload.id, %e, "request denied"),
            }
            (error_text(payload.id, &e), vec![])
        }
    };

    if let Some(wallet) = state.wallet {
        broker.record_history(wallet, &payload, &request.sig, &text, &res_sig);
    }
    text
}

/// Renders a notification for `method` with the response envelope and id 0.
pub fn notification_text(broker: &Broker, method: &str, params: Value) -> Result<String, RpcError> {
    let res = RpcPayload {
        id: 0,
        method: method.to_owned(),
        params,
        timestamp: unix_millis(),
    };
    let response = RpcResponse::signed(res, broker.key())?;
    serde_json::to_string(&response).map_err(|e| RpcError::Internal(e.into()))
}
