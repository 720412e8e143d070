//! Challenge/response login.
//!
//! A client asks for a challenge with the policy it wants its session key to carry, then answers by signing an EIP-712
//! `Policy` over the challenge with the wallet's own key. The session key countersigns the same policy to show it
//! consents to act for the wallet. A valid answer registers the session key.

use alloy::{
    primitives::{Address, B256, Bytes, U256},
    sol_types::{Eip712Domain, SolStruct},
};
use custody::crypto::recover_signer;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    cfg::AuthConfig,
    db::{from_json, to_json},
    error::RpcError,
    session_keys::{self, Allowance, SessionKey},
};

mod abi {
    use alloy::sol;

    sol! {
        struct Allowance {
            string asset;
            uint256 amount;
        }

        struct Policy {
            string challenge;
            string scope;
            address wallet;
            address session_key;
            uint256 expires_at;
            Allowance[] allowances;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// The wallet logging in.
    pub address: Address,
    pub session_key: Address,
    pub application: String,
    pub scope: String,
    #[serde(default)]
    pub allowances: Vec<Allowance>,
    /// Unix timestamp in seconds.
    pub expires_at: u64,
}

impl AuthRequest {
    /// The EIP-712 digest the wallet signs to answer `challenge`.
    pub fn policy_hash(&self, challenge: &str) -> B256 {
        let policy = abi::Policy {
            challenge: challenge.to_owned(),
            scope: self.scope.clone(),
            wallet: self.address,
            session_key: self.session_key,
            expires_at: U256::from(self.expires_at),
            allowances: self
                .allowances
                .iter()
                .map(|a| abi::Allowance {
                    asset: a.asset.clone(),
                    amount: a.amount.to_u256(),
                })
                .collect(),
        };
        policy.eip712_signing_hash(&domain(&self.application))
    }

    fn validate(&self, config: &AuthConfig, now: u64) -> Result<(), RpcError> {
        if self.application.is_empty() {
            return Err(RpcError::validation("application must not be empty"));
        }
        if self.expires_at <= now {
            return Err(RpcError::validation("expires_at is in the past"));
        }
        if self.expires_at > now + config.max_session_key_lifetime.as_secs() {
            return Err(RpcError::validation(format!(
                "expires_at is more than {}s in the future",
                config.max_session_key_lifetime.as_secs()
            )));
        }
        for (i, allowance) in self.allowances.iter().enumerate() {
            if self.allowances[..i].iter().any(|a| a.asset == allowance.asset) {
                return Err(RpcError::validation(format!(
                    "duplicate allowance for {}",
                    allowance.asset
                )));
            }
        }
        Ok(())
    }
}

/// The EIP-712 domain of an application's login policy. Only the name is set.
pub fn domain(application: &str) -> Eip712Domain {
    Eip712Domain::new(Some(application.to_owned().into()), None, None, None, None)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticated {
    pub wallet: Address,
    /// The registered session key, or `None` if the wallet logged in with itself as the key.
    pub session_key: Option<SessionKey>,
}

/// Validates `request` and stores a fresh challenge for it.
pub fn issue_challenge(
    conn: &Connection,
    config: &AuthConfig,
    request: &AuthRequest,
    now: u64,
) -> Result<String, RpcError> {
    request.validate(config, now)?;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let challenge = hex::encode(bytes);
    conn.execute(
        "INSERT INTO auth_challenges (challenge, request, expires_at) VALUES (?1, ?2, ?3)",
        params![
            challenge,
            to_json(request)?,
            now + config.challenge_lifetime.as_secs()
        ],
    )?;
    debug!(wallet = %request.address, session_key = %request.session_key, "auth challenge issued");
    Ok(challenge)
}

/// Consumes `challenge` if the first of `signatures` is the wallet's signature over its policy, registering the
/// requested session key. A session key other than the wallet must be among the remaining signers.
pub fn verify(
    conn: &Connection,
    config: &AuthConfig,
    challenge: &str,
    signatures: &[Bytes],
    now: u64,
) -> Result<Authenticated, RpcError> {
    let [signature, countersignatures @ ..] = signatures else {
        return Err(RpcError::authentication("missing policy signature"));
    };
    let (request, expires_at, used): (String, u64, bool) = conn
        .query_row(
            "SELECT request, expires_at, used FROM auth_challenges WHERE challenge = ?1",
            [challenge],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| RpcError::authentication("unknown challenge"))?;
    if used {
        return Err(RpcError::authentication("challenge already used"));
    }
    if now >= expires_at {
        return Err(RpcError::authentication("challenge expired"));
    }
    let request: AuthRequest = from_json(&request)?;
    // The session key may have expired while the challenge was outstanding.
    request.validate(config, now)?;

    let policy_hash = request.policy_hash(challenge);
    let signer = recover_signer(policy_hash, signature)
        .map_err(|e| RpcError::authentication(e.to_string()))?;
    if signer != request.address {
        return Err(RpcError::authentication(
            "policy signature does not match wallet",
        ));
    }
    if session_keys::get(conn, request.address)?.is_some() {
        return Err(RpcError::authentication(format!(
            "{} is a session key of another wallet",
            request.address
        )));
    }
    if request.session_key != request.address
        && !countersignatures
            .iter()
            .any(|sig| recover_signer(policy_hash, sig).is_ok_and(|s| s == request.session_key))
    {
        return Err(RpcError::authentication(
            "policy is not countersigned by the session key",
        ));
    }
    conn.execute(
        "UPDATE auth_challenges SET used = 1 WHERE challenge = ?1",
        [challenge],
    )?;
    session_keys::record_wallet(conn, request.address, now)?;

    let session_key = if request.session_key == request.address {
        None
    } else {
        let key = SessionKey {
            address: request.session_key,
            wallet: request.address,
            tag: session_keys::scope_tag(config, &request.scope),
            application: request.application,
            scope: request.scope,
            allowances: request.allowances,
            expires_at: request.expires_at,
            created_at: now,
            revoked: false,
            registered_block: 0,
        };
        Some(session_keys::register(conn, &key, now)?)
    };
    info!(wallet = %request.address, "authenticated");
    Ok(Authenticated {
        wallet: request.address,
        session_key,
    })
}
