//! The wire envelope: `{"req": [id, method, params, timestamp], "sig": [...]}` and its response counterparts.

use alloy::primitives::{Address, B256, Bytes, keccak256};
use custody::crypto::{SecretKey, recover_signer};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, value::RawValue};

use crate::error::RpcError;

/// `[id, method, params, timestamp]`. The timestamp is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(u64, String, Value, u64)", into = "(u64, String, Value, u64)")]
pub struct RpcPayload {
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub timestamp: u64,
}

impl From<(u64, String, Value, u64)> for RpcPayload {
    fn from((id, method, params, timestamp): (u64, String, Value, u64)) -> Self {
        RpcPayload {
            id,
            method,
            params,
            timestamp,
        }
    }
}

impl From<RpcPayload> for (u64, String, Value, u64) {
    fn from(payload: RpcPayload) -> Self {
        (payload.id, payload.method, payload.params, payload.timestamp)
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    /// Kept verbatim, since signatures cover the exact bytes the client sent.
    pub req: Box<RawValue>,
    #[serde(default)]
    pub sig: Vec<Bytes>,
}

impl RpcRequest {
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        serde_json::from_str(text)
            .map_err(|e| RpcError::validation(format!("invalid request envelope: {e}")))
    }

    pub fn payload(&self) -> Result<RpcPayload, RpcError> {
        serde_json::from_str(self.req.get())
            .map_err(|e| RpcError::validation(format!("invalid request payload: {e}")))
    }

    /// The digest every request signature covers.
    pub fn hash(&self) -> B256 {
        keccak256(self.req.get().as_bytes())
    }

    /// The distinct addresses which signed the request, in signature order.
    pub fn signers(&self) -> Result<Vec<Address>, RpcError> {
        let hash = self.hash();
        let mut signers = Vec::with_capacity(self.sig.len());
        for sig in &self.sig {
            let signer = recover_signer(hash, sig)
                .map_err(|e| RpcError::authentication(format!("invalid signature: {e}")))?;
            if !signers.contains(&signer) {
                signers.push(signer);
            }
        }
        Ok(signers)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub res: RpcPayload,
    pub sig: Vec<Bytes>,
}

impl RpcResponse {
    /// A response signed by the broker over the JSON text of `res`.
    pub fn signed(res: RpcPayload, broker: &SecretKey) -> Result<Self, RpcError> {
        let json = serde_json::to_string(&res).map_err(anyhow::Error::from)?;
        let sig = vec![broker.sign_hash(keccak256(json.as_bytes()))];
        Ok(RpcResponse { res, sig })
    }
}

/// `{"err": [id, code, message, timestamp]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub err: (u64, i32, String, u64),
}

impl RpcErrorResponse {
    pub fn new(id: u64, error: &RpcError, timestamp: u64) -> Self {
        RpcErrorResponse {
            err: (id, error.error_code(), error.to_string(), timestamp),
        }
    }
}

/// Method parameters as either the current object form or the legacy form: the same object wrapped in a one-element
/// array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Versioned<T> {
    Current(T),
    Legacy([T; 1]),
}

impl<T> Versioned<T> {
    fn into_inner(self) -> T {
        match self {
            Versioned::Current(t) => t,
            Versioned::Legacy([t]) => t,
        }
    }
}

/// Decodes method parameters. Absent parameters decode like an empty object.
pub fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, RpcError> {
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        Value::Array(items) if items.is_empty() => Value::Object(Default::default()),
        params => params.clone(),
    };
    serde_json::from_value::<Versioned<T>>(params)
        .map(Versioned::into_inner)
        .map_err(|_| RpcError::validation("invalid parameters"))
}
