use custody::error::CustodyError;

use crate::cfg::Amount;

/// An error returned to an RPC caller.
///
/// Every variant except [RpcError::Internal] is an explicit denial: the request had no effect and the caller can
/// tell why.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// Malformed parameters or a request that does not make sense in the current state.
    #[error("{0}")]
    Validation(String),
    /// A missing, invalid or expired signature or session key.
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error(
        "allowance exceeded for {asset}: used {used} of {allowance}, requested {requested}"
    )]
    AllowanceExceeded {
        asset: String,
        used: Amount,
        allowance: Amount,
        requested: Amount,
    },
    /// The request was built on a stale version. The caller should refetch and retry.
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("chain reconciliation failed: {0}")]
    ChainReconciliation(String),
    #[error("execution reverted: {0}")]
    ContractRevert(#[from] CustodyError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RpcError {
    pub fn validation(message: impl Into<String>) -> Self {
        RpcError::Validation(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        RpcError::Authentication(message.into())
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        RpcError::StateConflict(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        RpcError::NotFound(what.into())
    }

    pub fn error_code(&self) -> i32 {
        match self {
            RpcError::Validation(_) => 400,
            RpcError::Authentication(_) => 401,
            RpcError::AllowanceExceeded { .. } => 402,
            RpcError::NotFound(_) => 404,
            RpcError::StateConflict(_) => 409,
            RpcError::ChainReconciliation(_) => 502,
            RpcError::ContractRevert(_) => 3,
            RpcError::Internal(_) => -32603,
        }
    }
}

impl From<rusqlite::Error> for RpcError {
    fn from(error: rusqlite::Error) -> Self {
        RpcError::Internal(error.into())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(error: serde_json::Error) -> Self {
        RpcError::Validation(error.to_string())
    }
}
