//! Per-wallet record of authenticated requests and the responses they got.

use alloy::primitives::{Address, Bytes};
use anyhow::Result;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use super::envelope::RpcPayload;
use crate::db::{AddressSqlable, from_json, to_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRecord {
    pub id: i64,
    pub sender: Address,
    pub req_id: u64,
    pub method: String,
    /// The request parameters as JSON text.
    pub params: String,
    pub timestamp: u64,
    pub req_sig: Vec<Bytes>,
    /// The response envelope as sent.
    pub response: String,
    pub res_sig: Vec<Bytes>,
}

pub fn record(
    conn: &Connection,
    wallet: Address,
    request: &RpcPayload,
    req_sig: &[Bytes],
    response: &str,
    res_sig: &[Bytes],
) -> Result<()> {
    conn.execute(
        "INSERT INTO rpc_history (wallet, request_id, method, params, timestamp, request_sigs, response,
            response_sigs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            AddressSqlable(wallet),
            request.id,
            request.method,
            to_json(&request.params)?,
            request.timestamp,
            to_json(&req_sig)?,
            response,
            to_json(&res_sig)?,
        ],
    )?;
    Ok(())
}

/// The wallet's history, newest first.
pub fn list(conn: &Connection, wallet: Address, limit: u64, offset: u64) -> Result<Vec<RpcRecord>> {
    let mut statement = conn.prepare_cached(
        "SELECT id, wallet, request_id, method, params, timestamp, request_sigs, response, response_sigs
         FROM rpc_history WHERE wallet = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
    )?;
    let rows = statement
        .query_map(params![AddressSqlable(wallet), limit, offset], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, AddressSqlable>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(
            |(id, sender, req_id, method, params, timestamp, req_sig, response, res_sig)| {
                Ok(RpcRecord {
                    id,
                    sender: sender.into(),
                    req_id,
                    method,
                    params,
                    timestamp,
                    req_sig: from_json(&req_sig)?,
                    response,
                    res_sig: from_json(&res_sig)?,
                })
            },
        )
        .collect()
}
