//! Signature verification across the five accepted schemes.
//!
//! Each scheme is a pure function of a [Verification] and they are tried in a fixed order until one accepts. The
//! order matters only for performance: the cheap ECDSA schemes run first, and contract calls are only made once they
//! have all failed.

use std::sync::LazyLock;

use alloy::{
    primitives::{Address, B256, Bytes, FixedBytes, eip191_hash_message, keccak256},
    sol,
    sol_types::{SolCall, SolValue},
};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    crypto::{ECDSA_SIGNATURE_LEN, eip712_digest, recover_signer},
    evm::ContractEnv,
    state::{ChannelId, State},
};

sol! {
    function isValidSignature(bytes32 hash, bytes signature) external view returns (bytes4 magicValue);
}

/// `bytes4(keccak256("isValidSignature(bytes32,bytes)"))`.
pub const ERC1271_MAGIC_VALUE: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];

/// Suffix marking an ERC-6492 wrapped signature.
pub const ERC6492_MAGIC_SUFFIX: [u8; 32] = [
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
];

/// Domain separator value meaning "this verifier does not support EIP-712 signatures".
pub static NO_EIP712_SUPPORT: LazyLock<B256> = LazyLock::new(|| keccak256("NoEIP712Support"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    RawEcdsa,
    Eip191,
    Eip712,
    Erc1271,
    Erc6492,
}

/// What was signed. States are signed over their ABI packing, and additionally carry their EIP-712 struct hash.
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub packed: Bytes,
    pub struct_hash: Option<B256>,
}

impl SignedPayload {
    pub fn message(packed: Bytes) -> Self {
        SignedPayload {
            packed,
            struct_hash: None,
        }
    }

    pub fn state(state: &State, channel_id: ChannelId) -> Self {
        SignedPayload {
            packed: state.packed(channel_id),
            struct_hash: Some(state.struct_hash(channel_id)),
        }
    }

    pub fn hash(&self) -> B256 {
        keccak256(&self.packed)
    }
}

pub struct Verification<'a> {
    pub payload: &'a SignedPayload,
    pub signature: &'a [u8],
    pub expected_signer: Address,
    pub domain_separator: B256,
    pub env: &'a dyn ContractEnv,
}

pub type Strategy = fn(&Verification<'_>) -> bool;

pub const STRATEGIES: [(Scheme, Strategy); 5] = [
    (Scheme::RawEcdsa, raw_ecdsa),
    (Scheme::Eip191, eip191),
    (Scheme::Eip712, eip712),
    (Scheme::Erc1271, erc1271),
    (Scheme::Erc6492, erc6492),
];

/// Returns the first scheme under which `signature` is a valid signature by `expected_signer`.
pub fn matching_scheme(verification: &Verification<'_>) -> Option<Scheme> {
    STRATEGIES
        .iter()
        .find(|(_, strategy)| strategy(verification))
        .map(|(scheme, _)| *scheme)
}

pub fn verify(
    payload: &SignedPayload,
    signature: &[u8],
    expected_signer: Address,
    domain_separator: B256,
    env: &dyn ContractEnv,
) -> bool {
    let verification = Verification {
        payload,
        signature,
        expected_signer,
        domain_separator,
        env,
    };
    match matching_scheme(&verification) {
        Some(scheme) => {
            trace!(%expected_signer, ?scheme, "signature accepted");
            true
        }
        None => {
            debug!(%expected_signer, "signature rejected by every scheme");
            false
        }
    }
}

fn recovers_to(hash: B256, signature: &[u8], expected: Address) -> bool {
    signature.len() == ECDSA_SIGNATURE_LEN
        && recover_signer(hash, signature).is_ok_and(|signer| signer == expected)
}

pub fn raw_ecdsa(v: &Verification<'_>) -> bool {
    recovers_to(v.payload.hash(), v.signature, v.expected_signer)
}

pub fn eip191(v: &Verification<'_>) -> bool {
    recovers_to(
        eip191_hash_message(&v.payload.packed),
        v.signature,
        v.expected_signer,
    )
}

pub fn eip712(v: &Verification<'_>) -> bool {
    if v.domain_separator == *NO_EIP712_SUPPORT {
        return false;
    }
    let Some(struct_hash) = v.payload.struct_hash else {
        return false;
    };
    recovers_to(
        eip712_digest(v.domain_separator, struct_hash),
        v.signature,
        v.expected_signer,
    )
}

pub fn erc1271(v: &Verification<'_>) -> bool {
    if !v.env.has_code(v.expected_signer) {
        return false;
    }
    // A wrapped signature for a wallet that has since been deployed is checked against the wallet as is.
    let signature = match unwrap_erc6492(v.signature) {
        Some((_, _, inner)) => inner,
        None => Bytes::copy_from_slice(v.signature),
    };
    let call = is_valid_signature_call(v.payload.hash(), signature);
    v.env
        .static_call(v.expected_signer, call)
        .is_some_and(|output| is_magic_value(&output))
}

pub fn erc6492(v: &Verification<'_>) -> bool {
    if v.env.has_code(v.expected_signer) {
        return false;
    }
    let Some((factory, factory_calldata, inner)) = unwrap_erc6492(v.signature) else {
        return false;
    };
    let call = is_valid_signature_call(v.payload.hash(), inner);
    v.env
        .simulate_then_call(factory, factory_calldata, v.expected_signer, call)
        .is_some_and(|output| is_magic_value(&output))
}

/// Splits an ERC-6492 signature into `(factory, factory_calldata, signature)`.
pub fn unwrap_erc6492(signature: &[u8]) -> Option<(Address, Bytes, Bytes)> {
    let body = signature.strip_suffix(&ERC6492_MAGIC_SUFFIX)?;
    <(Address, Bytes, Bytes)>::abi_decode_params(body, false).ok()
}

/// Wraps `signature` for a wallet that `factory` will deploy when called with `factory_calldata`.
pub fn wrap_erc6492(factory: Address, factory_calldata: Bytes, signature: Bytes) -> Bytes {
    let mut wrapped = (factory, factory_calldata, signature).abi_encode_params();
    wrapped.extend_from_slice(&ERC6492_MAGIC_SUFFIX);
    wrapped.into()
}

fn is_valid_signature_call(hash: B256, signature: Bytes) -> Bytes {
    isValidSignatureCall { hash, signature }.abi_encode().into()
}

fn is_magic_value(output: &[u8]) -> bool {
    output.len() >= 4 && FixedBytes::<4>::from_slice(&output[..4]) == ERC1271_MAGIC_VALUE
}
