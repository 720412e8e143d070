//! secp256k1 primitives shared by the settlement layer and the broker.
//!
//! The exact implementations of these primitives is an implementation detail for this module only and dependents
//! should not care about the implementations. Everything else deals in 65-byte `r ‖ s ‖ v` signatures and
//! Ethereum addresses.

use std::fmt;

use alloy::primitives::{Address, B256, Bytes, eip191_hash_message, keccak256};
use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};

/// Length of a plain ECDSA signature in `r ‖ s ‖ v` form.
pub const ECDSA_SIGNATURE_LEN: usize = 65;

/// The secret key held by a participant or by the broker.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    /// Generates a random private key.
    pub fn new() -> SecretKey {
        let key = SigningKey::random(&mut rand::thread_rng());
        SecretKey {
            bytes: key.to_bytes().into(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }
        // Reject scalars outside the curve order up front, so `as_ecdsa` cannot fail later.
        SigningKey::from_bytes(&bytes.into())?;

        Ok(SecretKey { bytes })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_bytes(&bytes_vec)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    fn as_ecdsa(&self) -> SigningKey {
        // Validated on construction.
        SigningKey::from_bytes(&self.bytes.into()).expect("validated secret key")
    }

    pub fn address(&self) -> Address {
        address_of(self.as_ecdsa().verifying_key())
    }

    /// Signs a 32-byte digest as is, with no prefixing.
    pub fn sign_hash(&self, hash: B256) -> Bytes {
        let (signature, recovery_id) = self
            .as_ecdsa()
            .sign_prehash_recoverable(hash.as_slice())
            .expect("a 32 byte prehash is always signable");
        let mut out = Vec::with_capacity(ECDSA_SIGNATURE_LEN);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte() + 27);
        out.into()
    }

    /// Signs `message` with the EIP-191 personal message prefix.
    pub fn sign_message(&self, message: &[u8]) -> Bytes {
        self.sign_hash(eip191_hash_message(message))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl Default for SecretKey {
    fn default() -> Self {
        Self::new()
    }
}

pub fn address_of(key: &VerifyingKey) -> Address {
    // Remove the first byte before hashing - The first byte specifies the encoding tag.
    let encoded = key.to_encoded_point(false);
    Address::from_slice(&keccak256(&encoded.as_bytes()[1..])[12..32])
}

/// Recovers the address that produced `signature` over the prehashed `hash`.
///
/// Accepts recovery ids in both the `0/1` and `27/28` conventions.
pub fn recover_signer(hash: B256, signature: &[u8]) -> Result<Address> {
    if signature.len() != ECDSA_SIGNATURE_LEN {
        return Err(anyhow!(
            "invalid signature length {}, expected {ECDSA_SIGNATURE_LEN}",
            signature.len()
        ));
    }
    let ecdsa = EcdsaSignature::from_slice(&signature[..64])?;
    let v = signature[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::try_from(v).map_err(|_| anyhow!("invalid recovery id {v}"))?;
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &ecdsa, recovery_id)?;
    Ok(address_of(&key))
}

/// The EIP-712 digest `keccak256(0x1901 ‖ domain_separator ‖ struct_hash)`.
pub fn eip712_digest(domain_separator: B256, struct_hash: B256) -> B256 {
    let mut preimage = [0u8; 66];
    preimage[0] = 0x19;
    preimage[1] = 0x01;
    preimage[2..34].copy_from_slice(domain_separator.as_slice());
    preimage[34..66].copy_from_slice(struct_hash.as_slice());
    keccak256(preimage)
}
