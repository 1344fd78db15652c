//! Hash primitives used throughout the vault.
//!
//! All entity identities are built from three operations: SHA-256, double
//! SHA-256 (`sha256d`), and HASH160 (`RIPEMD-160(SHA-256(data))`). Key
//! derivation additionally uses HMAC-SHA-512.

use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for transaction ids (double SHA-256 of the wire serialization),
/// block header hashes, and merkle roots. Bytes are carried exactly as the
/// digest produces them; no byte-order flipping is performed anywhere.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Marks a genesis prevhash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-256 of the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256 of the input.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// HASH160: RIPEMD-160 of the SHA-256 of the input.
///
/// This is the identity hash for keychains, accounts, bins, and script
/// payees.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// HMAC-SHA-512 keyed hash, the core of BIP32 child derivation.
pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; 64] {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// First four bytes of HASH160(pubkey), interpreted big-endian.
///
/// BIP32 parent fingerprint.
pub fn fingerprint(pubkey: &[u8]) -> u32 {
    let h = hash160(pubkey);
    u32::from_be_bytes([h[0], h[1], h[2], h[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256d_is_double() {
        let once = sha256(b"strongbox");
        let twice = sha256(&once);
        assert_eq!(sha256d(b"strongbox").0, twice);
    }

    #[test]
    fn hash160_known_vector() {
        // HASH160 of the generator point's compressed encoding, a widely
        // published value.
        let pubkey =
            hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
                .unwrap();
        assert_eq!(
            hex::encode(hash160(&pubkey)),
            "751e76e8199196d454941c45d1b3a323f1433bd6"
        );
    }

    #[test]
    fn hmac_sha512_deterministic() {
        let a = hmac_sha512(b"Bitcoin seed", &[0u8; 32]);
        let b = hmac_sha512(b"Bitcoin seed", &[0u8; 32]);
        assert_eq!(a, b);
        let c = hmac_sha512(b"Bitcoin seed", &[1u8; 32]);
        assert_ne!(a, c);
    }

    #[test]
    fn hash256_display_roundtrip() {
        let h = Hash256([0xAB; 32]);
        assert_eq!(h.to_string(), "ab".repeat(32));
    }

    #[test]
    fn hash256_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn fingerprint_uses_leading_bytes() {
        let pubkey =
            hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
                .unwrap();
        // hash160 starts 75 1e 76 e8
        assert_eq!(fingerprint(&pubkey), 0x751e76e8);
    }
}
