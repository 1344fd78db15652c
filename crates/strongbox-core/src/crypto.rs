//! secp256k1 ECDSA adapter.
//!
//! Thin, deterministic wrapper over the `secp256k1` crate: compressed
//! public keys, DER signatures, and the additive tweaks BIP32 derivation
//! needs. All functions are stateless; the verification-capable context is
//! created per call, which keeps the adapter freely shareable.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Scalar, Secp256k1, SecretKey};

use crate::error::KeychainError;

/// Compressed public key length in bytes.
pub const PUBKEY_LEN: usize = 33;

/// Derive the compressed public key for a 32-byte private key.
pub fn pubkey_for_privkey(privkey: &[u8]) -> Result<[u8; PUBKEY_LEN], KeychainError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(privkey)
        .map_err(|e| KeychainError::InvalidKey(e.to_string()))?;
    Ok(PublicKey::from_secret_key(&secp, &sk).serialize())
}

/// Check that a byte string is a valid compressed public key.
pub fn validate_pubkey(pubkey: &[u8]) -> Result<(), KeychainError> {
    PublicKey::from_slice(pubkey)
        .map(|_| ())
        .map_err(|e| KeychainError::InvalidKey(e.to_string()))
}

/// ECDSA-sign a 32-byte digest, returning the DER-encoded signature.
pub fn sign_der(privkey: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>, KeychainError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(privkey)
        .map_err(|e| KeychainError::InvalidKey(e.to_string()))?;
    let msg = Message::from_digest_slice(digest)
        .map_err(|e| KeychainError::InvalidKey(e.to_string()))?;
    Ok(secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec())
}

/// Verify a DER-encoded signature over a 32-byte digest.
pub fn verify_der(pubkey: &[u8], digest: &[u8; 32], sig_der: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let (Ok(pk), Ok(msg), Ok(sig)) = (
        PublicKey::from_slice(pubkey),
        Message::from_digest_slice(digest),
        Signature::from_der(sig_der),
    ) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Compute `(privkey + tweak) mod n` for BIP32 private child derivation.
///
/// Fails with `InvalidDerivation` when the tweak is out of range or the sum
/// is zero; the caller retries with the next child index.
pub fn privkey_add_tweak(
    privkey: &[u8],
    tweak: &[u8; 32],
    index: u32,
) -> Result<[u8; 32], KeychainError> {
    let sk = SecretKey::from_slice(privkey)
        .map_err(|e| KeychainError::InvalidKey(e.to_string()))?;
    let scalar = Scalar::from_be_bytes(*tweak)
        .map_err(|_| KeychainError::InvalidDerivation(index))?;
    let child = sk
        .add_tweak(&scalar)
        .map_err(|_| KeychainError::InvalidDerivation(index))?;
    Ok(child.secret_bytes())
}

/// Compute `tweak·G + pubkey` for BIP32 public child derivation.
///
/// Fails with `InvalidDerivation` when the tweak is out of range or the sum
/// is the point at infinity.
pub fn pubkey_add_tweak(
    pubkey: &[u8],
    tweak: &[u8; 32],
    index: u32,
) -> Result<[u8; PUBKEY_LEN], KeychainError> {
    let secp = Secp256k1::new();
    let pk = PublicKey::from_slice(pubkey)
        .map_err(|e| KeychainError::InvalidKey(e.to_string()))?;
    let scalar = Scalar::from_be_bytes(*tweak)
        .map_err(|_| KeychainError::InvalidDerivation(index))?;
    let child = pk
        .add_exp_tweak(&secp, &scalar)
        .map_err(|_| KeychainError::InvalidDerivation(index))?;
    Ok(child.serialize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIV: [u8; 32] = [7u8; 32];

    #[test]
    fn pubkey_is_compressed() {
        let pk = pubkey_for_privkey(&PRIV).unwrap();
        assert_eq!(pk.len(), 33);
        assert!(pk[0] == 0x02 || pk[0] == 0x03);
    }

    #[test]
    fn zero_privkey_rejected() {
        assert!(pubkey_for_privkey(&[0u8; 32]).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let digest = [0x42u8; 32];
        let sig = sign_der(&PRIV, &digest).unwrap();
        let pk = pubkey_for_privkey(&PRIV).unwrap();
        assert!(verify_der(&pk, &digest, &sig));
        assert!(!verify_der(&pk, &[0x43u8; 32], &sig));
    }

    #[test]
    fn tweak_commutes_with_pubkey_derivation() {
        // (priv + t)·G == t·G + priv·G, the identity BIP32 relies on.
        let tweak = [3u8; 32];
        let child_priv = privkey_add_tweak(&PRIV, &tweak, 0).unwrap();
        let from_priv = pubkey_for_privkey(&child_priv).unwrap();
        let parent_pub = pubkey_for_privkey(&PRIV).unwrap();
        let from_pub = pubkey_add_tweak(&parent_pub, &tweak, 0).unwrap();
        assert_eq!(from_priv, from_pub);
    }

    #[test]
    fn out_of_range_tweak_fails_derivation() {
        // The curve order is below 2^256 - 1, so an all-ones tweak is out
        // of range.
        let tweak = [0xFFu8; 32];
        let err = privkey_add_tweak(&PRIV, &tweak, 9).unwrap_err();
        assert_eq!(err, KeychainError::InvalidDerivation(9));
        let parent_pub = pubkey_for_privkey(&PRIV).unwrap();
        let err = pubkey_add_tweak(&parent_pub, &tweak, 9).unwrap_err();
        assert_eq!(err, KeychainError::InvalidDerivation(9));
    }
}
