//! Base58check address encoding and chain parameters.
//!
//! Addresses are `base58check(version_byte ‖ hash160)`: the P2PKH version
//! byte for single-signature scripts and the P2SH version byte for multisig
//! script hashes. Version bytes come from [`ChainParams`] so the vault
//! itself stays network-agnostic.

use crate::error::AddressError;
use crate::hash::sha256d;
use crate::script::{script_payee, Payee};

/// Network parameters consumed by the vault: address version bytes and
/// extended-key version words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainParams {
    /// Version byte for pay-to-pubkey-hash addresses.
    pub p2pkh_version: u8,
    /// Version byte for pay-to-script-hash addresses.
    pub p2sh_version: u8,
    /// Version word for private extended keys (xprv).
    pub extkey_prv_version: u32,
    /// Version word for public extended keys (xpub).
    pub extkey_pub_version: u32,
}

impl ChainParams {
    /// Bitcoin mainnet parameters.
    pub fn bitcoin() -> Self {
        Self {
            p2pkh_version: 0x00,
            p2sh_version: 0x05,
            extkey_prv_version: 0x0488_ADE4,
            extkey_pub_version: 0x0488_B21E,
        }
    }

    /// Bitcoin testnet parameters.
    pub fn testnet() -> Self {
        Self {
            p2pkh_version: 0x6f,
            p2sh_version: 0xc4,
            extkey_prv_version: 0x0435_8394,
            extkey_pub_version: 0x0435_87CF,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::bitcoin()
    }
}

/// Base58check encode `prefix ‖ payload`.
///
/// The checksum is the first four bytes of sha256d over the prefixed
/// payload.
pub fn base58check_encode(prefix: &[u8], payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(prefix.len() + payload.len() + 4);
    data.extend_from_slice(prefix);
    data.extend_from_slice(payload);
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum.as_bytes()[..4]);
    bs58::encode(data).into_string()
}

/// Decode a base58check string, validating the checksum. Returns the full
/// payload including any version prefix.
pub fn base58check_decode(encoded: &str) -> Result<Vec<u8>, AddressError> {
    let data = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
    if data.len() < 4 {
        return Err(AddressError::InvalidLength(data.len()));
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    let expected = sha256d(payload);
    if checksum != &expected.as_bytes()[..4] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

/// Render the address for a txout script: P2PKH and P2SH scripts map to
/// their base58check form, anything else has no address.
pub fn address_for_txoutscript(
    txoutscript: &[u8],
    params: &ChainParams,
) -> Result<String, AddressError> {
    match script_payee(txoutscript) {
        Payee::PubkeyHash(hash) => Ok(base58check_encode(&[params.p2pkh_version], &hash)),
        Payee::ScriptHash(hash) => Ok(base58check_encode(&[params.p2sh_version], &hash)),
        _ => Err(AddressError::Unaddressable),
    }
}

/// Build the txout script for a base58check address.
pub fn txoutscript_for_address(
    address: &str,
    params: &ChainParams,
) -> Result<Vec<u8>, AddressError> {
    let payload = base58check_decode(address)?;
    if payload.len() != 21 {
        return Err(AddressError::InvalidLength(payload.len()));
    }
    let version = payload[0];
    let hash: [u8; 20] = payload[1..].try_into().expect("checked length");
    if version == params.p2pkh_version {
        Ok(crate::script::p2pkh_txoutscript(&hash))
    } else if version == params.p2sh_version {
        Ok(crate::script::p2sh_txoutscript(&hash))
    } else {
        Err(AddressError::UnknownVersion(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash160;

    #[test]
    fn genesis_pubkey_address() {
        // HASH160 of the secp256k1 generator point, version 0x00. A stable,
        // widely published base58check vector.
        let pubkey =
            hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
                .unwrap();
        let addr = base58check_encode(&[0x00], &hash160(&pubkey));
        assert_eq!(addr, "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        // Flip the last character of a valid address.
        let err = base58check_decode("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMJ").unwrap_err();
        assert_eq!(err, AddressError::InvalidChecksum);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let hash = [0x42u8; 20];
        let addr = base58check_encode(&[0x05], &hash);
        let payload = base58check_decode(&addr).unwrap();
        assert_eq!(payload[0], 0x05);
        assert_eq!(&payload[1..], &hash);
    }

    #[test]
    fn address_script_roundtrip_p2pkh() {
        let params = ChainParams::bitcoin();
        let script = crate::script::p2pkh_txoutscript(&[7u8; 20]);
        let addr = address_for_txoutscript(&script, &params).unwrap();
        assert!(addr.starts_with('1'));
        assert_eq!(txoutscript_for_address(&addr, &params).unwrap(), script);
    }

    #[test]
    fn address_script_roundtrip_p2sh() {
        let params = ChainParams::bitcoin();
        let script = crate::script::p2sh_txoutscript(&[9u8; 20]);
        let addr = address_for_txoutscript(&script, &params).unwrap();
        assert!(addr.starts_with('3'));
        assert_eq!(txoutscript_for_address(&addr, &params).unwrap(), script);
    }

    #[test]
    fn unknown_script_has_no_address() {
        let err = address_for_txoutscript(&[0x6a, 0x01, 0xff], &ChainParams::bitcoin())
            .unwrap_err();
        assert_eq!(err, AddressError::Unaddressable);
    }

    #[test]
    fn wrong_version_byte_rejected() {
        let mainnet = ChainParams::bitcoin();
        let testnet = ChainParams::testnet();
        let script = crate::script::p2pkh_txoutscript(&[7u8; 20]);
        let addr = address_for_txoutscript(&script, &testnet).unwrap();
        let err = txoutscript_for_address(&addr, &mainnet).unwrap_err();
        assert!(matches!(err, AddressError::UnknownVersion(_)));
    }
}
