//! BIP32 hierarchical deterministic keychains.
//!
//! An [`HdKeychain`] is one node of the derivation tree: chain code plus
//! either a private key (with its public key) or a public key alone.
//! Roots come from entropy via HMAC-SHA-512 with the key `"Bitcoin seed"`;
//! children come from additive secp256k1 tweaks. Private material lives in
//! [`Zeroizing`] buffers so it is wiped when a keychain is dropped.

use zeroize::Zeroizing;

use crate::constants::HARDENED;
use crate::crypto;
use crate::error::KeychainError;
use crate::hash::{fingerprint, hash160, hmac_sha512};

/// Length of the raw BIP32 extended-key serialization.
pub const EXTKEY_LEN: usize = 78;

/// One node of a BIP32 derivation tree.
#[derive(Clone)]
pub struct HdKeychain {
    depth: u8,
    parent_fp: u32,
    child_num: u32,
    chain_code: Zeroizing<[u8; 32]>,
    pubkey: [u8; 33],
    privkey: Option<Zeroizing<[u8; 32]>>,
}

impl HdKeychain {
    /// Create a root keychain from entropy.
    ///
    /// HMAC-SHA-512(key=`"Bitcoin seed"`, msg=entropy) yields
    /// `privkey ‖ chain_code`. Entropy must be 16–64 bytes.
    pub fn from_entropy(entropy: &[u8]) -> Result<Self, KeychainError> {
        if entropy.len() < 16 || entropy.len() > 64 {
            return Err(KeychainError::InvalidEntropy(entropy.len()));
        }
        let digest = hmac_sha512(b"Bitcoin seed", entropy);
        let mut privkey = Zeroizing::new([0u8; 32]);
        privkey.copy_from_slice(&digest[..32]);
        let mut chain_code = Zeroizing::new([0u8; 32]);
        chain_code.copy_from_slice(&digest[32..]);
        let pubkey = crypto::pubkey_for_privkey(privkey.as_ref())?;
        Ok(Self {
            depth: 0,
            parent_fp: 0,
            child_num: 0,
            chain_code,
            pubkey,
            privkey: Some(privkey),
        })
    }

    /// Reassemble a private keychain from stored parts.
    pub fn from_private_parts(
        privkey: &[u8],
        chain_code: &[u8],
        depth: u8,
        parent_fp: u32,
        child_num: u32,
    ) -> Result<Self, KeychainError> {
        if privkey.len() != 32 {
            return Err(KeychainError::InvalidKey("private key must be 32 bytes".into()));
        }
        if chain_code.len() != 32 {
            return Err(KeychainError::InvalidKey("chain code must be 32 bytes".into()));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(privkey);
        let mut cc = Zeroizing::new([0u8; 32]);
        cc.copy_from_slice(chain_code);
        let pubkey = crypto::pubkey_for_privkey(key.as_ref())?;
        Ok(Self {
            depth,
            parent_fp,
            child_num,
            chain_code: cc,
            pubkey,
            privkey: Some(key),
        })
    }

    /// Reassemble a public-only keychain from stored parts.
    pub fn from_public_parts(
        pubkey: &[u8],
        chain_code: &[u8],
        depth: u8,
        parent_fp: u32,
        child_num: u32,
    ) -> Result<Self, KeychainError> {
        if pubkey.len() != 33 {
            return Err(KeychainError::InvalidKey("public key must be 33 bytes".into()));
        }
        if chain_code.len() != 32 {
            return Err(KeychainError::InvalidKey("chain code must be 32 bytes".into()));
        }
        crypto::validate_pubkey(pubkey)?;
        let mut pk = [0u8; 33];
        pk.copy_from_slice(pubkey);
        let mut cc = Zeroizing::new([0u8; 32]);
        cc.copy_from_slice(chain_code);
        Ok(Self {
            depth,
            parent_fp,
            child_num,
            chain_code: cc,
            pubkey: pk,
            privkey: None,
        })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn parent_fp(&self) -> u32 {
        self.parent_fp
    }

    pub fn child_num(&self) -> u32 {
        self.child_num
    }

    pub fn pubkey(&self) -> &[u8; 33] {
        &self.pubkey
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// The private key, if this keychain carries one.
    pub fn privkey(&self) -> Option<&[u8; 32]> {
        self.privkey.as_deref()
    }

    pub fn is_private(&self) -> bool {
        self.privkey.is_some()
    }

    /// Fingerprint of this node's public key (becomes `parent_fp` of its
    /// children).
    pub fn fingerprint(&self) -> u32 {
        fingerprint(&self.pubkey)
    }

    /// Keychain identity hash: HASH160(pubkey ‖ chain_code).
    pub fn full_hash(&self) -> [u8; 20] {
        let mut preimage = Vec::with_capacity(33 + 32);
        preimage.extend_from_slice(&self.pubkey);
        preimage.extend_from_slice(self.chain_code.as_ref());
        hash160(&preimage)
    }

    /// Drop private material, leaving a watch-only keychain.
    pub fn public_only(&self) -> Self {
        Self {
            depth: self.depth,
            parent_fp: self.parent_fp,
            child_num: self.child_num,
            chain_code: self.chain_code.clone(),
            pubkey: self.pubkey,
            privkey: None,
        }
    }

    /// Derive child `i`, carrying private material forward when present.
    ///
    /// Hardened indices (bit 31 set) require a private parent. Fails with
    /// `InvalidDerivation` when the tweak falls outside the curve order;
    /// callers retry with the next index.
    pub fn child(&self, i: u32) -> Result<Self, KeychainError> {
        match &self.privkey {
            Some(privkey) => {
                let mut preimage = Vec::with_capacity(37);
                if i & HARDENED != 0 {
                    preimage.push(0x00);
                    preimage.extend_from_slice(privkey.as_ref());
                } else {
                    preimage.extend_from_slice(&self.pubkey);
                }
                preimage.extend_from_slice(&i.to_be_bytes());
                let digest = hmac_sha512(self.chain_code.as_ref(), &preimage);
                let tweak: [u8; 32] = digest[..32].try_into().expect("split of 64-byte digest");
                let child_priv = Zeroizing::new(crypto::privkey_add_tweak(
                    privkey.as_ref(),
                    &tweak,
                    i,
                )?);
                let pubkey = crypto::pubkey_for_privkey(child_priv.as_ref())?;
                let mut chain_code = Zeroizing::new([0u8; 32]);
                chain_code.copy_from_slice(&digest[32..]);
                Ok(Self {
                    depth: self.depth + 1,
                    parent_fp: self.fingerprint(),
                    child_num: i,
                    chain_code,
                    pubkey,
                    privkey: Some(child_priv),
                })
            }
            None => self.public_child(i),
        }
    }

    /// Derive child `i` through the public branch, regardless of whether
    /// this keychain holds private material.
    pub fn public_child(&self, i: u32) -> Result<Self, KeychainError> {
        if i & HARDENED != 0 {
            return Err(KeychainError::NotPrivate);
        }
        let mut preimage = Vec::with_capacity(37);
        preimage.extend_from_slice(&self.pubkey);
        preimage.extend_from_slice(&i.to_be_bytes());
        let digest = hmac_sha512(self.chain_code.as_ref(), &preimage);
        let tweak: [u8; 32] = digest[..32].try_into().expect("split of 64-byte digest");
        let pubkey = crypto::pubkey_add_tweak(&self.pubkey, &tweak, i)?;
        let mut chain_code = Zeroizing::new([0u8; 32]);
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            depth: self.depth + 1,
            parent_fp: self.fingerprint(),
            child_num: i,
            chain_code,
            pubkey,
            privkey: None,
        })
    }

    /// Walk a derivation path, private when possible.
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, KeychainError> {
        let mut node = self.clone();
        for &i in path {
            node = node.child(i)?;
        }
        Ok(node)
    }

    /// The public signing key at `path` then child `index`.
    pub fn signing_pubkey(&self, path: &[u32], index: u32) -> Result<[u8; 33], KeychainError> {
        let mut node = self.public_only();
        for &i in path {
            node = node.public_child(i)?;
        }
        Ok(*node.public_child(index)?.pubkey())
    }

    /// The private signing key at `path` then child `index`.
    ///
    /// Requires private material on this keychain.
    pub fn signing_privkey(
        &self,
        path: &[u32],
        index: u32,
    ) -> Result<Zeroizing<[u8; 32]>, KeychainError> {
        if !self.is_private() {
            return Err(KeychainError::NotPrivate);
        }
        let node = self.derive_path(path)?.child(index)?;
        let privkey = node.privkey.ok_or(KeychainError::NotPrivate)?;
        Ok(privkey)
    }

    /// Serialize the 78-byte BIP32 extended key.
    ///
    /// `version(4) ‖ depth(1) ‖ parent_fp(4) ‖ child_num(4) ‖ chain_code(32)
    /// ‖ key(33)` where key is `0x00 ‖ privkey` or the compressed pubkey.
    pub fn extkey(&self, version: u32, get_private: bool) -> Result<Zeroizing<Vec<u8>>, KeychainError> {
        let mut out = Zeroizing::new(Vec::with_capacity(EXTKEY_LEN));
        out.extend_from_slice(&version.to_be_bytes());
        out.push(self.depth);
        out.extend_from_slice(&self.parent_fp.to_be_bytes());
        out.extend_from_slice(&self.child_num.to_be_bytes());
        out.extend_from_slice(self.chain_code.as_ref());
        if get_private {
            let privkey = self.privkey.as_ref().ok_or(KeychainError::NotPrivate)?;
            out.push(0x00);
            out.extend_from_slice(privkey.as_ref());
        } else {
            out.extend_from_slice(&self.pubkey);
        }
        Ok(out)
    }

    /// Parse a 78-byte extended key. Returns the keychain and its version
    /// field; private form is detected by the `0x00` key prefix.
    pub fn parse_extkey(extkey: &[u8]) -> Result<(Self, u32), KeychainError> {
        if extkey.len() != EXTKEY_LEN {
            return Err(KeychainError::InvalidExtendedKey(format!(
                "length {} != {EXTKEY_LEN}",
                extkey.len()
            )));
        }
        let version = u32::from_be_bytes(extkey[0..4].try_into().expect("sized slice"));
        let depth = extkey[4];
        let parent_fp = u32::from_be_bytes(extkey[5..9].try_into().expect("sized slice"));
        let child_num = u32::from_be_bytes(extkey[9..13].try_into().expect("sized slice"));
        let chain_code = &extkey[13..45];
        let key = &extkey[45..78];
        let keychain = if key[0] == 0x00 {
            Self::from_private_parts(&key[1..], chain_code, depth, parent_fp, child_num)?
        } else {
            Self::from_public_parts(key, chain_code, depth, parent_fp, child_num)?
        };
        Ok((keychain, version))
    }
}

impl std::fmt::Debug for HdKeychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdKeychain")
            .field("depth", &self.depth)
            .field("child_num", &self.child_num)
            .field("pubkey", &hex::encode(self.pubkey))
            .field("private", &self.is_private())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::base58check_encode;

    // BIP32 test vector 1 extended-key version bytes.
    const XPRV: u32 = 0x0488_ADE4;
    const XPUB: u32 = 0x0488_B21E;

    fn vector1_master() -> HdKeychain {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        HdKeychain::from_entropy(&seed).unwrap()
    }

    fn b58(extkey: &[u8]) -> String {
        // Extended keys are conventionally rendered as base58check over the
        // whole 78 bytes with the version embedded, so no version prefix.
        base58check_encode(&[], extkey)
    }

    #[test]
    fn bip32_vector1_master_keys() {
        let m = vector1_master();
        assert_eq!(m.depth(), 0);
        assert_eq!(m.parent_fp(), 0);
        assert_eq!(m.child_num(), 0);
        assert_eq!(
            b58(&m.extkey(XPRV, true).unwrap()),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(
            b58(&m.extkey(XPUB, false).unwrap()),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
    }

    #[test]
    fn bip32_vector1_hardened_child() {
        let child = vector1_master().child(HARDENED).unwrap();
        assert_eq!(child.depth(), 1);
        assert_eq!(child.child_num(), HARDENED);
        assert_eq!(
            b58(&child.extkey(XPRV, true).unwrap()),
            "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7"
        );
    }

    #[test]
    fn public_and_private_children_agree() {
        let m = vector1_master();
        let priv_child = m.child(5).unwrap();
        let pub_child = m.public_only().public_child(5).unwrap();
        assert_eq!(priv_child.pubkey(), pub_child.pubkey());
        assert_eq!(priv_child.chain_code(), pub_child.chain_code());
        assert!(priv_child.is_private());
        assert!(!pub_child.is_private());
    }

    #[test]
    fn hardened_requires_private_parent() {
        let m = vector1_master().public_only();
        assert_eq!(m.child(HARDENED).unwrap_err(), KeychainError::NotPrivate);
    }

    #[test]
    fn signing_keys_match_derivation() {
        let m = vector1_master();
        let path = [2u32, 0];
        let by_walk = m.derive_path(&path).unwrap().child(7).unwrap();
        assert_eq!(m.signing_pubkey(&path, 7).unwrap(), *by_walk.pubkey());
        let privkey = m.signing_privkey(&path, 7).unwrap();
        assert_eq!(
            crypto::pubkey_for_privkey(privkey.as_ref()).unwrap(),
            *by_walk.pubkey()
        );
    }

    #[test]
    fn extkey_roundtrip_private_and_public() {
        let m = vector1_master().child(3).unwrap();
        let (parsed, version) =
            HdKeychain::parse_extkey(&m.extkey(XPRV, true).unwrap()).unwrap();
        assert_eq!(version, XPRV);
        assert!(parsed.is_private());
        assert_eq!(parsed.pubkey(), m.pubkey());
        assert_eq!(parsed.full_hash(), m.full_hash());
        assert_eq!(parsed.depth(), m.depth());
        assert_eq!(parsed.parent_fp(), m.parent_fp());
        assert_eq!(parsed.child_num(), m.child_num());

        let (parsed, version) =
            HdKeychain::parse_extkey(&m.extkey(XPUB, false).unwrap()).unwrap();
        assert_eq!(version, XPUB);
        assert!(!parsed.is_private());
        assert_eq!(parsed.pubkey(), m.pubkey());
    }

    #[test]
    fn parse_extkey_rejects_bad_length() {
        assert!(matches!(
            HdKeychain::parse_extkey(&[0u8; 77]),
            Err(KeychainError::InvalidExtendedKey(_))
        ));
    }

    #[test]
    fn entropy_length_bounds() {
        assert!(HdKeychain::from_entropy(&[0u8; 15]).is_err());
        assert!(HdKeychain::from_entropy(&[0u8; 16]).is_ok());
        assert!(HdKeychain::from_entropy(&[0u8; 64]).is_ok());
        assert!(HdKeychain::from_entropy(&[0u8; 65]).is_err());
    }

    #[test]
    fn full_hash_ignores_private_material() {
        let m = vector1_master();
        assert_eq!(m.full_hash(), m.public_only().full_hash());
    }
}
