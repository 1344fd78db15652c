//! Keychain entity operations: root creation, extended-key import/export,
//! and encryption of secrets at rest.
//!
//! Each secret (chain code, private key) is stored as a ciphertext+salt
//! pair. An empty salt means no lock key was set and the bytes are stored
//! as-is. With a lock key, AES-256-CBC encrypts under a PBKDF2-stretched
//! key; decrypted plaintext lives in [`Zeroizing`] buffers scoped to the
//! operation that needed it and is verified against the keychain's public
//! identity before use.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use strongbox_core::crypto;
use strongbox_core::hash::hash160;
use strongbox_core::hd::HdKeychain;

use crate::error::VaultError;
use crate::model::KeychainRecord;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// PBKDF2-HMAC-SHA256 rounds for lock-key stretching.
const KDF_ROUNDS: u32 = 16_384;

/// Salt length for generated salts.
const SALT_LEN: usize = 16;

/// Stretch a lock key into a 256-bit cipher key: PBKDF2(salt ‖ lock_key).
fn stretch_key(lock_key: &[u8], salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(lock_key, salt, KDF_ROUNDS, key.as_mut());
    key
}

/// Derive the CBC initialization vector from the salt and a per-secret
/// domain tag, so the two secrets of a keychain never share an IV.
fn derive_iv(tag: &[u8], salt: &[u8]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(salt);
    let digest = hasher.finalize();
    digest[..16].try_into().expect("sized slice")
}

/// Encrypt a secret under a lock key. Returns the ciphertext; the caller
/// stores it next to the salt.
fn encrypt_secret(lock_key: &[u8], salt: &[u8], tag: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let key = stretch_key(lock_key, salt);
    let iv = derive_iv(tag, salt);
    Aes256CbcEnc::new(key.as_ref().into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt a secret. A padding failure means the lock key is wrong.
fn decrypt_secret(
    lock_key: &[u8],
    salt: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
    keychain_name: &str,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let key = stretch_key(lock_key, salt);
    let iv = derive_iv(tag, salt);
    let plaintext = Aes256CbcDec::new(key.as_ref().into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::BadLockKey(keychain_name.to_string()))?;
    Ok(Zeroizing::new(plaintext))
}

/// Domain tags separating the two secrets of one keychain.
const TAG_CHAIN_CODE: &[u8] = b"strongbox/chain-code";
const TAG_PRIVKEY: &[u8] = b"strongbox/privkey";

/// A random salt for freshly encrypted secrets.
fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Names starting with `@` are reserved for internal bins.
pub fn validate_name(name: &str) -> Result<(), VaultError> {
    if name.is_empty() || name.starts_with('@') {
        return Err(VaultError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl KeychainRecord {
    /// Create a root keychain from entropy.
    ///
    /// With a lock key, the private key and chain code are encrypted
    /// separately before they ever reach storage; the supplied salt (or a
    /// random one) is recorded next to each ciphertext.
    pub fn new_root(
        name: &str,
        entropy: &[u8],
        lock_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<Self, VaultError> {
        validate_name(name)?;
        let hd = HdKeychain::from_entropy(entropy)?;
        Self::from_hd(name, &hd, lock_key, salt)
    }

    /// Create a keychain from a parsed BIP32 extended key. Public extended
    /// keys produce watch-only keychains.
    pub fn from_extkey(
        name: &str,
        extkey: &[u8],
        lock_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<Self, VaultError> {
        validate_name(name)?;
        let (hd, _version) = HdKeychain::parse_extkey(extkey)?;
        Self::from_hd(name, &hd, lock_key, salt)
    }

    fn from_hd(
        name: &str,
        hd: &HdKeychain,
        lock_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<Self, VaultError> {
        let (chain_code_ciphertext, chain_code_salt) = match lock_key {
            Some(key) => {
                let salt = salt.map(<[u8]>::to_vec).unwrap_or_else(random_salt);
                (
                    encrypt_secret(key, &salt, TAG_CHAIN_CODE, hd.chain_code()),
                    salt,
                )
            }
            None => (hd.chain_code().to_vec(), Vec::new()),
        };
        let (privkey_ciphertext, privkey_salt) = match hd.privkey() {
            Some(privkey) => match lock_key {
                Some(key) => {
                    let salt = salt.map(<[u8]>::to_vec).unwrap_or_else(random_salt);
                    (encrypt_secret(key, &salt, TAG_PRIVKEY, privkey), salt)
                }
                None => (privkey.to_vec(), Vec::new()),
            },
            None => (Vec::new(), Vec::new()),
        };
        Ok(Self {
            id: 0,
            name: name.to_string(),
            depth: hd.depth(),
            parent_fp: hd.parent_fp(),
            child_num: hd.child_num(),
            pubkey: hd.pubkey().to_vec(),
            chain_code_ciphertext,
            chain_code_salt,
            privkey_ciphertext,
            privkey_salt,
            parent: None,
            derivation_path: Vec::new(),
            hash: hd.full_hash(),
            hidden: false,
        })
    }

    /// Recover the plaintext chain code.
    ///
    /// Unencrypted chain codes need no key. Encrypted ones require the
    /// unlock key; the result is verified against the keychain hash so a
    /// wrong key surfaces as `BadLockKey` instead of corrupt derivations.
    pub fn chain_code_plain(
        &self,
        unlock_key: Option<&[u8]>,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if !self.is_chain_code_encrypted() {
            return Ok(Zeroizing::new(self.chain_code_ciphertext.clone()));
        }
        let key = unlock_key.ok_or_else(|| VaultError::Locked {
            keychain: self.name.clone(),
            secret: "chain code",
        })?;
        let plaintext = decrypt_secret(
            key,
            &self.chain_code_salt,
            TAG_CHAIN_CODE,
            &self.chain_code_ciphertext,
            &self.name,
        )?;
        let mut preimage = Vec::with_capacity(self.pubkey.len() + plaintext.len());
        preimage.extend_from_slice(&self.pubkey);
        preimage.extend_from_slice(&plaintext);
        if hash160(&preimage) != self.hash {
            return Err(VaultError::BadLockKey(self.name.clone()));
        }
        Ok(plaintext)
    }

    /// Recover the plaintext private key, verified against the stored
    /// public key.
    pub fn privkey_plain(
        &self,
        unlock_key: Option<&[u8]>,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if !self.is_private() {
            return Err(strongbox_core::error::KeychainError::NotPrivate.into());
        }
        if !self.is_privkey_encrypted() {
            return Ok(Zeroizing::new(self.privkey_ciphertext.clone()));
        }
        let key = unlock_key.ok_or_else(|| VaultError::Locked {
            keychain: self.name.clone(),
            secret: "private key",
        })?;
        let plaintext = decrypt_secret(
            key,
            &self.privkey_salt,
            TAG_PRIVKEY,
            &self.privkey_ciphertext,
            &self.name,
        )?;
        let derived = crypto::pubkey_for_privkey(&plaintext)
            .map_err(|_| VaultError::BadLockKey(self.name.clone()))?;
        if derived.as_slice() != self.pubkey.as_slice() {
            return Err(VaultError::BadLockKey(self.name.clone()));
        }
        Ok(plaintext)
    }

    /// Reassemble the HD node, private when the caller can supply the
    /// private key.
    pub fn hd_keychain(&self, unlock_key: Option<&[u8]>) -> Result<HdKeychain, VaultError> {
        let chain_code = self.chain_code_plain(unlock_key)?;
        if self.is_private() {
            if let Ok(privkey) = self.privkey_plain(unlock_key) {
                return Ok(HdKeychain::from_private_parts(
                    &privkey,
                    &chain_code,
                    self.depth,
                    self.parent_fp,
                    self.child_num,
                )?);
            }
        }
        Ok(HdKeychain::from_public_parts(
            &self.pubkey,
            &chain_code,
            self.depth,
            self.parent_fp,
            self.child_num,
        )?)
    }

    /// The public HD node; never needs the private key.
    pub fn hd_public(&self, unlock_key: Option<&[u8]>) -> Result<HdKeychain, VaultError> {
        let chain_code = self.chain_code_plain(unlock_key)?;
        Ok(HdKeychain::from_public_parts(
            &self.pubkey,
            &chain_code,
            self.depth,
            self.parent_fp,
            self.child_num,
        )?)
    }

    /// Serialize the BIP32 extended key.
    pub fn extkey(
        &self,
        get_private: bool,
        unlock_key: Option<&[u8]>,
        version: u32,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let hd = if get_private {
            self.hd_keychain(unlock_key)?
        } else {
            self.hd_public(unlock_key)?
        };
        Ok(hd.extkey(version, get_private)?)
    }

    /// Re-encrypt the private key under a new lock key.
    pub fn set_privkey_lock_key(
        &mut self,
        old_key: Option<&[u8]>,
        new_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<(), VaultError> {
        let plaintext = self.privkey_plain(old_key)?;
        match new_key {
            Some(key) => {
                let salt = salt.map(<[u8]>::to_vec).unwrap_or_else(random_salt);
                self.privkey_ciphertext = encrypt_secret(key, &salt, TAG_PRIVKEY, &plaintext);
                self.privkey_salt = salt;
            }
            None => {
                self.privkey_ciphertext = plaintext.to_vec();
                self.privkey_salt = Vec::new();
            }
        }
        Ok(())
    }

    /// Re-encrypt the chain code under a new lock key.
    pub fn set_chain_code_lock_key(
        &mut self,
        old_key: Option<&[u8]>,
        new_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<(), VaultError> {
        let plaintext = self.chain_code_plain(old_key)?;
        match new_key {
            Some(key) => {
                let salt = salt.map(<[u8]>::to_vec).unwrap_or_else(random_salt);
                self.chain_code_ciphertext =
                    encrypt_secret(key, &salt, TAG_CHAIN_CODE, &plaintext);
                self.chain_code_salt = salt;
            }
            None => {
                self.chain_code_ciphertext = plaintext.to_vec();
                self.chain_code_salt = Vec::new();
            }
        }
        Ok(())
    }

    /// Strip private material, leaving a watch-only keychain.
    pub fn clear_privkey(&mut self) {
        self.privkey_ciphertext = Vec::new();
        self.privkey_salt = Vec::new();
    }

    /// Copy encrypted private material from another rendering of the same
    /// keychain.
    pub fn import_privkey(&mut self, source: &KeychainRecord) {
        self.privkey_ciphertext = source.privkey_ciphertext.clone();
        self.privkey_salt = source.privkey_salt.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTROPY: [u8; 32] = [0u8; 32];

    #[test]
    fn name_validation() {
        assert!(validate_name("wallet").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("@change").is_err());
    }

    #[test]
    fn unencrypted_root_stores_plaintext() {
        let kc = KeychainRecord::new_root("k", &ENTROPY, None, None).unwrap();
        assert!(kc.is_private());
        assert!(!kc.is_privkey_encrypted());
        assert!(!kc.is_chain_code_encrypted());
        // No key needed.
        let cc = kc.chain_code_plain(None).unwrap();
        assert_eq!(cc.len(), 32);
        let privkey = kc.privkey_plain(None).unwrap();
        assert_eq!(
            crypto::pubkey_for_privkey(&privkey).unwrap().to_vec(),
            kc.pubkey
        );
    }

    #[test]
    fn encrypted_root_hides_secrets() {
        let plain = KeychainRecord::new_root("k", &ENTROPY, None, None).unwrap();
        let locked =
            KeychainRecord::new_root("k", &ENTROPY, Some(b"passphrase"), None).unwrap();

        // Same identity, different at-rest bytes.
        assert_eq!(plain.hash, locked.hash);
        assert!(locked.is_privkey_encrypted());
        assert!(locked.is_chain_code_encrypted());
        assert_ne!(locked.privkey_ciphertext, plain.privkey_ciphertext);
        assert_ne!(locked.chain_code_ciphertext, plain.chain_code_ciphertext);

        // Unlock recovers the same plaintext.
        let cc = locked.chain_code_plain(Some(b"passphrase")).unwrap();
        assert_eq!(cc.as_slice(), plain.chain_code_ciphertext.as_slice());
        let privkey = locked.privkey_plain(Some(b"passphrase")).unwrap();
        assert_eq!(privkey.as_slice(), plain.privkey_ciphertext.as_slice());
    }

    #[test]
    fn locked_without_key_fails() {
        let locked = KeychainRecord::new_root("k", &ENTROPY, Some(b"pass"), None).unwrap();
        assert!(matches!(
            locked.chain_code_plain(None),
            Err(VaultError::Locked { .. })
        ));
        assert!(matches!(
            locked.privkey_plain(None),
            Err(VaultError::Locked { .. })
        ));
    }

    #[test]
    fn wrong_key_is_bad_lock_key() {
        let locked = KeychainRecord::new_root("k", &ENTROPY, Some(b"pass"), None).unwrap();
        // Wrong keys either fail padding or fail the identity check; both
        // must surface as BadLockKey.
        assert!(matches!(
            locked.chain_code_plain(Some(b"wrong")),
            Err(VaultError::BadLockKey(_))
        ));
        assert!(matches!(
            locked.privkey_plain(Some(b"wrong")),
            Err(VaultError::BadLockKey(_))
        ));
    }

    #[test]
    fn extkey_roundtrip_preserves_identity() {
        let kc = KeychainRecord::new_root("k", &ENTROPY, None, None).unwrap();
        let xprv = kc.extkey(true, None, 0x0488_ADE4).unwrap();
        let imported = KeychainRecord::from_extkey("k2", &xprv, None, None).unwrap();
        assert_eq!(imported.hash, kc.hash);
        assert_eq!(imported.pubkey, kc.pubkey);
        assert_eq!(imported.depth, kc.depth);
        assert_eq!(imported.parent_fp, kc.parent_fp);
        assert_eq!(imported.child_num, kc.child_num);
        assert!(imported.is_private());

        let xpub = kc.extkey(false, None, 0x0488_B21E).unwrap();
        let watch = KeychainRecord::from_extkey("k3", &xpub, None, None).unwrap();
        assert_eq!(watch.hash, kc.hash);
        assert!(!watch.is_private());
    }

    #[test]
    fn public_keychain_refuses_private_export() {
        let kc = KeychainRecord::new_root("k", &ENTROPY, None, None).unwrap();
        let xpub = kc.extkey(false, None, 0x0488_B21E).unwrap();
        let watch = KeychainRecord::from_extkey("w", &xpub, None, None).unwrap();
        assert!(watch.extkey(true, None, 0x0488_ADE4).is_err());
    }

    #[test]
    fn rekeying_secrets() {
        let mut kc = KeychainRecord::new_root("k", &ENTROPY, Some(b"old"), None).unwrap();
        let before = kc.privkey_plain(Some(b"old")).unwrap().to_vec();

        kc.set_privkey_lock_key(Some(b"old"), Some(b"new"), None).unwrap();
        kc.set_chain_code_lock_key(Some(b"old"), Some(b"new"), None).unwrap();
        assert!(matches!(
            kc.privkey_plain(Some(b"old")),
            Err(VaultError::BadLockKey(_))
        ));
        assert_eq!(kc.privkey_plain(Some(b"new")).unwrap().to_vec(), before);

        // Removing the lock key returns to plaintext storage.
        kc.set_privkey_lock_key(Some(b"new"), None, None).unwrap();
        assert!(!kc.is_privkey_encrypted());
        assert_eq!(kc.privkey_plain(None).unwrap().to_vec(), before);
    }

    #[test]
    fn clear_privkey_leaves_watch_only() {
        let mut kc = KeychainRecord::new_root("k", &ENTROPY, None, None).unwrap();
        kc.clear_privkey();
        assert!(!kc.is_private());
        assert!(kc.hd_public(None).is_ok());
    }

    #[test]
    fn hd_keychain_derives_signing_keys() {
        let kc = KeychainRecord::new_root("k", &ENTROPY, None, None).unwrap();
        let hd = kc.hd_keychain(None).unwrap();
        assert!(hd.is_private());
        let pubkey = hd.signing_pubkey(&[2], 0).unwrap();
        let privkey = hd.signing_privkey(&[2], 0).unwrap();
        assert_eq!(
            crypto::pubkey_for_privkey(privkey.as_ref()).unwrap(),
            pubkey
        );
    }
}
