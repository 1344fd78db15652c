//! Export/import bundle codec.
//!
//! Bundles are self-describing byte streams: magic, a kind tag, then a
//! bincode-encoded record tree. Every record carries its class version
//! (currently 1) so old bundles remain readable across format revisions.
//! Secrets travel only in ciphertext+salt form, or not at all.

use serde::{Deserialize, Serialize};

use strongbox_core::hash::Hash256;

use crate::error::VaultError;
use crate::model::KeychainRecord;

/// Bundle file magic.
pub const BUNDLE_MAGIC: [u8; 4] = *b"SBXP";

/// Class version written for every exported record.
pub const CLASS_VERSION: u32 = 1;

/// What a bundle contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BundleKind {
    Keychain,
    AccountBin,
    Account,
    Tx,
}

impl BundleKind {
    fn tag(self) -> u8 {
        match self {
            BundleKind::Keychain => 1,
            BundleKind::AccountBin => 2,
            BundleKind::Account => 3,
            BundleKind::Tx => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(BundleKind::Keychain),
            2 => Some(BundleKind::AccountBin),
            3 => Some(BundleKind::Account),
            4 => Some(BundleKind::Tx),
            _ => None,
        }
    }
}

/// A keychain record as exported: public material plus encrypted secrets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExportedKeychain {
    pub class_version: u32,
    pub name: String,
    pub hash: [u8; 20],
    pub depth: u8,
    pub parent_fp: u32,
    pub child_num: u32,
    pub pubkey: Vec<u8>,
    pub chain_code_ciphertext: Vec<u8>,
    pub chain_code_salt: Vec<u8>,
    pub privkey_ciphertext: Vec<u8>,
    pub privkey_salt: Vec<u8>,
}

impl ExportedKeychain {
    /// Capture a stored keychain, optionally stripping private material.
    pub fn from_record(record: &KeychainRecord, export_privkeys: bool) -> Self {
        Self {
            class_version: CLASS_VERSION,
            name: record.name.clone(),
            hash: record.hash,
            depth: record.depth,
            parent_fp: record.parent_fp,
            child_num: record.child_num,
            pubkey: record.pubkey.clone(),
            chain_code_ciphertext: record.chain_code_ciphertext.clone(),
            chain_code_salt: record.chain_code_salt.clone(),
            privkey_ciphertext: if export_privkeys {
                record.privkey_ciphertext.clone()
            } else {
                Vec::new()
            },
            privkey_salt: if export_privkeys {
                record.privkey_salt.clone()
            } else {
                Vec::new()
            },
        }
    }

    /// Rebuild a storable record. Imported keychains from bin bundles are
    /// marked hidden by the caller.
    pub fn into_record(self) -> KeychainRecord {
        KeychainRecord {
            id: 0,
            name: self.name,
            depth: self.depth,
            parent_fp: self.parent_fp,
            child_num: self.child_num,
            pubkey: self.pubkey,
            chain_code_ciphertext: self.chain_code_ciphertext,
            chain_code_salt: self.chain_code_salt,
            privkey_ciphertext: self.privkey_ciphertext,
            privkey_salt: self.privkey_salt,
            parent: None,
            derivation_path: Vec::new(),
            hash: self.hash,
            hidden: false,
        }
    }
}

/// An account bin as exported.
///
/// Bins inside an account bundle carry no keychains (they re-derive from
/// the account); standalone bin bundles carry their derived child
/// keychains with secrets limited to ciphertext form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExportedBin {
    pub class_version: u32,
    pub name: String,
    pub index: u32,
    pub next_script_index: u32,
    pub minsigs: u32,
    /// Lookahead size the importing side rebuilds past the issued
    /// scripts.
    pub unused_pool_size: u32,
    pub keychains: Vec<ExportedKeychain>,
}

/// An account as exported: metadata, keychains, bins.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExportedAccount {
    pub class_version: u32,
    pub name: String,
    pub minsigs: u32,
    pub keychains: Vec<ExportedKeychain>,
    pub unused_pool_size: u32,
    pub time_created: u32,
    pub bins: Vec<ExportedBin>,
}

/// A transaction input as exported.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExportedTxIn {
    pub class_version: u32,
    pub outhash: Hash256,
    pub outindex: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output as exported, with its user-facing labels.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExportedTxOut {
    pub class_version: u32,
    pub value: u64,
    pub script: Vec<u8>,
    pub sending_label: String,
    pub receiving_label: String,
}

/// A transaction as exported.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ExportedTx {
    pub class_version: u32,
    pub version: u32,
    pub txins: Vec<ExportedTxIn>,
    pub txouts: Vec<ExportedTxOut>,
    pub locktime: u32,
    pub timestamp: u32,
}

/// Frame a record tree into a bundle byte stream.
pub fn write_bundle<T: bincode::Encode>(kind: BundleKind, payload: &T) -> Result<Vec<u8>, VaultError> {
    let mut out = Vec::new();
    out.extend_from_slice(&BUNDLE_MAGIC);
    out.push(kind.tag());
    let encoded = bincode::encode_to_vec(payload, bincode::config::standard())
        .map_err(|e| VaultError::InvalidBundle(e.to_string()))?;
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Unframe a bundle, checking magic and kind.
pub fn read_bundle<T: bincode::Decode<()>>(
    bytes: &[u8],
    expected: BundleKind,
) -> Result<T, VaultError> {
    if bytes.len() < 5 {
        return Err(VaultError::InvalidBundle("bundle too short".into()));
    }
    if bytes[..4] != BUNDLE_MAGIC {
        return Err(VaultError::InvalidBundle("bad magic".into()));
    }
    let kind = BundleKind::from_tag(bytes[4])
        .ok_or_else(|| VaultError::InvalidBundle(format!("unknown bundle kind {}", bytes[4])))?;
    if kind != expected {
        return Err(VaultError::InvalidBundle(format!(
            "expected {expected:?} bundle, found {kind:?}"
        )));
    }
    let (payload, _len) =
        bincode::decode_from_slice(&bytes[5..], bincode::config::standard())
            .map_err(|e| VaultError::InvalidBundle(e.to_string()))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exported_keychain(name: &str) -> ExportedKeychain {
        ExportedKeychain {
            class_version: CLASS_VERSION,
            name: name.into(),
            hash: [0x11; 20],
            depth: 1,
            parent_fp: 0xdeadbeef,
            child_num: 2,
            pubkey: vec![0x02; 33],
            chain_code_ciphertext: vec![0xCC; 48],
            chain_code_salt: vec![0x5A; 16],
            privkey_ciphertext: Vec::new(),
            privkey_salt: Vec::new(),
        }
    }

    #[test]
    fn bundle_roundtrip() {
        let account = ExportedAccount {
            class_version: CLASS_VERSION,
            name: "savings".into(),
            minsigs: 2,
            keychains: vec![exported_keychain("k1"), exported_keychain("k2")],
            unused_pool_size: 25,
            time_created: 1_400_000_000,
            bins: vec![ExportedBin {
                class_version: CLASS_VERSION,
                name: "@change".into(),
                index: 1,
                next_script_index: 4,
                minsigs: 2,
                unused_pool_size: 25,
                keychains: Vec::new(),
            }],
        };
        let bytes = write_bundle(BundleKind::Account, &account).unwrap();
        assert_eq!(&bytes[..4], &BUNDLE_MAGIC);
        let decoded: ExportedAccount = read_bundle(&bytes, BundleKind::Account).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn kind_mismatch_rejected() {
        let kc = exported_keychain("k");
        let bytes = write_bundle(BundleKind::Keychain, &kc).unwrap();
        let err = read_bundle::<ExportedKeychain>(&bytes, BundleKind::Account).unwrap_err();
        assert!(matches!(err, VaultError::InvalidBundle(_)));
    }

    #[test]
    fn bad_magic_rejected() {
        let kc = exported_keychain("k");
        let mut bytes = write_bundle(BundleKind::Keychain, &kc).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            read_bundle::<ExportedKeychain>(&bytes, BundleKind::Keychain),
            Err(VaultError::InvalidBundle(_))
        ));
    }

    #[test]
    fn truncated_bundle_rejected() {
        assert!(matches!(
            read_bundle::<ExportedKeychain>(&BUNDLE_MAGIC, BundleKind::Keychain),
            Err(VaultError::InvalidBundle(_))
        ));
    }

    #[test]
    fn privkey_stripping() {
        let mut record = exported_keychain("k").into_record();
        record.privkey_ciphertext = vec![0xEE; 48];
        record.privkey_salt = vec![0x5B; 16];

        let with = ExportedKeychain::from_record(&record, true);
        assert!(!with.privkey_ciphertext.is_empty());
        let without = ExportedKeychain::from_record(&record, false);
        assert!(without.privkey_ciphertext.is_empty());
        assert!(without.privkey_salt.is_empty());
        // Public identity survives either way.
        assert_eq!(with.hash, without.hash);
    }
}
