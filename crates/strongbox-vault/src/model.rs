//! Persistent entity records.
//!
//! Every table is an arena of records keyed by a monotonically assigned id;
//! cross-references are ids resolved through the store, never owned
//! pointers. Records carry bincode derives for storage and serde derives
//! for diagnostics.

use serde::{Deserialize, Serialize};
use std::fmt;

use strongbox_core::hash::{hash160, Hash256};
use strongbox_core::tx::RawTx;

/// Monotonic store identity.
pub type Id = u64;

/// Oldest schema this build can migrate forward from.
pub const SCHEMA_BASE_VERSION: u32 = 4;
/// Schema written by this build.
pub const SCHEMA_VERSION: u32 = 5;

/// Reserved bin holding change scripts.
pub const CHANGE_BIN_NAME: &str = "@change";
/// Reserved bin issuing receive scripts.
pub const DEFAULT_BIN_NAME: &str = "@default";

/// Bin index 0 is reserved; 1 and 2 are the change and default bins.
pub const CHANGE_BIN_INDEX: u32 = 1;
pub const DEFAULT_BIN_INDEX: u32 = 2;
pub const FIRST_CUSTOM_BIN_INDEX: u32 = 3;

/// Singleton schema version row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VersionRecord {
    pub id: Id,
    pub version: u32,
}

/// A stored keychain: BIP32 node metadata plus secrets at rest.
///
/// `chain_code` and `privkey` are stored as ciphertext+salt pairs. An empty
/// salt means no lock key was set and the ciphertext bytes are the
/// plaintext. Plaintext forms of locked secrets exist only transiently
/// inside operations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct KeychainRecord {
    pub id: Id,
    pub name: String,
    pub depth: u8,
    pub parent_fp: u32,
    pub child_num: u32,
    pub pubkey: Vec<u8>,
    pub chain_code_ciphertext: Vec<u8>,
    pub chain_code_salt: Vec<u8>,
    pub privkey_ciphertext: Vec<u8>,
    pub privkey_salt: Vec<u8>,
    pub parent: Option<Id>,
    pub derivation_path: Vec<u32>,
    /// HASH160(pubkey ‖ chain_code plaintext).
    pub hash: [u8; 20],
    /// Hidden keychains back imported bins and stay out of listings.
    pub hidden: bool,
}

impl KeychainRecord {
    /// Whether the keychain holds private material (possibly encrypted).
    pub fn is_private(&self) -> bool {
        !self.privkey_ciphertext.is_empty()
    }

    /// Whether the private key is encrypted at rest.
    pub fn is_privkey_encrypted(&self) -> bool {
        !self.privkey_salt.is_empty()
    }

    /// Whether the chain code is encrypted at rest.
    pub fn is_chain_code_encrypted(&self) -> bool {
        !self.chain_code_salt.is_empty()
    }
}

/// A single derived key: the root keychain it came from, the path walked,
/// and the child index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct KeyRecord {
    pub id: Id,
    pub root_keychain: Id,
    pub derivation_path: Vec<u32>,
    pub index: u32,
    pub pubkey: Vec<u8>,
    /// Cached: whether the root keychain held private material when this
    /// key was derived.
    pub is_private: bool,
}

/// An account: a named keychain set with a signature quorum.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct AccountRecord {
    pub id: Id,
    pub name: String,
    pub minsigs: u32,
    pub unused_pool_size: u32,
    pub time_created: u32,
    /// HASH160(byte(minsigs) ‖ sorted keychain hashes).
    pub hash: [u8; 20],
}

/// A derivation branch under an account, issuing a contiguous script
/// sequence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct AccountBinRecord {
    pub id: Id,
    /// Absent on bins detached for export.
    pub account: Option<Id>,
    pub index: u32,
    pub name: String,
    pub script_count: u32,
    /// Index of the next script in the pool that will be issued.
    pub next_script_index: u32,
    pub minsigs: u32,
    /// Stored only for imported (detached) bins; bins attached to an
    /// account re-derive their branch keychains from the account's set.
    pub keychains: Vec<Id>,
    /// HASH160(byte(minsigs) ‖ sorted child-keychain hashes).
    pub hash: [u8; 20],
}

impl AccountBinRecord {
    pub fn is_change(&self) -> bool {
        self.index == CHANGE_BIN_INDEX
    }

    pub fn is_default(&self) -> bool {
        self.index == DEFAULT_BIN_INDEX
    }

    /// Record that the script at `script_index` left the pool.
    pub fn mark_script_issued(&mut self, script_index: u32) {
        if script_index >= self.next_script_index {
            self.next_script_index = script_index + 1;
        }
    }
}

/// Lifecycle of a signing script.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum ScriptStatus {
    /// In the lookahead pool of a regular bin.
    Unused,
    /// Belongs to the change bin (pool or issued as change).
    Change,
    /// Handed out to a caller, not yet seen on-chain.
    Issued,
    /// Appears in a stored transaction output.
    Used,
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptStatus::Unused => "UNUSED",
            ScriptStatus::Change => "CHANGE",
            ScriptStatus::Issued => "ISSUED",
            ScriptStatus::Used => "USED",
        };
        f.write_str(s)
    }
}

/// The (txinscript template, txoutscript) pair derived at a (bin, index).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SigningScriptRecord {
    pub id: Id,
    pub account: Id,
    pub account_bin: Id,
    pub index: u32,
    pub label: String,
    pub status: ScriptStatus,
    /// Unsigned template with zero-length signature placeholders.
    pub txinscript: Vec<u8>,
    pub txoutscript: Vec<u8>,
    pub keys: Vec<Id>,
}

/// A chain header with its assigned height.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockHeaderRecord {
    pub id: Id,
    pub hash: Hash256,
    pub height: u32,
    pub version: u32,
    pub prevhash: Hash256,
    pub merkleroot: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// A stored merkle block referencing its header row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct MerkleBlockRecord {
    pub id: Id,
    pub blockheader: Id,
    pub txcount: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

/// Transaction lifecycle.
///
/// The variants are declared in lattice order: transitions normally move
/// to larger values, and a reorg is the only path that reduces status
/// (Confirmed back to Propagated).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum TxStatus {
    /// Still missing signatures.
    Unsigned,
    /// Fully signed but not yet broadcast.
    Unsent,
    /// Sent to at least one peer.
    Sent,
    /// Received back from the network.
    Propagated,
    /// Spends the same output as another transaction.
    Conflicting,
    /// Will never be broadcast or can never confirm.
    Canceled,
    /// Exists in the blockchain.
    Confirmed,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Unsigned => "UNSIGNED",
            TxStatus::Unsent => "UNSENT",
            TxStatus::Sent => "SENT",
            TxStatus::Propagated => "PROPAGATED",
            TxStatus::Conflicting => "CONFLICTING",
            TxStatus::Canceled => "CANCELED",
            TxStatus::Confirmed => "CONFIRMED",
        };
        f.write_str(s)
    }
}

/// Spend state of an output, kept redundant with the spent link for view
/// queries.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum TxOutStatus {
    Unspent,
    Spent,
}

/// A stored transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxRecord {
    pub id: Id,
    /// Empty until the transaction is fully signed.
    pub hash: Option<Hash256>,
    /// Malleability-stable identity: sha256d with input scripts cleared.
    pub unsigned_hash: Hash256,
    pub version: u32,
    pub locktime: u32,
    /// Caller-supplied; frozen once the transaction propagates.
    pub timestamp: u32,
    pub status: TxStatus,
    pub fee: Option<u64>,
    pub blockheader: Option<Id>,
    pub blockindex: Option<u32>,
    pub txins: Vec<Id>,
    pub txouts: Vec<Id>,
}

impl TxRecord {
    /// Recompute or apply a status transition. With `next = None` the
    /// status is derived from current facts (signature completeness);
    /// otherwise the transition is applied if it is legal. Returns true
    /// iff anything changed.
    pub fn update_status(&mut self, raw: &RawTx, next: Option<TxStatus>) -> bool {
        if raw.missing_sig_count() > 0 {
            let changed = self.status != TxStatus::Unsigned || self.hash.is_some();
            self.status = TxStatus::Unsigned;
            self.hash = None;
            return changed;
        }

        if self.status == TxStatus::Unsigned {
            self.status = match next {
                None => TxStatus::Unsent,
                Some(TxStatus::Unsigned) => TxStatus::Propagated,
                Some(status) => status,
            };
            self.hash = Some(raw.txid());
            return true;
        }

        if let Some(status) = next {
            if status != TxStatus::Unsigned && status != self.status {
                self.status = status;
                return true;
            }
        }
        false
    }

    /// Attach or detach the confirming block. Attaching forces CONFIRMED;
    /// detaching drops a CONFIRMED transaction back to PROPAGATED.
    pub fn set_blockheader(&mut self, blockheader: Option<Id>, blockindex: Option<u32>) {
        self.blockheader = blockheader;
        self.blockindex = blockindex;
        if self.blockheader.is_some() {
            self.status = TxStatus::Confirmed;
        } else if self.status == TxStatus::Confirmed {
            self.status = TxStatus::Propagated;
        }
    }
}

/// A stored transaction input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxInRecord {
    pub id: Id,
    pub tx: Id,
    pub txindex: u32,
    pub outhash: Hash256,
    pub outindex: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

/// A stored transaction output with its ownership links.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxOutRecord {
    pub id: Id,
    pub tx: Id,
    pub txindex: u32,
    pub value: u64,
    pub script: Vec<u8>,
    /// The input spending this output, when known.
    pub spent_by: Option<Id>,
    pub sending_account: Option<Id>,
    pub sending_label: String,
    pub receiving_account: Option<Id>,
    pub receiving_label: String,
    /// Bin and script are set only for receiving outputs.
    pub account_bin: Option<Id>,
    pub signingscript: Option<Id>,
    pub status: TxOutStatus,
}

impl TxOutRecord {
    /// Link or unlink the spending input, keeping status in sync.
    pub fn set_spent(&mut self, spent_by: Option<Id>) {
        self.spent_by = spent_by;
        self.status = if self.spent_by.is_some() {
            TxOutStatus::Spent
        } else {
            TxOutStatus::Unspent
        };
    }
}

/// The shared identity formula of accounts and bins:
/// HASH160(byte(minsigs) ‖ keychain hashes sorted ascending lexicographic).
pub fn multisig_set_hash(minsigs: u32, keychain_hashes: &[[u8; 20]]) -> [u8; 20] {
    let mut sorted: Vec<[u8; 20]> = keychain_hashes.to_vec();
    sorted.sort();
    let mut data = Vec::with_capacity(1 + sorted.len() * 20);
    data.push(minsigs as u8);
    for hash in &sorted {
        data.extend_from_slice(hash);
    }
    hash160(&data)
}
