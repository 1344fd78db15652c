//! Materialized query views.
//!
//! Read-side structs joining entities for callers: keychain listings,
//! account summaries, signing-script tables, and the txout view joined to
//! account, bin, script, and confirming block. The vault builds these from
//! committed state; they carry no live references into the store.

use strongbox_core::hash::Hash256;

use crate::model::{Id, ScriptStatus, TxOutStatus, TxStatus};

/// A root keychain as shown to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeychainView {
    pub id: Id,
    pub name: String,
    pub depth: u8,
    pub parent_fp: u32,
    pub child_num: u32,
    pub pubkey: Vec<u8>,
    pub hash: [u8; 20],
    pub is_private: bool,
    pub is_encrypted: bool,
    /// Whether the vault currently caches an unlock key for it.
    pub is_locked: bool,
}

/// An account summary with its keychain and bin names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountView {
    pub id: Id,
    pub name: String,
    pub minsigs: u32,
    pub unused_pool_size: u32,
    pub time_created: u32,
    pub keychain_names: Vec<String>,
    pub bin_names: Vec<String>,
}

/// A bin joined to its account. Detached (imported) bins have an empty
/// account name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountBinView {
    pub account_id: Option<Id>,
    pub account_name: String,
    pub bin_id: Id,
    pub bin_name: String,
    pub bin_hash: [u8; 20],
    pub script_count: u32,
    pub next_script_index: u32,
}

/// A signing script joined to its account and bin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningScriptView {
    pub id: Id,
    pub account_id: Id,
    pub account_name: String,
    pub bin_id: Id,
    pub bin_name: String,
    pub index: u32,
    pub label: String,
    pub status: ScriptStatus,
    pub txinscript: Vec<u8>,
    pub txoutscript: Vec<u8>,
    pub address: Option<String>,
}

/// Which side of a transaction output an account is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOutRole {
    Sender,
    Receiver,
}

/// A transaction output joined to its transaction, accounts, bin, script,
/// and confirming block. Outputs touching both a sending and a receiving
/// account appear once per role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutView {
    pub txout_id: Id,
    pub role: TxOutRole,
    pub account_id: Id,
    pub account_name: String,
    pub bin_name: Option<String>,
    pub label: String,
    pub value: u64,
    pub script: Vec<u8>,
    pub status: TxOutStatus,
    pub tx_id: Id,
    pub tx_unsigned_hash: Hash256,
    pub tx_hash: Option<Hash256>,
    pub tx_status: TxStatus,
    pub tx_timestamp: u32,
    pub txindex: u32,
    pub fee: Option<u64>,
    pub block_height: Option<u32>,
}

/// A confirmed transaction with its block position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmedTxView {
    pub tx_id: Id,
    pub tx_hash: Hash256,
    pub block_hash: Hash256,
    pub block_height: u32,
    pub blockindex: u32,
}

/// Everything a co-signer needs to complete an unsigned transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequest {
    pub sigs_needed: u32,
    /// (keychain name, keychain hash) pairs able to supply signatures.
    pub keychains: Vec<(String, [u8; 20])>,
    pub raw_tx: Vec<u8>,
}
