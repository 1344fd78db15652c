//! Vault error types.

use strongbox_core::error::{AddressError, BlockError, KeychainError, ScriptError, TxError};
use thiserror::Error;

/// Errors surfaced by vault operations.
///
/// Parsing and validation failures abort the enclosing operation and roll
/// back the store transaction. Chain mismatches and transaction conflicts
/// are normal state, not errors.
#[derive(Error, Debug)]
pub enum VaultError {
    /// A named object is absent.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A name or identity collision.
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    /// A lock key was set after first persistence.
    #[error("keychain {0} is already encrypted")]
    AlreadyEncrypted(String),

    /// A secret is required but not currently unlocked.
    #[error("keychain {keychain} is locked: {secret}")]
    Locked { keychain: String, secret: &'static str },

    /// The supplied lock key does not decrypt the secret.
    #[error("bad lock key for keychain {0}")]
    BadLockKey(String),

    /// Store schema version outside the supported range.
    #[error("unsupported schema version {found}, supported {base}..={current}")]
    UnsupportedSchema { found: u32, base: u32, current: u32 },

    /// minsigs outside `1..=keychain count` or too many keychains.
    #[error("invalid multisig parameters: {minsigs} of {keychains}")]
    InvalidMultisig { minsigs: u32, keychains: usize },

    /// An account or keychain name the vault refuses.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Spending an output the vault does not own and cannot resolve.
    #[error("unknown outpoint {outhash}:{outindex}")]
    UnknownOutpoint { outhash: String, outindex: u32 },

    /// A header that extends no known branch.
    #[error("block {hash} does not connect to any known header")]
    ChainMismatch { hash: String },

    /// A merkle block confirming a transaction already in another block.
    #[error("invalid merkle block {hash} at height {height}")]
    InvalidMerkleBlock { hash: String, height: u32 },

    /// Account cannot cover the requested outputs plus fee.
    #[error("insufficient funds in account {account}: have {have}, need {need}")]
    InsufficientFunds { account: String, have: u64, need: u64 },

    /// The change bin only issues scripts through transaction creation.
    #[error("account {0} cannot issue a change script directly")]
    CannotIssueChangeScript(String),

    /// A bin's script pool is exhausted and cannot be refilled.
    #[error("account bin {account}::{bin} is out of scripts")]
    BinOutOfScripts { account: String, bin: String },

    /// A malformed export bundle.
    #[error("invalid export bundle: {0}")]
    InvalidBundle(String),

    /// The vault has been closed.
    #[error("vault is closed")]
    Closed,

    /// Underlying store failure.
    #[error("storage: {0}")]
    Storage(String),

    /// Filesystem failure during export or import.
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Keychain(#[from] KeychainError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl VaultError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}
