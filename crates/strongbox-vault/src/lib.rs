//! # strongbox-vault — deterministic multisignature wallet vault.
//!
//! A durable store of hierarchical key material, account definitions,
//! derived output scripts, and transactions, with the lifecycle engines
//! that link them: BIP32 keychains encrypted at rest, accounts issuing
//! scripts from lookahead pools, a transaction state machine tracking
//! signing progress, confirmation, conflicts, and reorgs under a
//! malleability-stable identity.
//!
//! # Modules
//!
//! - [`error`] — `VaultError` enum
//! - [`model`] — persistent entity records and status enums
//! - [`keychain`] — keychain entity with AES-256-CBC secrets at rest
//! - [`store`] — RocksDB tables, indexes, and atomic batches
//! - [`events`] — post-commit event fan-out
//! - [`export`] — versioned export/import bundle codec
//! - [`views`] — materialized query views
//! - [`vault`] — the orchestrator

pub mod error;
pub mod events;
pub mod export;
pub mod keychain;
pub mod model;
pub mod store;
pub mod vault;
pub mod views;

// Re-exports for convenient access
pub use error::VaultError;
pub use events::VaultEvent;
pub use model::{ScriptStatus, TxOutStatus, TxStatus, SCHEMA_BASE_VERSION, SCHEMA_VERSION};
pub use vault::{Recipient, Vault};
pub use views::{
    AccountBinView, AccountView, ConfirmedTxView, KeychainView, SigningRequest,
    SigningScriptView, TxOutRole, TxOutView,
};
