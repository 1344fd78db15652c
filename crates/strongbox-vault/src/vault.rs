//! The vault orchestrator.
//!
//! All public mutating operations run under a single writer lock and stage
//! their writes into one atomic batch; readers see either the pre- or the
//! post-commit state, never a partial one. Events are emitted after the
//! commit, in commit order.
//!
//! Unlock keys handed to [`Vault::unlock_keychain`] are cached per keychain
//! name for the lifetime of the session (or until locked again) and secrets
//! decrypted with them live only inside the operation that needed them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rand::seq::SliceRandom;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use strongbox_core::address::{address_for_txoutscript, ChainParams};
use strongbox_core::bloom::BloomFilter;
use strongbox_core::chain::{Block, MerkleBlock};
use strongbox_core::constants::{DEFAULT_UNUSED_POOL_SIZE, FINAL_SEQUENCE, MAX_KEYCHAINS, SIGHASH_ALL};
use strongbox_core::crypto;
use strongbox_core::error::TxError;
use strongbox_core::hash::Hash256;
use strongbox_core::script::{Payee, Script, ScriptKind, SigFormat};
use strongbox_core::tx::{RawTx, RawTxIn, RawTxOut};

use crate::error::VaultError;
use crate::events::{EventHub, VaultEvent};
use crate::export::{
    read_bundle, write_bundle, BundleKind, ExportedAccount, ExportedBin, ExportedKeychain,
    ExportedTx, ExportedTxIn, ExportedTxOut, CLASS_VERSION,
};
use crate::keychain::validate_name;
use crate::model::{
    multisig_set_hash, AccountBinRecord, AccountRecord, BlockHeaderRecord, Id, KeyRecord,
    KeychainRecord, MerkleBlockRecord, ScriptStatus, SigningScriptRecord, TxInRecord,
    TxOutRecord, TxOutStatus, TxRecord, TxStatus, CHANGE_BIN_INDEX, CHANGE_BIN_NAME,
    DEFAULT_BIN_INDEX, DEFAULT_BIN_NAME, FIRST_CUSTOM_BIN_INDEX,
};
use crate::store::{Batch, Store};
use crate::views::{
    AccountBinView, AccountView, ConfirmedTxView, KeychainView, SigningRequest,
    SigningScriptView, TxOutRole, TxOutView,
};

/// One requested output of [`Vault::create_raw_tx`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub txoutscript: Vec<u8>,
    pub value: u64,
    pub label: String,
}

/// A derivation context for one keychain of a bin: the root record it
/// resolves to, the path from that root to the bin branch, and the public
/// HD node at the branch.
struct BinKeychain {
    root_id: Id,
    path: Vec<u32>,
    hd: strongbox_core::hd::HdKeychain,
    is_private: bool,
}

/// The deterministic, multisignature-capable wallet vault.
pub struct Vault {
    store: RwLock<Option<Store>>,
    /// Serializes writers; readers use store snapshots.
    write_lock: Mutex<()>,
    events: Mutex<EventHub>,
    /// Cached unlock keys by keychain name, zeroized on lock.
    unlock_keys: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    params: ChainParams,
}

impl Vault {
    /// Create a new vault at `path`. Fails if the path exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        Self::create_with_params(path, ChainParams::default())
    }

    pub fn create_with_params(
        path: impl AsRef<Path>,
        params: ChainParams,
    ) -> Result<Self, VaultError> {
        let store = Store::create(path)?;
        Ok(Self::with_store(store, params))
    }

    /// Open an existing vault, migrating supported older schemas forward.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        Self::open_with_params(path, ChainParams::default())
    }

    pub fn open_with_params(
        path: impl AsRef<Path>,
        params: ChainParams,
    ) -> Result<Self, VaultError> {
        let store = Store::open(path)?;
        Ok(Self::with_store(store, params))
    }

    fn with_store(store: Store, params: ChainParams) -> Self {
        Self {
            store: RwLock::new(Some(store)),
            write_lock: Mutex::new(()),
            events: Mutex::new(EventHub::new()),
            unlock_keys: Mutex::new(HashMap::new()),
            params,
        }
    }

    /// Close the vault, zeroizing cached unlock keys. Further operations
    /// fail with [`VaultError::Closed`].
    pub fn close(&self) {
        let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.unlock_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_open(&self) -> bool {
        self.store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Subscribe a callback to vault events.
    pub fn subscribe(&self, handler: impl Fn(&VaultEvent) + Send + Sync + 'static) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribe(handler);
    }

    /// Drop all event subscribers.
    pub fn clear_subscribers(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn emit_all(&self, events: &[VaultEvent]) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .emit_all(events);
    }

    /// Attach the error event to failing operations.
    fn surface<R>(&self, result: Result<R, VaultError>) -> Result<R, VaultError> {
        if let Err(e) = &result {
            self.emit_all(&[VaultEvent::Error(e.to_string())]);
        }
        result
    }

    fn store_guard(&self) -> std::sync::RwLockReadGuard<'_, Option<Store>> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn unlock_key_for(&self, name: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.unlock_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /////////////////////////
    // KEYCHAIN OPERATIONS //
    /////////////////////////

    /// Create a root keychain from entropy, optionally encrypting its
    /// secrets under a lock key.
    pub fn new_keychain(
        &self,
        name: &str,
        entropy: &[u8],
        lock_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<KeychainView, VaultError> {
        trace!(name, "new_keychain");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            if store.keychain_by_name(name)?.is_some() {
                return Err(VaultError::already_exists("keychain", name));
            }
            let mut record = KeychainRecord::new_root(name, entropy, lock_key, salt)?;
            if store.keychain_by_hash(&record.hash)?.is_some() {
                return Err(VaultError::already_exists("keychain", name));
            }

            let mut batch = store.batch();
            record.id = batch.keychain_id(store)?;
            batch.put_keychain(store, &record, None)?;
            store.commit(batch)?;

            if let Some(key) = lock_key {
                self.unlock_keys
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(name.to_string(), Zeroizing::new(key.to_vec()));
            }
            info!(name, hash = %hex::encode(record.hash), "created keychain");
            Ok(self.keychain_view(&record))
        })())
    }

    pub fn keychain_exists(&self, name: &str) -> Result<bool, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        Ok(store.keychain_by_name(name)?.is_some())
    }

    pub fn rename_keychain(&self, old_name: &str, new_name: &str) -> Result<(), VaultError> {
        trace!(old_name, new_name, "rename_keychain");
        self.surface((|| {
            validate_name(new_name)?;
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let old = store
                .keychain_by_name(old_name)?
                .ok_or_else(|| VaultError::not_found("keychain", old_name))?;
            if old_name == new_name {
                return Ok(());
            }
            if store.keychain_by_name(new_name)?.is_some() {
                return Err(VaultError::already_exists("keychain", new_name));
            }
            let mut renamed = old.clone();
            renamed.name = new_name.to_string();
            let mut batch = store.batch();
            batch.put_keychain(store, &renamed, Some(&old))?;
            store.commit(batch)?;

            let mut keys = self.unlock_keys.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(key) = keys.remove(old_name) {
                keys.insert(new_name.to_string(), key);
            }
            Ok(())
        })())
    }

    /// Import a keychain from a BIP32 extended key.
    pub fn import_keychain_extkey(
        &self,
        name: &str,
        extkey: &[u8],
        lock_key: Option<&[u8]>,
        salt: Option<&[u8]>,
    ) -> Result<KeychainView, VaultError> {
        trace!(name, "import_keychain_extkey");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            if store.keychain_by_name(name)?.is_some() {
                return Err(VaultError::already_exists("keychain", name));
            }
            let mut record = KeychainRecord::from_extkey(name, extkey, lock_key, salt)?;
            if store.keychain_by_hash(&record.hash)?.is_some() {
                return Err(VaultError::already_exists("keychain", name));
            }
            let mut batch = store.batch();
            record.id = batch.keychain_id(store)?;
            batch.put_keychain(store, &record, None)?;
            store.commit(batch)?;

            if let Some(key) = lock_key {
                self.unlock_keys
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(name.to_string(), Zeroizing::new(key.to_vec()));
            }
            Ok(self.keychain_view(&record))
        })())
    }

    /// Export the BIP32 extended key of a keychain. Private export needs
    /// the keychain unlocked.
    pub fn export_keychain_extkey(
        &self,
        name: &str,
        get_private: bool,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        trace!(name, get_private, "export_keychain_extkey");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;
            let record = store
                .keychain_by_name(name)?
                .ok_or_else(|| VaultError::not_found("keychain", name))?;
            let unlock = self.unlock_key_for(name);
            let version = if get_private {
                self.params.extkey_prv_version
            } else {
                self.params.extkey_pub_version
            };
            record.extkey(get_private, unlock.as_deref(), version)
        })())
    }

    /// Export a keychain bundle to a file. Secrets travel in their
    /// ciphertext+salt form only.
    pub fn export_keychain(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        export_privkeys: bool,
    ) -> Result<(), VaultError> {
        trace!(name, "export_keychain");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;
            let record = store
                .keychain_by_name(name)?
                .ok_or_else(|| VaultError::not_found("keychain", name))?;
            let exported = ExportedKeychain::from_record(&record, export_privkeys);
            let bytes = write_bundle(BundleKind::Keychain, &exported)?;
            std::fs::write(path, bytes)?;
            Ok(())
        })())
    }

    /// Import a keychain bundle. Name collisions get a numeric suffix.
    pub fn import_keychain(&self, path: impl AsRef<Path>) -> Result<KeychainView, VaultError> {
        trace!("import_keychain");
        self.surface((|| {
            let bytes = std::fs::read(path)?;
            let exported: ExportedKeychain = read_bundle(&bytes, BundleKind::Keychain)?;

            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let mut record = exported.into_record();
            if let Some(existing) = store.keychain_by_hash(&record.hash)? {
                return Err(VaultError::already_exists("keychain", existing.name));
            }
            record.name = unique_name(&record.name, |n| {
                store.keychain_by_name(n).map(|r| r.is_some())
            })?;
            let mut batch = store.batch();
            record.id = batch.keychain_id(store)?;
            batch.put_keychain(store, &record, None)?;
            store.commit(batch)?;
            Ok(self.keychain_view(&record))
        })())
    }

    /// Cache an unlock key for a keychain after verifying it decrypts the
    /// keychain's secrets.
    pub fn unlock_keychain(&self, name: &str, lock_key: &[u8]) -> Result<(), VaultError> {
        trace!(name, "unlock_keychain");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;
            let record = store
                .keychain_by_name(name)?
                .ok_or_else(|| VaultError::not_found("keychain", name))?;
            // Verification also covers the unencrypted case, where any key
            // is accepted.
            record.chain_code_plain(Some(lock_key))?;
            if record.is_private() {
                record.privkey_plain(Some(lock_key))?;
            }
            self.unlock_keys
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), Zeroizing::new(lock_key.to_vec()));
            Ok(())
        })())
    }

    /// Encrypt the secrets of a stored keychain under a lock key.
    ///
    /// Only a keychain whose secrets are still unencrypted can be locked;
    /// re-keying an encrypted keychain is refused with `AlreadyEncrypted`.
    pub fn set_keychain_lock_key(
        &self,
        name: &str,
        lock_key: &[u8],
        salt: Option<&[u8]>,
    ) -> Result<(), VaultError> {
        trace!(name, "set_keychain_lock_key");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let old = store
                .keychain_by_name(name)?
                .ok_or_else(|| VaultError::not_found("keychain", name))?;
            if old.is_privkey_encrypted() || old.is_chain_code_encrypted() {
                return Err(VaultError::AlreadyEncrypted(name.to_string()));
            }
            let mut locked = old.clone();
            locked.set_chain_code_lock_key(None, Some(lock_key), salt)?;
            if locked.is_private() {
                locked.set_privkey_lock_key(None, Some(lock_key), salt)?;
            }
            let mut batch = store.batch();
            batch.put_keychain(store, &locked, Some(&old))?;
            store.commit(batch)?;

            self.unlock_keys
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), Zeroizing::new(lock_key.to_vec()));
            Ok(())
        })())
    }

    /// Drop the cached unlock key of a keychain.
    pub fn lock_keychain(&self, name: &str) {
        trace!(name, "lock_keychain");
        self.unlock_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Drop every cached unlock key. Session teardown calls this.
    pub fn lock_all_keychains(&self) {
        trace!("lock_all_keychains");
        self.unlock_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn keychain_view(&self, record: &KeychainRecord) -> KeychainView {
        KeychainView {
            id: record.id,
            name: record.name.clone(),
            depth: record.depth,
            parent_fp: record.parent_fp,
            child_num: record.child_num,
            pubkey: record.pubkey.clone(),
            hash: record.hash,
            is_private: record.is_private(),
            is_encrypted: record.is_privkey_encrypted() || record.is_chain_code_encrypted(),
            is_locked: self.unlock_key_for(&record.name).is_none()
                && (record.is_privkey_encrypted() || record.is_chain_code_encrypted()),
        }
    }

    /// Root keychains as shown to callers. Hidden keychains back imported
    /// bins and are excluded unless requested.
    pub fn keychain_views(&self, include_hidden: bool) -> Result<Vec<KeychainView>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let mut views: Vec<KeychainView> = store
            .keychains()?
            .iter()
            .filter(|record| include_hidden || !record.hidden)
            .map(|record| self.keychain_view(record))
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    ////////////////////////
    // ACCOUNT OPERATIONS //
    ////////////////////////

    /// Create an account over named keychains and fill the lookahead pools
    /// of its two reserved bins.
    pub fn new_account(
        &self,
        name: &str,
        minsigs: u32,
        keychain_names: &[&str],
        unused_pool_size: Option<u32>,
        time_created: u32,
    ) -> Result<(), VaultError> {
        trace!(name, minsigs, ?keychain_names, "new_account");
        self.surface((|| {
            validate_name(name)?;
            if minsigs < 1
                || keychain_names.is_empty()
                || keychain_names.len() > MAX_KEYCHAINS
                || minsigs as usize > keychain_names.len()
            {
                return Err(VaultError::InvalidMultisig {
                    minsigs,
                    keychains: keychain_names.len(),
                });
            }

            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            if store.account_by_name(name)?.is_some() {
                return Err(VaultError::already_exists("account", name));
            }
            let mut keychains = Vec::with_capacity(keychain_names.len());
            for keychain_name in keychain_names {
                let record = store
                    .keychain_by_name(keychain_name)?
                    .ok_or_else(|| VaultError::not_found("keychain", *keychain_name))?;
                keychains.push(record);
            }

            let keychain_hashes: Vec<[u8; 20]> = keychains.iter().map(|k| k.hash).collect();
            let hash = multisig_set_hash(minsigs, &keychain_hashes);
            if store.account_by_hash(&hash)?.is_some() {
                return Err(VaultError::already_exists("account", name));
            }

            let pool_size = unused_pool_size.unwrap_or(DEFAULT_UNUSED_POOL_SIZE);
            let mut batch = store.batch();
            let account = AccountRecord {
                id: batch.account_id(store)?,
                name: name.to_string(),
                minsigs,
                unused_pool_size: pool_size,
                time_created,
                hash,
            };
            batch.put_account(store, &account, None)?;
            for keychain in &keychains {
                batch.put_account_keychain(store, account.id, keychain.id)?;
            }

            // The first bin must be the change bin, the second the default
            // bin.
            for (index, bin_name) in [
                (CHANGE_BIN_INDEX, CHANGE_BIN_NAME),
                (DEFAULT_BIN_INDEX, DEFAULT_BIN_NAME),
            ] {
                let mut bin = self.make_bin(store, &mut batch, &account, &keychains, index, bin_name)?;
                let ctx = self.bin_context_from_roots(&keychains, index)?;
                let mut scripts = Vec::new();
                self.refill_bin(store, &mut batch, &mut bin, &ctx, &mut scripts, pool_size)?;
                batch.put_account_bin(store, &bin, None)?;
            }

            store.commit(batch)?;
            info!(name, minsigs, "created account");
            self.emit_all(&[VaultEvent::Updated(vec![name.to_string()])]);
            Ok(())
        })())
    }

    pub fn account_exists(&self, name: &str) -> Result<bool, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        Ok(store.account_by_name(name)?.is_some())
    }

    pub fn rename_account(&self, old_name: &str, new_name: &str) -> Result<(), VaultError> {
        trace!(old_name, new_name, "rename_account");
        self.surface((|| {
            validate_name(new_name)?;
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let old = store
                .account_by_name(old_name)?
                .ok_or_else(|| VaultError::not_found("account", old_name))?;
            if old_name == new_name {
                return Ok(());
            }
            if store.account_by_name(new_name)?.is_some() {
                return Err(VaultError::already_exists("account", new_name));
            }
            let mut renamed = old.clone();
            renamed.name = new_name.to_string();
            let mut batch = store.batch();
            batch.put_account(store, &renamed, Some(&old))?;
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(vec![new_name.to_string()])]);
            Ok(())
        })())
    }

    /// Delete an account, cascading to its bins, scripts, and keys.
    /// Scripts referenced by stored transactions are kept so history stays
    /// resolvable.
    pub fn delete_account(&self, name: &str) -> Result<(), VaultError> {
        trace!(name, "delete_account");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let account = store
                .account_by_name(name)?
                .ok_or_else(|| VaultError::not_found("account", name))?;

            let referenced: BTreeSet<Id> = store
                .txouts()?
                .iter()
                .filter_map(|txout| txout.signingscript)
                .collect();

            let mut batch = store.batch();
            for bin in store.bins_of_account(account.id)? {
                for script in store.scripts_of_bin(bin.id)? {
                    if referenced.contains(&script.id) {
                        continue;
                    }
                    for key_id in &script.keys {
                        batch.delete_key(store, *key_id)?;
                    }
                    batch.delete_signing_script(store, &script)?;
                }
                batch.delete_account_bin(store, &bin)?;
            }
            for keychain_id in store.account_keychain_ids(account.id)? {
                batch.delete_account_keychain(store, account.id, keychain_id)?;
            }
            batch.delete_account(store, &account)?;
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(vec![name.to_string()])]);
            Ok(())
        })())
    }

    /// Add a custom bin (index ≥ 3) to an account and fill its pool.
    pub fn add_account_bin(&self, account_name: &str, bin_name: &str) -> Result<(), VaultError> {
        trace!(account_name, bin_name, "add_account_bin");
        self.surface((|| {
            validate_name(bin_name)?;
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let account = store
                .account_by_name(account_name)?
                .ok_or_else(|| VaultError::not_found("account", account_name))?;
            let bins = store.bins_of_account(account.id)?;
            if bins.iter().any(|bin| bin.name == bin_name) {
                return Err(VaultError::already_exists("account bin", bin_name));
            }
            let index = bins
                .iter()
                .map(|bin| bin.index + 1)
                .max()
                .unwrap_or(FIRST_CUSTOM_BIN_INDEX)
                .max(FIRST_CUSTOM_BIN_INDEX);

            let keychains = self.account_keychains(store, account.id)?;
            let mut batch = store.batch();
            let mut bin = self.make_bin(store, &mut batch, &account, &keychains, index, bin_name)?;
            let ctx = self.bin_context_from_roots(&keychains, index)?;
            let mut scripts = Vec::new();
            self.refill_bin(
                store,
                &mut batch,
                &mut bin,
                &ctx,
                &mut scripts,
                account.unused_pool_size,
            )?;
            batch.put_account_bin(store, &bin, None)?;
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(vec![account_name.to_string()])]);
            Ok(())
        })())
    }

    /// Issue the next signing script from the default bin, returning its
    /// address and txout script.
    pub fn issue_new_script(
        &self,
        account_name: &str,
        label: &str,
    ) -> Result<(String, Vec<u8>), VaultError> {
        self.issue_bin_script(account_name, DEFAULT_BIN_NAME, label)
    }

    /// Issue the next signing script from a named bin.
    pub fn issue_bin_script(
        &self,
        account_name: &str,
        bin_name: &str,
        label: &str,
    ) -> Result<(String, Vec<u8>), VaultError> {
        trace!(account_name, bin_name, label, "issue_bin_script");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let (_account, mut bin) = self.account_bin(store, account_name, bin_name)?;
            if bin.is_change() {
                return Err(VaultError::CannotIssueChangeScript(account_name.to_string()));
            }
            let mut batch = store.batch();
            let script = self.issue_script(store, &mut batch, &mut bin, label)?;
            batch.put_account_bin(store, &bin, None)?;
            store.commit(batch)?;

            let address = address_for_txoutscript(&script.txoutscript, &self.params)?;
            self.emit_all(&[VaultEvent::Updated(vec![account_name.to_string()])]);
            Ok((address, script.txoutscript))
        })())
    }

    /// Top up the lookahead pools of every bin of an account.
    pub fn refill_account_pool(&self, account_name: &str) -> Result<(), VaultError> {
        trace!(account_name, "refill_account_pool");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let account = store
                .account_by_name(account_name)?
                .ok_or_else(|| VaultError::not_found("account", account_name))?;
            let mut batch = store.batch();
            for mut bin in store.bins_of_account(account.id)? {
                let ctx = self.bin_context(store, &bin)?;
                let mut scripts = store.scripts_of_bin(bin.id)?;
                self.refill_bin(
                    store,
                    &mut batch,
                    &mut bin,
                    &ctx,
                    &mut scripts,
                    account.unused_pool_size,
                )?;
                batch.put_account_bin(store, &bin, None)?;
            }
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(vec![account_name.to_string()])]);
            Ok(())
        })())
    }

    pub fn account_views(&self) -> Result<Vec<AccountView>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let mut views = Vec::new();
        for account in store.accounts()? {
            let mut keychain_names = Vec::new();
            for id in store.account_keychain_ids(account.id)? {
                if let Some(keychain) = store.keychain(id)? {
                    keychain_names.push(keychain.name);
                }
            }
            keychain_names.sort();
            let bin_names = store
                .bins_of_account(account.id)?
                .iter()
                .map(|bin| bin.name.clone())
                .collect();
            views.push(AccountView {
                id: account.id,
                name: account.name,
                minsigs: account.minsigs,
                unused_pool_size: account.unused_pool_size,
                time_created: account.time_created,
                keychain_names,
                bin_names,
            });
        }
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    /// Signing scripts filtered by account, bin, and status set.
    pub fn signing_script_views(
        &self,
        account_name: Option<&str>,
        bin_name: Option<&str>,
        statuses: &[ScriptStatus],
    ) -> Result<Vec<SigningScriptView>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let accounts: HashMap<Id, AccountRecord> =
            store.accounts()?.into_iter().map(|a| (a.id, a)).collect();
        let bins: HashMap<Id, AccountBinRecord> =
            store.account_bins()?.into_iter().map(|b| (b.id, b)).collect();

        let mut views = Vec::new();
        for script in store.signing_scripts()? {
            if !statuses.is_empty() && !statuses.contains(&script.status) {
                continue;
            }
            let Some(bin) = bins.get(&script.account_bin) else {
                continue;
            };
            // Scripts of detached (imported) bins have no account; they
            // list with an empty account name.
            let account = accounts.get(&script.account);
            if account_name.is_some_and(|n| account.map_or(true, |a| n != a.name)) {
                continue;
            }
            if bin_name.is_some_and(|n| n != bin.name) {
                continue;
            }
            views.push(SigningScriptView {
                id: script.id,
                account_id: script.account,
                account_name: account.map(|a| a.name.clone()).unwrap_or_default(),
                bin_id: bin.id,
                bin_name: bin.name.clone(),
                index: script.index,
                label: script.label.clone(),
                status: script.status,
                txinscript: script.txinscript.clone(),
                txoutscript: script.txoutscript.clone(),
                address: address_for_txoutscript(&script.txoutscript, &self.params).ok(),
            });
        }
        views.sort_by(|a, b| {
            (&a.account_name, &a.bin_name, a.index).cmp(&(&b.account_name, &b.bin_name, b.index))
        });
        Ok(views)
    }

    /// All bins joined to their accounts, including detached imported
    /// bins.
    pub fn account_bin_views(&self) -> Result<Vec<AccountBinView>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let accounts: HashMap<Id, AccountRecord> =
            store.accounts()?.into_iter().map(|a| (a.id, a)).collect();
        let mut views = Vec::new();
        for bin in store.account_bins()? {
            let account = bin.account.and_then(|id| accounts.get(&id));
            views.push(AccountBinView {
                account_id: account.map(|a| a.id),
                account_name: account.map(|a| a.name.clone()).unwrap_or_default(),
                bin_id: bin.id,
                bin_name: bin.name.clone(),
                bin_hash: bin.hash,
                script_count: bin.script_count,
                next_script_index: bin.next_script_index,
            });
        }
        views.sort_by(|a, b| {
            (&a.account_name, &a.bin_name).cmp(&(&b.account_name, &b.bin_name))
        });
        Ok(views)
    }

    /// Spendable balance of an account. With `min_confirmations` = 0,
    /// unconfirmed (but not conflicting, canceled, or unsigned) outputs
    /// count.
    pub fn account_balance(
        &self,
        account_name: &str,
        min_confirmations: u32,
    ) -> Result<u64, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let account = store
            .account_by_name(account_name)?
            .ok_or_else(|| VaultError::not_found("account", account_name))?;
        let best_height = store.best_height()?;
        let headers: HashMap<Id, u32> = store
            .block_headers()?
            .into_iter()
            .map(|h| (h.id, h.height))
            .collect();

        let mut balance: u64 = 0;
        for txout in store.txouts()? {
            if txout.receiving_account != Some(account.id)
                || txout.status != TxOutStatus::Unspent
            {
                continue;
            }
            let Some(tx) = store.tx(txout.tx)? else {
                continue;
            };
            match tx.status {
                TxStatus::Unsigned | TxStatus::Conflicting | TxStatus::Canceled => continue,
                _ => {}
            }
            if min_confirmations > 0 {
                let confirmations = match (tx.blockheader.and_then(|id| headers.get(&id)), best_height)
                {
                    (Some(height), Some(best)) => best.saturating_sub(*height) + 1,
                    _ => 0,
                };
                if confirmations < min_confirmations {
                    continue;
                }
            }
            balance = balance.saturating_add(txout.value);
        }
        Ok(balance)
    }

    // --- account/bin helpers ---

    fn account_keychains(
        &self,
        store: &Store,
        account: Id,
    ) -> Result<Vec<KeychainRecord>, VaultError> {
        let mut keychains = Vec::new();
        for id in store.account_keychain_ids(account)? {
            let record = store
                .keychain(id)?
                .ok_or_else(|| VaultError::Storage(format!("dangling keychain id {id}")))?;
            keychains.push(record);
        }
        Ok(keychains)
    }

    fn account_bin(
        &self,
        store: &Store,
        account_name: &str,
        bin_name: &str,
    ) -> Result<(AccountRecord, AccountBinRecord), VaultError> {
        let account = store
            .account_by_name(account_name)?
            .ok_or_else(|| VaultError::not_found("account", account_name))?;
        let bin = store
            .bins_of_account(account.id)?
            .into_iter()
            .find(|bin| bin.name == bin_name)
            .ok_or_else(|| VaultError::not_found("account bin", bin_name))?;
        Ok((account, bin))
    }

    /// Build a bin record, deriving the branch keychains for its hash.
    fn make_bin(
        &self,
        store: &Store,
        batch: &mut Batch,
        account: &AccountRecord,
        keychains: &[KeychainRecord],
        index: u32,
        name: &str,
    ) -> Result<AccountBinRecord, VaultError> {
        let ctx = self.bin_context_from_roots(keychains, index)?;
        let child_hashes: Vec<[u8; 20]> = ctx.iter().map(|bk| bk.hd.full_hash()).collect();
        let hash = multisig_set_hash(account.minsigs, &child_hashes);
        if store.bin_by_hash(&hash)?.is_some() {
            return Err(VaultError::already_exists("account bin", name));
        }
        Ok(AccountBinRecord {
            id: batch.account_bin_id(store)?,
            account: Some(account.id),
            index,
            name: name.to_string(),
            script_count: 0,
            next_script_index: 0,
            minsigs: account.minsigs,
            keychains: Vec::new(),
            hash,
        })
    }

    /// Derivation context from account root keychains: each branch is the
    /// public child at the bin index.
    fn bin_context_from_roots(
        &self,
        keychains: &[KeychainRecord],
        bin_index: u32,
    ) -> Result<Vec<BinKeychain>, VaultError> {
        let mut ctx = Vec::with_capacity(keychains.len());
        for record in keychains {
            let unlock = self.unlock_key_for(&record.name);
            let hd = record.hd_public(unlock.as_deref())?;
            ctx.push(BinKeychain {
                root_id: record.id,
                path: vec![bin_index],
                hd: hd.public_child(bin_index)?,
                is_private: record.is_private(),
            });
        }
        Ok(ctx)
    }

    /// Derivation context for a stored bin: account bins derive from the
    /// account's keychains, detached (imported) bins from their own stored
    /// keychain set.
    fn bin_context(
        &self,
        store: &Store,
        bin: &AccountBinRecord,
    ) -> Result<Vec<BinKeychain>, VaultError> {
        match bin.account {
            Some(account) => {
                let keychains = self.account_keychains(store, account)?;
                self.bin_context_from_roots(&keychains, bin.index)
            }
            None => {
                let mut ctx = Vec::with_capacity(bin.keychains.len());
                for id in &bin.keychains {
                    let record = store
                        .keychain(*id)?
                        .ok_or_else(|| VaultError::Storage(format!("dangling keychain id {id}")))?;
                    let unlock = self.unlock_key_for(&record.name);
                    let hd = record.hd_public(unlock.as_deref())?;
                    ctx.push(BinKeychain {
                        root_id: record.id,
                        path: Vec::new(),
                        hd,
                        is_private: record.is_private(),
                    });
                }
                Ok(ctx)
            }
        }
    }

    fn pool_status(bin: &AccountBinRecord) -> ScriptStatus {
        if bin.is_change() {
            ScriptStatus::Change
        } else {
            ScriptStatus::Unused
        }
    }

    /// Derive the script at `bin.script_count`, staging it and its keys.
    fn derive_script(
        &self,
        store: &Store,
        batch: &mut Batch,
        bin: &mut AccountBinRecord,
        ctx: &[BinKeychain],
        status: ScriptStatus,
        label: &str,
    ) -> Result<SigningScriptRecord, VaultError> {
        let index = bin.script_count;
        let mut keys: Vec<KeyRecord> = Vec::with_capacity(ctx.len());
        for bk in ctx {
            let pubkey = bk.hd.public_child(index)?.pubkey().to_vec();
            keys.push(KeyRecord {
                id: 0,
                root_keychain: bk.root_id,
                derivation_path: bk.path.clone(),
                index,
                pubkey,
                is_private: bk.is_private,
            });
        }
        // Canonical ordering by pubkey bytes.
        keys.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

        let script = if keys.len() == 1 {
            Script::pay_to_pubkey_hash(keys[0].pubkey.clone())
        } else {
            Script::multisig(bin.minsigs, keys.iter().map(|k| k.pubkey.clone()).collect())?
        };

        let mut key_ids = Vec::with_capacity(keys.len());
        for mut key in keys {
            key.id = batch.key_id(store)?;
            batch.put_key(store, &key)?;
            key_ids.push(key.id);
        }

        let account = bin.account.unwrap_or(0);
        let record = SigningScriptRecord {
            id: batch.signing_script_id(store)?,
            account,
            account_bin: bin.id,
            index,
            label: label.to_string(),
            status,
            txinscript: script.txinscript(SigFormat::Edit),
            txoutscript: script.txoutscript(),
            keys: key_ids,
        };
        batch.put_signing_script(store, &record)?;
        bin.script_count += 1;
        Ok(record)
    }

    /// Top up the pool so that enough unissued scripts exist past
    /// `next_script_index`. `scripts` is the caller's working set of the
    /// bin's scripts (committed plus staged) and is extended in place.
    fn refill_bin(
        &self,
        store: &Store,
        batch: &mut Batch,
        bin: &mut AccountBinRecord,
        ctx: &[BinKeychain],
        scripts: &mut Vec<SigningScriptRecord>,
        pool_size: u32,
    ) -> Result<(), VaultError> {
        let pool_status = Self::pool_status(bin);

        // Scripts skipped over by out-of-order issuance leave the pool.
        if !bin.is_change() {
            for script in scripts.iter_mut() {
                if script.status == ScriptStatus::Unused && script.index < bin.next_script_index {
                    script.status = ScriptStatus::Issued;
                    batch.put_signing_script(store, script)?;
                }
            }
        }

        let mut pooled = scripts
            .iter()
            .filter(|s| s.status == pool_status && s.index >= bin.next_script_index)
            .count() as u32;
        while pooled < pool_size {
            let record = self.derive_script(store, batch, bin, ctx, pool_status, "")?;
            scripts.push(record);
            pooled += 1;
        }
        Ok(())
    }

    /// Issue the script at `next_script_index` from a bin: label it, move
    /// it out of the pool, and refill.
    fn issue_script(
        &self,
        store: &Store,
        batch: &mut Batch,
        bin: &mut AccountBinRecord,
        label: &str,
    ) -> Result<SigningScriptRecord, VaultError> {
        let mut scripts = store.scripts_of_bin(bin.id)?;
        let pool_size = match bin.account {
            Some(account) => store
                .account(account)?
                .map(|a| a.unused_pool_size)
                .unwrap_or(DEFAULT_UNUSED_POOL_SIZE),
            None => DEFAULT_UNUSED_POOL_SIZE,
        };

        // Replenish first so a drained pool recovers before issuance, as
        // long as the chain codes are available.
        let ctx = match self.bin_context(store, bin) {
            Ok(ctx) => Some(ctx),
            Err(VaultError::Locked { keychain, .. }) => {
                debug!(keychain = %keychain, "chain code locked, pool cannot be replenished");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(ctx) = &ctx {
            self.refill_bin(store, batch, bin, ctx, &mut scripts, pool_size)?;
        }

        let target = bin.next_script_index;
        let position = scripts.iter().position(|s| s.index == target).ok_or_else(|| {
            VaultError::BinOutOfScripts {
                account: String::new(),
                bin: bin.name.clone(),
            }
        })?;
        let mut script = scripts[position].clone();
        script.label = label.to_string();
        script.status = if bin.is_change() {
            ScriptStatus::Change
        } else {
            ScriptStatus::Issued
        };
        batch.put_signing_script(store, &script)?;
        scripts[position] = script.clone();
        bin.mark_script_issued(target);

        if let Some(ctx) = &ctx {
            self.refill_bin(store, batch, bin, ctx, &mut scripts, pool_size)?;
        }
        Ok(script)
    }
}

// Generate a unique name by appending a counter: name, name1, name2, ...
fn unique_name(
    base: &str,
    mut exists: impl FnMut(&str) -> Result<bool, VaultError>,
) -> Result<String, VaultError> {
    let mut candidate = base.to_string();
    let mut counter = 1u32;
    while exists(&candidate)? {
        candidate = format!("{base}{counter}");
        counter += 1;
    }
    Ok(candidate)
}

mod chainops;
mod exports;
mod txops;
