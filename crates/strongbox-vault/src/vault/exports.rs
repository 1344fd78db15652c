//! Account, bin, and transaction bundle export/import.
//!
//! Account bundles let a cosigner reconstruct the full account (bins
//! re-derive from the account's keychains); bin bundles carry the derived
//! branch keychains so a watch-only observer can regenerate exactly the
//! scripts the source vault issues, without learning the account roots.

use super::*;

impl Vault {
    /// Export an account bundle to a file. Private keys are included only
    /// when `export_privkeys` is set, and then only in ciphertext form if
    /// they are encrypted at rest.
    pub fn export_account(
        &self,
        account_name: &str,
        path: impl AsRef<Path>,
        export_privkeys: bool,
    ) -> Result<(), VaultError> {
        trace!(account_name, export_privkeys, "export_account");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;
            let account = store
                .account_by_name(account_name)?
                .ok_or_else(|| VaultError::not_found("account", account_name))?;
            let keychains = self.account_keychains(store, account.id)?;
            let bins = store.bins_of_account(account.id)?;

            let exported = ExportedAccount {
                class_version: CLASS_VERSION,
                name: account.name.clone(),
                minsigs: account.minsigs,
                keychains: keychains
                    .iter()
                    .map(|record| ExportedKeychain::from_record(record, export_privkeys))
                    .collect(),
                unused_pool_size: account.unused_pool_size,
                time_created: account.time_created,
                bins: bins
                    .iter()
                    .map(|bin| ExportedBin {
                        class_version: CLASS_VERSION,
                        name: bin.name.clone(),
                        index: bin.index,
                        next_script_index: bin.next_script_index,
                        minsigs: bin.minsigs,
                        unused_pool_size: account.unused_pool_size,
                        keychains: Vec::new(),
                    })
                    .collect(),
            };
            let bytes = write_bundle(BundleKind::Account, &exported)?;
            std::fs::write(path, bytes)?;
            Ok(())
        })())
    }

    /// Import an account bundle, recreating bins and regenerating their
    /// scripts deterministically. Name collisions get numeric suffixes.
    /// Returns the account name as stored.
    pub fn import_account(&self, path: impl AsRef<Path>) -> Result<String, VaultError> {
        trace!("import_account");
        self.surface((|| {
            let bytes = std::fs::read(path)?;
            let exported: ExportedAccount = read_bundle(&bytes, BundleKind::Account)?;

            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let keychain_hashes: Vec<[u8; 20]> =
                exported.keychains.iter().map(|k| k.hash).collect();
            let account_hash = multisig_set_hash(exported.minsigs, &keychain_hashes);
            if let Some(existing) = store.account_by_hash(&account_hash)? {
                return Err(VaultError::already_exists("account", existing.name));
            }

            let account_name = unique_name(&exported.name, |n| {
                store.account_by_name(n).map(|r| r.is_some())
            })?;

            let mut batch = store.batch();

            // Reuse stored keychains where the hash matches, importing any
            // private material we lack; otherwise persist the bundled one.
            let mut keychains: Vec<KeychainRecord> = Vec::new();
            for bundled in exported.keychains {
                match store.keychain_by_hash(&bundled.hash)? {
                    Some(mut stored) => {
                        if !bundled.privkey_ciphertext.is_empty() && !stored.is_private() {
                            let prev = stored.clone();
                            stored.privkey_ciphertext = bundled.privkey_ciphertext.clone();
                            stored.privkey_salt = bundled.privkey_salt.clone();
                            batch.put_keychain(store, &stored, Some(&prev))?;
                        }
                        keychains.push(stored);
                    }
                    None => {
                        let mut record = bundled.into_record();
                        record.name = unique_name(&record.name, |n| {
                            store.keychain_by_name(n).map(|r| r.is_some())
                        })?;
                        record.id = batch.keychain_id(store)?;
                        batch.put_keychain(store, &record, None)?;
                        keychains.push(record);
                    }
                }
            }

            let account = AccountRecord {
                id: batch.account_id(store)?,
                name: account_name.clone(),
                minsigs: exported.minsigs,
                unused_pool_size: exported.unused_pool_size,
                time_created: exported.time_created,
                hash: account_hash,
            };
            batch.put_account(store, &account, None)?;
            for keychain in &keychains {
                batch.put_account_keychain(store, account.id, keychain.id)?;
            }

            // Rebuild each bin: the first next_script_index scripts were
            // issued by the source, the rest is a fresh lookahead pool.
            for bundled_bin in &exported.bins {
                let mut bin =
                    self.make_bin(store, &mut batch, &account, &keychains, bundled_bin.index, &bundled_bin.name)?;
                bin.next_script_index = bundled_bin.next_script_index;
                let ctx = self.bin_context_from_roots(&keychains, bin.index)?;
                let issued_status = if bin.is_change() {
                    ScriptStatus::Change
                } else {
                    ScriptStatus::Issued
                };
                for _ in 0..bundled_bin.next_script_index {
                    self.derive_script(store, &mut batch, &mut bin, &ctx, issued_status, "")?;
                }
                for _ in 0..account.unused_pool_size {
                    self.derive_script(
                        store,
                        &mut batch,
                        &mut bin,
                        &ctx,
                        Self::pool_status(&bin),
                        "",
                    )?;
                }
                batch.put_account_bin(store, &bin, None)?;
            }

            store.commit(batch)?;
            info!(account = %account_name, "imported account");
            self.emit_all(&[VaultEvent::Updated(vec![account_name.clone()])]);
            Ok(account_name)
        })())
    }

    /// Export one bin with its derived branch keychains, detached from the
    /// account. With a lock key, the branch chain codes are encrypted
    /// under it; otherwise they travel as the vault stores them.
    pub fn export_account_bin(
        &self,
        account_name: &str,
        bin_name: &str,
        export_name: &str,
        path: impl AsRef<Path>,
        lock_key: Option<&[u8]>,
    ) -> Result<(), VaultError> {
        trace!(account_name, bin_name, export_name, "export_account_bin");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;
            let (_account, bin) = self.account_bin(store, account_name, bin_name)?;
            let ctx = self.bin_context(store, &bin)?;

            let mut keychains = Vec::with_capacity(ctx.len());
            for bk in &ctx {
                // Branch keychains are transient derivations; they leave
                // with empty names, like the scripts they will regenerate.
                let mut record = KeychainRecord {
                    id: 0,
                    name: String::new(),
                    depth: bk.hd.depth(),
                    parent_fp: bk.hd.parent_fp(),
                    child_num: bk.hd.child_num(),
                    pubkey: bk.hd.pubkey().to_vec(),
                    chain_code_ciphertext: bk.hd.chain_code().to_vec(),
                    chain_code_salt: Vec::new(),
                    privkey_ciphertext: Vec::new(),
                    privkey_salt: Vec::new(),
                    parent: None,
                    derivation_path: Vec::new(),
                    hash: bk.hd.full_hash(),
                    hidden: true,
                };
                if lock_key.is_some() {
                    record.set_chain_code_lock_key(None, lock_key, None)?;
                }
                keychains.push(ExportedKeychain::from_record(&record, false));
            }

            let pool_size = match bin.account {
                Some(account) => store
                    .account(account)?
                    .map(|a| a.unused_pool_size)
                    .unwrap_or(DEFAULT_UNUSED_POOL_SIZE),
                None => DEFAULT_UNUSED_POOL_SIZE,
            };
            let exported = ExportedBin {
                class_version: CLASS_VERSION,
                name: export_name.to_string(),
                index: 0,
                next_script_index: bin.next_script_index,
                minsigs: bin.minsigs,
                unused_pool_size: pool_size,
                keychains,
            };
            let bytes = write_bundle(BundleKind::AccountBin, &exported)?;
            std::fs::write(path, bytes)?;
            Ok(())
        })())
    }

    /// Import a detached bin. Its branch keychains are stored hidden; the
    /// scripts the source had issued are regenerated as ISSUED, followed
    /// by a fresh lookahead pool. Returns the bin name as stored.
    pub fn import_account_bin(
        &self,
        path: impl AsRef<Path>,
        lock_key: Option<&[u8]>,
    ) -> Result<String, VaultError> {
        trace!("import_account_bin");
        self.surface((|| {
            let bytes = std::fs::read(path)?;
            let exported: ExportedBin = read_bundle(&bytes, BundleKind::AccountBin)?;

            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let keychain_hashes: Vec<[u8; 20]> =
                exported.keychains.iter().map(|k| k.hash).collect();
            let bin_hash = multisig_set_hash(exported.minsigs, &keychain_hashes);
            if store.bin_by_hash(&bin_hash)?.is_some() {
                return Err(VaultError::already_exists("account bin", exported.name));
            }

            let existing_bins = store.account_bins()?;
            let bin_name = unique_name(&exported.name, |n| {
                Ok(existing_bins.iter().any(|bin| bin.name == n))
            })?;

            let mut batch = store.batch();
            let mut keychain_ids = Vec::new();
            let mut keychain_records = Vec::new();
            let mut suffix = 1u32;
            for bundled in exported.keychains {
                match store.keychain_by_hash(&bundled.hash)? {
                    Some(stored) => {
                        keychain_ids.push(stored.id);
                        keychain_records.push(stored);
                    }
                    None => {
                        let mut record = bundled.into_record();
                        record.hidden = true;
                        loop {
                            let candidate = format!("{bin_name}({suffix})");
                            suffix += 1;
                            if store.keychain_by_name(&candidate)?.is_none() {
                                record.name = candidate;
                                break;
                            }
                        }
                        record.id = batch.keychain_id(store)?;
                        batch.put_keychain(store, &record, None)?;
                        keychain_ids.push(record.id);
                        keychain_records.push(record);
                    }
                }
            }

            let mut bin = AccountBinRecord {
                id: batch.account_bin_id(store)?,
                account: None,
                index: 0,
                name: bin_name.clone(),
                script_count: 0,
                next_script_index: exported.next_script_index,
                minsigs: exported.minsigs,
                keychains: keychain_ids,
                hash: bin_hash,
            };

            let mut ctx = Vec::with_capacity(keychain_records.len());
            for record in &keychain_records {
                let unlock = lock_key
                    .map(|k| Zeroizing::new(k.to_vec()))
                    .or_else(|| self.unlock_key_for(&record.name));
                let hd = record.hd_public(unlock.as_deref())?;
                ctx.push(BinKeychain {
                    root_id: record.id,
                    path: Vec::new(),
                    hd,
                    is_private: record.is_private(),
                });
            }

            for _ in 0..exported.next_script_index {
                self.derive_script(store, &mut batch, &mut bin, &ctx, ScriptStatus::Issued, "")?;
            }
            for _ in 0..exported.unused_pool_size {
                self.derive_script(store, &mut batch, &mut bin, &ctx, ScriptStatus::Unused, "")?;
            }
            batch.put_account_bin(store, &bin, None)?;
            store.commit(batch)?;
            info!(bin = %bin_name, "imported account bin");
            Ok(bin_name)
        })())
    }

    /// Export a stored transaction with its labels.
    pub fn export_tx(&self, hash: &Hash256, path: impl AsRef<Path>) -> Result<(), VaultError> {
        trace!(hash = %hash, "export_tx");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;
            let record = match store.tx_by_unsigned_hash(hash)? {
                Some(record) => record,
                None => store
                    .tx_by_hash(hash)?
                    .ok_or_else(|| VaultError::not_found("transaction", hash.to_string()))?,
            };
            let (ins, outs) = self.load_tx_parts(store, &record)?;
            let exported = ExportedTx {
                class_version: CLASS_VERSION,
                version: record.version,
                txins: ins
                    .iter()
                    .map(|txin| ExportedTxIn {
                        class_version: CLASS_VERSION,
                        outhash: txin.outhash,
                        outindex: txin.outindex,
                        script: txin.script.clone(),
                        sequence: txin.sequence,
                    })
                    .collect(),
                txouts: outs
                    .iter()
                    .map(|txout| ExportedTxOut {
                        class_version: CLASS_VERSION,
                        value: txout.value,
                        script: txout.script.clone(),
                        sending_label: txout.sending_label.clone(),
                        receiving_label: txout.receiving_label.clone(),
                    })
                    .collect(),
                locktime: record.locktime,
                timestamp: record.timestamp,
            };
            let bytes = write_bundle(BundleKind::Tx, &exported)?;
            std::fs::write(path, bytes)?;
            Ok(())
        })())
    }

    /// Import a transaction bundle through the normal insertion path.
    pub fn import_tx(&self, path: impl AsRef<Path>) -> Result<Option<TxRecord>, VaultError> {
        trace!("import_tx");
        self.surface((|| {
            let bytes = std::fs::read(path)?;
            let exported: ExportedTx = read_bundle(&bytes, BundleKind::Tx)?;
            let raw = RawTx {
                version: exported.version,
                txins: exported
                    .txins
                    .iter()
                    .map(|txin| RawTxIn {
                        outhash: txin.outhash,
                        outindex: txin.outindex,
                        script: txin.script.clone(),
                        sequence: txin.sequence,
                    })
                    .collect(),
                txouts: exported
                    .txouts
                    .iter()
                    .map(|txout| RawTxOut {
                        value: txout.value,
                        script: txout.script.clone(),
                    })
                    .collect(),
                locktime: exported.locktime,
            };
            self.insert_tx(&raw, exported.timestamp)
        })())
    }
}
