//! Transaction operations: ingestion with signature merging, conflict
//! tracking, creation with coin selection, and signing.

use super::*;

impl Vault {
    ///////////////////
    // TX OPERATIONS //
    ///////////////////

    /// Insert a raw transaction received from a peer or a co-signer.
    ///
    /// Returns the stored transaction if the vault changed, `None` when the
    /// transaction affects no account or adds nothing new.
    pub fn insert_raw_tx(
        &self,
        raw: &[u8],
        timestamp: u32,
    ) -> Result<Option<TxRecord>, VaultError> {
        trace!(len = raw.len(), "insert_raw_tx");
        self.surface((|| {
            let tx = RawTx::parse(raw)?;
            self.insert_tx(&tx, timestamp)
        })())
    }

    /// Insert a parsed transaction. Propagated status is assumed for
    /// fully signed transactions; unsigned ones enter as UNSIGNED.
    pub fn insert_tx(&self, raw: &RawTx, timestamp: u32) -> Result<Option<TxRecord>, VaultError> {
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let mut batch = store.batch();
            let (record, events) =
                self.insert_tx_impl(store, &mut batch, raw, timestamp, TxStatus::Propagated)?;
            if record.is_some() {
                store.commit(batch)?;
                self.emit_all(&events);
            }
            Ok(record)
        })())
    }

    /// Build an unsigned transaction spending the account's coins.
    ///
    /// Inputs are chosen by random selection over the account's unspent
    /// outputs; change returns to the `@change` bin through a freshly
    /// issued script; input and output order is shuffled. Returns the raw
    /// unsigned transaction.
    pub fn create_raw_tx(
        &self,
        account_name: &str,
        recipients: &[Recipient],
        fee: u64,
        version: u32,
        locktime: u32,
    ) -> Result<Vec<u8>, VaultError> {
        trace!(account_name, recipients = recipients.len(), fee, "create_raw_tx");
        self.surface((|| {
            if recipients.is_empty() {
                return Err(TxError::InvalidTx("no recipients".into()).into());
            }
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let account = store
                .account_by_name(account_name)?
                .ok_or_else(|| VaultError::not_found("account", account_name))?;

            let mut desired = fee;
            for recipient in recipients {
                desired = desired
                    .checked_add(recipient.value)
                    .ok_or_else(|| TxError::InvalidTx("value overflow".into()))?;
            }

            // Spendable outputs: unspent, owned by the account, and on a
            // transaction that is signed and not doomed.
            let mut utxos = Vec::new();
            let mut available: u64 = 0;
            for txout in store.txouts()? {
                if txout.receiving_account != Some(account.id)
                    || txout.status != TxOutStatus::Unspent
                    || txout.signingscript.is_none()
                {
                    continue;
                }
                let Some(tx) = store.tx(txout.tx)? else { continue };
                let Some(tx_hash) = tx.hash else { continue };
                if matches!(tx.status, TxStatus::Conflicting | TxStatus::Canceled) {
                    continue;
                }
                available = available.saturating_add(txout.value);
                utxos.push((tx_hash, txout));
            }
            utxos.shuffle(&mut rand::thread_rng());

            let mut txins = Vec::new();
            let mut total: u64 = 0;
            for (tx_hash, txout) in &utxos {
                let script = txout
                    .signingscript
                    .and_then(|id| store.signing_script(id).transpose())
                    .transpose()?
                    .ok_or_else(|| VaultError::Storage("dangling signing script".into()))?;
                txins.push(RawTxIn {
                    outhash: *tx_hash,
                    outindex: txout.txindex,
                    script: script.txinscript.clone(),
                    sequence: FINAL_SEQUENCE,
                });
                total = total.saturating_add(txout.value);
                if total >= desired {
                    break;
                }
            }
            if total < desired {
                return Err(VaultError::InsufficientFunds {
                    account: account_name.to_string(),
                    have: available,
                    need: desired,
                });
            }

            let mut txouts: Vec<RawTxOut> = recipients
                .iter()
                .map(|recipient| RawTxOut {
                    value: recipient.value,
                    script: recipient.txoutscript.clone(),
                })
                .collect();

            let change = total - desired;
            let mut batch = store.batch();
            if change > 0 {
                let (_account, mut bin) =
                    self.account_bin(store, account_name, CHANGE_BIN_NAME)?;
                let change_script = self.issue_script(store, &mut batch, &mut bin, "")?;
                batch.put_account_bin(store, &bin, None)?;
                txouts.push(RawTxOut {
                    value: change,
                    script: change_script.txoutscript,
                });
            }

            txins.shuffle(&mut rand::thread_rng());
            txouts.shuffle(&mut rand::thread_rng());

            let tx = RawTx {
                version,
                txins,
                txouts,
                locktime,
            };
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(vec![account_name.to_string()])]);
            Ok(tx.serialize())
        })())
    }

    /// Sign a raw transaction with every unlocked keychain that can
    /// contribute, inserting it first if it is not yet stored.
    ///
    /// Returns the updated raw transaction and its stored record; the
    /// transaction transitions UNSIGNED → UNSENT once the last signature
    /// lands.
    pub fn sign_raw_tx(&self, raw: &[u8], timestamp: u32) -> Result<(Vec<u8>, TxRecord), VaultError> {
        trace!(len = raw.len(), "sign_raw_tx");
        self.surface((|| {
            let parsed = RawTx::parse(raw)?;
            let unsigned_hash = parsed.unsigned_txid();

            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            // Insert (or merge) first so the signing pass always works
            // against committed state.
            let mut record = match store.tx_by_unsigned_hash(&unsigned_hash)? {
                Some(record) => record,
                None => {
                    let mut batch = store.batch();
                    let (inserted, insert_events) = self.insert_tx_impl(
                        store,
                        &mut batch,
                        &parsed,
                        timestamp,
                        TxStatus::Propagated,
                    )?;
                    let record = inserted.ok_or_else(|| {
                        VaultError::not_found("transaction", unsigned_hash.to_string())
                    })?;
                    store.commit(batch)?;
                    self.emit_all(&insert_events);
                    record
                }
            };

            let (mut ins, outs) = self.load_tx_parts(store, &record)?;
            let mut batch = store.batch();
            let sigs_added = self.sign_tx_impl(store, &mut batch, &mut record, &mut ins)?;
            if sigs_added > 0 {
                store.commit(batch)?;
                self.emit_all(&[VaultEvent::Updated(self.tx_account_names(store, &outs)?)]);
            }

            let raw_out = self.raw_from_parts(&record, &ins, &outs).serialize();
            Ok((raw_out, record))
        })())
    }

    /// Sign a stored transaction identified by its unsigned hash.
    pub fn sign_tx(&self, unsigned_hash: &Hash256) -> Result<Option<TxRecord>, VaultError> {
        trace!(unsigned_hash = %unsigned_hash, "sign_tx");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let mut record = store.tx_by_unsigned_hash(unsigned_hash)?.ok_or_else(|| {
                VaultError::not_found("transaction", unsigned_hash.to_string())
            })?;
            let (mut ins, outs) = self.load_tx_parts(store, &record)?;
            let mut batch = store.batch();
            let sigs_added = self.sign_tx_impl(store, &mut batch, &mut record, &mut ins)?;
            if sigs_added == 0 {
                return Ok(None);
            }
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(self.tx_account_names(store, &outs)?)]);
            Ok(Some(record))
        })())
    }

    /// Look up a transaction by signed or unsigned hash, returning the
    /// record and its raw serialization.
    pub fn get_tx(&self, hash: &Hash256) -> Result<(TxRecord, Vec<u8>), VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let record = match store.tx_by_unsigned_hash(hash)? {
            Some(record) => record,
            None => store
                .tx_by_hash(hash)?
                .ok_or_else(|| VaultError::not_found("transaction", hash.to_string()))?,
        };
        let (ins, outs) = self.load_tx_parts(store, &record)?;
        let raw = self.raw_from_parts(&record, &ins, &outs).serialize();
        Ok((record, raw))
    }

    /// Delete a transaction, unlinking any outputs it spent.
    pub fn delete_tx(&self, hash: &Hash256) -> Result<(), VaultError> {
        trace!(hash = %hash, "delete_tx");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let record = match store.tx_by_unsigned_hash(hash)? {
                Some(record) => record,
                None => store
                    .tx_by_hash(hash)?
                    .ok_or_else(|| VaultError::not_found("transaction", hash.to_string()))?,
            };
            let (ins, outs) = self.load_tx_parts(store, &record)?;
            let txin_ids: BTreeSet<Id> = ins.iter().map(|txin| txin.id).collect();

            let mut batch = store.batch();
            // Outputs this transaction spent become unspent again.
            for mut txout in store.txouts()? {
                if txout
                    .spent_by
                    .is_some_and(|spender| txin_ids.contains(&spender))
                {
                    txout.set_spent(None);
                    batch.put_txout(store, &txout)?;
                }
            }
            for txin in &ins {
                batch.delete_txin(store, txin)?;
            }
            for txout in &outs {
                batch.delete_txout(store, txout.id)?;
            }
            batch.delete_tx(store, &record)?;
            store.commit(batch)?;
            self.emit_all(&[VaultEvent::Updated(self.tx_account_names(store, &outs)?)]);
            Ok(())
        })())
    }

    /// What a co-signer needs to finish an unsigned transaction.
    pub fn get_signing_request(
        &self,
        unsigned_hash: &Hash256,
        include_raw_tx: bool,
    ) -> Result<SigningRequest, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let record = store.tx_by_unsigned_hash(unsigned_hash)?.ok_or_else(|| {
            VaultError::not_found("transaction", unsigned_hash.to_string())
        })?;
        let (ins, outs) = self.load_tx_parts(store, &record)?;
        let raw = self.raw_from_parts(&record, &ins, &outs);

        let sigs_needed = raw.missing_sig_count();
        let missing = raw.missing_sig_pubkeys();
        let mut keychains = BTreeMap::new();
        for key in store.keys()? {
            if !missing.contains(&key.pubkey) {
                continue;
            }
            if let Some(root) = store.keychain(key.root_keychain)? {
                keychains.insert(root.name.clone(), root.hash);
            }
        }
        Ok(SigningRequest {
            sigs_needed,
            keychains: keychains.into_iter().collect(),
            raw_tx: if include_raw_tx { raw.serialize() } else { Vec::new() },
        })
    }

    /// Outputs joined to accounts, bins, scripts, and confirming blocks.
    /// Outputs with both roles appear once per role.
    pub fn txout_views(
        &self,
        account_name: Option<&str>,
        hide_change: bool,
    ) -> Result<Vec<TxOutView>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let accounts: HashMap<Id, AccountRecord> =
            store.accounts()?.into_iter().map(|a| (a.id, a)).collect();
        let bins: HashMap<Id, AccountBinRecord> =
            store.account_bins()?.into_iter().map(|b| (b.id, b)).collect();
        let headers: HashMap<Id, u32> = store
            .block_headers()?
            .into_iter()
            .map(|h| (h.id, h.height))
            .collect();
        let txs: HashMap<Id, TxRecord> = store.txs()?.into_iter().map(|t| (t.id, t)).collect();

        let mut views = Vec::new();
        for txout in store.txouts()? {
            let Some(tx) = txs.get(&txout.tx) else { continue };
            let block_height = tx.blockheader.and_then(|id| headers.get(&id)).copied();

            if let Some(account_id) = txout.receiving_account {
                let bin = txout.account_bin.and_then(|id| bins.get(&id));
                let is_change = bin.is_some_and(AccountBinRecord::is_change);
                if let Some(account) = accounts.get(&account_id) {
                    if !(hide_change && is_change)
                        && account_name.map_or(true, |n| n == account.name)
                    {
                        views.push(TxOutView {
                            txout_id: txout.id,
                            role: TxOutRole::Receiver,
                            account_id,
                            account_name: account.name.clone(),
                            bin_name: bin.map(|b| b.name.clone()),
                            label: txout.receiving_label.clone(),
                            value: txout.value,
                            script: txout.script.clone(),
                            status: txout.status,
                            tx_id: tx.id,
                            tx_unsigned_hash: tx.unsigned_hash,
                            tx_hash: tx.hash,
                            tx_status: tx.status,
                            tx_timestamp: tx.timestamp,
                            txindex: txout.txindex,
                            fee: tx.fee,
                            block_height,
                        });
                    }
                }
            }
            if let Some(account_id) = txout.sending_account {
                if let Some(account) = accounts.get(&account_id) {
                    if account_name.map_or(true, |n| n == account.name) {
                        views.push(TxOutView {
                            txout_id: txout.id,
                            role: TxOutRole::Sender,
                            account_id,
                            account_name: account.name.clone(),
                            bin_name: None,
                            label: txout.sending_label.clone(),
                            value: txout.value,
                            script: txout.script.clone(),
                            status: txout.status,
                            tx_id: tx.id,
                            tx_unsigned_hash: tx.unsigned_hash,
                            tx_hash: tx.hash,
                            tx_status: tx.status,
                            tx_timestamp: tx.timestamp,
                            txindex: txout.txindex,
                            fee: tx.fee,
                            block_height,
                        });
                    }
                }
            }
        }
        views.sort_by_key(|view| (view.tx_id, view.txindex));
        Ok(views)
    }

    // --- internal transaction machinery ---

    pub(super) fn load_tx_parts(
        &self,
        store: &Store,
        tx: &TxRecord,
    ) -> Result<(Vec<TxInRecord>, Vec<TxOutRecord>), VaultError> {
        let mut ins = Vec::with_capacity(tx.txins.len());
        for id in &tx.txins {
            ins.push(
                store
                    .txin(*id)?
                    .ok_or_else(|| VaultError::Storage(format!("dangling txin id {id}")))?,
            );
        }
        ins.sort_by_key(|txin| txin.txindex);
        let mut outs = Vec::with_capacity(tx.txouts.len());
        for id in &tx.txouts {
            outs.push(
                store
                    .txout(*id)?
                    .ok_or_else(|| VaultError::Storage(format!("dangling txout id {id}")))?,
            );
        }
        outs.sort_by_key(|txout| txout.txindex);
        Ok((ins, outs))
    }

    pub(super) fn raw_from_parts(
        &self,
        tx: &TxRecord,
        ins: &[TxInRecord],
        outs: &[TxOutRecord],
    ) -> RawTx {
        RawTx {
            version: tx.version,
            txins: ins
                .iter()
                .map(|txin| RawTxIn {
                    outhash: txin.outhash,
                    outindex: txin.outindex,
                    script: txin.script.clone(),
                    sequence: txin.sequence,
                })
                .collect(),
            txouts: outs
                .iter()
                .map(|txout| RawTxOut {
                    value: txout.value,
                    script: txout.script.clone(),
                })
                .collect(),
            locktime: tx.locktime,
        }
    }

    pub(super) fn tx_account_names(
        &self,
        store: &Store,
        outs: &[TxOutRecord],
    ) -> Result<Vec<String>, VaultError> {
        let mut ids = BTreeSet::new();
        for txout in outs {
            ids.extend(txout.receiving_account);
            ids.extend(txout.sending_account);
        }
        let mut names = Vec::new();
        for id in ids {
            if let Some(account) = store.account(id)? {
                names.push(account.name);
            }
        }
        Ok(names)
    }

    /// The insertion state machine. See the merge rules in the module
    /// docs: duplicates by unsigned hash merge signatures or upgrade
    /// status; fresh transactions link scripts, spent outputs, and
    /// conflicts.
    pub(super) fn insert_tx_impl(
        &self,
        store: &Store,
        batch: &mut Batch,
        raw: &RawTx,
        timestamp: u32,
        status_hint: TxStatus,
    ) -> Result<(Option<TxRecord>, Vec<VaultEvent>), VaultError> {
        let unsigned_hash = raw.unsigned_txid();
        let candidate_signed = raw.missing_sig_count() == 0;
        let mut events = Vec::new();

        if let Some(mut stored) = store.tx_by_unsigned_hash(&unsigned_hash)? {
            let (mut ins, outs) = self.load_tx_parts(store, &stored)?;
            if ins.len() != raw.txins.len() {
                return Err(TxError::InvalidTx("input count mismatch for stored tx".into()).into());
            }
            let prev = stored.clone();

            if stored.status == TxStatus::Unsigned {
                if candidate_signed {
                    // A signed rendering of a transaction we hold
                    // unsigned: take its scripts wholesale.
                    debug!(unsigned_hash = %unsigned_hash, "replacing unsigned tx with signed rendering");
                    for (txin, raw_txin) in ins.iter_mut().zip(&raw.txins) {
                        txin.script = raw_txin.script.clone();
                        batch.put_txin(store, txin)?;
                    }
                    if stored.status < TxStatus::Propagated {
                        stored.timestamp = timestamp;
                    }
                    let updated_raw = self.raw_from_parts(&stored, &ins, &outs);
                    stored.update_status(&updated_raw, Some(status_hint));
                    self.confirm_from_merkle_blocks(store, &mut stored)?;
                    batch.put_tx(store, &stored, Some(&prev))?;
                    events.push(VaultEvent::Updated(self.tx_account_names(store, &outs)?));
                    return Ok((Some(stored), events));
                }

                // Both unsigned: merge any new signatures into empty
                // slots. Signatures for unknown pubkey sets are rejected.
                let mut merged_any = false;
                for (txin, raw_txin) in ins.iter_mut().zip(&raw.txins) {
                    let (Ok(mut ours), Ok(theirs)) =
                        (Script::parse(&txin.script), Script::parse(&raw_txin.script))
                    else {
                        continue;
                    };
                    // Signatures attached to a different pubkey set are
                    // dropped rather than recorded.
                    let Ok(added) = ours.merge_sigs(&theirs) else {
                        warn!(txindex = txin.txindex, "incompatible signature script ignored");
                        continue;
                    };
                    if added > 0 {
                        debug!(added, txindex = txin.txindex, "merged signatures into input");
                        txin.script = ours.txinscript(SigFormat::Edit);
                        batch.put_txin(store, txin)?;
                        merged_any = true;
                    }
                }
                if !merged_any {
                    return Ok((None, events));
                }
                if stored.status < TxStatus::Propagated {
                    stored.timestamp = timestamp;
                }
                let updated_raw = self.raw_from_parts(&stored, &ins, &outs);
                stored.update_status(&updated_raw, None);
                batch.put_tx(store, &stored, Some(&prev))?;
                events.push(VaultEvent::Updated(self.tx_account_names(store, &outs)?));
                return Ok((Some(stored), events));
            }

            // Stored transaction is signed; only a status upgrade can
            // apply.
            if candidate_signed && status_hint > stored.status {
                let stored_raw = self.raw_from_parts(&stored, &ins, &outs);
                stored.update_status(&stored_raw, Some(status_hint));
                batch.put_tx(store, &stored, Some(&prev))?;
                events.push(VaultEvent::Updated(self.tx_account_names(store, &outs)?));
                return Ok((Some(stored), events));
            }
            debug!(unsigned_hash = %unsigned_hash, "duplicate tx adds nothing");
            return Ok((None, events));
        }

        // A transaction we have never seen. Work out what it touches.
        let mut conflicting_txs: BTreeSet<Id> = BTreeSet::new();
        let mut spent_outpoints: Vec<(TxOutRecord, usize)> = Vec::new();
        let mut sent_from_vault = false;
        let mut have_all_outpoints = true;
        let mut input_total: u64 = 0;
        let mut sending_account: Option<Id> = None;

        for (i, txin) in raw.txins.iter().enumerate() {
            let Some(funding_tx) = store.tx_by_hash(&txin.outhash)? else {
                have_all_outpoints = false;
                continue;
            };
            let outpoint_id = *funding_tx
                .txouts
                .get(txin.outindex as usize)
                .ok_or_else(|| TxError::InvalidTx("outpoint out of range".into()))?;
            let outpoint = store
                .txout(outpoint_id)?
                .ok_or_else(|| VaultError::Storage("dangling txout id".into()))?;

            if let Some(spender) = outpoint.spent_by {
                let spender_txin = store
                    .txin(spender)?
                    .ok_or_else(|| VaultError::Storage("dangling txin id".into()))?;
                debug!(outhash = %txin.outhash, outindex = txin.outindex, "double spend detected");
                conflicting_txs.insert(spender_txin.tx);
            }
            input_total = input_total.saturating_add(outpoint.value);

            if let Some(script) = store.script_by_txoutscript(&outpoint.script)? {
                sent_from_vault = true;
                if sending_account.is_none() && script.account != 0 {
                    sending_account = Some(script.account);
                }
                spent_outpoints.push((outpoint, i));
            }
        }

        // Outputs: link any that pay to scripts we watch.
        let mut sent_to_vault = false;
        let mut output_total: u64 = 0;
        let mut out_records: Vec<TxOutRecord> = Vec::with_capacity(raw.txouts.len());
        let mut affected_accounts: BTreeSet<Id> = BTreeSet::new();
        if let Some(account) = sending_account {
            affected_accounts.insert(account);
        }
        // Bin working sets so repeated matches against one bin compose.
        let mut touched_bins: HashMap<Id, (AccountBinRecord, Vec<SigningScriptRecord>)> =
            HashMap::new();

        for (j, txout) in raw.txouts.iter().enumerate() {
            output_total = output_total.saturating_add(txout.value);
            let mut record = TxOutRecord {
                id: 0,
                tx: 0,
                txindex: j as u32,
                value: txout.value,
                script: txout.script.clone(),
                spent_by: None,
                sending_account,
                sending_label: String::new(),
                receiving_account: None,
                receiving_label: String::new(),
                account_bin: None,
                signingscript: None,
                status: TxOutStatus::Unspent,
            };
            if let Some(script) = store.script_by_txoutscript(&txout.script)? {
                sent_to_vault = true;
                // Detached (imported) bins have no account behind them.
                if script.account != 0 {
                    record.receiving_account = Some(script.account);
                    affected_accounts.insert(script.account);
                }
                record.receiving_label = script.label.clone();
                record.account_bin = Some(script.account_bin);
                record.signingscript = Some(script.id);
                self.mark_script_seen(store, batch, &mut touched_bins, script, sent_from_vault)?;
            }
            out_records.push(record);
        }

        if !(sent_from_vault || sent_to_vault) {
            debug!(unsigned_hash = %unsigned_hash, "transaction does not affect the vault");
            return Ok((None, events));
        }

        let mut record = TxRecord {
            id: batch.tx_id(store)?,
            hash: candidate_signed.then(|| raw.txid()),
            unsigned_hash,
            version: raw.version,
            locktime: raw.locktime,
            timestamp,
            status: if candidate_signed {
                status_hint
            } else {
                TxStatus::Unsigned
            },
            fee: have_all_outpoints
                .then(|| input_total.checked_sub(output_total))
                .flatten(),
            blockheader: None,
            blockindex: None,
            txins: Vec::new(),
            txouts: Vec::new(),
        };

        // The newcomer takes the CONFLICTING status; the transaction that
        // was here first keeps its state until a confirmation settles the
        // race.
        if !conflicting_txs.is_empty() && candidate_signed {
            record.status = TxStatus::Conflicting;
        }

        // Persist inputs, outputs, and the spent links.
        for (i, txin) in raw.txins.iter().enumerate() {
            let txin_record = TxInRecord {
                id: batch.txin_id(store)?,
                tx: record.id,
                txindex: i as u32,
                outhash: txin.outhash,
                outindex: txin.outindex,
                script: txin.script.clone(),
                sequence: txin.sequence,
            };
            batch.put_txin(store, &txin_record)?;
            record.txins.push(txin_record.id);
            for (outpoint, input_idx) in &mut spent_outpoints {
                if *input_idx == i {
                    outpoint.set_spent(Some(txin_record.id));
                }
            }
        }
        for mut out_record in out_records {
            out_record.id = batch.txout_id(store)?;
            out_record.tx = record.id;
            // Out-of-order insertion: an owned output may already be
            // spent by a stored input.
            if out_record.signingscript.is_some() {
                if let Some(tx_hash) = &record.hash {
                    if let Some(spender) = store
                        .txins_spending(tx_hash, out_record.txindex)?
                        .first()
                    {
                        out_record.set_spent(Some(*spender));
                    }
                }
            }
            batch.put_txout(store, &out_record)?;
            record.txouts.push(out_record.id);
        }
        for (outpoint, _) in &spent_outpoints {
            batch.put_txout(store, outpoint)?;
        }
        for (bin, _) in touched_bins.values() {
            batch.put_account_bin(store, bin, None)?;
        }

        if record.status >= TxStatus::Sent {
            self.confirm_from_merkle_blocks(store, &mut record)?;
        }
        batch.put_tx(store, &record, None)?;

        info!(
            unsigned_hash = %unsigned_hash,
            status = %record.status,
            "inserted transaction"
        );
        events.push(VaultEvent::NewTx(unsigned_hash));
        let mut names = Vec::new();
        for id in affected_accounts {
            if let Some(account) = store.account(id)? {
                names.push(account.name);
            }
        }
        events.push(VaultEvent::Updated(names));
        Ok((Some(record), events))
    }

    /// A watched script appeared in an output: advance its status, move
    /// the bin pointer past it, and refill the pool.
    fn mark_script_seen(
        &self,
        store: &Store,
        batch: &mut Batch,
        touched_bins: &mut HashMap<Id, (AccountBinRecord, Vec<SigningScriptRecord>)>,
        script: SigningScriptRecord,
        sent_from_vault: bool,
    ) -> Result<(), VaultError> {
        let bin_id = script.account_bin;
        if !touched_bins.contains_key(&bin_id) {
            let bin = store
                .account_bin(bin_id)?
                .ok_or_else(|| VaultError::Storage("dangling account bin id".into()))?;
            let scripts = store.scripts_of_bin(bin_id)?;
            touched_bins.insert(bin_id, (bin, scripts));
        }
        let (bin, scripts) = touched_bins
            .get_mut(&bin_id)
            .expect("inserted above");

        let Some(entry) = scripts.iter_mut().find(|s| s.id == script.id) else {
            return Ok(());
        };
        let was_pooled = entry.status == Self::pool_status(bin);
        entry.status = match entry.status {
            ScriptStatus::Unused => {
                if sent_from_vault && bin.is_change() {
                    ScriptStatus::Change
                } else {
                    ScriptStatus::Used
                }
            }
            ScriptStatus::Change => {
                if sent_from_vault {
                    ScriptStatus::Change
                } else {
                    ScriptStatus::Used
                }
            }
            ScriptStatus::Issued | ScriptStatus::Used => ScriptStatus::Used,
        };
        batch.put_signing_script(store, entry)?;
        bin.mark_script_issued(script.index);

        if was_pooled {
            let pool_size = match bin.account {
                Some(account) => store
                    .account(account)?
                    .map(|a| a.unused_pool_size)
                    .unwrap_or(DEFAULT_UNUSED_POOL_SIZE),
                None => DEFAULT_UNUSED_POOL_SIZE,
            };
            match self.bin_context(store, bin) {
                Ok(ctx) => {
                    let (bin, scripts) = touched_bins.get_mut(&bin_id).expect("inserted above");
                    self.refill_bin(store, batch, bin, &ctx, scripts, pool_size)?;
                }
                Err(VaultError::Locked { keychain, .. }) => {
                    debug!(keychain = %keychain, "chain code locked, pool cannot be replenished");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Attach a stored merkle block's confirmation to a signed
    /// transaction, if one matches. The caller persists the record.
    pub(super) fn confirm_from_merkle_blocks(
        &self,
        store: &Store,
        tx: &mut TxRecord,
    ) -> Result<bool, VaultError> {
        let Some(hash) = tx.hash else {
            return Ok(false);
        };
        if tx.blockheader.is_some() {
            return Ok(false);
        }
        for mb in store.merkle_blocks()? {
            if let Some(pos) = mb.hashes.iter().position(|h| *h == hash) {
                tx.set_blockheader(Some(mb.blockheader), Some(pos as u32));
                debug!(hash = %hash, "transaction confirmed from stored merkle block");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sign as many inputs as the unlocked keychains allow. Returns the
    /// number of signatures added; the caller persists nothing if zero.
    pub(super) fn sign_tx_impl(
        &self,
        store: &Store,
        batch: &mut Batch,
        tx: &mut TxRecord,
        ins: &mut [TxInRecord],
    ) -> Result<u32, VaultError> {
        let (_, outs) = self.load_tx_parts(store, tx)?;
        let mut raw = self.raw_from_parts(tx, ins, &outs);

        // Private keys by pubkey, across all derived keys.
        let mut keys_by_pubkey: HashMap<Vec<u8>, KeyRecord> = HashMap::new();
        for key in store.keys()? {
            if key.is_private {
                keys_by_pubkey.insert(key.pubkey.clone(), key);
            }
        }

        let mut sigs_added = 0;
        for i in 0..ins.len() {
            let Ok(mut script) = Script::parse(&ins[i].script) else {
                continue;
            };
            if script.sigs_needed() == 0 {
                continue;
            }
            let missing = script.missing_sig_pubkeys();
            if !missing.iter().any(|pk| keys_by_pubkey.contains_key(pk)) {
                continue;
            }

            let sighash = raw.signing_hash(i, &script.txinscript(SigFormat::Sign))?;
            for pubkey in &missing {
                let Some(key) = keys_by_pubkey.get(pubkey) else {
                    continue;
                };
                let Some(root) = store.keychain(key.root_keychain)? else {
                    continue;
                };
                let unlock = self.unlock_key_for(&root.name);
                let hd = match root.hd_keychain(unlock.as_deref()) {
                    Ok(hd) if hd.is_private() => hd,
                    Ok(_) | Err(VaultError::Locked { .. }) => {
                        debug!(keychain = %root.name, "keychain locked, skipping signature");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let privkey = hd.signing_privkey(&key.derivation_path, key.index)?;
                let derived = crypto::pubkey_for_privkey(privkey.as_ref())?;
                if derived.as_slice() != key.pubkey.as_slice() {
                    return Err(strongbox_core::error::KeychainError::InvalidKey(
                        "derived public key does not match stored key".into(),
                    )
                    .into());
                }
                let mut signature = crypto::sign_der(privkey.as_ref(), sighash.as_bytes())?;
                signature.push(SIGHASH_ALL);
                if script.add_sig(&key.pubkey, signature) {
                    debug!(txindex = ins[i].txindex, keychain = %root.name, "signed input");
                    sigs_added += 1;
                }
                if script.sigs_needed() == 0 {
                    break;
                }
            }

            let format = if script.sigs_needed() > 0 {
                SigFormat::Edit
            } else {
                SigFormat::Broadcast
            };
            ins[i].script = script.txinscript(format);
            raw.txins[i].script = ins[i].script.clone();
            batch.put_txin(store, &ins[i])?;
        }

        if sigs_added > 0 {
            let prev = tx.clone();
            tx.update_status(&raw, None);
            batch.put_tx(store, tx, Some(&prev))?;
            info!(
                unsigned_hash = %tx.unsigned_hash,
                sigs_added,
                status = %tx.status,
                "signing pass complete"
            );
        }
        Ok(sigs_added)
    }
}
