//! Chain operations: header ingestion with reorg handling, merkle-block
//! confirmation, locators, and the bloom filter synthesized over watched
//! scripts and outpoints.

use super::*;

impl Vault {
    //////////////////////
    // BLOCK OPERATIONS //
    //////////////////////

    /// Insert a full block: its transactions run through the normal
    /// insertion path, then the header confirms whichever of them the
    /// vault holds.
    pub fn insert_block(&self, block: &Block, timestamp: u32) -> Result<Option<u32>, VaultError> {
        trace!(hash = %block.header.hash(), txs = block.txs.len(), "insert_block");
        self.surface((|| {
            for tx in &block.txs {
                // Transactions that do not touch the vault fall out here.
                self.insert_tx(tx, timestamp)?;
            }
            self.insert_merkle_block(&block.to_merkle_block())
        })())
    }

    /// Insert a merkle block.
    ///
    /// The header must extend a stored header by prevhash, or be the
    /// genesis header on an empty chain. A header landing on an occupied
    /// height reorganizes: every header at or above it is removed (its
    /// transactions drop back to PROPAGATED) before the new branch
    /// applies. Returns the assigned height, or `None` if the block could
    /// not be connected or was already present.
    pub fn insert_merkle_block(&self, mb: &MerkleBlock) -> Result<Option<u32>, VaultError> {
        let hash = mb.header.hash();
        trace!(hash = %hash, "insert_merkle_block");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let previous_best = store.best_height()?;
            let height = if store.block_count()? == 0 {
                if !mb.header.is_genesis() {
                    debug!(hash = %hash, "first header must be genesis");
                    return Ok(None);
                }
                0
            } else {
                if store.header_by_hash(&hash)?.is_some() {
                    debug!(hash = %hash, "already have block");
                    return Ok(None);
                }
                let Some(parent) = store.header_by_hash(&mb.header.prevhash)? else {
                    debug!(hash = %hash, "could not connect block");
                    return Ok(None);
                };
                parent.height + 1
            };

            let mut batch = store.batch();
            let mut events = Vec::new();

            // Transactions unconfirmed by the reorg, staged but not yet
            // visible through the store.
            let mut detached: HashMap<Id, TxRecord> = HashMap::new();
            let reorg_depth = self.detach_headers_at_or_above(
                store,
                &mut batch,
                height,
                &mut events,
                &mut detached,
            )?;
            if reorg_depth > 0 {
                info!(height, reorg_depth, "chain reorganization");
            }

            let header_record = BlockHeaderRecord {
                id: batch.block_header_id(store)?,
                hash,
                height,
                version: mb.header.version,
                prevhash: mb.header.prevhash,
                merkleroot: mb.header.merkleroot,
                timestamp: mb.header.timestamp,
                bits: mb.header.bits,
                nonce: mb.header.nonce,
            };
            batch.put_block_header(store, &header_record)?;
            let mb_record = MerkleBlockRecord {
                id: batch.merkle_block_id(store)?,
                blockheader: header_record.id,
                txcount: mb.txcount,
                hashes: mb.hashes.clone(),
                flags: mb.flags.clone(),
            };
            batch.put_merkle_block(store, &mb_record)?;

            // Confirm matching transactions at their position in the
            // matched-hash list.
            for (pos, tx_hash) in mb.hashes.iter().enumerate() {
                let Some(mut tx) = store.tx_by_hash(tx_hash)? else {
                    continue;
                };
                if let Some(staged) = detached.get(&tx.id) {
                    tx = staged.clone();
                }
                if tx.blockheader.is_some() {
                    warn!(tx_hash = %tx_hash, "transaction appears in more than one block");
                    return Err(VaultError::InvalidMerkleBlock {
                        hash: hash.to_string(),
                        height,
                    });
                }
                debug!(tx_hash = %tx_hash, height, "confirming transaction");
                let prev = tx.clone();
                tx.set_blockheader(Some(header_record.id), Some(pos as u32));
                batch.put_tx(store, &tx, Some(&prev))?;
                let (_, outs) = self.load_tx_parts(store, &prev)?;
                events.push(VaultEvent::Updated(self.tx_account_names(store, &outs)?));
                self.resolve_confirmed_conflicts(store, &mut batch, &tx, &mut events)?;
            }

            store.commit(batch)?;
            info!(hash = %hash, height, "connected block");

            events.push(VaultEvent::NewBlock(hash, height));
            if previous_best.map_or(true, |best| height > best) {
                events.push(VaultEvent::UpdateSyncHeight(height));
            }
            self.emit_all(&events);
            Ok(Some(height))
        })())
    }

    /// Remove the merkle block with the given header hash and everything
    /// above it, detaching confirmations so the chain stays contiguous.
    /// Returns the number of headers removed.
    pub fn delete_merkle_block(&self, hash: &Hash256) -> Result<u32, VaultError> {
        trace!(hash = %hash, "delete_merkle_block");
        self.surface((|| {
            let _w = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let header = store
                .header_by_hash(hash)?
                .ok_or_else(|| VaultError::not_found("block header", hash.to_string()))?;
            let mut batch = store.batch();
            let mut events = Vec::new();
            let mut detached = HashMap::new();
            let count = self.detach_headers_at_or_above(
                store,
                &mut batch,
                header.height,
                &mut events,
                &mut detached,
            )?;
            store.commit(batch)?;
            self.emit_all(&events);
            Ok(count)
        })())
    }

    /// Delete every header at or above `height`, dropping its merkle
    /// blocks and unconfirming its transactions. Highest first, so a
    /// partial failure cannot orphan a prefix.
    fn detach_headers_at_or_above(
        &self,
        store: &Store,
        batch: &mut Batch,
        height: u32,
        events: &mut Vec<VaultEvent>,
        detached: &mut HashMap<Id, TxRecord>,
    ) -> Result<u32, VaultError> {
        let mut count = 0;
        for header in store.headers_at_or_above(height)? {
            debug!(hash = %header.hash, height = header.height, "detaching block");
            for mut tx in store.txs()? {
                if tx.blockheader != Some(header.id) {
                    continue;
                }
                debug!(unsigned_hash = %tx.unsigned_hash, "unconfirming transaction");
                let prev = tx.clone();
                tx.set_blockheader(None, None);
                batch.put_tx(store, &tx, Some(&prev))?;
                let (_, outs) = self.load_tx_parts(store, &tx)?;
                events.push(VaultEvent::Updated(self.tx_account_names(store, &outs)?));
                detached.insert(tx.id, tx);
            }
            for mb in store.merkle_blocks_of_header(header.id)? {
                batch.delete_merkle_block(store, &mb)?;
            }
            batch.delete_block_header(store, &header)?;
            count += 1;
        }
        Ok(count)
    }

    /// Confirmation of one transaction cancels the losers of its
    /// conflicts.
    fn resolve_confirmed_conflicts(
        &self,
        store: &Store,
        batch: &mut Batch,
        confirmed: &TxRecord,
        events: &mut Vec<VaultEvent>,
    ) -> Result<(), VaultError> {
        let (ins, _) = self.load_tx_parts(store, confirmed)?;
        let txin_ids: BTreeSet<Id> = ins.iter().map(|txin| txin.id).collect();
        for txin in &ins {
            for rival_txin_id in store.txins_spending(&txin.outhash, txin.outindex)? {
                if txin_ids.contains(&rival_txin_id) {
                    continue;
                }
                let Some(rival_txin) = store.txin(rival_txin_id)? else {
                    continue;
                };
                let Some(mut rival) = store.tx(rival_txin.tx)? else {
                    continue;
                };
                if matches!(rival.status, TxStatus::Canceled | TxStatus::Confirmed) {
                    continue;
                }
                debug!(unsigned_hash = %rival.unsigned_hash, "canceling conflicting transaction");
                let prev = rival.clone();
                rival.status = TxStatus::Canceled;
                batch.put_tx(store, &rival, Some(&prev))?;
                let (_, outs) = self.load_tx_parts(store, &rival)?;
                events.push(VaultEvent::Updated(self.tx_account_names(store, &outs)?));
            }
        }
        Ok(())
    }

    /// Best chain height, 0 when no headers are stored.
    pub fn best_height(&self) -> Result<u32, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        Ok(store.best_height()?.unwrap_or(0))
    }

    /// Lowest stored height: where a rescan must start from.
    pub fn horizon_height(&self) -> Result<u32, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        Ok(store.horizon_height()?.unwrap_or(0))
    }

    pub fn block_count(&self) -> Result<u64, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        store.block_count()
    }

    /// Earliest account creation time; blocks older than this cannot
    /// matter to the vault. `None` when no account exists.
    pub fn get_max_first_block_timestamp(&self) -> Result<Option<u32>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        Ok(store.accounts()?.iter().map(|a| a.time_created).min())
    }

    pub fn block_header_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<Option<BlockHeaderRecord>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        store.header_by_hash(hash)
    }

    pub fn block_header_by_height(
        &self,
        height: u32,
    ) -> Result<Option<BlockHeaderRecord>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        store.header_by_height(height)
    }

    /// The exponentially spaced block locator: the last ten heights step
    /// by one, then the step doubles down to height 0.
    pub fn get_locator_hashes(&self) -> Result<Vec<Hash256>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let Some(best) = store.best_height()? else {
            return Ok(Vec::new());
        };

        let mut heights = Vec::new();
        let mut height = best;
        let mut step = 1u32;
        let mut count = 1u32;
        heights.push(height);
        while step <= height {
            height -= step;
            count += 1;
            if count > 10 {
                step = step.saturating_mul(2);
            }
            heights.push(height);
        }

        let mut hashes = Vec::with_capacity(heights.len());
        for height in heights {
            if let Some(header) = store.header_by_height(height)? {
                hashes.push(header.hash);
            }
        }
        Ok(hashes)
    }

    /// Transactions with their confirming block.
    pub fn confirmed_tx_views(&self) -> Result<Vec<ConfirmedTxView>, VaultError> {
        let guard = self.store_guard();
        let store = guard.as_ref().ok_or(VaultError::Closed)?;
        let headers: HashMap<Id, BlockHeaderRecord> = store
            .block_headers()?
            .into_iter()
            .map(|h| (h.id, h))
            .collect();
        let mut views = Vec::new();
        for tx in store.txs()? {
            let (Some(header_id), Some(tx_hash)) = (tx.blockheader, tx.hash) else {
                continue;
            };
            let Some(header) = headers.get(&header_id) else {
                continue;
            };
            views.push(ConfirmedTxView {
                tx_id: tx.id,
                tx_hash,
                block_hash: header.hash,
                block_height: header.height,
                blockindex: tx.blockindex.unwrap_or(0),
            });
        }
        views.sort_by_key(|view| (view.block_height, view.blockindex));
        Ok(views)
    }

    //////////////////////
    // BLOOM SYNTHESIS //
    //////////////////////

    /// Synthesize the peer-side bloom filter over every watched script's
    /// payee hash, redeem script, and pubkeys, plus the outpoints of all
    /// unspent owned outputs. Built from committed state on every call,
    /// never cached.
    pub fn bloom_filter(
        &self,
        false_positive_rate: f64,
        n_tweak: u32,
        n_flags: u8,
    ) -> Result<BloomFilter, VaultError> {
        trace!(false_positive_rate, n_tweak, "bloom_filter");
        self.surface((|| {
            let guard = self.store_guard();
            let store = guard.as_ref().ok_or(VaultError::Closed)?;

            let mut elements: Vec<Vec<u8>> = Vec::new();
            for script in store.signing_scripts()? {
                match strongbox_core::script::script_payee(&script.txoutscript) {
                    Payee::PubkeyHash(hash) | Payee::ScriptHash(hash) => {
                        elements.push(hash.to_vec())
                    }
                    _ => {}
                }
                if let Ok(parsed) = Script::parse(&script.txinscript) {
                    if parsed.kind() == ScriptKind::MultisigScriptHash {
                        elements.push(parsed.redeemscript().to_vec());
                    }
                    for pubkey in parsed.pubkeys() {
                        elements.push(pubkey.clone());
                    }
                }
            }

            let mut outpoints: Vec<(Hash256, u32)> = Vec::new();
            for txout in store.txouts()? {
                if txout.signingscript.is_none() || txout.status != TxOutStatus::Unspent {
                    continue;
                }
                let Some(tx) = store.tx(txout.tx)? else { continue };
                if let Some(tx_hash) = tx.hash {
                    outpoints.push((tx_hash, txout.txindex));
                }
            }

            if elements.is_empty() && outpoints.is_empty() {
                return Ok(BloomFilter::empty());
            }
            let mut filter = BloomFilter::new(
                elements.len() + outpoints.len(),
                false_positive_rate,
                n_tweak,
                n_flags,
            );
            for element in &elements {
                filter.insert(element);
            }
            for (hash, index) in &outpoints {
                filter.insert_outpoint(hash, *index);
            }
            Ok(filter)
        })())
    }
}
