//! RocksDB-backed entity store.
//!
//! One column family per entity table plus association tables, secondary
//! indexes, and a metadata family holding the id counters. All mutations
//! from one vault operation are staged into a [`Batch`] and applied with a
//! single atomic `WriteBatch`, so a failed operation leaves the store
//! untouched.
//!
//! Keys are big-endian ids for ordered iteration; records are bincode.

use std::collections::HashMap;
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};

use strongbox_core::hash::Hash256;

use crate::error::VaultError;
use crate::model::{
    AccountBinRecord, AccountRecord, BlockHeaderRecord, Id, KeyRecord, KeychainRecord,
    MerkleBlockRecord, SigningScriptRecord, TxInRecord, TxOutRecord, TxRecord, VersionRecord,
    SCHEMA_BASE_VERSION, SCHEMA_VERSION,
};

// --- Column family names ---

const CF_VERSION: &str = "version";
const CF_KEYCHAINS: &str = "keychains";
const CF_KEYS: &str = "keys";
const CF_ACCOUNTS: &str = "accounts";
const CF_ACCOUNT_BINS: &str = "account_bins";
const CF_SIGNING_SCRIPTS: &str = "signing_scripts";
const CF_BLOCK_HEADERS: &str = "block_headers";
const CF_MERKLE_BLOCKS: &str = "merkle_blocks";
const CF_TXS: &str = "txs";
const CF_TXINS: &str = "txins";
const CF_TXOUTS: &str = "txouts";

// Association tables of the persisted layout.
const CF_ACCOUNT_KEYCHAINS: &str = "account_keychains";
const CF_MERKLEBLOCK_HASHES: &str = "merkleblock_hashes";

// Secondary indexes.
const CF_IDX_KEYCHAIN_NAME: &str = "idx_keychain_name";
const CF_IDX_KEYCHAIN_HASH: &str = "idx_keychain_hash";
const CF_IDX_ACCOUNT_NAME: &str = "idx_account_name";
const CF_IDX_ACCOUNT_HASH: &str = "idx_account_hash";
const CF_IDX_BIN_HASH: &str = "idx_bin_hash";
const CF_IDX_SCRIPT_BIN: &str = "idx_script_bin";
const CF_IDX_SCRIPT_TXOUTSCRIPT: &str = "idx_script_txoutscript";
const CF_IDX_TX_HASH: &str = "idx_tx_hash";
const CF_IDX_TX_UNSIGNED_HASH: &str = "idx_tx_unsigned_hash";
const CF_IDX_TXIN_OUTPOINT: &str = "idx_txin_outpoint";
const CF_IDX_HEADER_HASH: &str = "idx_header_hash";
const CF_IDX_HEADER_HEIGHT: &str = "idx_header_height";

const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[
    CF_VERSION,
    CF_KEYCHAINS,
    CF_KEYS,
    CF_ACCOUNTS,
    CF_ACCOUNT_BINS,
    CF_SIGNING_SCRIPTS,
    CF_BLOCK_HEADERS,
    CF_MERKLE_BLOCKS,
    CF_TXS,
    CF_TXINS,
    CF_TXOUTS,
    CF_ACCOUNT_KEYCHAINS,
    CF_MERKLEBLOCK_HASHES,
    CF_IDX_KEYCHAIN_NAME,
    CF_IDX_KEYCHAIN_HASH,
    CF_IDX_ACCOUNT_NAME,
    CF_IDX_ACCOUNT_HASH,
    CF_IDX_BIN_HASH,
    CF_IDX_SCRIPT_BIN,
    CF_IDX_SCRIPT_TXOUTSCRIPT,
    CF_IDX_TX_HASH,
    CF_IDX_TX_UNSIGNED_HASH,
    CF_IDX_TXIN_OUTPOINT,
    CF_IDX_HEADER_HASH,
    CF_IDX_HEADER_HEIGHT,
    CF_METADATA,
];

fn id_key(id: Id) -> [u8; 8] {
    id.to_be_bytes()
}

fn enc<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, VaultError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| VaultError::Storage(e.to_string()))
}

fn dec<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, VaultError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| VaultError::Storage(e.to_string()))
}

/// The embedded store. Reads go straight to RocksDB; writes are staged in
/// a [`Batch`] and committed atomically.
pub struct Store {
    db: DB,
}

macro_rules! entity_access {
    ($get:ident, $iter:ident, $cf:expr, $t:ty) => {
        pub fn $get(&self, id: Id) -> Result<Option<$t>, VaultError> {
            let cf = self.cf($cf)?;
            self.get_record(cf, &id_key(id))
        }

        pub fn $iter(&self) -> Result<Vec<$t>, VaultError> {
            self.scan($cf)
        }
    };
}

impl Store {
    /// Create a new store. Fails if the path already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(VaultError::already_exists(
                "vault",
                path.display().to_string(),
            ));
        }
        let store = Self::open_db(path, true)?;
        let mut batch = store.batch();
        let version = VersionRecord {
            id: 1,
            version: SCHEMA_VERSION,
        };
        batch.put(store.cf(CF_VERSION)?, &id_key(1), &enc(&version)?);
        store.commit(batch)?;
        Ok(store)
    }

    /// Open an existing store, migrating old-but-supported schemas
    /// forward.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VaultError::not_found("vault", path.display().to_string()));
        }
        let store = Self::open_db(path, false)?;
        let version = store.schema_version()?;
        if !(SCHEMA_BASE_VERSION..=SCHEMA_VERSION).contains(&version) {
            return Err(VaultError::UnsupportedSchema {
                found: version,
                base: SCHEMA_BASE_VERSION,
                current: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            // Forward migration. The v4 -> v5 step changed no table
            // shapes, only the version row.
            let mut batch = store.batch();
            let record = VersionRecord {
                id: 1,
                version: SCHEMA_VERSION,
            };
            batch.put(store.cf(CF_VERSION)?, &id_key(1), &enc(&record)?);
            store.commit(batch)?;
        }
        Ok(store)
    }

    fn open_db(path: &Path, create: bool) -> Result<Self, VaultError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(create);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .map_err(|e| VaultError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    /// The stored schema version. A missing version row is corruption.
    pub fn schema_version(&self) -> Result<u32, VaultError> {
        let record: Option<VersionRecord> = self.get_record(self.cf(CF_VERSION)?, &id_key(1))?;
        record
            .map(|v| v.version)
            .ok_or_else(|| VaultError::Storage("missing version row".into()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, VaultError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| VaultError::Storage(format!("missing column family: {name}")))
    }

    fn get_record<T: bincode::Decode<()>>(
        &self,
        cf: &rocksdb::ColumnFamily,
        key: &[u8],
    ) -> Result<Option<T>, VaultError> {
        match self
            .db
            .get_cf(cf, key)
            .map_err(|e| VaultError::Storage(e.to_string()))?
        {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: bincode::Decode<()>>(&self, cf_name: &str) -> Result<Vec<T>, VaultError> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        for entry in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = entry.map_err(|e| VaultError::Storage(e.to_string()))?;
            records.push(dec(&value)?);
        }
        Ok(records)
    }

    fn lookup_id(&self, cf_name: &str, key: &[u8]) -> Result<Option<Id>, VaultError> {
        match self
            .db
            .get_cf(self.cf(cf_name)?, key)
            .map_err(|e| VaultError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                Ok(Some(Id::from_be_bytes(bytes[..8].try_into().expect("sized"))))
            }
            Some(_) => Err(VaultError::Storage("malformed index value".into())),
            None => Ok(None),
        }
    }

    entity_access!(keychain, keychains, CF_KEYCHAINS, KeychainRecord);
    entity_access!(key, keys, CF_KEYS, KeyRecord);
    entity_access!(account, accounts, CF_ACCOUNTS, AccountRecord);
    entity_access!(account_bin, account_bins, CF_ACCOUNT_BINS, AccountBinRecord);
    entity_access!(
        signing_script,
        signing_scripts,
        CF_SIGNING_SCRIPTS,
        SigningScriptRecord
    );
    entity_access!(
        block_header,
        block_headers,
        CF_BLOCK_HEADERS,
        BlockHeaderRecord
    );
    entity_access!(
        merkle_block,
        merkle_blocks,
        CF_MERKLE_BLOCKS,
        MerkleBlockRecord
    );
    entity_access!(tx, txs, CF_TXS, TxRecord);
    entity_access!(txin, txins, CF_TXINS, TxInRecord);
    entity_access!(txout, txouts, CF_TXOUTS, TxOutRecord);

    // --- Index lookups ---

    pub fn keychain_by_name(&self, name: &str) -> Result<Option<KeychainRecord>, VaultError> {
        match self.lookup_id(CF_IDX_KEYCHAIN_NAME, name.as_bytes())? {
            Some(id) => self.keychain(id),
            None => Ok(None),
        }
    }

    pub fn keychain_by_hash(&self, hash: &[u8; 20]) -> Result<Option<KeychainRecord>, VaultError> {
        match self.lookup_id(CF_IDX_KEYCHAIN_HASH, hash)? {
            Some(id) => self.keychain(id),
            None => Ok(None),
        }
    }

    pub fn account_by_name(&self, name: &str) -> Result<Option<AccountRecord>, VaultError> {
        match self.lookup_id(CF_IDX_ACCOUNT_NAME, name.as_bytes())? {
            Some(id) => self.account(id),
            None => Ok(None),
        }
    }

    pub fn account_by_hash(&self, hash: &[u8; 20]) -> Result<Option<AccountRecord>, VaultError> {
        match self.lookup_id(CF_IDX_ACCOUNT_HASH, hash)? {
            Some(id) => self.account(id),
            None => Ok(None),
        }
    }

    pub fn bin_by_hash(&self, hash: &[u8; 20]) -> Result<Option<AccountBinRecord>, VaultError> {
        match self.lookup_id(CF_IDX_BIN_HASH, hash)? {
            Some(id) => self.account_bin(id),
            None => Ok(None),
        }
    }

    /// Keychain ids referenced by an account, via the association table.
    pub fn account_keychain_ids(&self, account: Id) -> Result<Vec<Id>, VaultError> {
        let cf = self.cf(CF_ACCOUNT_KEYCHAINS)?;
        let prefix = id_key(account);
        let mut ids = Vec::new();
        let mode = rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward);
        for entry in self.db.iterator_cf(cf, mode) {
            let (key, _value) = entry.map_err(|e| VaultError::Storage(e.to_string()))?;
            if key.len() != 16 || key[..8] != prefix {
                break;
            }
            ids.push(Id::from_be_bytes(key[8..16].try_into().expect("sized")));
        }
        Ok(ids)
    }

    /// Bins of an account, ordered by bin index.
    pub fn bins_of_account(&self, account: Id) -> Result<Vec<AccountBinRecord>, VaultError> {
        let mut bins: Vec<AccountBinRecord> = self
            .account_bins()?
            .into_iter()
            .filter(|bin| bin.account == Some(account))
            .collect();
        bins.sort_by_key(|bin| bin.index);
        Ok(bins)
    }

    /// Scripts of a bin, ordered by script index.
    pub fn scripts_of_bin(&self, bin: Id) -> Result<Vec<SigningScriptRecord>, VaultError> {
        let cf = self.cf(CF_IDX_SCRIPT_BIN)?;
        let prefix = id_key(bin);
        let mut scripts = Vec::new();
        let mode = rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward);
        for entry in self.db.iterator_cf(cf, mode) {
            let (key, value) = entry.map_err(|e| VaultError::Storage(e.to_string()))?;
            if key.len() != 12 || key[..8] != prefix {
                break;
            }
            if value.len() != 8 {
                return Err(VaultError::Storage("malformed index value".into()));
            }
            let id = Id::from_be_bytes(value[..8].try_into().expect("sized"));
            if let Some(script) = self.signing_script(id)? {
                scripts.push(script);
            }
        }
        scripts.sort_by_key(|script| script.index);
        Ok(scripts)
    }

    pub fn script_by_txoutscript(
        &self,
        txoutscript: &[u8],
    ) -> Result<Option<SigningScriptRecord>, VaultError> {
        match self.lookup_id(CF_IDX_SCRIPT_TXOUTSCRIPT, txoutscript)? {
            Some(id) => self.signing_script(id),
            None => Ok(None),
        }
    }

    pub fn tx_by_hash(&self, hash: &Hash256) -> Result<Option<TxRecord>, VaultError> {
        match self.lookup_id(CF_IDX_TX_HASH, hash.as_bytes())? {
            Some(id) => self.tx(id),
            None => Ok(None),
        }
    }

    pub fn tx_by_unsigned_hash(&self, hash: &Hash256) -> Result<Option<TxRecord>, VaultError> {
        match self.lookup_id(CF_IDX_TX_UNSIGNED_HASH, hash.as_bytes())? {
            Some(id) => self.tx(id),
            None => Ok(None),
        }
    }

    /// Ids of stored inputs spending a given outpoint. More than one means
    /// conflicting transactions.
    pub fn txins_spending(&self, outhash: &Hash256, outindex: u32) -> Result<Vec<Id>, VaultError> {
        let cf = self.cf(CF_IDX_TXIN_OUTPOINT)?;
        let mut prefix = Vec::with_capacity(36);
        prefix.extend_from_slice(outhash.as_bytes());
        prefix.extend_from_slice(&outindex.to_be_bytes());
        let mut ids = Vec::new();
        let mode = rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward);
        for entry in self.db.iterator_cf(cf, mode) {
            let (key, _value) = entry.map_err(|e| VaultError::Storage(e.to_string()))?;
            if key.len() != 44 || key[..36] != prefix[..] {
                break;
            }
            ids.push(Id::from_be_bytes(key[36..44].try_into().expect("sized")));
        }
        Ok(ids)
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Result<Option<BlockHeaderRecord>, VaultError> {
        match self.lookup_id(CF_IDX_HEADER_HASH, hash.as_bytes())? {
            Some(id) => self.block_header(id),
            None => Ok(None),
        }
    }

    pub fn header_by_height(&self, height: u32) -> Result<Option<BlockHeaderRecord>, VaultError> {
        match self.lookup_id(CF_IDX_HEADER_HEIGHT, &height.to_be_bytes())? {
            Some(id) => self.block_header(id),
            None => Ok(None),
        }
    }

    /// Headers at or above a height, highest first.
    pub fn headers_at_or_above(&self, height: u32) -> Result<Vec<BlockHeaderRecord>, VaultError> {
        let mut headers: Vec<BlockHeaderRecord> = self
            .block_headers()?
            .into_iter()
            .filter(|header| header.height >= height)
            .collect();
        headers.sort_by(|a, b| b.height.cmp(&a.height));
        Ok(headers)
    }

    pub fn best_height(&self) -> Result<Option<u32>, VaultError> {
        Ok(self.block_headers()?.iter().map(|h| h.height).max())
    }

    pub fn horizon_height(&self) -> Result<Option<u32>, VaultError> {
        Ok(self.block_headers()?.iter().map(|h| h.height).min())
    }

    pub fn block_count(&self) -> Result<u64, VaultError> {
        Ok(self.block_headers()?.len() as u64)
    }

    pub fn merkle_blocks_of_header(
        &self,
        header: Id,
    ) -> Result<Vec<MerkleBlockRecord>, VaultError> {
        Ok(self
            .merkle_blocks()?
            .into_iter()
            .filter(|mb| mb.blockheader == header)
            .collect())
    }

    // --- Write path ---

    /// Start a new atomic batch.
    pub fn batch(&self) -> Batch {
        Batch {
            wb: WriteBatch::default(),
            counters: HashMap::new(),
        }
    }

    /// Apply a batch atomically.
    pub fn commit(&self, mut batch: Batch) -> Result<(), VaultError> {
        let cf = self.cf(CF_METADATA)?;
        for (table, next) in &batch.counters {
            let mut key = Vec::from(&b"next_id/"[..]);
            key.extend_from_slice(table.as_bytes());
            batch.wb.put_cf(cf, key, next.to_be_bytes());
        }
        self.db
            .write(batch.wb)
            .map_err(|e| VaultError::Storage(e.to_string()))
    }

    fn next_counter(&self, table: &str) -> Result<Id, VaultError> {
        let mut key = Vec::from(&b"next_id/"[..]);
        key.extend_from_slice(table.as_bytes());
        match self
            .db
            .get_cf(self.cf(CF_METADATA)?, key)
            .map_err(|e| VaultError::Storage(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                Ok(Id::from_be_bytes(bytes[..8].try_into().expect("sized")))
            }
            Some(_) => Err(VaultError::Storage("malformed id counter".into())),
            None => Ok(0),
        }
    }
}

/// A staged set of writes applied atomically at commit.
///
/// The typed `put_*`/`delete_*` methods keep secondary indexes and
/// association tables in sync with their records; callers pass the
/// previously committed record when replacing one so stale index entries
/// are removed.
pub struct Batch {
    wb: WriteBatch,
    counters: HashMap<String, Id>,
}

impl Batch {
    fn put(&mut self, cf: &rocksdb::ColumnFamily, key: &[u8], value: &[u8]) {
        self.wb.put_cf(cf, key, value);
    }

    fn delete(&mut self, cf: &rocksdb::ColumnFamily, key: &[u8]) {
        self.wb.delete_cf(cf, key);
    }

    /// Allocate the next monotonic id for a table. The advanced counter is
    /// persisted with the batch.
    pub fn new_id(&mut self, store: &Store, table: &'static str) -> Result<Id, VaultError> {
        let next = match self.counters.get(table) {
            Some(&n) => n,
            None => store.next_counter(table)?,
        };
        let id = next + 1;
        self.counters.insert(table.to_string(), id);
        Ok(id)
    }

    pub fn keychain_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_KEYCHAINS)
    }

    pub fn key_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_KEYS)
    }

    pub fn account_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_ACCOUNTS)
    }

    pub fn account_bin_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_ACCOUNT_BINS)
    }

    pub fn signing_script_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_SIGNING_SCRIPTS)
    }

    pub fn block_header_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_BLOCK_HEADERS)
    }

    pub fn merkle_block_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_MERKLE_BLOCKS)
    }

    pub fn tx_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_TXS)
    }

    pub fn txin_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_TXINS)
    }

    pub fn txout_id(&mut self, store: &Store) -> Result<Id, VaultError> {
        self.new_id(store, CF_TXOUTS)
    }

    pub fn put_keychain(
        &mut self,
        store: &Store,
        record: &KeychainRecord,
        old: Option<&KeychainRecord>,
    ) -> Result<(), VaultError> {
        if let Some(old) = old {
            if old.name != record.name {
                self.delete(store.cf(CF_IDX_KEYCHAIN_NAME)?, old.name.as_bytes());
            }
            if old.hash != record.hash {
                self.delete(store.cf(CF_IDX_KEYCHAIN_HASH)?, &old.hash);
            }
        }
        self.put(store.cf(CF_KEYCHAINS)?, &id_key(record.id), &enc(record)?);
        self.put(
            store.cf(CF_IDX_KEYCHAIN_NAME)?,
            record.name.as_bytes(),
            &id_key(record.id),
        );
        self.put(
            store.cf(CF_IDX_KEYCHAIN_HASH)?,
            &record.hash,
            &id_key(record.id),
        );
        Ok(())
    }

    pub fn delete_keychain(
        &mut self,
        store: &Store,
        record: &KeychainRecord,
    ) -> Result<(), VaultError> {
        self.delete(store.cf(CF_KEYCHAINS)?, &id_key(record.id));
        self.delete(store.cf(CF_IDX_KEYCHAIN_NAME)?, record.name.as_bytes());
        self.delete(store.cf(CF_IDX_KEYCHAIN_HASH)?, &record.hash);
        Ok(())
    }

    pub fn put_key(&mut self, store: &Store, record: &KeyRecord) -> Result<(), VaultError> {
        self.put(store.cf(CF_KEYS)?, &id_key(record.id), &enc(record)?);
        Ok(())
    }

    pub fn delete_key(&mut self, store: &Store, id: Id) -> Result<(), VaultError> {
        self.delete(store.cf(CF_KEYS)?, &id_key(id));
        Ok(())
    }

    pub fn put_account(
        &mut self,
        store: &Store,
        record: &AccountRecord,
        old: Option<&AccountRecord>,
    ) -> Result<(), VaultError> {
        if let Some(old) = old {
            if old.name != record.name {
                self.delete(store.cf(CF_IDX_ACCOUNT_NAME)?, old.name.as_bytes());
            }
            if old.hash != record.hash {
                self.delete(store.cf(CF_IDX_ACCOUNT_HASH)?, &old.hash);
            }
        }
        self.put(store.cf(CF_ACCOUNTS)?, &id_key(record.id), &enc(record)?);
        self.put(
            store.cf(CF_IDX_ACCOUNT_NAME)?,
            record.name.as_bytes(),
            &id_key(record.id),
        );
        self.put(
            store.cf(CF_IDX_ACCOUNT_HASH)?,
            &record.hash,
            &id_key(record.id),
        );
        Ok(())
    }

    pub fn delete_account(
        &mut self,
        store: &Store,
        record: &AccountRecord,
    ) -> Result<(), VaultError> {
        self.delete(store.cf(CF_ACCOUNTS)?, &id_key(record.id));
        self.delete(store.cf(CF_IDX_ACCOUNT_NAME)?, record.name.as_bytes());
        self.delete(store.cf(CF_IDX_ACCOUNT_HASH)?, &record.hash);
        Ok(())
    }

    /// Record membership in the `Account_keychains` association table.
    pub fn put_account_keychain(
        &mut self,
        store: &Store,
        account: Id,
        keychain: Id,
    ) -> Result<(), VaultError> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&id_key(account));
        key.extend_from_slice(&id_key(keychain));
        self.put(store.cf(CF_ACCOUNT_KEYCHAINS)?, &key, &[]);
        Ok(())
    }

    pub fn delete_account_keychain(
        &mut self,
        store: &Store,
        account: Id,
        keychain: Id,
    ) -> Result<(), VaultError> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&id_key(account));
        key.extend_from_slice(&id_key(keychain));
        self.delete(store.cf(CF_ACCOUNT_KEYCHAINS)?, &key);
        Ok(())
    }

    pub fn put_account_bin(
        &mut self,
        store: &Store,
        record: &AccountBinRecord,
        old: Option<&AccountBinRecord>,
    ) -> Result<(), VaultError> {
        if let Some(old) = old {
            if old.hash != record.hash {
                self.delete(store.cf(CF_IDX_BIN_HASH)?, &old.hash);
            }
        }
        self.put(store.cf(CF_ACCOUNT_BINS)?, &id_key(record.id), &enc(record)?);
        self.put(store.cf(CF_IDX_BIN_HASH)?, &record.hash, &id_key(record.id));
        Ok(())
    }

    pub fn delete_account_bin(
        &mut self,
        store: &Store,
        record: &AccountBinRecord,
    ) -> Result<(), VaultError> {
        self.delete(store.cf(CF_ACCOUNT_BINS)?, &id_key(record.id));
        self.delete(store.cf(CF_IDX_BIN_HASH)?, &record.hash);
        Ok(())
    }

    pub fn put_signing_script(
        &mut self,
        store: &Store,
        record: &SigningScriptRecord,
    ) -> Result<(), VaultError> {
        self.put(
            store.cf(CF_SIGNING_SCRIPTS)?,
            &id_key(record.id),
            &enc(record)?,
        );
        let mut bin_key = Vec::with_capacity(12);
        bin_key.extend_from_slice(&id_key(record.account_bin));
        bin_key.extend_from_slice(&record.index.to_be_bytes());
        self.put(store.cf(CF_IDX_SCRIPT_BIN)?, &bin_key, &id_key(record.id));
        self.put(
            store.cf(CF_IDX_SCRIPT_TXOUTSCRIPT)?,
            &record.txoutscript,
            &id_key(record.id),
        );
        Ok(())
    }

    pub fn delete_signing_script(
        &mut self,
        store: &Store,
        record: &SigningScriptRecord,
    ) -> Result<(), VaultError> {
        self.delete(store.cf(CF_SIGNING_SCRIPTS)?, &id_key(record.id));
        let mut bin_key = Vec::with_capacity(12);
        bin_key.extend_from_slice(&id_key(record.account_bin));
        bin_key.extend_from_slice(&record.index.to_be_bytes());
        self.delete(store.cf(CF_IDX_SCRIPT_BIN)?, &bin_key);
        self.delete(store.cf(CF_IDX_SCRIPT_TXOUTSCRIPT)?, &record.txoutscript);
        Ok(())
    }

    pub fn put_block_header(
        &mut self,
        store: &Store,
        record: &BlockHeaderRecord,
    ) -> Result<(), VaultError> {
        self.put(
            store.cf(CF_BLOCK_HEADERS)?,
            &id_key(record.id),
            &enc(record)?,
        );
        self.put(
            store.cf(CF_IDX_HEADER_HASH)?,
            record.hash.as_bytes(),
            &id_key(record.id),
        );
        self.put(
            store.cf(CF_IDX_HEADER_HEIGHT)?,
            &record.height.to_be_bytes(),
            &id_key(record.id),
        );
        Ok(())
    }

    pub fn delete_block_header(
        &mut self,
        store: &Store,
        record: &BlockHeaderRecord,
    ) -> Result<(), VaultError> {
        self.delete(store.cf(CF_BLOCK_HEADERS)?, &id_key(record.id));
        self.delete(store.cf(CF_IDX_HEADER_HASH)?, record.hash.as_bytes());
        self.delete(store.cf(CF_IDX_HEADER_HEIGHT)?, &record.height.to_be_bytes());
        Ok(())
    }

    pub fn put_merkle_block(
        &mut self,
        store: &Store,
        record: &MerkleBlockRecord,
    ) -> Result<(), VaultError> {
        self.put(
            store.cf(CF_MERKLE_BLOCKS)?,
            &id_key(record.id),
            &enc(record)?,
        );
        for (seq, hash) in record.hashes.iter().enumerate() {
            let mut key = Vec::with_capacity(12);
            key.extend_from_slice(&id_key(record.id));
            key.extend_from_slice(&(seq as u32).to_be_bytes());
            self.put(store.cf(CF_MERKLEBLOCK_HASHES)?, &key, hash.as_bytes());
        }
        Ok(())
    }

    pub fn delete_merkle_block(
        &mut self,
        store: &Store,
        record: &MerkleBlockRecord,
    ) -> Result<(), VaultError> {
        self.delete(store.cf(CF_MERKLE_BLOCKS)?, &id_key(record.id));
        for seq in 0..record.hashes.len() {
            let mut key = Vec::with_capacity(12);
            key.extend_from_slice(&id_key(record.id));
            key.extend_from_slice(&(seq as u32).to_be_bytes());
            self.delete(store.cf(CF_MERKLEBLOCK_HASHES)?, &key);
        }
        Ok(())
    }

    pub fn put_tx(
        &mut self,
        store: &Store,
        record: &TxRecord,
        old: Option<&TxRecord>,
    ) -> Result<(), VaultError> {
        if let Some(old) = old {
            if old.hash != record.hash {
                if let Some(old_hash) = &old.hash {
                    self.delete(store.cf(CF_IDX_TX_HASH)?, old_hash.as_bytes());
                }
            }
        }
        self.put(store.cf(CF_TXS)?, &id_key(record.id), &enc(record)?);
        self.put(
            store.cf(CF_IDX_TX_UNSIGNED_HASH)?,
            record.unsigned_hash.as_bytes(),
            &id_key(record.id),
        );
        if let Some(hash) = &record.hash {
            self.put(store.cf(CF_IDX_TX_HASH)?, hash.as_bytes(), &id_key(record.id));
        }
        Ok(())
    }

    pub fn delete_tx(&mut self, store: &Store, record: &TxRecord) -> Result<(), VaultError> {
        self.delete(store.cf(CF_TXS)?, &id_key(record.id));
        self.delete(
            store.cf(CF_IDX_TX_UNSIGNED_HASH)?,
            record.unsigned_hash.as_bytes(),
        );
        if let Some(hash) = &record.hash {
            self.delete(store.cf(CF_IDX_TX_HASH)?, hash.as_bytes());
        }
        Ok(())
    }

    pub fn put_txin(&mut self, store: &Store, record: &TxInRecord) -> Result<(), VaultError> {
        self.put(store.cf(CF_TXINS)?, &id_key(record.id), &enc(record)?);
        let mut key = Vec::with_capacity(44);
        key.extend_from_slice(record.outhash.as_bytes());
        key.extend_from_slice(&record.outindex.to_be_bytes());
        key.extend_from_slice(&id_key(record.id));
        self.put(store.cf(CF_IDX_TXIN_OUTPOINT)?, &key, &[]);
        Ok(())
    }

    pub fn delete_txin(&mut self, store: &Store, record: &TxInRecord) -> Result<(), VaultError> {
        self.delete(store.cf(CF_TXINS)?, &id_key(record.id));
        let mut key = Vec::with_capacity(44);
        key.extend_from_slice(record.outhash.as_bytes());
        key.extend_from_slice(&record.outindex.to_be_bytes());
        key.extend_from_slice(&id_key(record.id));
        self.delete(store.cf(CF_IDX_TXIN_OUTPOINT)?, &key);
        Ok(())
    }

    pub fn put_txout(&mut self, store: &Store, record: &TxOutRecord) -> Result<(), VaultError> {
        self.put(store.cf(CF_TXOUTS)?, &id_key(record.id), &enc(record)?);
        Ok(())
    }

    pub fn delete_txout(&mut self, store: &Store, id: Id) -> Result<(), VaultError> {
        self.delete(store.cf(CF_TXOUTS)?, &id_key(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn keychain_record(id: Id, name: &str, hash_byte: u8) -> KeychainRecord {
        KeychainRecord {
            id,
            name: name.into(),
            depth: 0,
            parent_fp: 0,
            child_num: 0,
            pubkey: vec![0x02; 33],
            chain_code_ciphertext: vec![1; 32],
            chain_code_salt: Vec::new(),
            privkey_ciphertext: Vec::new(),
            privkey_salt: Vec::new(),
            parent: None,
            derivation_path: Vec::new(),
            hash: [hash_byte; 20],
            hidden: false,
        }
    }

    #[test]
    fn create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault");
        {
            let store = Store::create(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault");
        drop(Store::create(&path).unwrap());
        assert!(matches!(
            Store::create(&path),
            Err(VaultError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn open_missing_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Store::open(dir.path().join("nope")),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn open_migrates_base_version_forward() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault");
        {
            let store = Store::create(&path).unwrap();
            let mut batch = store.batch();
            let record = VersionRecord {
                id: 1,
                version: SCHEMA_BASE_VERSION,
            };
            batch.put(store.cf(CF_VERSION).unwrap(), &id_key(1), &enc(&record).unwrap());
            store.commit(batch).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn open_rejects_future_and_ancient_schema() {
        for bad_version in [SCHEMA_BASE_VERSION - 1, SCHEMA_VERSION + 1] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("vault");
            {
                let store = Store::create(&path).unwrap();
                let mut batch = store.batch();
                let record = VersionRecord {
                    id: 1,
                    version: bad_version,
                };
                batch.put(
                    &store.cf(CF_VERSION).unwrap(),
                    &id_key(1),
                    &enc(&record).unwrap(),
                );
                store.commit(batch).unwrap();
            }
            assert!(matches!(
                Store::open(&path),
                Err(VaultError::UnsupportedSchema { .. })
            ));
        }
    }

    #[test]
    fn id_allocation_is_monotonic_and_persistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault");
        let store = Store::create(&path).unwrap();

        let mut batch = store.batch();
        assert_eq!(batch.keychain_id(&store).unwrap(), 1);
        assert_eq!(batch.keychain_id(&store).unwrap(), 2);
        assert_eq!(batch.tx_id(&store).unwrap(), 1);
        store.commit(batch).unwrap();

        let mut batch = store.batch();
        assert_eq!(batch.keychain_id(&store).unwrap(), 3);
        drop(batch); // Uncommitted allocation is discarded.

        let mut batch = store.batch();
        assert_eq!(batch.keychain_id(&store).unwrap(), 3);
        store.commit(batch).unwrap();
    }

    #[test]
    fn keychain_roundtrip_with_indexes() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("vault")).unwrap();

        let record = keychain_record(1, "main", 0x11);
        let mut batch = store.batch();
        batch.put_keychain(&store, &record, None).unwrap();
        store.commit(batch).unwrap();

        assert_eq!(store.keychain(1).unwrap().unwrap(), record);
        assert_eq!(store.keychain_by_name("main").unwrap().unwrap().id, 1);
        assert_eq!(store.keychain_by_hash(&[0x11; 20]).unwrap().unwrap().id, 1);
        assert!(store.keychain_by_name("other").unwrap().is_none());

        // Rename drops the old name index.
        let mut renamed = record.clone();
        renamed.name = "renamed".into();
        let mut batch = store.batch();
        batch.put_keychain(&store, &renamed, Some(&record)).unwrap();
        store.commit(batch).unwrap();
        assert!(store.keychain_by_name("main").unwrap().is_none());
        assert_eq!(store.keychain_by_name("renamed").unwrap().unwrap().id, 1);

        let mut batch = store.batch();
        batch.delete_keychain(&store, &renamed).unwrap();
        store.commit(batch).unwrap();
        assert!(store.keychain(1).unwrap().is_none());
        assert!(store.keychain_by_name("renamed").unwrap().is_none());
    }

    #[test]
    fn txin_outpoint_index_allows_duplicates() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("vault")).unwrap();
        let outhash = Hash256([0xAB; 32]);

        let mut batch = store.batch();
        for id in [1u64, 2] {
            let record = TxInRecord {
                id,
                tx: id,
                txindex: 0,
                outhash,
                outindex: 0,
                script: Vec::new(),
                sequence: 0,
            };
            batch.put_txin(&store, &record).unwrap();
        }
        store.commit(batch).unwrap();

        let spending = store.txins_spending(&outhash, 0).unwrap();
        assert_eq!(spending, vec![1, 2]);
        assert!(store.txins_spending(&outhash, 1).unwrap().is_empty());
    }

    #[test]
    fn header_height_queries() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("vault")).unwrap();

        let mut batch = store.batch();
        for (id, height) in [(1u64, 0u32), (2, 1), (3, 2)] {
            let record = BlockHeaderRecord {
                id,
                hash: Hash256([id as u8; 32]),
                height,
                version: 1,
                prevhash: Hash256::ZERO,
                merkleroot: Hash256::ZERO,
                timestamp: 0,
                bits: 0,
                nonce: 0,
            };
            batch.put_block_header(&store, &record).unwrap();
        }
        store.commit(batch).unwrap();

        assert_eq!(store.best_height().unwrap(), Some(2));
        assert_eq!(store.horizon_height().unwrap(), Some(0));
        assert_eq!(store.block_count().unwrap(), 3);
        assert_eq!(store.header_by_height(1).unwrap().unwrap().id, 2);
        let above = store.headers_at_or_above(1).unwrap();
        assert_eq!(above.iter().map(|h| h.height).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn scripts_of_bin_ordered() {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("vault")).unwrap();

        let mut batch = store.batch();
        for (id, index) in [(1u64, 2u32), (2, 0), (3, 1)] {
            let record = SigningScriptRecord {
                id,
                account: 1,
                account_bin: 9,
                index,
                label: String::new(),
                status: crate::model::ScriptStatus::Unused,
                txinscript: vec![index as u8],
                txoutscript: vec![0xF0, index as u8],
                keys: Vec::new(),
            };
            batch.put_signing_script(&store, &record).unwrap();
        }
        store.commit(batch).unwrap();

        let scripts = store.scripts_of_bin(9).unwrap();
        assert_eq!(
            scripts.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(store.scripts_of_bin(8).unwrap().is_empty());
        assert_eq!(
            store
                .script_by_txoutscript(&[0xF0, 1])
                .unwrap()
                .unwrap()
                .index,
            1
        );
    }
}
