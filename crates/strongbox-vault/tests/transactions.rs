//! Transaction lifecycle: ingestion, signing progress across cosigners,
//! conflicts, and idempotence.

mod common;

use common::*;
use tempfile::tempdir;

use strongbox_core::tx::RawTx;
use strongbox_vault::{Recipient, TxOutRole, TxOutStatus, TxStatus, Vault, VaultError};

/// A vault with a funded single-signature account.
fn funded_single_sig(dir: &tempfile::TempDir, name: &str, value: u64) -> (Vault, RawTx) {
    let vault = temp_vault(dir, name);
    vault.new_keychain("k1", &entropy(1), None, None).unwrap();
    vault.new_account("A", 1, &["k1"], Some(5), TS).unwrap();
    let (_, txoutscript) = vault.issue_new_script("A", "deposit").unwrap();
    let funding = funding_tx(&txoutscript, value, 0x11);
    vault.insert_raw_tx(&funding.serialize(), TS).unwrap().unwrap();
    (vault, funding)
}

#[test]
fn insert_is_idempotent() {
    // I1: inserting the same raw transaction twice changes nothing.
    let dir = tempdir().unwrap();
    let (vault, funding) = funded_single_sig(&dir, "v", 100_000);

    let before = vault.txout_views(Some("A"), false).unwrap();
    assert_eq!(vault.insert_raw_tx(&funding.serialize(), TS).unwrap(), None);
    let after = vault.txout_views(Some("A"), false).unwrap();
    assert_eq!(before, after);
}

#[test]
fn foreign_transactions_are_ignored() {
    let dir = tempdir().unwrap();
    let vault = temp_vault(&dir, "v");
    vault.new_keychain("k1", &entropy(1), None, None).unwrap();
    vault.new_account("A", 1, &["k1"], Some(2), TS).unwrap();

    let foreign = funding_tx(&external_script(0x77), 5_000, 0x22);
    assert_eq!(vault.insert_raw_tx(&foreign.serialize(), TS).unwrap(), None);
    assert!(vault.txout_views(None, false).unwrap().is_empty());
}

#[test]
fn received_output_links_script_and_balance() {
    let dir = tempdir().unwrap();
    let (vault, funding) = funded_single_sig(&dir, "v", 100_000);

    let views = vault.txout_views(Some("A"), false).unwrap();
    assert_eq!(views.len(), 1);
    let view = &views[0];
    assert_eq!(view.role, TxOutRole::Receiver);
    assert_eq!(view.value, 100_000);
    assert_eq!(view.label, "deposit");
    assert_eq!(view.status, TxOutStatus::Unspent);
    assert_eq!(view.tx_hash, Some(funding.txid()));
    assert_eq!(view.tx_status, TxStatus::Propagated);

    assert_eq!(vault.account_balance("A", 0).unwrap(), 100_000);
    // Unconfirmed outputs do not count toward a confirmed balance.
    assert_eq!(vault.account_balance("A", 1).unwrap(), 0);
}

#[test]
fn create_sign_and_finalize_spend() {
    let dir = tempdir().unwrap();
    let (vault, _funding) = funded_single_sig(&dir, "v", 100_000);

    let raw = vault
        .create_raw_tx(
            "A",
            &[Recipient {
                txoutscript: external_script(0xEE),
                value: 60_000,
                label: "payment".into(),
            }],
            1_000,
            1,
            0,
        )
        .unwrap();
    let unsigned = RawTx::parse(&raw).unwrap();
    // Payment plus change.
    assert_eq!(unsigned.txouts.len(), 2);
    assert_eq!(unsigned.missing_sig_count(), 1);
    let total_out: u64 = unsigned.txouts.iter().map(|o| o.value).sum();
    assert_eq!(total_out, 99_000);

    let (signed_raw, record) = vault.sign_raw_tx(&raw, TS).unwrap();
    assert_eq!(record.status, TxStatus::Unsent);
    let signed = RawTx::parse(&signed_raw).unwrap();
    assert_eq!(signed.missing_sig_count(), 0);
    // The signed hash is the sha256d of the final serialization, and the
    // unsigned identity never moved.
    assert_eq!(record.hash, Some(signed.txid()));
    assert_eq!(record.unsigned_hash, unsigned.unsigned_txid());

    // The spent output is now marked and excluded from the balance;
    // the change output is hidden from the default view.
    let spent = vault
        .txout_views(Some("A"), true)
        .unwrap()
        .into_iter()
        .find(|view| view.status == TxOutStatus::Spent)
        .expect("spent funding output");
    assert_eq!(spent.value, 100_000);
    let change = vault
        .txout_views(Some("A"), false)
        .unwrap()
        .into_iter()
        .find(|view| view.bin_name.as_deref() == Some("@change"))
        .expect("change output");
    assert_eq!(change.value, 39_000);
    assert_eq!(vault.account_balance("A", 0).unwrap(), 39_000);
}

#[test]
fn insufficient_funds_is_reported() {
    let dir = tempdir().unwrap();
    let (vault, _funding) = funded_single_sig(&dir, "v", 10_000);
    let err = vault
        .create_raw_tx(
            "A",
            &[Recipient {
                txoutscript: external_script(0xEE),
                value: 50_000,
                label: String::new(),
            }],
            1_000,
            1,
            0,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::InsufficientFunds { have: 10_000, need: 51_000, .. }
    ));
}

#[test]
fn multisig_signing_progress_across_locked_keychains() {
    // S3: a 2-of-3 spend collects signatures one unlocked keychain at a
    // time.
    let dir = tempdir().unwrap();
    let vault = temp_vault(&dir, "v");
    for (name, byte, pass) in [("k1", 1u8, b"pw1"), ("k2", 2, b"pw2"), ("k3", 3, b"pw3")] {
        vault
            .new_keychain(name, &entropy(byte), Some(pass.as_slice()), None)
            .unwrap();
    }
    vault
        .new_account("multi", 2, &["k1", "k2", "k3"], Some(5), TS)
        .unwrap();
    let (_, txoutscript) = vault.issue_new_script("multi", "fund").unwrap();
    let funding = funding_tx(&txoutscript, 100_000, 0x33);
    vault.insert_raw_tx(&funding.serialize(), TS).unwrap().unwrap();

    let raw = vault
        .create_raw_tx(
            "multi",
            &[Recipient {
                txoutscript: external_script(0xAB),
                value: 50_000,
                label: String::new(),
            }],
            1_000,
            1,
            0,
        )
        .unwrap();
    let unsigned_hash = RawTx::parse(&raw).unwrap().unsigned_txid();

    // Everything locked: the transaction inserts but gains no signatures.
    vault.lock_all_keychains();
    let record = vault.insert_raw_tx(&raw, TS).unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Unsigned);
    let request = vault.get_signing_request(&unsigned_hash, true).unwrap();
    assert_eq!(request.sigs_needed, 2);
    assert_eq!(request.keychains.len(), 3);
    assert!(vault.sign_tx(&unsigned_hash).unwrap().is_none());

    // First signature.
    vault.unlock_keychain("k1", b"pw1").unwrap();
    let record = vault.sign_tx(&unsigned_hash).unwrap().expect("one signature added");
    assert_eq!(record.status, TxStatus::Unsigned);
    assert_eq!(record.hash, None);
    let request = vault.get_signing_request(&unsigned_hash, false).unwrap();
    assert_eq!(request.sigs_needed, 1);

    // Second signature completes the quorum.
    vault.lock_keychain("k1");
    vault.unlock_keychain("k2", b"pw2").unwrap();
    let record = vault.sign_tx(&unsigned_hash).unwrap().expect("quorum reached");
    assert_eq!(record.status, TxStatus::Unsent);
    let (record, signed_raw) = vault.get_tx(&unsigned_hash).unwrap();
    let signed = RawTx::parse(&signed_raw).unwrap();
    assert_eq!(signed.missing_sig_count(), 0);
    assert_eq!(record.hash, Some(signed.txid()));
}

#[test]
fn cosigners_merge_signatures_by_unsigned_hash() {
    // Two vaults share a 2-of-2 account; each holds one private key. A
    // partially signed transaction passes between them and completes.
    let dir = tempdir().unwrap();

    let alice = temp_vault(&dir, "alice");
    alice.new_keychain("k1", &entropy(1), None, None).unwrap();
    let k2_xpub = {
        let tmp = temp_vault(&dir, "scratch");
        tmp.new_keychain("k2", &entropy(2), None, None).unwrap();
        tmp.export_keychain_extkey("k2", false).unwrap()
    };
    alice
        .import_keychain_extkey("k2", &k2_xpub, None, None)
        .unwrap();
    alice
        .new_account("joint", 2, &["k1", "k2"], Some(3), TS)
        .unwrap();

    let bob = temp_vault(&dir, "bob");
    bob.new_keychain("k2", &entropy(2), None, None).unwrap();
    let k1_xpub = alice.export_keychain_extkey("k1", false).unwrap();
    bob.import_keychain_extkey("k1", &k1_xpub, None, None).unwrap();
    bob.new_account("joint", 2, &["k1", "k2"], Some(3), TS).unwrap();

    // Both watch the same script; fund it in both vaults.
    let (addr_a, txoutscript) = alice.issue_new_script("joint", "").unwrap();
    let (addr_b, txoutscript_b) = bob.issue_new_script("joint", "").unwrap();
    assert_eq!(addr_a, addr_b);
    assert_eq!(txoutscript, txoutscript_b);
    let funding = funding_tx(&txoutscript, 80_000, 0x44);
    alice.insert_raw_tx(&funding.serialize(), TS).unwrap().unwrap();
    bob.insert_raw_tx(&funding.serialize(), TS).unwrap().unwrap();

    let raw = alice
        .create_raw_tx(
            "joint",
            &[Recipient {
                txoutscript: external_script(0xCD),
                value: 30_000,
                label: String::new(),
            }],
            1_000,
            1,
            0,
        )
        .unwrap();
    let unsigned_hash = RawTx::parse(&raw).unwrap().unsigned_txid();

    // Alice signs with k1 only.
    let (half_signed, record) = alice.sign_raw_tx(&raw, TS).unwrap();
    assert_eq!(record.status, TxStatus::Unsigned);
    assert_eq!(RawTx::parse(&half_signed).unwrap().missing_sig_count(), 1);

    // Bob completes with k2.
    let (fully_signed, record) = bob.sign_raw_tx(&half_signed, TS).unwrap();
    assert_eq!(record.status, TxStatus::Unsent);
    assert_eq!(RawTx::parse(&fully_signed).unwrap().missing_sig_count(), 0);

    // Alice merges the signed rendering over her unsigned copy.
    let merged = alice
        .insert_raw_tx(&fully_signed, TS)
        .unwrap()
        .expect("signed rendering replaces unsigned");
    assert_eq!(merged.unsigned_hash, unsigned_hash);
    assert_eq!(merged.status, TxStatus::Propagated);
    assert_eq!(merged.hash, Some(RawTx::parse(&fully_signed).unwrap().txid()));
}

#[test]
fn conflicting_spends_and_confirmation_cancel() {
    // S4: a double spend marks the newcomer CONFLICTING; confirmation of
    // one cancels the other.
    let dir = tempdir().unwrap();
    let (vault, funding) = funded_single_sig(&dir, "v", 100_000);
    let funding_hash = funding.txid();

    let t1 = external_spend(funding_hash, 0, external_script(0xA1), 90_000, 0x51);
    let t2 = external_spend(funding_hash, 0, external_script(0xA2), 80_000, 0x52);

    let r1 = vault.insert_raw_tx(&t1.serialize(), TS).unwrap().unwrap();
    assert_eq!(r1.status, TxStatus::Propagated);

    let r2 = vault.insert_raw_tx(&t2.serialize(), TS + 1).unwrap().unwrap();
    assert_eq!(r2.status, TxStatus::Conflicting);
    let (r1, _) = vault.get_tx(&t1.unsigned_txid()).unwrap();
    assert_eq!(r1.status, TxStatus::Propagated);

    // A merkle block confirms T2: T2 → CONFIRMED, T1 → CANCELED.
    use strongbox_core::chain::{BlockHeader, MerkleBlock};
    use strongbox_core::hash::Hash256;
    let header = BlockHeader {
        version: 1,
        prevhash: Hash256::ZERO,
        merkleroot: Hash256([0xBB; 32]),
        timestamp: TS,
        bits: 0x1d00ffff,
        nonce: 7,
    };
    let mb = MerkleBlock {
        header,
        txcount: 10,
        hashes: vec![t2.txid()],
        flags: vec![0xFF],
    };
    assert_eq!(vault.insert_merkle_block(&mb).unwrap(), Some(0));

    let (r2, _) = vault.get_tx(&t2.unsigned_txid()).unwrap();
    assert_eq!(r2.status, TxStatus::Confirmed);
    assert_eq!(r2.blockindex, Some(0));
    let (r1, _) = vault.get_tx(&t1.unsigned_txid()).unwrap();
    assert_eq!(r1.status, TxStatus::Canceled);

    // The spent link points at the later spender, and the spent output
    // counts toward no balance.
    assert_eq!(vault.account_balance("A", 0).unwrap(), 0);
}

#[test]
fn delete_tx_restores_spent_outputs() {
    let dir = tempdir().unwrap();
    let (vault, funding) = funded_single_sig(&dir, "v", 100_000);
    let spend = external_spend(funding.txid(), 0, external_script(0xA1), 90_000, 0x61);
    vault.insert_raw_tx(&spend.serialize(), TS).unwrap().unwrap();
    assert_eq!(vault.account_balance("A", 0).unwrap(), 0);

    vault.delete_tx(&spend.unsigned_txid()).unwrap();
    assert_eq!(vault.account_balance("A", 0).unwrap(), 100_000);
    assert!(matches!(
        vault.get_tx(&spend.unsigned_txid()),
        Err(VaultError::NotFound { .. })
    ));
}

#[test]
fn tx_bundle_round_trip() {
    let dir = tempdir().unwrap();
    let (vault, funding) = funded_single_sig(&dir, "v", 100_000);
    let path = dir.path().join("tx.sbx");
    vault.export_tx(&funding.unsigned_txid(), &path).unwrap();

    let other = temp_vault(&dir, "w");
    other.new_keychain("k1", &entropy(1), None, None).unwrap();
    other.new_account("A", 1, &["k1"], Some(5), TS).unwrap();
    other.issue_new_script("A", "deposit").unwrap();
    let imported = other.import_tx(&path).unwrap().expect("affects the account");
    assert_eq!(imported.unsigned_hash, funding.unsigned_txid());
    assert_eq!(other.account_balance("A", 0).unwrap(), 100_000);
}
