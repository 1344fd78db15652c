//! Shared helpers for the integration suites.
#![allow(dead_code)]

use tempfile::TempDir;

use strongbox_core::hash::Hash256;
use strongbox_core::script::p2pkh_txoutscript;
use strongbox_core::tx::{RawTx, RawTxIn, RawTxOut};
use strongbox_vault::Vault;

pub const TS: u32 = 1_400_000_000;

/// A fresh vault in a temporary directory. Keep the TempDir alive for the
/// duration of the test.
pub fn temp_vault(dir: &TempDir, name: &str) -> Vault {
    Vault::create(dir.path().join(name)).expect("create vault")
}

pub fn entropy(byte: u8) -> [u8; 32] {
    [byte; 32]
}

/// A txout script paying to nobody we know.
pub fn external_script(byte: u8) -> Vec<u8> {
    p2pkh_txoutscript(&[byte; 20])
}

/// A fully "signed" transaction funding the given script from an outpoint
/// the vault does not know. The input script parses as no known signing
/// script, so the transaction counts as complete.
pub fn funding_tx(txoutscript: &[u8], value: u64, salt: u8) -> RawTx {
    RawTx {
        version: 1,
        txins: vec![RawTxIn {
            outhash: Hash256([salt; 32]),
            outindex: 0,
            script: vec![0x01, salt],
            sequence: 0xffff_ffff,
        }],
        txouts: vec![RawTxOut {
            value,
            script: txoutscript.to_vec(),
        }],
        locktime: 0,
    }
}

/// An externally signed transaction spending one outpoint into one output.
pub fn external_spend(outhash: Hash256, outindex: u32, txoutscript: Vec<u8>, value: u64, salt: u8) -> RawTx {
    RawTx {
        version: 1,
        txins: vec![RawTxIn {
            outhash,
            outindex,
            script: vec![0x02, salt, salt],
            sequence: 0xffff_ffff,
        }],
        txouts: vec![RawTxOut {
            value,
            script: txoutscript,
        }],
        locktime: 0,
    }
}
