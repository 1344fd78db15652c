//! Transaction wire model.
//!
//! [`RawTx`] is the network-format transaction: little-endian integers,
//! varint counts, scripts as raw bytes. Identity is the double SHA-256 of
//! the serialization; the *unsigned* identity clears every input script
//! first so adding signatures never changes it (malleability-stable).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constants::SIGHASH_ALL;
use crate::error::TxError;
use crate::hash::{sha256d, Hash256};
use crate::script::Script;

/// A transaction input spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RawTxIn {
    /// Hash of the transaction containing the spent output.
    pub outhash: Hash256,
    /// Index of the spent output in that transaction.
    pub outindex: u32,
    /// Signature script.
    pub script: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RawTxOut {
    /// Value in satoshis.
    pub value: u64,
    /// Output script.
    pub script: Vec<u8>,
}

/// A complete transaction in wire form.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RawTx {
    pub version: u32,
    pub txins: Vec<RawTxIn>,
    pub txouts: Vec<RawTxOut>,
    pub locktime: u32,
}

impl RawTx {
    /// Serialize to the wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.txins.len() as u64);
        for txin in &self.txins {
            out.extend_from_slice(txin.outhash.as_bytes());
            out.extend_from_slice(&txin.outindex.to_le_bytes());
            write_varint(&mut out, txin.script.len() as u64);
            out.extend_from_slice(&txin.script);
            out.extend_from_slice(&txin.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.txouts.len() as u64);
        for txout in &self.txouts {
            out.extend_from_slice(&txout.value.to_le_bytes());
            write_varint(&mut out, txout.script.len() as u64);
            out.extend_from_slice(&txout.script);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    /// Parse from the wire format. The input must be consumed exactly.
    pub fn parse(raw: &[u8]) -> Result<Self, TxError> {
        let mut cursor = Cursor::new(raw);
        let version = cursor.read_u32()?;
        let txin_count = cursor.read_varint()?;
        let mut txins = Vec::with_capacity(txin_count.min(1024) as usize);
        for _ in 0..txin_count {
            let outhash = Hash256(cursor.read_array::<32>()?);
            let outindex = cursor.read_u32()?;
            let script_len = cursor.read_varint()?;
            let script = cursor.read_bytes(script_len as usize)?.to_vec();
            let sequence = cursor.read_u32()?;
            txins.push(RawTxIn {
                outhash,
                outindex,
                script,
                sequence,
            });
        }
        let txout_count = cursor.read_varint()?;
        let mut txouts = Vec::with_capacity(txout_count.min(1024) as usize);
        for _ in 0..txout_count {
            let value = cursor.read_u64()?;
            let script_len = cursor.read_varint()?;
            let script = cursor.read_bytes(script_len as usize)?.to_vec();
            txouts.push(RawTxOut { value, script });
        }
        let locktime = cursor.read_u32()?;
        if !cursor.is_empty() {
            return Err(TxError::InvalidTx("trailing bytes".into()));
        }
        Ok(Self {
            version,
            txins,
            txouts,
            locktime,
        })
    }

    /// Transaction id: sha256d of the serialization.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// A copy with every input script cleared.
    pub fn with_cleared_scripts(&self) -> Self {
        let mut cleared = self.clone();
        for txin in &mut cleared.txins {
            txin.script.clear();
        }
        cleared
    }

    /// Malleability-stable id: sha256d with every input script cleared.
    pub fn unsigned_txid(&self) -> Hash256 {
        self.with_cleared_scripts().txid()
    }

    /// SIGHASH_ALL digest for one input.
    ///
    /// The indexed input's script is replaced by `subscript` (redeem script
    /// or txout script), every other input script is cleared, and the
    /// four-byte sighash type is appended before hashing.
    pub fn signing_hash(&self, input_index: usize, subscript: &[u8]) -> Result<Hash256, TxError> {
        if input_index >= self.txins.len() {
            return Err(TxError::InputIndexOutOfBounds {
                index: input_index,
                len: self.txins.len(),
            });
        }
        let mut copy = self.with_cleared_scripts();
        copy.txins[input_index].script = subscript.to_vec();
        let mut preimage = copy.serialize();
        preimage.extend_from_slice(&(SIGHASH_ALL as u32).to_le_bytes());
        Ok(sha256d(&preimage))
    }

    /// Signatures still required: the maximum over all inputs.
    ///
    /// Inputs whose scripts do not parse as signing scripts (spends of
    /// outputs the vault does not own) need no signatures from us.
    pub fn missing_sig_count(&self) -> u32 {
        self.txins
            .iter()
            .filter_map(|txin| Script::parse(&txin.script).ok())
            .map(|script| script.sigs_needed())
            .max()
            .unwrap_or(0)
    }

    /// The set of pubkeys whose signature slots are still empty, across
    /// all inputs.
    pub fn missing_sig_pubkeys(&self) -> BTreeSet<Vec<u8>> {
        let mut pubkeys = BTreeSet::new();
        for txin in &self.txins {
            if let Ok(script) = Script::parse(&txin.script) {
                pubkeys.extend(script.missing_sig_pubkeys());
            }
        }
        pubkeys
    }

    /// Whether every input carries its full signature set.
    pub fn is_fully_signed(&self) -> bool {
        self.missing_sig_count() == 0
    }
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// Byte cursor for wire parsing.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], TxError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| TxError::InvalidTx("truncated".into()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], TxError> {
        Ok(self.read_bytes(N)?.try_into().expect("sized read"))
    }

    fn read_u32(&mut self) -> Result<u32, TxError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64, TxError> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_varint(&mut self) -> Result<u64, TxError> {
        let tag = self.read_bytes(1)?[0];
        Ok(match tag {
            0xfd => u16::from_le_bytes(self.read_array::<2>()?) as u64,
            0xfe => u32::from_le_bytes(self.read_array::<4>()?) as u64,
            0xff => u64::from_le_bytes(self.read_array::<8>()?),
            n => n as u64,
        })
    }
}
