//! Block headers, merkle blocks, and full blocks.
//!
//! The vault tracks headers for chain continuity and merkle blocks for
//! transaction confirmation. It performs no consensus validation beyond
//! prevhash continuity; difficulty and proof-of-work are the network
//! layer's concern.

use serde::{Deserialize, Serialize};

use crate::error::BlockError;
use crate::hash::{sha256d, Hash256};
use crate::tx::RawTx;

/// Serialized block header length.
pub const HEADER_LEN: usize = 80;

/// A block header in wire form.
///
/// Hash is sha256d over the fixed 80-byte layout: version ‖ prevhash ‖
/// merkleroot ‖ timestamp ‖ bits ‖ nonce, integers little-endian.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    pub prevhash: Hash256,
    pub merkleroot: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte wire layout.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prevhash.as_bytes());
        out[36..68].copy_from_slice(self.merkleroot.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse the 80-byte wire layout.
    pub fn parse(raw: &[u8]) -> Result<Self, BlockError> {
        if raw.len() != HEADER_LEN {
            return Err(BlockError::InvalidHeader(format!(
                "length {} != {HEADER_LEN}",
                raw.len()
            )));
        }
        Ok(Self {
            version: u32::from_le_bytes(raw[0..4].try_into().expect("sized slice")),
            prevhash: Hash256(raw[4..36].try_into().expect("sized slice")),
            merkleroot: Hash256(raw[36..68].try_into().expect("sized slice")),
            timestamp: u32::from_le_bytes(raw[68..72].try_into().expect("sized slice")),
            bits: u32::from_le_bytes(raw[72..76].try_into().expect("sized slice")),
            nonce: u32::from_le_bytes(raw[76..80].try_into().expect("sized slice")),
        })
    }

    /// The block hash.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// Whether this header claims to be a chain root.
    pub fn is_genesis(&self) -> bool {
        self.prevhash.is_zero()
    }
}

/// A filtered block: header plus the transaction hashes that matched the
/// peer-side bloom filter and the partial-merkle-tree flag bitmap.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    /// Total transactions in the full block.
    pub txcount: u32,
    /// Matched transaction hashes, in block order.
    pub hashes: Vec<Hash256>,
    /// Partial merkle tree traversal flags.
    pub flags: Vec<u8>,
}

/// A full block.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<RawTx>,
}

impl Block {
    /// View this block as a merkle block matching every transaction.
    pub fn to_merkle_block(&self) -> MerkleBlock {
        MerkleBlock {
            header: self.header.clone(),
            txcount: self.txs.len() as u32,
            hashes: self.txs.iter().map(RawTx::txid).collect(),
            flags: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis_header() -> BlockHeader {
        // The Bitcoin genesis block header; its hash is the best-known
        // sha256d test vector there is.
        let merkleroot: [u8; 32] =
            hex::decode("3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a")
                .unwrap()
                .try_into()
                .unwrap();
        BlockHeader {
            version: 1,
            prevhash: Hash256::ZERO,
            merkleroot: Hash256(merkleroot),
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn genesis_hash_matches_known_vector() {
        assert_eq!(
            genesis_header().hash().to_string(),
            "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000"
        );
    }

    #[test]
    fn header_roundtrip() {
        let header = genesis_header();
        let raw = header.serialize();
        assert_eq!(BlockHeader::parse(&raw).unwrap(), header);
    }

    #[test]
    fn header_parse_rejects_bad_length() {
        assert!(BlockHeader::parse(&[0u8; 79]).is_err());
        assert!(BlockHeader::parse(&[0u8; 81]).is_err());
    }

    #[test]
    fn genesis_detection() {
        let header = genesis_header();
        assert!(header.is_genesis());
        let mut child = header.clone();
        child.prevhash = header.hash();
        assert!(!child.is_genesis());
    }

    #[test]
    fn block_to_merkle_block_matches_all_txs() {
        use crate::tx::{RawTxIn, RawTxOut};
        let tx = RawTx {
            version: 1,
            txins: vec![RawTxIn {
                outhash: Hash256::ZERO,
                outindex: 0xffff_ffff,
                script: vec![0x04, 0x01, 0x02, 0x03, 0x04],
                sequence: 0xffff_ffff,
            }],
            txouts: vec![RawTxOut {
                value: 50_0000_0000,
                script: Vec::new(),
            }],
            locktime: 0,
        };
        let block = Block {
            header: genesis_header(),
            txs: vec![tx.clone()],
        };
        let mb = block.to_merkle_block();
        assert_eq!(mb.txcount, 1);
        assert_eq!(mb.hashes, vec![tx.txid()]);
    }
}
