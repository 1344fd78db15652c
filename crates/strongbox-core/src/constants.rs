//! Protocol constants shared by the vault and its foundation types.

/// SIGHASH type appended to every signature: sign all inputs and outputs.
pub const SIGHASH_ALL: u8 = 0x01;

/// Bit flag marking a hardened BIP32 child index.
pub const HARDENED: u32 = 0x8000_0000;

/// An account may reference at most this many keychains (script-level limit
/// of OP_CHECKMULTISIG).
pub const MAX_KEYCHAINS: usize = 15;

/// Default lookahead pool size for freshly created accounts.
pub const DEFAULT_UNUSED_POOL_SIZE: u32 = 25;

/// Sequence number used for inputs of locally built transactions.
pub const FINAL_SEQUENCE: u32 = 0xffff_ffff;

/// Maximum bloom filter size in bytes (BIP37).
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;

/// Maximum number of bloom filter hash functions (BIP37).
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;

// Script opcodes. Only the handful the vault emits and parses.
pub const OP_0: u8 = 0x00;
pub const OP_1: u8 = 0x51;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardened_is_high_bit() {
        assert_eq!(HARDENED, 1 << 31);
    }

    #[test]
    fn multisig_limit_fits_opcodes() {
        // OP_1 + 15 still encodes as a small-integer opcode.
        assert!(OP_1 as usize + MAX_KEYCHAINS <= 0x60);
    }
}
