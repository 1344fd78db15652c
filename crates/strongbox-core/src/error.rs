//! Error types for the strongbox foundation crate.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeychainError {
    #[error("derivation result out of range at index {0}")] InvalidDerivation(u32),
    #[error("secret is locked: {0}")] Locked(String),
    #[error("keychain is not private")] NotPrivate,
    #[error("bad lock key")] BadLockKey,
    #[error("secret is already encrypted")] AlreadyEncrypted,
    #[error("invalid extended key: {0}")] InvalidExtendedKey(String),
    #[error("invalid entropy length: {0}")] InvalidEntropy(usize),
    #[error("invalid key material: {0}")] InvalidKey(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("invalid script: {0}")] InvalidScript(String),
    #[error("invalid multisig parameters: {minsigs} of {keys}")] InvalidMultisig { minsigs: u32, keys: usize },
    #[error("push operation exceeds script length")] TruncatedPush,
    #[error("scripts cannot be merged: {0}")] MergeMismatch(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("malformed transaction: {0}")] InvalidTx(String),
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error(transparent)] Script(#[from] ScriptError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58: {0}")] InvalidBase58(String),
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid payload length: {0}")] InvalidLength(usize),
    #[error("unknown address version: {0}")] UnknownVersion(u8),
    #[error("script has no address form")] Unaddressable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("malformed block header: {0}")] InvalidHeader(String),
    #[error("malformed merkle block: {0}")] InvalidMerkleBlock(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            KeychainError::InvalidDerivation(7).to_string(),
            "derivation result out of range at index 7"
        );
        assert_eq!(
            ScriptError::InvalidMultisig { minsigs: 3, keys: 2 }.to_string(),
            "invalid multisig parameters: 3 of 2"
        );
        assert_eq!(
            TxError::InputIndexOutOfBounds { index: 4, len: 2 }.to_string(),
            "input index out of bounds: 4 >= 2"
        );
    }

    #[test]
    fn script_error_converts_into_tx_error() {
        let e: TxError = ScriptError::TruncatedPush.into();
        assert_eq!(e, TxError::Script(ScriptError::TruncatedPush));
    }
}
