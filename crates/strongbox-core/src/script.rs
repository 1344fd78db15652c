//! Output scripts, redeem scripts, and signature-script templates.
//!
//! A [`Script`] is the signing-side view of an output: the pubkeys, the
//! required signature count, and a signature slot per pubkey. Slots start as
//! zero-length placeholders and are filled during signing; the three
//! [`SigFormat`] renderings produce the editable template, the sighash
//! subscript, and the broadcast form.
//!
//! Single-key scripts are pay-to-pubkey-hash; multi-key scripts are m-of-n
//! multisig wrapped in pay-to-script-hash.

use crate::constants::{
    OP_0, OP_1, OP_CHECKMULTISIG, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160,
    OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4,
};
use crate::error::ScriptError;
use crate::hash::hash160;

/// Rendering mode for a signature script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigFormat {
    /// Keep zero-length placeholders for missing signatures.
    Edit,
    /// The subscript substituted while computing a sighash: the redeem
    /// script for multisig, the txout script for pay-to-pubkey-hash.
    Sign,
    /// Strip empty placeholders for network broadcast.
    Broadcast,
}

/// What a txout script pays to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payee {
    PubkeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    Pubkey(Vec<u8>),
    Empty,
    Unknown,
}

/// The two script shapes the vault issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptKind {
    PubkeyHash,
    MultisigScriptHash,
}

/// Emit a push operator for `n` bytes of data.
pub fn push_data(n: usize) -> Vec<u8> {
    if n <= 0x4b {
        vec![n as u8]
    } else if n <= 0xff {
        vec![OP_PUSHDATA1, n as u8]
    } else if n <= 0xffff {
        vec![OP_PUSHDATA2, (n & 0xff) as u8, (n >> 8) as u8]
    } else {
        vec![
            OP_PUSHDATA4,
            (n & 0xff) as u8,
            ((n >> 8) & 0xff) as u8,
            ((n >> 16) & 0xff) as u8,
            (n >> 24) as u8,
        ]
    }
}

/// Read a push operator at `pos`, returning the data length and advancing
/// `pos` to the start of the data.
fn read_push_len(script: &[u8], pos: &mut usize) -> Result<usize, ScriptError> {
    let op = *script
        .get(*pos)
        .ok_or(ScriptError::TruncatedPush)?;
    *pos += 1;
    match op {
        n if n <= 0x4b => Ok(n as usize),
        OP_PUSHDATA1 => {
            let n = *script.get(*pos).ok_or(ScriptError::TruncatedPush)?;
            *pos += 1;
            Ok(n as usize)
        }
        OP_PUSHDATA2 => {
            if *pos + 2 > script.len() {
                return Err(ScriptError::TruncatedPush);
            }
            let n = script[*pos] as usize | (script[*pos + 1] as usize) << 8;
            *pos += 2;
            Ok(n)
        }
        OP_PUSHDATA4 => {
            if *pos + 4 > script.len() {
                return Err(ScriptError::TruncatedPush);
            }
            let n = script[*pos] as usize
                | (script[*pos + 1] as usize) << 8
                | (script[*pos + 2] as usize) << 16
                | (script[*pos + 3] as usize) << 24;
            *pos += 4;
            Ok(n)
        }
        other => Err(ScriptError::InvalidScript(format!(
            "opcode {other:#04x} is not a push"
        ))),
    }
}

/// Build a pay-to-pubkey-hash txout script over a 20-byte hash.
pub fn p2pkh_txoutscript(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Build a pay-to-script-hash txout script over a 20-byte hash.
pub fn p2sh_txoutscript(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

/// Classify a txout script and extract its payee data.
pub fn script_payee(txoutscript: &[u8]) -> Payee {
    if txoutscript.len() == 25
        && txoutscript[0] == OP_DUP
        && txoutscript[1] == OP_HASH160
        && txoutscript[2] == 0x14
        && txoutscript[23] == OP_EQUALVERIFY
        && txoutscript[24] == OP_CHECKSIG
    {
        return Payee::PubkeyHash(txoutscript[3..23].try_into().expect("sized slice"));
    }
    if txoutscript.len() == 23
        && txoutscript[0] == OP_HASH160
        && txoutscript[1] == 0x14
        && txoutscript[22] == OP_EQUAL
    {
        return Payee::ScriptHash(txoutscript[2..22].try_into().expect("sized slice"));
    }
    if txoutscript.is_empty() {
        return Payee::Empty;
    }
    // Bare pay-to-pubkey: a single push followed by OP_CHECKSIG.
    let mut pos = 0;
    if let Ok(len) = read_push_len(txoutscript, &mut pos) {
        if pos + len + 1 == txoutscript.len() && txoutscript[pos + len] == OP_CHECKSIG {
            return Payee::Pubkey(txoutscript[pos..pos + len].to_vec());
        }
    }
    Payee::Unknown
}

/// A signing script: pubkeys, required signatures, and per-pubkey signature
/// slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    kind: ScriptKind,
    minsigs: u32,
    pubkeys: Vec<Vec<u8>>,
    /// One slot per pubkey; empty means missing.
    sigs: Vec<Vec<u8>>,
    /// Redeem script; empty for pay-to-pubkey-hash.
    redeemscript: Vec<u8>,
    /// Payee hash: HASH160 of the pubkey or of the redeem script.
    hash: [u8; 20],
}

impl Script {
    /// Single-signature script over one compressed pubkey.
    pub fn pay_to_pubkey_hash(pubkey: Vec<u8>) -> Self {
        let hash = hash160(&pubkey);
        Self {
            kind: ScriptKind::PubkeyHash,
            minsigs: 1,
            sigs: vec![Vec::new()],
            pubkeys: vec![pubkey],
            redeemscript: Vec::new(),
            hash,
        }
    }

    /// m-of-n multisig script-hash over the given pubkeys, in the given
    /// order.
    pub fn multisig(minsigs: u32, pubkeys: Vec<Vec<u8>>) -> Result<Self, ScriptError> {
        if minsigs == 0 || pubkeys.is_empty() || pubkeys.len() > 16 || minsigs as usize > pubkeys.len()
        {
            return Err(ScriptError::InvalidMultisig {
                minsigs,
                keys: pubkeys.len(),
            });
        }
        let mut redeemscript = Vec::new();
        redeemscript.push(OP_1 - 1 + minsigs as u8);
        for pubkey in &pubkeys {
            redeemscript.extend_from_slice(&push_data(pubkey.len()));
            redeemscript.extend_from_slice(pubkey);
        }
        redeemscript.push(OP_1 - 1 + pubkeys.len() as u8);
        redeemscript.push(OP_CHECKMULTISIG);
        let hash = hash160(&redeemscript);
        Ok(Self {
            kind: ScriptKind::MultisigScriptHash,
            minsigs,
            sigs: vec![Vec::new(); pubkeys.len()],
            pubkeys,
            redeemscript,
            hash,
        })
    }

    /// Parse a signature script in Edit or Broadcast form.
    ///
    /// Two pushes are a pay-to-pubkey-hash `(sig, pubkey)`; a leading empty
    /// push followed by signature pushes and a redeem script is multisig.
    pub fn parse(txinscript: &[u8]) -> Result<Self, ScriptError> {
        let mut objects: Vec<Vec<u8>> = Vec::new();
        let mut pos = 0;
        while pos < txinscript.len() {
            let len = read_push_len(txinscript, &mut pos)?;
            if pos + len > txinscript.len() {
                return Err(ScriptError::TruncatedPush);
            }
            objects.push(txinscript[pos..pos + len].to_vec());
            pos += len;
        }

        if objects.len() == 2 {
            let pubkey = objects.pop().expect("length checked");
            let sig = objects.pop().expect("length checked");
            let hash = hash160(&pubkey);
            return Ok(Self {
                kind: ScriptKind::PubkeyHash,
                minsigs: 1,
                pubkeys: vec![pubkey],
                sigs: vec![sig],
                redeemscript: Vec::new(),
                hash,
            });
        }

        if objects.len() >= 3 && objects[0].is_empty() {
            let redeemscript = objects.pop().expect("length checked");
            let sigs: Vec<Vec<u8>> = objects.drain(1..).collect();
            let (minsigs, pubkeys) = parse_redeemscript(&redeemscript)?;
            let hash = hash160(&redeemscript);
            return Ok(Self {
                kind: ScriptKind::MultisigScriptHash,
                minsigs,
                pubkeys,
                sigs,
                redeemscript,
                hash,
            });
        }

        Err(ScriptError::InvalidScript(format!(
            "unrecognized signature script with {} pushes",
            objects.len()
        )))
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn minsigs(&self) -> u32 {
        self.minsigs
    }

    pub fn pubkeys(&self) -> &[Vec<u8>] {
        &self.pubkeys
    }

    pub fn sigs(&self) -> &[Vec<u8>] {
        &self.sigs
    }

    pub fn redeemscript(&self) -> &[u8] {
        &self.redeemscript
    }

    /// The payee hash embedded in the txout script.
    pub fn script_hash(&self) -> &[u8; 20] {
        &self.hash
    }

    /// Render the signature script.
    pub fn txinscript(&self, format: SigFormat) -> Vec<u8> {
        let mut script = Vec::new();
        if format != SigFormat::Sign {
            if self.kind == ScriptKind::MultisigScriptHash {
                // Extra OP_0 consumed by OP_CHECKMULTISIG.
                script.push(OP_0);
            }
            for sig in &self.sigs {
                if !sig.is_empty() || format == SigFormat::Edit {
                    script.extend_from_slice(&push_data(sig.len()));
                    script.extend_from_slice(sig);
                }
            }
        }
        match self.kind {
            ScriptKind::PubkeyHash => {
                if format == SigFormat::Sign {
                    script.extend_from_slice(&self.txoutscript());
                } else {
                    script.extend_from_slice(&push_data(self.pubkeys[0].len()));
                    script.extend_from_slice(&self.pubkeys[0]);
                }
            }
            ScriptKind::MultisigScriptHash => {
                if format != SigFormat::Sign {
                    script.extend_from_slice(&push_data(self.redeemscript.len()));
                }
                script.extend_from_slice(&self.redeemscript);
            }
        }
        script
    }

    /// The txout script this signing script spends to.
    pub fn txoutscript(&self) -> Vec<u8> {
        match self.kind {
            ScriptKind::PubkeyHash => p2pkh_txoutscript(&self.hash),
            ScriptKind::MultisigScriptHash => p2sh_txoutscript(&self.hash),
        }
    }

    /// How many signatures are still required.
    pub fn sigs_needed(&self) -> u32 {
        let mut needed = self.minsigs;
        for sig in &self.sigs {
            if !sig.is_empty() {
                needed -= 1;
            }
            if needed == 0 {
                break;
            }
        }
        needed
    }

    /// Pubkeys whose signature slots are still empty, in slot order.
    pub fn missing_sig_pubkeys(&self) -> Vec<Vec<u8>> {
        let mut missing = Vec::new();
        let mut filled = 0;
        for (i, sig) in self.sigs.iter().enumerate() {
            if !sig.is_empty() {
                filled += 1;
                if filled > self.minsigs {
                    break;
                }
            } else if let Some(pubkey) = self.pubkeys.get(i) {
                missing.push(pubkey.clone());
            }
        }
        missing
    }

    /// Fill the slot belonging to `pubkey`. Returns true iff the slot was
    /// empty and has been filled; signatures for unknown pubkeys are
    /// dropped.
    pub fn add_sig(&mut self, pubkey: &[u8], sig: Vec<u8>) -> bool {
        if self.sigs_needed() == 0 {
            return false;
        }
        for (i, slot) in self.sigs.iter_mut().enumerate() {
            if slot.is_empty() && self.pubkeys.get(i).is_some_and(|pk| pk.as_slice() == pubkey) {
                *slot = sig;
                return true;
            }
        }
        false
    }

    /// Reset every slot to an empty placeholder.
    pub fn clear_sigs(&mut self) {
        self.sigs = vec![Vec::new(); self.pubkeys.len()];
    }

    /// Copy signatures out of another rendering of the same script into
    /// empty slots. Returns the number of signatures added.
    ///
    /// Both scripts must agree on kind, minsigs, and pubkeys; signatures
    /// attached to unknown pubkey sets are rejected wholesale.
    pub fn merge_sigs(&mut self, other: &Script) -> Result<u32, ScriptError> {
        if self.kind != other.kind {
            return Err(ScriptError::MergeMismatch("script kinds differ".into()));
        }
        if self.minsigs != other.minsigs {
            return Err(ScriptError::MergeMismatch("signature minimums differ".into()));
        }
        if self.pubkeys != other.pubkeys {
            return Err(ScriptError::MergeMismatch("public keys differ".into()));
        }
        if self.sigs.len() != other.sigs.len() {
            return Err(ScriptError::MergeMismatch("signature slot counts differ".into()));
        }
        let mut added = 0;
        for (slot, incoming) in self.sigs.iter_mut().zip(&other.sigs) {
            if slot.is_empty() && !incoming.is_empty() {
                *slot = incoming.clone();
                added += 1;
            }
        }
        Ok(added)
    }
}

/// Parse an m-of-n redeem script, returning (minsigs, pubkeys).
fn parse_redeemscript(redeemscript: &[u8]) -> Result<(u32, Vec<Vec<u8>>), ScriptError> {
    if redeemscript.len() < 3 {
        return Err(ScriptError::InvalidScript("redeem script too short".into()));
    }
    let minsigs_op = redeemscript[0];
    if !(OP_1..=OP_1 + 15).contains(&minsigs_op) {
        return Err(ScriptError::InvalidScript("invalid signature minimum".into()));
    }
    let minsigs = (minsigs_op - OP_1 + 1) as u32;

    let mut pubkeys: Vec<Vec<u8>> = Vec::new();
    let mut pos = 1;
    loop {
        let byte = *redeemscript
            .get(pos)
            .ok_or_else(|| ScriptError::InvalidScript("redeem script terminates prematurely".into()))?;
        pos += 1;
        if (OP_1..=OP_1 + 15).contains(&byte) {
            let numkeys = (byte - OP_1 + 1) as usize;
            if numkeys != pubkeys.len() {
                return Err(ScriptError::InvalidScript("key count mismatch".into()));
            }
            if (numkeys as u32) < minsigs {
                return Err(ScriptError::InvalidMultisig {
                    minsigs,
                    keys: numkeys,
                });
            }
            if redeemscript.get(pos) != Some(&OP_CHECKMULTISIG) || pos + 1 != redeemscript.len() {
                return Err(ScriptError::InvalidScript("invalid script termination".into()));
            }
            break;
        }
        // Interpret the byte as a pubkey push length.
        let len = byte as usize;
        if byte > 0x4b || pos + len > redeemscript.len() {
            return Err(ScriptError::InvalidScript(format!(
                "invalid op at byte {}",
                pos - 1
            )));
        }
        if pubkeys.len() == 16 {
            return Err(ScriptError::InvalidScript("more than 16 public keys".into()));
        }
        pubkeys.push(redeemscript[pos..pos + len].to_vec());
        pos += len;
    }
    Ok((minsigs, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkeys(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                let mut pk = vec![0x02u8];
                pk.extend_from_slice(&[i as u8 + 1; 32]);
                pk
            })
            .collect()
    }

    #[test]
    fn p2pkh_txoutscript_layout() {
        let script = Script::pay_to_pubkey_hash(pubkeys(1).remove(0));
        let out = script.txoutscript();
        assert_eq!(out.len(), 25);
        assert_eq!(out[0], OP_DUP);
        assert_eq!(out[24], OP_CHECKSIG);
        assert_eq!(script_payee(&out), Payee::PubkeyHash(*script.script_hash()));
    }

    #[test]
    fn multisig_txoutscript_layout() {
        let script = Script::multisig(2, pubkeys(3)).unwrap();
        let out = script.txoutscript();
        assert_eq!(out.len(), 23);
        assert_eq!(out[0], OP_HASH160);
        assert_eq!(out[22], OP_EQUAL);
        assert_eq!(script_payee(&out), Payee::ScriptHash(*script.script_hash()));
        // Redeem script: OP_2 <pk>*3 OP_3 OP_CHECKMULTISIG
        let redeem = script.redeemscript();
        assert_eq!(redeem[0], OP_1 + 1);
        assert_eq!(redeem[redeem.len() - 2], OP_1 + 2);
        assert_eq!(redeem[redeem.len() - 1], OP_CHECKMULTISIG);
    }

    #[test]
    fn multisig_parameter_validation() {
        assert!(Script::multisig(0, pubkeys(2)).is_err());
        assert!(Script::multisig(3, pubkeys(2)).is_err());
        assert!(Script::multisig(1, pubkeys(17)).is_err());
        assert!(Script::multisig(2, pubkeys(2)).is_ok());
    }

    #[test]
    fn edit_parse_roundtrip_multisig() {
        let script = Script::multisig(2, pubkeys(3)).unwrap();
        let edit = script.txinscript(SigFormat::Edit);
        let parsed = Script::parse(&edit).unwrap();
        assert_eq!(parsed, script);
    }

    #[test]
    fn edit_parse_roundtrip_p2pkh() {
        let script = Script::pay_to_pubkey_hash(pubkeys(1).remove(0));
        let edit = script.txinscript(SigFormat::Edit);
        let parsed = Script::parse(&edit).unwrap();
        assert_eq!(parsed, script);
    }

    #[test]
    fn sign_format_is_subscript() {
        let single = Script::pay_to_pubkey_hash(pubkeys(1).remove(0));
        assert_eq!(single.txinscript(SigFormat::Sign), single.txoutscript());
        let multi = Script::multisig(2, pubkeys(3)).unwrap();
        assert_eq!(multi.txinscript(SigFormat::Sign), multi.redeemscript());
    }

    #[test]
    fn signature_counting() {
        let keys = pubkeys(3);
        let mut script = Script::multisig(2, keys.clone()).unwrap();
        assert_eq!(script.sigs_needed(), 2);
        assert_eq!(script.missing_sig_pubkeys().len(), 3);

        assert!(script.add_sig(&keys[1], vec![0xAA; 70]));
        assert_eq!(script.sigs_needed(), 1);
        assert_eq!(script.missing_sig_pubkeys(), vec![keys[0].clone(), keys[2].clone()]);

        // Same pubkey again: slot already filled.
        assert!(!script.add_sig(&keys[1], vec![0xBB; 70]));

        assert!(script.add_sig(&keys[0], vec![0xCC; 70]));
        assert_eq!(script.sigs_needed(), 0);
        // Quorum reached, further signatures are refused.
        assert!(!script.add_sig(&keys[2], vec![0xDD; 70]));
    }

    #[test]
    fn unknown_pubkey_signature_dropped() {
        let mut script = Script::multisig(2, pubkeys(3)).unwrap();
        let stranger = vec![0x03u8; 33];
        assert!(!script.add_sig(&stranger, vec![0xEE; 70]));
        assert_eq!(script.sigs_needed(), 2);
    }

    #[test]
    fn broadcast_strips_placeholders() {
        let keys = pubkeys(3);
        let mut script = Script::multisig(2, keys.clone()).unwrap();
        script.add_sig(&keys[0], vec![0xAA; 70]);
        script.add_sig(&keys[2], vec![0xBB; 70]);

        let broadcast = script.txinscript(SigFormat::Broadcast);
        // OP_0, two sig pushes, one redeem push. No empty placeholder.
        let parsed = Script::parse(&broadcast).unwrap();
        assert_eq!(parsed.sigs().len(), 2);
        assert!(parsed.sigs().iter().all(|s| !s.is_empty()));

        let edit = script.txinscript(SigFormat::Edit);
        let parsed = Script::parse(&edit).unwrap();
        assert_eq!(parsed.sigs().len(), 3);
        assert_eq!(parsed.sigs()[1], Vec::<u8>::new());
    }

    #[test]
    fn merge_sigs_fills_empty_slots() {
        let keys = pubkeys(3);
        let mut ours = Script::multisig(2, keys.clone()).unwrap();
        ours.add_sig(&keys[0], vec![0xAA; 70]);

        let mut theirs = Script::multisig(2, keys.clone()).unwrap();
        theirs.add_sig(&keys[1], vec![0xBB; 70]);

        assert_eq!(ours.merge_sigs(&theirs).unwrap(), 1);
        assert_eq!(ours.sigs_needed(), 0);
        // Merging again adds nothing.
        assert_eq!(ours.merge_sigs(&theirs).unwrap(), 0);
    }

    #[test]
    fn merge_sigs_rejects_different_scripts() {
        let mut ours = Script::multisig(2, pubkeys(3)).unwrap();
        let theirs = Script::multisig(2, pubkeys(2)).unwrap();
        assert!(ours.merge_sigs(&theirs).is_err());
    }

    #[test]
    fn clear_sigs_resets_slots() {
        let keys = pubkeys(2);
        let mut script = Script::multisig(1, keys.clone()).unwrap();
        script.add_sig(&keys[0], vec![0xAA; 70]);
        script.clear_sigs();
        assert_eq!(script.sigs_needed(), 1);
        assert_eq!(script.sigs().len(), 2);
    }

    #[test]
    fn payee_classification() {
        assert_eq!(script_payee(&[]), Payee::Empty);
        assert_eq!(script_payee(&[0x6a, 0x01, 0xff]), Payee::Unknown);
        let pk = pubkeys(1).remove(0);
        let mut p2pk = push_data(pk.len());
        p2pk.extend_from_slice(&pk);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(script_payee(&p2pk), Payee::Pubkey(pk));
    }

    #[test]
    fn push_data_widths() {
        assert_eq!(push_data(0), vec![0x00]);
        assert_eq!(push_data(0x4b), vec![0x4b]);
        assert_eq!(push_data(0x4c), vec![OP_PUSHDATA1, 0x4c]);
        assert_eq!(push_data(0x100), vec![OP_PUSHDATA2, 0x00, 0x01]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Script::parse(&[0xff]).is_err());
        // Push length overrunning the script.
        assert!(Script::parse(&[0x05, 0x01]).is_err());
    }
}
