//! Word/number tokenisation for text streams. Each text stream owns one
//! preprocessor whose dictionary persists across that stream's parts; the
//! decoder rebuilds the identical dictionary by replaying parts in
//! part-id order, so the sharing policy is part of the bitstream.

use anyhow::Result;
use rustc_hash::FxHashMap;

use crate::buffer::{read_varint, write_varint};

/// Bit 30 of the stored length marks a preprocessed payload.
pub const PP_FLAG: u32 = 1 << 30;

const TOK_DICT_HIT: u8 = 0x01;
const TOK_NEW_WORD: u8 = 0x02;
const TOK_NUMBER: u8 = 0x03;
const TOK_RAW: u8 = 0x04;

/// Digit runs longer than this are kept raw (the value would overflow).
const MAX_NUMBER_DIGITS: usize = 18;

#[inline(always)]
fn is_letter(b: u8) -> bool {
    b.is_ascii_alphabetic()
}

#[inline(always)]
fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

#[derive(Debug, Default)]
pub struct TextPreprocessor {
    words: Vec<Vec<u8>>,
    codes: FxHashMap<Vec<u8>, u64>,
}

impl TextPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_word(&mut self, word: Vec<u8>) {
        let code = self.words.len() as u64;
        self.codes.insert(word.clone(), code);
        self.words.push(word);
    }

    /// Tokenise `input`. Returns `None` (fail-open, dictionary untouched)
    /// when the tokenised form would not be smaller than the input.
    pub fn encode(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len());
        let words_before = self.words.len();

        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            if is_letter(b) {
                let start = i;
                while i < input.len() && is_letter(input[i]) {
                    i += 1;
                }
                let word = &input[start..i];
                if word.len() >= 2 {
                    if let Some(&code) = self.codes.get(word) {
                        out.push(TOK_DICT_HIT);
                        write_varint(&mut out, code);
                    } else {
                        out.push(TOK_NEW_WORD);
                        write_varint(&mut out, word.len() as u64);
                        out.extend_from_slice(word);
                        self.add_word(word.to_vec());
                    }
                } else {
                    out.push(word[0]);
                }
            } else if is_digit(b) {
                let start = i;
                while i < input.len() && is_digit(input[i]) {
                    i += 1;
                }
                let run = &input[start..i];
                let canonical = run.len() <= MAX_NUMBER_DIGITS && (run.len() == 1 || run[0] != b'0');
                if canonical {
                    let mut value = 0u64;
                    for &d in run {
                        value = value * 10 + (d - b'0') as u64;
                    }
                    out.push(TOK_NUMBER);
                    write_varint(&mut out, value);
                } else {
                    out.push(TOK_RAW);
                    write_varint(&mut out, run.len() as u64);
                    out.extend_from_slice(run);
                }
            } else if b < 0x05 {
                out.push(TOK_RAW);
                write_varint(&mut out, 1);
                out.push(b);
                i += 1;
            } else {
                out.push(b);
                i += 1;
            }
        }

        if out.len() < input.len() {
            Some(out)
        } else {
            // Roll the dictionary back so the decoder, which never sees
            // this part's tokens, stays in sync.
            for word in self.words.drain(words_before..) {
                self.codes.remove(&word);
            }
            None
        }
    }

    /// Invert [`encode`], replaying dictionary growth.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let mut pos = 0;
        while pos < data.len() {
            let tok = data[pos];
            pos += 1;
            match tok {
                TOK_DICT_HIT => {
                    let code = read_varint(data, &mut pos)? as usize;
                    let word = self
                        .words
                        .get(code)
                        .ok_or_else(|| anyhow::anyhow!("text dictionary code {code} out of range"))?;
                    out.extend_from_slice(word);
                }
                TOK_NEW_WORD => {
                    let len = read_varint(data, &mut pos)? as usize;
                    let word = data
                        .get(pos..pos + len)
                        .ok_or_else(|| anyhow::anyhow!("truncated word token"))?
                        .to_vec();
                    pos += len;
                    out.extend_from_slice(&word);
                    self.add_word(word);
                }
                TOK_NUMBER => {
                    let value = read_varint(data, &mut pos)?;
                    out.extend_from_slice(value.to_string().as_bytes());
                }
                TOK_RAW => {
                    let len = read_varint(data, &mut pos)? as usize;
                    let run = data
                        .get(pos..pos + len)
                        .ok_or_else(|| anyhow::anyhow!("truncated raw token"))?;
                    pos += len;
                    out.extend_from_slice(run);
                }
                b => out.push(b),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_one(pp_e: &mut TextPreprocessor, pp_d: &mut TextPreprocessor, input: &[u8]) {
        match pp_e.encode(input) {
            Some(encoded) => {
                assert!(encoded.len() < input.len());
                assert_eq!(pp_d.decode(&encoded).unwrap(), input);
            }
            None => { /* fail-open: raw part, decoder untouched */ }
        }
    }

    #[test]
    fn roundtrip_typical_info_text() {
        let mut enc = TextPreprocessor::new();
        let mut dec = TextPreprocessor::new();
        let input = b"DP=100;AF=0.5;ANN=missense_variant|MODERATE|gene|gene;DP=100";
        roundtrip_one(&mut enc, &mut dec, input);
    }

    #[test]
    fn dictionary_persists_across_parts() {
        let mut enc = TextPreprocessor::new();
        let mut dec = TextPreprocessor::new();
        let part1 = b"missense;missense;synonymous;missense;synonymous;missense";
        let part2 = b"synonymous;missense;missense;synonymous;missense;missense";
        let e1 = enc.encode(part1).expect("part1 should shrink");
        let e2 = enc.encode(part2).expect("part2 should shrink");
        // Part 2 is all dictionary hits, so it shrinks far below part 1.
        assert!(e2.len() < e1.len());
        assert_eq!(dec.decode(&e1).unwrap(), part1);
        assert_eq!(dec.decode(&e2).unwrap(), part2);
    }

    #[test]
    fn numbers_with_leading_zeros_survive() {
        let mut enc = TextPreprocessor::new();
        let mut dec = TextPreprocessor::new();
        let input = b"rs007;rs007;rs007;pos=00123456789;pos=00123456789;value=12345678901234567890123";
        roundtrip_one(&mut enc, &mut dec, input);
    }

    #[test]
    fn fails_open_on_unfriendly_input() {
        let mut enc = TextPreprocessor::new();
        let input = [0x01, 0x02, 0x03, 0x04, 0x00];
        assert!(enc.encode(&input).is_none());
        // Rolled back: nothing was added to the dictionary.
        assert!(enc.words.is_empty());
    }

    #[test]
    fn rolled_back_words_can_reenter_later() {
        let mut enc = TextPreprocessor::new();
        let mut dec = TextPreprocessor::new();
        // First part fails open (single occurrence, no shrink possible).
        assert!(enc.encode(b"zz").is_none());
        // Same word later must be re-emitted as NEW, not as a stale hit.
        let part = b"zz+zz+zz+zz+zz+zz+zz+zz";
        let e = enc.encode(part).expect("repeats should shrink");
        assert_eq!(dec.decode(&e).unwrap(), part);
    }
}
