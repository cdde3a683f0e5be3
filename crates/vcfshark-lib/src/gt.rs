//! Genotype-matrix coder: rows pass through the PBWT permutation, then
//! each permuted row is emitted as (symbol, run-length) pairs under
//! context-selected adaptive models. Model statistics, the permutation
//! and the rolling contexts persist across every part of the genotype
//! stream; the arithmetic bitstream restarts per part.

use anyhow::Result;

use crate::buffer::ByteStream;
use crate::context::ContextMap;
use crate::pbwt::Pbwt;
use crate::rangecoder::{RangeDecoder, RangeEncoder};

const CTX_FLAG_SYMBOL: u64 = 1 << 60;
const CTX_FLAG_LEN: u64 = 2 << 60;
const CTX_FLAG_LEN_EX: u64 = 3 << 60;
const CTX_FLAG_WIDE1: u64 = 4 << 60;
const CTX_FLAG_WIDE2: u64 = 5 << 60;
const CTX_FLAG_WIDE3: u64 = 6 << 60;

const CTX_PREFIX_MASK: u64 = 0xF_FFFF;
const CTX_SYMBOL_MASK: u64 = 0xFFFF;

/// Symbol values 0..=10 are coded directly; 11/12/13 escape to wide
/// tiers carrying 1/2/3 extra bytes.
const GT_DIRECT_MAX: u32 = 10;
const SYM_WIDE1: usize = 11;
const SYM_WIDE2: usize = 12;
const SYM_WIDE3: usize = 13;
const GT_ALPHABET: usize = 14;

const WIDE1_BASE: u32 = 11;
const WIDE2_BASE: u32 = WIDE1_BASE + 0x100; // 267
const WIDE3_BASE: u32 = WIDE2_BASE + 0x1_0000; // 65803

/// Largest codable genotype symbol value.
pub const GT_MAX_SYMBOL: u32 = WIDE3_BASE + 0xFF_FFFF;

/// Run-length category boundaries.
const LEN_CATS: usize = 7;
const LEN_MID_BASE: u32 = 4; // category 3: 4..=18
const LEN_BYTE_BASE: u32 = 19; // category 4: 19..=274
const LEN_WORD_BASE: u32 = 275; // category 5: 275..=65810
const LEN_WIDE_BASE: u32 = 65811; // category 6

const LOG_CAP_MAIN: u32 = 13;
const LOG_CAP_AUX: u32 = 11;

#[derive(Default)]
pub struct GtCoder {
    pbwt: Pbwt,
    ctx_map: ContextMap,
    ctx_prefix: u64,
    ctx_symbol: u64,
    permuted: Vec<u32>,
    restored: Vec<u32>,
}

impl GtCoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one part: `widths[i]` rows taken consecutively from the
    /// flat `symbols` slice. Returns `[n_symbols: u32][coder bytes]`.
    pub fn encode_part(&mut self, widths: &[usize], symbols: &[u32]) -> Result<Vec<u8>> {
        let total: usize = widths.iter().sum();
        if total != symbols.len() {
            anyhow::bail!(
                "genotype part size mismatch: widths sum to {total}, got {} symbols",
                symbols.len()
            );
        }

        let mut enc = RangeEncoder::new();
        let mut offset = 0;
        for &w in widths {
            let row = &symbols[offset..offset + w];
            offset += w;
            let permuted = std::mem::take(&mut self.permuted);
            let mut permuted = permuted;
            self.pbwt.forward(row, &mut permuted);
            self.encode_row(&mut enc, &permuted)?;
            self.permuted = permuted;
        }

        let body = enc.finish();
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one part back into the flat symbol slice described by
    /// `widths`. Parts must be fed in part-id order.
    pub fn decode_part(&mut self, payload: &[u8], widths: &[usize]) -> Result<Vec<u32>> {
        let expected: usize = widths.iter().sum();
        if payload.len() < 4 {
            anyhow::bail!("genotype part truncated");
        }
        let stored = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        if stored != expected {
            anyhow::bail!("genotype part declares {stored} symbols, sizes expect {expected}");
        }

        let mut dec = RangeDecoder::new(ByteStream::from_vec(payload[4..].to_vec()));
        let mut out = Vec::with_capacity(expected);
        for &w in widths {
            let permuted = std::mem::take(&mut self.permuted);
            let mut permuted = permuted;
            permuted.clear();
            while permuted.len() < w {
                let remaining = (w - permuted.len()) as u32;
                let (value, len) = self.decode_run(&mut dec, remaining)?;
                for _ in 0..len {
                    permuted.push(value);
                }
            }
            let restored = std::mem::take(&mut self.restored);
            let mut restored = restored;
            self.pbwt.inverse(&permuted, &mut restored);
            out.extend_from_slice(&restored);
            self.permuted = permuted;
            self.restored = restored;
        }
        Ok(out)
    }

    fn encode_row(&mut self, enc: &mut RangeEncoder, permuted: &[u32]) -> Result<()> {
        // Contexts capture recent symbols within the row.
        self.ctx_prefix = 0;
        self.ctx_symbol = 0;

        let mut i = 0;
        while i < permuted.len() {
            let value = permuted[i];
            let mut len = 1u32;
            while i + (len as usize) < permuted.len() && permuted[i + len as usize] == value {
                len += 1;
            }
            i += len as usize;
            self.encode_run(enc, value, len)?;
        }
        Ok(())
    }

    fn encode_run(&mut self, enc: &mut RangeEncoder, value: u32, len: u32) -> Result<()> {
        let sym = self.encode_symbol(enc, value)?;
        self.encode_len(enc, sym, len);
        self.roll(sym);
        Ok(())
    }

    fn decode_run(&mut self, dec: &mut RangeDecoder, remaining: u32) -> Result<(u32, u32)> {
        let (value, sym) = self.decode_symbol(dec)?;
        let len = self.decode_len(dec, sym)?;
        if len > remaining {
            anyhow::bail!("genotype run of {len} overflows row ({remaining} columns left)");
        }
        self.roll(sym);
        Ok((value, len))
    }

    #[inline]
    fn roll(&mut self, sym: usize) {
        self.ctx_prefix = ((self.ctx_prefix << 4) + (sym as u64 & 0xF)) & CTX_PREFIX_MASK;
        self.ctx_symbol = ((self.ctx_symbol << 8) + sym as u64) & CTX_SYMBOL_MASK;
    }

    #[inline]
    fn symbol_ctx(&self) -> u64 {
        CTX_FLAG_SYMBOL | (self.ctx_prefix << 16) | self.ctx_symbol
    }

    fn encode_symbol(&mut self, enc: &mut RangeEncoder, value: u32) -> Result<usize> {
        let ctx = self.symbol_ctx();
        let (sym, wide_flag, wide_bytes, extra) = if value <= GT_DIRECT_MAX {
            (value as usize, 0u64, 0usize, 0u32)
        } else if value < WIDE2_BASE {
            (SYM_WIDE1, CTX_FLAG_WIDE1, 1, value - WIDE1_BASE)
        } else if value < WIDE3_BASE {
            (SYM_WIDE2, CTX_FLAG_WIDE2, 2, value - WIDE2_BASE)
        } else if value <= GT_MAX_SYMBOL {
            (SYM_WIDE3, CTX_FLAG_WIDE3, 3, value - WIDE3_BASE)
        } else {
            anyhow::bail!("genotype symbol {value} exceeds the codable range");
        };

        self.ctx_map.find(ctx, GT_ALPHABET, LOG_CAP_MAIN).encode(enc, sym);
        for byte_idx in 0..wide_bytes {
            let b = ((extra >> (8 * byte_idx)) & 0xFF) as usize;
            self.ctx_map
                .find(wide_flag | byte_idx as u64, 256, LOG_CAP_AUX)
                .encode(enc, b);
        }
        Ok(sym)
    }

    fn decode_symbol(&mut self, dec: &mut RangeDecoder) -> Result<(u32, usize)> {
        let ctx = self.symbol_ctx();
        let sym = self.ctx_map.find(ctx, GT_ALPHABET, LOG_CAP_MAIN).decode(dec);
        let (wide_flag, wide_bytes, base) = match sym {
            s if s <= GT_DIRECT_MAX as usize => return Ok((s as u32, s)),
            SYM_WIDE1 => (CTX_FLAG_WIDE1, 1, WIDE1_BASE),
            SYM_WIDE2 => (CTX_FLAG_WIDE2, 2, WIDE2_BASE),
            SYM_WIDE3 => (CTX_FLAG_WIDE3, 3, WIDE3_BASE),
            _ => unreachable!("alphabet is {GT_ALPHABET}"),
        };
        let mut extra = 0u32;
        for byte_idx in 0..wide_bytes {
            let b = self
                .ctx_map
                .find(wide_flag | byte_idx as u64, 256, LOG_CAP_AUX)
                .decode(dec) as u32;
            extra |= b << (8 * byte_idx);
        }
        Ok((base + extra, sym))
    }

    #[inline]
    fn len_ctx(&self, sym: usize) -> u64 {
        CTX_FLAG_LEN | ((sym as u64) << 16) | self.ctx_symbol
    }

    fn encode_len(&mut self, enc: &mut RangeEncoder, sym: usize, len: u32) {
        let ctx = self.len_ctx(sym);
        let (cat, extra, extra_syms, extra_bytes) = match len {
            1 => (0usize, 0u32, 0usize, 0usize),
            2 => (1, 0, 0, 0),
            3 => (2, 0, 0, 0),
            4..=18 => (3, len - LEN_MID_BASE, 1, 0),
            19..=274 => (4, len - LEN_BYTE_BASE, 0, 1),
            275..=65810 => (5, len - LEN_WORD_BASE, 0, 2),
            _ => (6, len - LEN_WIDE_BASE, 0, 4),
        };
        self.ctx_map.find(ctx, LEN_CATS, LOG_CAP_MAIN).encode(enc, cat);

        let ex_base = CTX_FLAG_LEN_EX | ((sym as u64) << 8);
        if extra_syms == 1 {
            self.ctx_map.find(ex_base, 15, LOG_CAP_AUX).encode(enc, extra as usize);
        }
        for byte_idx in 0..extra_bytes {
            let b = ((extra >> (8 * byte_idx)) & 0xFF) as usize;
            self.ctx_map
                .find(ex_base | (1 + byte_idx as u64), 256, LOG_CAP_AUX)
                .encode(enc, b);
        }
    }

    fn decode_len(&mut self, dec: &mut RangeDecoder, sym: usize) -> Result<u32> {
        let ctx = self.len_ctx(sym);
        let cat = self.ctx_map.find(ctx, LEN_CATS, LOG_CAP_MAIN).decode(dec);
        let ex_base = CTX_FLAG_LEN_EX | ((sym as u64) << 8);
        let len = match cat {
            0 => 1,
            1 => 2,
            2 => 3,
            3 => {
                let extra = self.ctx_map.find(ex_base, 15, LOG_CAP_AUX).decode(dec) as u32;
                LEN_MID_BASE + extra
            }
            4 | 5 | 6 => {
                let (n_bytes, base) = match cat {
                    4 => (1, LEN_BYTE_BASE),
                    5 => (2, LEN_WORD_BASE),
                    _ => (4, LEN_WIDE_BASE),
                };
                let mut extra = 0u32;
                for byte_idx in 0..n_bytes {
                    let b = self
                        .ctx_map
                        .find(ex_base | (1 + byte_idx as u64), 256, LOG_CAP_AUX)
                        .decode(dec) as u32;
                    extra |= b << (8 * byte_idx);
                }
                base.checked_add(extra)
                    .ok_or_else(|| anyhow::anyhow!("genotype run length overflow"))?
            }
            _ => unreachable!("length alphabet is {LEN_CATS}"),
        };
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(n_rows: usize, width: usize, f: impl Fn(usize, usize) -> u32) -> Vec<Vec<u32>> {
        (0..n_rows).map(|i| (0..width).map(|j| f(i, j)).collect()).collect()
    }

    fn roundtrip_parts(rows: &[Vec<u32>], parts: &[std::ops::Range<usize>]) {
        let width = rows[0].len();
        let mut enc = GtCoder::new();
        let mut payloads = Vec::new();
        for range in parts {
            let widths = vec![width; range.len()];
            let flat: Vec<u32> = rows[range.clone()].iter().flatten().copied().collect();
            payloads.push(enc.encode_part(&widths, &flat).unwrap());
        }

        let mut dec = GtCoder::new();
        let mut restored = Vec::new();
        for (payload, range) in payloads.iter().zip(parts) {
            let widths = vec![width; range.len()];
            restored.extend(dec.decode_part(payload, &widths).unwrap());
        }
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        assert_eq!(restored, flat);
    }

    #[test]
    fn roundtrip_binary_matrix() {
        let rows = matrix(60, 40, |i, j| ((i * 31 + j * 17) % 2) as u32);
        roundtrip_parts(&rows, &[0..60]);
    }

    #[test]
    fn roundtrip_with_missing_and_multiallelic() {
        let rows = matrix(40, 30, |i, j| match (i * 7 + j) % 11 {
            0 => 0,       // missing
            1..=8 => 1,   // common ref
            9 => 2,
            _ => 4,
        });
        roundtrip_parts(&rows, &[0..40]);
    }

    #[test]
    fn roundtrip_wide_symbols_all_tiers() {
        let rows = matrix(30, 16, |i, j| match (i + j) % 7 {
            0 => 1,
            1 => 200,      // tier 1
            2 => 40_000,   // tier 2
            3 => 100_000,  // tier 3
            _ => 2,
        });
        roundtrip_parts(&rows, &[0..30]);
    }

    #[test]
    fn state_persists_across_parts() {
        let rows = matrix(90, 24, |i, j| ((i * 13 + j * 7) % 3) as u32);
        roundtrip_parts(&rows, &[0..30, 30..65, 65..90]);
    }

    #[test]
    fn rejects_oversized_symbol() {
        let mut enc = GtCoder::new();
        let err = enc.encode_part(&[1], &[GT_MAX_SYMBOL + 1]);
        assert!(err.is_err());
    }

    #[test]
    fn long_runs_cover_every_category() {
        for &width in &[1usize, 2, 3, 10, 30, 300, 70_000] {
            let rows = vec![vec![1u32; width]];
            roundtrip_parts(&rows, &[0..1]);
        }
    }
}
