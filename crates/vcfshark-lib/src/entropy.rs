//! Uniform façade over the block entropy primitive. Payloads are cut into
//! fixed-size blocks, compressed independently (in parallel for large
//! parts), and framed as `[num_blocks: u32][block_len: u32, block]...`.
//! The preset table is part of the archive ABI; changing it breaks
//! existing files.

use anyhow::Result;
use rayon::prelude::*;

/// Decompressed-size ceiling for one block (guards corrupt length fields).
const MAX_BLOCK_RAW: usize = 512 << 20;

/// Parameters of one stream-kind preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub block_size: usize,
    pub level: i32,
}

const MIB: usize = 1 << 20;

pub const P_SIZES: CodecParams = CodecParams { block_size: 16 * MIB, level: 19 };
pub const P_DATA: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_FLAG: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_TEXT: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_INT: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_REAL: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };

pub const P_DB_CHROM: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_DB_POS: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_DB_ID: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_DB_REF: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_DB_ALT: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };
pub const P_DB_QUAL: CodecParams = CodecParams { block_size: 16 * MIB, level: 17 };

pub const P_META: CodecParams = CodecParams { block_size: 16 * MIB, level: 19 };

/// Compress under a preset. Empty input yields empty output.
pub fn compress(data: &[u8], params: CodecParams) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let blocks: Vec<Vec<u8>> = data
        .par_chunks(params.block_size)
        .map(|chunk| {
            zstd::bulk::compress(chunk, params.level)
                .map_err(|e| anyhow::anyhow!("entropy block compression failed: {e}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let payload: usize = blocks.iter().map(|b| b.len() + 4).sum();
    let mut out = Vec::with_capacity(4 + payload);
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    for block in blocks {
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Decompress a multi-block frame produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < 4 {
        anyhow::bail!("entropy frame too small for block count");
    }

    let num_blocks = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
    let mut offset = 4;
    let mut slices = Vec::with_capacity(num_blocks);
    for _ in 0..num_blocks {
        let end = offset + 4;
        let len_bytes = data
            .get(offset..end)
            .ok_or_else(|| anyhow::anyhow!("truncated entropy block length"))?;
        let block_len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        offset = end;
        let block = data
            .get(offset..offset + block_len)
            .ok_or_else(|| anyhow::anyhow!("truncated entropy block data"))?;
        slices.push(block);
        offset += block_len;
    }
    if offset != data.len() {
        anyhow::bail!("trailing bytes after entropy blocks");
    }

    let blocks: Vec<Vec<u8>> = slices
        .par_iter()
        .map(|block| {
            zstd::bulk::decompress(block, MAX_BLOCK_RAW)
                .map_err(|e| anyhow::anyhow!("entropy block decompression failed: {e}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let total: usize = blocks.iter().map(|b| b.len()).sum();
    let mut out = Vec::with_capacity(total);
    for block in blocks {
        out.extend_from_slice(&block);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple() {
        let data = b"chr1\tchr1\tchr2\tchrX\tchr1".repeat(100);
        let compressed = compress(&data, P_TEXT).unwrap();
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn roundtrip_empty() {
        let compressed = compress(&[], P_DATA).unwrap();
        assert!(compressed.is_empty());
        assert!(decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn roundtrip_multi_block() {
        let params = CodecParams { block_size: 1024, level: 3 };
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = compress(&data, params).unwrap();
        let num_blocks = u32::from_le_bytes(compressed[..4].try_into().unwrap());
        assert_eq!(num_blocks, 10);
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn rejects_truncated_frame() {
        let data = b"the quick brown fox".repeat(50);
        let mut compressed = compress(&data, P_DATA).unwrap();
        compressed.truncate(compressed.len() - 3);
        assert!(decompress(&compressed).is_err());
    }
}
