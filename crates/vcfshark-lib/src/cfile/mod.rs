//! The compressed-file engine: orchestrates chunking, worker threads,
//! ordering gates, the function-graph optimiser and the archive layout.
//! The write path lives in `writer`, the symmetric read path in `reader`.

mod reader;
mod writer;

use std::path::Path;

use anyhow::Result;

use crate::buffer::{encode_elements, read_varint, unzigzag32};
use crate::params::Params;
use crate::variant::{FieldValue, KeyDesc, KeyKind, VariantDesc};

pub(crate) use reader::Reader;
pub(crate) use writer::Writer;

/// Per-key buffer cap before a package is sealed.
pub(crate) const MAX_BUFFER_SIZE: usize = 8 << 20;
/// The genotype matrix gets a much larger chunk to feed the PBWT.
pub(crate) const MAX_BUFFER_GT_SIZE: usize = 256 << 20;
/// Database-column buffer cap.
pub(crate) const MAX_BUFFER_DB_SIZE: usize = 8 << 20;
/// In-flight package cap per key; ingestion blocks above this.
pub(crate) const MAX_CNT_PACKAGES: u32 = 3;

pub(crate) const NO_DB_FIELDS: usize = 6;
pub(crate) const DB_CHROM: usize = 0;
pub(crate) const DB_POS: usize = 1;

pub(crate) const DB_NAMES: [&str; NO_DB_FIELDS] = ["chrom", "pos", "id", "ref", "alt", "qual"];

pub(crate) fn db_size_stream(col: usize) -> String {
    format!("db_{}_size", DB_NAMES[col])
}

pub(crate) fn db_data_stream(col: usize) -> String {
    format!("db_{}_data", DB_NAMES[col])
}

pub(crate) fn key_size_stream(key_id: u32) -> String {
    format!("key_{key_id}_size")
}

pub(crate) fn key_data_stream(key_id: u32) -> String {
    format!("key_{key_id}_data")
}

pub(crate) fn key_func_size_stream(key_id: u32) -> String {
    format!("key_{key_id}_func_size")
}

pub(crate) fn key_func_data_stream(key_id: u32) -> String {
    format!("key_{key_id}_func_data")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PackageKind {
    Field,
    Gt,
    Db,
}

/// Unit of work between the ingestion thread and the workers. Owned
/// values; the archive only ever records (stream id, part id).
pub(crate) struct Package {
    pub kind: PackageKind,
    /// Key index for field/genotype packages, column index for database.
    pub key_id: usize,
    pub stream_id_size: usize,
    pub stream_id_data: usize,
    pub part_id: u32,
    pub sizes: Vec<u32>,
    pub data: Vec<u8>,
}

/// Serialise record-size codes for a sizes part.
pub(crate) fn sizes_to_bytes(sizes: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sizes.len());
    for &s in sizes {
        crate::buffer::write_varint(&mut out, s as u64);
    }
    out
}

pub(crate) fn bytes_to_sizes(data: &[u8]) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        out.push(read_varint(data, &mut pos)? as u32);
    }
    Ok(out)
}

/// Composite form of a record: the sizes code followed by the element
/// payload. This is the domain and range of data-mapping descriptors.
pub(crate) fn record_to_composite(value: &FieldValue) -> Vec<u8> {
    let mut payload = Vec::new();
    let code = encode_elements(value, &mut payload);
    let mut out = crate::graph_opt::composite(code, &payload);
    out.shrink_to_fit();
    out
}

/// Decode a composite back into a record of the given kind.
pub(crate) fn composite_to_record(kind: KeyKind, data: &[u8]) -> Result<FieldValue> {
    let (code, payload) = crate::graph_opt::split_composite(data)?;
    if code == 0 {
        return Ok(FieldValue::Empty);
    }
    let n = (code - 1) as usize;
    Ok(match kind {
        KeyKind::Flag => FieldValue::Flag,
        KeyKind::Int => {
            let mut pos = 0;
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(unzigzag32(read_varint(payload, &mut pos)?));
            }
            FieldValue::Int(v)
        }
        KeyKind::Real => {
            if payload.len() != n * 4 {
                anyhow::bail!("real record payload has {} bytes, expected {}", payload.len(), n * 4);
            }
            let v = payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            FieldValue::Real(v)
        }
        KeyKind::Text => FieldValue::Text(payload.to_vec()),
        KeyKind::Genotype => {
            if payload.len() != n * 4 {
                anyhow::bail!("genotype record payload length mismatch");
            }
            let v = payload
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            FieldValue::Genotype(v)
        }
    })
}

/// A variant-call archive, open for writing or reading.
///
/// Writing: `open_for_writing`, describe the schema (`set_keys`,
/// `add_samples`, ...), push variants with `set_variant`, then `close`.
/// Reading: `open_for_reading`, inspect the schema, pull variants with
/// `get_variant` until it returns `None`.
pub struct CompressedFile {
    state: State,
}

enum State {
    Writing(Box<Writer>),
    Reading(Box<Reader>),
    Closed,
}

impl CompressedFile {
    pub fn open_for_writing(path: &Path, no_keys: u32) -> Result<Self> {
        Ok(Self { state: State::Writing(Box::new(Writer::open(path, no_keys)?)) })
    }

    pub fn open_for_reading(path: &Path) -> Result<Self> {
        Ok(Self { state: State::Reading(Box::new(Reader::open(path)?)) })
    }

    fn writer(&mut self) -> Result<&mut Writer> {
        match &mut self.state {
            State::Writing(w) => Ok(w),
            _ => anyhow::bail!("archive is not open for writing"),
        }
    }

    fn reader(&mut self) -> Result<&mut Reader> {
        match &mut self.state {
            State::Reading(r) => Ok(r),
            _ => anyhow::bail!("archive is not open for reading"),
        }
    }

    fn reader_ref(&self) -> Result<&Reader> {
        match &self.state {
            State::Reading(r) => Ok(r),
            _ => anyhow::bail!("archive is not open for reading"),
        }
    }

    pub fn set_no_threads(&mut self, n: u32) -> Result<()> {
        self.writer()?.set_no_threads(n)
    }

    pub fn set_neglect_limit(&mut self, limit: u32) -> Result<()> {
        self.writer()?.set_neglect_limit(limit)
    }

    pub fn set_ploidy(&mut self, ploidy: u32) -> Result<()> {
        self.writer()?.set_ploidy(ploidy)
    }

    pub fn set_no_samples(&mut self, n: u32) -> Result<()> {
        self.writer()?.set_no_samples(n)
    }

    pub fn set_meta(&mut self, meta: &[u8]) -> Result<()> {
        self.writer()?.set_meta(meta)
    }

    pub fn set_header(&mut self, header: &[u8]) -> Result<()> {
        self.writer()?.set_header(header)
    }

    pub fn add_samples(&mut self, samples: &[Vec<u8>]) -> Result<()> {
        self.writer()?.add_samples(samples)
    }

    pub fn set_keys(&mut self, keys: Vec<KeyDesc>) -> Result<()> {
        self.writer()?.set_keys(keys)
    }

    /// Append one variant. Not reentrant; the caller owns the single
    /// ingestion thread.
    pub fn set_variant(&mut self, desc: &VariantDesc, fields: &[FieldValue]) -> Result<()> {
        self.writer()?.set_variant(desc, fields)
    }

    /// Finish the archive (write mode) or release the file (read mode).
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Writing(w) => w.close(),
            State::Reading(_) | State::Closed => Ok(()),
        }
    }

    pub fn get_variant(&mut self) -> Result<Option<(VariantDesc, Vec<FieldValue>)>> {
        self.reader()?.get_variant()
    }

    pub fn eof(&self) -> bool {
        match self.reader_ref() {
            Ok(r) => r.eof(),
            Err(_) => true,
        }
    }

    pub fn no_variants(&self) -> Result<u64> {
        Ok(self.reader_ref()?.no_variants())
    }

    pub fn no_samples(&self) -> Result<u32> {
        Ok(self.reader_ref()?.no_samples())
    }

    pub fn no_keys(&self) -> Result<u32> {
        Ok(self.reader_ref()?.no_keys())
    }

    pub fn ploidy(&self) -> Result<u32> {
        Ok(self.reader_ref()?.ploidy())
    }

    /// Id of the declared genotype key, if the archive has one.
    pub fn gt_key_id(&self) -> Result<Option<u32>> {
        Ok(self.reader_ref()?.gt_key_id())
    }

    pub fn params(&self) -> Result<&Params> {
        Ok(self.reader_ref()?.params())
    }

    pub fn get_meta(&self) -> Result<&[u8]> {
        Ok(self.reader_ref()?.meta())
    }

    pub fn get_header(&self) -> Result<&[u8]> {
        Ok(self.reader_ref()?.header())
    }

    pub fn get_samples(&self) -> Result<&[Vec<u8>]> {
        Ok(self.reader_ref()?.samples())
    }

    pub fn get_keys(&self) -> Result<&[KeyDesc]> {
        Ok(self.reader_ref()?.keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::INT_MISSING;

    #[test]
    fn composite_conversion_roundtrip() {
        let cases = [
            (KeyKind::Int, FieldValue::Int(vec![1, -7, INT_MISSING])),
            (KeyKind::Int, FieldValue::Int(vec![])),
            (KeyKind::Int, FieldValue::Empty),
            (KeyKind::Real, FieldValue::Real(vec![1.5, -0.0])),
            (KeyKind::Text, FieldValue::Text(b"PASS".to_vec())),
            (KeyKind::Text, FieldValue::Text(Vec::new())),
            (KeyKind::Flag, FieldValue::Flag),
            (KeyKind::Flag, FieldValue::Empty),
            (KeyKind::Genotype, FieldValue::Genotype(vec![2, 4, 0])),
        ];
        for (kind, value) in cases {
            let composite = record_to_composite(&value);
            let back = composite_to_record(kind, &composite).unwrap();
            assert_eq!(back, value, "kind {kind:?}");
        }
    }

    #[test]
    fn sizes_roundtrip() {
        let sizes = vec![0u32, 1, 3, 500, 0];
        assert_eq!(bytes_to_sizes(&sizes_to_bytes(&sizes)).unwrap(), sizes);
    }
}
