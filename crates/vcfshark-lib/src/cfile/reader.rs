//! Read path: loads the descriptions and function graphs, then pulls
//! parts on demand in part-id order per stream, reconstructing
//! function-dependent keys from their sources in topological order.

use std::path::Path;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use tracing::info;

use crate::archive::Archive;
use crate::buffer::{read_varint, unzigzag64};
use crate::entropy;
use crate::graph_opt::{Edge, EdgeKind, FunctionGraphs};
use crate::gt::GtCoder;
use crate::params::Params;
use crate::text_pp::{TextPreprocessor, PP_FLAG};
use crate::variant::{FieldValue, KeyDesc, KeyDim, KeyKind, VariantDesc};

use super::{
    bytes_to_sizes, composite_to_record, db_data_stream, db_size_stream, key_data_stream,
    key_func_data_stream, key_func_size_stream, key_size_stream, record_to_composite,
    writer::chrom_dict_decode, DB_CHROM, DB_POS, NO_DB_FIELDS,
};

/// Cursor over one (sizes, data) stream pair. The two cursors refill
/// independently: a linked sizes stream aliases the source key's parts,
/// whose boundaries need not match this key's data parts.
#[derive(Default)]
struct StreamState {
    size_stream: usize,
    data_stream: usize,
    next_size_part: u32,
    next_data_part: u32,
    sizes: Vec<u32>,
    size_idx: usize,
    data: Vec<u8>,
    data_pos: usize,
    /// Records left in the current data part.
    records_left: u32,
    flags: Vec<u8>,
    flag_idx: usize,
    gt_syms: Vec<u32>,
    gt_pos: usize,
    pp: TextPreprocessor,
}

pub(crate) struct Reader {
    archive: Archive,
    params: Params,
    no_variants: u64,
    no_samples: u32,
    no_keys: usize,
    ploidy: u32,
    gt_key: Option<usize>,
    meta: Vec<u8>,
    header: Vec<u8>,
    samples: Vec<Vec<u8>>,
    keys: Vec<KeyDesc>,
    /// dst key -> (src key, composite -> composite).
    data_maps: FxHashMap<u32, (u32, FxHashMap<Vec<u8>, Vec<u8>>)>,
    /// dst key -> (src key, size code -> size code).
    size_maps: FxHashMap<u32, (u32, FxHashMap<u32, u32>)>,
    decode_order: Vec<usize>,
    key_states: Vec<StreamState>,
    db_states: Vec<StreamState>,
    gt_coder: GtCoder,
    i_variant: u64,
    prev_pos: i64,
}

impl Reader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let archive = Archive::open(path)?;

        let mut params = Params::default();
        let raw_params = archive
            .get_stream_bytes("params")?
            .ok_or_else(|| anyhow::anyhow!("archive has no params stream"))?;
        params.load(&raw_params)?;

        let attrs = load_meta_stream(&archive, "attributes")?;
        let mut pos = 0;
        let no_variants = read_varint(&attrs, &mut pos)?;
        let no_samples = read_varint(&attrs, &mut pos)? as u32;
        let no_keys = read_varint(&attrs, &mut pos)? as usize;
        let ploidy = read_varint(&attrs, &mut pos)? as u32;
        let gt_plus_one = read_varint(&attrs, &mut pos)?;
        let gt_key = if gt_plus_one == 0 { None } else { Some(gt_plus_one as usize - 1) };

        let meta = load_meta_stream(&archive, "meta")?;
        let header = load_meta_stream(&archive, "header")?;
        let samples = parse_samples(&load_meta_stream(&archive, "samples")?)?;
        let keys = parse_keys(&load_meta_stream(&archive, "keys")?)?;
        if keys.len() != no_keys {
            anyhow::bail!("keys stream lists {} keys, attributes say {}", keys.len(), no_keys);
        }

        let size_edges = parse_edges(&load_meta_stream(&archive, "gr_size_edges")?)?;
        let data_edges = parse_edges(&load_meta_stream(&archive, "gr_data_edges")?)?;

        let mut graphs = FunctionGraphs::default();
        let mut data_maps = FxHashMap::default();
        let mut size_maps = FxHashMap::default();

        for (dst, src, is_mapping) in data_edges {
            if dst as usize >= no_keys || src as usize >= no_keys {
                anyhow::bail!("data graph edge {dst} <- {src} out of key range");
            }
            let kind = if is_mapping {
                let (desc_src, entries) =
                    parse_function(&load_meta_stream(&archive, &key_func_data_stream(dst))?)?;
                if desc_src != src {
                    anyhow::bail!("function descriptor for key {dst} names a different source");
                }
                data_maps.insert(dst, (src, entries.iter().cloned().collect()));
                EdgeKind::Mapping(entries)
            } else {
                EdgeKind::Equal
            };
            graphs.data_edges.push(Edge { dst, src, kind });
        }
        for (dst, src, is_mapping) in size_edges {
            if dst as usize >= no_keys || src as usize >= no_keys {
                anyhow::bail!("size graph edge {dst} <- {src} out of key range");
            }
            let kind = if is_mapping {
                let (desc_src, entries) =
                    parse_function(&load_meta_stream(&archive, &key_func_size_stream(dst))?)?;
                if desc_src != src {
                    anyhow::bail!("size descriptor for key {dst} names a different source");
                }
                let map = entries
                    .iter()
                    .map(|(k, v)| {
                        let mut kp = 0;
                        let mut vp = 0;
                        Ok((
                            read_varint(k, &mut kp)? as u32,
                            read_varint(v, &mut vp)? as u32,
                        ))
                    })
                    .collect::<Result<FxHashMap<u32, u32>>>()?;
                size_maps.insert(dst, (src, map));
                EdgeKind::Mapping(entries)
            } else {
                EdgeKind::Equal
            };
            graphs.size_edges.push(Edge { dst, src, kind });
        }
        graphs.validate()?;

        // Sources first: keys with own streams, then size-mapped keys,
        // then data-mapped keys (their sources are never replaced).
        let mut decode_order: Vec<usize> = Vec::with_capacity(no_keys);
        decode_order.extend(
            (0..no_keys)
                .filter(|k| {
                    !data_maps.contains_key(&(*k as u32)) && !size_maps.contains_key(&(*k as u32))
                }),
        );
        decode_order.extend((0..no_keys).filter(|k| size_maps.contains_key(&(*k as u32))));
        decode_order.extend((0..no_keys).filter(|k| data_maps.contains_key(&(*k as u32))));

        let mut key_states = Vec::with_capacity(no_keys);
        for key in &keys {
            key_states.push(StreamState {
                size_stream: require_stream(&archive, &key_size_stream(key.id))?,
                data_stream: require_stream(&archive, &key_data_stream(key.id))?,
                ..StreamState::default()
            });
        }
        let mut db_states = Vec::with_capacity(NO_DB_FIELDS);
        for col in 0..NO_DB_FIELDS {
            db_states.push(StreamState {
                size_stream: require_stream(&archive, &db_size_stream(col))?,
                data_stream: require_stream(&archive, &db_data_stream(col))?,
                ..StreamState::default()
            });
        }

        info!(
            path = %path.display(),
            variants = no_variants,
            samples = no_samples,
            keys = no_keys,
            "opened archive for reading"
        );
        Ok(Self {
            archive,
            params,
            no_variants,
            no_samples,
            no_keys,
            ploidy,
            gt_key,
            meta,
            header,
            samples,
            keys,
            data_maps,
            size_maps,
            decode_order,
            key_states,
            db_states,
            gt_coder: GtCoder::new(),
            i_variant: 0,
            prev_pos: 0,
        })
    }

    pub(crate) fn eof(&self) -> bool {
        self.i_variant >= self.no_variants
    }

    pub(crate) fn no_variants(&self) -> u64 {
        self.no_variants
    }

    pub(crate) fn no_samples(&self) -> u32 {
        self.no_samples
    }

    pub(crate) fn no_keys(&self) -> u32 {
        self.no_keys as u32
    }

    pub(crate) fn ploidy(&self) -> u32 {
        self.ploidy
    }

    pub(crate) fn gt_key_id(&self) -> Option<u32> {
        self.gt_key.map(|k| k as u32)
    }

    pub(crate) fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn meta(&self) -> &[u8] {
        &self.meta
    }

    pub(crate) fn header(&self) -> &[u8] {
        &self.header
    }

    pub(crate) fn samples(&self) -> &[Vec<u8>] {
        &self.samples
    }

    pub(crate) fn keys(&self) -> &[KeyDesc] {
        &self.keys
    }

    pub(crate) fn get_variant(&mut self) -> Result<Option<(VariantDesc, Vec<FieldValue>)>> {
        if self.eof() {
            return Ok(None);
        }

        let chrom = self.read_db_record(DB_CHROM)?;
        let pos_delta = self.read_db_pos_delta()?;
        let pos = self.prev_pos.wrapping_add(pos_delta);
        self.prev_pos = pos;
        let id = self.read_db_record(2)?;
        let ref_allele = self.read_db_record(3)?;
        let alt = self.read_db_record(4)?;
        let qual = self.read_db_record(5)?;

        let mut fields = vec![FieldValue::Empty; self.no_keys];
        for idx in 0..self.decode_order.len() {
            let k = self.decode_order[idx];
            let value = if let Some((src, map)) = self.data_maps.get(&(k as u32)) {
                let src_composite = record_to_composite(&fields[*src as usize]);
                let dst_composite = map.get(&src_composite).ok_or_else(|| {
                    anyhow::anyhow!(
                        "variant {}: key {k}: source value missing from function descriptor",
                        self.i_variant
                    )
                })?;
                composite_to_record(self.keys[k].kind, dst_composite)?
            } else if self.size_maps.contains_key(&(k as u32)) {
                let size_code = {
                    let (src, map) = &self.size_maps[&(k as u32)];
                    let src_code = size_code_of(&fields[*src as usize]);
                    *map.get(&src_code).ok_or_else(|| {
                        anyhow::anyhow!(
                            "variant {}: key {k}: source size missing from descriptor",
                            self.i_variant
                        )
                    })?
                };
                self.decode_mapped_size_record(k, size_code)?
            } else {
                self.decode_stored_record(k)?
            };
            fields[k] = value;
        }

        self.i_variant += 1;
        Ok(Some((VariantDesc { chrom, pos, id, ref_allele, alt, qual }, fields)))
    }

    /// Next size code from the key's sizes stream (possibly a link).
    fn next_size_code(&mut self, k: usize) -> Result<u32> {
        if self.key_states[k].size_idx == self.key_states[k].sizes.len() {
            let part = self.key_states[k].next_size_part;
            self.key_states[k].next_size_part += 1;
            let raw = entropy::decompress(
                &self.archive.get_part(self.key_states[k].size_stream, part)?,
            )?;
            let sizes = bytes_to_sizes(&raw)?;
            if sizes.is_empty() {
                anyhow::bail!("key {k}: empty sizes part {part}");
            }
            let state = &mut self.key_states[k];
            state.sizes = sizes;
            state.size_idx = 0;
        }
        let state = &mut self.key_states[k];
        let code = state.sizes[state.size_idx];
        state.size_idx += 1;
        Ok(code)
    }

    /// Make the current data part available and account one record.
    fn take_data_record(&mut self, k: usize, kind: KeyKind) -> Result<()> {
        if self.key_states[k].records_left == 0 {
            let part = self.key_states[k].next_data_part;
            self.key_states[k].next_data_part += 1;
            let blob = self.archive.get_part(self.key_states[k].data_stream, part)?;
            let (n_records, body) = split_record_count(&blob)?;
            if n_records == 0 {
                anyhow::bail!("key {k}: empty data part {part}");
            }
            let data = match kind {
                KeyKind::Int | KeyKind::Real => entropy::decompress(body)?,
                KeyKind::Text => {
                    let (stored, rest) = split_record_count(body)?;
                    let payload = entropy::decompress(rest)?;
                    if payload.len() as u32 != stored & !PP_FLAG {
                        anyhow::bail!("key {k} part {part}: text payload length mismatch");
                    }
                    if stored & PP_FLAG != 0 {
                        self.key_states[k].pp.decode(&payload)?
                    } else {
                        payload
                    }
                }
                _ => anyhow::bail!("key {k}: unexpected kind for a data part"),
            };
            let state = &mut self.key_states[k];
            state.data = data;
            state.data_pos = 0;
            state.records_left = n_records;
        }
        self.key_states[k].records_left -= 1;
        Ok(())
    }

    /// Genotype streams are never replaced, so their sizes and data
    /// parts pair up exactly; decode them together because the coder
    /// needs every row width of the part.
    fn refill_gt_part(&mut self, k: usize) -> Result<()> {
        let part = self.key_states[k].next_size_part;
        self.key_states[k].next_size_part += 1;
        self.key_states[k].next_data_part += 1;

        let raw_sizes = entropy::decompress(
            &self.archive.get_part(self.key_states[k].size_stream, part)?,
        )?;
        let sizes = bytes_to_sizes(&raw_sizes)?;
        if sizes.is_empty() {
            anyhow::bail!("genotype key {k}: empty sizes part {part}");
        }
        let widths: Vec<usize> = sizes.iter().map(|&s| s.saturating_sub(1) as usize).collect();

        let blob = self.archive.get_part(self.key_states[k].data_stream, part)?;
        let syms = self.gt_coder.decode_part(&blob, &widths)?;

        let state = &mut self.key_states[k];
        state.sizes = sizes;
        state.size_idx = 0;
        state.gt_syms = syms;
        state.gt_pos = 0;
        Ok(())
    }

    fn decode_stored_record(&mut self, k: usize) -> Result<FieldValue> {
        let kind = self.keys[k].kind;
        match kind {
            KeyKind::Flag => self.decode_flag_record(k),
            KeyKind::Genotype => {
                if self.key_states[k].size_idx == self.key_states[k].sizes.len() {
                    self.refill_gt_part(k)?;
                }
                let state = &mut self.key_states[k];
                let size_code = state.sizes[state.size_idx];
                state.size_idx += 1;
                self.consume_record(k, kind, size_code)
            }
            _ => {
                let size_code = self.next_size_code(k)?;
                self.take_data_record(k, kind)?;
                self.consume_record(k, kind, size_code)
            }
        }
    }

    fn decode_mapped_size_record(&mut self, k: usize, size_code: u32) -> Result<FieldValue> {
        let kind = self.keys[k].kind;
        self.take_data_record(k, kind)?;
        self.consume_record(k, kind, size_code)
    }

    fn decode_flag_record(&mut self, k: usize) -> Result<FieldValue> {
        let state = &mut self.key_states[k];
        if state.flag_idx == state.flags.len() {
            let part = state.next_data_part;
            state.next_data_part += 1;
            let raw = entropy::decompress(&self.archive.get_part(state.data_stream, part)?)?;
            let (n, body) = split_record_count(&raw)?;
            let mut flags = Vec::with_capacity(n as usize);
            for i in 0..n as usize {
                let byte = body
                    .get(i / 8)
                    .ok_or_else(|| anyhow::anyhow!("key {k}: truncated flag part {part}"))?;
                flags.push((byte >> (i % 8)) & 1);
            }
            state.flags = flags;
            state.flag_idx = 0;
        }
        let present = self.key_states[k].flags[self.key_states[k].flag_idx] != 0;
        self.key_states[k].flag_idx += 1;
        Ok(if present { FieldValue::Flag } else { FieldValue::Empty })
    }

    /// Consume one record's payload from the key's decoded data cursor.
    fn consume_record(&mut self, k: usize, kind: KeyKind, size_code: u32) -> Result<FieldValue> {
        if size_code == 0 {
            return Ok(FieldValue::Empty);
        }
        let n = (size_code - 1) as usize;
        let state = &mut self.key_states[k];
        match kind {
            KeyKind::Int => {
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    let x = read_varint(&state.data, &mut state.data_pos)?;
                    v.push(crate::buffer::unzigzag32(x));
                }
                Ok(FieldValue::Int(v))
            }
            KeyKind::Real => {
                let end = state.data_pos + n * 4;
                let bytes = state
                    .data
                    .get(state.data_pos..end)
                    .ok_or_else(|| anyhow::anyhow!("key {k}: real record overruns part"))?;
                let v = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                state.data_pos = end;
                Ok(FieldValue::Real(v))
            }
            KeyKind::Text => {
                let end = state.data_pos + n;
                let bytes = state
                    .data
                    .get(state.data_pos..end)
                    .ok_or_else(|| anyhow::anyhow!("key {k}: text record overruns part"))?;
                let v = bytes.to_vec();
                state.data_pos = end;
                Ok(FieldValue::Text(v))
            }
            KeyKind::Genotype => {
                let end = state.gt_pos + n;
                let row = state
                    .gt_syms
                    .get(state.gt_pos..end)
                    .ok_or_else(|| anyhow::anyhow!("key {k}: genotype row overruns part"))?
                    .to_vec();
                state.gt_pos = end;
                Ok(FieldValue::Genotype(row))
            }
            KeyKind::Flag => unreachable!("flags are decoded from the presence stream"),
        }
    }

    /// One database text record (chrom, id, ref, alt, qual).
    fn read_db_record(&mut self, col: usize) -> Result<Vec<u8>> {
        self.ensure_db_part(col)?;
        let state = &mut self.db_states[col];
        let size_code = state.sizes[state.size_idx];
        state.size_idx += 1;
        if size_code == 0 {
            anyhow::bail!("database column {col} carries an absent record");
        }
        let n = (size_code - 1) as usize;
        let end = state.data_pos + n;
        let bytes = state
            .data
            .get(state.data_pos..end)
            .ok_or_else(|| anyhow::anyhow!("database column {col}: record overruns part"))?
            .to_vec();
        state.data_pos = end;
        Ok(bytes)
    }

    fn read_db_pos_delta(&mut self) -> Result<i64> {
        self.ensure_db_part(DB_POS)?;
        let state = &mut self.db_states[DB_POS];
        let size_code = state.sizes[state.size_idx];
        state.size_idx += 1;
        if size_code != 1 {
            anyhow::bail!("position column record has size code {size_code}");
        }
        let raw = read_varint(&state.data, &mut state.data_pos)?;
        Ok(unzigzag64(raw))
    }

    fn ensure_db_part(&mut self, col: usize) -> Result<()> {
        if self.db_states[col].size_idx < self.db_states[col].sizes.len() {
            return Ok(());
        }
        // Database columns are never replaced: sizes and data parts pair
        // up exactly and refill together.
        let part = self.db_states[col].next_size_part;
        self.db_states[col].next_size_part += 1;

        let raw_sizes = entropy::decompress(
            &self.archive.get_part(self.db_states[col].size_stream, part)?,
        )?;
        let sizes = bytes_to_sizes(&raw_sizes)?;
        if sizes.is_empty() {
            anyhow::bail!("database column {col}: empty sizes part {part}");
        }

        let raw = entropy::decompress(
            &self.archive.get_part(self.db_states[col].data_stream, part)?,
        )?;
        let data = if col == DB_CHROM { chrom_dict_decode(&raw, sizes.len())? } else { raw };

        let state = &mut self.db_states[col];
        state.sizes = sizes;
        state.size_idx = 0;
        state.data = data;
        state.data_pos = 0;
        Ok(())
    }
}

/// Size-stream code of an already-decoded record.
fn size_code_of(value: &FieldValue) -> u32 {
    match value {
        FieldValue::Empty => 0,
        FieldValue::Flag => 1,
        other => 1 + other.element_count() as u32,
    }
}

fn split_record_count(blob: &[u8]) -> Result<(u32, &[u8])> {
    let head = blob
        .get(..4)
        .ok_or_else(|| anyhow::anyhow!("part too small for its record count"))?;
    Ok((u32::from_le_bytes(head.try_into().unwrap()), &blob[4..]))
}

fn require_stream(archive: &Archive, name: &str) -> Result<usize> {
    archive
        .stream_id(name)
        .ok_or_else(|| anyhow::anyhow!("archive is missing stream {name}"))
}

fn load_meta_stream(archive: &Archive, name: &str) -> Result<Vec<u8>> {
    let raw = archive
        .get_stream_bytes(name)?
        .ok_or_else(|| anyhow::anyhow!("archive is missing stream {name}"))?;
    entropy::decompress(&raw).with_context(|| format!("while decoding stream {name}"))
}

fn parse_samples(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut pos = 0;
    let count = read_varint(data, &mut pos)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_varint(data, &mut pos)? as usize;
        let name = data
            .get(pos..pos + len)
            .ok_or_else(|| anyhow::anyhow!("truncated samples stream"))?;
        pos += len;
        out.push(name.to_vec());
    }
    Ok(out)
}

fn parse_keys(data: &[u8]) -> Result<Vec<KeyDesc>> {
    let mut pos = 0;
    let count = read_varint(data, &mut pos)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_varint(data, &mut pos)? as u32;
        let name_len = read_varint(data, &mut pos)? as usize;
        let name = data
            .get(pos..pos + name_len)
            .ok_or_else(|| anyhow::anyhow!("truncated keys stream"))?
            .to_vec();
        pos += name_len;
        let kind = KeyKind::from_code(next_byte(data, &mut pos)?)?;
        let dim = match next_byte(data, &mut pos)? {
            0 => KeyDim::Scalar,
            1 => KeyDim::Fixed(read_varint(data, &mut pos)? as u32),
            2 => KeyDim::Variable,
            other => anyhow::bail!("invalid key dimension code {other}"),
        };
        let neglect = next_byte(data, &mut pos)? != 0;
        out.push(KeyDesc { id, name, kind, dim, neglect });
    }
    Ok(out)
}

fn parse_edges(data: &[u8]) -> Result<Vec<(u32, u32, bool)>> {
    let mut pos = 0;
    let count = read_varint(data, &mut pos)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let dst = read_varint(data, &mut pos)? as u32;
        let src = read_varint(data, &mut pos)? as u32;
        let mapping = next_byte(data, &mut pos)? != 0;
        out.push((dst, src, mapping));
    }
    Ok(out)
}

fn parse_function(data: &[u8]) -> Result<(u32, Vec<(Vec<u8>, Vec<u8>)>)> {
    let mut pos = 0;
    let src = read_varint(data, &mut pos)? as u32;
    let count = read_varint(data, &mut pos)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let klen = read_varint(data, &mut pos)? as usize;
        let k = data
            .get(pos..pos + klen)
            .ok_or_else(|| anyhow::anyhow!("truncated function descriptor"))?
            .to_vec();
        pos += klen;
        let vlen = read_varint(data, &mut pos)? as usize;
        let v = data
            .get(pos..pos + vlen)
            .ok_or_else(|| anyhow::anyhow!("truncated function descriptor"))?
            .to_vec();
        pos += vlen;
        entries.push((k, v));
    }
    Ok((src, entries))
}

fn next_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *data
        .get(*pos)
        .ok_or_else(|| anyhow::anyhow!("truncated stream at offset {}", *pos))?;
    *pos += 1;
    Ok(b)
}
