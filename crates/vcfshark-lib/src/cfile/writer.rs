//! Write path: per-key buffers, package sealing, the worker pool with
//! its two ordering gates, and the close sequence (drain, optimise,
//! canonical archive rewrite).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::archive::Archive;
use crate::buffer::{encode_elements, write_varint, zigzag64, FieldBuffer};
use crate::entropy;
use crate::graph_opt::{Edge, EdgeKind, GraphTracker, RecordObs};
use crate::gt::GtCoder;
use crate::params::Params;
use crate::queue::RegisteringQueue;
use crate::text_pp::{TextPreprocessor, PP_FLAG};
use crate::variant::{FieldValue, KeyDesc, KeyKind, VariantDesc};

use super::{
    db_data_stream, db_size_stream, key_data_stream, key_func_data_stream,
    key_func_size_stream, key_size_stream, sizes_to_bytes, Package, PackageKind, DB_CHROM,
    DB_POS, MAX_BUFFER_DB_SIZE, MAX_BUFFER_GT_SIZE, MAX_BUFFER_SIZE, MAX_CNT_PACKAGES,
    NO_DB_FIELDS,
};

/// Per-stream "next expected part" counter with a condition wait, so a
/// worker holding part p of an ordered stream runs only after part p-1.
struct Gate {
    next: Mutex<Vec<u32>>,
    cv: Condvar,
}

impl Gate {
    fn new(n: usize) -> Self {
        Self { next: Mutex::new(vec![0; n]), cv: Condvar::new() }
    }

    fn wait_for(&self, idx: usize, part_id: u32) {
        let mut next = self.next.lock().unwrap();
        while next[idx] != part_id {
            next = self.cv.wait(next).unwrap();
        }
    }

    fn advance(&self, idx: usize) {
        let mut next = self.next.lock().unwrap();
        next[idx] += 1;
        self.cv.notify_all();
    }
}

/// State shared between the ingestion thread and the workers.
struct Shared {
    queue: RegisteringQueue<Package>,
    tmp: Arc<Archive>,
    keys: Vec<KeyDesc>,
    gt_coder: Mutex<GtCoder>,
    text_pps: Vec<Mutex<TextPreprocessor>>,
    coder_gate: Gate,
    text_gate: Gate,
    /// In-flight package count per slot (keys, then database columns).
    inflight: Mutex<Vec<u32>>,
    cv_inflight: Condvar,
    /// First worker failure; later ones are discarded.
    error: Mutex<Option<anyhow::Error>>,
}

impl Shared {
    fn latch_error(&self, e: anyhow::Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn has_error(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }
}

pub(crate) struct Writer {
    path: PathBuf,
    tmp_path: PathBuf,
    tmp: Arc<Archive>,
    params: Params,
    no_keys: usize,
    keys: Vec<KeyDesc>,
    gt_key: Option<usize>,
    no_samples: u32,
    meta: Vec<u8>,
    header: Vec<u8>,
    samples: Vec<Vec<u8>>,
    no_variants: u64,
    prev_pos: i64,
    started: bool,
    /// Latched on a caller contract violation; `close` then abandons
    /// the archive instead of writing a partial one.
    failed: bool,
    buffers: Vec<FieldBuffer>,
    db_buffers: Vec<FieldBuffer>,
    next_part: Vec<u32>,
    db_next_part: Vec<u32>,
    key_stream_ids: Vec<(usize, usize)>,
    db_stream_ids: Vec<(usize, usize)>,
    tracker: Option<GraphTracker>,
    obs_codes: Vec<u32>,
    obs_payloads: Vec<Vec<u8>>,
    shared: Option<Arc<Shared>>,
    workers: Vec<JoinHandle<()>>,
}

impl Writer {
    pub(crate) fn open(path: &Path, no_keys: u32) -> Result<Self> {
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
        let tmp = Arc::new(Archive::create(&tmp_path)?);

        let mut db_stream_ids = Vec::with_capacity(NO_DB_FIELDS);
        for col in 0..NO_DB_FIELDS {
            let sid = tmp.register_stream(&db_size_stream(col))?;
            let did = tmp.register_stream(&db_data_stream(col))?;
            db_stream_ids.push((sid, did));
        }

        info!(path = %path.display(), no_keys, "opened archive for writing");
        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            tmp,
            params: Params::default(),
            no_keys: no_keys as usize,
            keys: Vec::new(),
            gt_key: None,
            no_samples: 0,
            meta: Vec::new(),
            header: Vec::new(),
            samples: Vec::new(),
            no_variants: 0,
            prev_pos: 0,
            started: false,
            failed: false,
            buffers: Vec::new(),
            db_buffers: (0..NO_DB_FIELDS).map(|_| FieldBuffer::new()).collect(),
            next_part: vec![0; no_keys as usize],
            db_next_part: vec![0; NO_DB_FIELDS],
            key_stream_ids: Vec::new(),
            db_stream_ids,
            tracker: None,
            obs_codes: Vec::new(),
            obs_payloads: Vec::new(),
            shared: None,
            workers: Vec::new(),
        })
    }

    pub(crate) fn set_no_threads(&mut self, n: u32) -> Result<()> {
        if self.started {
            anyhow::bail!("thread count must be set before the first variant");
        }
        self.params.no_threads = n.max(1);
        Ok(())
    }

    pub(crate) fn set_neglect_limit(&mut self, limit: u32) -> Result<()> {
        if self.started {
            anyhow::bail!("neglect limit must be set before the first variant");
        }
        self.params.neglect_limit = limit.min(u8::MAX as u32);
        Ok(())
    }

    pub(crate) fn set_ploidy(&mut self, ploidy: u32) -> Result<()> {
        if self.started {
            anyhow::bail!("ploidy must be set before the first variant");
        }
        if ploidy == 0 {
            anyhow::bail!("ploidy must be positive");
        }
        self.params.ploidy = ploidy;
        Ok(())
    }

    pub(crate) fn set_no_samples(&mut self, n: u32) -> Result<()> {
        if self.started {
            anyhow::bail!("sample count must be set before the first variant");
        }
        self.no_samples = n;
        Ok(())
    }

    pub(crate) fn set_meta(&mut self, meta: &[u8]) -> Result<()> {
        self.meta = meta.to_vec();
        Ok(())
    }

    pub(crate) fn set_header(&mut self, header: &[u8]) -> Result<()> {
        self.header = header.to_vec();
        Ok(())
    }

    pub(crate) fn add_samples(&mut self, samples: &[Vec<u8>]) -> Result<()> {
        if self.started {
            anyhow::bail!("samples must be added before the first variant");
        }
        self.samples.extend_from_slice(samples);
        self.no_samples = self.samples.len() as u32;
        Ok(())
    }

    pub(crate) fn set_keys(&mut self, keys: Vec<KeyDesc>) -> Result<()> {
        if self.started {
            anyhow::bail!("keys must be declared before the first variant");
        }
        if keys.len() != self.no_keys {
            anyhow::bail!("declared {} keys, archive was opened for {}", keys.len(), self.no_keys);
        }
        let mut gt_key = None;
        for (i, key) in keys.iter().enumerate() {
            if key.id as usize != i {
                anyhow::bail!("key ids must be dense: key {} has id {}", i, key.id);
            }
            if key.kind == KeyKind::Genotype {
                if gt_key.is_some() {
                    anyhow::bail!("at most one genotype key is allowed");
                }
                gt_key = Some(i);
            }
        }
        self.gt_key = gt_key;
        self.keys = keys;
        Ok(())
    }

    /// Spawn the worker pool and allocate the per-key machinery. Runs on
    /// the first variant, once the schema is final.
    fn start(&mut self) -> Result<()> {
        if self.keys.len() != self.no_keys {
            anyhow::bail!("SetKeys must be called before SetVariant");
        }

        self.buffers = (0..self.no_keys).map(|_| FieldBuffer::new()).collect();
        self.obs_codes = vec![0; self.no_keys];
        self.obs_payloads = (0..self.no_keys).map(|_| Vec::new()).collect();

        self.key_stream_ids = Vec::with_capacity(self.no_keys);
        for key in &self.keys {
            let sid = self.tmp.register_stream(&key_size_stream(key.id))?;
            let did = self.tmp.register_stream(&key_data_stream(key.id))?;
            self.key_stream_ids.push((sid, did));
        }

        let kinds: Vec<KeyKind> = self.keys.iter().map(|k| k.kind).collect();
        self.tracker = Some(GraphTracker::new(
            self.no_keys,
            self.gt_key.map(|k| k as u32),
            &kinds,
        ));

        let shared = Arc::new(Shared {
            queue: RegisteringQueue::new(1),
            tmp: Arc::clone(&self.tmp),
            keys: self.keys.clone(),
            gt_coder: Mutex::new(GtCoder::new()),
            text_pps: (0..self.no_keys).map(|_| Mutex::new(TextPreprocessor::new())).collect(),
            coder_gate: Gate::new(1),
            text_gate: Gate::new(self.no_keys),
            inflight: Mutex::new(vec![0; self.no_keys + NO_DB_FIELDS]),
            cv_inflight: Condvar::new(),
            error: Mutex::new(None),
        });

        let n_workers = self.params.no_threads.max(1) as usize;
        for _ in 0..n_workers {
            let shared = Arc::clone(&shared);
            self.workers.push(std::thread::spawn(move || worker_loop(&shared)));
        }
        debug!(workers = n_workers, "worker pool started");

        self.shared = Some(shared);
        self.started = true;
        Ok(())
    }

    pub(crate) fn set_variant(&mut self, desc: &VariantDesc, fields: &[FieldValue]) -> Result<()> {
        let result = self.set_variant_inner(desc, fields);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn set_variant_inner(&mut self, desc: &VariantDesc, fields: &[FieldValue]) -> Result<()> {
        if !self.started {
            self.start()?;
        }
        if fields.len() != self.no_keys {
            anyhow::bail!(
                "variant carries {} fields, {} keys are declared",
                fields.len(),
                self.no_keys
            );
        }
        if self.shared.as_ref().is_some_and(|s| s.has_error()) {
            anyhow::bail!("a worker failed; the archive is abandoned (details at close)");
        }

        // Database columns.
        self.db_buffers[DB_CHROM].append_db_text(&desc.chrom);
        let delta = desc.pos.wrapping_sub(self.prev_pos);
        self.prev_pos = desc.pos;
        self.db_buffers[DB_POS].append_db_varint(zigzag64(delta));
        self.db_buffers[2].append_db_text(&desc.id);
        self.db_buffers[3].append_db_text(&desc.ref_allele);
        self.db_buffers[4].append_db_text(&desc.alt);
        self.db_buffers[5].append_db_text(&desc.qual);

        // Declared keys.
        for (k, value) in fields.iter().enumerate() {
            let kind = self.keys[k].kind;
            let kind_ok = matches!(
                (kind, value),
                (KeyKind::Flag, FieldValue::Flag | FieldValue::Empty)
                    | (KeyKind::Int, FieldValue::Int(_) | FieldValue::Empty)
                    | (KeyKind::Real, FieldValue::Real(_) | FieldValue::Empty)
                    | (KeyKind::Text, FieldValue::Text(_) | FieldValue::Empty)
                    | (KeyKind::Genotype, FieldValue::Genotype(_))
            );
            if !kind_ok {
                anyhow::bail!("field {} does not match the declared {:?} key", k, kind);
            }
            match value {
                FieldValue::Flag => self.buffers[k].append_flag(true),
                FieldValue::Empty if kind == KeyKind::Flag => self.buffers[k].append_flag(false),
                FieldValue::Genotype(row) => {
                    let expected = (self.params.ploidy * self.no_samples) as usize;
                    if row.len() != expected {
                        anyhow::bail!(
                            "genotype row has {} symbols, expected ploidy*samples = {}",
                            row.len(),
                            expected
                        );
                    }
                    self.buffers[k].append(value);
                }
                other => self.buffers[k].append(other),
            }
        }

        // Function-graph statistics.
        if let Some(tracker) = self.tracker.as_mut() {
            for (k, value) in fields.iter().enumerate() {
                self.obs_payloads[k].clear();
                self.obs_codes[k] = encode_elements(value, &mut self.obs_payloads[k]);
            }
            let obs: Vec<RecordObs> = self
                .obs_codes
                .iter()
                .zip(self.obs_payloads.iter())
                .map(|(&size_code, payload)| RecordObs { size_code, bytes: payload })
                .collect();
            tracker.observe(&obs);
        }

        // Seal buffers that crossed their caps.
        for k in 0..self.no_keys {
            let cap = if self.gt_key == Some(k) { MAX_BUFFER_GT_SIZE } else { MAX_BUFFER_SIZE };
            if self.buffers[k].byte_size() >= cap {
                self.seal_field(k)?;
            }
        }
        for col in 0..NO_DB_FIELDS {
            if self.db_buffers[col].byte_size() >= MAX_BUFFER_DB_SIZE {
                self.seal_db(col)?;
            }
        }

        self.no_variants += 1;
        Ok(())
    }

    /// Block until the key's in-flight package count drops below the cap,
    /// then claim a slot.
    fn claim_slot(&self, slot: usize) {
        let shared = self.shared.as_ref().unwrap();
        let mut inflight = shared.inflight.lock().unwrap();
        while inflight[slot] >= MAX_CNT_PACKAGES && !shared.has_error() {
            inflight = shared.cv_inflight.wait(inflight).unwrap();
        }
        inflight[slot] += 1;
    }

    fn seal_field(&mut self, k: usize) -> Result<()> {
        self.claim_slot(k);
        let (sizes, data) = self.buffers[k].take();
        let part_id = self.next_part[k];
        self.next_part[k] += 1;
        let kind = if self.gt_key == Some(k) { PackageKind::Gt } else { PackageKind::Field };
        let (stream_id_size, stream_id_data) = self.key_stream_ids[k];
        debug!(key = k, part_id, bytes = data.len(), "sealed field package");
        self.shared.as_ref().unwrap().queue.push(Package {
            kind,
            key_id: k,
            stream_id_size,
            stream_id_data,
            part_id,
            sizes,
            data,
        });
        Ok(())
    }

    fn seal_db(&mut self, col: usize) -> Result<()> {
        self.claim_slot(self.no_keys + col);
        let (sizes, data) = self.db_buffers[col].take();
        let part_id = self.db_next_part[col];
        self.db_next_part[col] += 1;
        let (stream_id_size, stream_id_data) = self.db_stream_ids[col];
        debug!(col, part_id, bytes = data.len(), "sealed database package");
        self.shared.as_ref().unwrap().queue.push(Package {
            kind: PackageKind::Db,
            key_id: col,
            stream_id_size,
            stream_id_data,
            part_id,
            sizes,
            data,
        });
        Ok(())
    }

    pub(crate) fn close(mut self) -> Result<()> {
        // Flush partial buffers, drain the queue, stop the pool.
        let flush_result = if self.failed { Ok(()) } else { self.flush_all() };
        if let Some(shared) = &self.shared {
            shared.queue.mark_completed();
        }
        let mut panicked = false;
        for handle in self.workers.drain(..) {
            panicked |= handle.join().is_err();
        }
        if panicked {
            let _ = std::fs::remove_file(&self.tmp_path);
            anyhow::bail!("worker thread panicked");
        }
        let worker_error = self
            .shared
            .as_ref()
            .and_then(|s| s.error.lock().unwrap().take());
        if let Some(e) = worker_error {
            let _ = std::fs::remove_file(&self.tmp_path);
            return Err(e).context("worker failure while compressing");
        }
        flush_result?;
        if self.failed {
            let _ = std::fs::remove_file(&self.tmp_path);
            anyhow::bail!("archive abandoned after a contract violation");
        }

        let result = self.write_final_archive();
        let _ = std::fs::remove_file(&self.tmp_path);
        if result.is_err() {
            let _ = std::fs::remove_file(&self.path);
        }
        result
    }

    fn flush_all(&mut self) -> Result<()> {
        let any_pending = self.buffers.iter().any(|b| !b.is_empty())
            || self.db_buffers.iter().any(|b| !b.is_empty());
        if any_pending && !self.started {
            self.start()?;
        }
        for k in 0..self.buffers.len() {
            if !self.buffers[k].is_empty() {
                self.seal_field(k)?;
            }
        }
        for col in 0..NO_DB_FIELDS {
            if !self.db_buffers[col].is_empty() {
                self.seal_db(col)?;
            }
        }
        Ok(())
    }

    /// Run the optimiser and write the final archive canonically:
    /// streams in registration order, parts in part-id order, so the
    /// output bytes are independent of worker scheduling.
    fn write_final_archive(&mut self) -> Result<()> {
        let mut tracker = self.tracker.take().unwrap_or_else(|| {
            let kinds: Vec<KeyKind> = self.keys.iter().map(|k| k.kind).collect();
            GraphTracker::new(self.keys.len(), None, &kinds)
        });
        let graphs = tracker.finalize()?;
        info!(
            data_edges = graphs.data_edges.len(),
            size_edges = graphs.size_edges.len(),
            "function-graph optimisation finished"
        );

        for key in &mut self.keys {
            key.neglect =
                tracker.distinct_count(key.id as usize) <= self.params.neglect_limit as usize;
        }

        let archive = Archive::create(&self.path)?;

        let params_id = archive.register_stream("params")?;
        archive.add_part(params_id, 0, &self.params.store())?;

        let mut attrs = Vec::new();
        write_varint(&mut attrs, self.no_variants);
        write_varint(&mut attrs, self.no_samples as u64);
        write_varint(&mut attrs, self.no_keys as u64);
        write_varint(&mut attrs, self.params.ploidy as u64);
        write_varint(&mut attrs, self.gt_key.map(|k| k as u64 + 1).unwrap_or(0));
        write_meta_stream(&archive, "attributes", &attrs)?;

        write_meta_stream(&archive, "meta", &self.meta)?;
        write_meta_stream(&archive, "header", &self.header)?;
        write_meta_stream(&archive, "samples", &serialize_samples(&self.samples))?;
        write_meta_stream(&archive, "keys", &serialize_keys(&self.keys))?;

        let no_keys = self.no_keys;
        let data_replaced: Vec<bool> =
            (0..no_keys).map(|k| graphs.data_edge_for(k as u32).is_some()).collect();
        let size_replaced: Vec<bool> = (0..no_keys)
            .map(|k| data_replaced[k] || graphs.size_edge_for(k as u32).is_some())
            .collect();
        write_meta_stream(&archive, "gr_size_nodes", &serialize_nodes(&size_replaced))?;
        write_meta_stream(&archive, "gr_size_edges", &serialize_edges(&graphs.size_edges))?;
        write_meta_stream(&archive, "gr_data_nodes", &serialize_nodes(&data_replaced))?;
        write_meta_stream(&archive, "gr_data_edges", &serialize_edges(&graphs.data_edges))?;

        for col in 0..NO_DB_FIELDS {
            copy_stream(&self.tmp, &archive, &db_size_stream(col))?;
            copy_stream(&self.tmp, &archive, &db_data_stream(col))?;
        }

        for key in &self.keys {
            let id = key.id;
            match graphs.data_edge_for(id) {
                Some(Edge { src, kind: EdgeKind::Equal, .. }) => {
                    archive.link(&key_size_stream(id), &key_size_stream(*src))?;
                    archive.link(&key_data_stream(id), &key_data_stream(*src))?;
                }
                Some(Edge { src, kind: EdgeKind::Mapping(entries), .. }) => {
                    archive.register_stream(&key_size_stream(id))?;
                    archive.register_stream(&key_data_stream(id))?;
                    write_meta_stream(
                        &archive,
                        &key_func_data_stream(id),
                        &serialize_function(*src, entries),
                    )?;
                }
                None => {
                    match graphs.size_edge_for(id) {
                        Some(Edge { src, kind: EdgeKind::Equal, .. }) => {
                            archive.link(&key_size_stream(id), &key_size_stream(*src))?;
                        }
                        Some(Edge { src, kind: EdgeKind::Mapping(entries), .. }) => {
                            archive.register_stream(&key_size_stream(id))?;
                            write_meta_stream(
                                &archive,
                                &key_func_size_stream(id),
                                &serialize_function(*src, entries),
                            )?;
                        }
                        None => copy_stream(&self.tmp, &archive, &key_size_stream(id))?,
                    }
                    copy_stream(&self.tmp, &archive, &key_data_stream(id))?;
                }
            }
        }

        archive.finalize()?;
        info!(
            path = %self.path.display(),
            variants = self.no_variants,
            "archive closed"
        );
        Ok(())
    }
}

fn serialize_samples(samples: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, samples.len() as u64);
    for s in samples {
        write_varint(&mut out, s.len() as u64);
        out.extend_from_slice(s);
    }
    out
}

fn serialize_keys(keys: &[KeyDesc]) -> Vec<u8> {
    use crate::variant::KeyDim;
    let mut out = Vec::new();
    write_varint(&mut out, keys.len() as u64);
    for key in keys {
        write_varint(&mut out, key.id as u64);
        write_varint(&mut out, key.name.len() as u64);
        out.extend_from_slice(&key.name);
        out.push(key.kind.to_code());
        match key.dim {
            KeyDim::Scalar => out.push(0),
            KeyDim::Fixed(n) => {
                out.push(1);
                write_varint(&mut out, n as u64);
            }
            KeyDim::Variable => out.push(2),
        }
        out.push(key.neglect as u8);
    }
    out
}

fn serialize_nodes(replaced: &[bool]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, replaced.len() as u64);
    for (id, &r) in replaced.iter().enumerate() {
        write_varint(&mut out, id as u64);
        out.push(!r as u8);
    }
    out
}

fn serialize_edges(edges: &[Edge]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, edges.len() as u64);
    for edge in edges {
        write_varint(&mut out, edge.dst as u64);
        write_varint(&mut out, edge.src as u64);
        out.push(matches!(edge.kind, EdgeKind::Mapping(_)) as u8);
    }
    out
}

fn serialize_function(src: u32, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, src as u64);
    write_varint(&mut out, entries.len() as u64);
    for (k, v) in entries {
        write_varint(&mut out, k.len() as u64);
        out.extend_from_slice(k);
        write_varint(&mut out, v.len() as u64);
        out.extend_from_slice(v);
    }
    out
}

/// Descriptions and descriptors: one part under the meta preset.
fn write_meta_stream(archive: &Archive, name: &str, payload: &[u8]) -> Result<()> {
    let id = archive.register_stream(name)?;
    let compressed = entropy::compress(payload, entropy::P_META)?;
    archive.add_part(id, 0, &compressed)
}

fn copy_stream(tmp: &Archive, archive: &Archive, name: &str) -> Result<()> {
    let dst_id = archive.register_stream(name)?;
    let Some(src_id) = tmp.stream_id(name) else {
        return Ok(());
    };
    let count = tmp.part_count(src_id)?;
    for part_id in 0..count as u32 {
        let blob = tmp.get_part(src_id, part_id)?;
        archive.add_part(dst_id, part_id, &blob)?;
    }
    Ok(())
}

fn worker_loop(shared: &Shared) {
    while let Some(pck) = shared.queue.pop() {
        let slot = match pck.kind {
            PackageKind::Db => shared.keys.len() + pck.key_id,
            _ => pck.key_id,
        };
        if shared.has_error() {
            // Drain mode: keep gate counters moving so ordered workers
            // blocked on earlier parts can finish.
            match pck.kind {
                PackageKind::Gt => shared.coder_gate.advance(0),
                PackageKind::Field if shared.keys[pck.key_id].kind == KeyKind::Text => {
                    shared.text_gate.advance(pck.key_id)
                }
                _ => {}
            }
        } else if let Err(e) = process_package(shared, pck) {
            shared.latch_error(e);
        }

        let mut inflight = shared.inflight.lock().unwrap();
        inflight[slot] -= 1;
        drop(inflight);
        shared.cv_inflight.notify_all();
    }
}

fn process_package(shared: &Shared, pck: Package) -> Result<()> {
    match pck.kind {
        PackageKind::Field => process_field(shared, pck),
        PackageKind::Gt => process_gt(shared, pck),
        PackageKind::Db => process_db(shared, pck),
    }
}

fn add_sizes_part(shared: &Shared, pck: &Package) -> Result<()> {
    let payload = entropy::compress(&sizes_to_bytes(&pck.sizes), entropy::P_SIZES)?;
    shared.tmp.add_part(pck.stream_id_size, pck.part_id, &payload)
}

fn process_field(shared: &Shared, pck: Package) -> Result<()> {
    match shared.keys[pck.key_id].kind {
        KeyKind::Flag => {
            let n = pck.data.len() as u32;
            let mut raw = Vec::with_capacity(4 + pck.data.len() / 8 + 1);
            raw.extend_from_slice(&n.to_le_bytes());
            raw.extend(pck.data.chunks(8).map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &b)| acc | ((b & 1) << i))
            }));
            let payload = entropy::compress(&raw, entropy::P_FLAG)?;
            shared.tmp.add_part(pck.stream_id_data, pck.part_id, &payload)
        }
        KeyKind::Int | KeyKind::Real => {
            add_sizes_part(shared, &pck)?;
            let preset = if shared.keys[pck.key_id].kind == KeyKind::Int {
                entropy::P_INT
            } else {
                entropy::P_REAL
            };
            let mut payload = (pck.sizes.len() as u32).to_le_bytes().to_vec();
            payload.extend_from_slice(&entropy::compress(&pck.data, preset)?);
            shared.tmp.add_part(pck.stream_id_data, pck.part_id, &payload)
        }
        KeyKind::Text => {
            let sizes_result = add_sizes_part(shared, &pck);
            // The shared dictionary must see parts in part-id order; the
            // gate is waited on and advanced even if the sizes part
            // failed, so later parts of this stream cannot deadlock.
            shared.text_gate.wait_for(pck.key_id, pck.part_id);
            let pp_out = {
                let mut pp = shared.text_pps[pck.key_id].lock().unwrap();
                pp.encode(&pck.data)
            };
            shared.text_gate.advance(pck.key_id);
            sizes_result?;

            let (text_payload, flag) = match pp_out {
                Some(encoded) => (encoded, PP_FLAG),
                None => (pck.data, 0),
            };
            let stored = text_payload.len() as u32 | flag;
            let mut payload = (pck.sizes.len() as u32).to_le_bytes().to_vec();
            payload.extend_from_slice(&stored.to_le_bytes());
            payload.extend_from_slice(&entropy::compress(&text_payload, entropy::P_TEXT)?);
            shared.tmp.add_part(pck.stream_id_data, pck.part_id, &payload)
        }
        KeyKind::Genotype => anyhow::bail!("genotype packages must use the Gt kind"),
    }
}

fn process_gt(shared: &Shared, pck: Package) -> Result<()> {
    let sizes_result = add_sizes_part(shared, &pck);

    let parsed: Result<(Vec<usize>, Vec<u32>)> = if pck.data.len() % 4 != 0 {
        Err(anyhow::anyhow!("genotype package data is not u32-aligned"))
    } else {
        let symbols = pck
            .data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let widths = pck.sizes.iter().map(|&s| s.saturating_sub(1) as usize).collect();
        Ok((widths, symbols))
    };

    // Coder state is shared across the whole stream: parts must be
    // encoded strictly in part-id order. The gate is waited on and
    // advanced unconditionally so a failure in one part cannot strand
    // workers holding later parts.
    shared.coder_gate.wait_for(0, pck.part_id);
    let encoded = match &parsed {
        Ok((widths, symbols)) => {
            let mut coder = shared.gt_coder.lock().unwrap();
            Some(coder.encode_part(widths, symbols))
        }
        Err(_) => None,
    };
    shared.coder_gate.advance(0);

    sizes_result?;
    parsed?;
    let payload = encoded.expect("encoded exists when parsing succeeded")?;
    shared.tmp.add_part(pck.stream_id_data, pck.part_id, &payload)
}

fn process_db(shared: &Shared, pck: Package) -> Result<()> {
    add_sizes_part(shared, &pck)?;
    let preset = [
        entropy::P_DB_CHROM,
        entropy::P_DB_POS,
        entropy::P_DB_ID,
        entropy::P_DB_REF,
        entropy::P_DB_ALT,
        entropy::P_DB_QUAL,
    ][pck.key_id];

    let raw = if pck.key_id == DB_CHROM {
        chrom_dict_encode(&pck.sizes, &pck.data)?
    } else {
        pck.data
    };
    let payload = entropy::compress(&raw, preset)?;
    shared.tmp.add_part(pck.stream_id_data, pck.part_id, &payload)
}

/// The chromosome alphabet is tiny and stable: per-part dictionary of
/// names plus one code per record.
fn chrom_dict_encode(sizes: &[u32], data: &[u8]) -> Result<Vec<u8>> {
    use rustc_hash::FxHashMap;
    let mut dict: Vec<&[u8]> = Vec::new();
    let mut codes: FxHashMap<&[u8], u64> = FxHashMap::default();
    let mut record_codes = Vec::with_capacity(sizes.len());

    let mut offset = 0usize;
    for &s in sizes {
        let len = s.saturating_sub(1) as usize;
        let name = data
            .get(offset..offset + len)
            .ok_or_else(|| anyhow::anyhow!("chromosome record overruns package data"))?;
        offset += len;
        let code = match codes.get(name) {
            Some(&c) => c,
            None => {
                let c = dict.len() as u64;
                codes.insert(name, c);
                dict.push(name);
                c
            }
        };
        record_codes.push(code);
    }
    if offset != data.len() {
        anyhow::bail!("chromosome package has trailing bytes");
    }

    let mut out = Vec::new();
    write_varint(&mut out, dict.len() as u64);
    for name in &dict {
        write_varint(&mut out, name.len() as u64);
        out.extend_from_slice(name);
    }
    for code in record_codes {
        write_varint(&mut out, code);
    }
    Ok(out)
}

/// Invert [`chrom_dict_encode`] into the concatenated record bytes.
pub(super) fn chrom_dict_decode(raw: &[u8], n_records: usize) -> Result<Vec<u8>> {
    let mut pos = 0usize;
    let dict_len = crate::buffer::read_varint(raw, &mut pos)? as usize;
    let mut dict = Vec::with_capacity(dict_len);
    for _ in 0..dict_len {
        let len = crate::buffer::read_varint(raw, &mut pos)? as usize;
        let name = raw
            .get(pos..pos + len)
            .ok_or_else(|| anyhow::anyhow!("truncated chromosome dictionary"))?;
        pos += len;
        dict.push(name);
    }
    let mut out = Vec::new();
    for _ in 0..n_records {
        let code = crate::buffer::read_varint(raw, &mut pos)? as usize;
        let name = dict
            .get(code)
            .ok_or_else(|| anyhow::anyhow!("chromosome code {code} out of range"))?;
        out.extend_from_slice(name);
    }
    if pos != raw.len() {
        anyhow::bail!("trailing bytes after chromosome codes");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrom_dict_roundtrip() {
        let records: [&[u8]; 5] = [b"chr1", b"chr1", b"chr2", b"chr1", b"chrX"];
        let mut sizes = Vec::new();
        let mut data = Vec::new();
        for r in records {
            sizes.push(1 + r.len() as u32);
            data.extend_from_slice(r);
        }
        let encoded = chrom_dict_encode(&sizes, &data).unwrap();
        let decoded = chrom_dict_decode(&encoded, records.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn gate_orders_waiters() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let gate = Arc::new(Gate::new(1));
        let seen = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for part in (0..8u32).rev() {
            let gate = Arc::clone(&gate);
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || {
                gate.wait_for(0, part);
                // Exactly `part` predecessors have run.
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), part);
                gate.advance(0);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
