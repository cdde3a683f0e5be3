//! Inter-field redundancy detection. While variants are ingested the
//! tracker maintains, for every candidate pair of keys, whether one can
//! still be expressed as a function of the other; at close the surviving
//! pairs are turned into equality links and mapping descriptors. The
//! tracking is exact, so every emitted edge is bit-for-bit valid by
//! construction.

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::variant::KeyKind;

/// Pair tracking is quadratic in key count; beyond this many keys the
/// graphs stay empty and every field is stored directly.
const MAX_GRAPH_KEYS: usize = 64;

/// A mapping that needs more than this many entries is not worth a
/// descriptor and the pair is dropped.
const MAP_CAP: usize = 256;

/// Distinct-record counting saturates here (the neglect limit is a u8).
const DISTINCT_CAP: usize = 256;

/// One observed record: the sizes-stream code plus the wire bytes of the
/// record payload.
#[derive(Debug, Clone, Copy)]
pub struct RecordObs<'a> {
    pub size_code: u32,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeKind {
    /// Destination records are byte-identical to the source's; stored as
    /// an archive link.
    Equal,
    /// Destination records are a small enumerated function of the
    /// source's; entries are (src composite, dst composite), sorted.
    Mapping(Vec<(Vec<u8>, Vec<u8>)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub dst: u32,
    pub src: u32,
    pub kind: EdgeKind,
}

#[derive(Debug, Default)]
pub struct FunctionGraphs {
    pub data_edges: Vec<Edge>,
    pub size_edges: Vec<Edge>,
}

impl FunctionGraphs {
    pub fn data_edge_for(&self, dst: u32) -> Option<&Edge> {
        self.data_edges.iter().find(|e| e.dst == dst)
    }

    pub fn size_edge_for(&self, dst: u32) -> Option<&Edge> {
        self.size_edges.iter().find(|e| e.dst == dst)
    }

    /// Reject graphs whose edges do not form a depth-1 DAG: every source
    /// must itself be a stored node.
    pub fn validate(&self) -> Result<()> {
        for (edges, what) in [(&self.data_edges, "data"), (&self.size_edges, "sizes")] {
            let dsts: FxHashSet<u32> = edges.iter().map(|e| e.dst).collect();
            if dsts.len() != edges.len() {
                anyhow::bail!("{what} graph replaces a key twice");
            }
            for e in edges {
                if dsts.contains(&e.src) {
                    anyhow::bail!(
                        "{what} graph edge {} <- {} uses a replaced source",
                        e.dst,
                        e.src
                    );
                }
            }
        }
        Ok(())
    }
}

/// Composite record key: size code then payload, so a present-but-empty
/// record never collides with an absent one.
pub fn composite(size_code: u32, bytes: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(5 + bytes.len());
    crate::buffer::write_varint(&mut v, size_code as u64);
    v.extend_from_slice(bytes);
    v
}

/// Split a composite back into (size code, payload).
pub fn split_composite(data: &[u8]) -> Result<(u32, &[u8])> {
    let mut pos = 0;
    let size_code = crate::buffer::read_varint(data, &mut pos)? as u32;
    Ok((size_code, &data[pos..]))
}

pub struct GraphTracker {
    n_keys: usize,
    enabled: bool,
    /// Keys excluded from all tracking (the genotype key).
    excluded: Vec<bool>,
    /// Keys with no sizes stream (flag keys), excluded from size graphs.
    sizeless: Vec<bool>,
    eq_data: Vec<bool>,
    eq_size: Vec<bool>,
    /// `None` = pair broken; `Some(map)` = still a candidate.
    map_data: Vec<Option<FxHashMap<Vec<u8>, Vec<u8>>>>,
    map_size: Vec<Option<FxHashMap<u32, u32>>>,
    distinct: Vec<FxHashSet<Vec<u8>>>,
}

impl GraphTracker {
    pub fn new(n_keys: usize, gt_key: Option<u32>, kinds: &[KeyKind]) -> Self {
        debug_assert_eq!(kinds.len(), n_keys);
        let enabled = (2..=MAX_GRAPH_KEYS).contains(&n_keys);
        let mut excluded = vec![false; n_keys];
        if let Some(gt) = gt_key {
            excluded[gt as usize] = true;
        }
        let pair_n = if enabled { n_keys * n_keys } else { 0 };
        // Equality becomes an archive link, which aliases the raw part
        // bytes: that is only sound between keys of the same kind.
        // Mapping descriptors re-encode per record and may cross kinds.
        let mut eq_data = vec![enabled; pair_n];
        let eq_size = vec![enabled; pair_n];
        if enabled {
            for dst in 0..n_keys {
                for src in 0..n_keys {
                    if kinds[dst] != kinds[src] {
                        eq_data[dst * n_keys + src] = false;
                    }
                }
            }
        }
        Self {
            n_keys,
            enabled,
            excluded,
            sizeless: kinds.iter().map(|&k| k == KeyKind::Flag).collect(),
            eq_data,
            eq_size,
            map_data: (0..pair_n).map(|_| Some(FxHashMap::default())).collect(),
            map_size: (0..pair_n).map(|_| Some(FxHashMap::default())).collect(),
            distinct: vec![FxHashSet::default(); n_keys],
        }
    }

    #[inline]
    fn pair(&self, dst: usize, src: usize) -> usize {
        dst * self.n_keys + src
    }

    /// Feed one variant's records, one per key in declared order.
    pub fn observe(&mut self, records: &[RecordObs]) {
        debug_assert_eq!(records.len(), self.n_keys);

        for (k, obs) in records.iter().enumerate() {
            if self.excluded[k] || self.distinct[k].len() >= DISTINCT_CAP {
                continue;
            }
            self.distinct[k].insert(composite(obs.size_code, obs.bytes));
        }

        if !self.enabled {
            return;
        }

        for dst in 0..self.n_keys {
            if self.excluded[dst] {
                continue;
            }
            for src in 0..self.n_keys {
                if src == dst || self.excluded[src] {
                    continue;
                }
                let p = self.pair(dst, src);
                let d = records[dst];
                let s = records[src];

                if src < dst {
                    // Equality is symmetric; track it on the dst > src
                    // side only.
                    if self.eq_data[p] && (d.size_code != s.size_code || d.bytes != s.bytes) {
                        self.eq_data[p] = false;
                    }
                    if self.eq_size[p] && d.size_code != s.size_code {
                        self.eq_size[p] = false;
                    }
                }

                if let Some(map) = &mut self.map_data[p] {
                    let key = composite(s.size_code, s.bytes);
                    let val = composite(d.size_code, d.bytes);
                    let broken = match map.get(&key) {
                        Some(existing) => *existing != val,
                        None if map.len() >= MAP_CAP => true,
                        None => {
                            map.insert(key, val);
                            false
                        }
                    };
                    if broken {
                        self.map_data[p] = None;
                    }
                }

                if !self.sizeless[dst] && !self.sizeless[src] {
                    if let Some(map) = &mut self.map_size[p] {
                        let broken = match map.get(&s.size_code) {
                            Some(&existing) => existing != d.size_code,
                            None if map.len() >= MAP_CAP => true,
                            None => {
                                map.insert(s.size_code, d.size_code);
                                false
                            }
                        };
                        if broken {
                            self.map_size[p] = None;
                        }
                    }
                }
            }
        }
    }

    /// Distinct-record count for a key, saturating at the tracking cap.
    pub fn distinct_count(&self, key: usize) -> usize {
        self.distinct[key].len()
    }

    /// Select the final edge sets. Destinations are processed in
    /// descending key id so the earliest key of an equivalence class
    /// stays the stored root; an equality edge beats a mapping edge and
    /// the lowest eligible source id wins. Sources are never themselves
    /// replaced, so the result is a depth-1 DAG.
    pub fn finalize(&mut self) -> Result<FunctionGraphs> {
        let mut graphs = FunctionGraphs::default();
        if !self.enabled {
            return Ok(graphs);
        }

        // A key already serving as a source must stay stored, otherwise a
        // later (lower-id) destination round would strand its dependants.
        let mut data_replaced = vec![false; self.n_keys];
        let mut data_used_as_src = vec![false; self.n_keys];
        for dst in (0..self.n_keys).rev() {
            if self.excluded[dst] || data_used_as_src[dst] {
                continue;
            }
            let mut chosen: Option<Edge> = None;
            for src in 0..dst {
                if self.excluded[src] || data_replaced[src] {
                    continue;
                }
                if self.eq_data[self.pair(dst, src)] {
                    chosen = Some(Edge { dst: dst as u32, src: src as u32, kind: EdgeKind::Equal });
                    break;
                }
            }
            if chosen.is_none() {
                for src in 0..self.n_keys {
                    if src == dst || self.excluded[src] || data_replaced[src] {
                        continue;
                    }
                    if let Some(map) = &self.map_data[self.pair(dst, src)] {
                        if map.is_empty() {
                            continue;
                        }
                        let mut entries: Vec<(Vec<u8>, Vec<u8>)> =
                            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                        entries.sort();
                        chosen = Some(Edge {
                            dst: dst as u32,
                            src: src as u32,
                            kind: EdgeKind::Mapping(entries),
                        });
                        break;
                    }
                }
            }
            if let Some(edge) = chosen {
                data_replaced[dst] = true;
                data_used_as_src[edge.src as usize] = true;
                graphs.data_edges.push(edge);
            }
        }

        // Destinations of equality links alias their source's sizes
        // stream too, so those sources must keep stored sizes.
        let eq_data_sources: Vec<bool> = {
            let mut v = vec![false; self.n_keys];
            for e in &graphs.data_edges {
                if e.kind == EdgeKind::Equal {
                    v[e.src as usize] = true;
                }
            }
            v
        };

        // Sizes: only keys that still store their own data need a size
        // edge (a data edge reconstructs the whole record, sizes
        // included), and flag keys have no sizes stream at all.
        let mut size_replaced = vec![false; self.n_keys];
        let mut size_used_as_src = vec![false; self.n_keys];
        for dst in (0..self.n_keys).rev() {
            if self.excluded[dst]
                || self.sizeless[dst]
                || data_replaced[dst]
                || eq_data_sources[dst]
                || size_used_as_src[dst]
            {
                continue;
            }
            let eligible = |src: usize, size_replaced: &[bool]| {
                src != dst
                    && !self.excluded[src]
                    && !self.sizeless[src]
                    && !data_replaced[src]
                    && !size_replaced[src]
            };
            let mut chosen: Option<Edge> = None;
            for src in 0..dst {
                if eligible(src, &size_replaced) && self.eq_size[self.pair(dst, src)] {
                    chosen = Some(Edge { dst: dst as u32, src: src as u32, kind: EdgeKind::Equal });
                    break;
                }
            }
            if chosen.is_none() {
                for src in 0..self.n_keys {
                    if !eligible(src, &size_replaced) {
                        continue;
                    }
                    if let Some(map) = &self.map_size[self.pair(dst, src)] {
                        if map.is_empty() {
                            continue;
                        }
                        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = map
                            .iter()
                            .map(|(&k, &v)| {
                                let mut kb = Vec::new();
                                let mut vb = Vec::new();
                                crate::buffer::write_varint(&mut kb, k as u64);
                                crate::buffer::write_varint(&mut vb, v as u64);
                                (kb, vb)
                            })
                            .collect();
                        entries.sort();
                        chosen = Some(Edge {
                            dst: dst as u32,
                            src: src as u32,
                            kind: EdgeKind::Mapping(entries),
                        });
                        break;
                    }
                }
            }
            if let Some(edge) = chosen {
                size_replaced[dst] = true;
                size_used_as_src[edge.src as usize] = true;
                graphs.size_edges.push(edge);
            }
        }

        graphs.data_edges.sort_by_key(|e| e.dst);
        graphs.size_edges.sort_by_key(|e| e.dst);
        graphs.validate()?;
        Ok(graphs)
    }
}
