//! Archive container: named streams of opaque parts in a single seekable
//! file, with the index discoverable from the tail. Parts may be appended
//! concurrently; the container serialises appends and stores the
//! producer-supplied part id alongside each blob, reordering on read.
//!
//! Layout: `MAGIC(8) | VERSION(1) | parts... | INDEX | INDEX_LEN(8 LE) |
//! FOOTER(8)`. A part is `stream_id varint | part_id varint | len varint
//! | bytes`. The index lists streams in registration order: name, link
//! target (empty when the stream owns its parts), and the part table of
//! `(offset, length, part_id)` triples.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;

use crate::buffer::{read_varint, write_varint};

const MAGIC: [u8; 8] = *b"VCFSHARK";
const FOOTER_MAGIC: [u8; 8] = *b"VCFSHKIX";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy)]
struct PartEntry {
    offset: u64,
    length: u64,
    part_id: u32,
}

#[derive(Debug, Default)]
struct StreamInfo {
    name: String,
    link_target: Option<String>,
    parts: Vec<PartEntry>,
}

#[derive(PartialEq)]
enum Mode {
    Writing,
    Reading,
}

struct Inner {
    file: File,
    end_offset: u64,
    streams: Vec<StreamInfo>,
    by_name: FxHashMap<String, usize>,
}

pub struct Archive {
    inner: Mutex<Inner>,
    mode: Mode,
}

impl Archive {
    /// Create an archive for writing. The file is opened read+write so
    /// parts can be read back before finalisation.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create archive {}", path.display()))?;
        file.write_all(&MAGIC)?;
        file.write_all(&[VERSION])?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                end_offset: MAGIC.len() as u64 + 1,
                streams: Vec::new(),
                by_name: FxHashMap::default(),
            }),
            mode: Mode::Writing,
        })
    }

    /// Open an existing archive and load its index from the tail.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open archive {}", path.display()))?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 8];
        let mut version = [0u8; 1];
        if file_len < (MAGIC.len() + 1 + 16) as u64 {
            anyhow::bail!("archive too small: {file_len} bytes");
        }
        file.read_exact(&mut magic)?;
        file.read_exact(&mut version)?;
        if magic != MAGIC {
            anyhow::bail!("bad archive magic");
        }
        if version[0] != VERSION {
            anyhow::bail!("unsupported archive version {}", version[0]);
        }

        file.seek(SeekFrom::End(-16))?;
        let mut tail = [0u8; 16];
        file.read_exact(&mut tail)?;
        if tail[8..] != FOOTER_MAGIC {
            anyhow::bail!("bad archive footer magic");
        }
        let index_len = u64::from_le_bytes(tail[..8].try_into().unwrap());
        let index_start = file_len
            .checked_sub(16 + index_len)
            .filter(|&s| s >= (MAGIC.len() + 1) as u64)
            .ok_or_else(|| anyhow::anyhow!("archive index length out of range"))?;

        file.seek(SeekFrom::Start(index_start))?;
        let mut index = vec![0u8; index_len as usize];
        file.read_exact(&mut index)?;

        let (streams, by_name) = parse_index(&index, index_start)?;
        Ok(Self {
            inner: Mutex::new(Inner { file, end_offset: file_len, streams, by_name }),
            mode: Mode::Reading,
        })
    }

    /// Register a new stream; returns its id. Ids are dense and follow
    /// registration order, which is preserved in the index.
    pub fn register_stream(&self, name: &str) -> Result<usize> {
        debug_assert!(self.mode == Mode::Writing);
        let mut inner = self.inner.lock().unwrap();
        if inner.by_name.contains_key(name) {
            anyhow::bail!("stream {name} already registered");
        }
        let id = inner.streams.len();
        inner.streams.push(StreamInfo {
            name: name.to_string(),
            link_target: None,
            parts: Vec::new(),
        });
        inner.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register `name` as an alias of `target`'s part list.
    pub fn link(&self, name: &str, target: &str) -> Result<usize> {
        debug_assert!(self.mode == Mode::Writing);
        let mut inner = self.inner.lock().unwrap();
        if !inner.by_name.contains_key(target) {
            anyhow::bail!("link target {target} does not exist");
        }
        if let Some(&id) = inner.by_name.get(name) {
            if !inner.streams[id].parts.is_empty() {
                anyhow::bail!("cannot turn non-empty stream {name} into a link");
            }
            inner.streams[id].link_target = Some(target.to_string());
            return Ok(id);
        }
        let id = inner.streams.len();
        inner.streams.push(StreamInfo {
            name: name.to_string(),
            link_target: Some(target.to_string()),
            parts: Vec::new(),
        });
        inner.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn stream_id(&self, name: &str) -> Option<usize> {
        self.inner.lock().unwrap().by_name.get(name).copied()
    }

    /// Append one part. Safe to call from multiple threads; the append
    /// is serialised and the part id recorded for read-time ordering.
    pub fn add_part(&self, stream_id: usize, part_id: u32, data: &[u8]) -> Result<()> {
        debug_assert!(self.mode == Mode::Writing);
        let mut inner = self.inner.lock().unwrap();

        let mut header = Vec::with_capacity(16);
        write_varint(&mut header, stream_id as u64);
        write_varint(&mut header, part_id as u64);
        write_varint(&mut header, data.len() as u64);

        let end = inner.end_offset;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&header)?;
        inner.file.write_all(data)?;

        let offset = inner.end_offset + header.len() as u64;
        inner.end_offset = offset + data.len() as u64;
        inner.streams[stream_id].parts.push(PartEntry {
            offset,
            length: data.len() as u64,
            part_id,
        });
        Ok(())
    }

    fn resolve<'a>(inner: &'a Inner, stream_id: usize) -> Result<&'a StreamInfo> {
        let info = inner
            .streams
            .get(stream_id)
            .ok_or_else(|| anyhow::anyhow!("stream id {stream_id} out of range"))?;
        match &info.link_target {
            None => Ok(info),
            Some(target) => {
                let tid = *inner
                    .by_name
                    .get(target)
                    .ok_or_else(|| anyhow::anyhow!("dangling link target {target}"))?;
                let tinfo = &inner.streams[tid];
                if tinfo.link_target.is_some() {
                    anyhow::bail!("chained stream links are not supported");
                }
                Ok(tinfo)
            }
        }
    }

    /// Number of parts in a stream (links resolve to their target).
    pub fn part_count(&self, stream_id: usize) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::resolve(&inner, stream_id)?.parts.len())
    }

    /// Fetch the part with the given part id (not file position).
    pub fn get_part(&self, stream_id: usize, part_id: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = *Self::resolve(&inner, stream_id)?
            .parts
            .iter()
            .find(|p| p.part_id == part_id)
            .ok_or_else(|| {
                anyhow::anyhow!("stream {stream_id} has no part {part_id}")
            })?;
        let mut data = vec![0u8; entry.length as usize];
        inner.file.seek(SeekFrom::Start(entry.offset))?;
        inner.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Concatenate all parts of a named stream in part-id order.
    /// Returns `None` for an unknown stream name.
    pub fn get_stream_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(id) = self.stream_id(name) else {
            return Ok(None);
        };
        let count = self.part_count(id)?;
        let mut out = Vec::new();
        for part_id in 0..count as u32 {
            out.extend_from_slice(&self.get_part(id, part_id)?);
        }
        Ok(Some(out))
    }

    /// Streams in registration order: (name, link target, part count,
    /// total stored bytes).
    pub fn list_streams(&self) -> Vec<(String, Option<String>, usize, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    s.link_target.clone(),
                    s.parts.len(),
                    s.parts.iter().map(|p| p.length).sum(),
                )
            })
            .collect()
    }

    /// Write the trailer index and flush. The archive must not be
    /// appended to afterwards.
    pub fn finalize(&self) -> Result<()> {
        debug_assert!(self.mode == Mode::Writing);
        let mut inner = self.inner.lock().unwrap();

        let mut index = Vec::new();
        write_varint(&mut index, inner.streams.len() as u64);
        for stream in &inner.streams {
            write_varint(&mut index, stream.name.len() as u64);
            index.extend_from_slice(stream.name.as_bytes());
            let target = stream.link_target.as_deref().unwrap_or("");
            write_varint(&mut index, target.len() as u64);
            index.extend_from_slice(target.as_bytes());
            write_varint(&mut index, stream.parts.len() as u64);
            for part in &stream.parts {
                write_varint(&mut index, part.offset);
                write_varint(&mut index, part.length);
                write_varint(&mut index, part.part_id as u64);
            }
        }

        let end = inner.end_offset;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&index)?;
        inner.file.write_all(&(index.len() as u64).to_le_bytes())?;
        inner.file.write_all(&FOOTER_MAGIC)?;
        inner.file.flush()?;
        inner.end_offset += index.len() as u64 + 16;
        Ok(())
    }
}

fn parse_index(
    index: &[u8],
    index_start: u64,
) -> Result<(Vec<StreamInfo>, FxHashMap<String, usize>)> {
    let mut pos = 0usize;
    let stream_count = read_varint(index, &mut pos)? as usize;
    let mut streams = Vec::with_capacity(stream_count);
    let mut by_name = FxHashMap::default();

    for id in 0..stream_count {
        let name = read_string(index, &mut pos)?;
        let target = read_string(index, &mut pos)?;
        let part_count = read_varint(index, &mut pos)? as usize;
        let mut parts = Vec::with_capacity(part_count);
        for _ in 0..part_count {
            let offset = read_varint(index, &mut pos)?;
            let length = read_varint(index, &mut pos)?;
            let part_id = read_varint(index, &mut pos)? as u32;
            if offset + length > index_start {
                anyhow::bail!("part of stream {name} points past the index");
            }
            parts.push(PartEntry { offset, length, part_id });
        }

        // Reorder by part id and require the dense range 0..part_count.
        parts.sort_by_key(|p| p.part_id);
        for (i, part) in parts.iter().enumerate() {
            if part.part_id != i as u32 {
                anyhow::bail!(
                    "stream {name}: part ids are not dense (found {} at position {i})",
                    part.part_id
                );
            }
        }

        let link_target = if target.is_empty() { None } else { Some(target) };
        if link_target.is_some() && !parts.is_empty() {
            anyhow::bail!("link stream {name} must not own parts");
        }
        by_name.insert(name.clone(), id);
        streams.push(StreamInfo { name, link_target, parts });
    }
    Ok((streams, by_name))
}

fn read_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(data, pos)? as usize;
    let bytes = data
        .get(*pos..*pos + len)
        .ok_or_else(|| anyhow::anyhow!("truncated string in archive index"))?;
    *pos += len;
    Ok(String::from_utf8(bytes.to_vec()).context("non-UTF-8 stream name")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_with_out_of_order_parts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.vcfshark");

        let archive = Archive::create(&path).unwrap();
        let s0 = archive.register_stream("alpha").unwrap();
        let s1 = archive.register_stream("beta").unwrap();
        // Parts appended out of part-id order, as concurrent workers do.
        archive.add_part(s0, 1, b"alpha-1").unwrap();
        archive.add_part(s1, 0, b"beta-0").unwrap();
        archive.add_part(s0, 0, b"alpha-0").unwrap();
        archive.finalize().unwrap();

        let archive = Archive::open(&path).unwrap();
        let s0 = archive.stream_id("alpha").unwrap();
        assert_eq!(archive.part_count(s0).unwrap(), 2);
        assert_eq!(archive.get_part(s0, 0).unwrap(), b"alpha-0");
        assert_eq!(archive.get_part(s0, 1).unwrap(), b"alpha-1");
        assert_eq!(archive.get_stream_bytes("beta").unwrap().unwrap(), b"beta-0");
        assert!(archive.get_stream_bytes("gamma").unwrap().is_none());
    }

    #[test]
    fn links_resolve_to_target_parts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.vcfshark");

        let archive = Archive::create(&path).unwrap();
        let s0 = archive.register_stream("source").unwrap();
        archive.add_part(s0, 0, b"payload").unwrap();
        archive.link("alias", "source").unwrap();
        archive.finalize().unwrap();

        let archive = Archive::open(&path).unwrap();
        let alias = archive.stream_id("alias").unwrap();
        assert_eq!(archive.get_part(alias, 0).unwrap(), b"payload");
        let listing = archive.list_streams();
        assert_eq!(listing[1].1.as_deref(), Some("source"));
    }

    #[test]
    fn readback_before_finalize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tmp.vcfshark");
        let archive = Archive::create(&path).unwrap();
        let s0 = archive.register_stream("s").unwrap();
        archive.add_part(s0, 0, b"part-zero").unwrap();
        archive.add_part(s0, 1, b"part-one").unwrap();
        assert_eq!(archive.get_part(s0, 1).unwrap(), b"part-one");
        assert_eq!(archive.get_part(s0, 0).unwrap(), b"part-zero");
    }

    #[test]
    fn rejects_non_dense_part_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.vcfshark");
        let archive = Archive::create(&path).unwrap();
        let s0 = archive.register_stream("s").unwrap();
        archive.add_part(s0, 0, b"x").unwrap();
        archive.add_part(s0, 2, b"y").unwrap();
        archive.finalize().unwrap();
        assert!(Archive::open(&path).is_err());
    }

    #[test]
    fn rejects_corrupt_footer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.vcfshark");
        let archive = Archive::create(&path).unwrap();
        archive.register_stream("s").unwrap();
        archive.finalize().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(Archive::open(&path).is_err());
    }
}
