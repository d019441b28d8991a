use anyhow::{Result, bail};
use memmap::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use zstd::{Encoder, stream::read::Decoder};

// trace file layout: zstd stream of u32 entries, then a serde_json metadata
// tail, then two little-endian u64 words: metadata byte length, entry count

/// Threads per trace file. The engine itself has no cap; this bounds the
/// entry encoding only.
pub const TRACE_MAX_THREADS: u32 = 64;

const INDEX_MASK: u32 = (1 << 25) - 1;
const PARALLEL_BIT: u32 = 1 << 25;
const THREAD_SHIFT: u32 = 26;

/// One recorded event, packed into 32 bits: thread index in the top six
/// bits, one kind bit, region or barrier table index in the low 25.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry(pub u32);

impl TraceEntry {
    pub fn region(index: u32, thread: u32) -> Self {
        assert!(index <= INDEX_MASK);
        assert!(thread < TRACE_MAX_THREADS);
        Self(index | (thread << THREAD_SHIFT))
    }

    pub fn parallel(index: u32, thread: u32) -> Self {
        assert!(index <= INDEX_MASK);
        assert!(thread < TRACE_MAX_THREADS);
        Self(index | PARALLEL_BIT | (thread << THREAD_SHIFT))
    }

    pub fn index(&self) -> u32 {
        self.0 & INDEX_MASK
    }

    pub fn thread(&self) -> u32 {
        self.0 >> THREAD_SHIFT
    }

    pub fn is_parallel_entry(&self) -> bool {
        self.0 & PARALLEL_BIT != 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionRecord {
    pub start: u64,
    pub end: u64,
    pub size_bytes: u64,
    pub inst_count: u32,
    pub module: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleRecord {
    pub id: u32,
    pub name: String,
    pub base: u64,
    /// Externally visible routines, for barrier recognition on replay.
    pub routines: Vec<(String, u64)>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceMeta {
    pub command_line: String,
    pub regions: Vec<RegionRecord>,
    pub modules: Vec<ModuleRecord>,
    /// Addresses referenced by parallel-entry events.
    pub barriers: Vec<u64>,
}

const BUFFER_SIZE: usize = 16384;

/// Streams events into a compressed trace file.
pub struct TraceWriter {
    encoder: Encoder<'static, BufWriter<File>>,
    meta: TraceMeta,
    region_index: HashMap<(u64, u64), u32>,
    barrier_index: HashMap<u64, u32>,
    num_entries: u64,
    buffer: [TraceEntry; BUFFER_SIZE],
    buffer_size: usize,
}

impl TraceWriter {
    pub fn create<P: AsRef<Path>>(path: P, command_line: &str) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            encoder: Encoder::new(BufWriter::new(file), 0)?,
            meta: TraceMeta {
                command_line: command_line.to_string(),
                ..TraceMeta::default()
            },
            region_index: HashMap::new(),
            barrier_index: HashMap::new(),
            num_entries: 0,
            buffer: [TraceEntry::default(); BUFFER_SIZE],
            buffer_size: 0,
        })
    }

    /// Returns the region's table index for later entries.
    pub fn record_region(
        &mut self,
        start: u64,
        end: u64,
        size_bytes: u64,
        inst_count: u32,
        module: u32,
    ) -> u32 {
        match self.region_index.get(&(start, end)) {
            Some(index) => *index,
            None => {
                let index = self.meta.regions.len() as u32;
                // max regions per trace
                assert!(index <= INDEX_MASK);
                self.meta.regions.push(RegionRecord {
                    start,
                    end,
                    size_bytes,
                    inst_count,
                    module,
                });
                self.region_index.insert((start, end), index);
                index
            }
        }
    }

    pub fn record_module(&mut self, id: u32, name: &str, base: u64, routines: &[(String, u64)]) {
        self.meta.modules.push(ModuleRecord {
            id,
            name: name.to_string(),
            base,
            routines: routines.to_vec(),
        });
    }

    /// Returns the barrier address table index for later entries.
    pub fn record_barrier(&mut self, addr: u64) -> u32 {
        match self.barrier_index.get(&addr) {
            Some(index) => *index,
            None => {
                let index = self.meta.barriers.len() as u32;
                assert!(index <= INDEX_MASK);
                self.meta.barriers.push(addr);
                self.barrier_index.insert(addr, index);
                index
            }
        }
    }

    pub fn region_entry(&mut self, region: u32, thread: u32) -> Result<()> {
        assert!(
            (region as usize) < self.meta.regions.len(),
            "region index {region} not recorded"
        );
        self.push(TraceEntry::region(region, thread))
    }

    pub fn parallel_entry(&mut self, barrier: u32, thread: u32) -> Result<()> {
        assert!(
            (barrier as usize) < self.meta.barriers.len(),
            "barrier index {barrier} not recorded"
        );
        self.push(TraceEntry::parallel(barrier, thread))
    }

    fn push(&mut self, entry: TraceEntry) -> Result<()> {
        self.buffer[self.buffer_size] = entry;
        self.buffer_size += 1;
        if self.buffer_size == BUFFER_SIZE {
            self.flush_buffer()?;
        }
        self.num_entries += 1;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        self.encoder.write_all(unsafe {
            std::slice::from_raw_parts(
                self.buffer.as_ptr() as *const u8,
                std::mem::size_of::<TraceEntry>() * self.buffer_size,
            )
        })?;
        self.buffer_size = 0;
        Ok(())
    }

    /// Finish the stream and append the metadata tail. Returns the entry
    /// count.
    pub fn finish(mut self) -> Result<u64> {
        if self.buffer_size > 0 {
            self.flush_buffer()?;
        }
        let mut writer = self.encoder.finish()?;
        let meta = serde_json::to_vec(&self.meta)?;
        writer.write_all(&meta)?;
        writer.write_all(&(meta.len() as u64).to_le_bytes())?;
        writer.write_all(&self.num_entries.to_le_bytes())?;
        writer.flush()?;
        Ok(self.num_entries)
    }
}

/// Memory-maps a trace file and decodes its entry stream.
pub struct TraceReader {
    mmap: Mmap,
    meta: TraceMeta,
    num_entries: u64,
    // compressed entry stream length, from the front of the file
    entries_len: usize,
}

impl TraceReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < 16 {
            bail!("trace file too short: {} bytes", mmap.len());
        }
        let mut tmp_u64 = [0u8; 8];
        tmp_u64.copy_from_slice(&mmap[mmap.len() - 16..mmap.len() - 8]);
        let meta_len = u64::from_le_bytes(tmp_u64) as usize;
        tmp_u64.copy_from_slice(&mmap[mmap.len() - 8..]);
        let num_entries = u64::from_le_bytes(tmp_u64);
        // mmap.len() >= 16 per the guard above; a corrupt length must not
        // overflow this check
        if meta_len > mmap.len() - 16 {
            bail!("trace metadata length {meta_len} exceeds file size");
        }
        let entries_len = mmap.len() - 16 - meta_len;
        let meta: TraceMeta = serde_json::from_slice(&mmap[entries_len..mmap.len() - 16])?;
        Ok(Self {
            mmap,
            meta,
            num_entries,
            entries_len,
        })
    }

    pub fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Compressed entry stream size in bytes.
    pub fn compressed_len(&self) -> usize {
        self.entries_len
    }

    pub fn file_len(&self) -> usize {
        self.mmap.len()
    }

    pub fn entries(&self) -> Result<TraceEntryIter<'_>> {
        let cursor = Cursor::new(&self.mmap[..self.entries_len]);
        Ok(TraceEntryIter {
            decoder: Decoder::new(cursor)?,
            buf: [TraceEntry::default(); CHUNK_ENTRIES],
        })
    }
}

const CHUNK_ENTRIES: usize = 64 * 1024;

/// Chunked streaming decoder over the entry stream.
pub struct TraceEntryIter<'a> {
    decoder: Decoder<'a, BufReader<Cursor<&'a [u8]>>>,
    buf: [TraceEntry; CHUNK_ENTRIES],
}

impl TraceEntryIter<'_> {
    /// Decode the next chunk of entries, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<&[TraceEntry]>> {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                self.buf.as_mut_ptr() as *mut u8,
                CHUNK_ENTRIES * std::mem::size_of::<TraceEntry>(),
            )
        };
        let mut filled = 0;
        while filled < bytes.len() {
            let size = self.decoder.read(&mut bytes[filled..])?;
            if size == 0 {
                break;
            }
            filled += size;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled % std::mem::size_of::<TraceEntry>() != 0 {
            bail!("truncated trace entry stream");
        }
        Ok(Some(&self.buf[..filled / std::mem::size_of::<TraceEntry>()]))
    }
}

#[cfg(test)]
mod tests {
    use crate::trace::{TraceEntry, TraceReader, TraceWriter};

    #[test]
    fn entry_packing() {
        let entry = TraceEntry::region(12345, 63);
        assert_eq!(entry.index(), 12345);
        assert_eq!(entry.thread(), 63);
        assert!(!entry.is_parallel_entry());
        let entry = TraceEntry::parallel(7, 2);
        assert_eq!(entry.index(), 7);
        assert_eq!(entry.thread(), 2);
        assert!(entry.is_parallel_entry());
    }

    #[test]
    fn round_trip_preserves_events_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.trace");

        let mut writer = TraceWriter::create(&path, "./omp_app 8").unwrap();
        writer.record_module(1, "omp_app", 0x400000, &[("GOMP_parallel".to_string(), 0x401000)]);
        let a = writer.record_region(0x401100, 0x401110, 0x14, 5, 1);
        let b = writer.record_region(0x401200, 0x401208, 0xc, 3, 1);
        assert_eq!(writer.record_region(0x401100, 0x401110, 0x14, 5, 1), a);
        let barrier = writer.record_barrier(0x401000);

        let mut expected = vec![];
        for i in 0..40000u32 {
            let thread = i % 4;
            if i % 1000 == 999 {
                writer.parallel_entry(barrier, thread).unwrap();
                expected.push(TraceEntry::parallel(barrier, thread));
            } else {
                let region = if i % 3 == 0 { a } else { b };
                writer.region_entry(region, thread).unwrap();
                expected.push(TraceEntry::region(region, thread));
            }
        }
        let written = writer.finish().unwrap();
        assert_eq!(written, 40000);

        let reader = TraceReader::open(&path).unwrap();
        assert_eq!(reader.num_entries(), 40000);
        assert_eq!(reader.meta().command_line, "./omp_app 8");
        assert_eq!(reader.meta().regions.len(), 2);
        assert_eq!(reader.meta().modules.len(), 1);
        assert_eq!(reader.meta().barriers, vec![0x401000]);
        assert!(reader.compressed_len() > 0);

        let mut decoded = vec![];
        let mut iter = reader.entries().unwrap();
        while let Some(chunk) = iter.next_chunk().unwrap() {
            decoded.extend_from_slice(chunk);
        }
        assert_eq!(decoded, expected);
    }

    #[test]
    fn open_rejects_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.trace");
        std::fs::write(&path, b"tiny").unwrap();
        assert!(TraceReader::open(&path).is_err());
    }

    #[test]
    fn open_rejects_oversized_metadata_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.trace");
        let mut writer = TraceWriter::create(&path, "x").unwrap();
        let region = writer.record_region(0x1000, 0x1010, 0x14, 5, 0);
        writer.region_entry(region, 0).unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 16..len - 8].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(TraceReader::open(&path).is_err());
    }

    #[test]
    #[should_panic(expected = "region index 99 not recorded")]
    fn entry_against_missing_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.trace");
        let mut writer = TraceWriter::create(&path, "").unwrap();
        writer.record_region(0x1000, 0x1010, 0x14, 5, 0);
        writer.region_entry(99, 0).unwrap();
    }

    #[test]
    #[should_panic(expected = "barrier index 0 not recorded")]
    fn entry_against_missing_barrier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.trace");
        let mut writer = TraceWriter::create(&path, "").unwrap();
        writer.parallel_entry(0, 0).unwrap();
    }
}
