//! SSTable reader for point lookups and ordered scans

use super::builder::IndexEntry;
use super::{
    open_section, BloomFilter, DataBlock, Footer, SSTableMeta, SectionHandle, TableProperties,
    FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC,
};
use crate::codec::get_length_prefixed;
use crate::iterator::EntryIterator;
use crate::{Entry, Result, TideError};
use bytes::{Buf, Bytes};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// SSTable reader
///
/// Shared through `Arc` by every version that lists the table. Once
/// compaction supersedes it the table is marked obsolete and the file is
/// removed when the last reference drops.
pub struct SSTableReader {
    file: File,
    meta: SSTableMeta,
    index: Vec<IndexEntry>,
    bloom_filter: BloomFilter,
    properties: TableProperties,
    obsolete: AtomicBool,
}

impl SSTableReader {
    /// Open an SSTable file
    pub fn open(path: PathBuf, id: u64) -> Result<Self> {
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(TideError::InvalidFormat(format!(
                "SSTable {} too small ({} bytes)",
                id, file_size
            )));
        }

        // Read header
        let mut header = [0u8; HEADER_SIZE];
        crate::io::read_exact_at(&file, &mut header, 0)?;
        if &header[..4] != MAGIC {
            return Err(TideError::InvalidFormat("Invalid SSTable header".into()));
        }
        let version = (&header[4..]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TideError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        // Read footer
        let mut footer = [0u8; FOOTER_SIZE];
        crate::io::read_exact_at(&file, &mut footer, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer)?;

        let index = Self::parse_index(Self::read_section(&file, footer.index, file_size, "index")?)?;
        let bloom_filter =
            BloomFilter::decode(Self::read_section(&file, footer.filter, file_size, "filter")?)?;
        let props_data = Self::read_section(&file, footer.properties, file_size, "properties")?;
        let properties: TableProperties = bincode::deserialize(&props_data)?;

        if index.len() != properties.block_count as usize {
            return Err(TideError::Corruption(format!(
                "SSTable {} index lists {} blocks, properties say {}",
                id,
                index.len(),
                properties.block_count
            )));
        }

        let meta = SSTableMeta::from_properties(path, id, file_size, &properties);
        debug!(table_id = id, entries = meta.entry_count, "Opened SSTable");

        Ok(Self {
            file,
            meta,
            index,
            bloom_filter,
            properties,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Get SSTable metadata
    pub fn meta(&self) -> &SSTableMeta {
        &self.meta
    }

    /// Table id
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.meta.path
    }

    /// Contents of the properties block
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// Check if the table may contain `key` (range and bloom filter check)
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.meta.may_contain_key(key) && self.bloom_filter.may_contain(key)
    }

    /// Point lookup. Returns the table's only version of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        let block_idx = self.block_for(key);
        if block_idx >= self.index.len() {
            return Ok(None);
        }
        let block = self.read_block(block_idx)?;
        Ok(block.get(key).cloned())
    }

    /// Cursor over every entry in key order
    pub fn iter(self: &Arc<Self>) -> Result<TableIterator> {
        TableIterator::new(self.clone())
    }

    /// Schedule the file for deletion once no version references it
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Check if the table has been superseded
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Number of data blocks
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Index of the first block whose last key is `>= key`
    fn block_for(&self, key: &[u8]) -> usize {
        self.index.partition_point(|e| e.last_key.as_ref() < key)
    }

    fn read_block(&self, block_idx: usize) -> Result<DataBlock> {
        let entry = &self.index[block_idx];
        let mut data = vec![0u8; entry.len as usize];
        crate::io::read_exact_at(&self.file, &mut data, entry.offset)?;
        DataBlock::from_bytes(Bytes::from(data)).map_err(|e| match e {
            TideError::ChecksumMismatch { .. } | TideError::Corruption(_) => TideError::Corruption(
                format!("SSTable {} block {}: {}", self.meta.id, block_idx, e),
            ),
            other => other,
        })
    }

    fn read_section(file: &File, handle: SectionHandle, file_size: u64, what: &str) -> Result<Bytes> {
        if handle.offset + handle.len as u64 > file_size {
            return Err(TideError::Corruption(format!(
                "SSTable {} section out of bounds",
                what
            )));
        }
        let mut data = vec![0u8; handle.len as usize];
        crate::io::read_exact_at(file, &mut data, handle.offset)?;
        open_section(Bytes::from(data), what)
    }

    fn parse_index(mut data: Bytes) -> Result<Vec<IndexEntry>> {
        crate::codec::ensure_remaining(&data, 4, "index block")?;
        let count = data.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(count.min(1 << 16));

        for _ in 0..count {
            let last_key = get_length_prefixed(&mut data, "index key")?;
            crate::codec::ensure_remaining(&data, 12, "index entry")?;
            let offset = data.get_u64_le();
            let len = data.get_u32_le();
            entries.push(IndexEntry {
                last_key,
                offset,
                len,
            });
        }

        Ok(entries)
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        if self.is_obsolete() {
            match fs::remove_file(&self.meta.path) {
                Ok(()) => debug!(table_id = self.meta.id, "Deleted obsolete SSTable"),
                Err(e) => warn!(table_id = self.meta.id, error = %e, "Failed to delete SSTable"),
            }
        }
    }
}

/// Ordered cursor over one table, loading one block at a time
pub struct TableIterator {
    table: Arc<SSTableReader>,
    block_idx: usize,
    entries: Vec<Entry>,
    pos: usize,
}

impl TableIterator {
    fn new(table: Arc<SSTableReader>) -> Result<Self> {
        let mut iter = Self {
            table,
            block_idx: 0,
            entries: Vec::new(),
            pos: 0,
        };
        iter.load_block(0)?;
        Ok(iter)
    }

    fn load_block(&mut self, block_idx: usize) -> Result<()> {
        self.block_idx = block_idx;
        self.pos = 0;
        self.entries = if block_idx < self.table.index.len() {
            self.table.read_block(block_idx)?.into_entries()
        } else {
            Vec::new()
        };
        Ok(())
    }

    /// Table being iterated
    pub fn table(&self) -> &Arc<SSTableReader> {
        &self.table
    }
}

impl EntryIterator for TableIterator {
    fn current(&self) -> Option<&Entry> {
        self.entries.get(self.pos)
    }

    fn next(&mut self) -> Result<()> {
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
        while self.pos >= self.entries.len() && self.block_idx < self.table.index.len() {
            self.load_block(self.block_idx + 1)?;
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let block_idx = self.table.block_for(key);
        self.load_block(block_idx)?;
        self.pos = self.entries.partition_point(|e| e.key.as_ref() < key);
        if self.pos >= self.entries.len() && block_idx < self.table.index.len() {
            self.load_block(block_idx + 1)?;
        }
        Ok(())
    }
}
