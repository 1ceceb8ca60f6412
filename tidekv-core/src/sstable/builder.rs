//! SSTable builder for writing sorted entries to disk
//!
//! The table is written to a `.tmp` file next to its final path and only
//! renamed into place by [`SSTableBuilder::finish`], after an fsync. A
//! builder dropped before `finish` removes its staged file.

use super::{
    seal_section, table_path, BlockBuilder, BloomFilter, Footer, SSTableConfig, SSTableMeta,
    SectionHandle, TableProperties, FORMAT_VERSION, MAGIC,
};
use crate::{Entry, Result, TideError, Value};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// SSTable builder
pub struct SSTableBuilder {
    config: SSTableConfig,
    path: PathBuf,
    tmp_path: PathBuf,
    id: u64,
    file: BufWriter<File>,
    offset: u64,
    finished: bool,

    // Current state
    block: BlockBuilder,
    block_last_key: Option<Bytes>,

    // Index data
    index_entries: Vec<IndexEntry>,
    keys: Vec<Bytes>,

    // Stats
    props: TableProperties,
    last_key: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub last_key: Bytes,
    pub offset: u64,
    pub len: u32,
}

impl SSTableBuilder {
    /// Create a new SSTable builder staging `path`
    pub fn new(path: PathBuf, id: u64, config: SSTableConfig) -> Result<Self> {
        let tmp_path = crate::io::tmp_path(&path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut builder = Self {
            block: BlockBuilder::new(config.block_size + config.block_size / 4),
            config,
            path,
            tmp_path,
            id,
            file: BufWriter::new(file),
            offset: 0,
            finished: false,
            block_last_key: None,
            index_entries: Vec::new(),
            keys: Vec::new(),
            props: TableProperties {
                min_seq: u64::MAX,
                ..TableProperties::default()
            },
            last_key: None,
        };
        builder.write_header()?;
        Ok(builder)
    }

    /// Create a builder for table `id` in `dir`
    pub fn in_dir(dir: &Path, id: u64, config: SSTableConfig) -> Result<Self> {
        Self::new(table_path(dir, id), id, config)
    }

    /// Add an entry. Keys must be strictly increasing.
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if entry.key <= *last {
                return Err(TideError::Internal(format!(
                    "SSTable {} keys out of order: {:?} after {:?}",
                    self.id, entry.key, last
                )));
            }
        }

        self.block.add(entry);
        self.block_last_key = Some(entry.key.clone());
        self.keys.push(entry.key.clone());

        // Update stats
        self.props.entry_count += 1;
        if entry.is_tombstone() {
            self.props.tombstone_count += 1;
        }
        match &entry.value {
            Value::Inline(v) => self.props.inline_value_bytes += v.len() as u64,
            Value::Pointer(_) => self.props.pointer_count += 1,
        }
        self.props.min_seq = self.props.min_seq.min(entry.seq);
        self.props.max_seq = self.props.max_seq.max(entry.seq);
        if self.last_key.is_none() {
            self.props.first_key = entry.key.to_vec();
        }
        self.last_key = Some(entry.key.clone());

        if self.block.size() >= self.config.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Number of entries added so far
    pub fn entry_count(&self) -> u64 {
        self.props.entry_count
    }

    /// Check if no entries have been added
    pub fn is_empty(&self) -> bool {
        self.props.entry_count == 0
    }

    /// Approximate size of the finished file
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.size() as u64
    }

    /// Table id
    pub fn id(&self) -> u64 {
        self.id
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let bytes = self.block.finish(self.config.compression);
        let last_key = self.block_last_key.take().unwrap_or_default();
        self.index_entries.push(IndexEntry {
            last_key,
            offset: self.offset,
            len: bytes.len() as u32,
        });
        self.write(&bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Finish building, fsync and publish under the final name
    pub fn finish(mut self) -> Result<SSTableMeta> {
        if self.is_empty() {
            return Err(TideError::Internal(format!("SSTable {} has no entries", self.id)));
        }
        self.flush_block()?;

        // Write index
        let index_block = Self::encode_index(&self.index_entries);
        let index = self.write_section(index_block)?;

        // Write bloom filter
        let mut bloom = BloomFilter::new(self.keys.len(), self.config.bloom_bits_per_key);
        for key in &self.keys {
            bloom.add(key);
        }
        let filter = self.write_section(bloom.encode())?;

        // Write properties
        self.props.block_count = self.index_entries.len() as u32;
        self.props.last_key = self.last_key.as_ref().map(|k| k.to_vec()).unwrap_or_default();
        let mut props = BytesMut::new();
        props.put_slice(&bincode::serialize(&self.props)?);
        let properties = self.write_section(props)?;

        // Write footer
        let footer = Footer {
            index,
            filter,
            properties,
        };
        self.write(&footer.encode())?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        crate::io::publish(&self.tmp_path, &self.path)?;
        self.finished = true;

        debug!(
            table_id = self.id,
            entries = self.props.entry_count,
            blocks = self.props.block_count,
            bytes = self.offset,
            "Wrote SSTable"
        );

        Ok(SSTableMeta::from_properties(
            self.path.clone(),
            self.id,
            self.offset,
            &self.props,
        ))
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(super::HEADER_SIZE);
        // Magic number
        buf.put_slice(MAGIC);
        // Version
        buf.put_u32_le(FORMAT_VERSION);
        self.write(&buf)
    }

    fn write_section(&mut self, payload: BytesMut) -> Result<SectionHandle> {
        let sealed = seal_section(payload);
        let handle = SectionHandle {
            offset: self.offset,
            len: sealed.len() as u32,
        };
        self.write(&sealed)?;
        Ok(handle)
    }

    fn encode_index(entries: &[IndexEntry]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(entries.len() as u32);
        for entry in entries {
            crate::codec::put_length_prefixed(&mut buf, &entry.last_key);
            buf.put_u64_le(entry.offset);
            buf.put_u32_le(entry.len);
        }
        buf
    }
}

impl Drop for SSTableBuilder {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(table_id = self.id, error = %e, "Failed to remove staged SSTable");
                }
            }
        }
    }
}
