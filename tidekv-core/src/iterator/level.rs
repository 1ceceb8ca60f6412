//! Concatenating iterator over the disjoint tables of one level

use super::EntryIterator;
use crate::sstable::{SSTableReader, TableIterator};
use crate::{Entry, Result};
use std::sync::Arc;

/// Walks the tables of a level (L1 and deeper) in key order, opening each
/// table only when the cursor reaches it.
pub struct LevelIterator {
    tables: Vec<Arc<SSTableReader>>,
    index: usize,
    current: Option<TableIterator>,
}

impl LevelIterator {
    /// Create over tables sorted by key with non-overlapping ranges
    pub fn new(tables: Vec<Arc<SSTableReader>>) -> Result<Self> {
        let mut iter = Self {
            tables,
            index: 0,
            current: None,
        };
        iter.open_from(0)?;
        Ok(iter)
    }

    /// Position at the first entry of table `index` or the next non-empty one
    fn open_from(&mut self, mut index: usize) -> Result<()> {
        self.current = None;
        while index < self.tables.len() {
            let iter = self.tables[index].iter()?;
            if iter.valid() {
                self.index = index;
                self.current = Some(iter);
                return Ok(());
            }
            index += 1;
        }
        self.index = self.tables.len();
        Ok(())
    }
}

impl EntryIterator for LevelIterator {
    fn current(&self) -> Option<&Entry> {
        self.current.as_ref().and_then(|it| it.current())
    }

    fn next(&mut self) -> Result<()> {
        let Some(iter) = self.current.as_mut() else {
            return Ok(());
        };
        iter.next()?;
        if !iter.valid() {
            self.open_from(self.index + 1)?;
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let index = self
            .tables
            .partition_point(|t| t.meta().last_key.as_ref() < key);
        if index >= self.tables.len() {
            self.current = None;
            self.index = index;
            return Ok(());
        }

        let mut iter = self.tables[index].iter()?;
        iter.seek(key)?;
        if iter.valid() {
            self.index = index;
            self.current = Some(iter);
            Ok(())
        } else {
            self.open_from(index + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::collect_entries;
    use crate::sstable::{SSTableBuilder, SSTableConfig};
    use tempfile::TempDir;

    fn build(dir: &TempDir, id: u64, keys: &[&str]) -> Arc<SSTableReader> {
        let path = dir.path().join(format!("{:020}.sst", id));
        let mut builder = SSTableBuilder::new(path.clone(), id, SSTableConfig::default()).unwrap();
        for (i, key) in keys.iter().enumerate() {
            builder.add(&Entry::put(key.to_string(), "v", i as u64 + 1)).unwrap();
        }
        builder.finish().unwrap();
        Arc::new(SSTableReader::open(path, id).unwrap())
    }

    #[test]
    fn test_level_concatenation() {
        let dir = TempDir::new().unwrap();
        let tables = vec![
            build(&dir, 1, &["a", "b"]),
            build(&dir, 2, &["d", "e"]),
            build(&dir, 3, &["x"]),
        ];

        let mut iter = LevelIterator::new(tables).unwrap();
        let keys: Vec<_> = collect_entries(&mut iter)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "d", "e", "x"]);
    }

    #[test]
    fn test_level_seek_between_tables() {
        let dir = TempDir::new().unwrap();
        let tables = vec![build(&dir, 1, &["a", "b"]), build(&dir, 2, &["d", "e"])];

        let mut iter = LevelIterator::new(tables).unwrap();
        iter.seek(b"c").unwrap();
        assert_eq!(iter.current().unwrap().key, "d");
        iter.seek(b"b").unwrap();
        assert_eq!(iter.current().unwrap().key, "b");
        iter.next().unwrap();
        assert_eq!(iter.current().unwrap().key, "d");
        iter.seek(b"f").unwrap();
        assert!(!iter.valid());
    }
}
