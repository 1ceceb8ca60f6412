//! File helpers: positioned reads and staged (tmp + rename) writes

use crate::Result;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Suffix for files that are written but not yet linked into the engine
pub const TMP_SUFFIX: &str = "tmp";

/// Read exactly `buf.len()` bytes at `offset` without moving a shared cursor
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// Read exactly `buf.len()` bytes at `offset` without moving a shared cursor
#[cfg(windows)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        done += n;
    }
    Ok(())
}

/// Path used while a file is being staged
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Check if a path is a staged temporary file
pub fn is_tmp(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(TMP_SUFFIX)
}

/// Fsync a directory so renames and unlinks inside it are durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Atomically publish a staged file under its final name
pub fn publish(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Remove staged files left behind by an interrupted operation
pub fn remove_tmp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    if !dir.exists() {
        return Ok(removed);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_tmp(&path) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
