//! Crash-safe marker file for an in-progress undo tablespace truncation
//!: `undo_<num>_trunc.log`, a fixed 16 KiB file
//! that is zeroed while truncation is in progress and has
//! [`UNDO_TRUNCATE_LOG_MAGIC`] written at its tail once truncation has
//! fully completed. Recovery treats a present log file without the magic
//! as an interrupted truncation that must be redone from scratch.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ck_api_types::undo::UNDO_TRUNCATE_LOG_MAGIC;

pub const TRUNCATE_LOG_SIZE: u64 = 16 * 1024;

fn log_path(dir: &Path, undo_num: u32) -> PathBuf {
    dir.join(format!("undo_{:03}_trunc.log", undo_num))
}

/// Handle over one undo tablespace's truncate log, held for the duration
/// of [`crate::truncate::truncate_marked_undo`].
pub struct TruncateLog {
    path: PathBuf,
    file: File,
}

impl TruncateLog {
    /// Creates (or truncates) the log file, zero-fills it to
    /// [`TRUNCATE_LOG_SIZE`], and fsyncs it before returning -- truncation
    /// of the undo tablespace itself must not begin until this has
    /// returned `Ok`.
    pub fn create(dir: &Path, undo_num: u32) -> Result<Self> {
        let path = log_path(dir, undo_num);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("creating truncate log {:?}", path))?;
        let zeros = vec![0u8; TRUNCATE_LOG_SIZE as usize];
        file.write_all(&zeros)?;
        file.sync_all()?;
        Ok(TruncateLog { path, file })
    }

    /// Writes [`UNDO_TRUNCATE_LOG_MAGIC`] at the log's tail, marking the
    /// truncation as complete, and fsyncs.
    pub fn mark_complete(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(TRUNCATE_LOG_SIZE - 4))?;
        self.file.write_all(&UNDO_TRUNCATE_LOG_MAGIC.to_be_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Removes the log file. Called once the truncated tablespace itself
    /// has been fsynced under its new space id, so the log's disappearance
    /// can never be observed without the truncation it guards also having
    /// landed.
    pub fn unlink(self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("truncate log path {:?} has no parent", self.path))?;
        std::fs::remove_file(&self.path)
            .with_context(|| format!("removing truncate log {:?}", self.path))?;
        // fsync the directory so the unlink itself survives a crash; a
        // truncate log that silently reappeared after "removal" would be
        // indistinguishable from an interrupted truncation.
        let dir_handle = File::open(dir).with_context(|| format!("opening directory {:?}", dir))?;
        nix::unistd::fsync(dir_handle.as_raw_fd())
            .map_err(|err| anyhow::anyhow!("fsync of {:?} failed: {}", dir, err))?;
        Ok(())
    }
}

/// Whether `undo_<num>_trunc.log` exists, and if so, whether it already
/// carries the completion magic. `(false, _)` means no truncation was in
/// flight. `(true, false)` means recovery must redo the truncation from
/// scratch; `(true, true)` means only the unlink step was missed.
pub fn inspect_truncate_log(dir: &Path, undo_num: u32) -> Result<(bool, bool)> {
    let path = log_path(dir, undo_num);
    if !path.exists() {
        return Ok((false, false));
    }
    let mut file = File::open(&path).with_context(|| format!("opening truncate log {:?}", path))?;
    if file.metadata()?.len() < TRUNCATE_LOG_SIZE {
        // Truncated mid-creation: treat as incomplete, same as no magic.
        return Ok((true, false));
    }
    file.seek(SeekFrom::Start(TRUNCATE_LOG_SIZE - 4))?;
    let mut tail = [0u8; 4];
    std::io::Read::read_exact(&mut file, &mut tail)?;
    let complete = u32::from_be_bytes(tail) == UNDO_TRUNCATE_LOG_MAGIC;
    Ok((true, complete))
}

pub fn is_active_truncate_log_present(dir: &Path, undo_num: u32) -> Result<bool> {
    let (present, complete) = inspect_truncate_log(dir, undo_num)?;
    Ok(present && !complete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_log_is_present_but_not_complete() {
        let dir = tempfile::tempdir().unwrap();
        TruncateLog::create(dir.path(), 3).unwrap();
        assert!(is_active_truncate_log_present(dir.path(), 3).unwrap());
    }

    #[test]
    fn mark_complete_then_unlink_clears_active_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TruncateLog::create(dir.path(), 1).unwrap();
        log.mark_complete().unwrap();
        let (present, complete) = inspect_truncate_log(dir.path(), 1).unwrap();
        assert!(present);
        assert!(complete);
        log.unlink().unwrap();
        assert!(!is_active_truncate_log_present(dir.path(), 1).unwrap());
    }

    #[test]
    fn no_log_file_means_no_active_truncate() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_active_truncate_log_present(dir.path(), 5).unwrap());
    }
}
