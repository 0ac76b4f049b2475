//! Background GTID persister.
//!
//! Committed transactions queue their GTID onto one of two in-memory
//! lists; a background thread periodically (or on backpressure) swaps the
//! active list out, compresses it, and appends it to the on-disk log.
//! Callers that need a durability guarantee (e.g. before acknowledging a
//! commit back to the client) call [`GtidPersister::wait_flush`] with the
//! flush number [`GtidPersister::add_gtid`] handed back to them.

pub mod interval;

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use ck_api_types::{CloneError, GtidDescriptor, GtidInterval};
use ck_tools::task::WorkerTaskContext;
use ck_tools::wait::{wait, WaitOutcome};
use crossbeam_channel::{Receiver, Sender};

pub use interval::{merge_intervals, parse_text_gtid};

/// Queue a flush once this many GTIDs are buffered rather than waiting
/// for the next periodic tick.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024;

/// Background flush tick when nothing has crossed the threshold.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Run interval compaction (merge adjacent `(start, end]` ranges per
/// source UUID) after this many flushes, mirroring
/// `s_compression_threshold`.
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 64;

/// Normal `wait_flush` budget: generous, since a caller usually only
/// blocks the commit thread for a fraction of one flush cycle.
const WAIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// `RESET BINARY LOGS AND GTIDS` (`is_log_reset`) must not
/// honor any timeout at all -- it blocks until the background thread
/// genuinely catches up, however long that takes.
const WAIT_FLUSH_NO_EARLY_TIMEOUT: Duration = Duration::from_secs(u64::MAX / 2);

struct Inner {
    /// Two lists indexed by `active_index`; the background thread always
    /// drains the *other* one, so commits never block on I/O.
    lists: [Vec<GtidDescriptor>; 2],
    active_index: usize,
    /// Bumped every time a list is handed off to the flush thread.
    flush_number: u64,
    /// Highest flush_number fully written and fsynced.
    last_flushed: u64,
    /// Already-flushed GTIDs, so a list replayed after a crash does not
    /// write duplicates into the log.
    on_disk: HashSet<Vec<u8>>,
    /// The persisted `gtid_executed` table: one merged interval set per
    /// source UUID ("persisted state layout").
    executed: Vec<GtidInterval>,
    threshold: usize,
    /// Flushes since the last compression pass.
    flushes_since_compress: u64,
    compression_threshold: u64,
    compress_requested: bool,
}

pub struct GtidPersister {
    inner: Mutex<Inner>,
    condvar: Condvar,
    flush_tx: Sender<()>,
    flush_rx: Receiver<()>,
    shutdown: AtomicBool,
    /// Oldest transaction number still referenced by unflushed GTIDs, so
    /// `update_gtid_trx_no` can tell purge how far it may advance.
    oldest_trx_no: AtomicU64,
}

impl GtidPersister {
    pub fn new(threshold: usize) -> Arc<Self> {
        Self::with_compression_threshold(threshold, DEFAULT_COMPRESSION_THRESHOLD)
    }

    pub fn with_compression_threshold(threshold: usize, compression_threshold: u64) -> Arc<Self> {
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(1);
        Arc::new(GtidPersister {
            inner: Mutex::new(Inner {
                lists: [Vec::new(), Vec::new()],
                active_index: 0,
                flush_number: 0,
                last_flushed: 0,
                on_disk: HashSet::new(),
                executed: Vec::new(),
                threshold,
                flushes_since_compress: 0,
                compression_threshold,
                compress_requested: false,
            }),
            condvar: Condvar::new(),
            flush_tx,
            flush_rx,
            shutdown: AtomicBool::new(false),
            oldest_trx_no: AtomicU64::new(0),
        })
    }

    /// Queues `gtid` onto the active list. Returns the flush number the
    /// caller must see in [`GtidPersister::wait_flush`] before the GTID is
    /// guaranteed durable. Already-flushed GTIDs (by raw encoding) are
    /// silently deduplicated rather than re-queued.
    pub fn add_gtid(&self, gtid: GtidDescriptor) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.on_disk.contains(&gtid.info) {
            return inner.last_flushed;
        }
        inner.lists[inner.active_index].push(gtid);
        let should_flush_now = inner.lists[inner.active_index].len() >= inner.threshold;
        let target = inner.flush_number + 1;
        drop(inner);
        if should_flush_now {
            let _ = self.flush_tx.try_send(());
        }
        target
    }

    /// Forces a flush of whatever is currently buffered, without waiting
    /// for the threshold or the periodic tick. Returns the flush number
    /// to pass to [`GtidPersister::wait_flush`].
    pub fn request_immediate_flush(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let target = inner.flush_number + 1;
        drop(inner);
        let _ = self.flush_tx.try_send(());
        target
    }

    /// Requests that the *next* flush also run interval compaction,
    /// regardless of the periodic `compression_threshold` counter.
    pub fn request_compression(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.compress_requested = true;
        drop(inner);
        let _ = self.flush_tx.try_send(());
    }

    /// Blocks until `target` (a value returned by
    /// [`GtidPersister::add_gtid`] or
    /// [`GtidPersister::request_immediate_flush`]) has been durably
    /// written.
    ///
    /// `compress` mirrors `wait_flush(compress, early_timeout)`: it also
    /// requests a compression pass alongside the flush. `early_timeout`
    /// governs whether this call may give up after the normal wait
    /// budget; `RESET BINARY LOGS AND GTIDS` passes `false`
    /// and must block until the background thread genuinely catches up.
    pub fn wait_flush<C: WorkerTaskContext>(
        &self,
        target: u64,
        compress: bool,
        early_timeout: bool,
        task: &C,
    ) -> Result<()> {
        if compress {
            self.request_compression();
        }
        if target == 0 {
            return Ok(());
        }
        let budget = if early_timeout {
            WAIT_FLUSH_TIMEOUT
        } else {
            WAIT_FLUSH_NO_EARLY_TIMEOUT
        };
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        wait(
            guard,
            &self.inner,
            &self.condvar,
            Duration::from_millis(100),
            budget,
            Duration::from_secs(5),
            |inner: &mut Inner, alert| {
                if inner.last_flushed >= target {
                    return WaitOutcome::Done;
                }
                if alert {
                    if let Err(e) = task.check_abort() {
                        return WaitOutcome::Fail(e);
                    }
                }
                WaitOutcome::Continue
            },
        )?;
        Ok(())
    }

    pub fn last_flushed(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).last_flushed
    }

    /// Current merged `gtid_executed` set, for inspection/testing.
    pub fn executed_intervals(&self) -> Vec<GtidInterval> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).executed.clone()
    }

    pub fn oldest_trx_no(&self) -> u64 {
        self.oldest_trx_no.load(Ordering::Acquire)
    }

    /// Requests the background thread stop after its current flush.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.flush_tx.try_send(());
    }

    /// Swaps the active list out and returns it for the caller to write,
    /// along with the flush number it corresponds to. Returns `None` if
    /// there is nothing to flush. The returned batch is deduplicated by raw
    /// encoding, first occurrence wins, so a GTID queued twice before either
    /// flush still lands on disk exactly once.
    fn take_pending(&self) -> Option<(u64, Vec<GtidDescriptor>, bool)> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let draining_index = inner.active_index;
        if inner.lists[draining_index].is_empty() {
            return None;
        }
        inner.active_index = 1 - draining_index;
        let drained = std::mem::take(&mut inner.lists[draining_index]);
        let mut seen = HashSet::new();
        let pending: Vec<GtidDescriptor> = drained
            .into_iter()
            .filter(|g| seen.insert(g.info.clone()))
            .collect();
        inner.flush_number += 1;
        inner.flushes_since_compress += 1;
        let should_compress = std::mem::take(&mut inner.compress_requested)
            || inner.flushes_since_compress >= inner.compression_threshold;
        if should_compress {
            inner.flushes_since_compress = 0;
        }
        Some((inner.flush_number, pending, should_compress))
    }

    fn mark_flushed(&self, flush_number: u64, flushed: &[GtidDescriptor], compress: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for g in flushed {
            if !inner.on_disk.insert(g.info.clone()) {
                continue;
            }
            if let Ok(parsed) = interval::parse_text_gtid(&g.info) {
                inner.executed.push(parsed);
            }
        }
        if compress {
            inner.executed = interval::merge_intervals(std::mem::take(&mut inner.executed));
        }
        inner.last_flushed = flush_number;
        drop(inner);
        self.condvar.notify_all();
    }

    /// Lets the purge loop know which transactions' undo may now be
    /// reclaimed: every GTID committed at or before `trx_no` is durable
    /// once this returns.
    pub fn update_gtid_trx_no(&self, trx_no: u64) {
        self.oldest_trx_no.store(trx_no, Ordering::Release);
    }

    /// The background thread's body: wakes on a flush request or the
    /// periodic tick, drains whichever list isn't being appended to, and
    /// writes it zstd-compressed to `writer`. Intended to be driven from
    /// its own OS thread via `std::thread::spawn`. On startup this first
    /// drains anything left over from before a restart (recovery
    /// catch-up) before entering the normal wait loop.
    pub fn run_flush_loop<W: Write>(self: &Arc<Self>, mut writer: W) -> Result<()> {
        while let Some((flush_number, pending, compress)) = self.take_pending() {
            self.write_batch(&mut writer, &pending)
                .context("writing GTID recovery catch-up batch")?;
            self.mark_flushed(flush_number, &pending, compress);
        }

        loop {
            let _ = self.flush_rx.recv_timeout(DEFAULT_FLUSH_INTERVAL);

            while let Some((flush_number, pending, compress)) = self.take_pending() {
                self.write_batch(&mut writer, &pending)
                    .context("writing GTID flush batch")?;
                self.mark_flushed(flush_number, &pending, compress);
            }

            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    fn write_batch<W: Write>(&self, writer: &mut W, batch: &[GtidDescriptor]) -> Result<()> {
        let mut plain = Vec::new();
        for g in batch {
            plain.extend_from_slice(&(g.info.len() as u32).to_be_bytes());
            plain.extend_from_slice(&g.info);
        }
        let compressed = zstd::stream::encode_all(plain.as_slice(), 3)
            .context("compressing GTID flush batch")?;
        writer.write_all(&(compressed.len() as u32).to_be_bytes())?;
        writer.write_all(&compressed)?;
        writer.flush()?;
        Ok(())
    }
}

/// Converts a [`CloneError::Timeout`] from `wait_flush` into whatever the
/// caller's retry policy needs; exposed so embedding code doesn't need to
/// reach into `ck_api_types` just to match on this one case.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<CloneError>(), Some(CloneError::Timeout(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_tools::task::LoggingContext;

    #[test]
    fn add_gtid_below_threshold_does_not_flush_immediately() {
        let persister = GtidPersister::new(100);
        persister.add_gtid(GtidDescriptor::text("uuid:1-1"));
        assert_eq!(persister.take_pending().is_some(), true);
    }

    #[test]
    fn flush_loop_writes_batches_and_updates_last_flushed() {
        let persister = GtidPersister::new(1);
        let target = persister.add_gtid(GtidDescriptor::text("uuid:1-5"));

        let mut buf = Vec::new();
        persister.request_shutdown();
        persister.run_flush_loop(&mut buf).unwrap();

        assert!(!buf.is_empty());
        assert_eq!(persister.last_flushed(), target);
    }

    #[test]
    fn wait_flush_returns_immediately_once_target_reached() {
        let persister = GtidPersister::new(1);
        let target = persister.add_gtid(GtidDescriptor::text("uuid:1-1"));
        let mut buf = Vec::new();
        persister.request_shutdown();
        persister.run_flush_loop(&mut buf).unwrap();
        persister.wait_flush(target, false, true, &LoggingContext).unwrap();
    }

    #[test]
    fn duplicate_gtid_after_flush_is_deduplicated() {
        let persister = GtidPersister::new(1);
        persister.add_gtid(GtidDescriptor::text("uuid:1-1"));
        let mut buf = Vec::new();
        persister.request_shutdown();
        persister.run_flush_loop(&mut buf).unwrap();

        let before = persister.last_flushed();
        let target = persister.add_gtid(GtidDescriptor::text("uuid:1-1"));
        assert_eq!(target, before);
    }

    #[test]
    fn duplicate_queued_twice_before_any_flush_is_deduplicated() {
        let persister = GtidPersister::with_compression_threshold(1, 1000);
        persister.add_gtid(GtidDescriptor::text("uuid:1-1"));
        persister.add_gtid(GtidDescriptor::text("uuid:2-2"));
        persister.add_gtid(GtidDescriptor::text("uuid:1-1"));

        let mut buf = Vec::new();
        persister.request_shutdown();
        persister.run_flush_loop(&mut buf).unwrap();

        let executed = persister.executed_intervals();
        assert_eq!(executed.len(), 2);
    }

    #[test]
    fn compression_merges_adjacent_intervals_in_gtid_executed() {
        let persister = GtidPersister::new(1);
        persister.add_gtid(GtidDescriptor::text("uuid:1-5"));
        persister.add_gtid(GtidDescriptor::text("uuid:6-9"));
        persister.request_compression();

        let mut buf = Vec::new();
        persister.request_shutdown();
        persister.run_flush_loop(&mut buf).unwrap();

        let executed = persister.executed_intervals();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].interval_start, 1);
        assert_eq!(executed[0].interval_end, 9);
    }

    #[test]
    fn wait_flush_with_early_timeout_false_still_returns_once_satisfied() {
        // S4: RESET BINARY LOGS AND GTIDS calls wait_flush(false, false) and
        // must not give up early; it still returns once the background
        // thread has actually advanced last_flushed past the target.
        let persister = GtidPersister::new(1);
        let target = persister.add_gtid(GtidDescriptor::text("uuid:10-20"));
        let mut buf = Vec::new();
        persister.request_shutdown();
        persister.run_flush_loop(&mut buf).unwrap();
        persister
            .wait_flush(target, false, false, &LoggingContext)
            .unwrap();
    }
}
