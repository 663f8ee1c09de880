//! The durable, totally ordered log.

use crate::error::{CoreError, CoreResult};
use crate::log::reader::LogReader;
use crate::log::record::{LogEntry, LogRecord, LogWrite};
use crate::log::scanner::{read_envelope_at, LogScanner};
use crate::types::{CommitSeq, ReplicaId, Term, TransactionId};
use parking_lot::{Mutex, RwLock};
use quorumdb_storage::{StorageBackend, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Durable election state, persisted before it is acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElectionState {
    /// Highest term this replica has entered.
    pub term: Term,
    /// Candidate this replica voted for in `term`.
    pub voted_for: Option<ReplicaId>,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    term: Term,
    offset: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct LogIndex {
    /// `records[i]` locates sequence `i + 1`.
    records: Vec<IndexEntry>,
    durable_commit: CommitSeq,
    election: ElectionState,
}

impl LogIndex {
    fn last_seq(&self) -> CommitSeq {
        CommitSeq::new(self.records.len() as u64)
    }

    fn get(&self, seq: CommitSeq) -> Option<IndexEntry> {
        let pos = usize::try_from(seq.as_u64()).ok()?.checked_sub(1)?;
        self.records.get(pos).copied()
    }
}

/// Append-only log of sequenced records plus commit and vote markers.
///
/// Writers serialize on the backend lock. Readers locate records through an
/// in-memory index and never hold a lock between items, so a slow reader does
/// not stall commits.
pub struct Log {
    backend: Mutex<Box<dyn StorageBackend>>,
    index: RwLock<LogIndex>,
    sync_on_append: bool,
    /// Set when a truncation could neither finish nor be undone.
    fenced: AtomicBool,
}

impl Log {
    /// Opens a log, rebuilding the index from the stored envelopes.
    ///
    /// A torn trailing envelope is cut off. Corruption anywhere else fails
    /// the open.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` or `ChecksumMismatch` for damaged logs and
    /// storage errors if the backend cannot be read.
    pub fn open(mut backend: Box<dyn StorageBackend>, sync_on_append: bool) -> CoreResult<Self> {
        let mut index = LogIndex::default();
        let (valid_end, torn) = {
            let mut scanner = LogScanner::new(backend.as_ref(), 0)?;
            for scanned in scanner.by_ref() {
                let scanned = scanned?;
                let (offset, len) = (scanned.offset, scanned.len);
                match scanned.entry {
                    LogEntry::Record(record) => {
                        if record.sequence != index.last_seq().next() {
                            return Err(CoreError::log_corruption(format!(
                                "expected {} at offset {offset}, found {}",
                                index.last_seq().next(),
                                record.sequence
                            )));
                        }
                        index.records.push(IndexEntry {
                            term: record.term,
                            offset,
                            len,
                        });
                    }
                    LogEntry::Commit { sequence } => {
                        index.durable_commit = index.durable_commit.max(sequence);
                    }
                    LogEntry::Vote { term, voted_for } => {
                        index.election = ElectionState { term, voted_for };
                    }
                }
            }
            (scanner.valid_end(), scanner.has_torn_tail())
        };

        if index.durable_commit > index.last_seq() {
            return Err(CoreError::log_corruption(format!(
                "commit marker {} beyond last record {}",
                index.durable_commit,
                index.last_seq()
            )));
        }

        if torn {
            warn!(valid_end, "discarding torn log tail");
            backend.truncate(valid_end)?;
            backend.sync()?;
        }

        info!(
            records = index.records.len(),
            durable_commit = index.durable_commit.as_u64(),
            term = index.election.term.as_u64(),
            "log opened"
        );

        Ok(Self {
            backend: Mutex::new(backend),
            index: RwLock::new(index),
            sync_on_append,
            fenced: AtomicBool::new(false),
        })
    }

    /// Appends a new record as the next sequence.
    ///
    /// The record is durable when this returns (if `sync_on_append`). Callers
    /// must hold the Primary role for `term`; the replication coordinator
    /// enforces that and reports `NotPrimary` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the storage refuses the write. Nothing is left
    /// behind in that case.
    pub fn append(
        &self,
        term: Term,
        txid: TransactionId,
        writes: Vec<LogWrite>,
    ) -> CoreResult<LogRecord> {
        let mut backend = self.backend.lock();
        let record = LogRecord {
            sequence: self.index.read().last_seq().next(),
            term,
            txid,
            writes,
        };
        self.write_record(backend.as_mut(), &record)?;
        Ok(record)
    }

    /// Appends a record received from the Primary.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the record is not the next sequence, or
    /// `Unavailable` if storage refuses the write.
    pub fn append_replicated(&self, record: &LogRecord) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let expected = self.index.read().last_seq().next();
        if record.sequence != expected {
            return Err(CoreError::invalid_state(format!(
                "replicated record {} does not follow {}",
                record.sequence,
                expected.prev()
            )));
        }
        self.write_record(backend.as_mut(), record)
    }

    fn write_record(&self, backend: &mut dyn StorageBackend, record: &LogRecord) -> CoreResult<()> {
        let entry = LogEntry::Record(record.clone());
        let (offset, len) = self.write_entry(backend, &entry, self.sync_on_append)?;
        self.index.write().records.push(IndexEntry {
            term: record.term,
            offset,
            len,
        });
        debug!(seq = record.sequence.as_u64(), term = record.term.as_u64(), "record appended");
        Ok(())
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.fenced.load(Ordering::SeqCst) {
            return Err(CoreError::unavailable(
                "log is fenced after a failed truncation",
            ));
        }
        Ok(())
    }

    /// Writes one envelope, rolling back partial bytes on failure.
    fn write_entry(
        &self,
        backend: &mut dyn StorageBackend,
        entry: &LogEntry,
        flush: bool,
    ) -> CoreResult<(u64, u64)> {
        self.check_writable()?;
        let bytes = entry.encode_envelope()?;
        let start = backend.size()?;

        let written = backend.append(&bytes).and_then(|offset| {
            if flush {
                backend.flush()?;
            }
            Ok(offset)
        });

        match written {
            Ok(offset) => Ok((offset, bytes.len() as u64)),
            Err(e) => {
                if backend.size().map_or(false, |size| size > start) {
                    if let Err(rollback) = backend.truncate(start) {
                        warn!(error = %rollback, "could not roll back partial log append");
                    }
                }
                Err(storage_unavailable(&e))
            }
        }
    }

    /// Drops every record after `seq`.
    ///
    /// Only an unconfirmed suffix may go; commit and vote markers that were
    /// stored after the cut are written again. If they cannot be, the cut
    /// bytes are put back; if even that fails the log refuses every further
    /// write, since the stored vote would otherwise be lost.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if `seq` is below the durable commit watermark,
    /// or `Unavailable` if storage fails.
    pub fn truncate_after(&self, seq: CommitSeq) -> CoreResult<u64> {
        let mut backend = self.backend.lock();
        let mut index = self.index.write();

        let last = index.last_seq();
        if seq >= last {
            return Ok(0);
        }
        if seq < index.durable_commit {
            return Err(CoreError::invalid_state(format!(
                "cannot truncate after {seq}: {} is committed",
                index.durable_commit
            )));
        }
        self.check_writable()?;

        let cut = index
            .get(seq.next())
            .map(|entry| entry.offset)
            .ok_or_else(|| CoreError::invalid_state(format!("{} not indexed", seq.next())))?;
        let size = backend.size()?;
        let tail = backend.read_at(cut, (size - cut) as usize)?;
        backend.truncate(cut).map_err(|e| storage_unavailable(&e))?;

        if let Err(e) = self.rewrite_markers(backend.as_mut(), &index) {
            let restored = backend
                .truncate(cut)
                .and_then(|()| backend.append(&tail))
                .and_then(|_| backend.sync());
            match restored {
                Ok(()) => warn!(error = %e, "truncation rolled back"),
                Err(restore) => {
                    self.fenced.store(true, Ordering::SeqCst);
                    error!(
                        error = %e,
                        restore_error = %restore,
                        "election markers lost during truncation; log fenced"
                    );
                }
            }
            return Err(e);
        }
        index.records.truncate(seq.as_u64() as usize);

        let dropped = last.as_u64() - seq.as_u64();
        warn!(after = seq.as_u64(), dropped, "truncated unconfirmed log suffix");
        Ok(dropped)
    }

    fn rewrite_markers(&self, backend: &mut dyn StorageBackend, index: &LogIndex) -> CoreResult<()> {
        let election = index.election;
        self.write_entry(
            backend,
            &LogEntry::Vote {
                term: election.term,
                voted_for: election.voted_for,
            },
            false,
        )?;
        if index.durable_commit > CommitSeq::ZERO {
            self.write_entry(
                backend,
                &LogEntry::Commit {
                    sequence: index.durable_commit,
                },
                false,
            )?;
        }
        backend.sync().map_err(|e| storage_unavailable(&e))
    }

    /// Persists that every record up to `seq` reached quorum.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the marker cannot be written.
    pub fn mark_committed(&self, seq: CommitSeq) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let current = self.index.read().durable_commit;
        if seq <= current {
            return Ok(());
        }
        if seq > self.index.read().last_seq() {
            return Err(CoreError::invalid_state(format!(
                "cannot mark {seq} committed past the last record"
            )));
        }

        self.write_entry(
            backend.as_mut(),
            &LogEntry::Commit { sequence: seq },
            self.sync_on_append,
        )?;
        self.index.write().durable_commit = seq;
        Ok(())
    }

    /// Persists election state. Always flushed: a vote must survive a crash.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the term would go backwards, or
    /// `Unavailable` if the marker cannot be written.
    pub fn record_election(&self, state: ElectionState) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let current = self.index.read().election;
        if state.term < current.term {
            return Err(CoreError::invalid_state(format!(
                "term cannot move back from {} to {}",
                current.term, state.term
            )));
        }
        if state == current {
            return Ok(());
        }

        self.write_entry(
            backend.as_mut(),
            &LogEntry::Vote {
                term: state.term,
                voted_for: state.voted_for,
            },
            true,
        )?;
        self.index.write().election = state;
        Ok(())
    }

    /// Reads the record at `seq`, or `None` if it does not exist (any more).
    ///
    /// # Errors
    ///
    /// Returns an error if the stored envelope is damaged.
    pub fn read_record(&self, seq: CommitSeq) -> CoreResult<Option<LogRecord>> {
        let Some(location) = self.index.read().get(seq) else {
            return Ok(None);
        };

        let backend = self.backend.lock();
        match read_envelope_at(backend.as_ref(), location.offset, location.len) {
            Ok(LogEntry::Record(record)) if record.sequence == seq => Ok(Some(record)),
            // Truncated and overwritten between the index lookup and the read.
            Ok(_) | Err(CoreError::Storage(StorageError::ReadPastEnd { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads up to `max` consecutive records starting at `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored envelope is damaged.
    pub fn entries_from(&self, from: CommitSeq, max: usize) -> CoreResult<Vec<LogRecord>> {
        self.read(from).take(max).collect()
    }

    /// Returns a lazy reader over records `from_seq..=last_seq()`.
    ///
    /// The upper bound is fixed when the reader is created. A new reader can
    /// be started from any sequence.
    #[must_use]
    pub fn read(&self, from_seq: CommitSeq) -> LogReader<'_> {
        LogReader::new(self, from_seq.max(CommitSeq::new(1)), self.last_seq())
    }

    /// Sequence of the last record.
    #[must_use]
    pub fn last_seq(&self) -> CommitSeq {
        self.index.read().last_seq()
    }

    /// Term of the last record, or `Term::ZERO` for an empty log.
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.index
            .read()
            .records
            .last()
            .map_or(Term::ZERO, |entry| entry.term)
    }

    /// Term of the record at `seq`; `Term::ZERO` for sequence 0.
    #[must_use]
    pub fn term_at(&self, seq: CommitSeq) -> Option<Term> {
        if seq == CommitSeq::ZERO {
            return Some(Term::ZERO);
        }
        self.index.read().get(seq).map(|entry| entry.term)
    }

    /// Highest sequence known to be committed as of the last marker.
    #[must_use]
    pub fn durable_commit(&self) -> CommitSeq {
        self.index.read().durable_commit
    }

    /// Persisted election state.
    #[must_use]
    pub fn election(&self) -> ElectionState {
        self.index.read().election
    }

    /// Size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Flushes pending bytes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend
            .lock()
            .flush()
            .map_err(|e| storage_unavailable(&e))
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        f.debug_struct("Log")
            .field("last_seq", &index.last_seq())
            .field("durable_commit", &index.durable_commit)
            .field("election", &index.election)
            .field("sync_on_append", &self.sync_on_append)
            .finish_non_exhaustive()
    }
}

fn storage_unavailable(error: &StorageError) -> CoreError {
    CoreError::unavailable(format!("log storage: {error}"))
}
