//! Lazy, restartable replay of log records.

use crate::error::CoreResult;
use crate::log::manager::Log;
use crate::log::record::LogRecord;
use crate::types::CommitSeq;

/// Iterator over a fixed range of log records.
///
/// Each step looks the next record up and reads it on its own, so appends
/// proceed while a reader is alive. The range ends early if the records are
/// truncated away underneath the reader.
pub struct LogReader<'a> {
    log: &'a Log,
    next: CommitSeq,
    end: CommitSeq,
}

impl<'a> LogReader<'a> {
    pub(crate) fn new(log: &'a Log, from: CommitSeq, end: CommitSeq) -> Self {
        Self {
            log,
            next: from,
            end,
        }
    }

    /// Sequence the next call to `next` will return.
    #[must_use]
    pub fn position(&self) -> CommitSeq {
        self.next
    }

    /// Stops the reader after `end` instead of the original upper bound.
    #[must_use]
    pub fn until(mut self, end: CommitSeq) -> Self {
        self.end = self.end.min(end);
        self
    }
}

impl Iterator for LogReader<'_> {
    type Item = CoreResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }

        match self.log.read_record(self.next) {
            Ok(Some(record)) => {
                self.next = self.next.next();
                Some(Ok(record))
            }
            Ok(None) => {
                self.next = self.end.next();
                None
            }
            Err(e) => {
                self.next = self.end.next();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::log::{Log, LogWrite};
    use crate::types::{CommitSeq, Term, TransactionId};
    use quorumdb_storage::InMemoryBackend;

    fn log_with(count: u64) -> Log {
        let log = Log::open(Box::new(InMemoryBackend::new()), false).unwrap();
        for i in 1..=count {
            log.append(
                Term::new(1),
                TransactionId::new(i),
                vec![LogWrite {
                    collection: "c".into(),
                    key: vec![i as u8],
                    value: Some(vec![i as u8]),
                }],
            )
            .unwrap();
        }
        log
    }

    fn sequences(reader: impl Iterator<Item = crate::error::CoreResult<crate::log::LogRecord>>) -> Vec<u64> {
        reader.map(|r| r.unwrap().sequence.as_u64()).collect()
    }

    #[test]
    fn reads_from_any_sequence() {
        let log = log_with(5);
        assert_eq!(sequences(log.read(CommitSeq::ZERO)), vec![1, 2, 3, 4, 5]);
        assert_eq!(sequences(log.read(CommitSeq::new(4))), vec![4, 5]);
        assert!(sequences(log.read(CommitSeq::new(6))).is_empty());
    }

    #[test]
    fn restart_resumes_where_previous_reader_stopped() {
        let log = log_with(4);
        let mut reader = log.read(CommitSeq::new(1));
        reader.next().unwrap().unwrap();
        let resume_at = reader.position();
        drop(reader);

        assert_eq!(sequences(log.read(resume_at)), vec![2, 3, 4]);
    }

    #[test]
    fn range_is_fixed_at_creation() {
        let log = log_with(2);
        let reader = log.read(CommitSeq::new(1));
        log.append(Term::new(1), TransactionId::new(9), Vec::new()).unwrap();
        assert_eq!(sequences(reader), vec![1, 2]);
        assert_eq!(sequences(log.read(CommitSeq::new(1)).until(CommitSeq::new(1))), vec![1]);
    }

    #[test]
    fn truncation_ends_reader() {
        let log = log_with(4);
        let mut reader = log.read(CommitSeq::new(1));
        reader.next().unwrap().unwrap();
        log.truncate_after(CommitSeq::new(1)).unwrap();
        assert!(reader.next().is_none());
    }
}
