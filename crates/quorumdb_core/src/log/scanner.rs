//! Streaming scan over every envelope in the log.
//!
//! Used once at open time to rebuild the sequence index and by the CLI to
//! verify a log file. Memory stays bounded by the read buffer plus the largest
//! envelope.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{
    decode_envelope, parse_header, LogEntry, CRC_SIZE, HEADER_SIZE, LOG_MAGIC,
};
use quorumdb_storage::StorageBackend;

/// Read buffer size for streaming iteration.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// An envelope found by [`LogScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    /// Offset of the envelope's first byte.
    pub offset: u64,
    /// Envelope length in bytes.
    pub len: u64,
    /// The decoded entry.
    pub entry: LogEntry,
}

impl ScannedEntry {
    /// Offset just past the envelope.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// A streaming iterator over log envelopes.
///
/// # Error Handling
///
/// - an incomplete trailing header or payload ends the scan cleanly (crash
///   mid-append); [`LogScanner::valid_end`] then reports where the intact
///   prefix stops
/// - an envelope that claims to run past the end while an intact envelope
///   follows it has a damaged length, not a torn tail, and is an error
/// - bad magic, unknown type, unsupported version, an oversized length or
///   CRC mismatch yield an error and end the scan
pub struct LogScanner<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    /// Offset of the next unread envelope.
    current_offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_len: usize,
    finished: bool,
}

impl<'a> LogScanner<'a> {
    /// Creates a scanner starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend, start_offset: u64) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            current_offset: start_offset,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            buffer_pos: 0,
            buffer_len: 0,
            finished: false,
        })
    }

    /// Offset where the intact prefix of the log ends.
    ///
    /// Only meaningful once the scanner has returned `None`.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.current_offset
    }

    /// Returns true if bytes past [`Self::valid_end`] belong to a torn append.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.finished && self.current_offset < self.total_size
    }

    /// Ensures `min_bytes` are buffered from the current position.
    ///
    /// Returns false if the log ends first. Grows the buffer for envelopes
    /// larger than the default size.
    fn ensure_buffered(&mut self, min_bytes: usize) -> CoreResult<bool> {
        let available = self.buffer_len - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }

        let remaining = (self.total_size - self.current_offset) as usize - available;
        if remaining < min_bytes - available {
            return Ok(false);
        }

        if self.buffer_pos > 0 && available > 0 {
            self.buffer.copy_within(self.buffer_pos..self.buffer_len, 0);
        }
        self.buffer_len = available;
        self.buffer_pos = 0;

        if min_bytes > self.buffer.len() {
            self.buffer.resize(min_bytes.next_power_of_two(), 0);
        }

        let to_read = std::cmp::min(self.buffer.len() - self.buffer_len, remaining);
        if to_read > 0 {
            let read_offset = self.current_offset + self.buffer_len as u64;
            let data = self.backend.read_at(read_offset, to_read)?;
            self.buffer[self.buffer_len..self.buffer_len + data.len()].copy_from_slice(&data);
            self.buffer_len += data.len();
        }

        Ok(self.buffer_len - self.buffer_pos >= min_bytes)
    }

    fn read_next(&mut self) -> CoreResult<Option<ScannedEntry>> {
        let offset = self.current_offset;

        if !self.ensure_buffered(HEADER_SIZE)? {
            return Ok(None);
        }
        let header = parse_header(
            &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE],
            offset,
        )?;

        let total_len = header.total_len();
        if !self.ensure_buffered(total_len)? {
            if let Some(next) = self.intact_envelope_after(offset)? {
                return Err(CoreError::log_corruption(format!(
                    "envelope at offset {offset} runs past the end of the log, \
                     but an intact envelope follows at offset {next}"
                )));
            }
            return Ok(None);
        }

        let entry = decode_envelope(
            &self.buffer[self.buffer_pos..self.buffer_pos + total_len],
            header,
        )?;

        self.buffer_pos += total_len;
        self.current_offset += total_len as u64;

        Ok(Some(ScannedEntry {
            offset,
            len: total_len as u64,
            entry,
        }))
    }
}

impl LogScanner<'_> {
    /// Finds a complete, checksummed envelope starting after `offset`.
    ///
    /// A crash only ever tears the last envelope.
    fn intact_envelope_after(&self, offset: u64) -> CoreResult<Option<u64>> {
        let start = offset + 1;
        if start >= self.total_size {
            return Ok(None);
        }
        let tail = self.backend.read_at(start, (self.total_size - start) as usize)?;

        let mut pos = 0;
        while pos + HEADER_SIZE + CRC_SIZE <= tail.len() {
            if tail[pos..pos + LOG_MAGIC.len()] == LOG_MAGIC {
                let at = start + pos as u64;
                if let Ok(header) = parse_header(&tail[pos..pos + HEADER_SIZE], at) {
                    let end = pos + header.total_len();
                    if end <= tail.len() && decode_envelope(&tail[pos..end], header).is_ok() {
                        return Ok(Some(at));
                    }
                }
            }
            pos += 1;
        }
        Ok(None)
    }
}

impl Iterator for LogScanner<'_> {
    type Item = CoreResult<ScannedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads and decodes the single envelope at `offset` with known length.
pub(crate) fn read_envelope_at(
    backend: &dyn StorageBackend,
    offset: u64,
    len: u64,
) -> CoreResult<LogEntry> {
    let bytes = backend.read_at(offset, len as usize)?;
    if bytes.len() < HEADER_SIZE {
        return Err(CoreError::log_corruption(format!(
            "short envelope at offset {offset}"
        )));
    }
    let header = parse_header(&bytes[..HEADER_SIZE], offset)?;
    if header.total_len() as u64 != len {
        return Err(CoreError::log_corruption(format!(
            "envelope length changed at offset {offset}"
        )));
    }
    decode_envelope(&bytes, header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{LogRecord, CRC_SIZE};
    use crate::types::{CommitSeq, Term, TransactionId};
    use quorumdb_storage::InMemoryBackend;

    fn record(seq: u64, value_len: usize) -> LogEntry {
        LogEntry::Record(LogRecord {
            sequence: CommitSeq::new(seq),
            term: Term::new(1),
            txid: TransactionId::new(seq),
            writes: vec![crate::log::LogWrite {
                collection: "c".into(),
                key: seq.to_le_bytes().to_vec(),
                value: Some(vec![7; value_len]),
            }],
        })
    }

    fn backend_with(entries: &[LogEntry]) -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        for entry in entries {
            backend.append(&entry.encode_envelope().unwrap()).unwrap();
        }
        backend
    }

    #[test]
    fn scans_entries_with_offsets() {
        let entries = vec![
            record(1, 4),
            LogEntry::Commit {
                sequence: CommitSeq::new(1),
            },
            record(2, 4),
        ];
        let backend = backend_with(&entries);

        let scanned: Vec<_> = LogScanner::new(&backend, 0)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned[0].offset, 0);
        assert_eq!(scanned[1].offset, scanned[0].end());
        assert_eq!(scanned[2].entry, entries[2]);
        assert_eq!(scanned[2].end(), backend.size().unwrap());
    }

    #[test]
    fn torn_tail_ends_cleanly() {
        let backend = backend_with(&[record(1, 4), record(2, 4)]);
        let full = backend.data();
        let torn = InMemoryBackend::with_data(full[..full.len() - 3].to_vec());

        let mut scanner = LogScanner::new(&torn, 0).unwrap();
        let first = scanner.next().unwrap().unwrap();
        assert!(scanner.next().is_none());
        assert!(scanner.has_torn_tail());
        assert_eq!(scanner.valid_end(), first.end());
    }

    #[test]
    fn envelope_larger_than_buffer() {
        let big = record(1, READ_BUFFER_SIZE * 2);
        let backend = backend_with(&[big.clone(), record(2, 1)]);

        let scanned: Vec<_> = LogScanner::new(&backend, 0)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(scanned[0].entry, big);
        assert_eq!(scanned.len(), 2);
    }

    #[test]
    fn corrupted_crc_is_fatal() {
        let backend = backend_with(&[record(1, 4), record(2, 4)]);
        let first_len = record(1, 4).encode_envelope().unwrap().len();
        backend.corrupt_byte(first_len + HEADER_SIZE + 1, 0xEE);

        let results: Vec<_> = LogScanner::new(&backend, 0).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let backend = backend_with(&[record(1, 4), record(2, 4)]);
        backend.corrupt_byte(10, 0x7F);

        let first = LogScanner::new(&backend, 0).unwrap().next().unwrap();
        assert!(matches!(first, Err(CoreError::LogCorruption { .. })));
    }

    #[test]
    fn length_past_end_with_envelopes_behind_is_fatal() {
        let backend = backend_with(&[record(1, 4), record(2, 4), record(3, 4)]);
        // 64 KiB more than the log holds, still under the payload cap.
        backend.corrupt_byte(9, 0x01);

        let mut scanner = LogScanner::new(&backend, 0).unwrap();
        assert!(matches!(
            scanner.next(),
            Some(Err(CoreError::LogCorruption { .. }))
        ));
        assert!(scanner.next().is_none());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let backend = backend_with(&[record(1, 4)]);
        backend.corrupt_byte(0, b'X');
        let first = LogScanner::new(&backend, 0).unwrap().next().unwrap();
        assert!(matches!(first, Err(CoreError::LogCorruption { .. })));
    }

    #[test]
    fn read_single_envelope() {
        let entry = record(1, 10);
        let backend = backend_with(&[entry.clone()]);
        let len = backend.size().unwrap();
        assert_eq!(read_envelope_at(&backend, 0, len).unwrap(), entry);
        assert!(read_envelope_at(&backend, 0, len - CRC_SIZE as u64).is_err());
    }
}
