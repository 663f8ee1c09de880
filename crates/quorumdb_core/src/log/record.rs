//! Log entry types and their binary envelope.

use crate::error::{CoreError, CoreResult};
use crate::types::{CommitSeq, ReplicaId, Term, TransactionId};
use quorumdb_protocol::{WireRecord, WireWrite};

/// Magic bytes opening every log envelope.
pub const LOG_MAGIC: [u8; 4] = *b"QLOG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing CRC-32.
pub const CRC_SIZE: usize = 4;

/// Largest payload a record may have: it must fit in one replication frame.
pub const MAX_PAYLOAD_SIZE: usize = quorumdb_protocol::MAX_FRAME_SIZE;

/// A single key write inside a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWrite {
    /// Collection name.
    pub collection: String,
    /// Opaque key bytes.
    pub key: Vec<u8>,
    /// New value; `None` removes the key.
    pub value: Option<Vec<u8>>,
}

/// An immutable, sequenced record of one transaction's writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position in the log; also the version of every key written.
    pub sequence: CommitSeq,
    /// Term of the Primary that appended the record.
    pub term: Term,
    /// Originating transaction.
    pub txid: TransactionId,
    /// Writes in the order they are applied.
    pub writes: Vec<LogWrite>,
}

impl LogRecord {
    /// Returns true for a write-less record appended by a new Primary.
    #[must_use]
    pub fn is_barrier(&self) -> bool {
        self.writes.is_empty()
    }
}

impl From<&LogRecord> for WireRecord {
    fn from(record: &LogRecord) -> Self {
        Self {
            seq: record.sequence.as_u64(),
            term: record.term.as_u64(),
            txid: record.txid.as_u64(),
            writes: record
                .writes
                .iter()
                .map(|w| WireWrite {
                    collection: w.collection.clone(),
                    key: w.key.clone(),
                    value: w.value.clone(),
                })
                .collect(),
        }
    }
}

impl From<WireRecord> for LogRecord {
    fn from(record: WireRecord) -> Self {
        Self {
            sequence: CommitSeq::new(record.seq),
            term: Term::new(record.term),
            txid: TransactionId::new(record.txid),
            writes: record
                .writes
                .into_iter()
                .map(|w| LogWrite {
                    collection: w.collection,
                    key: w.key,
                    value: w.value,
                })
                .collect(),
        }
    }
}

/// Type byte of a log envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEntryType {
    /// A sequenced transaction record.
    Record = 1,
    /// Durable commit watermark.
    Commit = 2,
    /// Durable election state.
    Vote = 3,
}

impl LogEntryType {
    /// Converts a byte to an entry type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Record),
            2 => Some(Self::Commit),
            3 => Some(Self::Vote),
            _ => None,
        }
    }

    /// Converts the entry type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Anything that can be stored in the log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A sequenced transaction record.
    Record(LogRecord),
    /// Every record up to `sequence` reached quorum.
    Commit {
        /// Highest committed sequence.
        sequence: CommitSeq,
    },
    /// The replica entered `term` and possibly voted.
    Vote {
        /// Current term.
        term: Term,
        /// Candidate voted for in `term`.
        voted_for: Option<ReplicaId>,
    },
}

impl LogEntry {
    /// Returns the entry type.
    #[must_use]
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            Self::Record(_) => LogEntryType::Record,
            Self::Commit { .. } => LogEntryType::Commit,
            Self::Vote { .. } => LogEntryType::Vote,
        }
    }

    /// Serializes the entry payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a collection name, key or value does not
    /// fit its length prefix.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Record(record) => {
                buf.extend_from_slice(&record.sequence.as_u64().to_le_bytes());
                buf.extend_from_slice(&record.term.as_u64().to_le_bytes());
                buf.extend_from_slice(&record.txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&len_u32(record.writes.len(), "write count")?.to_le_bytes());
                for write in &record.writes {
                    let name = write.collection.as_bytes();
                    let name_len = u16::try_from(name.len()).map_err(|_| {
                        CoreError::invalid_argument("collection name longer than 65535 bytes")
                    })?;
                    buf.extend_from_slice(&name_len.to_le_bytes());
                    buf.extend_from_slice(name);
                    buf.extend_from_slice(&len_u32(write.key.len(), "key")?.to_le_bytes());
                    buf.extend_from_slice(&write.key);
                    match &write.value {
                        Some(value) => {
                            buf.push(1);
                            buf.extend_from_slice(&len_u32(value.len(), "value")?.to_le_bytes());
                            buf.extend_from_slice(value);
                        }
                        None => buf.push(0),
                    }
                }
            }
            Self::Commit { sequence } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
            Self::Vote { term, voted_for } => {
                buf.extend_from_slice(&term.as_u64().to_le_bytes());
                match voted_for {
                    Some(candidate) => {
                        buf.push(1);
                        buf.extend_from_slice(&candidate.as_u32().to_le_bytes());
                    }
                    None => {
                        buf.push(0);
                        buf.extend_from_slice(&0u32.to_le_bytes());
                    }
                }
            }
        }

        Ok(buf)
    }

    /// Deserializes an entry from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` on short payloads, invalid UTF-8 collection
    /// names, bad flags, or trailing bytes.
    pub fn decode_payload(entry_type: LogEntryType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);

        let entry = match entry_type {
            LogEntryType::Record => {
                let sequence = CommitSeq::new(reader.u64()?);
                let term = Term::new(reader.u64()?);
                let txid = TransactionId::new(reader.u64()?);
                let count = reader.u32()? as usize;
                let mut writes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name_len = reader.u16()? as usize;
                    let collection = String::from_utf8(reader.bytes(name_len)?.to_vec())
                        .map_err(|_| CoreError::log_corruption("collection name is not UTF-8"))?;
                    let key_len = reader.u32()? as usize;
                    let key = reader.bytes(key_len)?.to_vec();
                    let value = match reader.u8()? {
                        0 => None,
                        1 => {
                            let len = reader.u32()? as usize;
                            Some(reader.bytes(len)?.to_vec())
                        }
                        flag => {
                            return Err(CoreError::log_corruption(format!(
                                "invalid value flag {flag}"
                            )))
                        }
                    };
                    writes.push(LogWrite {
                        collection,
                        key,
                        value,
                    });
                }
                Self::Record(LogRecord {
                    sequence,
                    term,
                    txid,
                    writes,
                })
            }
            LogEntryType::Commit => Self::Commit {
                sequence: CommitSeq::new(reader.u64()?),
            },
            LogEntryType::Vote => {
                let term = Term::new(reader.u64()?);
                let flag = reader.u8()?;
                let candidate = reader.u32()?;
                let voted_for = match flag {
                    0 => None,
                    1 => Some(ReplicaId::new(candidate)),
                    other => {
                        return Err(CoreError::log_corruption(format!(
                            "invalid vote flag {other}"
                        )))
                    }
                };
                Self::Vote { term, voted_for }
            }
        };

        reader.finish(entry_type)?;
        Ok(entry)
    }

    /// Builds the full envelope: header, payload and CRC.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn encode_envelope(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CoreError::invalid_argument(format!(
                "log payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);

        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.entry_type().as_byte());
        data.extend_from_slice(&len_u32(payload.len(), "log payload")?.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnvelopeHeader {
    pub entry_type: LogEntryType,
    pub payload_len: usize,
}

impl EnvelopeHeader {
    /// Total envelope length including header and CRC.
    pub fn total_len(&self) -> usize {
        HEADER_SIZE + self.payload_len + CRC_SIZE
    }
}

/// Validates the fixed header at `offset`.
pub(crate) fn parse_header(header: &[u8], offset: u64) -> CoreResult<EnvelopeHeader> {
    if header[0..4] != LOG_MAGIC {
        return Err(CoreError::log_corruption(format!(
            "invalid magic at offset {offset}"
        )));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version == 0 || version > LOG_VERSION {
        return Err(CoreError::log_corruption(format!(
            "unsupported version {version} at offset {offset}"
        )));
    }

    let type_byte = header[6];
    let entry_type = LogEntryType::from_byte(type_byte).ok_or_else(|| {
        CoreError::log_corruption(format!(
            "unknown entry type {type_byte} at offset {offset}"
        ))
    })?;

    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(CoreError::log_corruption(format!(
            "payload length {payload_len} at offset {offset} exceeds {MAX_PAYLOAD_SIZE}"
        )));
    }
    Ok(EnvelopeHeader {
        entry_type,
        payload_len,
    })
}

/// Verifies the CRC of a complete envelope and decodes its entry.
pub(crate) fn decode_envelope(envelope: &[u8], header: EnvelopeHeader) -> CoreResult<LogEntry> {
    let payload_end = HEADER_SIZE + header.payload_len;
    let stored_crc = u32::from_le_bytes([
        envelope[payload_end],
        envelope[payload_end + 1],
        envelope[payload_end + 2],
        envelope[payload_end + 3],
    ]);
    let computed_crc = compute_crc32(&envelope[..payload_end]);
    if stored_crc != computed_crc {
        return Err(CoreError::ChecksumMismatch {
            expected: stored_crc,
            actual: computed_crc,
        });
    }

    LogEntry::decode_payload(header.entry_type, &envelope[HEADER_SIZE..payload_end])
}

fn len_u32(len: usize, what: &str) -> CoreResult<u32> {
    u32::try_from(len).map_err(|_| CoreError::invalid_argument(format!("{what} too large")))
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }

    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| CoreError::log_corruption("unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn finish(&self, entry_type: LogEntryType) -> CoreResult<()> {
        if self.cursor != self.payload.len() {
            return Err(CoreError::log_corruption(format!(
                "trailing bytes in {entry_type:?} entry: expected {} bytes, got {}",
                self.cursor,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Computes a CRC-32 (IEEE) checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> LogRecord {
        LogRecord {
            sequence: CommitSeq::new(3),
            term: Term::new(2),
            txid: TransactionId::new(9),
            writes: vec![
                LogWrite {
                    collection: "counters".into(),
                    key: b"hits".to_vec(),
                    value: Some(vec![2]),
                },
                LogWrite {
                    collection: "sessions".into(),
                    key: b"s-1".to_vec(),
                    value: None,
                },
            ],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn record_payload_decodes_to_same_record() {
        let entry = LogEntry::Record(sample_record());
        let payload = entry.encode_payload().unwrap();
        assert_eq!(
            LogEntry::decode_payload(LogEntryType::Record, &payload).unwrap(),
            entry
        );
    }

    #[test]
    fn vote_without_candidate() {
        let entry = LogEntry::Vote {
            term: Term::new(4),
            voted_for: None,
        };
        let payload = entry.encode_payload().unwrap();
        assert_eq!(payload.len(), 13);
        assert_eq!(
            LogEntry::decode_payload(LogEntryType::Vote, &payload).unwrap(),
            entry
        );
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = LogEntry::Commit {
            sequence: CommitSeq::new(1),
        }
        .encode_payload()
        .unwrap();
        payload.push(0);
        assert!(matches!(
            LogEntry::decode_payload(LogEntryType::Commit, &payload),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn short_payload_is_corruption() {
        let payload = LogEntry::Record(sample_record()).encode_payload().unwrap();
        assert!(matches!(
            LogEntry::decode_payload(LogEntryType::Record, &payload[..payload.len() - 1]),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn envelope_layout() {
        let entry = LogEntry::Commit {
            sequence: CommitSeq::new(5),
        };
        let envelope = entry.encode_envelope().unwrap();
        assert_eq!(&envelope[0..4], b"QLOG");
        assert_eq!(envelope.len(), HEADER_SIZE + 8 + CRC_SIZE);

        let header = parse_header(&envelope[..HEADER_SIZE], 0).unwrap();
        assert_eq!(header.entry_type, LogEntryType::Commit);
        assert_eq!(decode_envelope(&envelope, header).unwrap(), entry);
    }

    #[test]
    fn flipped_payload_bit_fails_crc() {
        let mut envelope = LogEntry::Record(sample_record()).encode_envelope().unwrap();
        envelope[HEADER_SIZE + 2] ^= 0x40;
        let header = parse_header(&envelope[..HEADER_SIZE], 0).unwrap();
        assert!(matches!(
            decode_envelope(&envelope, header),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wire_conversion_keeps_fields() {
        let record = sample_record();
        let wire = WireRecord::from(&record);
        assert_eq!(wire.seq, 3);
        assert_eq!(wire.writes[1].value, None);
        assert_eq!(LogRecord::from(wire), record);
    }

    #[test]
    fn barrier_detection() {
        let mut record = sample_record();
        assert!(!record.is_barrier());
        record.writes.clear();
        assert!(record.is_barrier());
    }
}
