//! Dump-log command implementation.

use super::log_path;
use quorumdb_core::log::{LogEntry, LogScanner};
use quorumdb_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::path::Path;

/// One log envelope, prepared for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Offset in the log file.
    pub offset: u64,
    /// Entry kind: `RECORD`, `COMMIT` or `VOTE`.
    pub entry_type: &'static str,
    /// Record or commit sequence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Record or election term.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
    /// Transaction id of a record; 0 marks a term barrier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Writes of a record.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<WriteInfo>,
    /// Candidate of an election marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voted_for: Option<u32>,
}

/// One write of a record.
#[derive(Debug, Serialize)]
pub struct WriteInfo {
    /// Collection name.
    pub collection: String,
    /// Hex-encoded key.
    pub key: String,
    /// Value size in bytes, or `None` for a removal.
    pub value_size: Option<usize>,
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    from_seq: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = FileBackend::open(&log_path(path)?)?;
    let entries = read_entries(&backend, limit, from_seq)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print_text_output(&entries),
    }
    Ok(())
}

/// Reads up to `limit` envelopes, skipping records below `from_seq`.
///
/// Commit and election markers are always included once the first record at
/// or above `from_seq` was reached.
pub fn read_entries(
    backend: &dyn StorageBackend,
    limit: Option<usize>,
    from_seq: u64,
) -> Result<Vec<EntryInfo>, Box<dyn std::error::Error>> {
    let max_entries = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    let mut reached = from_seq <= 1;

    for item in LogScanner::new(backend, 0)? {
        if entries.len() >= max_entries {
            break;
        }
        let scanned = item?;
        let info = match scanned.entry {
            LogEntry::Record(record) => {
                if record.sequence.as_u64() < from_seq {
                    continue;
                }
                reached = true;
                EntryInfo {
                    offset: scanned.offset,
                    entry_type: "RECORD",
                    seq: Some(record.sequence.as_u64()),
                    term: Some(record.term.as_u64()),
                    txid: Some(record.txid.as_u64()),
                    writes: record
                        .writes
                        .iter()
                        .map(|w| WriteInfo {
                            collection: w.collection.clone(),
                            key: hex_encode(&w.key),
                            value_size: w.value.as_ref().map(Vec::len),
                        })
                        .collect(),
                    voted_for: None,
                }
            }
            LogEntry::Commit { sequence } => EntryInfo {
                offset: scanned.offset,
                entry_type: "COMMIT",
                seq: Some(sequence.as_u64()),
                term: None,
                txid: None,
                writes: Vec::new(),
                voted_for: None,
            },
            LogEntry::Vote { term, voted_for } => EntryInfo {
                offset: scanned.offset,
                entry_type: "VOTE",
                seq: None,
                term: Some(term.as_u64()),
                txid: None,
                writes: Vec::new(),
                voted_for: voted_for.map(|id| id.as_u32()),
            },
        };
        if reached {
            entries.push(info);
        }
    }
    Ok(entries)
}

fn print_text_output(entries: &[EntryInfo]) {
    println!(
        "{:>10}  {:<8}  {:>8}  {:>6}  {:>8}  DETAILS",
        "OFFSET", "TYPE", "SEQ", "TERM", "TXID"
    );
    println!("{}", "-".repeat(72));

    for entry in entries {
        let details = match entry.entry_type {
            "RECORD" if entry.writes.is_empty() => "term barrier".to_string(),
            "RECORD" => entry
                .writes
                .iter()
                .map(|w| match w.value_size {
                    Some(size) => format!("{}/{} ({} B)", w.collection, w.key, size),
                    None => format!("{}/{} (removed)", w.collection, w.key),
                })
                .collect::<Vec<_>>()
                .join(", "),
            "VOTE" => entry
                .voted_for
                .map_or_else(|| "no vote".to_string(), |id| format!("voted for replica-{id}")),
            _ => String::new(),
        };
        println!(
            "{:>10}  {:<8}  {:>8}  {:>6}  {:>8}  {}",
            entry.offset,
            entry.entry_type,
            entry.seq.map_or_else(|| "-".to_string(), |v| v.to_string()),
            entry.term.map_or_else(|| "-".to_string(), |v| v.to_string()),
            entry.txid.map_or_else(|| "-".to_string(), |v| v.to_string()),
            details
        );
    }

    println!();
    println!("Total: {} entries", entries.len());
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumdb_core::log::{ElectionState, Log, LogWrite};
    use quorumdb_core::{CommitSeq, ReplicaId, Term, TransactionId};
    use quorumdb_storage::InMemoryBackend;

    fn populated() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let log = Log::open(Box::new(backend.clone()), true).unwrap();
        log.record_election(ElectionState {
            term: Term::new(1),
            voted_for: Some(ReplicaId::new(0)),
        })
        .unwrap();
        log.append(
            Term::new(1),
            TransactionId::new(1),
            vec![LogWrite {
                collection: "counters".into(),
                key: b"hi".to_vec(),
                value: Some(vec![1, 2]),
            }],
        )
        .unwrap();
        log.append(Term::new(1), TransactionId::BARRIER, Vec::new())
            .unwrap();
        log.mark_committed(CommitSeq::new(2)).unwrap();
        backend
    }

    #[test]
    fn dumps_every_entry_kind() {
        let entries = read_entries(&populated(), None, 1).unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.entry_type).collect();
        assert_eq!(kinds, ["VOTE", "RECORD", "RECORD", "COMMIT"]);

        assert_eq!(entries[0].voted_for, Some(0));
        assert_eq!(entries[1].writes[0].key, "6869");
        assert_eq!(entries[1].writes[0].value_size, Some(2));
        assert_eq!(entries[2].txid, Some(0));
        assert_eq!(entries[3].seq, Some(2));
    }

    #[test]
    fn from_seq_and_limit() {
        let entries = read_entries(&populated(), Some(1), 2).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, Some(2));
        assert_eq!(entries[0].txid, Some(0));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
