//! Verify command implementation.

use super::{log_path, CliError};
use quorumdb_core::log::{LogEntry, LogScanner};
use quorumdb_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of envelopes read.
    pub entries_checked: usize,
    /// Number of sequenced records.
    pub records: usize,
    /// Number of commit markers.
    pub commits: usize,
    /// Number of election markers.
    pub votes: usize,
    /// Bytes after the last intact envelope.
    pub torn_tail_bytes: u64,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying replica log at {:?}", path);
    println!();

    let backend = FileBackend::open(&log_path(path)?)?;
    let result = verify_log(&backend)?;
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
        Ok(())
    } else {
        println!("✗ Log verification failed");
        Err(CliError::VerificationFailed(result.errors.len()).into())
    }
}

/// Checks envelope integrity and the ordering rules between entries.
pub fn verify_log(backend: &dyn StorageBackend) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let mut scanner = LogScanner::new(backend, 0)?;
    let mut last_seq = 0u64;
    let mut commit = 0u64;
    let mut term = 0u64;

    for item in scanner.by_ref() {
        let scanned = match item {
            Ok(scanned) => scanned,
            Err(e) => {
                result.errors.push(e.to_string());
                break;
            }
        };
        result.entries_checked += 1;

        match scanned.entry {
            LogEntry::Record(record) => {
                result.records += 1;
                let seq = record.sequence.as_u64();
                if seq != last_seq + 1 {
                    result.errors.push(format!(
                        "record at offset {} has seq {seq}, expected {}",
                        scanned.offset,
                        last_seq + 1
                    ));
                }
                last_seq = seq;
            }
            LogEntry::Commit { sequence } => {
                result.commits += 1;
                let seq = sequence.as_u64();
                if seq < commit {
                    result.errors.push(format!(
                        "commit marker at offset {} moves back from {commit} to {seq}",
                        scanned.offset
                    ));
                }
                if seq > last_seq {
                    result.errors.push(format!(
                        "commit marker at offset {} names seq {seq} past the last record {last_seq}",
                        scanned.offset
                    ));
                }
                commit = commit.max(seq);
            }
            LogEntry::Vote {
                term: vote_term, ..
            } => {
                result.votes += 1;
                if vote_term.as_u64() < term {
                    result.errors.push(format!(
                        "election marker at offset {} moves term back from {term} to {vote_term}",
                        scanned.offset
                    ));
                }
                term = term.max(vote_term.as_u64());
            }
        }
    }

    if result.is_ok() && scanner.has_torn_tail() {
        result.torn_tail_bytes = backend.size()? - scanner.valid_end();
    }
    Ok(result)
}

fn print_result(result: &VerifyResult) {
    println!("  Envelopes checked: {}", result.entries_checked);
    println!("  Records:           {}", result.records);
    println!("  Commit markers:    {}", result.commits);
    println!("  Election markers:  {}", result.votes);
    if result.torn_tail_bytes > 0 {
        println!(
            "  Torn tail:         {} byte(s), cut off on next open",
            result.torn_tail_bytes
        );
    }
    for error in &result.errors {
        println!("  ERROR: {}", error);
    }
}
