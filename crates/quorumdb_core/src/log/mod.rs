//! The replicated log: single source of truth for recovery and replication.
//!
//! ## Envelope Format
//!
//! ```text
//! | magic "QLOG" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Three entry types share the file:
//!
//! - **Record**: a sequenced transaction record (`seq`, `term`, `txid`, writes)
//! - **Commit**: durable commit watermark, written as quorum advances
//! - **Vote**: durable election state, written before a vote or campaign
//!
//! ## Recovery Policy
//!
//! - a truncated trailing envelope is a crash mid-append and is cut off
//! - CRC mismatch, bad magic, unknown type or unsupported version fail the open
//!
//! ## Invariants
//!
//! - record sequences are contiguous from 1
//! - records at or below the durable commit watermark are never removed
//! - only an unconfirmed suffix is truncated, and only on behalf of a newer term

mod manager;
mod reader;
mod record;
mod scanner;

pub use manager::{ElectionState, Log};
pub use reader::LogReader;
pub use record::{
    compute_crc32, LogEntry, LogEntryType, LogRecord, LogWrite, CRC_SIZE, HEADER_SIZE,
    LOG_MAGIC, LOG_VERSION,
};
pub use scanner::{LogScanner, ScannedEntry};
