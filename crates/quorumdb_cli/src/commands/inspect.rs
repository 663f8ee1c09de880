//! Inspect command implementation.

use super::open_log_copy;
use quorumdb_core::store::CollectionStore;
use serde::Serialize;
use std::path::Path;

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory.
    pub path: String,
    /// Log size in bytes.
    pub log_size: u64,
    /// Sequence of the last record.
    pub last_seq: u64,
    /// Term of the last record.
    pub last_term: u64,
    /// Durable commit watermark.
    pub commit_seq: u64,
    /// Records beyond the commit watermark.
    pub in_doubt: u64,
    /// Persisted current term.
    pub term: u64,
    /// Candidate voted for in `term`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voted_for: Option<u32>,
    /// Collection summaries (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<CollectionSummary>>,
}

/// Summary of one recovered collection.
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    /// Collection name.
    pub name: String,
    /// Number of live keys.
    pub live_keys: usize,
    /// Number of removed keys.
    pub removed_keys: usize,
    /// Highest entry version.
    pub max_version: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_collections: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, show_collections)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Recovers the log in `path` and summarizes it.
pub fn inspect(path: &Path, show_collections: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let log = open_log_copy(path)?;
    let election = log.election();

    let collections = if show_collections {
        let store = CollectionStore::new();
        store.replay(&log, log.durable_commit())?;
        Some(summarize(&store))
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        log_size: log.size()?,
        last_seq: log.last_seq().as_u64(),
        last_term: log.last_term().as_u64(),
        commit_seq: log.durable_commit().as_u64(),
        in_doubt: log.last_seq().as_u64() - log.durable_commit().as_u64(),
        term: election.term.as_u64(),
        voted_for: election.voted_for.map(|id| id.as_u32()),
        collections,
    })
}

fn summarize(store: &CollectionStore) -> Vec<CollectionSummary> {
    let rows = store.snapshot();
    store
        .collection_names()
        .into_iter()
        .map(|name| {
            let mut summary = CollectionSummary {
                name,
                live_keys: 0,
                removed_keys: 0,
                max_version: 0,
            };
            for row in rows.iter().filter(|row| row.collection == summary.name) {
                if row.value.is_some() {
                    summary.live_keys += 1;
                } else {
                    summary.removed_keys += 1;
                }
                summary.max_version = summary.max_version.max(row.version.as_u64());
            }
            summary
        })
        .collect()
}

fn print_text_output(result: &InspectResult) {
    println!("Replica: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:        {} bytes", result.log_size);
    println!("  Last record: seq {} (term {})", result.last_seq, result.last_term);
    println!("  Committed:   seq {}", result.commit_seq);
    println!("  In doubt:    {} record(s)", result.in_doubt);
    println!();
    println!("Election:");
    println!("  Term:        {}", result.term);
    match result.voted_for {
        Some(candidate) => println!("  Voted for:   replica-{candidate}"),
        None => println!("  Voted for:   -"),
    }

    if let Some(collections) = &result.collections {
        println!();
        println!("Collections:");
        if collections.is_empty() {
            println!("  (none)");
        }
        for c in collections {
            println!(
                "  {:<24} {} live, {} removed, max version {}",
                c.name, c.live_keys, c.removed_keys, c.max_version
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumdb_core::{
        CancellationToken, ClusterConfig, Config, LoopbackNetwork, Replica, ReplicaId,
    };
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn inspect_reports_recovered_state() {
        let dir = tempdir().unwrap();
        let id = ReplicaId::new(0);
        {
            let replica = Replica::open_dir(
                dir.path(),
                Config::default(),
                ClusterConfig::single(id),
                LoopbackNetwork::new().transport_for(id),
            )
            .unwrap();
            let counters = replica.collection("counters").unwrap();
            for key in [b"a", b"b"] {
                replica
                    .run(|tx| {
                        replica.compute_and_set(
                            tx,
                            &counters,
                            key,
                            |_, _| Ok(vec![1]),
                            Duration::from_secs(1),
                            &CancellationToken::new(),
                        )
                    })
                    .unwrap();
            }
        }

        let result = inspect(dir.path(), true).unwrap();
        assert_eq!(result.last_seq, 2);
        assert_eq!(result.commit_seq, 2);
        assert_eq!(result.in_doubt, 0);
        assert_eq!(result.term, 1);
        assert_eq!(result.voted_for, Some(0));

        let collections = result.collections.unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].name, "counters");
        assert_eq!(collections[0].live_keys, 2);
        assert_eq!(collections[0].max_version, 2);
    }

    #[test]
    fn missing_log_is_reported() {
        let dir = tempdir().unwrap();
        assert!(inspect(dir.path(), false).is_err());
    }
}
