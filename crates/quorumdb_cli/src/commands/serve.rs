//! Serve command implementation.

use super::CliError;
use quorumdb_core::{
    ClusterConfig, Config, Replica, ReplicaId, ReplicaServer, Role, TcpTransport,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Options for running one replica.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// This replica's id.
    pub id: u32,
    /// Address of every member, this replica included.
    pub members: BTreeMap<ReplicaId, SocketAddr>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Base election timeout in milliseconds.
    pub election_ms: u64,
    /// Replication timeout in milliseconds.
    pub replication_ms: u64,
}

impl ServeOptions {
    fn config(&self) -> Config {
        Config::new()
            .heartbeat_interval(Duration::from_millis(self.heartbeat_ms))
            .election_timeout(Duration::from_millis(self.election_ms))
            .replication_timeout(Duration::from_millis(self.replication_ms))
    }

    fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            replica_id: ReplicaId::new(self.id),
            members: self.members.keys().copied().collect(),
        }
    }
}

/// Parses `id=host:port` member specifications.
pub fn parse_members(entries: &[String]) -> Result<BTreeMap<ReplicaId, SocketAddr>, CliError> {
    let mut members = BTreeMap::new();
    for entry in entries {
        let (id, addr) = entry
            .split_once('=')
            .ok_or_else(|| CliError::InvalidMember(entry.clone()))?;
        let id: u32 = id
            .trim()
            .parse()
            .map_err(|_| CliError::InvalidMember(entry.clone()))?;
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|_| CliError::InvalidMember(entry.clone()))?;
        if members.insert(ReplicaId::new(id), addr).is_some() {
            return Err(CliError::InvalidMember(entry.clone()));
        }
    }
    Ok(members)
}

/// Runs a replica until the process is killed.
pub fn run(path: &Path, options: &ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let me = ReplicaId::new(options.id);
    let listen = *options
        .members
        .get(&me)
        .ok_or(CliError::NotAMember(options.id))?;

    let peers: HashMap<ReplicaId, SocketAddr> = options
        .members
        .iter()
        .filter(|(id, _)| **id != me)
        .map(|(id, addr)| (*id, *addr))
        .collect();

    let config = options.config();
    let tick = config.heartbeat_interval / 2;
    let replica = Replica::open_dir(
        path,
        config,
        options.cluster(),
        Arc::new(TcpTransport::new(peers)),
    )?;
    let _server = ReplicaServer::bind(listen, replica.handler())?;

    info!(
        replica = options.id,
        %listen,
        members = options.members.len(),
        "serving"
    );

    let mut last_role = replica.role();
    let mut last_leader = replica.leader();
    loop {
        if let Err(e) = replica.tick() {
            warn!(error = %e, "tick failed");
        }

        let role = replica.role();
        let leader = replica.leader();
        if role != last_role || leader != last_leader {
            info!(
                role = ?role,
                term = replica.term().as_u64(),
                leader = ?leader.map(ReplicaId::as_u32),
                commit = replica.commit_seq().as_u64(),
                "role changed"
            );
            if role == Role::Primary && !replica.is_ready() {
                info!("writes wait for the term barrier to commit");
            }
            last_role = role;
            last_leader = leader;
        }

        thread::sleep(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn parses_members() {
        let members =
            parse_members(&entries(&["0=127.0.0.1:7000", "1=127.0.0.1:7001", " 2 = 127.0.0.1:7002"]))
                .unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(
            members[&ReplicaId::new(2)],
            "127.0.0.1:7002".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn rejects_malformed_members() {
        for bad in ["127.0.0.1:7000", "x=127.0.0.1:7000", "0=nowhere"] {
            assert!(matches!(
                parse_members(&entries(&[bad])),
                Err(CliError::InvalidMember(_))
            ));
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let result = parse_members(&entries(&["0=127.0.0.1:7000", "0=127.0.0.1:7001"]));
        assert!(matches!(result, Err(CliError::InvalidMember(_))));
    }

    #[test]
    fn options_build_a_valid_cluster() {
        let options = ServeOptions {
            id: 1,
            members: parse_members(&entries(&["0=127.0.0.1:7000", "1=127.0.0.1:7001"])).unwrap(),
            heartbeat_ms: 50,
            election_ms: 200,
            replication_ms: 1000,
        };
        let cluster = options.cluster();
        assert!(cluster.validate().is_ok());
        assert_eq!(cluster.peers().collect::<Vec<_>>(), vec![ReplicaId::new(0)]);
        assert!(options.config().validate().is_ok());
    }

    #[test]
    fn unknown_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let options = ServeOptions {
            id: 9,
            members: parse_members(&entries(&["0=127.0.0.1:7000"])).unwrap(),
            heartbeat_ms: 50,
            election_ms: 200,
            replication_ms: 1000,
        };
        assert!(run(dir.path(), &options).is_err());
    }
}
