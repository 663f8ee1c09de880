//! Replication coordinator: leadership, log shipping and commit.

use crate::config::{ClusterConfig, Config};
use crate::error::{CoreError, CoreResult};
use crate::log::{ElectionState, Log, LogRecord, LogWrite};
use crate::replication::pending::PendingRecords;
use crate::replication::progress::{quorum_seq, PeerEvent, PeerProgress, Sent};
use crate::replication::role::{Role, RoleState};
use crate::replication::transport::{MessageHandler, ReplicaTransport};
use crate::stats::EngineStats;
use crate::store::CollectionStore;
use crate::types::{CommitSeq, ReplicaId, Term, TransactionId};
use parking_lot::{Mutex, RwLock};
use quorumdb_protocol::{
    AppendAck, AppendRequest, Heartbeat, HeartbeatAck, ReplicationMessage, VoteGrant,
    VoteRequest, WireRecord,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause between replication rounds that ended without reaching the target.
const ROUND_PAUSE: Duration = Duration::from_millis(5);

/// Drives leadership and replication for one replica.
///
/// ## Lock order
///
/// `append_lock` → `state` → `pending` → log → store. The replication lock is
/// only ever taken with none of the others held.
///
/// ## Commit rule
///
/// A sequence is committed once a majority (this replica included) holds it
/// and the record at that sequence belongs to the current term. Earlier
/// records are committed with it. A new Primary therefore appends a term
/// barrier before it serves writes.
pub struct ReplicationCoordinator {
    config: Config,
    cluster: ClusterConfig,
    log: Arc<Log>,
    store: Arc<CollectionStore>,
    transport: Arc<dyn ReplicaTransport>,
    stats: Arc<EngineStats>,
    state: Mutex<RoleState>,
    peers: BTreeMap<ReplicaId, Arc<Mutex<PeerProgress>>>,
    /// Records in the log above the commit watermark.
    pending: RwLock<BTreeMap<CommitSeq, LogRecord>>,
    /// Serializes every mutation of the log's record sequence.
    append_lock: Mutex<()>,
    /// Serializes replication rounds.
    replication_lock: Mutex<()>,
}

impl ReplicationCoordinator {
    /// Creates a coordinator over a recovered log and store.
    ///
    /// Records in the log above the store's applied sequence are treated as
    /// in doubt until the leadership protocol commits or truncates them.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending records cannot be read back.
    pub fn new(
        config: Config,
        cluster: ClusterConfig,
        log: Arc<Log>,
        store: Arc<CollectionStore>,
        transport: Arc<dyn ReplicaTransport>,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let mut pending = BTreeMap::new();
        for record in log.read(store.applied_seq().next()) {
            let record = record?;
            pending.insert(record.sequence, record);
        }
        if !pending.is_empty() {
            info!(
                replica = cluster.replica_id.as_u32(),
                in_doubt = pending.len(),
                "records awaiting leadership decision"
            );
        }

        let term = log.election().term;
        let next_seq = log.last_seq().next();
        let peers = cluster
            .peers()
            .map(|id| (id, Arc::new(Mutex::new(PeerProgress::new(term, next_seq)))))
            .collect();
        let election_timeout = jittered(config.election_timeout);

        Ok(Self {
            config,
            cluster,
            log,
            store,
            transport,
            stats,
            state: Mutex::new(RoleState::new(term, election_timeout)),
            peers,
            pending: RwLock::new(pending),
            append_lock: Mutex::new(()),
            replication_lock: Mutex::new(()),
        })
    }

    /// This replica's id.
    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.cluster.replica_id
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Current term.
    #[must_use]
    pub fn term(&self) -> Term {
        self.state.lock().term
    }

    /// Known Primary of the current term.
    #[must_use]
    pub fn leader(&self) -> Option<ReplicaId> {
        self.state.lock().leader
    }

    /// Highest committed (and applied) sequence.
    #[must_use]
    pub fn commit_seq(&self) -> CommitSeq {
        self.store.applied_seq()
    }

    /// Returns true if this replica is a Primary whose log is confirmed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.role == Role::Primary && self.store.applied_seq() >= state.ready_at
    }

    /// Number of records appended but not yet committed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Runs `f` against the pending records while no commit can apply.
    pub fn with_pending<R>(&self, f: impl FnOnce(&PendingRecords<'_>) -> R) -> R {
        let pending = self.pending.read();
        f(&PendingRecords::new(&pending))
    }

    /// Appends a transaction record if this replica may accept writes.
    ///
    /// `validate` runs after leadership is checked and before the append, with
    /// the pending records in view and no other append in progress.
    ///
    /// # Errors
    ///
    /// - `NotPrimary` on a Secondary or Candidate
    /// - `Unavailable` on a Primary whose log is not yet confirmed, or when
    ///   the log cannot be written
    /// - whatever `validate` returns
    pub fn propose<F>(
        &self,
        txid: TransactionId,
        writes: Vec<LogWrite>,
        validate: F,
    ) -> CoreResult<LogRecord>
    where
        F: FnOnce(&PendingRecords<'_>) -> CoreResult<()>,
    {
        let _append = self.append_lock.lock();
        let term = self.writable_term()?;
        self.with_pending(validate)?;

        let record = self.log.append(term, txid, writes)?;
        self.pending
            .write()
            .insert(record.sequence, record.clone());
        self.stats.record_append();
        debug!(
            txid = txid.as_u64(),
            seq = record.sequence.as_u64(),
            term = term.as_u64(),
            "record proposed"
        );
        Ok(record)
    }

    fn writable_term(&self) -> CoreResult<Term> {
        let state = self.state.lock();
        if state.role != Role::Primary {
            return Err(CoreError::not_primary(state.leader));
        }
        if self.store.applied_seq() < state.ready_at {
            return Err(CoreError::unavailable(format!(
                "primary for {} has not confirmed its log up to {}",
                state.term, state.ready_at
            )));
        }
        Ok(state.term)
    }

    /// Waits until `record` is committed, replicating it as needed.
    ///
    /// Concurrent waiters share replication rounds: whoever holds the round
    /// lock ships every record a peer lacks, and a waiter whose record was
    /// confirmed meanwhile returns at once.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if no quorum acknowledged the record within
    /// `replication_timeout`, or if leadership was lost. The record then stays
    /// in the log and is retried on later ticks until it is committed or
    /// truncated by a newer term.
    pub fn await_commit(&self, record: &LogRecord) -> CoreResult<CommitSeq> {
        let seq = record.sequence;
        let deadline = Instant::now() + self.config.replication_timeout;

        loop {
            if self.commit_seq() >= seq {
                return self.confirm(record);
            }
            {
                let Some(_round) = self.replication_lock.try_lock_until(deadline) else {
                    break;
                };
                if self.commit_seq() >= seq {
                    return self.confirm(record);
                }
                self.replicate_round(Some(seq), deadline)?;
                if self.commit_seq() >= seq {
                    return self.confirm(record);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(ROUND_PAUSE.min(remaining));
        }

        self.stats.record_replication_timeout();
        warn!(
            seq = seq.as_u64(),
            timeout_ms = self.config.replication_timeout.as_millis() as u64,
            "record not acknowledged by a quorum"
        );
        Err(CoreError::unavailable(format!(
            "{seq} not acknowledged by a quorum within {:?}",
            self.config.replication_timeout
        )))
    }

    /// Checks that the committed record at `record.sequence` is `record`.
    fn confirm(&self, record: &LogRecord) -> CoreResult<CommitSeq> {
        if self.log.term_at(record.sequence) == Some(record.term) {
            Ok(record.sequence)
        } else {
            Err(CoreError::unavailable(format!(
                "{} was superseded by a newer term",
                record.sequence
            )))
        }
    }

    /// Ships missing records and heartbeats to every peer, then folds the
    /// acknowledgements into the commit watermark.
    ///
    /// Returns when `target` is committed, every contacted peer answered, or
    /// `deadline` passed. Callers hold the replication lock.
    fn replicate_round(&self, target: Option<CommitSeq>, deadline: Instant) -> CoreResult<()> {
        let term = {
            let mut state = self.state.lock();
            if state.role != Role::Primary {
                return Err(CoreError::unavailable(format!(
                    "{} lost leadership before quorum",
                    self.id()
                )));
            }
            state.last_round = Instant::now();
            state.term
        };
        self.stats.record_replication_round();

        let (events_tx, events) = mpsc::channel();
        for (&peer, progress) in &self.peers {
            let Some((message, sent)) = self.prepare_request(term, progress)? else {
                continue;
            };

            let transport = Arc::clone(&self.transport);
            let progress_for_reply = Arc::clone(progress);
            let events_tx = events_tx.clone();
            let timeout = self.config.replication_timeout;
            let spawned = thread::Builder::new()
                .name(format!("replicate-{}", peer.as_u32()))
                .spawn(move || {
                    let reply = transport.send(peer, &message, timeout);
                    let event = progress_for_reply.lock().on_reply(term, sent, reply);
                    // The round may already be over; progress is updated regardless.
                    let _ = events_tx.send(event);
                });
            if let Err(e) = spawned {
                progress.lock().in_flight = false;
                return Err(e.into());
            }
        }
        drop(events_tx);

        loop {
            self.advance_to_quorum(term)?;
            if target.is_some_and(|t| self.commit_seq() >= t) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match events.recv_timeout(remaining) {
                Ok(PeerEvent::HigherTerm(higher)) => {
                    self.observe_term(higher, None)?;
                    return Err(CoreError::unavailable(format!(
                        "{} stepped down: {higher} observed",
                        self.id()
                    )));
                }
                Ok(PeerEvent::Answered | PeerEvent::Unreachable) => {}
                Err(_) => {
                    self.advance_to_quorum(term)?;
                    return Ok(());
                }
            }
        }
    }

    /// Builds the next request for one peer, or `None` if one is in flight.
    fn prepare_request(
        &self,
        term: Term,
        progress: &Mutex<PeerProgress>,
    ) -> CoreResult<Option<(ReplicationMessage, Sent)>> {
        let mut peer = progress.lock();
        if peer.in_flight || peer.term != term {
            return Ok(None);
        }

        let last = self.log.last_seq();
        let commit = self.commit_seq();
        peer.next_seq = peer.next_seq.min(last.next());

        // Heartbeats only go to peers whose log is confirmed to match. Anyone
        // else gets an append, empty when the peer is due nothing, so the log
        // check runs and a stale suffix is found.
        let request = if peer.matched && peer.match_seq >= last {
            (
                ReplicationMessage::Heartbeat(Heartbeat {
                    term: term.as_u64(),
                    leader: self.id().as_u32(),
                    commit_seq: commit.min(peer.match_seq).as_u64(),
                }),
                Sent::Heartbeat,
            )
        } else {
            let prev_seq = peer.next_seq.prev();
            let prev_term = self.log.term_at(prev_seq).ok_or_else(|| {
                CoreError::invalid_state(format!("{prev_seq} missing from the primary's log"))
            })?;
            let records = if peer.next_seq > last {
                Vec::new()
            } else {
                self.log
                    .entries_from(peer.next_seq, self.config.max_batch_records)?
            };
            (
                ReplicationMessage::AppendRequest(AppendRequest {
                    term: term.as_u64(),
                    leader: self.id().as_u32(),
                    prev_seq: prev_seq.as_u64(),
                    prev_term: prev_term.as_u64(),
                    records: records.iter().map(WireRecord::from).collect(),
                    commit_seq: commit.as_u64(),
                }),
                Sent::Append { prev_seq },
            )
        };
        peer.in_flight = true;
        Ok(Some(request))
    }

    /// Commits up to the highest majority-held sequence of the current term.
    fn advance_to_quorum(&self, term: Term) -> CoreResult<()> {
        let matches: Vec<CommitSeq> = self
            .peers
            .values()
            .map(|progress| progress.lock().match_seq)
            .collect();
        let candidate = quorum_seq(self.log.last_seq(), &matches, self.cluster.majority());
        if candidate > self.commit_seq() && self.log.term_at(candidate) == Some(term) {
            self.advance_commit(candidate)?;
        }
        Ok(())
    }

    /// Marks `target` committed and applies every record up to it, in order.
    fn advance_commit(&self, target: CommitSeq) -> CoreResult<()> {
        let mut pending = self.pending.write();
        let applied = self.store.applied_seq();
        let target = target.min(self.log.last_seq());
        if target <= applied {
            return Ok(());
        }

        self.log.mark_committed(target)?;
        let mut seq = applied.next();
        while seq <= target {
            let record = match pending.remove(&seq) {
                Some(record) => record,
                None => self.log.read_record(seq)?.ok_or_else(|| {
                    CoreError::log_corruption(format!("committed {seq} missing from the log"))
                })?,
            };
            self.store.apply_committed(&record)?;
            self.stats.record_apply();
            seq = seq.next();
        }
        debug!(
            replica = self.id().as_u32(),
            commit = target.as_u64(),
            "commit advanced"
        );
        Ok(())
    }

    /// Drops every record after `after` from the log and the pending map.
    fn truncate_suffix(&self, after: CommitSeq) -> CoreResult<()> {
        let dropped = self.log.truncate_after(after)?;
        self.pending.write().retain(|seq, _| *seq <= after);
        self.stats.record_truncation(dropped);
        Ok(())
    }

    /// Adopts `term` if it is newer, stepping down to Secondary.
    fn observe_term(&self, term: Term, leader: Option<ReplicaId>) -> CoreResult<()> {
        let mut state = self.state.lock();
        if term > state.term {
            self.enter_term(&mut state, term, leader)?;
        }
        Ok(())
    }

    /// Persists and enters a newer term as Secondary.
    fn enter_term(
        &self,
        state: &mut RoleState,
        term: Term,
        leader: Option<ReplicaId>,
    ) -> CoreResult<()> {
        self.log.record_election(ElectionState {
            term,
            voted_for: None,
        })?;
        let previous = state.role;
        state.term = term;
        state.role = Role::Secondary;
        state.leader = leader;
        state.reset_election_timer(jittered(self.config.election_timeout));
        if previous == Role::Primary {
            self.stats.record_step_down();
            warn!(
                replica = self.id().as_u32(),
                term = term.as_u64(),
                "stepping down: newer term observed"
            );
        } else {
            debug!(replica = self.id().as_u32(), term = term.as_u64(), "entered term");
        }
        Ok(())
    }

    /// Starts an election for the next term.
    ///
    /// Returns true if this replica is Primary afterwards.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the vote cannot be persisted.
    pub fn campaign(&self) -> CoreResult<bool> {
        let (term, request) = {
            let mut state = self.state.lock();
            if state.role == Role::Primary {
                return Ok(true);
            }
            let term = state.term.next();
            self.log.record_election(ElectionState {
                term,
                voted_for: Some(self.id()),
            })?;
            state.term = term;
            state.role = Role::Candidate;
            state.leader = None;
            state.reset_election_timer(jittered(self.config.election_timeout));
            let request = ReplicationMessage::VoteRequest(VoteRequest {
                term: term.as_u64(),
                candidate: self.id().as_u32(),
                last_seq: self.log.last_seq().as_u64(),
                last_term: self.log.last_term().as_u64(),
            });
            (term, request)
        };
        self.stats.record_election_start();
        info!(replica = self.id().as_u32(), term = term.as_u64(), "starting election");

        let majority = self.cluster.majority();
        let mut votes = 1;
        if votes < majority {
            let (replies_tx, replies) = mpsc::channel();
            let timeout = self.config.election_timeout;
            for peer in self.cluster.peers() {
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                let replies_tx = replies_tx.clone();
                thread::Builder::new()
                    .name(format!("vote-{}", peer.as_u32()))
                    .spawn(move || {
                        let _ = replies_tx.send(transport.send(peer, &request, timeout));
                    })?;
            }
            drop(replies_tx);

            let deadline = Instant::now() + timeout;
            while votes < majority {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match replies.recv_timeout(remaining) {
                    Ok(Ok(ReplicationMessage::VoteGrant(grant))) => {
                        let grant_term = Term::new(grant.term);
                        if grant_term > term {
                            self.observe_term(grant_term, None)?;
                            return Ok(false);
                        }
                        if grant.granted && grant_term == term {
                            votes += 1;
                        }
                    }
                    Ok(Ok(other)) => {
                        debug!(type_code = other.type_code(), "unexpected vote reply");
                    }
                    Ok(Err(e)) => debug!(error = %e, "vote request failed"),
                    Err(_) => break,
                }
            }
        }

        if votes >= majority {
            self.become_primary(term)
        } else {
            debug!(
                replica = self.id().as_u32(),
                term = term.as_u64(),
                votes,
                "election lost"
            );
            Ok(false)
        }
    }

    /// Takes over as Primary of `term` after winning its election.
    fn become_primary(&self, term: Term) -> CoreResult<bool> {
        let barrier = {
            let _append = self.append_lock.lock();
            let mut state = self.state.lock();
            if state.role != Role::Candidate || state.term != term {
                return Ok(false);
            }

            let barrier = if self.log.last_seq() > self.commit_seq() {
                let record = self.log.append(term, TransactionId::BARRIER, Vec::new())?;
                self.pending
                    .write()
                    .insert(record.sequence, record.clone());
                Some(record.sequence)
            } else {
                None
            };

            let next_seq = barrier.unwrap_or_else(|| self.log.last_seq().next());
            for progress in self.peers.values() {
                *progress.lock() = PeerProgress::new(term, next_seq);
            }
            state.role = Role::Primary;
            state.leader = Some(self.id());
            state.ready_at = barrier.unwrap_or(CommitSeq::ZERO);
            barrier
        };
        self.stats.record_election_win();
        info!(
            replica = self.id().as_u32(),
            term = term.as_u64(),
            barrier = barrier.map(CommitSeq::as_u64),
            "became primary"
        );

        // Announce leadership; a barrier that misses quorum here is retried on tick.
        let wait = if barrier.is_some() {
            self.config.replication_timeout
        } else {
            self.config.heartbeat_interval
        };
        let deadline = Instant::now() + wait;
        if let Some(_round) = self.replication_lock.try_lock_until(deadline) {
            match self.replicate_round(barrier, deadline) {
                Ok(()) | Err(CoreError::Unavailable { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(self.role() == Role::Primary)
    }

    /// Drives timers: heartbeats on a Primary, elections elsewhere.
    ///
    /// Call periodically, at least as often as `heartbeat_interval`.
    ///
    /// # Errors
    ///
    /// Returns storage errors from persisting election state or commits.
    pub fn tick(&self) -> CoreResult<()> {
        let now = Instant::now();
        let (round_due, election_due) = {
            let state = self.state.lock();
            (
                state.round_due(now, self.config.heartbeat_interval),
                state.election_due(now),
            )
        };

        if round_due {
            if let Some(_round) = self.replication_lock.try_lock() {
                let deadline = now + self.config.heartbeat_interval;
                match self.replicate_round(None, deadline) {
                    Ok(()) | Err(CoreError::Unavailable { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        } else if election_due {
            self.campaign()?;
        }
        Ok(())
    }

    /// Accepts `leader` as Primary of `term` unless the term is stale.
    ///
    /// Returns the replica's current term and whether the leader was accepted.
    fn accept_leader(&self, term: Term, leader: ReplicaId) -> CoreResult<(Term, bool)> {
        let mut state = self.state.lock();
        if term < state.term {
            return Ok((state.term, false));
        }
        if term > state.term {
            self.enter_term(&mut state, term, Some(leader))?;
        } else if state.role == Role::Primary {
            warn!(
                replica = self.id().as_u32(),
                other = leader.as_u32(),
                term = term.as_u64(),
                "second primary claims the same term"
            );
            return Ok((state.term, false));
        }
        state.role = Role::Secondary;
        state.leader = Some(leader);
        state.reset_election_timer(jittered(self.config.election_timeout));
        Ok((state.term, true))
    }

    fn handle_append(&self, request: AppendRequest) -> CoreResult<ReplicationMessage> {
        let _append = self.append_lock.lock();
        let replica = self.id().as_u32();
        let (term, accepted) =
            self.accept_leader(Term::new(request.term), ReplicaId::new(request.leader))?;
        let reject = |last_seq: CommitSeq| {
            ReplicationMessage::AppendAck(AppendAck {
                term: term.as_u64(),
                replica,
                success: false,
                last_seq: last_seq.as_u64(),
            })
        };
        if !accepted {
            return Ok(reject(self.log.last_seq()));
        }

        let prev_seq = CommitSeq::new(request.prev_seq);
        if self.log.term_at(prev_seq) != Some(Term::new(request.prev_term)) {
            let last = self.log.last_seq();
            let hint = if prev_seq > last { last } else { prev_seq.prev() };
            debug!(
                replica,
                prev_seq = prev_seq.as_u64(),
                hint = hint.as_u64(),
                "log mismatch"
            );
            return Ok(reject(hint));
        }

        let carries_whole_log = request.records.is_empty();
        let mut seq = prev_seq;
        for wire in request.records {
            let record = LogRecord::from(wire);
            seq = seq.next();
            if record.sequence != seq {
                return Err(CoreError::invalid_argument(format!(
                    "append batch skips from {} to {}",
                    seq.prev(),
                    record.sequence
                )));
            }
            match self.log.term_at(seq) {
                Some(existing) if existing == record.term => continue,
                Some(_) => self.truncate_suffix(seq.prev())?,
                None => {}
            }
            self.log.append_replicated(&record)?;
            self.pending.write().insert(seq, record);
            self.stats.record_append();
        }

        // An empty append ends at the Primary's last record. Records past it
        // from older terms never reached the Primary and can never commit.
        if carries_whole_log
            && self
                .log
                .term_at(seq.next())
                .is_some_and(|stale| stale < term)
        {
            debug!(replica, after = seq.as_u64(), "dropping stale suffix");
            self.truncate_suffix(seq)?;
        }

        self.advance_commit(CommitSeq::new(request.commit_seq).min(seq))?;
        Ok(ReplicationMessage::AppendAck(AppendAck {
            term: term.as_u64(),
            replica,
            success: true,
            last_seq: seq.as_u64(),
        }))
    }

    fn handle_heartbeat(&self, heartbeat: Heartbeat) -> CoreResult<ReplicationMessage> {
        let (term, accepted) =
            self.accept_leader(Term::new(heartbeat.term), ReplicaId::new(heartbeat.leader))?;
        if accepted {
            self.advance_commit(CommitSeq::new(heartbeat.commit_seq).min(self.log.last_seq()))?;
        }
        Ok(ReplicationMessage::HeartbeatAck(HeartbeatAck {
            term: term.as_u64(),
            replica: self.id().as_u32(),
            last_seq: self.log.last_seq().as_u64(),
        }))
    }

    fn handle_vote(&self, request: VoteRequest) -> CoreResult<ReplicationMessage> {
        let term = Term::new(request.term);
        let candidate = ReplicaId::new(request.candidate);
        let mut state = self.state.lock();
        if term > state.term {
            self.enter_term(&mut state, term, None)?;
        }

        let granted = if term < state.term {
            false
        } else {
            let free = self
                .log
                .election()
                .voted_for
                .map_or(true, |voted| voted == candidate);
            let up_to_date = (Term::new(request.last_term), CommitSeq::new(request.last_seq))
                >= (self.log.last_term(), self.log.last_seq());
            if free && up_to_date {
                self.log.record_election(ElectionState {
                    term,
                    voted_for: Some(candidate),
                })?;
                state.reset_election_timer(jittered(self.config.election_timeout));
                true
            } else {
                false
            }
        };
        debug!(
            replica = self.id().as_u32(),
            candidate = candidate.as_u32(),
            term = term.as_u64(),
            granted,
            "vote requested"
        );

        Ok(ReplicationMessage::VoteGrant(VoteGrant {
            term: state.term.as_u64(),
            replica: self.id().as_u32(),
            granted,
        }))
    }
}

impl MessageHandler for ReplicationCoordinator {
    fn handle(&self, message: ReplicationMessage) -> CoreResult<ReplicationMessage> {
        match message {
            ReplicationMessage::AppendRequest(request) => self.handle_append(request),
            ReplicationMessage::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat),
            ReplicationMessage::VoteRequest(request) => self.handle_vote(request),
            other => Err(CoreError::invalid_argument(format!(
                "message type {} is not a request",
                other.type_code()
            ))),
        }
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReplicationCoordinator")
            .field("replica", &self.cluster.replica_id)
            .field("role", &state.role)
            .field("term", &state.term)
            .field("leader", &state.leader)
            .field("commit_seq", &self.store.applied_seq())
            .finish_non_exhaustive()
    }
}

/// Base timeout plus a random share of up to the same amount.
fn jittered(base: Duration) -> Duration {
    let base_micros = u64::try_from(base.as_micros()).unwrap_or(u64::MAX);
    if base_micros == 0 {
        return base;
    }
    base + Duration::from_micros(rand::thread_rng().gen_range(0..=base_micros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::LoopbackNetwork;
    use quorumdb_storage::InMemoryBackend;

    struct Node {
        coordinator: Arc<ReplicationCoordinator>,
        store: Arc<CollectionStore>,
        log: Arc<Log>,
    }

    fn config() -> Config {
        Config::new()
            .replication_timeout(Duration::from_millis(300))
            .heartbeat_interval(Duration::from_millis(20))
            .election_timeout(Duration::from_millis(200))
    }

    fn node(network: &LoopbackNetwork, id: u32, size: u32) -> Node {
        let log = Arc::new(Log::open(Box::new(InMemoryBackend::new()), true).unwrap());
        let store = Arc::new(CollectionStore::new());
        let coordinator = Arc::new(
            ReplicationCoordinator::new(
                config(),
                ClusterConfig::with_size(ReplicaId::new(id), size),
                Arc::clone(&log),
                Arc::clone(&store),
                network.transport_for(ReplicaId::new(id)),
                Arc::new(EngineStats::new()),
            )
            .unwrap(),
        );
        let handler: Arc<dyn MessageHandler> = coordinator.clone();
        network.register(ReplicaId::new(id), &handler);
        Node {
            coordinator,
            store,
            log,
        }
    }

    fn write(key: &str, value: u8) -> Vec<LogWrite> {
        vec![LogWrite {
            collection: "counters".into(),
            key: key.as_bytes().to_vec(),
            value: Some(vec![value]),
        }]
    }

    fn commit(node: &Node, key: &str, value: u8) -> CoreResult<CommitSeq> {
        let record = node
            .coordinator
            .propose(TransactionId::new(1), write(key, value), |_| Ok(()))?;
        node.coordinator.await_commit(&record)
    }

    #[test]
    fn single_replica_commits_alone() {
        let network = LoopbackNetwork::new();
        let solo = node(&network, 0, 1);
        assert!(solo.coordinator.campaign().unwrap());
        assert!(solo.coordinator.is_ready());

        assert_eq!(commit(&solo, "hits", 1).unwrap(), CommitSeq::new(1));
        assert_eq!(solo.store.applied_seq(), CommitSeq::new(1));
        assert_eq!(solo.log.durable_commit(), CommitSeq::new(1));
    }

    #[test]
    fn secondary_rejects_writes() {
        let network = LoopbackNetwork::new();
        let nodes: Vec<_> = (0..3).map(|id| node(&network, id, 3)).collect();
        assert!(nodes[0].coordinator.campaign().unwrap());

        let err = commit(&nodes[1], "hits", 1).unwrap_err();
        assert!(matches!(
            err,
            CoreError::NotPrimary {
                leader: Some(ReplicaId(0))
            }
        ));
    }

    #[test]
    fn three_replicas_replicate_and_apply() {
        let network = LoopbackNetwork::new();
        let nodes: Vec<_> = (0..3).map(|id| node(&network, id, 3)).collect();
        assert!(nodes[0].coordinator.campaign().unwrap());
        assert_eq!(nodes[1].coordinator.leader(), Some(ReplicaId::new(0)));

        assert_eq!(commit(&nodes[0], "hits", 1).unwrap(), CommitSeq::new(1));
        assert_eq!(commit(&nodes[0], "hits", 2).unwrap(), CommitSeq::new(2));

        // Secondaries learn the commit watermark on the next round.
        nodes[0].coordinator.tick().unwrap();
        thread::sleep(Duration::from_millis(30));
        nodes[0].coordinator.tick().unwrap();
        for secondary in &nodes[1..] {
            assert_eq!(secondary.log.last_seq(), CommitSeq::new(2));
            assert_eq!(secondary.store.applied_seq(), CommitSeq::new(2));
            assert_eq!(secondary.coordinator.role(), Role::Secondary);
        }
    }

    #[test]
    fn no_quorum_is_unavailable_and_stays_pending() {
        let network = LoopbackNetwork::new();
        let nodes: Vec<_> = (0..3).map(|id| node(&network, id, 3)).collect();
        assert!(nodes[0].coordinator.campaign().unwrap());

        network.disconnect(ReplicaId::new(1));
        network.disconnect(ReplicaId::new(2));
        let err = commit(&nodes[0], "hits", 1).unwrap_err();
        assert!(matches!(err, CoreError::Unavailable { .. }));
        assert_eq!(nodes[0].store.applied_seq(), CommitSeq::ZERO);
        assert_eq!(nodes[0].coordinator.pending_count(), 1);

        // Heartbeat ticks retry the pending record once peers return.
        network.reconnect(ReplicaId::new(1));
        thread::sleep(Duration::from_millis(30));
        nodes[0].coordinator.tick().unwrap();
        assert_eq!(nodes[0].store.applied_seq(), CommitSeq::new(1));
        assert_eq!(nodes[0].coordinator.pending_count(), 0);
    }

    #[test]
    fn voter_grants_once_per_term() {
        let network = LoopbackNetwork::new();
        let voter = node(&network, 2, 3);
        let ask = |candidate: u32| {
            voter
                .coordinator
                .handle(ReplicationMessage::VoteRequest(VoteRequest {
                    term: 1,
                    candidate,
                    last_seq: 0,
                    last_term: 0,
                }))
                .unwrap()
        };

        let granted = |reply: ReplicationMessage| match reply {
            ReplicationMessage::VoteGrant(grant) => grant.granted,
            _ => panic!("expected a vote grant"),
        };
        assert!(granted(ask(0)));
        assert!(granted(ask(0)));
        assert!(!granted(ask(1)));
        assert_eq!(voter.log.election().voted_for, Some(ReplicaId::new(0)));
    }

    #[test]
    fn stale_candidate_log_is_refused() {
        let network = LoopbackNetwork::new();
        let voter = node(&network, 1, 3);
        voter
            .log
            .append(Term::new(2), TransactionId::new(1), write("a", 1))
            .unwrap();

        let reply = voter
            .coordinator
            .handle(ReplicationMessage::VoteRequest(VoteRequest {
                term: 3,
                candidate: 0,
                last_seq: 5,
                last_term: 1,
            }))
            .unwrap();
        assert!(matches!(
            reply,
            ReplicationMessage::VoteGrant(VoteGrant {
                term: 3,
                granted: false,
                ..
            })
        ));
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        let network = LoopbackNetwork::new();
        let follower = node(&network, 1, 3);
        follower
            .log
            .append(Term::new(1), TransactionId::new(1), write("a", 1))
            .unwrap();
        follower
            .log
            .append(Term::new(1), TransactionId::new(2), write("a", 2))
            .unwrap();

        let replacement = LogRecord {
            sequence: CommitSeq::new(2),
            term: Term::new(2),
            txid: TransactionId::BARRIER,
            writes: Vec::new(),
        };
        let reply = follower
            .coordinator
            .handle(ReplicationMessage::AppendRequest(AppendRequest {
                term: 2,
                leader: 0,
                prev_seq: 1,
                prev_term: 1,
                records: vec![WireRecord::from(&replacement)],
                commit_seq: 2,
            }))
            .unwrap();

        assert!(matches!(
            reply,
            ReplicationMessage::AppendAck(AppendAck {
                success: true,
                last_seq: 2,
                ..
            })
        ));
        assert_eq!(follower.log.term_at(CommitSeq::new(2)), Some(Term::new(2)));
        assert_eq!(follower.store.applied_seq(), CommitSeq::new(2));
        assert_eq!(follower.coordinator.leader(), Some(ReplicaId::new(0)));
    }

    fn empty_append(term: u64, prev_seq: u64, prev_term: u64, commit_seq: u64) -> AppendRequest {
        AppendRequest {
            term,
            leader: 0,
            prev_seq,
            prev_term,
            records: Vec::new(),
            commit_seq,
        }
    }

    #[test]
    fn empty_append_drops_older_term_suffix() {
        let network = LoopbackNetwork::new();
        let follower = node(&network, 1, 3);
        for (txid, value) in [(1, 1), (2, 2)] {
            follower
                .log
                .append(Term::new(1), TransactionId::new(txid), write("a", value))
                .unwrap();
        }

        // The Primary of term 2 ends at sequence 1.
        let reply = follower
            .coordinator
            .handle(ReplicationMessage::AppendRequest(empty_append(2, 1, 1, 1)))
            .unwrap();

        assert!(matches!(
            reply,
            ReplicationMessage::AppendAck(AppendAck {
                success: true,
                last_seq: 1,
                ..
            })
        ));
        assert_eq!(follower.log.last_seq(), CommitSeq::new(1));
        assert_eq!(follower.store.applied_seq(), CommitSeq::new(1));
        assert_eq!(follower.coordinator.pending_count(), 0);
    }

    #[test]
    fn late_empty_append_keeps_current_term_records() {
        let network = LoopbackNetwork::new();
        let follower = node(&network, 1, 3);
        follower
            .log
            .append(Term::new(1), TransactionId::new(1), write("a", 1))
            .unwrap();
        let newer = LogRecord {
            sequence: CommitSeq::new(2),
            term: Term::new(2),
            txid: TransactionId::new(2),
            writes: write("a", 2),
        };
        follower
            .coordinator
            .handle(ReplicationMessage::AppendRequest(AppendRequest {
                records: vec![WireRecord::from(&newer)],
                ..empty_append(2, 1, 1, 0)
            }))
            .unwrap();

        // Sent before sequence 2 existed, delivered after it.
        follower
            .coordinator
            .handle(ReplicationMessage::AppendRequest(empty_append(2, 1, 1, 1)))
            .unwrap();
        assert_eq!(follower.log.last_seq(), CommitSeq::new(2));
        assert_eq!(follower.log.term_at(CommitSeq::new(2)), Some(Term::new(2)));
    }

    #[test]
    fn caught_up_secondaries_learn_commit_without_new_writes() {
        let network = LoopbackNetwork::new();
        let nodes: Vec<_> = (0..3).map(|id| node(&network, id, 3)).collect();
        assert!(nodes[0].coordinator.campaign().unwrap());
        commit(&nodes[0], "hits", 1).unwrap();
        thread::sleep(Duration::from_millis(30));

        // Only replica 1 hears that sequence 1 committed.
        network.disconnect(ReplicaId::new(2));
        nodes[0].coordinator.tick().unwrap();
        assert_eq!(nodes[1].store.applied_seq(), CommitSeq::new(1));
        assert_eq!(nodes[2].store.applied_seq(), CommitSeq::ZERO);

        // Its log is fully committed, so it takes over without a barrier.
        network.reconnect(ReplicaId::new(2));
        network.disconnect(ReplicaId::new(0));
        assert!(nodes[1].coordinator.campaign().unwrap());
        assert_eq!(nodes[1].log.last_seq(), CommitSeq::new(1));
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(30));
            nodes[1].coordinator.tick().unwrap();
        }

        assert_eq!(nodes[2].coordinator.leader(), Some(ReplicaId::new(1)));
        assert_eq!(nodes[2].store.applied_seq(), CommitSeq::new(1));
    }

    #[test]
    fn mismatched_prev_is_rejected_with_hint() {
        let network = LoopbackNetwork::new();
        let follower = node(&network, 1, 3);
        let reply = follower
            .coordinator
            .handle(ReplicationMessage::AppendRequest(AppendRequest {
                term: 1,
                leader: 0,
                prev_seq: 4,
                prev_term: 1,
                records: Vec::new(),
                commit_seq: 0,
            }))
            .unwrap();
        assert!(matches!(
            reply,
            ReplicationMessage::AppendAck(AppendAck {
                success: false,
                last_seq: 0,
                ..
            })
        ));
    }

    #[test]
    fn higher_term_makes_primary_step_down() {
        let network = LoopbackNetwork::new();
        let nodes: Vec<_> = (0..3).map(|id| node(&network, id, 3)).collect();
        assert!(nodes[0].coordinator.campaign().unwrap());

        nodes[0]
            .coordinator
            .handle(ReplicationMessage::Heartbeat(Heartbeat {
                term: 9,
                leader: 2,
                commit_seq: 0,
            }))
            .unwrap();
        assert_eq!(nodes[0].coordinator.role(), Role::Secondary);
        assert_eq!(nodes[0].coordinator.term(), Term::new(9));
        assert_eq!(nodes[0].coordinator.leader(), Some(ReplicaId::new(2)));
    }

    #[test]
    fn responses_are_not_requests() {
        let network = LoopbackNetwork::new();
        let solo = node(&network, 0, 1);
        let result = solo.coordinator.handle(ReplicationMessage::VoteGrant(VoteGrant {
            term: 1,
            replica: 1,
            granted: true,
        }));
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }
}
