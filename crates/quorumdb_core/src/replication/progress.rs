//! Per-peer replication progress and quorum arithmetic.

use crate::error::CoreResult;
use crate::types::{CommitSeq, Term};
use quorumdb_protocol::ReplicationMessage;
use std::time::Instant;
use tracing::debug;

/// What the Primary knows about one Secondary's log.
#[derive(Debug, Clone)]
pub(crate) struct PeerProgress {
    /// Term these numbers belong to; replies from older terms are ignored.
    pub term: Term,
    /// Next sequence to ship.
    pub next_seq: CommitSeq,
    /// Highest sequence known to match the Primary's log.
    pub match_seq: CommitSeq,
    /// An append in this term succeeded, so `match_seq` is confirmed and the
    /// peer holds nothing past it that the Primary lacks.
    pub matched: bool,
    /// A request is outstanding; no second one is sent until it resolves.
    pub in_flight: bool,
    pub last_contact: Option<Instant>,
}

/// What a request to a peer carried, for interpreting its reply.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Sent {
    Append { prev_seq: CommitSeq },
    Heartbeat,
}

/// Outcome of one peer reply, reported to the waiting round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerEvent {
    /// The peer answered; its progress may have moved.
    Answered,
    /// The peer could not be reached.
    Unreachable,
    /// The peer is in a newer term.
    HigherTerm(Term),
}

impl PeerProgress {
    pub fn new(term: Term, next_seq: CommitSeq) -> Self {
        Self {
            term,
            next_seq,
            match_seq: CommitSeq::ZERO,
            matched: false,
            in_flight: false,
            last_contact: None,
        }
    }

    /// Folds a reply to a request sent in `term` into the progress.
    pub fn on_reply(
        &mut self,
        term: Term,
        sent: Sent,
        reply: CoreResult<ReplicationMessage>,
    ) -> PeerEvent {
        if self.term == term {
            self.in_flight = false;
        }
        let message = match reply {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "peer unreachable");
                return PeerEvent::Unreachable;
            }
        };

        let reply_term = Term::new(message.term());
        if reply_term > term {
            return PeerEvent::HigherTerm(reply_term);
        }
        if self.term != term {
            return PeerEvent::Answered;
        }
        self.last_contact = Some(Instant::now());

        match (message, sent) {
            (ReplicationMessage::AppendAck(ack), Sent::Append { prev_seq }) => {
                let last = CommitSeq::new(ack.last_seq);
                if ack.success {
                    self.matched = true;
                    self.match_seq = self.match_seq.max(last);
                    self.next_seq = self.match_seq.next();
                } else {
                    // Walk back, at least one step, never below the start.
                    self.next_seq = last.next().min(prev_seq).max(CommitSeq::new(1));
                }
            }
            (ReplicationMessage::HeartbeatAck(ack), Sent::Heartbeat) => {
                let resume = CommitSeq::new(ack.last_seq).next().max(self.match_seq.next());
                self.next_seq = self.next_seq.min(resume);
            }
            (other, _) => {
                debug!(type_code = other.type_code(), "unexpected reply from peer");
            }
        }
        PeerEvent::Answered
    }
}

/// Highest sequence held by a majority, the Primary included.
///
/// `own_last` counts as durable because the Primary flushes before it ships.
#[must_use]
pub fn quorum_seq(own_last: CommitSeq, peer_matches: &[CommitSeq], majority: usize) -> CommitSeq {
    let mut matches = Vec::with_capacity(peer_matches.len() + 1);
    matches.push(own_last);
    matches.extend_from_slice(peer_matches);
    matches.sort_unstable_by(|a, b| b.cmp(a));
    majority
        .checked_sub(1)
        .and_then(|index| matches.get(index).copied())
        .unwrap_or(CommitSeq::ZERO)
}
