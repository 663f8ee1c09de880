//! Transport abstraction for replica-to-replica messages.

use crate::error::{CoreError, CoreResult};
use crate::types::ReplicaId;
use parking_lot::RwLock;
use quorumdb_protocol::{decode_message, encode_message, ReplicationMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Sends a request to another replica and waits for its answer.
///
/// This trait abstracts the network layer so the coordinator runs unchanged
/// over TCP or in-process.
pub trait ReplicaTransport: Send + Sync {
    /// Delivers `message` to replica `to` and returns its response.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the replica cannot be reached within `timeout`.
    fn send(
        &self,
        to: ReplicaId,
        message: &ReplicationMessage,
        timeout: Duration,
    ) -> CoreResult<ReplicationMessage>;
}

/// Receives requests from other replicas.
pub trait MessageHandler: Send + Sync {
    /// Handles one request and produces its response.
    ///
    /// # Errors
    ///
    /// Returns an error for messages that are not requests, or when local
    /// storage fails while handling the request.
    fn handle(&self, message: ReplicationMessage) -> CoreResult<ReplicationMessage>;
}

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<ReplicaId, Weak<dyn MessageHandler>>,
    down: HashSet<ReplicaId>,
}

/// In-process network connecting replicas in one process.
///
/// Every message is encoded and decoded through the wire codec, so tests
/// exercise the same bytes a TCP deployment would. Replicas can be taken
/// down and brought back to simulate crashes and partitions.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `handler` as replica `id`, replacing any previous handler.
    ///
    /// The network holds the handler weakly; dropping the replica makes it
    /// unreachable.
    pub fn register(&self, id: ReplicaId, handler: &Arc<dyn MessageHandler>) {
        self.state
            .write()
            .handlers
            .insert(id, Arc::downgrade(handler));
    }

    /// Returns the transport replica `from` uses to reach its peers.
    #[must_use]
    pub fn transport_for(&self, from: ReplicaId) -> Arc<dyn ReplicaTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
            from,
        })
    }

    /// Cuts replica `id` off: nothing reaches it and nothing it sends arrives.
    pub fn disconnect(&self, id: ReplicaId) {
        self.state.write().down.insert(id);
    }

    /// Undoes [`Self::disconnect`].
    pub fn reconnect(&self, id: ReplicaId) {
        self.state.write().down.remove(&id);
    }

    /// Returns true if `id` is currently cut off.
    #[must_use]
    pub fn is_disconnected(&self, id: ReplicaId) -> bool {
        self.state.read().down.contains(&id)
    }

    fn deliver(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        message: &ReplicationMessage,
    ) -> CoreResult<ReplicationMessage> {
        let handler = {
            let state = self.state.read();
            if state.down.contains(&from) || state.down.contains(&to) {
                return Err(CoreError::unavailable(format!("{to} unreachable from {from}")));
            }
            state.handlers.get(&to).and_then(Weak::upgrade)
        };
        let handler =
            handler.ok_or_else(|| CoreError::unavailable(format!("{to} is not running")))?;

        let request = decode_message(&encode_message(message)?)?;
        let response = handler.handle(request)?;
        Ok(decode_message(&encode_message(&response)?)?)
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        let mut replicas: Vec<_> = state.handlers.keys().copied().collect();
        replicas.sort_unstable();
        f.debug_struct("LoopbackNetwork")
            .field("replicas", &replicas)
            .field("down", &state.down)
            .finish()
    }
}

struct LoopbackTransport {
    network: LoopbackNetwork,
    from: ReplicaId,
}

impl ReplicaTransport for LoopbackTransport {
    fn send(
        &self,
        to: ReplicaId,
        message: &ReplicationMessage,
        _timeout: Duration,
    ) -> CoreResult<ReplicationMessage> {
        self.network.deliver(self.from, to, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumdb_protocol::{Heartbeat, HeartbeatAck};

    struct Echo(u32);

    impl MessageHandler for Echo {
        fn handle(&self, message: ReplicationMessage) -> CoreResult<ReplicationMessage> {
            match message {
                ReplicationMessage::Heartbeat(hb) => {
                    Ok(ReplicationMessage::HeartbeatAck(HeartbeatAck {
                        term: hb.term,
                        replica: self.0,
                        last_seq: hb.commit_seq,
                    }))
                }
                _ => Err(CoreError::invalid_argument("not a heartbeat")),
            }
        }
    }

    fn heartbeat() -> ReplicationMessage {
        ReplicationMessage::Heartbeat(Heartbeat {
            term: 2,
            leader: 0,
            commit_seq: 11,
        })
    }

    #[test]
    fn delivers_through_codec() {
        let network = LoopbackNetwork::new();
        let echo: Arc<dyn MessageHandler> = Arc::new(Echo(1));
        network.register(ReplicaId::new(1), &echo);

        let reply = network
            .transport_for(ReplicaId::new(0))
            .send(ReplicaId::new(1), &heartbeat(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            reply,
            ReplicationMessage::HeartbeatAck(HeartbeatAck {
                term: 2,
                replica: 1,
                last_seq: 11
            })
        );
    }

    #[test]
    fn disconnected_replicas_are_unreachable_both_ways() {
        let network = LoopbackNetwork::new();
        let a: Arc<dyn MessageHandler> = Arc::new(Echo(0));
        let b: Arc<dyn MessageHandler> = Arc::new(Echo(1));
        network.register(ReplicaId::new(0), &a);
        network.register(ReplicaId::new(1), &b);

        network.disconnect(ReplicaId::new(1));
        let timeout = Duration::from_secs(1);
        let to_b = network
            .transport_for(ReplicaId::new(0))
            .send(ReplicaId::new(1), &heartbeat(), timeout);
        let from_b = network
            .transport_for(ReplicaId::new(1))
            .send(ReplicaId::new(0), &heartbeat(), timeout);
        assert!(matches!(to_b, Err(CoreError::Unavailable { .. })));
        assert!(matches!(from_b, Err(CoreError::Unavailable { .. })));

        network.reconnect(ReplicaId::new(1));
        assert!(network
            .transport_for(ReplicaId::new(0))
            .send(ReplicaId::new(1), &heartbeat(), timeout)
            .is_ok());
    }

    #[test]
    fn dropped_handler_is_unreachable() {
        let network = LoopbackNetwork::new();
        let echo: Arc<dyn MessageHandler> = Arc::new(Echo(1));
        network.register(ReplicaId::new(1), &echo);
        drop(echo);

        let result = network.transport_for(ReplicaId::new(0)).send(
            ReplicaId::new(1),
            &heartbeat(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(CoreError::Unavailable { .. })));
    }
}
