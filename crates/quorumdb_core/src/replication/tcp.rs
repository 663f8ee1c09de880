//! TCP transport: length-prefixed frames of encoded envelopes.
//!
//! ```text
//! | length u32 LE | envelope bytes (length) |
//! ```
//!
//! One request frame is answered by exactly one response frame on the same
//! connection. Frames above [`MAX_FRAME_SIZE`] are refused.

use crate::error::{CoreError, CoreResult};
use crate::replication::transport::{MessageHandler, ReplicaTransport};
use crate::types::ReplicaId;
use parking_lot::Mutex;
use quorumdb_protocol::{
    decode_message, encode_message, ProtocolError, ReplicationMessage, MAX_FRAME_SIZE,
};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often idle server threads check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bound on reading the rest of a frame once its first byte arrived.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes one frame.
///
/// # Errors
///
/// Returns `Protocol(FrameTooLarge)` for oversized payloads and I/O errors
/// from the stream.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> CoreResult<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        }
        .into());
    }
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        limit: MAX_FRAME_SIZE,
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// # Errors
///
/// Returns `Protocol(FrameTooLarge)` if the announced length is above the
/// limit, and I/O errors (including `UnexpectedEof` on a closed stream).
pub fn read_frame<R: Read>(reader: &mut R) -> CoreResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        }
        .into());
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Client side: reaches peers by socket address.
///
/// Keeps one idle connection per peer and reconnects after any failure.
pub struct TcpTransport {
    peers: HashMap<ReplicaId, SocketAddr>,
    idle: Mutex<HashMap<ReplicaId, TcpStream>>,
}

impl TcpTransport {
    /// Creates a transport for the given peer addresses.
    #[must_use]
    pub fn new(peers: HashMap<ReplicaId, SocketAddr>) -> Self {
        Self {
            peers,
            idle: Mutex::new(HashMap::new()),
        }
    }

    fn connect(&self, to: ReplicaId, timeout: Duration) -> CoreResult<TcpStream> {
        if let Some(stream) = self.idle.lock().remove(&to) {
            return Ok(stream);
        }
        let addr = self
            .peers
            .get(&to)
            .ok_or_else(|| CoreError::invalid_argument(format!("no address for {to}")))?;
        let stream = TcpStream::connect_timeout(addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn exchange(
        stream: &mut TcpStream,
        message: &ReplicationMessage,
        timeout: Duration,
    ) -> CoreResult<ReplicationMessage> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        write_frame(stream, &encode_message(message)?)?;
        let frame = read_frame(stream)?;
        Ok(decode_message(&frame)?)
    }
}

impl ReplicaTransport for TcpTransport {
    fn send(
        &self,
        to: ReplicaId,
        message: &ReplicationMessage,
        timeout: Duration,
    ) -> CoreResult<ReplicationMessage> {
        let timeout = timeout.max(Duration::from_millis(1));
        let mut stream = self
            .connect(to, timeout)
            .map_err(|e| CoreError::unavailable(format!("{to} unreachable: {e}")))?;
        match Self::exchange(&mut stream, message, timeout) {
            Ok(reply) => {
                self.idle.lock().insert(to, stream);
                Ok(reply)
            }
            Err(CoreError::Io(e)) => Err(CoreError::unavailable(format!("{to}: {e}"))),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

/// Server side: accepts peer connections and feeds requests to a handler.
///
/// Each connection gets its own thread. Dropping the server stops accepting
/// and lets connection threads wind down.
pub struct ReplicaServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl ReplicaServer {
    /// Binds `addr` and starts serving `handler`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub fn bind<A: ToSocketAddrs>(addr: A, handler: Arc<dyn MessageHandler>) -> CoreResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("replica-server-{}", local_addr.port()))
                .spawn(move || accept_loop(&listener, &handler, &shutdown))?
        };
        info!(%local_addr, "replica server listening");

        Ok(Self {
            local_addr,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    /// Address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the accept thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("replica server accept thread panicked");
            }
        }
    }
}

impl Drop for ReplicaServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReplicaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaServer")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

fn accept_loop(
    listener: &TcpListener,
    handler: &Arc<dyn MessageHandler>,
    shutdown: &Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let handler = Arc::clone(handler);
                let shutdown = Arc::clone(shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("replica-conn-{peer}"))
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, handler.as_ref(), &shutdown) {
                            debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(%peer, error = %e, "could not spawn connection thread");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("replica server stopped accepting");
}

fn serve_connection(
    mut stream: TcpStream,
    handler: &dyn MessageHandler,
    shutdown: &AtomicBool,
) -> CoreResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut first_byte = [0u8; 1];
    while !shutdown.load(Ordering::SeqCst) {
        // Wait for the start of a frame without consuming it.
        match stream.peek(&mut first_byte) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if is_idle(&e) => continue,
            Err(e) => return Err(e.into()),
        }

        stream.set_read_timeout(Some(FRAME_READ_TIMEOUT))?;
        let frame = read_frame(&mut stream)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;

        let response = handler.handle(decode_message(&frame)?)?;
        write_frame(&mut stream, &encode_message(&response)?)?;
    }
    Ok(())
}

fn is_idle(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumdb_protocol::{VoteGrant, VoteRequest};
    use std::io::Cursor;

    struct AlwaysGrant;

    impl MessageHandler for AlwaysGrant {
        fn handle(&self, message: ReplicationMessage) -> CoreResult<ReplicationMessage> {
            match message {
                ReplicationMessage::VoteRequest(request) => {
                    Ok(ReplicationMessage::VoteGrant(VoteGrant {
                        term: request.term,
                        replica: 1,
                        granted: true,
                    }))
                }
                _ => Err(CoreError::invalid_argument("unexpected")),
            }
        }
    }

    fn vote_request(term: u64) -> ReplicationMessage {
        ReplicationMessage::VoteRequest(VoteRequest {
            term,
            candidate: 0,
            last_seq: 3,
            last_term: 1,
        })
    }

    #[test]
    fn frame_roundtrip_in_memory() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"payload").unwrap();
        assert_eq!(&buffer[..4], &7u32.to_le_bytes());

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"payload");
    }

    #[test]
    fn oversized_frame_rejected_on_read() {
        let mut bytes = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let result = read_frame(&mut Cursor::new(bytes));
        assert!(matches!(
            result,
            Err(CoreError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[test]
    fn truncated_frame_is_io_error() {
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            read_frame(&mut Cursor::new(bytes)),
            Err(CoreError::Io(_))
        ));
    }

    #[test]
    fn request_response_over_tcp() {
        let server = ReplicaServer::bind("127.0.0.1:0", Arc::new(AlwaysGrant)).unwrap();
        let transport = TcpTransport::new(HashMap::from([(ReplicaId::new(1), server.local_addr())]));
        let pooled_port = || {
            transport.idle.lock()[&ReplicaId::new(1)]
                .local_addr()
                .unwrap()
                .port()
        };

        let mut ports = Vec::new();
        for term in 1..=3 {
            let reply = transport
                .send(ReplicaId::new(1), &vote_request(term), Duration::from_secs(2))
                .unwrap();
            assert_eq!(
                reply,
                ReplicationMessage::VoteGrant(VoteGrant {
                    term,
                    replica: 1,
                    granted: true
                })
            );
            ports.push(pooled_port());
        }

        // Every request went over the one pooled connection.
        assert!(ports.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(transport.idle.lock().len(), 1);
    }

    #[test]
    fn unknown_peer_and_closed_server_are_errors() {
        let transport = TcpTransport::new(HashMap::new());
        assert!(transport
            .send(ReplicaId::new(5), &vote_request(1), Duration::from_millis(100))
            .is_err());

        let mut server = ReplicaServer::bind("127.0.0.1:0", Arc::new(AlwaysGrant)).unwrap();
        let addr = server.local_addr();
        server.shutdown();
        drop(server);

        let transport = TcpTransport::new(HashMap::from([(ReplicaId::new(1), addr)]));
        let result = transport.send(ReplicaId::new(1), &vote_request(1), Duration::from_millis(200));
        assert!(matches!(result, Err(CoreError::Unavailable { .. })));
    }
}
