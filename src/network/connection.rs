//! Per-connection state machine.
//!
//! A [`Connection`] owns its outbound queue, inbound frame accumulator and
//! pending-request table. Only the listener's event loop touches it; the I/O
//! tasks report into the loop and never see this struct.
//!
//! Lifecycle: `Connecting -> Handshaking` on the first received byte,
//! `-> Ready` once the identity exchange succeeds, `-> Draining` on close with
//! data still queued, `-> Closed` when the queue empties or the transport fails.

use crate::error::{RequestFailure, SendError, TransportError};
use crate::events::model::LogLevel;
use crate::network::events::emit_network_event;
use crate::network::frame::{FrameAccumulator, FrameError};
use crate::network::handler::Handler;
use crate::network::message::{Envelope, MessageKind, PreparedMessage};
use crate::network::role::Role;
use crate::network::transport::TransportHandle;
use crate::security::secure_channel::AuthSummary;
use crate::store::ObjectChange;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub type RequestReply = Result<Value, RequestFailure>;
pub type ReplySender = oneshot::Sender<RequestReply>;

/// A request we sent and have not yet seen answered.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
    pub sent_at: Instant,
    reply: Option<ReplySender>,
}

impl PendingRequest {
    fn resolve(self, outcome: RequestReply) {
        if let Some(tx) = self.reply {
            let _ = tx.send(outcome);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_frame_bytes: usize,
    pub outbound_high_water_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    buffers: usize,
    bytes: usize,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub state: ConnectionState,
    pub role: Role,
    pub name: Option<String>,
    pub queued_bytes: usize,
    pub pending_requests: usize,
}

pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: ConnectionState,
    role: Role,
    peer_name: Option<String>,
    peer_domain: Option<String>,
    transport: Option<TransportHandle>,
    auth: Option<AuthSummary>,
    outbound: VecDeque<Bytes>,
    queued_bytes: usize,
    in_flight: Option<InFlight>,
    inbound: FrameAccumulator,
    pending_requests: HashMap<u64, PendingRequest>,
    next_request_id: u64,
    high_water: usize,
    last_activity: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, limits: ConnectionLimits) -> Self {
        Self {
            id,
            peer_addr,
            state: ConnectionState::Connecting,
            role: Role::NONE,
            peer_name: None,
            peer_domain: None,
            transport: None,
            auth: None,
            outbound: VecDeque::new(),
            queued_bytes: 0,
            in_flight: None,
            inbound: FrameAccumulator::new(limits.max_frame_bytes),
            pending_requests: HashMap::new(),
            next_request_id: 1,
            high_water: limits.outbound_high_water_bytes,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn peer_domain(&self) -> Option<&str> {
        self.peer_domain.as_deref()
    }

    pub fn auth(&self) -> Option<&AuthSummary> {
        self.auth.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    pub fn has_pending_method(&self, method: &str) -> bool {
        self.pending_requests.values().any(|p| p.method == method)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer_addr: self.peer_addr,
            state: self.state,
            role: self.role,
            name: self.peer_name.clone(),
            queued_bytes: self.queued_bytes,
            pending_requests: self.pending_requests.len(),
        }
    }

    /// Bind the transport once its handshake finished; queued data starts flowing.
    pub fn attach(&mut self, handle: TransportHandle, auth: AuthSummary) {
        if self.is_closed() {
            return;
        }
        self.transport = Some(handle);
        self.auth = Some(auth);
        self.try_flush();
    }

    pub(crate) fn complete_handshake(
        &mut self,
        name: Option<String>,
        domain: Option<String>,
        role: Role,
    ) {
        self.peer_name = name;
        self.peer_domain = domain;
        self.role = role;
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Handshaking
        ) {
            self.state = ConnectionState::Ready;
        }
    }

    /// Frame `msg` onto the outbound queue. Requests get the next id from this
    /// connection's counter and an entry in the pending-request table; the id
    /// is returned.
    pub fn enqueue(
        &mut self,
        msg: &PreparedMessage,
        reply: Option<ReplySender>,
    ) -> Result<Option<u64>, SendError> {
        if matches!(
            self.state,
            ConnectionState::Draining | ConnectionState::Closed
        ) {
            return Err(SendError::NotAccepting(self.id, self.state));
        }
        let request_id = (msg.kind == MessageKind::Request).then_some(self.next_request_id);
        let frame = msg.frame(request_id.map(Value::from).as_ref())?;

        let queued = self.queued_bytes + frame.len();
        if queued > self.high_water {
            let truncated = self.abort();
            emit_network_event(
                "connection",
                LogLevel::Warn,
                "high_water_disconnect",
                Some(self.peer_addr.to_string()),
                Some(format!("{} truncated={}B", self.id, truncated)),
            );
            return Err(SendError::HighWater {
                id: self.id,
                queued,
            });
        }

        if let Some(id) = request_id {
            self.next_request_id += 1;
            self.pending_requests.insert(
                id,
                PendingRequest {
                    method: msg.method.clone(),
                    sent_at: Instant::now(),
                    reply,
                },
            );
        }
        self.queued_bytes = queued;
        self.outbound.push_back(frame);
        self.try_flush();
        Ok(request_id)
    }

    /// Hand everything queued to the transport unless a write is outstanding.
    fn try_flush(&mut self) {
        if self.in_flight.is_some() || self.outbound.is_empty() {
            return;
        }
        let Some(transport) = &self.transport else {
            return;
        };
        let buffers: Vec<Bytes> = self.outbound.iter().cloned().collect();
        let count = buffers.len();
        match transport.send(buffers) {
            Ok(bytes) => {
                self.in_flight = Some(InFlight {
                    buffers: count,
                    bytes,
                })
            }
            Err(TransportError::WriteInProgress) => {}
            Err(e) => {
                emit_network_event(
                    "connection",
                    LogLevel::Warn,
                    "write_rejected",
                    Some(self.peer_addr.to_string()),
                    Some(format!("{}: {}", self.id, e)),
                );
                self.abort();
            }
        }
    }

    /// Completion of the outstanding write: exactly the buffers handed to it
    /// leave the head of the queue; anything queued meanwhile stays.
    pub fn on_write_complete(&mut self, bytes: usize) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        if bytes != flight.bytes {
            emit_network_event(
                "connection",
                LogLevel::Warn,
                "write_size_mismatch",
                Some(self.peer_addr.to_string()),
                Some(format!("{} expected={} written={}", self.id, flight.bytes, bytes)),
            );
        }
        for _ in 0..flight.buffers {
            if let Some(buf) = self.outbound.pop_front() {
                self.queued_bytes -= buf.len();
            }
        }
        if self.state == ConnectionState::Draining && self.outbound.is_empty() {
            self.mark_closed();
            return;
        }
        self.try_flush();
    }

    /// Feed received bytes; every complete frame is dispatched to `handler`.
    /// Returns the store changes made by the dispatched requests.
    pub fn on_receive_bytes(
        &mut self,
        data: &[u8],
        handler: &Handler,
    ) -> Result<Vec<ObjectChange>, FrameError> {
        if data.is_empty() || self.is_closed() {
            return Ok(Vec::new());
        }
        self.last_activity = Instant::now();
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Handshaking;
        }
        self.inbound.extend(data);

        let mut changes = Vec::new();
        while let Some(frame) = self.inbound.next_frame()? {
            match Envelope::parse(&frame) {
                Ok(env) if env.kind == MessageKind::Request => {
                    changes.extend(handler.on_request(self, env));
                }
                Ok(env) => handler.on_response(self, env),
                Err(e) => handler.on_parse_error(self, e),
            }
            if self.is_closed() {
                break;
            }
        }
        Ok(changes)
    }

    /// Resolve the pending request `id`. Unknown or repeated ids are logged
    /// and dropped; returns whether a waiter was found.
    pub fn complete_request(&mut self, id: Option<&Value>, outcome: RequestReply) -> bool {
        let pending = id
            .and_then(Value::as_u64)
            .and_then(|n| self.pending_requests.remove(&n));
        match pending {
            Some(p) => {
                p.resolve(outcome);
                true
            }
            None => {
                emit_network_event(
                    "connection",
                    LogLevel::Warn,
                    "unmatched_response",
                    Some(self.peer_addr.to_string()),
                    Some(format!("{} id={:?}", self.id, id)),
                );
                false
            }
        }
    }

    /// Fail requests older than `timeout`; returns how many expired.
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<u64> = self
            .pending_requests
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(p) = self.pending_requests.remove(id) {
                p.resolve(Err(RequestFailure::TimedOut));
            }
        }
        expired.len()
    }

    /// Idempotent. The first call drains queued data (or closes at once when
    /// nothing is queued); later calls do nothing. Returns whether this call
    /// changed state.
    pub fn close(&mut self) -> bool {
        match self.state {
            ConnectionState::Draining | ConnectionState::Closed => false,
            _ => {
                if self.outbound.is_empty() {
                    self.mark_closed();
                } else {
                    self.state = ConnectionState::Draining;
                }
                true
            }
        }
    }

    /// Hard close; returns the number of queued bytes that were discarded.
    pub fn abort(&mut self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let truncated = self.queued_bytes;
        self.outbound.clear();
        self.queued_bytes = 0;
        self.in_flight = None;
        self.mark_closed();
        truncated
    }

    fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
        // dropping the handle stops the reader and ends the writer
        self.transport = None;
        for (_, p) in self.pending_requests.drain() {
            p.resolve(Err(RequestFailure::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handler::{Handler, Identity};
    use crate::network::pending::PendingUpdates;
    use crate::network::transport::WriteQueue;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            max_frame_bytes: 1 << 20,
            outbound_high_water_bytes: 1 << 20,
        }
    }

    fn conn() -> Connection {
        Connection::new(ConnectionId::new(1), "127.0.0.1:9".parse().unwrap(), limits())
    }

    fn attached() -> (Connection, WriteQueue) {
        let mut c = conn();
        let (handle, queue, _stop) = TransportHandle::pair();
        c.attach(
            handle,
            AuthSummary {
                backend: crate::security::SecurityBackend::Plaintext,
                peer_certificates: 0,
                protocol: None,
            },
        );
        (c, queue)
    }

    fn handler() -> Handler {
        Handler::new(
            Arc::new(MemoryStore::new()),
            Identity::default(),
            PendingUpdates::shared(),
        )
    }

    fn echo() -> PreparedMessage {
        PreparedMessage::request("echo", json!([]))
    }

    #[test]
    fn close_twice_transitions_once() {
        let mut c = conn();
        assert!(c.close());
        assert_eq!(c.state(), ConnectionState::Closed);
        assert!(!c.close());
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_with_queued_data_drains_then_closes() {
        let (mut c, mut queue) = attached();
        c.enqueue(&echo(), None).unwrap();
        let written: usize = queue.try_next().unwrap().iter().map(Bytes::len).sum();

        assert!(c.close());
        assert_eq!(c.state(), ConnectionState::Draining);
        assert!(matches!(
            c.enqueue(&echo(), None),
            Err(SendError::NotAccepting(_, ConnectionState::Draining))
        ));

        queue.complete();
        c.on_write_complete(written);
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(c.queued_bytes(), 0);
    }

    #[test]
    fn completion_removes_only_the_in_flight_buffers() {
        let (mut c, mut queue) = attached();
        c.enqueue(&echo(), None).unwrap();
        let first = queue.try_next().unwrap();
        assert_eq!(first.len(), 1);

        // queued while the first write is outstanding
        c.enqueue(&echo(), None).unwrap();
        c.enqueue(&echo(), None).unwrap();
        assert!(queue.try_next().is_none());

        queue.complete();
        c.on_write_complete(first[0].len());
        let second = queue.try_next().unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(c.queued_bytes(), second.iter().map(Bytes::len).sum::<usize>());
    }

    #[test]
    fn requests_get_increasing_ids() {
        let mut c = conn();
        assert_eq!(c.enqueue(&echo(), None).unwrap(), Some(1));
        assert_eq!(c.enqueue(&echo(), None).unwrap(), Some(2));
        assert_eq!(c.pending_request_count(), 2);
        assert!(c.has_pending_method("echo"));
    }

    #[test]
    fn duplicate_response_is_delivered_once() {
        let mut c = conn();
        let (tx, mut rx) = oneshot::channel();
        let id = c.enqueue(&echo(), Some(tx)).unwrap().unwrap();
        assert!(c.complete_request(Some(&json!(id)), Ok(json!({"ok": 1}))));
        assert!(!c.complete_request(Some(&json!(id)), Ok(json!({"ok": 2}))));
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"ok": 1}));
    }

    #[test]
    fn abort_fails_pending_requests_and_reports_truncation() {
        let mut c = conn();
        let (tx, mut rx) = oneshot::channel();
        c.enqueue(&echo(), Some(tx)).unwrap();
        let queued = c.queued_bytes();
        assert!(queued > 0);
        assert_eq!(c.abort(), queued);
        assert_eq!(rx.try_recv().unwrap(), Err(RequestFailure::ConnectionClosed));
        assert_eq!(c.abort(), 0);
    }

    #[test]
    fn old_requests_time_out() {
        let mut c = conn();
        let (tx, mut rx) = oneshot::channel();
        c.enqueue(&echo(), Some(tx)).unwrap();
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(c.expire_requests(later, Duration::from_secs(60)), 1);
        assert_eq!(rx.try_recv().unwrap(), Err(RequestFailure::TimedOut));
        assert_eq!(c.pending_request_count(), 0);
    }

    #[test]
    fn high_water_forces_disconnect() {
        let mut c = Connection::new(
            ConnectionId::new(2),
            "127.0.0.1:9".parse().unwrap(),
            ConnectionLimits {
                max_frame_bytes: 1024,
                outbound_high_water_bytes: 60,
            },
        );
        c.enqueue(&echo(), None).unwrap();
        let err = c.enqueue(&echo(), None).unwrap_err();
        assert!(matches!(err, SendError::HighWater { .. }));
        assert!(c.is_closed());
    }

    #[test]
    fn first_byte_moves_to_handshaking() {
        let mut c = conn();
        let h = handler();
        assert_eq!(c.state(), ConnectionState::Connecting);
        c.on_receive_bytes(b"{\"meth", &h).unwrap();
        assert_eq!(c.state(), ConnectionState::Handshaking);
    }

    #[test]
    fn oversized_frame_surfaces_as_error() {
        let mut c = Connection::new(
            ConnectionId::new(3),
            "127.0.0.1:9".parse().unwrap(),
            ConnectionLimits {
                max_frame_bytes: 4,
                outbound_high_water_bytes: 1024,
            },
        );
        assert!(c.on_receive_bytes(b"0123456789", &handler()).is_err());
    }
}
