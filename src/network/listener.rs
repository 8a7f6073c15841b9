//! Accept loop and per-server event loop.
//!
//! One task owns every [`Connection`]. Commands from the public API, transport
//! events from the per-connection I/O tasks, new sockets and reconciliation
//! ticks are all multiplexed here, so connection state is never shared.

use crate::config::Config;
use crate::error::{ListenerError, RequestFailure};
use crate::events::model::LogLevel;
use crate::network::connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionLimits, ConnectionState, ReplySender,
    RequestReply,
};
use crate::network::events::emit_network_event;
use crate::network::handler::{Handler, Identity};
use crate::network::message::{methods, OutboundMessage};
use crate::network::pending::{PendingUpdates, SharedPending};
use crate::network::roster::Roster;
use crate::network::timer::ReconcileTimer;
use crate::network::transport::{
    spawn_transport, CloseReason, TransportEvent, TransportEventKind, TransportOptions,
};
use crate::security::SecureChannel;
use crate::store::{ClassId, ObjectChange, ObjectStore, PolicyUpdateOp, Uri};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn log_listener_event(level: LogLevel, action: &str, addr: Option<String>, detail: Option<String>) {
    emit_network_event("listener", level, action, addr, detail);
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub listen_addr: String,
    pub reconcile_interval: Duration,
    pub keepalive_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub max_updates_per_message: usize,
    pub limits: ConnectionLimits,
    pub transport: TransportOptions,
    pub drain_timeout: Duration,
}

impl ListenerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            listen_addr: cfg.listen_addr(),
            reconcile_interval: cfg.reconcile_interval(),
            keepalive_timeout: cfg.keepalive_timeout(),
            request_timeout: cfg.request_timeout(),
            max_updates_per_message: cfg.max_updates_per_message(),
            limits: ConnectionLimits {
                max_frame_bytes: cfg.max_frame_bytes(),
                outbound_high_water_bytes: cfg.outbound_high_water_bytes(),
            },
            transport: TransportOptions {
                read_buffer_bytes: cfg.read_buffer_bytes(),
                null_terminate_reads: cfg.null_terminate_reads(),
            },
            drain_timeout: cfg.drain_timeout(),
        }
    }
}

pub enum Command {
    SendToAll(OutboundMessage),
    SendToOne(ConnectionId, OutboundMessage),
    Request {
        conn: ConnectionId,
        msg: OutboundMessage,
        reply: ReplySender,
    },
    FlushPending,
    Close(ConnectionId),
    Snapshot(oneshot::Sender<Vec<ConnectionInfo>>),
    Shutdown,
}

/// What `stop` found while tearing connections down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Connections closed by the shutdown.
    pub closed: usize,
    /// Of those, how many emptied their outbound queue first.
    pub flushed: usize,
    /// Connections cut off at the drain deadline, with the bytes discarded.
    pub truncated: Vec<(ConnectionId, usize)>,
}

/// Cloneable entry point into a running listener.
#[derive(Clone)]
pub struct ListenerHandle {
    tx: mpsc::UnboundedSender<Command>,
    pending: SharedPending,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    fn command(&self, cmd: Command) -> Result<(), ListenerError> {
        self.tx.send(cmd).map_err(|_| ListenerError::Stopped)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Broadcast to every ready connection whose role accepts the message.
    pub fn send_to_all(&self, msg: OutboundMessage) -> Result<(), ListenerError> {
        self.command(Command::SendToAll(msg))
    }

    pub fn send_to_one(&self, conn: ConnectionId, msg: OutboundMessage) -> Result<(), ListenerError> {
        self.command(Command::SendToOne(conn, msg))
    }

    /// Send a request and get a receiver for its outcome. The receiver
    /// reports a closed channel when the connection refused the request.
    pub fn request(
        &self,
        conn: ConnectionId,
        msg: OutboundMessage,
    ) -> Result<oneshot::Receiver<RequestReply>, ListenerError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request { conn, msg, reply })?;
        Ok(rx)
    }

    /// [`request`](Self::request) and wait for the outcome.
    pub async fn call(&self, conn: ConnectionId, msg: OutboundMessage) -> RequestReply {
        let rx = self
            .request(conn, msg)
            .map_err(|_| RequestFailure::ConnectionClosed)?;
        rx.await.unwrap_or(Err(RequestFailure::ConnectionClosed))
    }

    /// Record a change for every peer that resolved `uri`. Safe to call from
    /// any thread; nothing is sent until the next flush.
    pub fn add_pending_update(&self, class_id: ClassId, uri: &Uri, op: PolicyUpdateOp) -> usize {
        self.pending.lock().add(class_id, uri, op, None)
    }

    /// Record a change for one peer regardless of what it resolved.
    pub fn add_pending_update_for(
        &self,
        conn: ConnectionId,
        class_id: ClassId,
        uri: Uri,
        op: PolicyUpdateOp,
    ) -> bool {
        self.pending.lock().add_for(conn, class_id, uri, op)
    }

    /// Flush pending updates now instead of waiting for the next tick.
    pub fn send_updates(&self) -> Result<(), ListenerError> {
        self.command(Command::FlushPending)
    }

    pub fn close_connection(&self, conn: ConnectionId) -> Result<(), ListenerError> {
        self.command(Command::Close(conn))
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, ListenerError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ListenerError::Stopped)
    }

    pub fn shutdown(&self) -> Result<(), ListenerError> {
        self.command(Command::Shutdown)
    }
}

pub struct Listener {
    tcp: TcpListener,
    local_addr: SocketAddr,
    settings: ListenerSettings,
    channel: Arc<dyn SecureChannel>,
    handler: Handler,
    pending: SharedPending,
    roster: Roster,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    timer: ReconcileTimer,
}

impl Listener {
    /// Bind the accept socket. Nothing is accepted until [`run`](Self::run).
    pub async fn bind(
        settings: ListenerSettings,
        channel: Arc<dyn SecureChannel>,
        store: Arc<dyn ObjectStore>,
        identity: Identity,
    ) -> Result<(Listener, ListenerHandle), ListenerError> {
        let tcp = TcpListener::bind(&settings.listen_addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: settings.listen_addr.clone(),
                source,
            })?;
        let local_addr = tcp.local_addr().map_err(|source| ListenerError::Bind {
            addr: settings.listen_addr.clone(),
            source,
        })?;
        log_listener_event(LogLevel::Info, "listener_bind", Some(local_addr.to_string()), None);

        let pending = PendingUpdates::shared();
        let (tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ListenerHandle {
            tx,
            pending: pending.clone(),
            local_addr,
        };
        let listener = Listener {
            tcp,
            local_addr,
            timer: ReconcileTimer::new(settings.reconcile_interval),
            settings,
            channel,
            handler: Handler::new(store, identity, pending.clone()),
            pending,
            roster: Roster::new(),
            commands,
            events_tx,
            events_rx,
        };
        Ok((listener, handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until a shutdown command arrives or every handle is dropped.
    pub async fn run(mut self) -> Result<ShutdownReport, ListenerError> {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr),
                    Err(e) => {
                        log_listener_event(LogLevel::Error, "accept_failed", None, Some(e.to_string()));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(ev) = self.events_rx.recv() => self.on_transport_event(ev),
                _ = self.timer.wait() => self.on_tick(),
            }
            self.reap();
        }
        Ok(self.shutdown().await)
    }

    fn on_accept(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.roster.allocate_id();
        log_listener_event(
            LogLevel::Info,
            "incoming_connection",
            Some(peer_addr.to_string()),
            Some(id.to_string()),
        );
        self.roster
            .insert(Connection::new(id, peer_addr, self.settings.limits));
        spawn_transport(
            id,
            stream,
            peer_addr,
            self.channel.clone(),
            self.settings.transport,
            self.events_tx.clone(),
        );
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendToAll(msg) => {
                let prepared = match msg.prepare(&self.handler.encode_context()) {
                    Ok(p) => p,
                    Err(e) => {
                        log_listener_event(LogLevel::Warn, "encode_failed", None, Some(e.to_string()));
                        return;
                    }
                };
                for conn in self.roster.iter_mut() {
                    if !conn.is_ready() || !prepared.accepted_by(conn.role()) {
                        continue;
                    }
                    if let Err(e) = conn.enqueue(&prepared, None) {
                        log_listener_event(
                            LogLevel::Warn,
                            "send_failed",
                            Some(conn.peer_addr().to_string()),
                            Some(e.to_string()),
                        );
                    }
                }
            }
            Command::SendToOne(id, msg) => {
                let Some(conn) = self.roster.get_mut(id) else {
                    log_listener_event(LogLevel::Warn, "unknown_connection", None, Some(id.to_string()));
                    return;
                };
                let sent = msg
                    .prepare(&self.handler.encode_context())
                    .and_then(|p| conn.enqueue(&p, None));
                if let Err(e) = sent {
                    log_listener_event(
                        LogLevel::Warn,
                        "send_failed",
                        Some(conn.peer_addr().to_string()),
                        Some(e.to_string()),
                    );
                }
            }
            Command::Request { conn: id, msg, reply } => {
                let Some(conn) = self.roster.get_mut(id) else {
                    let _ = reply.send(Err(RequestFailure::ConnectionClosed));
                    return;
                };
                if !conn.is_ready() {
                    let _ = reply.send(Err(RequestFailure::ConnectionClosed));
                    return;
                }
                let sent = msg
                    .prepare(&self.handler.encode_context())
                    .and_then(|p| conn.enqueue(&p, Some(reply)));
                if let Err(e) = sent {
                    log_listener_event(
                        LogLevel::Warn,
                        "request_failed",
                        Some(conn.peer_addr().to_string()),
                        Some(e.to_string()),
                    );
                }
            }
            Command::FlushPending => {
                self.flush_pending();
            }
            Command::Close(id) => {
                if let Some(conn) = self.roster.get_mut(id) {
                    if conn.close() {
                        log_listener_event(
                            LogLevel::Info,
                            "close_requested",
                            Some(conn.peer_addr().to_string()),
                            Some(format!("{} -> {}", id, conn.state())),
                        );
                    }
                }
            }
            Command::Snapshot(tx) => {
                let _ = tx.send(self.roster.snapshot());
            }
            // handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn on_transport_event(&mut self, ev: TransportEvent) {
        let Some(conn) = self.roster.get_mut(ev.conn) else {
            return;
        };
        let changes = match ev.kind {
            TransportEventKind::Attached { handle, auth } => {
                log_listener_event(
                    LogLevel::Debug,
                    "transport_attached",
                    Some(conn.peer_addr().to_string()),
                    Some(format!("{} {:?}", ev.conn, auth.backend)),
                );
                conn.attach(handle, auth);
                return;
            }
            TransportEventKind::Read(chunk) => match conn.on_receive_bytes(chunk.bytes(), &self.handler) {
                Ok(changes) => changes,
                Err(e) => {
                    log_listener_event(
                        LogLevel::Warn,
                        "frame_rejected",
                        Some(conn.peer_addr().to_string()),
                        Some(format!("{}: {}", ev.conn, e)),
                    );
                    conn.abort();
                    return;
                }
            },
            TransportEventKind::WriteComplete(n) => {
                conn.on_write_complete(n);
                return;
            }
            TransportEventKind::WriteFailed(reason) => {
                log_listener_event(
                    LogLevel::Warn,
                    "write_failed",
                    Some(conn.peer_addr().to_string()),
                    Some(format!("{}: {}", ev.conn, reason)),
                );
                conn.abort();
                return;
            }
            TransportEventKind::Closed(reason) => {
                let (level, detail) = match reason {
                    CloseReason::Eof => (LogLevel::Info, format!("{} eof", ev.conn)),
                    CloseReason::Error(e) => (LogLevel::Warn, format!("{}: {}", ev.conn, e)),
                };
                log_listener_event(level, "peer_closed", Some(conn.peer_addr().to_string()), Some(detail));
                conn.abort();
                return;
            }
        };
        self.record_changes(ev.conn, changes);
    }

    /// Queue store changes made by one peer for every other interested peer.
    fn record_changes(&self, origin: ConnectionId, changes: Vec<ObjectChange>) {
        if changes.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        for change in changes {
            pending.add(change.class_id, &change.uri, change.op, Some(origin));
        }
    }

    /// Send every coalesced update, split to respect the per-message bound.
    /// Returns the number of messages queued.
    fn flush_pending(&mut self) -> usize {
        let batches = self.pending.lock().take_all();
        let mut sent = 0;
        for (id, batch) in batches {
            let Some(conn) = self.roster.get_mut(id) else {
                continue;
            };
            for chunk in batch.into_chunks(self.settings.max_updates_per_message) {
                let queued = OutboundMessage::from_batch(chunk)
                    .prepare(&self.handler.encode_context())
                    .and_then(|p| conn.enqueue(&p, None));
                match queued {
                    Ok(_) => sent += 1,
                    Err(e) => {
                        log_listener_event(
                            LogLevel::Warn,
                            "update_dropped",
                            Some(conn.peer_addr().to_string()),
                            Some(format!("{}: {}", id, e)),
                        );
                        break;
                    }
                }
            }
        }
        sent
    }

    fn on_tick(&mut self) {
        let flushed = self.flush_pending();
        let now = Instant::now();
        let request_timeout = self.settings.request_timeout;
        let keepalive = self.settings.keepalive_timeout;
        let echo = OutboundMessage::echo().prepare(&self.handler.encode_context());

        for conn in self.roster.iter_mut() {
            let expired = conn.expire_requests(now, request_timeout);
            if expired > 0 {
                log_listener_event(
                    LogLevel::Warn,
                    "requests_timed_out",
                    Some(conn.peer_addr().to_string()),
                    Some(format!("{} expired={}", conn.id(), expired)),
                );
            }
            let Some(limit) = keepalive else {
                continue;
            };
            let idle = now.saturating_duration_since(conn.last_activity());
            if idle >= limit {
                if conn.close() {
                    log_listener_event(
                        LogLevel::Info,
                        "idle_disconnect",
                        Some(conn.peer_addr().to_string()),
                        Some(format!("{} idle={}s -> {}", conn.id(), idle.as_secs(), conn.state())),
                    );
                } else if conn.state() == ConnectionState::Draining {
                    // still idle a tick later: the peer is not reading what we queued
                    let truncated = conn.abort();
                    log_listener_event(
                        LogLevel::Warn,
                        "idle_drain_aborted",
                        Some(conn.peer_addr().to_string()),
                        Some(format!("{} idle={}s truncated={}B", conn.id(), idle.as_secs(), truncated)),
                    );
                }
            } else if idle >= limit / 2 && conn.is_ready() && !conn.has_pending_method(methods::ECHO) {
                let sent = match &echo {
                    Ok(echo) => conn.enqueue(echo, None).map(|_| ()).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    log_listener_event(
                        LogLevel::Warn,
                        "send_failed",
                        Some(conn.peer_addr().to_string()),
                        Some(format!("{} keepalive echo: {}", conn.id(), e)),
                    );
                }
            }
        }
        if flushed > 0 {
            log_listener_event(LogLevel::Debug, "updates_flushed", None, Some(format!("messages={}", flushed)));
        }
        self.timer.rearm(Instant::now());
    }

    /// Drop closed connections together with their pending-update state.
    fn reap(&mut self) -> usize {
        let closed = self.roster.reap_closed();
        for conn in &closed {
            let discarded = self.pending.lock().unregister(conn.id());
            log_listener_event(
                LogLevel::Info,
                "connection_removed",
                Some(conn.peer_addr().to_string()),
                Some(format!("{} discarded_updates={}", conn.id(), discarded)),
            );
        }
        closed.len()
    }

    async fn shutdown(mut self) -> ShutdownReport {
        self.timer.cancel();
        let mut report = ShutdownReport {
            closed: self.roster.len(),
            ..Default::default()
        };
        for conn in self.roster.iter_mut() {
            conn.close();
        }
        report.flushed += self.reap();

        let deadline = Instant::now() + self.settings.drain_timeout;
        while !self.roster.is_empty() {
            tokio::select! {
                Some(ev) = self.events_rx.recv() => self.on_transport_event(ev),
                _ = tokio::time::sleep_until(deadline) => break,
            }
            report.flushed += self.reap();
        }

        for id in self.roster.ids() {
            if let Some(mut conn) = self.roster.remove(id) {
                let truncated = conn.abort();
                self.pending.lock().unregister(id);
                report.truncated.push((id, truncated));
            }
        }
        log_listener_event(
            LogLevel::Info,
            "listener_stopped",
            Some(self.local_addr.to_string()),
            Some(format!(
                "closed={} flushed={} truncated={}",
                report.closed,
                report.flushed,
                report.truncated.len()
            )),
        );
        report
    }
}
