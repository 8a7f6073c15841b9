// src/network/transport.rs

use crate::constants::MIN_READ_BUFFER_BYTES;
use crate::error::TransportError;
use crate::events::model::LogLevel;
use crate::network::connection::ConnectionId;
use crate::network::events::emit_network_event;
use crate::security::secure_channel::{AuthSummary, SecureChannel};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

const WRITER_SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Receive allocation: what the caller suggests, but never below the floor.
pub fn receive_buffer_size(suggested: usize) -> usize {
    suggested.max(MIN_READ_BUFFER_BYTES)
}

/// Bytes delivered by one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    data: Vec<u8>,
    len: usize,
}

impl ReadChunk {
    /// With `null_terminate` a trailing NUL is appended that is not part of
    /// the logical length.
    pub fn new(bytes: &[u8], null_terminate: bool) -> Self {
        let mut data = Vec::with_capacity(bytes.len() + usize::from(null_terminate));
        data.extend_from_slice(bytes);
        if null_terminate {
            data.push(0);
        }
        Self {
            data,
            len: bytes.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw buffer including the terminator when one was requested.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Eof,
    Error(String),
}

/// What the per-connection I/O tasks report to the event loop.
pub enum TransportEventKind {
    Attached {
        handle: TransportHandle,
        auth: AuthSummary,
    },
    Read(ReadChunk),
    WriteComplete(usize),
    WriteFailed(String),
    Closed(CloseReason),
}

pub struct TransportEvent {
    pub conn: ConnectionId,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub read_buffer_bytes: usize,
    pub null_terminate_reads: bool,
}

/// Loop-side end of a connection's transport. At most one write may be
/// outstanding; the writer task clears the flag before reporting completion.
/// Dropping the handle stops the reader and abandons any write still blocked
/// on the peer, so the socket closes even when the peer stopped reading.
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Vec<Bytes>>,
    busy: Arc<AtomicBool>,
    _stop_reading: oneshot::Sender<()>,
    _stop_writing: oneshot::Sender<()>,
}

/// Writer-task end of a [`TransportHandle`].
pub struct WriteQueue {
    rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    busy: Arc<AtomicBool>,
    stop: oneshot::Receiver<()>,
}

impl WriteQueue {
    pub async fn next(&mut self) -> Option<Vec<Bytes>> {
        self.rx.recv().await
    }

    pub fn complete(&self) {
        self.busy.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<Vec<Bytes>> {
        self.rx.try_recv().ok()
    }
}

impl TransportHandle {
    /// Returns the handle, the writer task's queue and the reader's stop signal.
    pub fn pair() -> (TransportHandle, WriteQueue, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (stop_write_tx, stop_write_rx) = oneshot::channel();
        let busy = Arc::new(AtomicBool::new(false));
        (
            TransportHandle {
                tx,
                busy: busy.clone(),
                _stop_reading: stop_tx,
                _stop_writing: stop_write_tx,
            },
            WriteQueue {
                rx,
                busy,
                stop: stop_write_rx,
            },
            stop_rx,
        )
    }

    /// Hand buffers to the writer task; returns the number of bytes queued.
    pub fn send(&self, buffers: Vec<Bytes>) -> Result<usize, TransportError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(TransportError::WriteInProgress);
        }
        let queued = buffers.iter().map(Bytes::len).sum();
        if self.tx.send(buffers).is_err() {
            self.busy.store(false, Ordering::Release);
            return Err(TransportError::ChannelClosed);
        }
        Ok(queued)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Run the channel handshake for an accepted socket, then drive reads and
/// writes on their own tasks. Every outcome is reported on `events`.
pub fn spawn_transport(
    conn: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    channel: Arc<dyn SecureChannel>,
    opts: TransportOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let ch = match channel.accept(stream, peer_addr).await {
            Ok(ch) => ch,
            Err(e) => {
                emit_network_event(
                    "transport",
                    LogLevel::Warn,
                    "handshake_failed",
                    Some(peer_addr.to_string()),
                    Some(e.to_string()),
                );
                let _ = events.send(TransportEvent {
                    conn,
                    kind: TransportEventKind::Closed(CloseReason::Error(e.to_string())),
                });
                return;
            }
        };
        let (handle, queue, stop) = TransportHandle::pair();
        // attach before any read can be reported
        if events
            .send(TransportEvent {
                conn,
                kind: TransportEventKind::Attached {
                    handle,
                    auth: ch.auth,
                },
            })
            .is_err()
        {
            return;
        }
        tokio::spawn(write_loop(conn, ch.writer, queue, events.clone()));
        read_loop(conn, ch.reader, opts, stop, events).await;
    });
}

/// Reports at most one terminal event, then stops. A local stop ends the
/// loop silently.
pub async fn read_loop(
    conn: ConnectionId,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    opts: TransportOptions,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; receive_buffer_size(opts.read_buffer_bytes)];
    loop {
        let read = tokio::select! {
            _ = &mut stop => break,
            read = reader.read(&mut buf) => read,
        };
        let kind = match read {
            Ok(0) => TransportEventKind::Closed(CloseReason::Eof),
            Ok(n) => TransportEventKind::Read(ReadChunk::new(&buf[..n], opts.null_terminate_reads)),
            Err(e) => TransportEventKind::Closed(CloseReason::Error(e.to_string())),
        };
        let terminal = matches!(kind, TransportEventKind::Closed(_));
        if events.send(TransportEvent { conn, kind }).is_err() || terminal {
            break;
        }
    }
}

async fn write_batch(
    writer: &mut (dyn AsyncWrite + Send + Unpin),
    buffers: &[Bytes],
) -> Result<usize, std::io::Error> {
    let mut written = 0usize;
    for buf in buffers {
        writer.write_all(buf).await?;
        written += buf.len();
    }
    writer.flush().await?;
    Ok(written)
}

/// Drains the write queue until the handle goes away. A write blocked on a
/// peer that stopped reading is abandoned when the handle is dropped.
pub async fn write_loop(
    conn: ConnectionId,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut queue: WriteQueue,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(buffers) = queue.next().await {
        let outcome = tokio::select! {
            _ = &mut queue.stop => return,
            outcome = write_batch(writer.as_mut(), &buffers) => outcome,
        };
        queue.complete();
        let kind = match outcome {
            Ok(written) => TransportEventKind::WriteComplete(written),
            Err(e) => TransportEventKind::WriteFailed(e.to_string()),
        };
        let failed = matches!(kind, TransportEventKind::WriteFailed(_));
        if events.send(TransportEvent { conn, kind }).is_err() || failed {
            break;
        }
    }
    let _ = tokio::time::timeout(WRITER_SHUTDOWN_GRACE, writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_buffer_has_a_floor() {
        assert_eq!(receive_buffer_size(16), MIN_READ_BUFFER_BYTES);
        assert_eq!(receive_buffer_size(0), MIN_READ_BUFFER_BYTES);
        assert_eq!(receive_buffer_size(65536), 65536);
    }

    #[test]
    fn null_terminated_chunk_reports_logical_length() {
        let chunk = ReadChunk::new(b"abc", true);
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.bytes(), b"abc");
        assert_eq!(chunk.raw(), b"abc\0");

        let plain = ReadChunk::new(b"abc", false);
        assert_eq!(plain.raw(), b"abc");
    }

    #[test]
    fn second_send_is_refused_until_completion() {
        let (handle, mut queue, _stop) = TransportHandle::pair();
        assert_eq!(handle.send(vec![Bytes::from_static(b"ab")]).unwrap(), 2);
        assert!(matches!(
            handle.send(vec![Bytes::from_static(b"c")]),
            Err(TransportError::WriteInProgress)
        ));
        assert!(queue.try_next().is_some());
        queue.complete();
        assert_eq!(handle.send(vec![Bytes::from_static(b"c")]).unwrap(), 1);
    }

    #[tokio::test]
    async fn reader_reports_one_terminal_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data: &'static [u8] = b"hello";
        let opts = TransportOptions {
            read_buffer_bytes: 0,
            null_terminate_reads: false,
        };
        let (_keep, stop) = oneshot::channel();
        read_loop(ConnectionId::new(1), Box::new(data), opts, stop, tx).await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, TransportEventKind::Read(ref c) if c.bytes() == b"hello"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.kind, TransportEventKind::Closed(CloseReason::Eof)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writer_reports_exact_byte_count() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, queue, _stop) = TransportHandle::pair();
        let sink: Vec<u8> = Vec::new();
        let task = tokio::spawn(write_loop(ConnectionId::new(1), Box::new(sink), queue, tx));
        handle
            .send(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")])
            .unwrap();
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev.kind, TransportEventKind::WriteComplete(5)));
        assert!(!handle.is_busy());
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_handle_abandons_a_blocked_write() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, queue, _stop) = TransportHandle::pair();
        // nobody reads the far end, so the buffer never fits
        let (near, _far) = tokio::io::duplex(16);
        let task = tokio::spawn(write_loop(ConnectionId::new(1), Box::new(near), queue, tx));
        handle.send(vec![Bytes::from(vec![b'x'; 4096])]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.is_busy());

        drop(handle);
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("writer still blocked")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
