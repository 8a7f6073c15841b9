//! Minimal peer side of the protocol: enough to drive a server from the
//! control CLI and from integration tests.

use crate::constants::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_READ_BUFFER_BYTES};
use crate::error::{ClientError, TransportError};
use crate::network::frame::{encode_frame, FrameAccumulator};
use crate::network::message::{methods, Envelope, MessageKind};
use crate::network::role::Role;
use crate::security::{PlaintextChannel, SecureChannel};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct PeerClient {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    frames: FrameAccumulator,
    buf: Vec<u8>,
    next_id: u64,
    /// Messages that arrived while `call` waited for a specific response.
    stashed: VecDeque<Envelope>,
}

impl PeerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_with(addr, &PlaintextChannel::new()).await
    }

    pub async fn connect_with(addr: SocketAddr, channel: &dyn SecureChannel) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let ch = channel
            .connect(stream, addr)
            .await
            .map_err(TransportError::from)?;
        Ok(Self {
            reader: ch.reader,
            writer: ch.writer,
            frames: FrameAccumulator::new(DEFAULT_MAX_FRAME_BYTES),
            buf: vec![0u8; DEFAULT_READ_BUFFER_BYTES],
            next_id: 1,
            stashed: VecDeque::new(),
        })
    }

    /// Write bytes as given, with no framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_json(&mut self, doc: &Value) -> Result<(), ClientError> {
        let body = serde_json::to_vec(doc).map_err(std::io::Error::from)?;
        let frame = encode_frame(body);
        self.send_raw(&frame).await
    }

    /// Send a request without waiting; returns its id.
    pub async fn send_request(&mut self, method: &str, params: Value) -> Result<u64, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let params = match params {
            Value::Array(_) => params,
            Value::Null => json!([]),
            other => json!([other]),
        };
        self.send_json(&json!({ "method": method, "params": params, "id": id }))
            .await?;
        Ok(id)
    }

    /// Next message from the server, stashed ones first.
    pub async fn next_envelope(&mut self) -> Result<Envelope, ClientError> {
        if let Some(env) = self.stashed.pop_front() {
            return Ok(env);
        }
        self.read_envelope().await
    }

    async fn read_envelope(&mut self) -> Result<Envelope, ClientError> {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(Envelope::parse(&frame)?);
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.frames.extend(&self.buf[..n]);
        }
    }

    /// Send a request and wait for its response or error response. Anything
    /// else received meanwhile is kept for [`next_envelope`](Self::next_envelope).
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Envelope, ClientError> {
        let id = self.send_request(method, params).await?;
        loop {
            let env = self.read_envelope().await?;
            if env.kind != MessageKind::Request && env.request_id() == Some(id) {
                return Ok(env);
            }
            self.stashed.push_back(env);
        }
    }

    pub async fn identify(&mut self, name: &str, roles: Role) -> Result<Envelope, ClientError> {
        self.call(
            methods::SEND_IDENTITY,
            json!({ "name": name, "domain": "opflex", "my_role": roles }),
        )
        .await
    }

    /// Answer a server-originated request.
    pub async fn respond(&mut self, request: &Envelope, result: Value) -> Result<(), ClientError> {
        let id = request.id.clone().unwrap_or(Value::Null);
        self.send_json(&json!({ "result": result, "error": Value::Null, "id": id }))
            .await
    }
}
