// src/network/message.rs

use crate::error::SendError;
use crate::network::frame::encode_frame;
use crate::network::role::Role;
use crate::store::{ObjectStore, PolicyUpdateOp, Reference, StoreClient, StoreError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Method names understood on the wire.
pub mod methods {
    pub const SEND_IDENTITY: &str = "send_identity";
    pub const POLICY_RESOLVE: &str = "policy_resolve";
    pub const POLICY_UNRESOLVE: &str = "policy_unresolve";
    pub const POLICY_UPDATE: &str = "policy_update";
    pub const ENDPOINT_DECLARE: &str = "endpoint_declare";
    pub const ENDPOINT_UNDECLARE: &str = "endpoint_undeclare";
    pub const ENDPOINT_RESOLVE: &str = "endpoint_resolve";
    pub const ENDPOINT_UPDATE: &str = "endpoint_update";
    pub const STATE_REPORT: &str = "state_report";
    pub const ECHO: &str = "echo";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    ErrorResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Parse,
    Invalid,
    NotReady,
    Permission,
    Unsupported,
    Protocol,
    Store,
    /// Code sent by a peer that this side does not define.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Parse => "EPARSE",
            ErrorCode::Invalid => "EINVAL",
            ErrorCode::NotReady => "ENOTREADY",
            ErrorCode::Permission => "EPERM",
            ErrorCode::Unsupported => "EUNSUPPORTED",
            ErrorCode::Protocol => "EPROTO",
            ErrorCode::Store => "ESTORE",
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_wire(code: &str) -> ErrorCode {
        match code {
            "EPARSE" => ErrorCode::Parse,
            "EINVAL" => ErrorCode::Invalid,
            "ENOTREADY" => ErrorCode::NotReady,
            "EPERM" => ErrorCode::Permission,
            "EUNSUPPORTED" => ErrorCode::Unsupported,
            "EPROTO" => ErrorCode::Protocol,
            "ESTORE" => ErrorCode::Store,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let code = String::deserialize(d)?;
        Ok(ErrorCode::from_wire(&code))
    }
}

/// Error payload carried by an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("unparseable frame: {reason}")]
pub struct ParseError {
    /// Request id, when one could be recovered from the frame.
    pub id: Option<Value>,
    pub reason: String,
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub method: Option<String>,
    pub id: Option<Value>,
    /// `params` for requests, `result` for responses, `error` for error responses.
    pub payload: Value,
}

impl Envelope {
    pub fn parse(frame: &[u8]) -> Result<Envelope, ParseError> {
        let value: Value = serde_json::from_slice(frame).map_err(|e| ParseError {
            id: None,
            reason: e.to_string(),
        })?;
        let value = match value {
            // tolerate the single-element array wrapping some peers use
            Value::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        };
        let Value::Object(mut obj) = value else {
            return Err(ParseError {
                id: None,
                reason: "message is not a JSON object".into(),
            });
        };
        let id = obj.remove("id").filter(|v| !v.is_null());

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(ParseError {
                    id,
                    reason: "method must be a string".into(),
                });
            };
            let params = match obj.remove("params") {
                None | Some(Value::Null) => Value::Array(Vec::new()),
                Some(p @ Value::Array(_)) => p,
                Some(_) => {
                    return Err(ParseError {
                        id,
                        reason: "params must be an array".into(),
                    })
                }
            };
            return Ok(Envelope {
                kind: MessageKind::Request,
                method: Some(method),
                id,
                payload: params,
            });
        }

        if id.is_none() {
            return Err(ParseError {
                id: None,
                reason: "response without id".into(),
            });
        }
        match obj.remove("error") {
            Some(err) if !err.is_null() => Ok(Envelope {
                kind: MessageKind::ErrorResponse,
                method: None,
                id,
                payload: err,
            }),
            _ => match obj.remove("result") {
                Some(result) => Ok(Envelope {
                    kind: MessageKind::Response,
                    method: None,
                    id,
                    payload: result,
                }),
                None => Err(ParseError {
                    id,
                    reason: "neither method, result nor error present".into(),
                }),
            },
        }
    }

    /// Request params as a slice (empty for responses).
    pub fn params(&self) -> &[Value] {
        match (&self.kind, &self.payload) {
            (MessageKind::Request, Value::Array(items)) => items,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<RpcError> {
        if self.kind != MessageKind::ErrorResponse {
            return None;
        }
        Some(
            serde_json::from_value(self.payload.clone()).unwrap_or_else(|_| {
                RpcError::new(ErrorCode::Other("UNKNOWN".into()), self.payload.to_string())
            }),
        )
    }

    /// Numeric id of a response to one of our own requests.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

/// Coalesced object references destined for one policy update message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    pub replace: Vec<Reference>,
    pub merge_children: Vec<Reference>,
    pub delete: Vec<Reference>,
}

impl UpdateBatch {
    pub fn push(&mut self, reference: Reference, op: PolicyUpdateOp) {
        match op {
            PolicyUpdateOp::Replace => self.replace.push(reference),
            PolicyUpdateOp::MergeChildren => self.merge_children.push(reference),
            PolicyUpdateOp::Delete => self.delete.push(reference),
        }
    }

    pub fn len(&self) -> usize {
        self.replace.len() + self.merge_children.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into batches of at most `max` references, preserving order.
    pub fn into_chunks(self, max: usize) -> Vec<UpdateBatch> {
        let max = max.max(1);
        if self.len() <= max {
            return vec![self];
        }
        let mut out = Vec::new();
        let mut current = UpdateBatch::default();
        let ops = self
            .replace
            .into_iter()
            .map(|r| (r, PolicyUpdateOp::Replace))
            .chain(
                self.merge_children
                    .into_iter()
                    .map(|r| (r, PolicyUpdateOp::MergeChildren)),
            )
            .chain(self.delete.into_iter().map(|r| (r, PolicyUpdateOp::Delete)));
        for (reference, op) in ops {
            current.push(reference, op);
            if current.len() == max {
                out.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }
}

/// Concrete message bodies. Store-backed variants are resolved to JSON by
/// [`OutboundMessage::prepare`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PolicyUpdate(UpdateBatch),
    EndpointUpdate {
        replace: Vec<Reference>,
        delete: Vec<Reference>,
    },
    Echo,
    Value(Value),
    Error(RpcError),
}

/// What the encoder needs from the store.
pub struct EncodeContext<'a> {
    pub store: &'a dyn ObjectStore,
    pub client: &'a StoreClient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub method: String,
    /// Echoed request id for responses; requests get theirs from the connection.
    pub id: Option<Value>,
    pub payload: Payload,
}

impl OutboundMessage {
    pub fn policy_update(
        replace: Vec<Reference>,
        merge_children: Vec<Reference>,
        delete: Vec<Reference>,
    ) -> Self {
        Self::from_batch(UpdateBatch {
            replace,
            merge_children,
            delete,
        })
    }

    pub fn from_batch(batch: UpdateBatch) -> Self {
        Self::request_with(methods::POLICY_UPDATE, Payload::PolicyUpdate(batch))
    }

    pub fn endpoint_update(replace: Vec<Reference>, delete: Vec<Reference>) -> Self {
        Self::request_with(
            methods::ENDPOINT_UPDATE,
            Payload::EndpointUpdate { replace, delete },
        )
    }

    pub fn echo() -> Self {
        Self::request_with(methods::ECHO, Payload::Echo)
    }

    /// Request whose single parameter is `param`.
    pub fn request(method: &str, param: Value) -> Self {
        Self::request_with(method, Payload::Value(param))
    }

    fn request_with(method: &str, payload: Payload) -> Self {
        Self {
            kind: MessageKind::Request,
            method: method.to_string(),
            id: None,
            payload,
        }
    }

    pub fn response(method: &str, id: Value, result: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            method: method.to_string(),
            id: Some(id),
            payload: Payload::Value(result),
        }
    }

    pub fn error(method: &str, id: Value, error: RpcError) -> Self {
        Self {
            kind: MessageKind::ErrorResponse,
            method: method.to_string(),
            id: Some(id),
            payload: Payload::Error(error),
        }
    }

    /// Whether a peer holding `role` should receive this message on broadcast.
    pub fn accepted_by(&self, role: Role) -> bool {
        match self.payload {
            Payload::PolicyUpdate(_) | Payload::EndpointUpdate { .. } => {
                role.contains(Role::POLICY_ELEMENT)
            }
            _ => true,
        }
    }

    /// Resolve store references and build the wire body. The result can be
    /// framed once per connection without touching the store again.
    pub fn prepare(&self, ctx: &EncodeContext<'_>) -> Result<PreparedMessage, SendError> {
        let body = match &self.payload {
            Payload::PolicyUpdate(batch) => json!({
                "replace": self.objects(ctx, &batch.replace, true)?,
                "merge_children": self.objects(ctx, &batch.merge_children, false)?,
                "delete": self.refs(ctx, &batch.delete)?,
            }),
            Payload::EndpointUpdate { replace, delete } => json!({
                "replace": self.objects(ctx, replace, true)?,
                "delete": self.refs(ctx, delete)?,
            }),
            Payload::Echo => Value::Null,
            Payload::Value(v) => v.clone(),
            Payload::Error(e) => serde_json::to_value(e).map_err(|e| self.encode_error(e))?,
        };
        let body = match (self.kind, body) {
            (MessageKind::Request, Value::Null) => Value::Array(Vec::new()),
            (MessageKind::Request, param) => Value::Array(vec![param]),
            (_, body) => body,
        };
        Ok(PreparedMessage {
            kind: self.kind,
            method: self.method.clone(),
            id: self.id.clone(),
            body,
            policy_element_only: !self.accepted_by(Role::OBSERVER),
        })
    }

    fn objects(
        &self,
        ctx: &EncodeContext<'_>,
        refs: &[Reference],
        full: bool,
    ) -> Result<Vec<Value>, SendError> {
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            match ctx.store.serialize(r.class_id, &r.uri, ctx.client, &mut out, full) {
                Ok(()) => {}
                // removed since it was queued; the delete follows separately
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(self.encode_error(e)),
            }
        }
        Ok(out)
    }

    fn refs(&self, ctx: &EncodeContext<'_>, refs: &[Reference]) -> Result<Vec<Value>, SendError> {
        refs.iter()
            .map(|r| {
                let info = ctx
                    .store
                    .class_info(r.class_id)
                    .map_err(|e| self.encode_error(e))?;
                Ok(json!({ "subject": info.name, "uri": r.uri }))
            })
            .collect()
    }

    fn encode_error(&self, e: impl fmt::Display) -> SendError {
        SendError::Encode {
            method: self.method.clone(),
            reason: e.to_string(),
        }
    }
}

/// Fully resolved message body, ready to be framed per connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMessage {
    pub kind: MessageKind,
    pub method: String,
    pub id: Option<Value>,
    body: Value,
    policy_element_only: bool,
}

impl PreparedMessage {
    /// A request whose params array is given verbatim.
    pub fn request(method: &str, params: Value) -> Self {
        let body = match params {
            Value::Array(_) => params,
            Value::Null => Value::Array(Vec::new()),
            other => Value::Array(vec![other]),
        };
        Self {
            kind: MessageKind::Request,
            method: method.to_string(),
            id: None,
            body,
            policy_element_only: false,
        }
    }

    pub fn accepted_by(&self, role: Role) -> bool {
        !self.policy_element_only || role.contains(Role::POLICY_ELEMENT)
    }

    /// Encode with the given id; a request id overrides any stored one.
    pub fn frame(&self, id: Option<&Value>) -> Result<Bytes, SendError> {
        let id = id.or(self.id.as_ref()).cloned().unwrap_or(Value::Null);
        let doc = match self.kind {
            MessageKind::Request => {
                json!({ "method": self.method, "params": self.body, "id": id })
            }
            MessageKind::Response => json!({ "result": self.body, "error": Value::Null, "id": id }),
            MessageKind::ErrorResponse => {
                json!({ "result": Value::Null, "error": self.body, "id": id })
            }
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| SendError::Encode {
            method: self.method.clone(),
            reason: e.to_string(),
        })?;
        Ok(encode_frame(bytes))
    }
}
