//! Protocol logic for inbound messages on one connection.
//!
//! Requests are checked in a fixed order: known method, handshake completed,
//! peer role, server role. Every rejection is answered with an error response
//! and leaves both the connection and the store untouched.

use crate::config::Config;
use crate::constants::SYSTEM_STORE_CLIENT;
use crate::error::RequestFailure;
use crate::events::model::LogLevel;
use crate::network::connection::Connection;
use crate::network::events::emit_protocol_event;
use crate::network::message::{
    methods, EncodeContext, Envelope, ErrorCode, MessageKind, OutboundMessage, ParseError,
    RpcError,
};
use crate::network::pending::SharedPending;
use crate::network::role::Role;
use crate::store::{ObjectChange, ObjectStore, PolicyUpdateOp, StoreClient, StoreError, Uri};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// What this server tells peers about itself in the identity response.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub domain: String,
    pub roles: Role,
    pub peers: Vec<(Role, String)>,
    pub proxies: Vec<String>,
}

impl Default for Identity {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Identity {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            name: cfg.server_name(),
            domain: cfg.server_domain(),
            roles: cfg.roles,
            peers: cfg
                .peers
                .iter()
                .flatten()
                .map(|p| (p.roles, p.address.clone()))
                .collect(),
            proxies: cfg.proxies.clone().unwrap_or_default(),
        }
    }

    fn to_json(&self) -> Value {
        let peers: Vec<Value> = self
            .peers
            .iter()
            .map(|(role, addr)| json!({ "role": role, "connectivity_info": addr }))
            .collect();
        json!({
            "name": self.name,
            "domain": self.domain,
            "my_role": self.roles,
            "peers": peers,
            "proxies": self.proxies,
        })
    }
}

struct MethodRule {
    name: &'static str,
    /// Capability the peer must have negotiated.
    peer: Option<Role>,
    /// Capability this server must serve.
    server: Option<Role>,
}

const RULES: &[MethodRule] = &[
    MethodRule { name: methods::SEND_IDENTITY, peer: None, server: None },
    MethodRule { name: methods::POLICY_RESOLVE, peer: Some(Role::POLICY_ELEMENT), server: Some(Role::POLICY_REPOSITORY) },
    MethodRule { name: methods::POLICY_UNRESOLVE, peer: Some(Role::POLICY_ELEMENT), server: Some(Role::POLICY_REPOSITORY) },
    MethodRule { name: methods::POLICY_UPDATE, peer: Some(Role::POLICY_REPOSITORY), server: None },
    MethodRule { name: methods::ENDPOINT_DECLARE, peer: Some(Role::POLICY_ELEMENT), server: Some(Role::ENDPOINT_REGISTRY) },
    MethodRule { name: methods::ENDPOINT_UNDECLARE, peer: Some(Role::POLICY_ELEMENT), server: Some(Role::ENDPOINT_REGISTRY) },
    MethodRule { name: methods::ENDPOINT_RESOLVE, peer: Some(Role::POLICY_ELEMENT), server: Some(Role::ENDPOINT_REGISTRY) },
    MethodRule { name: methods::ENDPOINT_UPDATE, peer: Some(Role::ENDPOINT_REGISTRY), server: None },
    MethodRule { name: methods::STATE_REPORT, peer: Some(Role::POLICY_ELEMENT), server: Some(Role::OBSERVER) },
    MethodRule { name: methods::ECHO, peer: None, server: None },
];

/// Result of a successfully handled request.
struct Handled {
    result: Value,
    changes: Vec<ObjectChange>,
}

impl Handled {
    fn result(result: Value) -> Self {
        Self {
            result,
            changes: Vec::new(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> RpcError {
    RpcError::new(ErrorCode::Invalid, msg)
}

fn store_error(e: StoreError) -> RpcError {
    RpcError::new(ErrorCode::Store, e.to_string())
}

pub struct Handler {
    store: Arc<dyn ObjectStore>,
    client: StoreClient,
    identity: Identity,
    pending: SharedPending,
}

impl Handler {
    pub fn new(store: Arc<dyn ObjectStore>, identity: Identity, pending: SharedPending) -> Self {
        let client = store.store_client(SYSTEM_STORE_CLIENT);
        Self {
            store,
            client,
            identity,
            pending,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn encode_context(&self) -> EncodeContext<'_> {
        EncodeContext {
            store: self.store.as_ref(),
            client: &self.client,
        }
    }

    /// Handle one request and answer it. Returns the store changes it made.
    pub fn on_request(&self, conn: &mut Connection, env: Envelope) -> Vec<ObjectChange> {
        let method = env.method.clone().unwrap_or_default();
        let outcome = self.dispatch(conn, &method, env.params());
        match outcome {
            Ok(handled) => {
                emit_protocol_event(conn.id(), LogLevel::Debug, &method, "ok", None);
                if let Some(id) = env.id {
                    self.reply(conn, OutboundMessage::response(&method, id, handled.result));
                }
                handled.changes
            }
            Err(err) => {
                emit_protocol_event(
                    conn.id(),
                    LogLevel::Warn,
                    &method,
                    err.code.as_str(),
                    Some(err.message.clone()),
                );
                if let Some(id) = env.id {
                    self.reply(conn, OutboundMessage::error(&method, id, err));
                }
                Vec::new()
            }
        }
    }

    /// A response or error response to one of our requests.
    pub fn on_response(&self, conn: &mut Connection, env: Envelope) {
        let outcome = match env.kind {
            MessageKind::ErrorResponse => Err(RequestFailure::Remote(
                env.error()
                    .unwrap_or_else(|| RpcError::new(ErrorCode::Protocol, "empty error")),
            )),
            _ => Ok(env.payload),
        };
        conn.complete_request(env.id.as_ref(), outcome);
    }

    pub fn on_parse_error(&self, conn: &mut Connection, err: ParseError) {
        emit_protocol_event(
            conn.id(),
            LogLevel::Warn,
            "",
            ErrorCode::Parse.as_str(),
            Some(err.reason.clone()),
        );
        if let Some(id) = err.id {
            self.reply(
                conn,
                OutboundMessage::error("", id, RpcError::new(ErrorCode::Parse, err.reason)),
            );
        }
    }

    fn reply(&self, conn: &mut Connection, msg: OutboundMessage) {
        let sent = msg
            .prepare(&self.encode_context())
            .and_then(|prepared| conn.enqueue(&prepared, None));
        if let Err(e) = sent {
            emit_protocol_event(conn.id(), LogLevel::Warn, &msg.method, "reply_failed", Some(e.to_string()));
        }
    }

    fn dispatch(&self, conn: &mut Connection, method: &str, params: &[Value]) -> Result<Handled, RpcError> {
        let rule = RULES
            .iter()
            .find(|r| r.name == method)
            .ok_or_else(|| RpcError::new(ErrorCode::Unsupported, format!("unknown method '{}'", method)))?;
        if method == methods::SEND_IDENTITY {
            return self.send_identity(conn, params);
        }
        if !conn.is_ready() {
            return Err(RpcError::new(
                ErrorCode::NotReady,
                format!("{} before identity handshake", method),
            ));
        }
        if let Some(required) = rule.peer {
            if !conn.role().contains(required) {
                return Err(RpcError::new(
                    ErrorCode::Permission,
                    format!("role {} may not call {}", conn.role(), method),
                ));
            }
        }
        if let Some(served) = rule.server {
            if !self.identity.roles.contains(served) {
                return Err(RpcError::new(
                    ErrorCode::Unsupported,
                    format!("this server does not act as {}", served),
                ));
            }
        }

        match method {
            methods::POLICY_RESOLVE => self.resolve(conn, params, "policy_uri", "policy"),
            methods::POLICY_UNRESOLVE => self.unresolve(conn, params, "policy_uri"),
            methods::POLICY_UPDATE => self.apply_update(params, true),
            methods::ENDPOINT_DECLARE => self.store_objects(params, "endpoint"),
            methods::ENDPOINT_UNDECLARE => self.delete_refs(params, "endpoint_uri"),
            methods::ENDPOINT_RESOLVE => self.resolve(conn, params, "endpoint_uri", "endpoint"),
            methods::ENDPOINT_UPDATE => self.apply_update(params, false),
            methods::STATE_REPORT => self.store_objects(params, "observable"),
            methods::ECHO => Ok(Handled::result(Value::Array(params.to_vec()))),
            _ => Err(RpcError::new(ErrorCode::Unsupported, format!("unknown method '{}'", method))),
        }
    }

    fn send_identity(&self, conn: &mut Connection, params: &[Value]) -> Result<Handled, RpcError> {
        if conn.is_ready() {
            return Err(RpcError::new(ErrorCode::Protocol, "identity already negotiated"));
        }
        let p = params
            .first()
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("send_identity expects one object parameter"))?;
        let role = match p.get("my_role") {
            Some(Value::String(name)) => Role::from_names(&[name.as_str()]),
            Some(Value::Array(names)) => {
                let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
                Role::from_names(&names)
            }
            _ => Err("my_role missing".to_string()),
        }
        .map_err(invalid)?;
        if role.is_empty() {
            return Err(invalid("my_role names no role"));
        }

        let text = |key: &str| p.get(key).and_then(Value::as_str).map(String::from);
        conn.complete_handshake(text("name"), text("domain"), role);
        if role.contains(Role::POLICY_ELEMENT) {
            self.pending.lock().register(conn.id());
        }
        Ok(Handled::result(self.identity.to_json()))
    }

    /// (subject, uri) pair from a resolve-style parameter.
    fn subject_uri<'a>(&self, p: &'a Value, uri_key: &str) -> Result<(&'a str, Uri), RpcError> {
        let subject = p
            .get("subject")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing subject"))?;
        let uri = p
            .get(uri_key)
            .or_else(|| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("missing {}", uri_key)))?;
        Ok((subject, Uri::new(uri)))
    }

    fn resolve(
        &self,
        conn: &mut Connection,
        params: &[Value],
        uri_key: &str,
        result_key: &str,
    ) -> Result<Handled, RpcError> {
        let mut targets = Vec::with_capacity(params.len());
        for p in params {
            let (subject, uri) = self.subject_uri(p, uri_key)?;
            let class = self
                .store
                .class_by_name(subject)
                .ok_or_else(|| invalid(format!("unknown subject '{}'", subject)))?;
            targets.push((class.id, uri));
        }
        let mut objects = Vec::new();
        for (class_id, uri) in targets {
            match self
                .store
                .serialize(class_id, &uri, &self.client, &mut objects, true)
            {
                // not there yet; the peer still hears about it when it appears
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(store_error(e)),
            }
            self.pending.lock().resolve(conn.id(), uri);
        }
        let mut result = Map::new();
        result.insert(result_key.to_string(), Value::Array(objects));
        Ok(Handled::result(Value::Object(result)))
    }

    fn unresolve(&self, conn: &mut Connection, params: &[Value], uri_key: &str) -> Result<Handled, RpcError> {
        let mut uris = Vec::with_capacity(params.len());
        for p in params {
            let (_, uri) = self.subject_uri(p, uri_key)?;
            uris.push(uri);
        }
        let mut pending = self.pending.lock();
        for uri in &uris {
            pending.unresolve(conn.id(), uri);
        }
        Ok(Handled::result(json!({})))
    }

    fn apply(&self, doc: &Value, op: PolicyUpdateOp) -> Result<Vec<ObjectChange>, RpcError> {
        self.store
            .update_objects(doc, &self.client, op)
            .map_err(store_error)
    }

    /// `policy_update` / `endpoint_update` pushed by another server.
    fn apply_update(&self, params: &[Value], with_merge: bool) -> Result<Handled, RpcError> {
        let mut changes = Vec::new();
        for p in params {
            if !p.is_object() {
                return Err(invalid("update parameter must be an object"));
            }
            let sections: &[(&str, PolicyUpdateOp)] = if with_merge {
                &[
                    ("replace", PolicyUpdateOp::Replace),
                    ("merge_children", PolicyUpdateOp::MergeChildren),
                    ("delete", PolicyUpdateOp::Delete),
                ]
            } else {
                &[("replace", PolicyUpdateOp::Replace), ("delete", PolicyUpdateOp::Delete)]
            };
            for (key, op) in sections {
                match p.get(*key) {
                    Some(doc @ Value::Array(_)) => changes.extend(self.apply(doc, *op)?),
                    None | Some(Value::Null) => {}
                    Some(_) => return Err(invalid(format!("{} must be an array", key))),
                }
            }
        }
        Ok(Handled {
            result: json!({}),
            changes,
        })
    }

    /// `endpoint_declare` / `state_report`: each param carries an object array under `key`.
    fn store_objects(&self, params: &[Value], key: &str) -> Result<Handled, RpcError> {
        let mut changes = Vec::new();
        for p in params {
            let doc = p
                .get(key)
                .filter(|v| v.is_array())
                .ok_or_else(|| invalid(format!("missing {} array", key)))?;
            changes.extend(self.apply(doc, PolicyUpdateOp::Replace)?);
        }
        Ok(Handled {
            result: json!({}),
            changes,
        })
    }

    fn delete_refs(&self, params: &[Value], uri_key: &str) -> Result<Handled, RpcError> {
        let mut refs = Vec::with_capacity(params.len());
        for p in params {
            let (subject, uri) = self.subject_uri(p, uri_key)?;
            refs.push(json!({ "subject": subject, "uri": uri }));
        }
        let changes = self.apply(&Value::Array(refs), PolicyUpdateOp::Delete)?;
        Ok(Handled {
            result: json!({}),
            changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::{ConnectionId, ConnectionLimits, ConnectionState};
    use crate::network::pending::PendingUpdates;
    use crate::network::transport::{TransportHandle, WriteQueue};
    use crate::security::{AuthSummary, SecurityBackend};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        pending: SharedPending,
        handler: Handler,
        conn: Connection,
        queue: WriteQueue,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.register_class(1, "PolicyUniverse");
        let pending = PendingUpdates::shared();
        let handler = Handler::new(store.clone(), Identity::default(), pending.clone());
        let mut conn = Connection::new(
            ConnectionId::new(9),
            "127.0.0.1:1".parse().unwrap(),
            ConnectionLimits {
                max_frame_bytes: 1 << 20,
                outbound_high_water_bytes: 1 << 20,
            },
        );
        let (handle, queue, _stop) = TransportHandle::pair();
        conn.attach(
            handle,
            AuthSummary {
                backend: SecurityBackend::Plaintext,
                peer_certificates: 0,
                protocol: None,
            },
        );
        Fixture {
            store,
            pending,
            handler,
            conn,
            queue,
        }
    }

    impl Fixture {
        fn send(&mut self, frame: Value) -> Vec<ObjectChange> {
            let mut bytes = serde_json::to_vec(&frame).unwrap();
            bytes.push(0);
            self.conn.on_receive_bytes(&bytes, &self.handler).unwrap()
        }

        /// Frames written since the last call; completes the outstanding write.
        fn replies(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Some(bufs) = self.queue.try_next() {
                let n: usize = bufs.iter().map(|b| b.len()).sum();
                for b in bufs {
                    out.push(serde_json::from_slice(&b[..b.len() - 1]).unwrap());
                }
                self.queue.complete();
                self.conn.on_write_complete(n);
            }
            out
        }

        fn identify(&mut self, roles: &[&str]) -> Value {
            self.send(json!({"method": "send_identity", "id": 1,
                "params": [{"name": "agent", "domain": "d", "my_role": roles}]}));
            self.replies().remove(0)
        }
    }

    #[test]
    fn handshake_makes_connection_ready() {
        let mut f = fixture();
        let reply = f.identify(&["policy_element"]);
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["error"], Value::Null);
        assert!(reply["result"]["my_role"].as_array().unwrap().len() >= 1);
        assert_eq!(f.conn.state(), ConnectionState::Ready);
        assert_eq!(f.conn.role(), Role::POLICY_ELEMENT);
        assert!(f.pending.lock().is_registered(f.conn.id()));
    }

    #[test]
    fn request_before_handshake_is_rejected_without_state_change() {
        let mut f = fixture();
        f.send(json!({"method": "echo", "id": 5, "params": []}));
        let reply = f.replies().remove(0);
        assert_eq!(reply["error"]["code"], "ENOTREADY");
        assert_eq!(f.conn.state(), ConnectionState::Handshaking);
    }

    #[test]
    fn second_handshake_is_a_protocol_error() {
        let mut f = fixture();
        f.identify(&["policy_element"]);
        let reply = f.identify(&["observer"]);
        assert_eq!(reply["error"]["code"], "EPROTO");
        assert_eq!(f.conn.role(), Role::POLICY_ELEMENT);
    }

    #[test]
    fn observer_cannot_push_policy() {
        let mut f = fixture();
        f.identify(&["observer"]);
        let changes = f.send(json!({"method": "policy_update", "id": 2, "params": [
            {"replace": [{"subject": "PolicyUniverse", "uri": "/pu/"}]}
        ]}));
        let reply = f.replies().remove(0);
        assert_eq!(reply["error"]["code"], "EPERM");
        assert!(changes.is_empty());
        assert!(f.store.is_empty());
    }

    #[test]
    fn repository_peer_can_push_policy() {
        let mut f = fixture();
        f.identify(&["policy_repository"]);
        let changes = f.send(json!({"method": "policy_update", "id": 2, "params": [
            {"replace": [{"subject": "PolicyUniverse", "uri": "/pu/"}], "merge_children": [], "delete": []}
        ]}));
        assert_eq!(f.replies().remove(0)["result"], json!({}));
        assert_eq!(changes.len(), 1);
        assert!(f.store.contains(&Uri::new("/pu/")));
    }

    #[test]
    fn resolve_returns_objects_and_records_interest() {
        let mut f = fixture();
        f.store
            .update_objects(
                &json!([{"subject": "PolicyUniverse", "uri": "/pu/"}]),
                &StoreClient::new("t"),
                PolicyUpdateOp::Replace,
            )
            .unwrap();
        f.identify(&["policy_element"]);
        f.send(json!({"method": "policy_resolve", "id": 3,
            "params": [{"subject": "PolicyUniverse", "policy_uri": "/pu/"}]}));
        let reply = f.replies().remove(0);
        assert_eq!(reply["result"]["policy"][0]["uri"], "/pu/");
        assert!(f.pending.lock().is_interested(f.conn.id(), &Uri::new("/pu/")));

        f.send(json!({"method": "policy_unresolve", "id": 4,
            "params": [{"subject": "PolicyUniverse", "policy_uri": "/pu/"}]}));
        f.replies();
        assert!(!f.pending.lock().is_interested(f.conn.id(), &Uri::new("/pu/")));
    }

    #[test]
    fn unknown_method_and_bad_frame_get_error_responses() {
        let mut f = fixture();
        f.identify(&["policy_element"]);
        f.send(json!({"method": "frobnicate", "id": 6, "params": []}));
        assert_eq!(f.replies().remove(0)["error"]["code"], "EUNSUPPORTED");

        f.conn
            .on_receive_bytes(b"{\"method\": 7, \"id\": 8}\0", &f.handler)
            .unwrap();
        let reply = f.replies().remove(0);
        assert_eq!(reply["error"]["code"], "EPARSE");
        assert_eq!(reply["id"], 8);

        // no id: logged, connection stays up
        f.conn.on_receive_bytes(b"garbage\0", &f.handler).unwrap();
        assert!(f.replies().is_empty());
        assert!(f.conn.is_ready());
    }

    #[test]
    fn echo_returns_params() {
        let mut f = fixture();
        f.identify(&["observer"]);
        f.send(json!({"method": "echo", "id": "k", "params": [1, 2]}));
        assert_eq!(f.replies().remove(0)["result"], json!([1, 2]));
    }
}
