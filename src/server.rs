//! Server orchestrator: owns the event-loop thread and bridges the external
//! object store to the listener.

use crate::config::{Config, PeerConfig};
use crate::constants::SYSTEM_STORE_CLIENT;
use crate::error::{ListenerError, ServerError};
use crate::events::dispatcher::emit_system_event;
use crate::events::model::LogLevel;
use crate::network::connection::{ConnectionId, ConnectionInfo, RequestReply};
use crate::network::handler::Identity;
use crate::network::listener::{Listener, ListenerHandle, ListenerSettings, ShutdownReport};
use crate::network::message::OutboundMessage;
use crate::network::role::Role;
use crate::security::{make_secure_channel, SecureChannel, TlsSecureChannel, TlsServerSettings};
use crate::store::{ClassId, ObjectStore, PolicyUpdateOp, Reference, StoreClient, Uri};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

struct Running {
    handle: ListenerHandle,
    thread: JoinHandle<Result<ShutdownReport, ListenerError>>,
}

pub struct PolicyServer {
    config: Config,
    store: Arc<dyn ObjectStore>,
    client: StoreClient,
    channel: Option<Arc<dyn SecureChannel>>,
    running: Option<Running>,
}

impl PolicyServer {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        let client = store.store_client(SYSTEM_STORE_CLIENT);
        Self {
            config,
            store,
            client,
            channel: None,
            running: None,
        }
    }

    /// Serve TLS with the given material instead of what the config says.
    /// Takes effect at the next `start`.
    pub fn enable_ssl(&mut self, settings: &TlsServerSettings) -> Result<(), ServerError> {
        self.channel = Some(Arc::new(TlsSecureChannel::server(settings)?));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listener and spawn the event-loop thread. Returns once the
    /// socket is bound, or with the bind error.
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let channel = match &self.channel {
            Some(ch) => ch.clone(),
            None => make_secure_channel(&self.config)?,
        };
        let settings = ListenerSettings::from_config(&self.config);
        let identity = Identity::from_config(&self.config);
        let store = self.store.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<ListenerHandle, ServerError>>();

        let thread = std::thread::Builder::new()
            .name("opflex-loop".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ServerError::Runtime(e.to_string())));
                        return Err(ListenerError::Stopped);
                    }
                };
                rt.block_on(async move {
                    match Listener::bind(settings, channel, store, identity).await {
                        Ok((listener, handle)) => {
                            let _ = ready_tx.send(Ok(handle));
                            listener.run().await
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.into()));
                            Err(ListenerError::Stopped)
                        }
                    }
                })
            })?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(ServerError::Runtime("event loop exited during startup".into())));
        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                let _ = thread.join();
                return Err(e);
            }
        };
        let addr = handle.local_addr();
        emit_system_event(
            "server",
            LogLevel::Info,
            "server_started",
            Some(format!("addr={} roles={}", addr, self.config.roles)),
        );
        self.running = Some(Running { handle, thread });
        Ok(addr)
    }

    /// Stop accepting, drain connections and join the loop thread. No tick
    /// runs after this returns.
    pub fn stop(&mut self) -> Result<ShutdownReport, ServerError> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;
        // a loop that already exited still gets joined below
        let _ = running.handle.shutdown();
        let report = running
            .thread
            .join()
            .map_err(|_| ServerError::Runtime("event loop panicked".into()))??;

        for (id, bytes) in &report.truncated {
            emit_system_event(
                "server",
                LogLevel::Warn,
                "output_truncated",
                Some(format!("{} discarded {} queued bytes", id, bytes)),
            );
        }
        emit_system_event(
            "server",
            LogLevel::Info,
            "server_stopped",
            Some(format!(
                "closed={} flushed={} truncated={}",
                report.closed,
                report.flushed,
                report.truncated.len()
            )),
        );
        Ok(report)
    }

    fn handle(&self) -> Result<&ListenerHandle, ServerError> {
        self.running
            .as_ref()
            .map(|r| &r.handle)
            .ok_or(ServerError::NotRunning)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Load a policy file into the store; returns the number of objects read.
    pub fn read_policy(&self, path: impl AsRef<Path>) -> Result<usize, ServerError> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path)?;
        let count = self.store.read_objects(&mut file, &self.client)?;
        emit_system_event(
            "server",
            LogLevel::Info,
            "policy_loaded",
            Some(format!("{} objects from {}", count, path.display())),
        );
        Ok(count)
    }

    /// Apply an external change to the store, queue it for interested peers
    /// and flush. Returns the number of objects changed.
    pub fn update_policy(&self, doc: &Value, op: PolicyUpdateOp) -> Result<usize, ServerError> {
        let changes = self.store.update_objects(doc, &self.client, op)?;
        if let Ok(handle) = self.handle() {
            for change in &changes {
                handle.add_pending_update(change.class_id, &change.uri, change.op);
            }
            handle.send_updates()?;
        }
        Ok(changes.len())
    }

    /// Push one policy update to every PolicyElement peer.
    pub fn policy_update(
        &self,
        replace: Vec<Reference>,
        merge_children: Vec<Reference>,
        delete: Vec<Reference>,
    ) -> Result<(), ServerError> {
        let msg = OutboundMessage::policy_update(replace, merge_children, delete);
        Ok(self.handle()?.send_to_all(msg)?)
    }

    pub fn policy_update_to(
        &self,
        conn: ConnectionId,
        replace: Vec<Reference>,
        merge_children: Vec<Reference>,
        delete: Vec<Reference>,
    ) -> Result<(), ServerError> {
        let msg = OutboundMessage::policy_update(replace, merge_children, delete);
        Ok(self.handle()?.send_to_one(conn, msg)?)
    }

    pub fn endpoint_update(&self, replace: Vec<Reference>, delete: Vec<Reference>) -> Result<(), ServerError> {
        let msg = OutboundMessage::endpoint_update(replace, delete);
        Ok(self.handle()?.send_to_all(msg)?)
    }

    /// Store change notification: queue the change for every peer that
    /// resolved `uri`. Returns how many peers it was queued for.
    pub fn remote_object_updated(
        &self,
        class_id: ClassId,
        uri: &Uri,
        op: PolicyUpdateOp,
    ) -> Result<usize, ServerError> {
        Ok(self.handle()?.add_pending_update(class_id, uri, op))
    }

    /// Flush pending updates without waiting for the reconciliation tick.
    pub fn send_updates(&self) -> Result<(), ServerError> {
        Ok(self.handle()?.send_updates()?)
    }

    /// Send a request to one peer; the receiver yields its outcome.
    pub fn request(
        &self,
        conn: ConnectionId,
        method: &str,
        param: Value,
    ) -> Result<oneshot::Receiver<RequestReply>, ServerError> {
        Ok(self.handle()?.request(conn, OutboundMessage::request(method, param))?)
    }

    pub fn close_connection(&self, conn: ConnectionId) -> Result<(), ServerError> {
        Ok(self.handle()?.close_connection(conn)?)
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, ServerError> {
        Ok(self.handle()?.connections().await?)
    }

    pub fn peers(&self) -> &[PeerConfig] {
        self.config.peers.as_deref().unwrap_or(&[])
    }

    pub fn proxies(&self) -> &[String] {
        self.config.proxies.as_deref().unwrap_or(&[])
    }

    /// Bound port while running, the configured one otherwise.
    pub fn port(&self) -> u16 {
        self.local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.port)
    }

    pub fn roles(&self) -> Role {
        self.config.roles
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.handle.local_addr())
    }
}

impl Drop for PolicyServer {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop();
        }
    }
}
