use crate::events::{
    dispatcher,
    model::{LogEvent, LogLevel, NetworkEvent, ProtocolEvent},
};
use crate::network::connection::ConnectionId;

/// Emit a structured transport/listener event.
pub(crate) fn emit_network_event(
    component: &'static str,
    level: LogLevel,
    action: &str,
    addr: Option<String>,
    detail: Option<String>,
) {
    let mut meta = dispatcher::meta(component, level);
    meta.corr_id = Some(dispatcher::correlation_id());
    dispatcher::emit(LogEvent::Network(NetworkEvent {
        meta,
        action: action.to_string(),
        addr,
        detail,
    }));
}

/// Emit the outcome of one protocol exchange on a connection.
pub(crate) fn emit_protocol_event(
    connection: ConnectionId,
    level: LogLevel,
    method: &str,
    outcome: &str,
    detail: Option<String>,
) {
    let meta = dispatcher::meta("handler", level);
    dispatcher::emit(LogEvent::Protocol(ProtocolEvent {
        meta,
        connection: connection.to_string(),
        method: method.to_string(),
        outcome: outcome.to_string(),
        detail,
    }));
}
