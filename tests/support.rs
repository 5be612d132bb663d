#![allow(dead_code)]

use std::sync::Once;

use nfs_mamont_sessions::config::SessionConfig;
use nfs_mamont_sessions::session::{
    ChannelAttrs, ClientId, ConnectionId, CreateSessionArgs, SequenceArgs, SessionId,
    SessionManager, Transport,
};
use nfs_mamont_sessions::xdr::nfs4::CREATE_SESSION4_FLAG_CONN_BACK_CHAN;

static TRACING: Once = Once::new();

/// Installs a fmt subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn manager() -> SessionManager {
    manager_with(SessionConfig::default())
}

pub fn manager_with(config: SessionConfig) -> SessionManager {
    init_tracing();
    SessionManager::new(config)
}

pub fn channel_attrs(slots: u32) -> ChannelAttrs {
    ChannelAttrs {
        header_pad_size: 0,
        max_request_size: 1024 * 1024,
        max_response_size: 1024 * 1024,
        max_response_size_cached: 8 * 1024,
        max_operations: 8,
        max_requests: slots,
        rdma_ird: None,
    }
}

pub fn create_session_args(client_id: ClientId, sequence: u32, back_channel: bool) -> CreateSessionArgs {
    CreateSessionArgs {
        client_id,
        sequence,
        flags: if back_channel { CREATE_SESSION4_FLAG_CONN_BACK_CHAN } else { 0 },
        fore_attrs: channel_attrs(8),
        back_attrs: channel_attrs(2),
        cb_program: 0x4000_0000,
        cb_sec_parms: Vec::new(),
    }
}

/// A client with one session created over a fresh TCP connection.
pub struct Fixture {
    pub client: ClientId,
    pub session: SessionId,
    pub conn: ConnectionId,
}

pub fn establish(manager: &SessionManager, owner: &[u8], back_channel: bool) -> Fixture {
    let conn = manager.open_connection(Transport::Tcp);
    let exchange = manager.exchange_id(owner, [1; 8]);
    let reply = manager
        .create_session(
            conn,
            &create_session_args(exchange.client_id, exchange.sequence_id, back_channel),
        )
        .expect("create session");
    Fixture { client: exchange.client_id, session: reply.session_id, conn }
}

pub fn sequence_args(session: SessionId, slot_id: u32, sequence_id: u32) -> SequenceArgs {
    SequenceArgs { session_id: session, sequence_id, slot_id, highest_slot: slot_id, cache_this: true }
}
