//! Minimal NFSv4.1 session server.
//!
//! Each RPC record carries a single session operation: its operation number
//! followed by the XDR encoded arguments. The reply is the `nfsstat4` status,
//! followed by the result body on success. This is enough to drive the
//! session layer with a hand-written client; a real server would decode
//! COMPOUND instead.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;

use nfs_mamont_sessions::config::SessionConfig;
use nfs_mamont_sessions::session::{
    spawn_reaper, Channel, ConnectionId, CreateSessionArgs, SequenceArgs, SessionError,
    SessionManager, SlotVerdict,
};
use nfs_mamont_sessions::tcp::{NFSTcp, NFSTcpListener, RequestHandler};
use nfs_mamont_sessions::xdr::nfs4::{
    nfsstat4, verifier4, BIND_CONN_TO_SESSION4args, BIND_CONN_TO_SESSION4resok,
    CREATE_SESSION4args, CREATE_SESSION4resok, DESTROY_CLIENTID4args, DESTROY_SESSION4args,
    SEQUENCE4args, SEQUENCE4resok,
};
use nfs_mamont_sessions::xdr::{deserialize, Serialize};

const HOSTPORT: u32 = 11112;

const OP_BIND_CONN_TO_SESSION: u32 = 41;
const OP_EXCHANGE_ID: u32 = 42;
const OP_CREATE_SESSION: u32 = 43;
const OP_DESTROY_SESSION: u32 = 44;
const OP_SEQUENCE: u32 = 53;
const OP_DESTROY_CLIENTID: u32 = 57;
const OP_RECLAIM_COMPLETE: u32 = 58;

struct SessionOps {
    sessions: Arc<SessionManager>,
}

fn reply<T: Serialize>(body: Result<T, SessionError>) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match body {
        Ok(body) => {
            nfsstat4::NFS4_OK.serialize(&mut out)?;
            body.serialize(&mut out)?;
        }
        Err(e) => {
            tracing::debug!("operation failed: {}", e);
            e.status().serialize(&mut out)?;
        }
    }
    Ok(out)
}

impl SessionOps {
    fn dispatch(&self, conn: ConnectionId, record: Vec<u8>) -> std::io::Result<Vec<u8>> {
        let mut src = Cursor::new(record);
        let op = deserialize::<u32>(&mut src)?;
        match op {
            OP_EXCHANGE_ID => {
                let owner = deserialize::<Vec<u8>>(&mut src)?;
                let verifier = deserialize::<verifier4>(&mut src)?;
                let result = self.sessions.exchange_id(&owner, verifier);
                let mut body = Vec::new();
                result.client_id.serialize(&mut body)?;
                result.sequence_id.serialize(&mut body)?;
                let mut out = Vec::new();
                nfsstat4::NFS4_OK.serialize(&mut out)?;
                out.extend_from_slice(&body);
                Ok(out)
            }
            OP_CREATE_SESSION => {
                let args = deserialize::<CREATE_SESSION4args>(&mut src)?;
                let result = self
                    .sessions
                    .create_session(conn, &CreateSessionArgs::from(&args))
                    .map(|r| CREATE_SESSION4resok::from(&r));
                reply(result)
            }
            OP_SEQUENCE => {
                let args = SequenceArgs::from(&deserialize::<SEQUENCE4args>(&mut src)?);
                let result = self.sessions.sequence(conn, Channel::Fore, &args);
                if let Ok(result) = &result {
                    if let SlotVerdict::Retry(cached) = &result.verdict {
                        return Ok(cached.to_vec());
                    }
                }
                let out = reply(result.as_ref().map(SEQUENCE4resok::from).map_err(Clone::clone))?;
                if result.is_ok() {
                    if let Err(e) = self.sessions.complete_request(
                        &args.session_id,
                        Channel::Fore,
                        args.slot_id,
                        args.sequence_id,
                        args.cache_this,
                        &out,
                    ) {
                        tracing::debug!("reply for slot {} not recorded: {}", args.slot_id, e);
                    }
                }
                Ok(out)
            }
            OP_BIND_CONN_TO_SESSION => {
                let args = deserialize::<BIND_CONN_TO_SESSION4args>(&mut src)?;
                let client = deserialize::<u64>(&mut src)?;
                let result = self
                    .sessions
                    .bind_conn_to_session(
                        conn,
                        args.bctsa_sessid.into(),
                        args.bctsa_dir.into(),
                        client,
                        args.bctsa_use_conn_in_rdma_mode,
                    )
                    .map(|r| BIND_CONN_TO_SESSION4resok {
                        bctsr_sessid: r.session_id.into(),
                        bctsr_dir: r.direction.into(),
                        bctsr_use_conn_in_rdma_mode: r.use_rdma,
                    });
                reply(result)
            }
            OP_DESTROY_SESSION => {
                let args = deserialize::<DESTROY_SESSION4args>(&mut src)?;
                let client = deserialize::<u64>(&mut src)?;
                reply(self.sessions.destroy_session(args.dsa_sessionid.into(), client).map(|_| true))
            }
            OP_DESTROY_CLIENTID => {
                let args = deserialize::<DESTROY_CLIENTID4args>(&mut src)?;
                reply(self.sessions.destroy_client(args.dca_clientid).map(|_| true))
            }
            OP_RECLAIM_COMPLETE => {
                let client = deserialize::<u64>(&mut src)?;
                reply(self.sessions.reclaim_complete(client).map(|_| true))
            }
            _ => {
                let mut out = Vec::new();
                nfsstat4::NFS4ERR_INVAL.serialize(&mut out)?;
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for SessionOps {
    async fn handle(
        &self,
        conn: ConnectionId,
        record: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, anyhow::Error> {
        match self.dispatch(conn, record) {
            Ok(out) => Ok(Some(out)),
            Err(e) => {
                tracing::debug!("undecodable request on connection {}: {}", conn, e);
                let mut out = Vec::new();
                nfsstat4::NFS4ERR_BADXDR.serialize(&mut out)?;
                Ok(Some(out))
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SessionConfig::default();
    let sessions = Arc::new(SessionManager::new(config.clone()));
    let reaper = spawn_reaper(&sessions, config.reaper_interval);

    println!("Starting NFSv4.1 session server on 0.0.0.0:{HOSTPORT}");
    let listener = NFSTcpListener::bind(
        &format!("0.0.0.0:{HOSTPORT}"),
        SessionOps { sessions: sessions.clone() },
        sessions,
    )
    .await
    .unwrap();
    if let Err(e) = listener.handle_forever().await {
        eprintln!("listener failed: {e}");
    }
    reaper.shutdown().await;
}
