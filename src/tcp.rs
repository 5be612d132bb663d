//! TCP transport for NFSv4.1.
//!
//! Every accepted socket becomes a connection of the [`SessionManager`]. RPC
//! records read from it are passed, together with the connection ID, to a
//! [`RequestHandler`] (the COMPOUND dispatcher) and the replies are written
//! back record-marked. Requests of one connection are processed concurrently
//! since NFSv4.1 clients pipeline them over different slots.
//!
//! A connection marked draining stops taking requests, finishes those in
//! flight and is then closed. The same happens when a request fails or a
//! reply cannot be written: requests already accepted always run to
//! completion, since one holding a session slot would otherwise never release
//! it. Closing a connection, for whatever reason, unbinds it from its session
//! immediately.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::protocol::rpc;
use crate::session::{ConnectionId, SessionManager, Transport};

/// How often an idle connection checks whether it was marked draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Records read ahead of the dispatcher per connection.
const READ_AHEAD: usize = 16;

type PendingReply = BoxFuture<'static, Result<Option<Vec<u8>>, anyhow::Error>>;

/// Dispatcher for complete RPC records.
///
/// Returning `Ok(None)` sends no reply; an error closes the connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        conn: ConnectionId,
        record: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, anyhow::Error>;
}

/// Accepts NFSv4.1 client connections.
pub struct NFSTcpListener<H: RequestHandler + 'static> {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<H>,
    sessions: Arc<SessionManager>,
}

/// Interface of a running NFS TCP server.
#[async_trait]
pub trait NFSTcp: Send + Sync {
    /// Port actually listened on, useful after binding port 0.
    fn get_listen_port(&self) -> u16;

    fn get_listen_ip(&self) -> IpAddr;

    /// Accepts connections until the listener fails.
    async fn handle_forever(&self) -> io::Result<()>;
}

impl<H: RequestHandler + 'static> NFSTcpListener<H> {
    /// Binds to `ipstr`, given as "IP:PORT" (e.g. "127.0.0.1:2049").
    pub async fn bind(
        ipstr: &str,
        handler: H,
        sessions: Arc<SessionManager>,
    ) -> io::Result<NFSTcpListener<H>> {
        let (ip, port) = ipstr.split_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "IP Address must be of form ip:port")
        })?;
        let port = port.parse::<u16>().map_err(|_| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "Port not in range 0..=65535")
        })?;

        let listener = TcpListener::bind((ip, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);
        Ok(NFSTcpListener { listener, local_addr, handler: Arc::new(handler), sessions })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

#[async_trait]
impl<H: RequestHandler + 'static> NFSTcp for NFSTcpListener<H> {
    fn get_listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn get_listen_ip(&self) -> IpAddr {
        self.local_addr.ip()
    }

    async fn handle_forever(&self) -> io::Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let conn = self.sessions.open_connection(Transport::Tcp);
            info!("Accepting connection {} from {}", conn, peer);

            let handler = self.handler.clone();
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                if let Err(e) = process_socket(socket, conn, handler, sessions.clone()).await {
                    debug!("Connection {} closed: {:?}", conn, e);
                }
                sessions.close_connection(conn);
            });
        }
    }
}

/// Serves one connection until the peer disconnects, a reply cannot be
/// written or the connection has drained. Every request taken off the socket
/// is run to completion before returning; replies produced after a failure
/// are discarded.
///
/// Reading happens on its own task because a partially read record must not
/// be dropped while a reply is being written.
async fn process_socket<H: RequestHandler + 'static>(
    socket: TcpStream,
    conn: ConnectionId,
    handler: Arc<H>,
    sessions: Arc<SessionManager>,
) -> Result<(), anyhow::Error> {
    let _ = socket.set_nodelay(true);
    let (mut reader, mut writer) = socket.into_split();

    let (records_tx, mut records) = mpsc::channel::<Vec<u8>>(READ_AHEAD);
    let read_task = tokio::spawn(async move {
        loop {
            match rpc::read_record(&mut reader).await {
                Ok(Some(record)) => {
                    if records_tx.send(record).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Record loop of connection {} broken due to {:?}", conn, e);
                    break;
                }
            }
        }
    });

    let mut in_flight: FuturesUnordered<PendingReply> = FuturesUnordered::new();
    let mut reading = true;
    let mut failure: Option<anyhow::Error> = None;
    let mut drain_poll = tokio::time::interval(DRAIN_POLL_INTERVAL);

    loop {
        if !reading && in_flight.is_empty() {
            break;
        }
        tokio::select! {
            record = records.recv(), if reading => {
                let Some(record) = record else {
                    reading = false;
                    continue;
                };
                if sessions.is_draining(conn) {
                    debug!("Connection {} is draining, dropping request", conn);
                    reading = false;
                    continue;
                }
                sessions.touch(conn);
                let handler = handler.clone();
                in_flight.push(Box::pin(async move { handler.handle(conn, record).await }));
            }
            reply = in_flight.next(), if !in_flight.is_empty() => {
                match reply {
                    Some(Ok(Some(reply))) if failure.is_none() => {
                        if let Err(e) = rpc::write_fragment(&mut writer, &reply).await {
                            error!("Write error on connection {}: {:?}", conn, e);
                            reading = false;
                            failure = Some(e);
                        }
                    }
                    Some(Ok(_)) | None => {}
                    Some(Err(e)) => {
                        debug!("Request handling on connection {} failed: {:?}", conn, e);
                        reading = false;
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
            _ = drain_poll.tick(), if reading => {
                if sessions.is_draining(conn) {
                    debug!("Connection {} drained of new requests", conn);
                    reading = false;
                }
            }
        }
    }

    read_task.abort();
    let _ = writer.shutdown().await;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
