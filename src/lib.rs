//! NFS Mamont sessions - the NFSv4.1 session layer in Rust
//!
//! This library implements the session machinery that NFSv4.1 (RFC 8881)
//! puts between the RPC transport and the COMPOUND operations: exactly-once
//! semantics through per-session slot tables, binding of several transport
//! connections to one session (trunking), client and session lifecycle with
//! lease expiry, and the post-restart grace period.
//!
//! ## Main Components
//!
//! - `session`: [`session::SessionManager`] and its building blocks
//!   ([`session::SlotTable`], [`session::ConnectionBinder`],
//!   [`session::GracePeriodManager`]). This is what an NFSv4.1 COMPOUND
//!   dispatcher calls for EXCHANGE_ID, CREATE_SESSION, SEQUENCE,
//!   BIND_CONN_TO_SESSION, DESTROY_SESSION, DESTROY_CLIENTID and
//!   RECLAIM_COMPLETE.
//!
//! - `tcp`: TCP listener that assigns connection IDs, frames RPC records and
//!   reports disconnects to the session manager.
//!
//! - `protocol`: ONC RPC record marking and XDR encoding/decoding, including
//!   the NFSv4.1 session wire types.
//!
//! - `config`: limits and timers of the session layer.
//!
//! ## Standards Compliance
//!
//! - RFC 8881: Network File System (NFS) Version 4 Minor Version 1 Protocol
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 4506: XDR: External Data Representation Standard
//!
//! ## Usage
//!
//! Create one [`session::SessionManager`], spawn its reaper with
//! [`session::spawn_reaper`] and hand it to a [`tcp::NFSTcpListener`] together
//! with a [`tcp::RequestHandler`] implementing COMPOUND.

pub mod config;
pub mod protocol;
pub mod session;
pub mod tcp;

pub use protocol::xdr;
