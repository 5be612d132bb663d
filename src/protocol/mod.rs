//! Protocol module holds the wire-level pieces the NFSv4.1 session layer sits on.
//!
//! - `xdr`: External Data Representation (XDR) for serialization and deserialization
//!   of data structures according to RFC 4506, including the NFSv4.1 session
//!   operation bodies.
//!
//! - `rpc`: ONC RPC record marking (RFC 5531 section 11) used by the TCP
//!   transport to delimit requests and replies on a stream.

pub mod rpc;
pub mod xdr;
