//! RPC (Remote Procedure Call) transport framing as specified in RFC 5531.
//!
//! Over TCP every RPC message is sent as a record made of one or more
//! fragments, each prefixed with a 4-byte header carrying the fragment length
//! and a last-fragment bit. This module reads whole records off a stream and
//! writes replies back the same way. Decoding the RPC header and the COMPOUND
//! inside it is the job of the request handler plugged into the transport.

mod record;

pub use record::{read_record, write_fragment};

/// Upper bound for a reassembled RPC record. Larger records are rejected before
/// any buffer is grown.
pub const MAX_RPC_RECORD_LENGTH: usize = 2 * 1024 * 1024;
