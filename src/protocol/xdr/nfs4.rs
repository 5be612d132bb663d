//! XDR data types for the NFSv4.1 session operations (RFC 8881 section 18 and
//! RFC 5662).
//!
//! Only the pieces of the NFSv4.1 protocol that the session layer consumes
//! or produces live here: status codes, session and channel descriptions,
//! and the argument/result bodies of EXCHANGE_ID's successors
//! (CREATE_SESSION, SEQUENCE, BIND_CONN_TO_SESSION, DESTROY_SESSION,
//! DESTROY_CLIENTID and RECLAIM_COMPLETE). The COMPOUND envelope and all
//! file-system operations are encoded elsewhere.

// Keep the RFC 8881 naming conventions
#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::utils::invalid_data;
use super::{deserialize, Deserialize, DeserializeEnum, Serialize, SerializeEnum};
use crate::{DeserializeStruct, SerializeStruct};

/// The RPC program number shared by every NFS version.
pub const PROGRAM: u32 = 100003;
/// NFSv4 protocol version; minor versions are negotiated inside COMPOUND.
pub const VERSION: u32 = 4;
/// The only minor version this session layer serves.
pub const MINOR_VERSION: u32 = 1;

/// Size in bytes of a session identifier.
pub const NFS4_SESSIONID_SIZE: usize = 16;
/// Size in bytes of a client or write verifier.
pub const NFS4_VERIFIER_SIZE: usize = 8;

pub type sessionid4 = [u8; NFS4_SESSIONID_SIZE];
pub type verifier4 = [u8; NFS4_VERIFIER_SIZE];
pub type clientid4 = u64;
pub type sequenceid4 = u32;
pub type slotid4 = u32;
pub type count4 = u32;

/// `csa_flags` / `csr_flags`: the client asks the server to persist the reply cache.
pub const CREATE_SESSION4_FLAG_PERSIST: u32 = 0x0000_0001;
/// The connection carrying CREATE_SESSION also serves as the back channel.
pub const CREATE_SESSION4_FLAG_CONN_BACK_CHAN: u32 = 0x0000_0002;
/// The connection carrying CREATE_SESSION should switch to RDMA mode.
pub const CREATE_SESSION4_FLAG_CONN_RDMA: u32 = 0x0000_0004;

/// `sr_status_flags`: no back channel path exists for the client.
pub const SEQ4_STATUS_CB_PATH_DOWN: u32 = 0x0000_0001;
pub const SEQ4_STATUS_CB_GSS_CONTEXTS_EXPIRING: u32 = 0x0000_0002;
pub const SEQ4_STATUS_CB_GSS_CONTEXTS_EXPIRED: u32 = 0x0000_0004;
pub const SEQ4_STATUS_EXPIRED_ALL_STATE_REVOKED: u32 = 0x0000_0008;
pub const SEQ4_STATUS_EXPIRED_SOME_STATE_REVOKED: u32 = 0x0000_0010;
pub const SEQ4_STATUS_ADMIN_STATE_REVOKED: u32 = 0x0000_0020;
pub const SEQ4_STATUS_RECALLABLE_STATE_REVOKED: u32 = 0x0000_0040;
pub const SEQ4_STATUS_LEASE_MOVED: u32 = 0x0000_0080;
pub const SEQ4_STATUS_RESTART_RECLAIM_NEEDED: u32 = 0x0000_0100;
/// `sr_status_flags`: this session has no back channel connection.
pub const SEQ4_STATUS_CB_PATH_DOWN_SESSION: u32 = 0x0000_0200;
pub const SEQ4_STATUS_BACKCHANNEL_FAULT: u32 = 0x0000_0400;

/// Status codes returned by NFSv4.1 operations that the session layer can produce.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum nfsstat4 {
    /// Everything is okay.
    #[default]
    NFS4_OK = 0,
    /// Caller not privileged.
    NFS4ERR_PERM = 1,
    /// Invalid argument.
    NFS4ERR_INVAL = 22,
    /// Argument or reply too small.
    NFS4ERR_TOOSMALL = 10005,
    /// A failure on the server.
    NFS4ERR_SERVERFAULT = 10006,
    /// The server is busy; the client should retry later.
    NFS4ERR_DELAY = 10008,
    /// The server is in its grace period.
    NFS4ERR_GRACE = 10013,
    /// The client ID is in use by another principal.
    NFS4ERR_CLID_INUSE = 10017,
    /// Out of resources.
    NFS4ERR_RESOURCE = 10018,
    /// The client ID is unknown or expired.
    NFS4ERR_STALE_CLIENTID = 10022,
    /// Reclaim outside of the grace period.
    NFS4ERR_NO_GRACE = 10033,
    /// The arguments could not be decoded.
    NFS4ERR_BADXDR = 10036,
    /// The session ID is unknown.
    NFS4ERR_BADSESSION = 10052,
    /// The slot ID is outside the slot table.
    NFS4ERR_BADSLOT = 10053,
    /// RECLAIM_COMPLETE was already done for this client.
    NFS4ERR_COMPLETE_ALREADY = 10054,
    /// The connection is not bound to the session.
    NFS4ERR_CONN_NOT_BOUND_TO_SESSION = 10055,
    /// The sequence ID does not follow the slot's last sequence ID.
    NFS4ERR_SEQ_MISORDERED = 10063,
    /// SEQUENCE was not the first operation of the COMPOUND.
    NFS4ERR_SEQUENCE_POS = 10064,
    /// The request exceeds the channel's maximum request size.
    NFS4ERR_REQ_TOO_BIG = 10065,
    /// The reply exceeds the channel's maximum response size.
    NFS4ERR_REP_TOO_BIG = 10066,
    /// The reply exceeds the channel's maximum cached response size.
    NFS4ERR_REP_TOO_BIG_TO_CACHE = 10067,
    /// A retry was received for a request whose reply was not cached.
    NFS4ERR_RETRY_UNCACHED_REP = 10068,
    /// The COMPOUND has more operations than the channel allows.
    NFS4ERR_TOO_MANY_OPS = 10070,
    /// The client ID still owns sessions or state.
    NFS4ERR_CLIENTID_BUSY = 10074,
}
impl SerializeEnum for nfsstat4 {}
impl DeserializeEnum for nfsstat4 {}

/// Direction requested by BIND_CONN_TO_SESSION.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum channel_dir_from_client4 {
    #[default]
    CDFC4_FORE = 0x1,
    CDFC4_BACK = 0x2,
    CDFC4_FORE_OR_BOTH = 0x3,
    CDFC4_BACK_OR_BOTH = 0x7,
}
impl SerializeEnum for channel_dir_from_client4 {}
impl DeserializeEnum for channel_dir_from_client4 {}

/// Direction granted by BIND_CONN_TO_SESSION.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum channel_dir_from_server4 {
    #[default]
    CDFS4_FORE = 0x1,
    CDFS4_BACK = 0x2,
    CDFS4_BOTH = 0x3,
}
impl SerializeEnum for channel_dir_from_server4 {}
impl DeserializeEnum for channel_dir_from_server4 {}

/// Attributes of one channel (fore or back) of a session.
///
/// `ca_rdma_ird` is an XDR array with at most one element; it is present only
/// when the client asks for RDMA.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct channel_attrs4 {
    pub ca_headerpadsize: count4,
    pub ca_maxrequestsize: count4,
    pub ca_maxresponsesize: count4,
    pub ca_maxresponsesize_cached: count4,
    pub ca_maxoperations: count4,
    pub ca_maxrequests: count4,
    pub ca_rdma_ird: Vec<u32>,
}

impl Serialize for channel_attrs4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if self.ca_rdma_ird.len() > 1 {
            return Err(invalid_data("ca_rdma_ird holds at most one value"));
        }
        self.ca_headerpadsize.serialize(dest)?;
        self.ca_maxrequestsize.serialize(dest)?;
        self.ca_maxresponsesize.serialize(dest)?;
        self.ca_maxresponsesize_cached.serialize(dest)?;
        self.ca_maxoperations.serialize(dest)?;
        self.ca_maxrequests.serialize(dest)?;
        self.ca_rdma_ird.serialize(dest)
    }
}

impl Deserialize for channel_attrs4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.ca_headerpadsize.deserialize(src)?;
        self.ca_maxrequestsize.deserialize(src)?;
        self.ca_maxresponsesize.deserialize(src)?;
        self.ca_maxresponsesize_cached.deserialize(src)?;
        self.ca_maxoperations.deserialize(src)?;
        self.ca_maxrequests.deserialize(src)?;
        self.ca_rdma_ird.deserialize(src)?;
        if self.ca_rdma_ird.len() > 1 {
            return Err(invalid_data("ca_rdma_ird holds at most one value"));
        }
        Ok(())
    }
}

/// AUTH_SYS credentials the server should use on the back channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct authsys_parms {
    pub stamp: u32,
    pub machinename: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}
DeserializeStruct!(authsys_parms, stamp, machinename, uid, gid, gids);
SerializeStruct!(authsys_parms, stamp, machinename, uid, gid, gids);

/// RPCSEC_GSS handles the server should use on the back channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct gss_cb_handles4 {
    pub gcbp_service: u32,
    pub gcbp_handle_from_server: Vec<u8>,
    pub gcbp_handle_from_client: Vec<u8>,
}
DeserializeStruct!(gss_cb_handles4, gcbp_service, gcbp_handle_from_server, gcbp_handle_from_client);
SerializeStruct!(gss_cb_handles4, gcbp_service, gcbp_handle_from_server, gcbp_handle_from_client);

/// Security flavor for the back channel, discriminated by the RPC auth flavor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum callback_sec_parms4 {
    #[default]
    AUTH_NONE,
    AUTH_SYS(authsys_parms),
    RPCSEC_GSS(gss_cb_handles4),
}

const AUTH_NONE_FLAVOR: u32 = 0;
const AUTH_SYS_FLAVOR: u32 = 1;
const RPCSEC_GSS_FLAVOR: u32 = 6;

impl Serialize for callback_sec_parms4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            callback_sec_parms4::AUTH_NONE => AUTH_NONE_FLAVOR.serialize(dest),
            callback_sec_parms4::AUTH_SYS(parms) => {
                AUTH_SYS_FLAVOR.serialize(dest)?;
                parms.serialize(dest)
            }
            callback_sec_parms4::RPCSEC_GSS(handles) => {
                RPCSEC_GSS_FLAVOR.serialize(dest)?;
                handles.serialize(dest)
            }
        }
    }
}

impl Deserialize for callback_sec_parms4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = match deserialize::<u32>(src)? {
            AUTH_NONE_FLAVOR => callback_sec_parms4::AUTH_NONE,
            AUTH_SYS_FLAVOR => callback_sec_parms4::AUTH_SYS(deserialize(src)?),
            RPCSEC_GSS_FLAVOR => callback_sec_parms4::RPCSEC_GSS(deserialize(src)?),
            _ => return Err(invalid_data("Unknown callback security flavor")),
        };
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CREATE_SESSION4args {
    pub csa_clientid: clientid4,
    pub csa_sequence: sequenceid4,
    pub csa_flags: u32,
    pub csa_fore_chan_attrs: channel_attrs4,
    pub csa_back_chan_attrs: channel_attrs4,
    pub csa_cb_program: u32,
    pub csa_sec_parms: Vec<callback_sec_parms4>,
}
DeserializeStruct!(
    CREATE_SESSION4args,
    csa_clientid,
    csa_sequence,
    csa_flags,
    csa_fore_chan_attrs,
    csa_back_chan_attrs,
    csa_cb_program,
    csa_sec_parms
);
SerializeStruct!(
    CREATE_SESSION4args,
    csa_clientid,
    csa_sequence,
    csa_flags,
    csa_fore_chan_attrs,
    csa_back_chan_attrs,
    csa_cb_program,
    csa_sec_parms
);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CREATE_SESSION4resok {
    pub csr_sessionid: sessionid4,
    pub csr_sequence: sequenceid4,
    pub csr_flags: u32,
    pub csr_fore_chan_attrs: channel_attrs4,
    pub csr_back_chan_attrs: channel_attrs4,
}
DeserializeStruct!(
    CREATE_SESSION4resok,
    csr_sessionid,
    csr_sequence,
    csr_flags,
    csr_fore_chan_attrs,
    csr_back_chan_attrs
);
SerializeStruct!(
    CREATE_SESSION4resok,
    csr_sessionid,
    csr_sequence,
    csr_flags,
    csr_fore_chan_attrs,
    csr_back_chan_attrs
);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SEQUENCE4args {
    pub sa_sessionid: sessionid4,
    pub sa_sequenceid: sequenceid4,
    pub sa_slotid: slotid4,
    pub sa_highest_slotid: slotid4,
    pub sa_cachethis: bool,
}
DeserializeStruct!(
    SEQUENCE4args,
    sa_sessionid,
    sa_sequenceid,
    sa_slotid,
    sa_highest_slotid,
    sa_cachethis
);
SerializeStruct!(
    SEQUENCE4args,
    sa_sessionid,
    sa_sequenceid,
    sa_slotid,
    sa_highest_slotid,
    sa_cachethis
);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SEQUENCE4resok {
    pub sr_sessionid: sessionid4,
    pub sr_sequenceid: sequenceid4,
    pub sr_slotid: slotid4,
    pub sr_highest_slotid: slotid4,
    pub sr_target_highest_slotid: slotid4,
    pub sr_status_flags: u32,
}
DeserializeStruct!(
    SEQUENCE4resok,
    sr_sessionid,
    sr_sequenceid,
    sr_slotid,
    sr_highest_slotid,
    sr_target_highest_slotid,
    sr_status_flags
);
SerializeStruct!(
    SEQUENCE4resok,
    sr_sessionid,
    sr_sequenceid,
    sr_slotid,
    sr_highest_slotid,
    sr_target_highest_slotid,
    sr_status_flags
);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BIND_CONN_TO_SESSION4args {
    pub bctsa_sessid: sessionid4,
    pub bctsa_dir: channel_dir_from_client4,
    pub bctsa_use_conn_in_rdma_mode: bool,
}
DeserializeStruct!(BIND_CONN_TO_SESSION4args, bctsa_sessid, bctsa_dir, bctsa_use_conn_in_rdma_mode);
SerializeStruct!(BIND_CONN_TO_SESSION4args, bctsa_sessid, bctsa_dir, bctsa_use_conn_in_rdma_mode);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BIND_CONN_TO_SESSION4resok {
    pub bctsr_sessid: sessionid4,
    pub bctsr_dir: channel_dir_from_server4,
    pub bctsr_use_conn_in_rdma_mode: bool,
}
DeserializeStruct!(
    BIND_CONN_TO_SESSION4resok,
    bctsr_sessid,
    bctsr_dir,
    bctsr_use_conn_in_rdma_mode
);
SerializeStruct!(
    BIND_CONN_TO_SESSION4resok,
    bctsr_sessid,
    bctsr_dir,
    bctsr_use_conn_in_rdma_mode
);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DESTROY_SESSION4args {
    pub dsa_sessionid: sessionid4,
}
DeserializeStruct!(DESTROY_SESSION4args, dsa_sessionid);
SerializeStruct!(DESTROY_SESSION4args, dsa_sessionid);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DESTROY_CLIENTID4args {
    pub dca_clientid: clientid4,
}
DeserializeStruct!(DESTROY_CLIENTID4args, dca_clientid);
SerializeStruct!(DESTROY_CLIENTID4args, dca_clientid);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RECLAIM_COMPLETE4args {
    /// When true only one file system finished reclaiming; the session
    /// layer tracks the client-wide completion only.
    pub rca_one_fs: bool,
}
DeserializeStruct!(RECLAIM_COMPLETE4args, rca_one_fs);
SerializeStruct!(RECLAIM_COMPLETE4args, rca_one_fs);
