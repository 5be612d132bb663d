//! Session records and the CREATE_SESSION argument/reply types.

use tokio::time::Instant;

use crate::config::ChannelLimits;
use crate::protocol::xdr::nfs4::{
    callback_sec_parms4, channel_attrs4, CREATE_SESSION4args, CREATE_SESSION4resok,
};
use crate::session::slot_table::SlotTable;
use crate::session::{ClientId, SessionId};

/// Which channel of a session a request travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Client to server requests.
    Fore,
    /// Server to client callbacks.
    Back,
}

/// Negotiated attributes of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelAttrs {
    pub header_pad_size: u32,
    pub max_request_size: u32,
    pub max_response_size: u32,
    pub max_response_size_cached: u32,
    pub max_operations: u32,
    /// Number of slots, and so the maximum number of concurrent requests.
    pub max_requests: u32,
    /// Inbound RDMA read depth; only present when RDMA was asked for.
    pub rdma_ird: Option<u32>,
}

impl ChannelAttrs {
    /// Clamps requested attributes to the server maximums.
    ///
    /// Header padding and RDMA are never granted and the slot count is at
    /// least one.
    pub fn negotiate(&self, limits: &ChannelLimits) -> ChannelAttrs {
        ChannelAttrs {
            header_pad_size: 0,
            max_request_size: self.max_request_size.min(limits.max_request_size),
            max_response_size: self.max_response_size.min(limits.max_response_size),
            max_response_size_cached: self
                .max_response_size_cached
                .min(limits.max_response_size_cached),
            max_operations: self.max_operations.min(limits.max_operations),
            max_requests: self.max_requests.clamp(1, limits.max_slots.max(1)),
            rdma_ird: None,
        }
    }
}

impl From<&channel_attrs4> for ChannelAttrs {
    fn from(attrs: &channel_attrs4) -> Self {
        Self {
            header_pad_size: attrs.ca_headerpadsize,
            max_request_size: attrs.ca_maxrequestsize,
            max_response_size: attrs.ca_maxresponsesize,
            max_response_size_cached: attrs.ca_maxresponsesize_cached,
            max_operations: attrs.ca_maxoperations,
            max_requests: attrs.ca_maxrequests,
            rdma_ird: attrs.ca_rdma_ird.first().copied(),
        }
    }
}

impl From<&ChannelAttrs> for channel_attrs4 {
    fn from(attrs: &ChannelAttrs) -> Self {
        Self {
            ca_headerpadsize: attrs.header_pad_size,
            ca_maxrequestsize: attrs.max_request_size,
            ca_maxresponsesize: attrs.max_response_size,
            ca_maxresponsesize_cached: attrs.max_response_size_cached,
            ca_maxoperations: attrs.max_operations,
            ca_maxrequests: attrs.max_requests,
            ca_rdma_ird: attrs.rdma_ird.into_iter().collect(),
        }
    }
}

/// Decoded CREATE_SESSION arguments.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionArgs {
    pub client_id: ClientId,
    /// Sequence ID of the client's CREATE_SESSION slot.
    pub sequence: u32,
    /// `CREATE_SESSION4_FLAG_*` bits asked for.
    pub flags: u32,
    pub fore_attrs: ChannelAttrs,
    pub back_attrs: ChannelAttrs,
    pub cb_program: u32,
    pub cb_sec_parms: Vec<callback_sec_parms4>,
}

impl From<&CREATE_SESSION4args> for CreateSessionArgs {
    fn from(args: &CREATE_SESSION4args) -> Self {
        Self {
            client_id: args.csa_clientid,
            sequence: args.csa_sequence,
            flags: args.csa_flags,
            fore_attrs: (&args.csa_fore_chan_attrs).into(),
            back_attrs: (&args.csa_back_chan_attrs).into(),
            cb_program: args.csa_cb_program,
            cb_sec_parms: args.csa_sec_parms.clone(),
        }
    }
}

/// CREATE_SESSION result, also kept as the client's replay cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionReply {
    pub session_id: SessionId,
    pub sequence: u32,
    /// `CREATE_SESSION4_FLAG_*` bits granted.
    pub flags: u32,
    pub fore_attrs: ChannelAttrs,
    pub back_attrs: ChannelAttrs,
}

impl From<&CreateSessionReply> for CREATE_SESSION4resok {
    fn from(reply: &CreateSessionReply) -> Self {
        Self {
            csr_sessionid: reply.session_id.into(),
            csr_sequence: reply.sequence,
            csr_flags: reply.flags,
            csr_fore_chan_attrs: (&reply.fore_attrs).into(),
            csr_back_chan_attrs: (&reply.back_attrs).into(),
        }
    }
}

/// One NFSv4.1 session.
///
/// Owned by exactly one client, referenced by ID everywhere else. The slot
/// tables carry their own locks; the record itself is immutable.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client_id: ClientId,
    flags: u32,
    fore_attrs: ChannelAttrs,
    back_attrs: ChannelAttrs,
    cb_program: u32,
    cb_sec_parms: Vec<callback_sec_parms4>,
    created_at: Instant,
    fore: SlotTable,
    back: Option<SlotTable>,
}

impl Session {
    /// Builds a session from already negotiated attributes. The back channel
    /// slot table exists only if `back_channel` is set.
    pub(crate) fn new(
        id: SessionId,
        client_id: ClientId,
        flags: u32,
        fore_attrs: ChannelAttrs,
        back_attrs: ChannelAttrs,
        back_channel: bool,
        args: &CreateSessionArgs,
    ) -> Self {
        let fore = SlotTable::with_cache_limit(
            fore_attrs.max_requests,
            fore_attrs.max_response_size_cached as usize,
        );
        let back = back_channel.then(|| {
            SlotTable::with_cache_limit(
                back_attrs.max_requests,
                back_attrs.max_response_size_cached as usize,
            )
        });
        Self {
            id,
            client_id,
            flags,
            fore_attrs,
            back_attrs,
            cb_program: args.cb_program,
            cb_sec_parms: args.cb_sec_parms.clone(),
            created_at: Instant::now(),
            fore,
            back,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Granted `CREATE_SESSION4_FLAG_*` bits.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn fore_attrs(&self) -> &ChannelAttrs {
        &self.fore_attrs
    }

    pub fn back_attrs(&self) -> &ChannelAttrs {
        &self.back_attrs
    }

    /// RPC program number callbacks are sent to.
    pub fn cb_program(&self) -> u32 {
        self.cb_program
    }

    pub fn cb_sec_parms(&self) -> &[callback_sec_parms4] {
        &self.cb_sec_parms
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn has_back_channel(&self) -> bool {
        self.back.is_some()
    }

    pub fn slot_table(&self, channel: Channel) -> Option<&SlotTable> {
        match channel {
            Channel::Fore => Some(&self.fore),
            Channel::Back => self.back.as_ref(),
        }
    }
}
