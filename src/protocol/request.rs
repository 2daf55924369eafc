//! Protocol-neutral requests and responses.

use crate::error::ProtocolError;
use crate::types::{CacheEntry, ClientIntelligence, EntryMetadata, TopologyId};
use bytes::Bytes;
use std::net::SocketAddr;

/// Operations understood by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Put,
    Get,
    PutIfAbsent,
    Replace,
    Append,
    Prepend,
    Remove,
    Increment,
    Decrement,
    ContainsKey,
    Clear,
    Stats,
    Version,
    Ping,
    Quit,
}

impl Opcode {
    /// Binary request code, for operations the binary protocol carries.
    pub fn binary_code(self) -> Option<u8> {
        match self {
            Opcode::Put => Some(0x01),
            Opcode::Get => Some(0x03),
            Opcode::PutIfAbsent => Some(0x05),
            Opcode::Replace => Some(0x07),
            Opcode::Remove => Some(0x0B),
            Opcode::ContainsKey => Some(0x0F),
            Opcode::Clear => Some(0x13),
            Opcode::Stats => Some(0x15),
            Opcode::Ping => Some(0x17),
            _ => None,
        }
    }

    /// Operation of a binary request code.
    pub fn from_binary(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Opcode::Put),
            0x03 => Some(Opcode::Get),
            0x05 => Some(Opcode::PutIfAbsent),
            0x07 => Some(Opcode::Replace),
            0x0B => Some(Opcode::Remove),
            0x0F => Some(Opcode::ContainsKey),
            0x13 => Some(Opcode::Clear),
            0x15 => Some(Opcode::Stats),
            0x17 => Some(Opcode::Ping),
            _ => None,
        }
    }

    /// Short name, for logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Put => "put",
            Opcode::Get => "get",
            Opcode::PutIfAbsent => "put_if_absent",
            Opcode::Replace => "replace",
            Opcode::Append => "append",
            Opcode::Prepend => "prepend",
            Opcode::Remove => "remove",
            Opcode::Increment => "incr",
            Opcode::Decrement => "decr",
            Opcode::ContainsKey => "contains_key",
            Opcode::Clear => "clear",
            Opcode::Stats => "stats",
            Opcode::Version => "version",
            Opcode::Ping => "ping",
            Opcode::Quit => "quit",
        }
    }
}

/// A decoded command with its operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Read one or more keys.
    Get { keys: Vec<Bytes> },
    Put {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    PutIfAbsent {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    Replace {
        key: Bytes,
        value: Bytes,
        metadata: EntryMetadata,
    },
    Append { key: Bytes, data: Bytes },
    Prepend { key: Bytes, data: Bytes },
    Remove { key: Bytes },
    Increment { key: Bytes, delta: u64 },
    Decrement { key: Bytes, delta: u64 },
    ContainsKey { key: Bytes },
    Clear,
    Stats,
    Version,
    Ping,
    Quit,
}

impl Command {
    /// The operation.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Get { .. } => Opcode::Get,
            Command::Put { .. } => Opcode::Put,
            Command::PutIfAbsent { .. } => Opcode::PutIfAbsent,
            Command::Replace { .. } => Opcode::Replace,
            Command::Append { .. } => Opcode::Append,
            Command::Prepend { .. } => Opcode::Prepend,
            Command::Remove { .. } => Opcode::Remove,
            Command::Increment { .. } => Opcode::Increment,
            Command::Decrement { .. } => Opcode::Decrement,
            Command::ContainsKey { .. } => Opcode::ContainsKey,
            Command::Clear => Opcode::Clear,
            Command::Stats => Opcode::Stats,
            Command::Version => Opcode::Version,
            Command::Ping => Opcode::Ping,
            Command::Quit => Opcode::Quit,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlates the response; 0 for text requests.
    pub message_id: u64,

    /// Binary protocol version.
    pub version: u8,

    /// Target cache; `None` selects the server's default cache.
    pub cache_name: Option<String>,

    /// Binary header flags.
    pub flags: u32,

    /// What routing metadata the client consumes.
    pub intelligence: ClientIntelligence,

    /// Topology id the client routed with.
    pub topology_id: TopologyId,

    /// Suppress the reply (text protocol).
    pub noreply: bool,

    /// The command.
    pub command: Command,
}

impl Request {
    /// A request for the default cache with no routing metadata.
    pub fn new(command: Command) -> Self {
        Self {
            message_id: 0,
            version: super::binary::PROTOCOL_VERSION,
            cache_name: None,
            flags: 0,
            intelligence: ClientIntelligence::Basic,
            topology_id: 0,
            noreply: false,
            command,
        }
    }

    /// Set the message id.
    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = message_id;
        self
    }

    /// Target a named cache.
    pub fn with_cache(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }

    /// Declare the client's intelligence and topology id.
    pub fn with_intelligence(
        mut self,
        intelligence: ClientIntelligence,
        topology_id: TopologyId,
    ) -> Self {
        self.intelligence = intelligence;
        self.topology_id = topology_id;
        self
    }

    /// Suppress the reply.
    pub fn noreply(mut self) -> Self {
        self.noreply = true;
        self
    }
}

/// Outcome class of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation ran and its condition held.
    Success,
    /// The operation ran but its condition did not hold.
    NotExecuted,
    /// The key does not exist.
    NotFound,
    /// The frame did not start with the request magic byte.
    InvalidMagic,
    /// The request could not be understood.
    ClientError,
    /// The operation is unknown.
    UnknownOperation,
    /// Unsupported binary protocol version.
    UnknownVersion,
    /// The server failed to execute the request.
    ServerError,
    /// The operation timed out.
    Timeout,
    /// Routing changed under the request; retry.
    Retry,
}

impl Status {
    /// Binary status byte.
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::NotExecuted => 0x01,
            Status::NotFound => 0x02,
            Status::InvalidMagic => 0x81,
            Status::UnknownOperation => 0x82,
            Status::UnknownVersion => 0x84,
            Status::ClientError => 0x85,
            Status::ServerError => 0x86,
            Status::Timeout => 0x87,
            Status::Retry => 0x88,
        }
    }

    /// Status of a binary status byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Status::Success),
            0x01 => Some(Status::NotExecuted),
            0x02 => Some(Status::NotFound),
            0x81 => Some(Status::InvalidMagic),
            0x82 => Some(Status::UnknownOperation),
            0x84 => Some(Status::UnknownVersion),
            0x85 => Some(Status::ClientError),
            0x86 => Some(Status::ServerError),
            0x87 => Some(Status::Timeout),
            0x88 => Some(Status::Retry),
            _ => None,
        }
    }

    /// Whether the status reports a failure rather than a result.
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Success | Status::NotExecuted | Status::NotFound)
    }
}

/// Payload of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    /// Entries found by a read, in request order.
    Values(Vec<(Bytes, CacheEntry)>),
    /// New counter value.
    Counter(u64),
    /// Name/value statistics.
    Stats(Vec<(String, String)>),
    /// Server version.
    Version(String),
    /// Error description.
    Error(String),
}

/// Routing metadata attached to a response.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyUpdate {
    /// Server list only.
    Servers {
        topology_id: TopologyId,
        servers: Vec<SocketAddr>,
    },
    /// Server list and segment ownership.
    Hash {
        topology_id: TopologyId,
        servers: Vec<SocketAddr>,
        num_owners: u8,
        hash_function: u8,
        num_segments: u32,
        virtual_nodes: u32,
        /// Per segment, indices into `servers`.
        segment_owners: Vec<Vec<u32>>,
    },
}

impl TopologyUpdate {
    /// Topology id carried.
    pub fn topology_id(&self) -> TopologyId {
        match self {
            TopologyUpdate::Servers { topology_id, .. } | TopologyUpdate::Hash { topology_id, .. } => {
                *topology_id
            }
        }
    }

    /// Servers carried.
    pub fn servers(&self) -> &[SocketAddr] {
        match self {
            TopologyUpdate::Servers { servers, .. } | TopologyUpdate::Hash { servers, .. } => {
                servers
            }
        }
    }
}

/// A response ready to encode.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Message id of the request.
    pub message_id: u64,

    /// Operation answered; `None` when the request could not be decoded.
    pub opcode: Option<Opcode>,

    /// Outcome class.
    pub status: Status,

    /// Payload.
    pub body: ResponseBody,

    /// Routing metadata for the client, if due.
    pub topology: Option<TopologyUpdate>,
}

impl Response {
    /// A response with no payload.
    pub fn status(message_id: u64, opcode: Option<Opcode>, status: Status) -> Self {
        Self {
            message_id,
            opcode,
            status,
            body: ResponseBody::Empty,
            topology: None,
        }
    }

    /// An error response.
    pub fn error(
        message_id: u64,
        opcode: Option<Opcode>,
        status: Status,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            opcode,
            status,
            body: ResponseBody::Error(message.into()),
            topology: None,
        }
    }

    /// Set the payload.
    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }
}

/// What a decoder produces for one frame.
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed request.
    Request(Request),
    /// A frame that was consumed but could not be decoded; the connection
    /// stays usable.
    Invalid {
        message_id: u64,
        opcode: Option<Opcode>,
        error: ProtocolError,
    },
}

impl Inbound {
    pub(crate) fn invalid(error: ProtocolError) -> Self {
        Inbound::Invalid {
            message_id: 0,
            opcode: None,
            error,
        }
    }
}
