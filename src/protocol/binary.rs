//! Binary protocol.
//!
//! # Request
//!
//! ```text
//! magic 0xA0 | message id (varint) | version (u8) | opcode (u8)
//! | cache name (varint len + bytes) | flags (varint) | intelligence (u8)
//! | client topology id (varint) | body length (varint) | body
//! ```
//!
//! Keyed operations carry the key as a length-prefixed byte string. Writes
//! follow it with the lifespan and max-idle in seconds (varints, 0 for none)
//! and the length-prefixed value. The declared body length lets the decoder
//! skip the body of an operation it does not know.
//!
//! # Response
//!
//! ```text
//! magic 0xA1 | message id (varint) | opcode + 1 (u8) | status (u8)
//! | topology marker (u8) [+ topology block] | body
//! ```
//!
//! The topology marker is 0 when no block follows, otherwise the
//! intelligence code of the block's kind. Responses to undecodable requests
//! use [`ERROR_OPCODE`].

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::protocol::cursor::{put_bytes, put_varint, BinaryCursor, DecodeError, Step};
use crate::protocol::request::{
    Command, Inbound, Opcode, Request, Response, ResponseBody, Status, TopologyUpdate,
};
use crate::types::{CacheEntry, ClientIntelligence, EntryMetadata};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Binary protocol version spoken by this server.
pub const PROTOCOL_VERSION: u8 = 1;

/// First byte of every request.
pub const REQUEST_MAGIC: u8 = 0xA0;

/// First byte of every response.
pub const RESPONSE_MAGIC: u8 = 0xA1;

/// Response opcode for requests whose operation is unknown.
pub const ERROR_OPCODE: u8 = 0x50;

const NO_TOPOLOGY: u8 = 0;

/// Longest body the decoder will skip; anything longer is a desync.
const MAX_BODY_LEN: usize = u32::MAX as usize;

/// Position and declared length of a request body.
#[derive(Debug, Clone, Copy)]
struct BodyBounds {
    start: usize,
    len: usize,
}

impl BodyBounds {
    /// Bytes of the body not read yet. Fields running past the declared
    /// length desynchronize the decoder.
    fn left(&self, cursor: &BinaryCursor<'_>) -> Step<usize> {
        self.len
            .checked_sub(cursor.position() - self.start)
            .ok_or_else(|| {
                ProtocolError::InvalidLength(format!(
                    "fields overrun the declared body of {} bytes",
                    self.len
                ))
                .into()
            })
    }
}

#[derive(Debug, Default)]
enum BinaryState {
    #[default]
    Header,
    /// Skipping the rest of a rejected body.
    Discard {
        remaining: usize,
        message_id: u64,
        opcode: Option<Opcode>,
        error: ProtocolError,
    },
}

enum Parsed {
    Frame(Inbound),
    /// The header was read; the rest of the body is skipped.
    SkipBody {
        len: usize,
        message_id: u64,
        opcode: Option<Opcode>,
        error: ProtocolError,
    },
}

/// Resumable binary request decoder.
#[derive(Debug)]
pub struct BinaryDecoder {
    config: ProtocolConfig,
    state: BinaryState,
}

impl BinaryDecoder {
    /// Create a decoder.
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            state: BinaryState::Header,
        }
    }

    /// Whether a rejected body is being skipped.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, BinaryState::Discard { .. })
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.state = BinaryState::Header;
    }

    /// Decode the next frame, or return `None` when more bytes are needed.
    ///
    /// Errors are fatal: the stream cannot be resynchronized.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        if let BinaryState::Discard { remaining, .. } = &mut self.state {
            let n = (*remaining).min(buf.len());
            buf.advance(n);
            *remaining -= n;
            if *remaining > 0 {
                return Ok(None);
            }
            if let BinaryState::Discard {
                message_id,
                opcode,
                error,
                ..
            } = std::mem::take(&mut self.state)
            {
                return Ok(Some(Inbound::Invalid {
                    message_id,
                    opcode,
                    error,
                }));
            }
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = BinaryCursor::new(&buf[..]);
        let parsed = self.parse_request(&mut cursor);
        let consumed = cursor.position();
        match parsed {
            Ok(Parsed::Frame(inbound)) => {
                buf.advance(consumed);
                Ok(Some(inbound))
            }
            Ok(Parsed::SkipBody {
                len,
                message_id,
                opcode,
                error,
            }) => {
                buf.advance(consumed);
                self.state = BinaryState::Discard {
                    remaining: len,
                    message_id,
                    opcode,
                    error,
                };
                self.decode(buf)
            }
            Err(DecodeError::Incomplete) => Ok(None),
            Err(DecodeError::Protocol(e)) => Err(e),
        }
    }

    fn parse_request(&self, cursor: &mut BinaryCursor<'_>) -> Step<Parsed> {
        let magic = cursor.read_u8()?;
        if magic != REQUEST_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic).into());
        }
        let message_id = cursor.read_varint()?;
        let version = cursor.read_u8()?;
        let code = cursor.read_u8()?;
        let name_len = cursor.read_len(self.hard_limit())?;
        let raw_name = cursor.read_slice(name_len)?;
        let flags = cursor.read_varint_u32()?;
        let intelligence = ClientIntelligence::from_code(cursor.read_u8()?);
        let topology_id = cursor.read_varint_u32()?;
        let body_len = cursor.read_len(MAX_BODY_LEN)?;
        let body_start = cursor.position();

        let mut error = None;
        if version != PROTOCOL_VERSION {
            error = Some(ProtocolError::UnsupportedVersion(version));
        }
        if name_len > self.config.max_cache_name_len {
            error.get_or_insert(ProtocolError::OversizedField {
                field: "cache name",
                len: name_len,
                max: self.config.max_cache_name_len,
            });
        }
        let cache_name = match std::str::from_utf8(raw_name) {
            Ok("") => None,
            Ok(name) => Some(name.to_string()),
            Err(_) => {
                error.get_or_insert(ProtocolError::Malformed(
                    "cache name is not valid UTF-8".to_string(),
                ));
                None
            }
        };

        let Some(opcode) = Opcode::from_binary(code) else {
            return Ok(Parsed::SkipBody {
                len: body_len,
                message_id,
                opcode: None,
                error: error.unwrap_or_else(|| {
                    ProtocolError::UnknownOperation(format!("opcode 0x{:02x}", code))
                }),
            });
        };
        let body = BodyBounds {
            start: body_start,
            len: body_len,
        };

        let command = match opcode {
            Opcode::Get | Opcode::Remove | Opcode::ContainsKey => {
                let key = self.read_key(cursor, &mut error)?;
                match opcode {
                    Opcode::Get => Command::Get { keys: vec![key] },
                    Opcode::Remove => Command::Remove { key },
                    _ => Command::ContainsKey { key },
                }
            }
            Opcode::Put | Opcode::PutIfAbsent | Opcode::Replace => {
                let key = self.read_key(cursor, &mut error)?;
                let lifespan = cursor.read_varint()?;
                let max_idle = cursor.read_varint()?;
                let len = cursor.read_len(MAX_BODY_LEN)?;
                if len > self.config.max_value_len {
                    return Ok(Parsed::SkipBody {
                        len: body.left(cursor)?,
                        message_id,
                        opcode: Some(opcode),
                        error: error.unwrap_or(ProtocolError::OversizedField {
                            field: "value",
                            len,
                            max: self.config.max_value_len,
                        }),
                    });
                }
                let value = Bytes::copy_from_slice(cursor.read_slice(len)?);
                let mut metadata = EntryMetadata::default();
                if lifespan > 0 {
                    metadata = metadata.lifespan(Duration::from_secs(lifespan));
                }
                if max_idle > 0 {
                    metadata = metadata.max_idle(Duration::from_secs(max_idle));
                }
                match opcode {
                    Opcode::Put => Command::Put {
                        key,
                        value,
                        metadata,
                    },
                    Opcode::PutIfAbsent => Command::PutIfAbsent {
                        key,
                        value,
                        metadata,
                    },
                    _ => Command::Replace {
                        key,
                        value,
                        metadata,
                    },
                }
            }
            Opcode::Clear => Command::Clear,
            Opcode::Stats => Command::Stats,
            Opcode::Ping => Command::Ping,
            other => {
                return Ok(Parsed::SkipBody {
                    len: body.left(cursor)?,
                    message_id,
                    opcode: None,
                    error: ProtocolError::UnknownOperation(other.name().to_string()),
                });
            }
        };
        let trailing = body.left(cursor)?;
        if trailing != 0 {
            return Err(ProtocolError::InvalidLength(format!(
                "{} body has {} trailing bytes",
                opcode.name(),
                trailing
            ))
            .into());
        }

        if let Some(error) = error {
            return Ok(Parsed::Frame(Inbound::Invalid {
                message_id,
                opcode: Some(opcode),
                error,
            }));
        }
        Ok(Parsed::Frame(Inbound::Request(Request {
            message_id,
            version,
            cache_name,
            flags,
            intelligence,
            topology_id,
            noreply: false,
            command,
        })))
    }

    /// Longest key or cache name buffered before the stream is given up on.
    fn hard_limit(&self) -> usize {
        self.config
            .max_value_len
            .max(self.config.max_key_len)
            .max(self.config.max_cache_name_len)
    }

    /// Read a key. An oversized key is still consumed so the frame can be
    /// skipped as a whole.
    fn read_key(
        &self,
        cursor: &mut BinaryCursor<'_>,
        error: &mut Option<ProtocolError>,
    ) -> Step<Bytes> {
        let len = cursor.read_len(self.hard_limit())?;
        let raw = cursor.read_slice(len)?;
        if len > self.config.max_key_len {
            error.get_or_insert(ProtocolError::OversizedField {
                field: "key",
                len,
                max: self.config.max_key_len,
            });
        }
        Ok(Bytes::copy_from_slice(raw))
    }
}

// ==================== Encoding ====================

/// Encode a request as a client would send it.
pub fn encode_request(request: &Request, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let opcode = request.command.opcode();
    let code = opcode
        .binary_code()
        .ok_or_else(|| ProtocolError::UnknownOperation(opcode.name().to_string()))?;
    let mut body = BytesMut::new();
    encode_body(&request.command, &mut body)?;

    buf.put_u8(REQUEST_MAGIC);
    put_varint(buf, request.message_id);
    buf.put_u8(request.version);
    buf.put_u8(code);
    put_bytes(buf, request.cache_name.as_deref().unwrap_or("").as_bytes());
    put_varint(buf, request.flags as u64);
    buf.put_u8(request.intelligence.code());
    put_varint(buf, request.topology_id as u64);
    put_varint(buf, body.len() as u64);
    buf.put_slice(&body);
    Ok(())
}

fn encode_body(command: &Command, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match command {
        Command::Get { keys } => match keys.as_slice() {
            [key] => put_bytes(buf, key),
            _ => {
                return Err(ProtocolError::Malformed(
                    "binary get takes exactly one key".to_string(),
                ))
            }
        },
        Command::Remove { key } | Command::ContainsKey { key } => put_bytes(buf, key),
        Command::Put {
            key,
            value,
            metadata,
        }
        | Command::PutIfAbsent {
            key,
            value,
            metadata,
        }
        | Command::Replace {
            key,
            value,
            metadata,
        } => {
            put_bytes(buf, key);
            put_varint(buf, metadata.lifespan_ms.map_or(0, |ms| ms.div_ceil(1000)));
            put_varint(buf, metadata.max_idle_ms.map_or(0, |ms| ms.div_ceil(1000)));
            put_bytes(buf, value);
        }
        _ => {}
    }
    Ok(())
}

/// Encode a response.
pub fn encode_response(response: &Response, buf: &mut BytesMut) {
    buf.put_u8(RESPONSE_MAGIC);
    put_varint(buf, response.message_id);
    let code = response
        .opcode
        .and_then(Opcode::binary_code)
        .map_or(ERROR_OPCODE, |code| code + 1);
    buf.put_u8(code);
    buf.put_u8(response.status.code());

    match &response.topology {
        None => buf.put_u8(NO_TOPOLOGY),
        Some(update) => encode_topology(update, buf),
    }

    if response.status.is_error() {
        let message = match &response.body {
            ResponseBody::Error(message) => message.as_str(),
            _ => "",
        };
        put_bytes(buf, message.as_bytes());
        return;
    }
    match &response.body {
        ResponseBody::Values(values) => {
            if let Some((_, entry)) = values.first() {
                put_bytes(buf, &entry.value);
            }
        }
        ResponseBody::Stats(stats) => {
            put_varint(buf, stats.len() as u64);
            for (name, value) in stats {
                put_bytes(buf, name.as_bytes());
                put_bytes(buf, value.as_bytes());
            }
        }
        ResponseBody::Counter(value) => put_varint(buf, *value),
        ResponseBody::Version(version) => put_bytes(buf, version.as_bytes()),
        ResponseBody::Empty | ResponseBody::Error(_) => {}
    }
}

fn encode_servers(servers: &[SocketAddr], buf: &mut BytesMut) {
    put_varint(buf, servers.len() as u64);
    for server in servers {
        put_bytes(buf, server.ip().to_string().as_bytes());
        buf.put_u16(server.port());
    }
}

fn encode_topology(update: &TopologyUpdate, buf: &mut BytesMut) {
    match update {
        TopologyUpdate::Servers {
            topology_id,
            servers,
        } => {
            buf.put_u8(ClientIntelligence::TopologyAware.code());
            put_varint(buf, *topology_id as u64);
            encode_servers(servers, buf);
        }
        TopologyUpdate::Hash {
            topology_id,
            servers,
            num_owners,
            hash_function,
            num_segments,
            virtual_nodes,
            segment_owners,
        } => {
            buf.put_u8(ClientIntelligence::HashDistributionAware.code());
            put_varint(buf, *topology_id as u64);
            buf.put_u8(*num_owners);
            buf.put_u8(*hash_function);
            put_varint(buf, *num_segments as u64);
            put_varint(buf, *virtual_nodes as u64);
            encode_servers(servers, buf);
            for owners in segment_owners {
                buf.put_u8(owners.len() as u8);
                for index in owners {
                    put_varint(buf, *index as u64);
                }
            }
        }
    }
}

// ==================== Client side ====================

/// Decode one response, or return `None` when more bytes are needed.
pub fn decode_response(
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<Response>, ProtocolError> {
    let mut cursor = BinaryCursor::new(&buf[..]);
    let parsed = parse_response(&mut cursor, max_len);
    let consumed = cursor.position();
    match parsed {
        Ok(response) => {
            buf.advance(consumed);
            Ok(Some(response))
        }
        Err(DecodeError::Incomplete) => Ok(None),
        Err(DecodeError::Protocol(e)) => Err(e),
    }
}

fn parse_response(cursor: &mut BinaryCursor<'_>, max_len: usize) -> Step<Response> {
    let magic = cursor.read_u8()?;
    if magic != RESPONSE_MAGIC {
        return Err(ProtocolError::InvalidMagic(magic).into());
    }
    let message_id = cursor.read_varint()?;
    let code = cursor.read_u8()?;
    let opcode = if code == ERROR_OPCODE {
        None
    } else {
        Opcode::from_binary(code.wrapping_sub(1))
    };
    let status_code = cursor.read_u8()?;
    let status = Status::from_code(status_code).ok_or_else(|| {
        ProtocolError::Malformed(format!("unknown status 0x{:02x}", status_code))
    })?;
    let topology = parse_topology(cursor, max_len)?;

    let body = if status.is_error() {
        ResponseBody::Error(cursor.read_string(max_len)?)
    } else {
        match (opcode, status) {
            (Some(Opcode::Get), Status::Success) => {
                let value = cursor.read_bytes(max_len)?;
                ResponseBody::Values(vec![(
                    Bytes::new(),
                    CacheEntry::new(value, EntryMetadata::default()),
                )])
            }
            (Some(Opcode::Stats), _) => {
                let count = cursor.read_varint()?;
                let mut stats = Vec::new();
                for _ in 0..count {
                    let name = cursor.read_string(max_len)?;
                    let value = cursor.read_string(max_len)?;
                    stats.push((name, value));
                }
                ResponseBody::Stats(stats)
            }
            _ => ResponseBody::Empty,
        }
    };

    Ok(Response {
        message_id,
        opcode,
        status,
        body,
        topology,
    })
}

fn parse_servers(cursor: &mut BinaryCursor<'_>, max_len: usize) -> Step<Vec<SocketAddr>> {
    let count = cursor.read_varint()?;
    let mut servers = Vec::new();
    for _ in 0..count {
        let host = cursor.read_string(max_len)?;
        let port = cursor.read_u16()?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("invalid server address {}", host)))?;
        servers.push(SocketAddr::new(ip, port));
    }
    Ok(servers)
}

fn parse_topology(
    cursor: &mut BinaryCursor<'_>,
    max_len: usize,
) -> Step<Option<TopologyUpdate>> {
    let marker = cursor.read_u8()?;
    if marker == NO_TOPOLOGY {
        return Ok(None);
    }
    let topology_id = cursor.read_varint_u32()?;
    match ClientIntelligence::from_code(marker) {
        ClientIntelligence::TopologyAware => Ok(Some(TopologyUpdate::Servers {
            topology_id,
            servers: parse_servers(cursor, max_len)?,
        })),
        ClientIntelligence::HashDistributionAware => {
            let num_owners = cursor.read_u8()?;
            let hash_function = cursor.read_u8()?;
            let num_segments = cursor.read_varint_u32()?;
            let virtual_nodes = cursor.read_varint_u32()?;
            let servers = parse_servers(cursor, max_len)?;
            let mut segment_owners = Vec::with_capacity(num_segments.min(4096) as usize);
            for _ in 0..num_segments {
                let count = cursor.read_u8()?;
                let mut owners = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    owners.push(cursor.read_varint_u32()?);
                }
                segment_owners.push(owners);
            }
            Ok(Some(TopologyUpdate::Hash {
                topology_id,
                servers,
                num_owners,
                hash_function,
                num_segments,
                virtual_nodes,
                segment_owners,
            }))
        }
        ClientIntelligence::Basic => Err(ProtocolError::Malformed(format!(
            "unknown topology marker 0x{:02x}",
            marker
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn put_request(id: u64, key: &'static [u8], value: &'static [u8]) -> Request {
        Request::new(Command::Put {
            key: Bytes::from_static(key),
            value: Bytes::from_static(value),
            metadata: EntryMetadata::default().lifespan(Duration::from_secs(30)),
        })
        .with_message_id(id)
        .with_cache("users")
        .with_intelligence(ClientIntelligence::HashDistributionAware, 4)
    }

    fn encode(request: &Request) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_request(request, &mut buf).unwrap();
        buf
    }

    fn decode_all(decoder: &mut BinaryDecoder, buf: &mut BytesMut) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Some(item) = decoder.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_request_round_trip() {
        let request = put_request(42, b"k1", b"hello");
        let mut buf = encode(&request);
        let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
        match decoder.decode(&mut buf).unwrap() {
            Some(Inbound::Request(decoded)) => assert_eq!(decoded, request),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_frame_consumes_nothing() {
        let full = encode(&put_request(1, b"k", b"value"));
        let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), full.len() - 2);
    }

    #[test]
    fn test_oversized_value_is_skipped() {
        let config = ProtocolConfig::default().with_max_value_len(4);
        let mut decoder = BinaryDecoder::new(config);
        let mut buf = encode(&put_request(7, b"k", b"too long"));
        buf.extend_from_slice(&encode(&Request::new(Command::Ping).with_message_id(8)));

        let items = decode_all(&mut decoder, &mut buf);
        assert_eq!(items.len(), 2);
        match &items[0] {
            Inbound::Invalid {
                message_id,
                opcode,
                error,
            } => {
                assert_eq!(*message_id, 7);
                assert_eq!(*opcode, Some(Opcode::Put));
                assert!(matches!(
                    error,
                    ProtocolError::OversizedField { field: "value", .. }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&items[1], Inbound::Request(r) if r.message_id == 8));
    }

    #[test]
    fn test_oversized_value_across_reads() {
        let config = ProtocolConfig::default().with_max_value_len(4);
        let mut decoder = BinaryDecoder::new(config);
        let full = encode(&put_request(7, b"k", b"0123456789"));
        let mut buf = BytesMut::from(&full[..full.len() - 6]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.is_mid_frame());
        assert!(buf.is_empty());

        buf.extend_from_slice(&full[full.len() - 6..]);
        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Some(Inbound::Invalid { .. })
        ));
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn test_oversized_key_skips_frame() {
        let config = ProtocolConfig::default().with_max_key_len(2);
        let mut decoder = BinaryDecoder::new(config);
        let mut buf = encode(&put_request(3, b"long key", b"v"));
        buf.extend_from_slice(&encode(&Request::new(Command::Stats)));

        let items = decode_all(&mut decoder, &mut buf);
        assert!(matches!(
            items[0],
            Inbound::Invalid {
                error: ProtocolError::OversizedField { field: "key", .. },
                ..
            }
        ));
        assert!(matches!(&items[1], Inbound::Request(r) if r.command == Command::Stats));
    }

    #[test]
    fn test_unknown_opcode_is_not_fatal() {
        let mut buf = encode(&Request::new(Command::Ping).with_message_id(5));
        // Opcode sits after magic, message id and version.
        buf[3] = 0x7f;
        let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
        match decoder.decode(&mut buf).unwrap() {
            Some(Inbound::Invalid {
                message_id, error, ..
            }) => {
                assert_eq!(message_id, 5);
                assert!(matches!(error, ProtocolError::UnknownOperation(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_body_is_skipped() {
        let mut buf = encode(&put_request(5, b"key", b"a value starting the next frame"));
        buf[3] = 0x7f;
        buf.extend_from_slice(&encode(&Request::new(Command::Ping).with_message_id(6)));

        let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
        let items = decode_all(&mut decoder, &mut buf);
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            Inbound::Invalid {
                message_id: 5,
                opcode: None,
                error: ProtocolError::UnknownOperation(_),
            }
        ));
        assert!(matches!(&items[1], Inbound::Request(r) if r.message_id == 6));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_body_length_mismatch_is_fatal() {
        let mut buf = encode(&Request::new(Command::Ping).with_message_id(1));
        // Declare one body byte more than a ping carries.
        let last = buf.len() - 1;
        buf[last] = 1;
        buf.extend_from_slice(&[0x00]);
        let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_magic_is_fatal() {
        let mut buf = BytesMut::from(&b"\x42\x00"[..]);
        let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ProtocolError::InvalidMagic(0x42)));
    }

    #[test]
    fn test_text_only_command_is_rejected() {
        let request = Request::new(Command::Append {
            key: Bytes::from_static(b"k"),
            data: Bytes::from_static(b"v"),
        });
        assert!(encode_request(&request, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_response_with_hash_topology() {
        let servers: Vec<SocketAddr> = vec![
            "127.0.0.1:11222".parse().unwrap(),
            "[::1]:11223".parse().unwrap(),
        ];
        let entry = CacheEntry::new(Bytes::from_static(b"v"), EntryMetadata::default());
        let mut response = Response::status(9, Some(Opcode::Get), Status::Success)
            .with_body(ResponseBody::Values(vec![(Bytes::new(), entry)]));
        response.topology = Some(TopologyUpdate::Hash {
            topology_id: 3,
            servers: servers.clone(),
            num_owners: 2,
            hash_function: 3,
            num_segments: 2,
            virtual_nodes: 1,
            segment_owners: vec![vec![0, 1], vec![1, 0]],
        });

        let mut buf = BytesMut::new();
        encode_response(&response, &mut buf);
        assert_eq!(buf[0], RESPONSE_MAGIC);
        let decoded = decode_response(&mut buf, 1024).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded.opcode, Some(Opcode::Get));
        assert_eq!(decoded.topology, response.topology);
        match decoded.body {
            ResponseBody::Values(values) => assert_eq!(values[0].1.value, "v"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_response_uses_error_opcode() {
        let response = Response::error(0, None, Status::InvalidMagic, "invalid magic byte");
        let mut buf = BytesMut::new();
        encode_response(&response, &mut buf);
        assert_eq!(buf[2], ERROR_OPCODE);
        assert_eq!(buf[3], 0x81);
        let decoded = decode_response(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(decoded.opcode, None);
        assert_eq!(
            decoded.body,
            ResponseBody::Error("invalid magic byte".to_string())
        );
    }

    proptest! {
        #[test]
        fn prop_split_reads_decode_identically(
            values in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..6),
            chunk in 1usize..16,
        ) {
            let mut stream = BytesMut::new();
            let mut expected = Vec::new();
            for (i, value) in values.iter().enumerate() {
                let request = Request::new(Command::Put {
                    key: Bytes::from(format!("key-{}", i)),
                    value: Bytes::from(value.clone()),
                    metadata: EntryMetadata::default(),
                })
                .with_message_id(i as u64);
                encode_request(&request, &mut stream).unwrap();
                expected.push(request);
            }

            let mut decoder = BinaryDecoder::new(ProtocolConfig::default());
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(item) = decoder.decode(&mut buf).unwrap() {
                    match item {
                        Inbound::Request(request) => decoded.push(request),
                        Inbound::Invalid { error, .. } => panic!("invalid frame: {}", error),
                    }
                }
            }
            prop_assert_eq!(decoded, expected);
            prop_assert!(buf.is_empty());
        }
    }
}
