//! Memcached-style text protocol.
//!
//! Commands are lines of space separated fields ending in `CR LF`. Storage
//! commands are followed by a data block of the declared length and another
//! `CR LF`. The decoder keeps its position across calls: a command line is
//! consumed as soon as it is complete, and the data block is awaited in a
//! separate state.

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::protocol::cursor::{line_end, split_line, TextCursor};
use crate::protocol::request::{Command, Inbound, Opcode, Request, Response, ResponseBody, Status};
use crate::types::{now_millis, EntryMetadata};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::trace;

/// Expiration times above this many seconds are absolute UNIX times.
const MAX_RELATIVE_EXPTIME: i64 = 60 * 60 * 24 * 30;

/// Longest rejected data block that is skipped; longer ones close the
/// connection.
const MAX_SKIPPED_DATA_LEN: usize = u32::MAX as usize;

/// Storage command waiting for its data block.
#[derive(Debug)]
struct PendingStorage {
    opcode: Opcode,
    key: Bytes,
    metadata: EntryMetadata,
    noreply: bool,
}

impl PendingStorage {
    fn into_request(self, value: Bytes) -> Request {
        let key = self.key;
        let metadata = self.metadata;
        let command = match self.opcode {
            Opcode::PutIfAbsent => Command::PutIfAbsent {
                key,
                value,
                metadata,
            },
            Opcode::Replace => Command::Replace {
                key,
                value,
                metadata,
            },
            Opcode::Append => Command::Append { key, data: value },
            Opcode::Prepend => Command::Prepend { key, data: value },
            _ => Command::Put {
                key,
                value,
                metadata,
            },
        };
        Request {
            noreply: self.noreply,
            ..Request::new(command)
        }
    }
}

#[derive(Debug, Default)]
enum TextState {
    #[default]
    Line,
    Data {
        pending: PendingStorage,
        len: usize,
    },
    /// Skip bytes of a rejected data block, then report.
    Discard {
        remaining: usize,
        error: ProtocolError,
    },
    /// Skip to the end of an overlong line, then report.
    DiscardLine { error: ProtocolError },
}

/// Outcome of parsing one command line.
enum Parsed {
    Complete(Request),
    NeedsData(PendingStorage, usize),
}

/// A rejected command line.
enum LineError {
    /// Report now.
    Invalid(ProtocolError),
    /// Skip the data block of `len` bytes first.
    SkipData(usize, ProtocolError),
}

impl From<ProtocolError> for LineError {
    fn from(e: ProtocolError) -> Self {
        LineError::Invalid(e)
    }
}

/// Resumable text request decoder.
#[derive(Debug)]
pub struct TextDecoder {
    config: ProtocolConfig,
    state: TextState,
}

impl TextDecoder {
    /// Create a decoder.
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            state: TextState::Line,
        }
    }

    /// Whether a frame has been started but not finished.
    pub fn is_mid_frame(&self) -> bool {
        !matches!(self.state, TextState::Line)
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.state = TextState::Line;
    }

    /// Decode the next frame, or return `None` when more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        loop {
            match std::mem::take(&mut self.state) {
                TextState::Line => {
                    let Some(end) = line_end(buf) else {
                        if buf.len() > self.config.max_line_len {
                            let len = buf.len();
                            buf.clear();
                            self.state = TextState::DiscardLine {
                                error: ProtocolError::OversizedField {
                                    field: "line",
                                    len,
                                    max: self.config.max_line_len,
                                },
                            };
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(end.next).freeze();
                    if end.bare_lf && !self.config.accept_bare_lf {
                        return Ok(Some(Inbound::invalid(ProtocolError::Malformed(
                            "line not terminated by CR LF".to_string(),
                        ))));
                    }
                    if end.content_end > self.config.max_line_len {
                        return Ok(Some(Inbound::invalid(ProtocolError::OversizedField {
                            field: "line",
                            len: end.content_end,
                            max: self.config.max_line_len,
                        })));
                    }
                    match self.parse_line(&line) {
                        Ok(Parsed::Complete(request)) => {
                            return Ok(Some(Inbound::Request(request)));
                        }
                        Ok(Parsed::NeedsData(pending, len)) => {
                            self.state = TextState::Data { pending, len };
                        }
                        Err(LineError::Invalid(error)) => {
                            return Ok(Some(Inbound::invalid(error)));
                        }
                        Err(LineError::SkipData(len, _)) if len > MAX_SKIPPED_DATA_LEN => {
                            return Err(ProtocolError::InvalidLength(format!(
                                "data block of {} bytes cannot be skipped",
                                len
                            )));
                        }
                        Err(LineError::SkipData(len, error)) => {
                            self.state = TextState::Discard {
                                remaining: len.saturating_add(2),
                                error,
                            };
                        }
                    }
                }
                TextState::Data { pending, len } => {
                    let terminator = match (buf.get(len), buf.get(len + 1)) {
                        (None, _) | (Some(b'\r'), None) => {
                            self.state = TextState::Data { pending, len };
                            return Ok(None);
                        }
                        (Some(b'\r'), Some(b'\n')) => 2,
                        (Some(b'\n'), _) if self.config.accept_bare_lf => 1,
                        _ => {
                            buf.advance(len);
                            self.state = TextState::DiscardLine {
                                error: ProtocolError::Malformed("bad data chunk".to_string()),
                            };
                            continue;
                        }
                    };
                    let value = buf.split_to(len).freeze();
                    buf.advance(terminator);
                    return Ok(Some(Inbound::Request(pending.into_request(value))));
                }
                TextState::Discard { remaining, error } => {
                    let n = remaining.min(buf.len());
                    buf.advance(n);
                    if n < remaining {
                        self.state = TextState::Discard {
                            remaining: remaining - n,
                            error,
                        };
                        return Ok(None);
                    }
                    return Ok(Some(Inbound::invalid(error)));
                }
                TextState::DiscardLine { error } => {
                    let mut cursor = TextCursor::new(&buf[..], true);
                    if cursor.discard_line() {
                        let consumed = cursor.position();
                        buf.advance(consumed);
                        return Ok(Some(Inbound::invalid(error)));
                    }
                    buf.clear();
                    self.state = TextState::DiscardLine { error };
                    return Ok(None);
                }
            }
        }
    }

    fn parse_line(&self, line: &[u8]) -> Result<Parsed, LineError> {
        let mut cursor = TextCursor::new(line, true);
        let (name, terminated) = cursor
            .read_field()
            .ok_or_else(|| ProtocolError::Malformed("unterminated line".to_string()))?;
        let args = if terminated {
            Vec::new()
        } else {
            let end = line_end(line).map(|e| e.content_end).unwrap_or(line.len());
            split_line(&line[cursor.position().min(end)..end])
        };
        trace!(command = %String::from_utf8_lossy(name), args = args.len(), "Decoded text line");

        match name {
            b"get" | b"gets" => self.parse_get(&args),
            b"set" => self.parse_storage(Opcode::Put, &args),
            b"add" => self.parse_storage(Opcode::PutIfAbsent, &args),
            b"replace" => self.parse_storage(Opcode::Replace, &args),
            b"append" => self.parse_storage(Opcode::Append, &args),
            b"prepend" => self.parse_storage(Opcode::Prepend, &args),
            b"delete" => self.parse_delete(&args),
            b"incr" => self.parse_arithmetic(Opcode::Increment, &args),
            b"decr" => self.parse_arithmetic(Opcode::Decrement, &args),
            b"flush_all" => Ok(Parsed::Complete(Request {
                noreply: args.last() == Some(&&b"noreply"[..]),
                ..Request::new(Command::Clear)
            })),
            b"stats" => Ok(Parsed::Complete(Request::new(Command::Stats))),
            b"version" => Ok(Parsed::Complete(Request::new(Command::Version))),
            b"quit" => Ok(Parsed::Complete(Request::new(Command::Quit))),
            other => Err(ProtocolError::UnknownOperation(
                String::from_utf8_lossy(other).into_owned(),
            )
            .into()),
        }
    }

    fn key(&self, raw: &[u8]) -> Result<Bytes, ProtocolError> {
        if raw.len() > self.config.max_key_len {
            return Err(ProtocolError::OversizedField {
                field: "key",
                len: raw.len(),
                max: self.config.max_key_len,
            });
        }
        Ok(Bytes::copy_from_slice(raw))
    }

    fn parse_get(&self, args: &[&[u8]]) -> Result<Parsed, LineError> {
        if args.is_empty() {
            return Err(malformed().into());
        }
        let keys = args
            .iter()
            .map(|k| self.key(k))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Parsed::Complete(Request::new(Command::Get { keys })))
    }

    /// `<cmd> <key> <flags> <exptime> <bytes> [noreply]`
    fn parse_storage(&self, opcode: Opcode, args: &[&[u8]]) -> Result<Parsed, LineError> {
        if !(4..=5).contains(&args.len()) {
            return Err(malformed().into());
        }
        let len: usize = parse_number(args[3])?;
        let flags: u32 = parse_number(args[1]).map_err(|e| LineError::SkipData(len, e))?;
        let exptime: i64 = parse_number(args[2]).map_err(|e| LineError::SkipData(len, e))?;
        let noreply = match args.get(4) {
            None => false,
            Some(&b"noreply") => true,
            Some(_) => return Err(LineError::SkipData(len, malformed())),
        };

        let key = self.key(args[0]).map_err(|e| LineError::SkipData(len, e))?;
        if len > self.config.max_value_len {
            return Err(LineError::SkipData(
                len,
                ProtocolError::OversizedField {
                    field: "value",
                    len,
                    max: self.config.max_value_len,
                },
            ));
        }

        let mut metadata = EntryMetadata::with_flags(flags);
        if let Some(lifespan) = lifespan_from_exptime(exptime) {
            metadata = metadata.lifespan(lifespan);
        }
        Ok(Parsed::NeedsData(
            PendingStorage {
                opcode,
                key,
                metadata,
                noreply,
            },
            len,
        ))
    }

    /// `delete <key> [0] [noreply]`
    fn parse_delete(&self, args: &[&[u8]]) -> Result<Parsed, LineError> {
        let (key, rest) = args.split_first().ok_or_else(malformed)?;
        let noreply = match rest {
            [] | [b"0"] => false,
            [b"noreply"] | [b"0", b"noreply"] => true,
            _ => return Err(malformed().into()),
        };
        Ok(Parsed::Complete(Request {
            noreply,
            ..Request::new(Command::Remove {
                key: self.key(key)?,
            })
        }))
    }

    /// `incr|decr <key> <delta> [noreply]`
    fn parse_arithmetic(&self, opcode: Opcode, args: &[&[u8]]) -> Result<Parsed, LineError> {
        let noreply = match args {
            [_, _] => false,
            [_, _, b"noreply"] => true,
            _ => return Err(malformed().into()),
        };
        let key = self.key(args[0])?;
        let delta: u64 = parse_number(args[1]).map_err(|_| {
            ProtocolError::Malformed("invalid numeric delta argument".to_string())
        })?;
        let command = if opcode == Opcode::Increment {
            Command::Increment { key, delta }
        } else {
            Command::Decrement { key, delta }
        };
        Ok(Parsed::Complete(Request {
            noreply,
            ..Request::new(command)
        }))
    }
}

fn malformed() -> ProtocolError {
    ProtocolError::Malformed("bad command line format".to_string())
}

fn parse_number<T: std::str::FromStr>(raw: &[u8]) -> Result<T, ProtocolError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)
}

/// Lifespan of a memcached expiration time: 0 never expires, negative
/// values are already expired, values up to 30 days are relative seconds and
/// larger values are absolute UNIX times.
pub fn lifespan_from_exptime(exptime: i64) -> Option<Duration> {
    match exptime {
        0 => None,
        e if e < 0 => Some(Duration::ZERO),
        e if e <= MAX_RELATIVE_EXPTIME => Some(Duration::from_secs(e as u64)),
        e => {
            let at_ms = (e as u64).saturating_mul(1000);
            Some(Duration::from_millis(at_ms.saturating_sub(now_millis())))
        }
    }
}

fn exptime_of(metadata: &EntryMetadata) -> u64 {
    metadata.lifespan_ms.map(|ms| ms.div_ceil(1000)).unwrap_or(0)
}

// ==================== Encoding ====================

/// Encode a request as a client would send it.
pub fn encode_request(request: &Request, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let noreply: &[u8] = if request.noreply { b" noreply" } else { b"" };
    match &request.command {
        Command::Put {
            key,
            value,
            metadata,
        } => put_storage(buf, b"set", key, value, metadata, noreply),
        Command::PutIfAbsent {
            key,
            value,
            metadata,
        } => put_storage(buf, b"add", key, value, metadata, noreply),
        Command::Replace {
            key,
            value,
            metadata,
        } => put_storage(buf, b"replace", key, value, metadata, noreply),
        Command::Append { key, data } => {
            put_storage(buf, b"append", key, data, &EntryMetadata::default(), noreply)
        }
        Command::Prepend { key, data } => {
            put_storage(buf, b"prepend", key, data, &EntryMetadata::default(), noreply)
        }
        Command::Get { keys } => {
            buf.put_slice(b"get");
            for key in keys {
                buf.put_u8(b' ');
                buf.put_slice(key);
            }
            buf.put_slice(b"\r\n");
        }
        Command::Remove { key } => {
            buf.put_slice(b"delete ");
            buf.put_slice(key);
            buf.put_slice(noreply);
            buf.put_slice(b"\r\n");
        }
        Command::Increment { key, delta } | Command::Decrement { key, delta } => {
            let name: &[u8] = if matches!(request.command, Command::Increment { .. }) {
                b"incr "
            } else {
                b"decr "
            };
            buf.put_slice(name);
            buf.put_slice(key);
            buf.put_slice(format!(" {}", delta).as_bytes());
            buf.put_slice(noreply);
            buf.put_slice(b"\r\n");
        }
        Command::Clear => {
            buf.put_slice(b"flush_all");
            buf.put_slice(noreply);
            buf.put_slice(b"\r\n");
        }
        Command::Stats => buf.put_slice(b"stats\r\n"),
        Command::Version => buf.put_slice(b"version\r\n"),
        Command::Quit => buf.put_slice(b"quit\r\n"),
        Command::ContainsKey { .. } | Command::Ping => {
            return Err(ProtocolError::UnknownOperation(
                request.command.opcode().name().to_string(),
            ));
        }
    }
    Ok(())
}

fn put_storage(
    buf: &mut BytesMut,
    name: &[u8],
    key: &[u8],
    value: &[u8],
    metadata: &EntryMetadata,
    noreply: &[u8],
) {
    buf.put_slice(name);
    buf.put_u8(b' ');
    buf.put_slice(key);
    buf.put_slice(
        format!(
            " {} {} {}",
            metadata.flags,
            exptime_of(metadata),
            value.len()
        )
        .as_bytes(),
    );
    buf.put_slice(noreply);
    buf.put_slice(b"\r\n");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Encode a response.
pub fn encode_response(response: &Response, buf: &mut BytesMut) {
    let message = match &response.body {
        ResponseBody::Error(message) => message.as_str(),
        _ => "",
    };
    match response.status {
        Status::UnknownOperation => {
            buf.put_slice(b"ERROR\r\n");
            return;
        }
        Status::ClientError | Status::InvalidMagic => {
            put_line(buf, &format!("CLIENT_ERROR {}", message));
            return;
        }
        Status::ServerError | Status::Timeout | Status::Retry | Status::UnknownVersion => {
            put_line(buf, &format!("SERVER_ERROR {}", message));
            return;
        }
        Status::Success | Status::NotExecuted | Status::NotFound => {}
    }

    let Some(opcode) = response.opcode else {
        buf.put_slice(b"ERROR\r\n");
        return;
    };
    let stored = response.status == Status::Success;
    match opcode {
        Opcode::Get => {
            if let ResponseBody::Values(values) = &response.body {
                for (key, entry) in values {
                    buf.put_slice(b"VALUE ");
                    buf.put_slice(key);
                    buf.put_slice(
                        format!(" {} {}\r\n", entry.metadata.flags, entry.value.len()).as_bytes(),
                    );
                    buf.put_slice(&entry.value);
                    buf.put_slice(b"\r\n");
                }
            }
            buf.put_slice(b"END\r\n");
        }
        Opcode::Put | Opcode::PutIfAbsent | Opcode::Replace | Opcode::Append | Opcode::Prepend => {
            buf.put_slice(if stored {
                b"STORED\r\n"
            } else {
                b"NOT_STORED\r\n"
            });
        }
        Opcode::Remove => buf.put_slice(if stored {
            b"DELETED\r\n"
        } else {
            b"NOT_FOUND\r\n"
        }),
        Opcode::ContainsKey => buf.put_slice(if stored {
            b"EXISTS\r\n"
        } else {
            b"NOT_FOUND\r\n"
        }),
        Opcode::Increment | Opcode::Decrement => match &response.body {
            ResponseBody::Counter(value) if stored => put_line(buf, &value.to_string()),
            _ => buf.put_slice(b"NOT_FOUND\r\n"),
        },
        Opcode::Stats => {
            if let ResponseBody::Stats(stats) = &response.body {
                for (name, value) in stats {
                    put_line(buf, &format!("STAT {} {}", name, value));
                }
            }
            buf.put_slice(b"END\r\n");
        }
        Opcode::Version => {
            if let ResponseBody::Version(version) = &response.body {
                put_line(buf, &format!("VERSION {}", version));
            }
        }
        Opcode::Clear | Opcode::Ping => buf.put_slice(b"OK\r\n"),
        Opcode::Quit => {}
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}
