//! `tokio-util` codecs over the two wire protocols.

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::protocol::binary::{self, BinaryDecoder, REQUEST_MAGIC};
use crate::protocol::request::{Inbound, Request, Response};
use crate::protocol::text::{self, TextDecoder};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Wire protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Text,
    Binary,
}

impl ProtocolKind {
    /// Detect the protocol from the first byte a client sends.
    pub fn detect(first: u8) -> Self {
        if first == REQUEST_MAGIC {
            ProtocolKind::Binary
        } else {
            ProtocolKind::Text
        }
    }
}

/// Server-side codec. The protocol is fixed by the first byte received.
#[derive(Debug)]
pub struct GridCodec {
    kind: Option<ProtocolKind>,
    text: TextDecoder,
    binary: BinaryDecoder,
}

impl GridCodec {
    /// Create a codec that has not seen any bytes yet.
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            kind: None,
            text: TextDecoder::new(config.clone()),
            binary: BinaryDecoder::new(config),
        }
    }

    /// Protocol detected so far.
    pub fn kind(&self) -> Option<ProtocolKind> {
        self.kind
    }

    fn is_mid_frame(&self) -> bool {
        match self.kind {
            Some(ProtocolKind::Text) => self.text.is_mid_frame(),
            Some(ProtocolKind::Binary) => self.binary.is_mid_frame(),
            None => false,
        }
    }
}

impl Decoder for GridCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                let Some(&first) = src.first() else {
                    return Ok(None);
                };
                let kind = ProtocolKind::detect(first);
                debug!(protocol = ?kind, "Detected client protocol");
                self.kind = Some(kind);
                kind
            }
        };
        match kind {
            ProtocolKind::Text => self.text.decode(src),
            ProtocolKind::Binary => self.binary.decode(src),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() || self.is_mid_frame() {
            warn!(buffered = buf.len(), "Connection closed mid-frame");
            buf.clear();
            self.text.reset();
            self.binary.reset();
        }
        Ok(None)
    }
}

impl Encoder<Response> for GridCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self.kind.unwrap_or(ProtocolKind::Text) {
            ProtocolKind::Text => text::encode_response(&item, dst),
            ProtocolKind::Binary => binary::encode_response(&item, dst),
        }
        Ok(())
    }
}

/// Client-side binary codec: encodes requests, decodes responses.
#[derive(Debug, Clone)]
pub struct BinaryClientCodec {
    max_len: usize,
}

impl BinaryClientCodec {
    /// Create a codec accepting fields up to the configured value size.
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            max_len: config.max_value_len,
        }
    }
}

impl Default for BinaryClientCodec {
    fn default() -> Self {
        Self::new(&ProtocolConfig::default())
    }
}

impl Encoder<Request> for BinaryClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        binary::encode_request(&item, dst)
    }
}

impl Decoder for BinaryClientCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        binary::decode_response(src, self.max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::request::{Command, Opcode, ResponseBody, Status};
    use crate::types::{CacheEntry, EntryMetadata};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn decode_stream(codec: &mut GridCodec, stream: &[u8], chunk: usize) -> Vec<Inbound> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for piece in stream.chunks(chunk.max(1)) {
            buf.extend_from_slice(piece);
            while let Some(item) = codec.decode(&mut buf).unwrap() {
                out.push(item);
            }
        }
        out
    }

    fn commands(items: Vec<Inbound>) -> Vec<Command> {
        items
            .into_iter()
            .map(|item| match item {
                Inbound::Request(request) => request.command,
                Inbound::Invalid { error, .. } => panic!("invalid frame: {}", error),
            })
            .collect()
    }

    #[test]
    fn test_detects_text() {
        let mut codec = GridCodec::new(ProtocolConfig::default());
        let items = decode_stream(&mut codec, b"set foo 0 0 3\r\nbar\r\nget foo\r\n", 64);
        assert_eq!(codec.kind(), Some(ProtocolKind::Text));
        assert_eq!(items.len(), 2);

        let mut out = BytesMut::new();
        let entry = CacheEntry::new(Bytes::from_static(b"bar"), EntryMetadata::default());
        codec
            .encode(
                Response::status(0, Some(Opcode::Get), Status::Success).with_body(
                    ResponseBody::Values(vec![(Bytes::from_static(b"foo"), entry)]),
                ),
                &mut out,
            )
            .unwrap();
        assert_eq!(&out[..], b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn test_detects_binary() {
        let mut stream = BytesMut::new();
        let mut client = BinaryClientCodec::default();
        client
            .encode(Request::new(Command::Ping).with_message_id(3), &mut stream)
            .unwrap();

        let mut codec = GridCodec::new(ProtocolConfig::default());
        let items = decode_stream(&mut codec, &stream, 64);
        assert_eq!(codec.kind(), Some(ProtocolKind::Binary));
        assert_eq!(commands(items), vec![Command::Ping]);

        let mut out = BytesMut::new();
        codec
            .encode(
                Response::status(3, Some(Opcode::Ping), Status::Success),
                &mut out,
            )
            .unwrap();
        let response = client.decode(&mut out).unwrap().unwrap();
        assert_eq!(response.message_id, 3);
        assert_eq!(response.opcode, Some(Opcode::Ping));
    }

    #[test]
    fn test_eof_mid_frame_is_not_an_error() {
        let mut codec = GridCodec::new(ProtocolConfig::default());
        let mut buf = BytesMut::from(&b"set foo 0 0 10\r\nabc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn prop_text_split_reads_decode_identically(chunk in 1usize..24) {
            let stream: &[u8] =
                b"set a 1 0 5\r\nhello\r\nget a b\r\nincr n 4\r\nappend a 0 0 1\r\n!\r\ndelete a\r\n";
            let whole = commands(decode_stream(
                &mut GridCodec::new(ProtocolConfig::default()),
                stream,
                stream.len(),
            ));
            let split = commands(decode_stream(
                &mut GridCodec::new(ProtocolConfig::default()),
                stream,
                chunk,
            ));
            prop_assert_eq!(whole.len(), 5);
            prop_assert_eq!(split, whole);
        }
    }
}
