//! Client wire protocols.
//!
//! Two protocols share one port:
//!
//! - a memcached-style text protocol ([`text`]), and
//! - a binary protocol with message ids and topology push ([`binary`]).
//!
//! [`GridCodec`] picks the protocol from the first byte of a connection and
//! decodes both into [`Inbound`] frames. Decoders are resumable: a frame
//! split over any number of reads decodes the same as a frame received in
//! one read.
//!
//! Frames that cannot be decoded are reported as [`Inbound::Invalid`] and
//! the connection stays usable, unless the error is fatal
//! ([`ProtocolError::is_fatal`](crate::error::ProtocolError::is_fatal)).

pub mod binary;
pub mod codec;
pub mod cursor;
pub mod request;
pub mod text;

pub use codec::{BinaryClientCodec, GridCodec, ProtocolKind};
pub use request::{
    Command, Inbound, Opcode, Request, Response, ResponseBody, Status, TopologyUpdate,
};
