//! Node-to-node communication layer.

pub mod rpc;
pub mod transport;

pub use rpc::{decode_message, encode_message, MessageHandler, NodeRequest, NodeResponse};
pub use transport::{ClusterTransport, LocalTransport, TransportInterceptor};
