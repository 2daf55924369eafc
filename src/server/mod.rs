//! Client endpoint: connection handling, request dispatch and topology push.

pub mod dispatcher;
pub mod listener;
pub mod negotiator;

pub use dispatcher::{DispatchOutcome, RequestDispatcher};
pub use listener::GridServer;
pub use negotiator::{ClientIntelligenceNegotiator, ClientTopologyState, EndpointRegistry};
