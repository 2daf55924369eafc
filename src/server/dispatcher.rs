//! Executes decoded requests against the node's caches.

use crate::cache::GridCache;
use crate::error::{Error, ProtocolError};
use crate::metrics::GridMetrics;
use crate::protocol::{Command, Opcode, Request, Response, ResponseBody, Status};
use crate::server::negotiator::{ClientIntelligenceNegotiator, ClientTopologyState};
use crate::types::{CacheEntry, WriteResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the connection does after a request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Send the response.
    Reply(Response),
    /// Send nothing.
    Silent,
    /// Close the connection.
    Close,
}

/// Maps requests onto [`GridCache`] operations.
pub struct RequestDispatcher {
    caches: DashMap<String, GridCache>,
    default_cache: String,
    version: String,
    negotiator: Arc<ClientIntelligenceNegotiator>,
    metrics: Arc<GridMetrics>,
}

impl RequestDispatcher {
    /// Create a dispatcher with no caches.
    pub fn new(
        default_cache: impl Into<String>,
        version: impl Into<String>,
        negotiator: Arc<ClientIntelligenceNegotiator>,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        Self {
            caches: DashMap::new(),
            default_cache: default_cache.into(),
            version: version.into(),
            negotiator,
            metrics,
        }
    }

    /// Serve a cache.
    pub fn register_cache(&self, cache: GridCache) {
        self.caches.insert(cache.name().to_string(), cache);
    }

    /// Stop serving a cache.
    pub fn remove_cache(&self, name: &str) -> Option<GridCache> {
        self.caches.remove(name).map(|(_, cache)| cache)
    }

    /// Cache served under `name`.
    pub fn cache(&self, name: &str) -> Option<GridCache> {
        self.caches.get(name).map(|c| c.clone())
    }

    /// Metrics the dispatcher records into.
    pub fn metrics(&self) -> &Arc<GridMetrics> {
        &self.metrics
    }

    /// Execute a request.
    pub async fn dispatch(
        &self,
        request: Request,
        state: &mut ClientTopologyState,
    ) -> DispatchOutcome {
        let opcode = request.command.opcode();
        self.metrics.record_command(opcode.name());
        if opcode == Opcode::Quit {
            return DispatchOutcome::Close;
        }

        let cache_name = request
            .cache_name
            .clone()
            .unwrap_or_else(|| self.default_cache.clone());
        let mut response = match self.cache(&cache_name) {
            Some(cache) => match self.execute(&cache, request.command).await {
                Ok(response) => response,
                Err(e) => error_response(opcode, &e),
            },
            None => match request.command {
                // Cache-independent commands work without a cache.
                Command::Version => Response::status(0, Some(opcode), Status::Success)
                    .with_body(ResponseBody::Version(self.version.clone())),
                Command::Ping => Response::status(0, Some(opcode), Status::Success),
                _ => error_response(opcode, &Error::CacheNotFound(cache_name.clone())),
            },
        };
        response.message_id = request.message_id;

        if request.noreply {
            return DispatchOutcome::Silent;
        }
        response.topology = self.negotiator.negotiate(
            &cache_name,
            request.intelligence,
            request.topology_id,
            state,
        );
        if response.topology.is_some() {
            self.metrics.record_topology_push();
        }
        DispatchOutcome::Reply(response)
    }

    /// Reply to a frame the decoder rejected.
    pub fn reject(&self, message_id: u64, opcode: Option<Opcode>, error: &ProtocolError) -> Response {
        self.metrics.record_protocol_error();
        debug!(message_id, ?opcode, error = %error, "Rejected request");
        let (status, message) = match error {
            ProtocolError::UnknownOperation(op) => (Status::UnknownOperation, op.clone()),
            ProtocolError::OversizedField { field: "value", .. } => (
                Status::ServerError,
                "object too large for cache".to_string(),
            ),
            ProtocolError::UnsupportedVersion(_) => (Status::UnknownVersion, error.to_string()),
            ProtocolError::InvalidMagic(_) => (Status::InvalidMagic, error.to_string()),
            ProtocolError::Malformed(message) => (Status::ClientError, message.clone()),
            ProtocolError::Io(_) => (Status::ServerError, error.to_string()),
            _ => (Status::ClientError, error.to_string()),
        };
        Response::error(message_id, opcode, status, message)
    }

    async fn execute(&self, cache: &GridCache, command: Command) -> crate::Result<Response> {
        let opcode = command.opcode();
        let ok = |status: Status| Response::status(0, Some(opcode), status);

        let response = match command {
            Command::Get { keys } => {
                let mut values: Vec<(bytes::Bytes, CacheEntry)> = Vec::with_capacity(keys.len());
                for key in keys {
                    let entry = cache.get(&key).await?;
                    self.metrics.record_get(entry.is_some());
                    if let Some(entry) = entry {
                        values.push((key, entry));
                    }
                }
                let status = if values.is_empty() {
                    Status::NotFound
                } else {
                    Status::Success
                };
                ok(status).with_body(ResponseBody::Values(values))
            }
            Command::Put {
                key,
                value,
                metadata,
            } => write_response(opcode, cache.put(key, value, metadata).await?),
            Command::PutIfAbsent {
                key,
                value,
                metadata,
            } => write_response(opcode, cache.put_if_absent(key, value, metadata).await?),
            Command::Replace {
                key,
                value,
                metadata,
            } => write_response(opcode, cache.replace(key, value, metadata).await?),
            Command::Append { key, data } => write_response(opcode, cache.append(key, data).await?),
            Command::Prepend { key, data } => {
                write_response(opcode, cache.prepend(key, data).await?)
            }
            Command::Remove { key } => write_response(opcode, cache.remove(key).await?),
            Command::Increment { key, delta } => {
                write_response(opcode, cache.increment(key, delta).await?)
            }
            Command::Decrement { key, delta } => {
                write_response(opcode, cache.decrement(key, delta).await?)
            }
            Command::ContainsKey { key } => {
                if cache.contains_key(&key).await? {
                    ok(Status::Success)
                } else {
                    ok(Status::NotFound)
                }
            }
            Command::Clear => {
                cache.clear().await?;
                ok(Status::Success)
            }
            Command::Stats => {
                let stats = cache.stats().await?;
                let mut lines = self.metrics.snapshot().stat_lines();
                lines.push(("curr_items".to_string(), stats.entry_count.to_string()));
                lines.push(("cmd_set_applied".to_string(), stats.writes.to_string()));
                lines.push(("removals".to_string(), stats.removals.to_string()));
                if let Some(id) = self.negotiator.client_topology_id(cache.name()) {
                    lines.push(("client_topology_id".to_string(), id.to_string()));
                }
                ok(Status::Success).with_body(ResponseBody::Stats(lines))
            }
            Command::Version => {
                ok(Status::Success).with_body(ResponseBody::Version(self.version.clone()))
            }
            Command::Ping => ok(Status::Success),
            Command::Quit => ok(Status::Success),
        };
        Ok(response)
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("caches", &self.caches.len())
            .field("default_cache", &self.default_cache)
            .finish()
    }
}

fn write_response(opcode: Opcode, result: WriteResult) -> Response {
    let ok = |status: Status| Response::status(0, Some(opcode), status);
    match result {
        WriteResult::Stored | WriteResult::Removed => ok(Status::Success),
        WriteResult::NotStored => ok(Status::NotExecuted),
        WriteResult::NotFound => ok(Status::NotFound),
        WriteResult::Counter(value) => ok(Status::Success).with_body(ResponseBody::Counter(value)),
        WriteResult::NonNumeric => Response::error(
            0,
            Some(opcode),
            Status::ClientError,
            "cannot increment or decrement non-numeric value",
        ),
    }
}

fn error_response(opcode: Opcode, error: &Error) -> Response {
    let status = match error {
        Error::Timeout => Status::Timeout,
        e if e.is_retryable() => Status::Retry,
        _ => Status::ServerError,
    };
    warn!(op = opcode.name(), error = %error, "Request failed");
    Response::error(0, Some(opcode), status, error.to_string())
}
