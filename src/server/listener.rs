//! TCP endpoint serving client connections.

use crate::config::ProtocolConfig;
use crate::error::{NetworkError, ProtocolError};
use crate::protocol::{GridCodec, Inbound};
use crate::server::dispatcher::{DispatchOutcome, RequestDispatcher};
use crate::server::negotiator::ClientTopologyState;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts client connections and serves each on its own task.
///
/// Requests of one connection are answered strictly in order.
pub struct GridServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GridServer {
    /// Bind `addr` and start accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        protocol: ProtocolConfig,
        dispatcher: Arc<RequestDispatcher>,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!(addr = %local_addr, "Grid server listening");
        let task = tokio::spawn(accept_loop(
            listener,
            protocol,
            dispatcher,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(&self) {
        info!(addr = %self.local_addr, "Shutting down grid server");
        self.shutdown.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(addr = %self.local_addr, "Grid server stopped"),
                Ok(Err(e)) => warn!(error = %e, "Grid server task failed"),
                Err(_) => warn!(addr = %self.local_addr, "Grid server shutdown timeout"),
            }
        }
    }
}

impl Drop for GridServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for GridServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridServer")
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    protocol: ProtocolConfig,
    dispatcher: Arc<RequestDispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted client connection");
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        protocol.clone(),
                        dispatcher.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    protocol: ProtocolConfig,
    dispatcher: Arc<RequestDispatcher>,
    shutdown: CancellationToken,
) {
    let _guard = dispatcher.metrics().connection_opened();
    let mut framed = Framed::new(stream, GridCodec::new(protocol));
    let mut state = ClientTopologyState::new();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let response = match frame {
            None => break,
            Some(Ok(Inbound::Request(request))) => {
                match dispatcher.dispatch(request, &mut state).await {
                    DispatchOutcome::Reply(response) => response,
                    DispatchOutcome::Silent => continue,
                    DispatchOutcome::Close => break,
                }
            }
            Some(Ok(Inbound::Invalid {
                message_id,
                opcode,
                error,
            })) => dispatcher.reject(message_id, opcode, &error),
            Some(Err(ProtocolError::Io(e))) => {
                debug!(peer = %peer, error = %e, "Connection failed");
                break;
            }
            Some(Err(error)) => {
                warn!(peer = %peer, error = %error, "Closing desynchronized connection");
                let response = dispatcher.reject(0, None, &error);
                let _ = framed.send(response).await;
                break;
            }
        };
        if let Err(e) = framed.send(response).await {
            debug!(peer = %peer, error = %e, "Failed to send response");
            break;
        }
    }
    debug!(peer = %peer, "Client connection closed");
}
