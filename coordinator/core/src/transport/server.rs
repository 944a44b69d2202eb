//! Worker Listener
//!
//! TCP acceptor for worker channels. Each connection gets a reader task (the
//! current task) and a writer task; the first frame must be a registration,
//! after which heartbeats and task frames are routed through the
//! coordinator. Any framing or protocol violation tears the connection
//! down, which surfaces as `NODE_LOST` for whatever the node was running.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::coordinator::Coordinator;
use crate::protocol::{CoordinatorMessage, NodeMessage};
use crate::registry::{NodeId, NodeLostReason, RegisterRequest};
use crate::transport::frame::{encode, FrameDecoder};

/// Read buffer size per connection.
const READ_BUFFER: usize = 8192;

/// Outbound queue depth per worker connection.
const OUTBOUND_QUEUE: usize = 64;

/// TCP listener accepting worker connections.
pub struct WorkerListener {
    listener: TcpListener,
}

impl WorkerListener {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns any socket error from binding.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening for workers");
        Ok(Self { listener })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns any socket error from reading the local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, spawning a handler per worker.
    pub async fn run(self, coordinator: Arc<Coordinator>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "worker connection accepted");
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        handle_worker(stream, coordinator).await;
                    });
                }
                Err(error) => {
                    tracing::warn!(error = %error, "accept failed");
                }
            }
        }
    }
}

/// Drive one worker connection until it closes or misbehaves.
async fn handle_worker(stream: TcpStream, coordinator: Arc<Coordinator>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<CoordinatorMessage>(OUTBOUND_QUEUE);

    // Writer task: drain the outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match encode(&message) {
                Ok(bytes) => {
                    if let Err(error) = write_half.write_all(&bytes).await {
                        tracing::debug!(error = %error, "worker write failed");
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "frame encode failed");
                }
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER];
    let mut identity: Option<(NodeId, u64)> = None;

    'connection: loop {
        let read = match read_half.read(&mut buf).await {
            Ok(0) => break 'connection,
            Ok(n) => n,
            Err(error) => {
                tracing::debug!(error = %error, "worker read failed");
                break 'connection;
            }
        };
        decoder.push(&buf[..read]);

        loop {
            let frame: NodeMessage = match decoder.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    // Framing and protocol violations are terminal for the
                    // connection, never silently skipped.
                    tracing::warn!(error = %error, "protocol violation, closing connection");
                    break 'connection;
                }
            };

            match frame {
                NodeMessage::NodeRegister {
                    node_id,
                    account_key,
                    capabilities,
                } if identity.is_none() => {
                    let request = RegisterRequest {
                        node_id: node_id.clone(),
                        account_key,
                        capabilities,
                    };
                    match coordinator.registry().register(request, tx.clone()).await {
                        Ok((_tier, epoch)) => {
                            identity = Some((node_id, epoch));
                        }
                        Err(error) => {
                            tracing::warn!(node_id = %node_id, error = %error, "registration rejected");
                            let _ = tx
                                .send(CoordinatorMessage::RegisterNack {
                                    reason: error.to_string(),
                                })
                                .await;
                            break 'connection;
                        }
                    }
                }

                frame => match &identity {
                    Some((node_id, _)) => {
                        coordinator.deliver(node_id, frame).await;
                    }
                    None => {
                        tracing::warn!("frame before registration, closing connection");
                        let _ = tx
                            .send(CoordinatorMessage::RegisterNack {
                                reason: "registration required before any other frame".to_string(),
                            })
                            .await;
                        break 'connection;
                    }
                },
            }
        }
    }

    if let Some((node_id, epoch)) = identity {
        coordinator
            .registry()
            .disconnect_epoch(&node_id, epoch, NodeLostReason::Disconnected)
            .await;
    }

    drop(tx);
    let _ = writer.await;
}
