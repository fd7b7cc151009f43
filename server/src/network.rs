//! Server network layer: socket receive loop and heartbeat timing

use crate::config::ServerConfig;
use crate::relay::{Dispatched, Relay, RelayError};
use crate::transport::DatagramTransport;
use log::{debug, error, info, warn};
use shared::MAX_DATAGRAM_LEN;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { bytes: Vec<u8>, addr: SocketAddr },
    Shutdown,
}

/// Stops a running server from another task
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.server_tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }
}

/// Relay server bound to one datagram transport
pub struct Server<T: DatagramTransport = UdpSocket> {
    relay: Relay<T>,
    heartbeat_interval: Duration,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    receiver: Option<JoinHandle<()>>,
}

impl Server<UdpSocket> {
    /// Binds a UDP socket to `config.bind_addr`
    pub async fn bind(config: &ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(&config.bind_addr).await?;
        info!("Server listening on {}", socket.local_addr()?);
        Ok(Self::with_transport(Arc::new(socket), config))
    }
}

impl<T: DatagramTransport> Server<T> {
    pub fn with_transport(transport: Arc<T>, config: &ServerConfig) -> Self {
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Server {
            relay: Relay::new(transport, config),
            heartbeat_interval: config.heartbeat_interval,
            server_tx,
            server_rx,
            receiver: None,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.relay.transport().local_addr()
    }

    /// Handle onto the shared relay state
    pub fn relay(&self) -> Relay<T> {
        self.relay.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&mut self) {
        let transport = Arc::clone(self.relay.transport());
        let server_tx = self.server_tx.clone();

        self.receiver = Some(tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_LEN];

            loop {
                match transport.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let message = ServerMessage::DatagramReceived {
                            bytes: buffer[..len].to_vec(),
                            addr,
                        };
                        if server_tx.send(message).is_err() {
                            debug!("Main loop gone, receiver exiting");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    async fn handle_datagram(&self, addr: SocketAddr, bytes: &[u8]) {
        match self.relay.handle_datagram(addr, bytes).await {
            Ok(Dispatched::Assigned {
                session,
                fresh: true,
                snapshot,
                ..
            }) => {
                debug!(
                    "New session {} for {}, {} scene objects sent",
                    session, addr, snapshot
                );
            }
            Ok(Dispatched::Ended { session, delivery }) => {
                info!(
                    "Session {} disconnected, {} sessions notified",
                    session,
                    delivery.delivered.len()
                );
            }
            Ok(_) => {}
            Err(RelayError::OwnershipConflict(conflict)) => {
                debug!("Refused object update from {}: {}", addr, conflict);
            }
            Err(RelayError::Registry(e)) => {
                warn!("Rejected session request from {}: {}", addr, e);
            }
            Err(e) => {
                warn!("Dropped datagram from {}: {}", addr, e);
            }
        }
    }

    async fn handle_heartbeat(&self) {
        let report = self.relay.heartbeat_tick().await;
        if !report.expired.is_empty() {
            info!("Heartbeat expired sessions {:?}", report.expired);
        }
        if !report.probed.is_complete() {
            debug!("Heartbeat probe failures: {:?}", report.probed.failed);
        }
    }

    /// Main server loop: dispatches datagrams and runs heartbeat probes
    pub async fn run(&mut self) -> ServerResult<()> {
        self.spawn_network_receiver();

        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        heartbeat.tick().await;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { bytes, addr }) => {
                            self.handle_datagram(addr, &bytes).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = heartbeat.tick() => {
                    self.handle_heartbeat().await;
                    debug!("{} live sessions", self.relay.session_count().await);
                },
            }
        }

        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        Ok(())
    }
}

impl<T: DatagramTransport> Drop for Server<T> {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}
