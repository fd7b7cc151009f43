use crate::state::{ParticipantView, ViewChange};
use log::{debug, info, warn};
use shared::{
    CodecError, HandPoses, Packet, Pose, SceneObject, SessionId, VoiceBuffer, VoiceCodec,
    MAX_DATAGRAM_LEN, VOICE_FRAME_MAX,
};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

/// Time between session requests while connecting
const CONNECT_RETRY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to a session")]
    NotConnected,
    #[error("no session assigned within {0:?}")]
    ConnectTimeout(Duration),
    #[error("invalid server address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("voice codec failed: {0}")]
    Voice(Box<dyn std::error::Error + Send + Sync>),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// One participant's connection to the relay server
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    view: ParticipantView,
    packets_received: u64,
}

impl Client {
    pub async fn new(server_addr: &str) -> ClientResult<Self> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind_addr = if server_addr.ip().is_loopback() {
            "127.0.0.1:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        Ok(Client {
            socket,
            server_addr,
            view: ParticipantView::new(),
            packets_received: 0,
        })
    }

    pub fn session(&self) -> SessionId {
        self.view.session
    }

    pub fn view(&self) -> &ParticipantView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ParticipantView {
        &mut self.view
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    async fn send_packet(&self, packet: &Packet) -> ClientResult<()> {
        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    fn require_session(&self) -> ClientResult<SessionId> {
        if self.view.is_connected() {
            Ok(self.view.session)
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Requests a session id and waits for the assignment
    ///
    /// Re-sends the request periodically until `wait` runs out. A client that
    /// already holds an id asks for that id again.
    pub async fn connect(&mut self, wait: Duration) -> ClientResult<SessionId> {
        info!("Connecting to {}...", self.server_addr);
        let deadline = Instant::now() + wait;
        let request = Packet::SessionAssign {
            session: self.view.session,
        };

        while Instant::now() < deadline {
            self.send_packet(&request).await?;

            let retry_at = (Instant::now() + CONNECT_RETRY).min(deadline);
            while Instant::now() < retry_at {
                let remaining = retry_at.saturating_duration_since(Instant::now());
                for change in self.poll(remaining).await? {
                    if let ViewChange::Assigned(session) = change {
                        info!("Connected! Session ID: {}", session);
                        return Ok(session);
                    }
                }
            }
        }

        Err(ClientError::ConnectTimeout(wait))
    }

    /// Receives and applies whatever the server sent
    ///
    /// Waits up to `wait` for the first datagram, then drains anything else
    /// already queued without blocking. Heartbeats are answered right away.
    pub async fn poll(&mut self, wait: Duration) -> ClientResult<Vec<ViewChange>> {
        let mut buffer = [0u8; MAX_DATAGRAM_LEN];
        let mut changes = Vec::new();

        let first = match timeout(wait, self.socket.recv_from(&mut buffer)).await {
            Ok(result) => result?,
            Err(_) => return Ok(changes),
        };
        changes.extend(self.handle_datagram(&buffer[..first.0], first.1).await?);

        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, addr)) => {
                    changes.extend(self.handle_datagram(&buffer[..len], addr).await?)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(changes)
    }

    async fn handle_datagram(
        &mut self,
        bytes: &[u8],
        addr: SocketAddr,
    ) -> ClientResult<Option<ViewChange>> {
        if addr != self.server_addr {
            debug!("Ignoring datagram from {}", addr);
            return Ok(None);
        }

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropped malformed datagram from server: {}", e);
                return Ok(None);
            }
        };
        self.packets_received += 1;

        let change = self.view.apply(&packet);
        match change {
            ViewChange::HeartbeatRequested => self.send_packet(&Packet::Heartbeat).await?,
            ViewChange::Ended => warn!("Session ended by server"),
            _ => {}
        }
        Ok(Some(change))
    }

    pub async fn send_head_pose(&self, pose: Pose) -> ClientResult<()> {
        let session = self.require_session()?;
        self.send_packet(&Packet::HeadPose { session, pose }).await
    }

    /// `None` tells the others that hand tracking is currently lost
    pub async fn send_hand_pose(&self, hands: Option<HandPoses>) -> ClientResult<()> {
        let session = self.require_session()?;
        self.send_packet(&Packet::HandPose { session, hands }).await
    }

    /// Compresses up to four PCM frames with `codec` and sends them
    pub async fn send_voice<C: VoiceCodec>(
        &self,
        codec: &mut C,
        pcm_frames: &[&[i16]],
    ) -> ClientResult<()> {
        let mut encoded = Vec::with_capacity(pcm_frames.len());
        for pcm in pcm_frames {
            let mut out = [0u8; VOICE_FRAME_MAX];
            let len = codec
                .encode_frame(pcm, &mut out)
                .map_err(|e| ClientError::Voice(Box::new(e)))?;
            encoded.push(out[..len.min(VOICE_FRAME_MAX)].to_vec());
        }

        let frames: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        self.send_voice_frames(&frames).await
    }

    /// Sends frames that are already compressed
    pub async fn send_voice_frames(&self, frames: &[&[u8]]) -> ClientResult<()> {
        let session = self.require_session()?;
        let voice = VoiceBuffer::from_frames(session, frames)?;
        self.send_packet(&Packet::VoiceBuffer(voice)).await
    }

    pub async fn send_echo(&self, text: &str) -> ClientResult<()> {
        self.require_session()?;
        self.send_packet(&Packet::Echo {
            text: text.to_string(),
        })
        .await
    }

    /// Asks for ownership of `object`, announcing its pose
    ///
    /// The view records the claim right away. The server only answers a
    /// refused claim, with the real state, which then replaces it.
    pub async fn claim_object(&mut self, object: &SceneObject) -> ClientResult<()> {
        let session = self.require_session()?;
        self.send_object(object.clone().with_owner(session)).await
    }

    /// Moves an object this session owns; the server refuses it otherwise
    pub async fn update_object(&mut self, object: &SceneObject) -> ClientResult<()> {
        self.claim_object(object).await
    }

    /// Gives up ownership, leaving the object at `object`'s pose
    pub async fn release_object(&mut self, object: &SceneObject) -> ClientResult<()> {
        self.require_session()?;
        self.send_object(object.clone().with_owner(SessionId::NONE)).await
    }

    async fn send_object(&mut self, object: SceneObject) -> ClientResult<()> {
        let packet = Packet::DynamicSceneObject(object);
        self.send_packet(&packet).await?;
        self.view.apply(&packet);
        Ok(())
    }

    /// Ends the session; a no-op if not connected
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        if !self.view.is_connected() {
            return Ok(());
        }
        let session = self.view.session;
        self.send_packet(&Packet::SessionEnded { session }).await?;
        self.view.session = SessionId::NONE;
        info!("Disconnected session {}", session);
        Ok(())
    }
}
