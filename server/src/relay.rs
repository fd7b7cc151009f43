//! Inbound dispatch for the relay server
//!
//! Turns one datagram from one address into state changes and outbound
//! traffic:
//! - Decodes the packet and maps the source address to a live session
//! - Resets the session's heartbeat counter on any well-formed packet
//! - Relays pose, voice and echo packets to every other session
//! - Arbitrates scene object ownership before relaying object updates
//! - Tears sessions down exactly once on disconnect or heartbeat timeout
//!
//! All shared state sits behind async locks, so a `Relay` can be cloned into
//! as many tasks as needed. Locks are always taken in the order registry,
//! objects, router; the heartbeat monitor is never held across another lock.

use crate::config::ServerConfig;
use crate::heartbeat::{HeartbeatMonitor, Liveness};
use crate::ownership::{ObjectLimitReached, OwnershipConflict, OwnershipTable, Transform};
use crate::registry::{RegistryError, SessionRegistry};
use crate::router::{BroadcastRouter, Datagram, Delivery, DeliveryError, Outbound};
use crate::transport::DatagramTransport;
use log::{debug, error, info, warn};
use shared::{check_bounded_str, CodecError, Packet, PacketKind, SceneObject, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed packet: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("packet names session {claimed} but came from session {actual}")]
    SessionMismatch {
        claimed: SessionId,
        actual: SessionId,
    },

    #[error(transparent)]
    OwnershipConflict(#[from] OwnershipConflict),

    #[error(transparent)]
    ObjectLimit(#[from] ObjectLimitReached),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("delivery to session {session} failed: {reason}")]
    DeliveryFailure {
        session: SessionId,
        reason: DeliveryError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Disconnect,
    Timeout,
}

/// What handling one datagram did
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Assigned {
        session: SessionId,
        fresh: bool,
        delivery: Delivery,
        /// Scene objects queued for a new session after its id
        snapshot: usize,
    },
    Relayed {
        from: SessionId,
        kind: PacketKind,
        delivery: Delivery,
    },
    Heartbeat {
        from: SessionId,
    },
    Ended {
        session: SessionId,
        delivery: Delivery,
    },
    ObjectUpdated {
        from: SessionId,
        object: SceneObject,
        delivery: Delivery,
    },
}

/// What one heartbeat interval did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeartbeatReport {
    pub probed: Delivery,
    pub expired: Vec<SessionId>,
}

pub struct Relay<T: DatagramTransport> {
    transport: Arc<T>,
    registry: Arc<RwLock<SessionRegistry>>,
    heartbeats: Arc<Mutex<HeartbeatMonitor>>,
    objects: Arc<RwLock<OwnershipTable>>,
    router: Arc<RwLock<BroadcastRouter>>,
    outbound_capacity: usize,
}

impl<T: DatagramTransport> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            heartbeats: Arc::clone(&self.heartbeats),
            objects: Arc::clone(&self.objects),
            router: Arc::clone(&self.router),
            outbound_capacity: self.outbound_capacity,
        }
    }
}

impl<T: DatagramTransport> Relay<T> {
    pub fn new(transport: Arc<T>, config: &ServerConfig) -> Self {
        Self {
            transport,
            registry: Arc::new(RwLock::new(SessionRegistry::new(config.max_sessions))),
            heartbeats: Arc::new(Mutex::new(HeartbeatMonitor::new(
                config.heartbeat_interval,
                config.miss_threshold,
            ))),
            objects: Arc::new(RwLock::new(OwnershipTable::with_limit(config.max_objects))),
            router: Arc::new(RwLock::new(BroadcastRouter::new())),
            outbound_capacity: config.outbound_capacity.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Handles one inbound datagram from `addr`
    pub async fn handle_datagram(
        &self,
        addr: SocketAddr,
        bytes: &[u8],
    ) -> Result<Dispatched, RelayError> {
        match Packet::decode(bytes)? {
            Packet::SessionAssign { session } => self.assign(addr, session).await,
            Packet::Heartbeat => {
                let from = self.accept(addr, None).await?;
                Ok(Dispatched::Heartbeat { from })
            }
            packet @ Packet::Echo { .. } => {
                let from = self.accept(addr, None).await?;
                self.relay(from, &packet).await
            }
            packet @ (Packet::HeadPose { .. } | Packet::HandPose { .. }) => {
                let from = self.accept_as(addr, packet.session()).await?;
                self.relay(from, &packet).await
            }
            Packet::VoiceBuffer(voice) => {
                let from = self.accept_as(addr, Some(voice.session)).await?;
                self.relay(from, &Packet::VoiceBuffer(voice)).await
            }
            Packet::SessionEnded { session } => {
                let from = self.accept_as(addr, Some(session)).await?;
                let delivery = self
                    .end_session(from, EndReason::Disconnect)
                    .await?
                    .unwrap_or_default();
                Ok(Dispatched::Ended {
                    session: from,
                    delivery,
                })
            }
            Packet::DynamicSceneObject(object) => {
                let from = self.accept(addr, None).await?;
                self.update_object(from, object).await
            }
        }
    }

    /// Maps `addr` to its session and counts the datagram as activity.
    async fn accept(
        &self,
        addr: SocketAddr,
        claimed: Option<SessionId>,
    ) -> Result<SessionId, RelayError> {
        let from = self.sender_of(addr, claimed).await?;
        self.heartbeats.lock().await.record_activity(from);
        Ok(from)
    }

    /// Like `accept`, for packets that name their own session.
    async fn accept_as(
        &self,
        addr: SocketAddr,
        claimed: Option<SessionId>,
    ) -> Result<SessionId, RelayError> {
        let from = self.accept(addr, claimed).await?;
        if let Some(claimed) = claimed {
            self.check_claimed(from, claimed).await?;
        }
        Ok(from)
    }

    /// Answers a session id request, creating the session if needed
    async fn assign(
        &self,
        addr: SocketAddr,
        requested: SessionId,
    ) -> Result<Dispatched, RelayError> {
        let assignment = {
            let mut registry = self.registry.write().await;
            let assignment = registry.request_resend(requested, addr)?;
            if assignment.fresh {
                let outbound = self.open_outbound(addr);
                self.router.write().await.attach(assignment.session, outbound);
            }
            assignment
        };

        let session = assignment.session;
        {
            let mut heartbeats = self.heartbeats.lock().await;
            if assignment.fresh {
                heartbeats.track(session);
            } else {
                heartbeats.record_activity(session);
            }
        }

        let snapshot = if assignment.fresh {
            self.objects.read().await.snapshot()
        } else {
            Vec::new()
        };

        let delivery = self
            .router
            .read()
            .await
            .unicast_packet(session, &Packet::SessionAssign { session })?;
        if let Some(&failure) = delivery.failed.first() {
            return Err(failure.into());
        }
        let snapshot = self.send_snapshot(session, snapshot).await;

        if !assignment.fresh && requested != session {
            debug!(
                "Address {} asked for session {} and keeps session {}",
                addr, requested, session
            );
        }

        Ok(Dispatched::Assigned {
            session,
            fresh: assignment.fresh,
            delivery,
            snapshot,
        })
    }

    /// Queues the scene for a new session, waiting for room in its queue
    /// rather than dropping what does not fit. Returns the objects queued.
    async fn send_snapshot(&self, session: SessionId, objects: Vec<SceneObject>) -> usize {
        let outbound = match self.router.read().await.outbound(session) {
            Some(outbound) => outbound,
            None => return 0,
        };

        let total = objects.len();
        let mut queued = 0;
        for object in objects {
            let id = object.id.clone();
            let datagram: Datagram = match Packet::DynamicSceneObject(object).encode() {
                Ok(bytes) => bytes.into(),
                Err(e) => {
                    warn!("Object {:?} left out of snapshot for session {}: {}", id, session, e);
                    continue;
                }
            };
            if outbound.send(datagram).await.is_err() {
                warn!(
                    "Session {} closed during snapshot, {} of {} objects queued",
                    session, queued, total
                );
                break;
            }
            queued += 1;
        }

        if queued > 0 {
            debug!("Sent {} scene objects to session {}", queued, session);
        }
        queued
    }

    async fn sender_of(
        &self,
        addr: SocketAddr,
        claimed: Option<SessionId>,
    ) -> Result<SessionId, RelayError> {
        let mut registry = self.registry.write().await;
        match registry.find_by_addr(addr) {
            Some(session) => {
                registry.touch(session);
                Ok(session)
            }
            None => Err(RelayError::UnknownSession(
                claimed.unwrap_or(SessionId::NONE),
            )),
        }
    }

    /// The session named inside a packet must be the one that sent it.
    async fn check_claimed(&self, from: SessionId, claimed: SessionId) -> Result<(), RelayError> {
        if claimed == from {
            return Ok(());
        }
        if !self.registry.read().await.is_live(claimed) {
            return Err(RelayError::UnknownSession(claimed));
        }
        Err(RelayError::SessionMismatch {
            claimed,
            actual: from,
        })
    }

    async fn relay(&self, from: SessionId, packet: &Packet) -> Result<Dispatched, RelayError> {
        let registry = self.registry.read().await;
        let router = self.router.read().await;
        let delivery = router.forward(&registry, from, packet)?;
        Ok(Dispatched::Relayed {
            from,
            kind: packet.kind(),
            delivery,
        })
    }

    /// Applies a scene object announcement, claim, pose update or release
    ///
    /// The wire owner field states what the sender wants: its own id claims
    /// the object, zero gives it up (or just announces a new object), and any
    /// other id is refused. Refused updates leave the object untouched and
    /// the sender is sent the authoritative state instead.
    async fn update_object(
        &self,
        from: SessionId,
        announced: SceneObject,
    ) -> Result<Dispatched, RelayError> {
        // Only ids that can go back out on the wire may enter the table
        check_bounded_str(&announced.id)?;

        let registry = self.registry.read().await;
        if !registry.is_live(from) {
            return Err(RelayError::UnknownSession(from));
        }

        let transform = Transform::of(&announced);
        let result = {
            let mut objects = self.objects.write().await;
            let created = objects.announce(&announced.id, transform)?;
            let owner = objects.get_owner(&announced.id);

            let applied = if announced.owner == from {
                if objects.claim(&announced.id, from) {
                    objects
                        .update_pose(&announced.id, from, transform)
                        .map(SceneObject::clone)
                } else {
                    Err(conflict(&announced.id, owner, from))
                }
            } else if announced.owner == SessionId::NONE && owner == from {
                let updated = objects
                    .update_pose(&announced.id, from, transform)
                    .map(SceneObject::clone);
                objects.release(&announced.id, from);
                updated.map(|object| object.with_owner(SessionId::NONE))
            } else if announced.owner == SessionId::NONE && created {
                objects
                    .get(&announced.id)
                    .cloned()
                    .ok_or_else(|| conflict(&announced.id, owner, from))
            } else {
                Err(conflict(&announced.id, owner, from))
            };

            applied.map_err(|conflict| (conflict, objects.get(&announced.id).cloned()))
        };

        let router = self.router.read().await;
        match result {
            Ok(object) => {
                let packet = Packet::DynamicSceneObject(object.clone());
                let delivery = router.forward(&registry, from, &packet)?;
                Ok(Dispatched::ObjectUpdated {
                    from,
                    object,
                    delivery,
                })
            }
            Err((conflict, current)) => {
                debug!("{}", conflict);
                if let Some(current) = current {
                    router.unicast_packet(from, &Packet::DynamicSceneObject(current))?;
                }
                Err(conflict.into())
            }
        }
    }

    /// Ends a session, returning `None` if it had already ended
    pub async fn end_session(
        &self,
        session: SessionId,
        reason: EndReason,
    ) -> Result<Option<Delivery>, RelayError> {
        let released = match self.registry.write().await.release(session) {
            Some(released) => released,
            None => return Ok(None),
        };

        self.heartbeats.lock().await.untrack(session);
        self.router.write().await.detach(session);
        let orphaned = self.objects.write().await.release_all(session);

        let registry = self.registry.read().await;
        let router = self.router.read().await;
        for object in orphaned {
            debug!("Object {:?} released by ending session {}", object.id, session);
            let id = object.id.clone();
            if let Err(e) = router.broadcast(&registry, &Packet::DynamicSceneObject(object)) {
                warn!("Release of object {:?} not broadcast: {}", id, e);
            }
        }
        let delivery = router.broadcast(&registry, &Packet::SessionEnded { session })?;

        info!(
            "Session {} ended ({:?}) after {:.1}s, {} packets received",
            session,
            reason,
            released.connected_at.elapsed().as_secs_f32(),
            released.packets_received
        );
        Ok(Some(delivery))
    }

    /// Runs one heartbeat interval: probes live sessions, ends dead ones.
    ///
    /// Every expired session is ended even when an earlier one fails, since
    /// the monitor has already stopped tracking all of them.
    pub async fn heartbeat_tick(&self) -> HeartbeatReport {
        let tick = self.heartbeats.lock().await.tick();

        let probed = match Packet::Heartbeat.encode() {
            Ok(bytes) => self
                .router
                .read()
                .await
                .fan_out(&tick.probe, None, bytes.into()),
            Err(e) => {
                error!("Heartbeat probe not encoded: {}", e);
                Delivery::default()
            }
        };

        for &session in &tick.expired {
            warn!("Session {} timed out", session);
            if let Err(e) = self.end_session(session, EndReason::Timeout).await {
                error!("Ending timed out session {} failed: {}", session, e);
            }
        }

        HeartbeatReport {
            probed,
            expired: tick.expired,
        }
    }

    fn open_outbound(&self, addr: SocketAddr) -> Outbound {
        let (tx, mut rx) = mpsc::channel::<Datagram>(self.outbound_capacity);
        let transport = Arc::clone(&self.transport);

        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                if let Err(e) = transport.send_to(&datagram, addr).await {
                    warn!("Failed to send to {}: {}", addr, e);
                }
            }
            debug!("Outbound queue for {} closed", addr);
        });

        tx
    }

    pub async fn session_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn is_live(&self, session: SessionId) -> bool {
        self.registry.read().await.is_live(session)
    }

    pub async fn liveness(&self, session: SessionId) -> Liveness {
        self.heartbeats.lock().await.liveness(session)
    }

    pub async fn owner_of(&self, object_id: &str) -> SessionId {
        self.objects.read().await.get_owner(object_id)
    }

    pub async fn object(&self, object_id: &str) -> Option<SceneObject> {
        self.objects.read().await.get(object_id).cloned()
    }
}

fn conflict(object: &str, owner: SessionId, requester: SessionId) -> OwnershipConflict {
    OwnershipConflict {
        object: object.to_string(),
        owner,
        requester,
    }
}

impl From<(SessionId, DeliveryError)> for RelayError {
    fn from((session, reason): (SessionId, DeliveryError)) -> Self {
        RelayError::DeliveryFailure { session, reason }
    }
}

impl RelayError {
    /// Errors that drop one packet but say nothing about the connection.
    pub fn is_packet_level(&self) -> bool {
        !matches!(self, RelayError::Registry(_))
    }
}
