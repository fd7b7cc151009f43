//! Fan-out of relayed packets to per-session outbound queues.
//!
//! Every live session owns a bounded queue drained by its own writer task.
//! The router only ever `try_send`s into those queues, so a slow or vanished
//! peer shows up as a per-recipient [`DeliveryError`] instead of stalling
//! delivery to everyone else.

use crate::registry::SessionRegistry;
use log::{debug, warn};
use shared::{CodecError, Packet, PacketKind, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// One encoded packet, shared by every recipient's queue.
pub type Datagram = Arc<[u8]>;

pub type Outbound = mpsc::Sender<Datagram>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("outbound queue closed")]
    Closed,
    #[error("no outbound route")]
    NoRoute,
}

/// How a packet kind travels through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// To every live session except the one it came from
    FanOut,
    /// Only to one session
    Unicast,
    /// Server-originated, to every live session
    Broadcast,
}

pub fn route_for(kind: PacketKind) -> Route {
    match kind {
        PacketKind::SessionAssign | PacketKind::Heartbeat => Route::Unicast,
        PacketKind::SessionEnded => Route::Broadcast,
        kind if kind.is_fan_out() => Route::FanOut,
        _ => Route::Unicast,
    }
}

/// Per-recipient result of a fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: Vec<SessionId>,
    pub failed: Vec<(SessionId, DeliveryError)>,
}

impl Delivery {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
pub struct BroadcastRouter {
    outbound: HashMap<SessionId, Outbound>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, session: SessionId, outbound: Outbound) {
        self.outbound.insert(session, outbound);
    }

    /// Drops the session's queue; its writer task exits once the queue drains.
    pub fn detach(&mut self, session: SessionId) -> bool {
        self.outbound.remove(&session).is_some()
    }

    pub fn has_route(&self, session: SessionId) -> bool {
        self.outbound.contains_key(&session)
    }

    /// The session's queue, for senders that wait for room instead of dropping.
    pub fn outbound(&self, session: SessionId) -> Option<Outbound> {
        self.outbound.get(&session).cloned()
    }

    pub fn unicast(&self, session: SessionId, datagram: Datagram) -> Result<(), DeliveryError> {
        let outbound = self.outbound.get(&session).ok_or(DeliveryError::NoRoute)?;
        outbound.try_send(datagram).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn unicast_packet(
        &self,
        session: SessionId,
        packet: &Packet,
    ) -> Result<Delivery, CodecError> {
        let datagram: Datagram = packet.encode()?.into();
        let mut delivery = Delivery::default();
        self.deliver(&mut delivery, session, datagram);
        Ok(delivery)
    }

    /// Sends `datagram` to each recipient once, skipping `except`.
    pub fn fan_out(
        &self,
        recipients: &[SessionId],
        except: Option<SessionId>,
        datagram: Datagram,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        let mut seen = Vec::with_capacity(recipients.len());

        for &session in recipients {
            if Some(session) == except || seen.contains(&session) {
                continue;
            }
            seen.push(session);
            self.deliver(&mut delivery, session, Arc::clone(&datagram));
        }

        delivery
    }

    /// Relays a participant's packet to every other live session.
    pub fn forward(
        &self,
        registry: &SessionRegistry,
        from: SessionId,
        packet: &Packet,
    ) -> Result<Delivery, CodecError> {
        let datagram: Datagram = packet.encode()?.into();
        let delivery = self.fan_out(&registry.live_ids(), Some(from), datagram);
        debug!(
            "Relayed {} from session {} to {} sessions",
            packet.kind(),
            from,
            delivery.delivered.len()
        );
        Ok(delivery)
    }

    /// Server-originated packet to every live session.
    pub fn broadcast(
        &self,
        registry: &SessionRegistry,
        packet: &Packet,
    ) -> Result<Delivery, CodecError> {
        let datagram: Datagram = packet.encode()?.into();
        Ok(self.fan_out(&registry.live_ids(), None, datagram))
    }

    /// Routes `packet` from `from` according to its kind.
    pub fn route(
        &self,
        registry: &SessionRegistry,
        from: SessionId,
        packet: &Packet,
    ) -> Result<Delivery, CodecError> {
        match route_for(packet.kind()) {
            Route::FanOut => self.forward(registry, from, packet),
            Route::Broadcast => self.broadcast(registry, packet),
            Route::Unicast => self.unicast_packet(from, packet),
        }
    }

    fn deliver(&self, delivery: &mut Delivery, session: SessionId, datagram: Datagram) {
        match self.unicast(session, datagram) {
            Ok(()) => delivery.delivered.push(session),
            Err(e) => {
                warn!("Delivery to session {} failed: {}", session, e);
                delivery.failed.push((session, e));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Pose, VoiceBuffer};
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn setup(
        count: u16,
        capacity: usize,
    ) -> (
        SessionRegistry,
        BroadcastRouter,
        Vec<(SessionId, mpsc::Receiver<Datagram>)>,
    ) {
        let mut registry = SessionRegistry::new(16);
        let mut router = BroadcastRouter::new();
        let mut receivers = Vec::new();
        for port in 0..count {
            let id = registry.assign(addr(9000 + port)).unwrap();
            let (tx, rx) = mpsc::channel(capacity);
            router.attach(id, tx);
            receivers.push((id, rx));
        }
        (registry, router, receivers)
    }

    fn head_pose(session: SessionId) -> Packet {
        Packet::HeadPose {
            session,
            pose: Pose::default(),
        }
    }

    #[test]
    fn test_route_policy() {
        assert_eq!(route_for(PacketKind::Echo), Route::FanOut);
        assert_eq!(route_for(PacketKind::HeadPose), Route::FanOut);
        assert_eq!(route_for(PacketKind::HandPose), Route::FanOut);
        assert_eq!(route_for(PacketKind::VoiceBuffer), Route::FanOut);
        assert_eq!(route_for(PacketKind::DynamicSceneObject), Route::FanOut);
        assert_eq!(route_for(PacketKind::SessionAssign), Route::Unicast);
        assert_eq!(route_for(PacketKind::Heartbeat), Route::Unicast);
        assert_eq!(route_for(PacketKind::SessionEnded), Route::Broadcast);
    }

    #[test]
    fn test_forward_skips_sender() {
        let (registry, router, mut receivers) = setup(3, 8);
        let sender = receivers[0].0;

        let delivery = router
            .forward(&registry, sender, &head_pose(sender))
            .unwrap();
        assert_eq!(delivery.delivered, vec![receivers[1].0, receivers[2].0]);
        assert!(delivery.is_complete());

        assert!(receivers[0].1.try_recv().is_err());
        for (_, rx) in receivers.iter_mut().skip(1) {
            let datagram = rx.try_recv().unwrap();
            assert_eq!(Packet::decode(&datagram).unwrap(), head_pose(sender));
            assert!(rx.try_recv().is_err(), "delivered more than once");
        }
    }

    #[test]
    fn test_fan_out_deduplicates_recipients() {
        let (_, router, mut receivers) = setup(2, 8);
        let target = receivers[1].0;
        let datagram: Datagram = Packet::Heartbeat.encode().unwrap().into();

        let delivery = router.fan_out(&[target, target, target], None, datagram);
        assert_eq!(delivery.delivered, vec![target]);
        assert!(receivers[1].1.try_recv().is_ok());
        assert!(receivers[1].1.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_does_not_block_others() {
        let (registry, router, mut receivers) = setup(3, 1);
        let sender = receivers[0].0;
        let slow = receivers[1].0;

        router.unicast_packet(slow, &Packet::Heartbeat).unwrap();

        let delivery = router
            .forward(&registry, sender, &head_pose(sender))
            .unwrap();
        assert_eq!(delivery.delivered, vec![receivers[2].0]);
        assert_eq!(delivery.failed, vec![(slow, DeliveryError::QueueFull)]);
        assert_eq!(delivery.recipients(), 2);
        assert!(receivers[2].1.try_recv().is_ok());
    }

    #[test]
    fn test_closed_queue_reported() {
        let (registry, router, mut receivers) = setup(2, 4);
        let sender = receivers[0].0;
        let gone = receivers.remove(1);
        drop(gone.1);

        let delivery = router
            .forward(&registry, sender, &head_pose(sender))
            .unwrap();
        assert_eq!(delivery.failed, vec![(gone.0, DeliveryError::Closed)]);
    }

    #[test]
    fn test_missing_route_reported() {
        let (mut registry, router, _receivers) = setup(1, 4);
        let orphan = registry.assign(addr(9100)).unwrap();

        assert_eq!(
            router.unicast(orphan, Packet::Heartbeat.encode().unwrap().into()),
            Err(DeliveryError::NoRoute)
        );
        let delivery = router.broadcast(&registry, &Packet::Heartbeat).unwrap();
        assert_eq!(delivery.failed, vec![(orphan, DeliveryError::NoRoute)]);
    }

    #[test]
    fn test_route_unicasts_assign_to_requester() {
        let (registry, router, mut receivers) = setup(3, 4);
        let requester = receivers[2].0;
        let packet = Packet::SessionAssign { session: requester };

        let delivery = router.route(&registry, requester, &packet).unwrap();
        assert_eq!(delivery.delivered, vec![requester]);
        assert!(receivers[0].1.try_recv().is_err());
        assert!(receivers[1].1.try_recv().is_err());
        assert!(receivers[2].1.try_recv().is_ok());
    }

    #[test]
    fn test_route_broadcasts_session_ended() {
        let (registry, router, _receivers) = setup(3, 4);
        let packet = Packet::SessionEnded {
            session: SessionId(99),
        };
        let delivery = router.route(&registry, SessionId::NONE, &packet).unwrap();
        assert_eq!(delivery.delivered.len(), 3);
    }

    #[test]
    fn test_forward_propagates_encode_errors() {
        let (registry, router, _receivers) = setup(2, 4);
        let packet = Packet::VoiceBuffer(VoiceBuffer::new(SessionId(1), [0; 4], vec![0; 200]));
        assert!(matches!(
            router.forward(&registry, SessionId(1), &packet),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_detach() {
        let (_, mut router, receivers) = setup(2, 4);
        assert!(router.detach(receivers[0].0));
        assert!(!router.detach(receivers[0].0));
        assert!(!router.has_route(receivers[0].0));
        assert_eq!(router.len(), 1);
        assert!(!router.is_empty());
    }
}
