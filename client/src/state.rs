//! Client-side view of the shared session
//!
//! Plain data only: whatever renders the scene reads this, the network layer
//! writes it. It serializes to JSON so it can be handed to an engine that
//! lives on the other side of a language boundary.

use log::debug;
use serde::Serialize;
use shared::{HandPoses, Packet, Pose, SceneObject, SessionId};
use std::collections::{BTreeMap, VecDeque};

/// Voice frames kept per remote participant before the oldest are dropped
pub const VOICE_QUEUE_LEN: usize = 64;

/// Echo lines kept before the oldest are dropped
pub const ECHO_LOG_LEN: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteParticipant {
    pub session: SessionId,
    pub head: Option<Pose>,
    pub hands: Option<HandPoses>,
    /// Compressed frames waiting to be decoded and played
    pub voice: VecDeque<Vec<u8>>,
    pub voice_frames_dropped: u64,
}

impl RemoteParticipant {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            ..Self::default()
        }
    }

    fn push_voice(&mut self, frame: &[u8]) {
        if self.voice.len() == VOICE_QUEUE_LEN {
            self.voice.pop_front();
            self.voice_frames_dropped += 1;
        }
        self.voice.push_back(frame.to_vec());
    }
}

/// What applying one server packet changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Assigned(SessionId),
    ParticipantUpdated(SessionId),
    ParticipantLeft(SessionId),
    /// The server ended our own session
    Ended,
    ObjectUpdated(String),
    Echo,
    HeartbeatRequested,
    Ignored,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParticipantView {
    /// Our own session; `SessionId::NONE` until assigned
    pub session: SessionId,
    pub participants: BTreeMap<SessionId, RemoteParticipant>,
    pub objects: BTreeMap<String, SceneObject>,
    pub echoes: VecDeque<String>,
    pub heartbeats_received: u64,
}

impl ParticipantView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_assigned()
    }

    pub fn participant(&self, session: SessionId) -> Option<&RemoteParticipant> {
        self.participants.get(&session)
    }

    /// Owner of a shared object as last reported by the server
    pub fn owner_of(&self, object_id: &str) -> SessionId {
        self.objects
            .get(object_id)
            .map_or(SessionId::NONE, |object| object.owner)
    }

    /// Drains queued voice frames for `session`
    pub fn take_voice(&mut self, session: SessionId) -> Vec<Vec<u8>> {
        self.participants
            .get_mut(&session)
            .map(|participant| participant.voice.drain(..).collect())
            .unwrap_or_default()
    }

    fn remote(&mut self, session: SessionId) -> Option<&mut RemoteParticipant> {
        if !session.is_assigned() || session == self.session {
            return None;
        }
        Some(
            self.participants
                .entry(session)
                .or_insert_with(|| RemoteParticipant::new(session)),
        )
    }

    /// Folds one packet from the server into the view
    pub fn apply(&mut self, packet: &Packet) -> ViewChange {
        match packet {
            Packet::SessionAssign { session } => {
                self.session = *session;
                ViewChange::Assigned(*session)
            }
            Packet::HeadPose { session, pose } => match self.remote(*session) {
                Some(participant) => {
                    participant.head = Some(*pose);
                    ViewChange::ParticipantUpdated(*session)
                }
                None => ViewChange::Ignored,
            },
            Packet::HandPose { session, hands } => match self.remote(*session) {
                Some(participant) => {
                    participant.hands = *hands;
                    ViewChange::ParticipantUpdated(*session)
                }
                None => ViewChange::Ignored,
            },
            Packet::VoiceBuffer(voice) => match self.remote(voice.session) {
                Some(participant) => {
                    for frame in voice.frames() {
                        participant.push_voice(frame);
                    }
                    ViewChange::ParticipantUpdated(voice.session)
                }
                None => ViewChange::Ignored,
            },
            Packet::SessionEnded { session } if *session == self.session => {
                debug!("Server ended our session {}", session);
                self.session = SessionId::NONE;
                ViewChange::Ended
            }
            Packet::SessionEnded { session } => {
                self.participants.remove(session);
                ViewChange::ParticipantLeft(*session)
            }
            Packet::DynamicSceneObject(object) => {
                self.objects.insert(object.id.clone(), object.clone());
                ViewChange::ObjectUpdated(object.id.clone())
            }
            Packet::Echo { text } => {
                if self.echoes.len() == ECHO_LOG_LEN {
                    self.echoes.pop_front();
                }
                self.echoes.push_back(text.clone());
                ViewChange::Echo
            }
            Packet::Heartbeat => {
                self.heartbeats_received += 1;
                ViewChange::HeartbeatRequested
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
