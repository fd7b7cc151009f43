use serde::{Deserialize, Serialize};
use std::fmt;

pub mod codec;
pub mod error;
pub mod voice;

pub use codec::{check_bounded_str, read_bounded_str, write_bounded_str};
pub use error::CodecError;
pub use voice::{VoiceBuffer, VoiceCodec};

/// First message id available to applications on the datagram library.
pub const USER_PACKET_BASE: u8 = 134;
pub const BOUNDED_STR_LEN: usize = 256;
pub const VOICE_FRAME_COUNT: usize = 4;
pub const VOICE_FRAME_MAX: usize = 38;
pub const VOICE_DATA_LEN: usize = VOICE_FRAME_COUNT * VOICE_FRAME_MAX;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const MAX_DATAGRAM_LEN: usize = 2048;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Unassigned session / unowned object.
    pub const NONE: SessionId = SessionId(0);

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3::new(0.0, 0.0, 0.0);
    pub const ONE: Vector3 = Vector3::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl From<[f32; 3]> for Vector3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Vector3> for [f32; 3] {
    fn from(v: Vector3) -> Self {
        [v.x, v.y, v.z]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians around the vertical axis.
    pub fn from_yaw(angle: f32) -> Self {
        let half = angle * 0.5;
        Self::new(0.0, half.sin(), 0.0, half.cos())
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<[f32; 4]> for Quaternion {
    fn from([x, y, z, w]: [f32; 4]) -> Self {
        Self { x, y, z, w }
    }
}

impl From<Quaternion> for [f32; 4] {
    fn from(q: Quaternion) -> Self {
        [q.x, q.y, q.z, q.w]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3,
    pub orientation: Quaternion,
}

impl Pose {
    pub fn new(position: Vector3, orientation: Quaternion) -> Self {
        Self {
            position,
            orientation,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HandPoses {
    pub left: Pose,
    pub right: Pose,
}

/// Shared dynamic object as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub id: String,
    pub owner: SessionId,
    pub position: Vector3,
    pub scale: Vector3,
    pub orientation: Quaternion,
}

impl SceneObject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: SessionId::NONE,
            position: Vector3::ZERO,
            scale: Vector3::ONE,
            orientation: Quaternion::IDENTITY,
        }
    }

    pub fn with_owner(mut self, owner: SessionId) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_transform(
        mut self,
        position: Vector3,
        scale: Vector3,
        orientation: Quaternion,
    ) -> Self {
        self.position = position;
        self.scale = scale;
        self.orientation = orientation;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Echo {
        text: String,
    },
    HeadPose {
        session: SessionId,
        pose: Pose,
    },
    HandPose {
        session: SessionId,
        hands: Option<HandPoses>,
    },
    VoiceBuffer(VoiceBuffer),
    SessionAssign {
        session: SessionId,
    },
    SessionEnded {
        session: SessionId,
    },
    DynamicSceneObject(SceneObject),
    Heartbeat,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Echo { .. } => PacketKind::Echo,
            Packet::HeadPose { .. } => PacketKind::HeadPose,
            Packet::HandPose { .. } => PacketKind::HandPose,
            Packet::VoiceBuffer(_) => PacketKind::VoiceBuffer,
            Packet::SessionAssign { .. } => PacketKind::SessionAssign,
            Packet::SessionEnded { .. } => PacketKind::SessionEnded,
            Packet::DynamicSceneObject(_) => PacketKind::DynamicSceneObject,
            Packet::Heartbeat => PacketKind::Heartbeat,
        }
    }

    /// Session id carried in the payload, if the packet has one.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Packet::HeadPose { session, .. }
            | Packet::HandPose { session, .. }
            | Packet::SessionAssign { session }
            | Packet::SessionEnded { session } => Some(*session),
            Packet::VoiceBuffer(voice) => Some(voice.session),
            Packet::Echo { .. } | Packet::DynamicSceneObject(_) | Packet::Heartbeat => None,
        }
    }
}

/// Leading tag byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Echo = USER_PACKET_BASE + 1,
    HeadPose = USER_PACKET_BASE + 2,
    HandPose = USER_PACKET_BASE + 3,
    VoiceBuffer = USER_PACKET_BASE + 4,
    SessionAssign = USER_PACKET_BASE + 5,
    SessionEnded = USER_PACKET_BASE + 6,
    DynamicSceneObject = USER_PACKET_BASE + 7,
    Heartbeat = USER_PACKET_BASE + 10,
}

impl PacketKind {
    pub const ALL: [PacketKind; 8] = [
        PacketKind::Echo,
        PacketKind::HeadPose,
        PacketKind::HandPose,
        PacketKind::VoiceBuffer,
        PacketKind::SessionAssign,
        PacketKind::SessionEnded,
        PacketKind::DynamicSceneObject,
        PacketKind::Heartbeat,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Size of the payload following the tag byte.
    pub fn payload_len(self) -> usize {
        const ID: usize = 8;
        const VEC3: usize = 12;
        const QUAT: usize = 16;
        match self {
            PacketKind::Echo => BOUNDED_STR_LEN,
            PacketKind::HeadPose => ID + VEC3 + QUAT,
            PacketKind::HandPose => ID + 1 + 2 * VEC3 + 2 * QUAT,
            PacketKind::VoiceBuffer => ID + VOICE_FRAME_COUNT + 1 + VOICE_DATA_LEN,
            PacketKind::SessionAssign | PacketKind::SessionEnded => ID,
            PacketKind::DynamicSceneObject => BOUNDED_STR_LEN + ID + 2 * VEC3 + QUAT,
            PacketKind::Heartbeat => 0,
        }
    }

    /// Whether the relay forwards this kind from one participant to the others.
    pub fn is_fan_out(self) -> bool {
        matches!(
            self,
            PacketKind::Echo
                | PacketKind::HeadPose
                | PacketKind::HandPose
                | PacketKind::VoiceBuffer
                | PacketKind::DynamicSceneObject
        )
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Echo => "echo",
            PacketKind::HeadPose => "head-pose",
            PacketKind::HandPose => "hand-pose",
            PacketKind::VoiceBuffer => "voice-buffer",
            PacketKind::SessionAssign => "session-assign",
            PacketKind::SessionEnded => "session-ended",
            PacketKind::DynamicSceneObject => "dynamic-scene-object",
            PacketKind::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}
