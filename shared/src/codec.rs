//! Field-by-field binary codec for [`Packet`].
//!
//! Layout: `[tag: u8][payload]`, payload size fixed per tag, no padding,
//! every multi-byte field little-endian. Bounded strings are 256-byte,
//! NUL-terminated, zero-filled fields.

use crate::{
    CodecError, HandPoses, Packet, PacketKind, Pose, Quaternion, SceneObject, SessionId, Vector3,
    VoiceBuffer, BOUNDED_STR_LEN, VOICE_DATA_LEN, VOICE_FRAME_COUNT,
};

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let kind = self.kind();
        let mut out = Vec::with_capacity(1 + kind.payload_len());
        out.push(kind.tag());

        match self {
            Packet::Echo { text } => write_bounded_str(&mut out, text)?,
            Packet::HeadPose { session, pose } => {
                put_session(&mut out, *session);
                put_pose(&mut out, pose);
            }
            Packet::HandPose { session, hands } => {
                put_session(&mut out, *session);
                out.push(u8::from(hands.is_some()));
                let hands = hands.unwrap_or_default();
                put_vec3(&mut out, &hands.left.position);
                put_vec3(&mut out, &hands.right.position);
                put_quat(&mut out, &hands.left.orientation);
                put_quat(&mut out, &hands.right.orientation);
            }
            Packet::VoiceBuffer(voice) => {
                let len = voice.data.len();
                if len > VOICE_DATA_LEN {
                    return Err(CodecError::PayloadTooLarge {
                        len,
                        capacity: VOICE_DATA_LEN,
                    });
                }
                put_session(&mut out, voice.session);
                out.extend_from_slice(&voice.frame_sizes);
                out.push(len as u8);
                out.extend_from_slice(&voice.data);
                out.resize(out.len() + VOICE_DATA_LEN - len, 0);
            }
            Packet::SessionAssign { session } | Packet::SessionEnded { session } => {
                put_session(&mut out, *session)
            }
            Packet::DynamicSceneObject(object) => {
                write_bounded_str(&mut out, &object.id)?;
                put_session(&mut out, object.owner);
                put_vec3(&mut out, &object.position);
                put_vec3(&mut out, &object.scale);
                put_quat(&mut out, &object.orientation);
            }
            Packet::Heartbeat => {}
        }

        debug_assert_eq!(out.len(), 1 + kind.payload_len());
        Ok(out)
    }

    /// Decodes one datagram. Bytes past the tag's fixed payload are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
        let (&tag, payload) = bytes.split_first().ok_or(CodecError::Truncated {
            tag: 0,
            expected: 1,
            actual: 0,
        })?;
        let kind = PacketKind::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

        let expected = kind.payload_len();
        if payload.len() < expected {
            return Err(CodecError::Truncated {
                tag,
                expected,
                actual: payload.len(),
            });
        }

        let mut inp = &payload[..expected];
        let packet = match kind {
            PacketKind::Echo => Packet::Echo {
                text: read_bounded_str(take::<BOUNDED_STR_LEN>(&mut inp))?,
            },
            PacketKind::HeadPose => Packet::HeadPose {
                session: get_session(&mut inp),
                pose: get_pose(&mut inp),
            },
            PacketKind::HandPose => {
                let session = get_session(&mut inp);
                let has_hands = take::<1>(&mut inp)[0] != 0;
                let left_position = get_vec3(&mut inp);
                let right_position = get_vec3(&mut inp);
                let left_orientation = get_quat(&mut inp);
                let right_orientation = get_quat(&mut inp);
                let hands = has_hands.then(|| HandPoses {
                    left: Pose::new(left_position, left_orientation),
                    right: Pose::new(right_position, right_orientation),
                });
                Packet::HandPose { session, hands }
            }
            PacketKind::VoiceBuffer => {
                let session = get_session(&mut inp);
                let frame_sizes = take::<VOICE_FRAME_COUNT>(&mut inp);
                let len = take::<1>(&mut inp)[0] as usize;
                if len > VOICE_DATA_LEN {
                    return Err(CodecError::PayloadTooLarge {
                        len,
                        capacity: VOICE_DATA_LEN,
                    });
                }
                let data = take::<VOICE_DATA_LEN>(&mut inp)[..len].to_vec();
                Packet::VoiceBuffer(VoiceBuffer::new(session, frame_sizes, data))
            }
            PacketKind::SessionAssign => Packet::SessionAssign {
                session: get_session(&mut inp),
            },
            PacketKind::SessionEnded => Packet::SessionEnded {
                session: get_session(&mut inp),
            },
            PacketKind::DynamicSceneObject => {
                let id = read_bounded_str(take::<BOUNDED_STR_LEN>(&mut inp))?;
                Packet::DynamicSceneObject(SceneObject {
                    id,
                    owner: get_session(&mut inp),
                    position: get_vec3(&mut inp),
                    scale: get_vec3(&mut inp),
                    orientation: get_quat(&mut inp),
                })
            }
            PacketKind::Heartbeat => Packet::Heartbeat,
        };

        Ok(packet)
    }
}

/// Checks that `value` fits a bounded-string field and reads back unchanged.
///
/// The string must leave room for its terminator and must not contain NUL
/// itself.
pub fn check_bounded_str(value: &str) -> Result<(), CodecError> {
    let bytes = value.as_bytes();
    if bytes.len() >= BOUNDED_STR_LEN {
        return Err(CodecError::StringTooLong {
            len: bytes.len(),
            capacity: BOUNDED_STR_LEN,
        });
    }
    match bytes.iter().position(|&b| b == 0) {
        Some(position) => Err(CodecError::EmbeddedNul { position }),
        None => Ok(()),
    }
}

/// Writes `value` as a full bounded-string field. Fails instead of truncating.
pub fn write_bounded_str(out: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    check_bounded_str(value)?;
    let bytes = value.as_bytes();
    out.extend_from_slice(bytes);
    out.resize(out.len() + BOUNDED_STR_LEN - bytes.len(), 0);
    Ok(())
}

/// Reads a bounded-string field up to its first NUL. A field without one is
/// cut at its last byte, which the protocol reserves for the terminator.
///
/// Content that is not UTF-8 is refused rather than replaced, so every string
/// this returns can be written back into the same field.
pub fn read_bounded_str(field: [u8; BOUNDED_STR_LEN]) -> Result<String, CodecError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(BOUNDED_STR_LEN - 1);
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|e| CodecError::InvalidUtf8 {
            position: e.valid_up_to(),
        })
}

// Callers check the payload length up front, so reads never run short.
fn take<const N: usize>(inp: &mut &[u8]) -> [u8; N] {
    let (head, rest) = inp.split_at(N);
    *inp = rest;
    let mut buf = [0u8; N];
    buf.copy_from_slice(head);
    buf
}

fn put_session(out: &mut Vec<u8>, session: SessionId) {
    out.extend_from_slice(&session.0.to_le_bytes());
}

fn get_session(inp: &mut &[u8]) -> SessionId {
    SessionId(u64::from_le_bytes(take::<8>(inp)))
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn get_f32(inp: &mut &[u8]) -> f32 {
    f32::from_le_bytes(take::<4>(inp))
}

fn put_vec3(out: &mut Vec<u8>, v: &Vector3) {
    put_f32(out, v.x);
    put_f32(out, v.y);
    put_f32(out, v.z);
}

fn get_vec3(inp: &mut &[u8]) -> Vector3 {
    Vector3::new(get_f32(inp), get_f32(inp), get_f32(inp))
}

fn put_quat(out: &mut Vec<u8>, q: &Quaternion) {
    put_f32(out, q.x);
    put_f32(out, q.y);
    put_f32(out, q.z);
    put_f32(out, q.w);
}

fn get_quat(inp: &mut &[u8]) -> Quaternion {
    Quaternion::new(get_f32(inp), get_f32(inp), get_f32(inp), get_f32(inp))
}

fn put_pose(out: &mut Vec<u8>, pose: &Pose) {
    put_vec3(out, &pose.position);
    put_quat(out, &pose.orientation);
}

fn get_pose(inp: &mut &[u8]) -> Pose {
    Pose::new(get_vec3(inp), get_quat(inp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sample_pose() -> Pose {
        Pose::new(
            Vector3::new(0.25, 1.7, -3.5),
            Quaternion::new(0.0, 0.7071, 0.0, 0.7071),
        )
    }

    #[test]
    fn test_echo_roundtrip() {
        let packet = Packet::Echo {
            text: "hello".to_string(),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), 1 + 256);
        assert_eq!(bytes[0], PacketKind::Echo.tag());
        assert_eq!(&bytes[1..6], b"hello");
        assert!(bytes[6..].iter().all(|&b| b == 0));

        match Packet::decode(&bytes).unwrap() {
            Packet::Echo { text } => assert_eq!(text, "hello"),
            other => panic!("Wrong packet type after decode: {:?}", other),
        }
    }

    #[test]
    fn test_head_pose_layout() {
        let packet = Packet::HeadPose {
            session: SessionId(0x0102),
            pose: sample_pose(),
        };
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes.len(), 37);
        assert_eq!(&bytes[1..9], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[9..13], &0.25f32.to_le_bytes());
        assert_eq!(&bytes[33..37], &0.7071f32.to_le_bytes());
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_hand_pose_with_and_without_hands() {
        let hands = HandPoses {
            left: Pose::new(Vector3::new(-0.3, 1.1, 0.2), Quaternion::IDENTITY),
            right: Pose::new(Vector3::new(0.3, 1.2, 0.25), Quaternion::from_yaw(0.5)),
        };
        let with_hands = Packet::HandPose {
            session: SessionId(3),
            hands: Some(hands),
        };
        let bytes = with_hands.encode().unwrap();
        assert_eq!(bytes.len(), 66);
        assert_eq!(bytes[9], 1);

        match Packet::decode(&bytes).unwrap() {
            Packet::HandPose {
                session,
                hands: Some(decoded),
            } => {
                assert_eq!(session, SessionId(3));
                assert_approx_eq!(decoded.right.position.z, 0.25);
                assert_approx_eq!(decoded.right.orientation.y, hands.right.orientation.y);
            }
            other => panic!("Wrong packet after decode: {:?}", other),
        }

        let without = Packet::HandPose {
            session: SessionId(3),
            hands: None,
        };
        let bytes = without.encode().unwrap();
        assert_eq!(bytes.len(), 66);
        assert_eq!(bytes[9], 0);
        assert!(bytes[10..].iter().all(|&b| b == 0));
        assert_eq!(Packet::decode(&bytes).unwrap(), without);
    }

    #[test]
    fn test_hand_pose_ignores_pose_bytes_when_absent() {
        let mut bytes = Packet::HandPose {
            session: SessionId(1),
            hands: None,
        }
        .encode()
        .unwrap();
        bytes[20] = 0xAB;

        match Packet::decode(&bytes).unwrap() {
            Packet::HandPose { hands, .. } => assert!(hands.is_none()),
            other => panic!("Wrong packet after decode: {:?}", other),
        }
    }

    #[test]
    fn test_voice_buffer_roundtrip() {
        let voice = VoiceBuffer::new(SessionId(9), [38, 38, 10, 0], vec![7u8; 86]);
        let packet = Packet::VoiceBuffer(voice.clone());
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes.len(), 166);
        assert_eq!(&bytes[9..13], &[38, 38, 10, 0]);
        assert_eq!(bytes[13], 86);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_voice_buffer_too_large() {
        let voice = VoiceBuffer::new(SessionId(9), [0; 4], vec![0u8; 200]);
        let result = Packet::VoiceBuffer(voice).encode();
        assert_eq!(
            result,
            Err(CodecError::PayloadTooLarge {
                len: 200,
                capacity: 152
            })
        );
    }

    #[test]
    fn test_voice_buffer_decode_rejects_oversized_length() {
        let mut bytes = Packet::VoiceBuffer(VoiceBuffer::new(SessionId(1), [0; 4], vec![]))
            .encode()
            .unwrap();
        bytes[13] = 153;

        assert!(matches!(
            Packet::decode(&bytes),
            Err(CodecError::PayloadTooLarge { len: 153, .. })
        ));
    }

    #[test]
    fn test_session_packets_roundtrip() {
        for packet in [
            Packet::SessionAssign {
                session: SessionId::NONE,
            },
            Packet::SessionAssign {
                session: SessionId(u64::MAX),
            },
            Packet::SessionEnded {
                session: SessionId(12),
            },
            Packet::Heartbeat,
        ] {
            let bytes = packet.encode().unwrap();
            assert_eq!(bytes.len(), 1 + packet.kind().payload_len());
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_scene_object_roundtrip() {
        let object = SceneObject::new("chair1")
            .with_owner(SessionId(7))
            .with_transform(
                Vector3::new(1.0, 0.0, -2.0),
                Vector3::new(0.5, 0.5, 0.5),
                Quaternion::from_yaw(1.0),
            );
        let packet = Packet::DynamicSceneObject(object);
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes.len(), 305);
        assert_eq!(&bytes[1..7], b"chair1");
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_string_capacity_limits() {
        let packet = Packet::Echo {
            text: "a".repeat(255),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[256], 0);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);

        for len in [256, 300] {
            let result = Packet::Echo {
                text: "a".repeat(len),
            }
            .encode();
            assert_eq!(
                result,
                Err(CodecError::StringTooLong { len, capacity: 256 })
            );
        }

        let result = Packet::DynamicSceneObject(SceneObject::new("x".repeat(256))).encode();
        assert!(matches!(result, Err(CodecError::StringTooLong { .. })));
    }

    #[test]
    fn test_string_with_nul_rejected() {
        let result = Packet::Echo {
            text: "ab\0cd".to_string(),
        }
        .encode();
        assert_eq!(result, Err(CodecError::EmbeddedNul { position: 2 }));
    }

    #[test]
    fn test_read_bounded_str_stops_at_first_nul() {
        let mut field = [0u8; BOUNDED_STR_LEN];
        field[..3].copy_from_slice(b"abc");
        field[4..7].copy_from_slice(b"xyz");
        assert_eq!(read_bounded_str(field).unwrap(), "abc");
    }

    #[test]
    fn test_read_bounded_str_forces_terminator_when_full() {
        let field = [b'z'; BOUNDED_STR_LEN];
        let text = read_bounded_str(field).unwrap();
        assert_eq!(text.len(), 255);
    }

    #[test]
    fn test_non_ascii_strings_roundtrip() {
        // 127 two-byte characters: 254 bytes, the longest even fit
        let id = "é".repeat(127);
        let packet = Packet::DynamicSceneObject(SceneObject::new(id.clone()));
        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);

        let packet = Packet::Echo {
            text: "grüße 👋".to_string(),
        };
        assert_eq!(Packet::decode(&packet.encode().unwrap()).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let mut bytes = Packet::DynamicSceneObject(SceneObject::new("chair"))
            .encode()
            .unwrap();
        bytes[1..101].fill(0xFF);
        assert_eq!(
            Packet::decode(&bytes),
            Err(CodecError::InvalidUtf8 { position: 0 })
        );

        let mut bytes = Packet::Echo {
            text: "ok".to_string(),
        }
        .encode()
        .unwrap();
        bytes[3] = 0xC3;
        assert_eq!(
            Packet::decode(&bytes),
            Err(CodecError::InvalidUtf8 { position: 2 })
        );
    }

    #[test]
    fn test_decoded_strings_can_be_encoded_again() {
        let mut field = [0u8; BOUNDED_STR_LEN];
        for (i, byte) in field.iter_mut().enumerate() {
            *byte = b'a' + (i % 26) as u8;
        }
        let text = read_bounded_str(field).unwrap();
        assert_eq!(check_bounded_str(&text), Ok(()));

        let mut out = Vec::new();
        write_bounded_str(&mut out, &text).unwrap();
        assert_eq!(out.len(), BOUNDED_STR_LEN);
        assert_eq!(read_bounded_str(out.try_into().unwrap()).unwrap(), text);
    }

    #[test]
    fn test_check_bounded_str() {
        assert_eq!(check_bounded_str(""), Ok(()));
        assert_eq!(check_bounded_str(&"a".repeat(255)), Ok(()));
        assert_eq!(
            check_bounded_str(&"é".repeat(128)),
            Err(CodecError::StringTooLong {
                len: 256,
                capacity: 256
            })
        );
        assert_eq!(
            check_bounded_str("a\0b"),
            Err(CodecError::EmbeddedNul { position: 1 })
        );
    }

    #[test]
    fn test_decode_unknown_tag() {
        for tag in [0u8, 1, 134, 142, 143, 145, 255] {
            assert_eq!(Packet::decode(&[tag, 0, 0]), Err(CodecError::UnknownTag(tag)));
        }
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            Packet::decode(&[]),
            Err(CodecError::Truncated { actual: 0, .. })
        ));

        for kind in PacketKind::ALL {
            let needed = kind.payload_len();
            if needed == 0 {
                continue;
            }
            let mut bytes = vec![kind.tag()];
            bytes.resize(needed, 0);
            assert_eq!(
                Packet::decode(&bytes),
                Err(CodecError::Truncated {
                    tag: kind.tag(),
                    expected: needed,
                    actual: needed - 1,
                })
            );
        }
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = Packet::SessionEnded {
            session: SessionId(5),
        }
        .encode()
        .unwrap();
        bytes.extend_from_slice(&[0xFF; 16]);

        assert_eq!(
            Packet::decode(&bytes).unwrap(),
            Packet::SessionEnded {
                session: SessionId(5)
            }
        );
    }

    #[test]
    fn test_decode_echo_ignores_content_after_terminator() {
        let mut bytes = Packet::Echo {
            text: "hi".to_string(),
        }
        .encode()
        .unwrap();
        bytes[10] = b'!';

        match Packet::decode(&bytes).unwrap() {
            Packet::Echo { text } => assert_eq!(text, "hi"),
            other => panic!("Wrong packet after decode: {:?}", other),
        }
    }
}
