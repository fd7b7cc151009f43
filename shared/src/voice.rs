use crate::{CodecError, SessionId, VOICE_DATA_LEN, VOICE_FRAME_COUNT, VOICE_FRAME_MAX};
use serde::{Deserialize, Serialize};

/// Up to four compressed audio frames from one participant.
///
/// `frame_sizes[i]` is the byte length of frame `i` inside `data`; unused
/// slots are zero. The payload itself is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceBuffer {
    pub session: SessionId,
    pub frame_sizes: [u8; VOICE_FRAME_COUNT],
    pub data: Vec<u8>,
}

impl VoiceBuffer {
    pub fn new(session: SessionId, frame_sizes: [u8; VOICE_FRAME_COUNT], data: Vec<u8>) -> Self {
        Self {
            session,
            frame_sizes,
            data,
        }
    }

    /// Packs codec frames back to back, recording each frame's length.
    pub fn from_frames(session: SessionId, frames: &[&[u8]]) -> Result<Self, CodecError> {
        if frames.len() > VOICE_FRAME_COUNT {
            return Err(CodecError::PayloadTooLarge {
                len: frames.iter().map(|f| f.len()).sum(),
                capacity: VOICE_DATA_LEN,
            });
        }

        let mut frame_sizes = [0u8; VOICE_FRAME_COUNT];
        let mut data = Vec::with_capacity(VOICE_DATA_LEN);
        for (slot, frame) in frame_sizes.iter_mut().zip(frames) {
            if frame.len() > VOICE_FRAME_MAX {
                return Err(CodecError::PayloadTooLarge {
                    len: frame.len(),
                    capacity: VOICE_FRAME_MAX,
                });
            }
            *slot = frame.len() as u8;
            data.extend_from_slice(frame);
        }

        Ok(Self::new(session, frame_sizes, data))
    }

    /// Splits `data` into the frames described by `frame_sizes`, stopping
    /// early if a size would run past the end of the data.
    pub fn frames(&self) -> Vec<&[u8]> {
        let mut frames = Vec::with_capacity(VOICE_FRAME_COUNT);
        let mut offset = 0;
        for &size in self.frame_sizes.iter().filter(|&&size| size > 0) {
            let end = offset + size as usize;
            if end > self.data.len() {
                break;
            }
            frames.push(&self.data[offset..end]);
            offset = end;
        }
        frames
    }
}

/// Audio codec the client hands voice through. Implementations live outside
/// this crate; the protocol only moves their output.
pub trait VoiceCodec {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Compresses one frame of PCM into `out`, returning the bytes written.
    fn encode_frame(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize, Self::Error>;

    /// Expands one compressed frame into `pcm`, returning the samples written.
    fn decode_frame(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize, Self::Error>;
}
