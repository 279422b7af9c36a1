//! Framed binary wire protocol shared by host and client.
//!
//! Every message starts with a one-byte type tag. Integers on the video
//! channel are big-endian; the touch payload floats and action int32 are
//! little-endian (a fixed cross-platform contract); ping/pong timestamps are
//! eight opaque bytes echoed verbatim.
//!
//! ```text
//! 0x00 VIDEO_FRAME     host→client   size:BE u32, size bytes HEVC Annex-B
//! 0x01 DISPLAY_CONFIG  host→client   width:BE i32, height:BE i32, rotation:BE i32
//! 0x02 TOUCH_EVENT     client→host   count:u8, x₁:LE f32, y₁:LE f32,
//!                                    [x₂:LE f32, y₂:LE f32], action:LE i32
//! 0x04 PING            client→host   timestamp: 8 opaque bytes
//! 0x05 PONG            host→client   echo of PING payload
//! ```
//!
//! There is no length-prefixed envelope around messages, so a reader that
//! hits an unknown tag, a bad pointer count, or an oversized frame cannot
//! resynchronize — all of [`WireError`] is fatal for the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::WireError;
use crate::types::{DisplayConfig, Rotation, TouchPhase, TouchSample};

// ── Tags and limits ───────────────────────────────────────────────────────────

pub const TAG_VIDEO_FRAME: u8 = 0x00;
pub const TAG_DISPLAY_CONFIG: u8 = 0x01;
pub const TAG_TOUCH_EVENT: u8 = 0x02;
pub const TAG_PING: u8 = 0x04;
pub const TAG_PONG: u8 = 0x05;

/// A video frame above this size is fatal on either side.
pub const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

// ── Message ───────────────────────────────────────────────────────────────────

/// One wire message, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    VideoFrame(Bytes),
    DisplayConfig(DisplayConfig),
    Touch(TouchSample),
    Ping([u8; 8]),
    Pong([u8; 8]),
}

impl Message {
    /// Append the exact wire bytes of this message to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::VideoFrame(data) => {
                buf.reserve(5 + data.len());
                buf.put_u8(TAG_VIDEO_FRAME);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Message::DisplayConfig(config) => {
                buf.reserve(13);
                buf.put_u8(TAG_DISPLAY_CONFIG);
                buf.put_i32(config.width as i32);
                buf.put_i32(config.height as i32);
                buf.put_i32(config.rotation.degrees());
            }
            Message::Touch(sample) => {
                buf.reserve(22);
                buf.put_u8(TAG_TOUCH_EVENT);
                buf.put_u8(sample.pointer_count());
                buf.put_f32_le(sample.x);
                buf.put_f32_le(sample.y);
                if let Some((x2, y2)) = sample.second {
                    buf.put_f32_le(x2);
                    buf.put_f32_le(y2);
                }
                buf.put_i32_le(sample.phase as i32);
            }
            Message::Ping(timestamp) => {
                buf.reserve(9);
                buf.put_u8(TAG_PING);
                buf.put_slice(timestamp);
            }
            Message::Pong(timestamp) => {
                buf.reserve(9);
                buf.put_u8(TAG_PONG);
                buf.put_slice(timestamp);
            }
        }
    }

    /// Wire bytes of this message as an owned buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Consume one whole message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete message (read
/// more and retry; nothing was consumed). Returns `Err` on any violation,
/// after which the buffer contents are unusable.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }

    match buf[0] {
        TAG_VIDEO_FRAME => {
            if buf.len() < 5 {
                return Ok(None);
            }
            let size = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if size > MAX_FRAME_BYTES {
                return Err(WireError::FrameTooLarge(size));
            }
            if buf.len() < 5 + size {
                return Ok(None);
            }
            buf.advance(5);
            let data = buf.split_to(size).freeze();
            Ok(Some(Message::VideoFrame(data)))
        }

        TAG_DISPLAY_CONFIG => {
            if buf.len() < 13 {
                return Ok(None);
            }
            buf.advance(1);
            let width = buf.get_i32();
            let height = buf.get_i32();
            let degrees = buf.get_i32();
            if width < 0 || height < 0 {
                return Err(WireError::BadDisplayConfig(format!(
                    "negative dimensions {width}×{height}"
                )));
            }
            let rotation = Rotation::from_degrees(degrees)
                .ok_or_else(|| WireError::BadDisplayConfig(format!("rotation {degrees}")))?;
            Ok(Some(Message::DisplayConfig(DisplayConfig::new(
                width as u32,
                height as u32,
                rotation,
            ))))
        }

        TAG_TOUCH_EVENT => {
            if buf.len() < 2 {
                return Ok(None);
            }
            let count = buf[1];
            if count != 1 && count != 2 {
                return Err(WireError::BadPointerCount(count));
            }
            let total = 2 + 8 * count as usize + 4;
            if buf.len() < total {
                return Ok(None);
            }
            buf.advance(2);
            let x = buf.get_f32_le();
            let y = buf.get_f32_le();
            let second = if count == 2 {
                let x2 = buf.get_f32_le();
                let y2 = buf.get_f32_le();
                Some((x2, y2))
            } else {
                None
            };
            let action = buf.get_i32_le();
            let phase = TouchPhase::from_i32(action).ok_or(WireError::BadTouchAction(action))?;
            Ok(Some(Message::Touch(TouchSample { x, y, second, phase })))
        }

        TAG_PING | TAG_PONG => {
            if buf.len() < 9 {
                return Ok(None);
            }
            let tag = buf[0];
            buf.advance(1);
            let mut timestamp = [0u8; 8];
            buf.copy_to_slice(&mut timestamp);
            Ok(Some(if tag == TAG_PING {
                Message::Ping(timestamp)
            } else {
                Message::Pong(timestamp)
            }))
        }

        tag => Err(WireError::UnknownTag(tag)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let mut buf = BytesMut::from(&message.encode()[..]);
        let decoded = decode(&mut buf).expect("decodes").expect("complete");
        assert_eq!(decoded, message);
        assert!(buf.is_empty(), "decode must consume the whole message");
    }

    #[test]
    fn roundtrip_all_variants() {
        roundtrip(Message::VideoFrame(Bytes::from_static(&[0, 0, 0, 1, 0x40])));
        roundtrip(Message::DisplayConfig(DisplayConfig::new(1920, 1200, Rotation::Deg90)));
        roundtrip(Message::Touch(TouchSample::single(0.25, 0.75, TouchPhase::Move)));
        roundtrip(Message::Touch(TouchSample::dual(0.1, 0.2, 0.9, 0.8, TouchPhase::Down)));
        roundtrip(Message::Ping(*b"\x00\x01\x02\x03\x04\x05\x06\x07"));
        roundtrip(Message::Pong([0xff; 8]));
    }

    #[test]
    fn display_config_is_13_big_endian_bytes() {
        let bytes = Message::DisplayConfig(DisplayConfig::new(1920, 1200, Rotation::Deg270)).encode();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..5], &1920i32.to_be_bytes());
        assert_eq!(&bytes[5..9], &1200i32.to_be_bytes());
        assert_eq!(&bytes[9..13], &270i32.to_be_bytes());
    }

    #[test]
    fn video_frame_is_size_prefixed_big_endian() {
        let payload = Bytes::from(vec![0xabu8; 300]);
        let bytes = Message::VideoFrame(payload.clone()).encode();
        assert_eq!(bytes.len(), 5 + 300);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..5], &300u32.to_be_bytes());
        assert_eq!(&bytes[5..], &payload[..]);
    }

    #[test]
    fn touch_sizes_and_endianness() {
        let one = Message::Touch(TouchSample::single(0.5, 0.25, TouchPhase::Up)).encode();
        assert_eq!(one.len(), 14);
        assert_eq!(one[0], 0x02);
        assert_eq!(one[1], 1);
        assert_eq!(&one[2..6], &0.5f32.to_le_bytes());
        assert_eq!(&one[6..10], &0.25f32.to_le_bytes());
        assert_eq!(&one[10..14], &2i32.to_le_bytes());

        let two = Message::Touch(TouchSample::dual(0.1, 0.2, 0.3, 0.4, TouchPhase::Down)).encode();
        assert_eq!(two.len(), 22);
        assert_eq!(two[1], 2);
        assert_eq!(&two[18..22], &0i32.to_le_bytes());
    }

    #[test]
    fn pong_echoes_ping_payload() {
        let timestamp = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let ping = Message::Ping(timestamp).encode();
        assert_eq!(ping.len(), 9);
        let pong = Message::Pong(timestamp).encode();
        assert_eq!(&ping[1..], &pong[1..]);
    }

    #[test]
    fn partial_input_needs_more() {
        let full = Message::DisplayConfig(DisplayConfig::new(800, 600, Rotation::Deg0)).encode();
        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(decode(&mut buf).unwrap(), None, "cut at {cut}");
            assert_eq!(buf.len(), cut, "partial decode must not consume");
        }
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut buf = BytesMut::new();
        Message::DisplayConfig(DisplayConfig::new(1920, 1080, Rotation::Deg0)).encode_into(&mut buf);
        Message::VideoFrame(Bytes::from_static(b"frame")).encode_into(&mut buf);
        Message::Ping([7; 8]).encode_into(&mut buf);

        assert!(matches!(decode(&mut buf).unwrap(), Some(Message::DisplayConfig(_))));
        assert!(matches!(decode(&mut buf).unwrap(), Some(Message::VideoFrame(_))));
        assert!(matches!(decode(&mut buf).unwrap(), Some(Message::Ping(_))));
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn frame_at_limit_accepted_over_limit_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_VIDEO_FRAME);
        buf.put_u32(MAX_FRAME_BYTES as u32);
        buf.put_slice(&vec![0u8; MAX_FRAME_BYTES]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::VideoFrame(data) if data.len() == MAX_FRAME_BYTES));

        let mut buf = BytesMut::new();
        buf.put_u8(TAG_VIDEO_FRAME);
        buf.put_u32(MAX_FRAME_BYTES as u32 + 1);
        assert_eq!(
            decode(&mut buf),
            Err(WireError::FrameTooLarge(MAX_FRAME_BYTES + 1))
        );
    }

    #[test]
    fn bad_pointer_counts_are_fatal() {
        for count in [0u8, 3, 255] {
            let mut buf = BytesMut::new();
            buf.put_u8(TAG_TOUCH_EVENT);
            buf.put_u8(count);
            assert_eq!(decode(&mut buf), Err(WireError::BadPointerCount(count)));
        }
    }

    #[test]
    fn unknown_tag_is_fatal() {
        for tag in [0x03u8, 0x06, 0x7f, 0xff] {
            let mut buf = BytesMut::from(&[tag][..]);
            assert_eq!(decode(&mut buf), Err(WireError::UnknownTag(tag)));
        }
    }
}
