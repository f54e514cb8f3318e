//! Framing: length-prefix (4 bytes LE) + kind tag + payload.
//!
//! ```text
//! [4 bytes LE: body length]
//! [1 byte: 0x00 control | 0x01 binary]
//! [body length - 1 bytes: bincode ControlMessage, or raw file bytes]
//! ```

use bytes::Bytes;

use crate::protocol::ControlMessage;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const KIND_CONTROL: u8 = 0x00;
const KIND_BINARY: u8 = 0x01;

/// One unit on the channel. Sessions only ever see this; frame kind is decided here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Binary(Bytes),
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Frame::Control(msg)
    }
}

/// Encode a frame: 4 bytes LE length + kind byte + payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let (kind, payload) = match frame {
        Frame::Control(msg) => (
            KIND_CONTROL,
            bincode::serialize(msg).map_err(FrameEncodeError::Encode)?,
        ),
        Frame::Binary(bytes) => (KIND_BINARY, bytes.to_vec()),
    };
    let body_len = payload.len() + 1;
    if body_len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.push(kind);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the body length from a 4-byte header. Hosts reading a stream use this before `decode_body`.
pub fn body_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = body_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((frame, LEN_SIZE + len))
}

/// Decode a frame body (kind byte + payload), without the length prefix.
pub fn decode_body(body: &[u8]) -> Result<Frame, FrameDecodeError> {
    let (&kind, payload) = body.split_first().ok_or(FrameDecodeError::Empty)?;
    match kind {
        KIND_CONTROL => {
            let msg: ControlMessage =
                bincode::deserialize(payload).map_err(FrameDecodeError::Decode)?;
            Ok(Frame::Control(msg))
        }
        KIND_BINARY => Ok(Frame::Binary(Bytes::copy_from_slice(payload))),
        other => Err(FrameDecodeError::UnknownKind(other)),
    }
}

/// Error decoding a frame (need more bytes, too large, bad kind, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("empty frame")]
    Empty,
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileInfo;

    fn sample_info() -> Frame {
        Frame::Control(ControlMessage::Info {
            file: FileInfo {
                name: "char.charx".into(),
                size: 1000,
                mime_type: "application/zip".into(),
            },
        })
    }

    #[test]
    fn control_and_binary_are_distinguished() {
        let control = encode_frame(&sample_info()).unwrap();
        let binary = encode_frame(&Frame::Binary(Bytes::from_static(b"\x00\x01raw"))).unwrap();
        assert_eq!(control[LEN_SIZE], KIND_CONTROL);
        assert_eq!(binary[LEN_SIZE], KIND_BINARY);

        let (decoded, n) = decode_frame(&binary).unwrap();
        assert_eq!(n, binary.len());
        assert_eq!(decoded, Frame::Binary(Bytes::from_static(b"\x00\x01raw")));

        let (decoded, _) = decode_frame(&control).unwrap();
        assert_eq!(decoded, sample_info());
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_info()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = encode_frame(&sample_info()).unwrap();
        let b = encode_frame(&Frame::Control(ControlMessage::Done)).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert!(matches!(m1, Frame::Control(ControlMessage::Info { .. })));
        assert_eq!(m2, Frame::Control(ControlMessage::Done));
    }

    #[test]
    fn empty_binary_frame_is_valid() {
        let encoded = encode_frame(&Frame::Binary(Bytes::new())).unwrap();
        let (decoded, _) = decode_frame(&encoded).unwrap();
        assert_eq!(decoded, Frame::Binary(Bytes::new()));
    }

    #[test]
    fn rejects_unknown_kind_and_oversized_length() {
        assert!(matches!(
            decode_body(&[0x7f, 1, 2]),
            Err(FrameDecodeError::UnknownKind(0x7f))
        ));
        assert!(matches!(decode_body(&[]), Err(FrameDecodeError::Empty)));
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(body_len(header), Err(FrameDecodeError::TooLarge)));
    }
}
