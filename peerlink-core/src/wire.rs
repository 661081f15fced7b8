//! Framing: 1 byte signed type tag + 4 bytes BE length + payload.
//!
//! The codec never looks inside the payload; interpretation lives in `protocol`.

/// Type tag plus length prefix.
pub const HEADER_LEN: usize = 5;

/// One envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: i8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: i8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Frame with no payload (intents, acceptance, terminator).
    pub fn empty(kind: i8) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }
}

/// Header bytes for a frame of `kind` carrying `len` payload bytes.
pub fn encode_header(kind: i8, len: usize) -> Result<[u8; HEADER_LEN], FrameEncodeError> {
    let len = u32::try_from(len).map_err(|_| FrameEncodeError::TooLarge(len))?;
    let mut out = [0u8; HEADER_LEN];
    out[0] = kind.to_be_bytes()[0];
    out[1..].copy_from_slice(&len.to_be_bytes());
    Ok(out)
}

/// Split a header into (type tag, payload length).
pub fn decode_header(header: &[u8; HEADER_LEN]) -> (i8, u32) {
    let kind = i8::from_be_bytes([header[0]]);
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    (kind, len)
}

/// Encode a frame into a single contiguous buffer.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let header = encode_header(frame.kind, frame.payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes does not fit a 4-byte length")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with a partial buffer; returns `NeedMore` until the whole envelope is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let header: &[u8; HEADER_LEN] = header
        .try_into()
        .map_err(|_| FrameDecodeError::NeedMore)?;
    let (kind, len) = decode_header(header);
    let end = HEADER_LEN
        .checked_add(len as usize)
        .ok_or(FrameDecodeError::TooLarge(len))?;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((Frame::new(kind, &bytes[HEADER_LEN..end]), end))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {0} bytes exceeds the allowed size")]
    TooLarge(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_keeps_kind_and_payload() {
        for (kind, payload) in [
            (0i8, b"3f2a".to_vec()),
            (-4, vec![0u8; 0]),
            (-127, Vec::new()),
            (11, (0..=255u8).cycle().take(70_000).collect()),
        ] {
            let frame = Frame::new(kind, payload);
            let bytes = encode_frame(&frame).unwrap();
            let (decoded, n) = decode_frame(&bytes).unwrap();
            assert_eq!(n, bytes.len());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn header_is_signed_tag_then_big_endian_length() {
        let bytes = encode_frame(&Frame::new(-6, vec![7u8; 258])).unwrap();
        assert_eq!(bytes[0], 0xFA);
        assert_eq!(&bytes[1..5], &[0, 0, 1, 2]);
        assert_eq!(decode_header(&[0x81, 0, 0, 0, 0]), (-127, 0));
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&Frame::new(5, b"127.0.0.1:4000".to_vec())).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..3]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..HEADER_LEN]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = Frame::new(14, b"127.0.0.1:4000".to_vec());
        let b = Frame::empty(3);
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, HEADER_LEN);
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn length_beyond_u32_rejected() {
        assert!(matches!(
            encode_header(1, u32::MAX as usize + 1),
            Err(FrameEncodeError::TooLarge(_))
        ));
        assert!(encode_header(1, u32::MAX as usize).is_ok());
    }
}
