use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pipemux_transport::PlatformHandle;

use crate::error::{FrameError, Result};

/// Fixed header: length (4) + type (4) + route id (8) + handle count (4).
pub const HEADER_LEN: usize = 20;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Default maximum attached handles per frame.
pub const DEFAULT_MAX_HANDLES: usize = pipemux_transport::stream::MAX_HANDLES_PER_MESSAGE;

/// Frame type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Application payload for a user route.
    Data,
    /// Channel-internal control traffic (route 0, broker messages).
    Internal,
}

impl FrameKind {
    pub fn to_wire(self) -> u32 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Internal => 1,
        }
    }

    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Internal),
            _ => None,
        }
    }
}

/// One atomic transport message: payload bytes plus attached OS handles,
/// tagged with the route it belongs to.
///
/// Not `Clone`: the handles are exclusively owned.
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub route_id: u64,
    pub payload: Bytes,
    pub handles: Vec<PlatformHandle>,
}

impl Frame {
    /// A user-data frame for `route_id`.
    pub fn data(route_id: u64, payload: impl Into<Bytes>, handles: Vec<PlatformHandle>) -> Self {
        Self {
            kind: FrameKind::Data,
            route_id,
            payload: payload.into(),
            handles,
        }
    }

    /// An internal control frame.
    pub fn internal(route_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Internal,
            route_id,
            payload: payload.into(),
            handles: Vec::new(),
        }
    }

    /// An internal control frame carrying handles (broker introductions).
    pub fn internal_with_handles(
        route_id: u64,
        payload: impl Into<Bytes>,
        handles: Vec<PlatformHandle>,
    ) -> Self {
        Self {
            kind: FrameKind::Internal,
            route_id,
            payload: payload.into(),
            handles,
        }
    }

    /// Total byte-stream size of this frame.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Configuration for frame encoding/decoding.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes.
    pub max_payload: usize,
    /// Maximum attached handles per frame.
    pub max_handles: usize,
    /// Read timeout applied when a reader is built over a stream.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout applied when a writer is built over a stream.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_handles: DEFAULT_MAX_HANDLES,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Encode the byte-stream portion of a frame (header + payload).
///
/// The handle count is written into the header; the handles themselves
/// travel out-of-band with the send.
pub fn encode_frame(
    kind: FrameKind,
    route_id: u64,
    payload: &[u8],
    handle_count: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u32::MAX as usize - HEADER_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize - HEADER_LEN,
        });
    }
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32_le((HEADER_LEN + payload.len()) as u32);
    dst.put_u32_le(kind.to_wire());
    dst.put_u64_le(route_id);
    dst.put_u32_le(handle_count as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a byte buffer, pulling its declared handles from
/// `handles` in FIFO order.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete frame.
/// On success, consumes the frame bytes and handles.
pub fn decode_frame(
    src: &mut BytesMut,
    handles: &mut VecDeque<PlatformHandle>,
    config: &FrameConfig,
) -> Result<Option<Frame>> {
    if src.len() < HEADER_LEN {
        return Ok(None); // Need more data
    }

    let total = u32::from_le_bytes(src[0..4].try_into().expect("slice length is 4")) as usize;
    if total < HEADER_LEN {
        return Err(FrameError::BadLength {
            len: total,
            min: HEADER_LEN,
        });
    }
    let payload_len = total - HEADER_LEN;
    if payload_len > config.max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload,
        });
    }

    let raw_kind = u32::from_le_bytes(src[4..8].try_into().expect("slice length is 4"));
    let kind = FrameKind::from_wire(raw_kind).ok_or(FrameError::UnknownType(raw_kind))?;
    let route_id = u64::from_le_bytes(src[8..16].try_into().expect("slice length is 8"));
    let handle_count =
        u32::from_le_bytes(src[16..20].try_into().expect("slice length is 4")) as usize;

    if handle_count > config.max_handles {
        return Err(FrameError::TooManyHandles {
            count: handle_count,
            max: config.max_handles,
        });
    }

    if src.len() < total {
        return Ok(None); // Need more data
    }

    // Handles ride with the bytes of their frame, so a fully-buffered frame
    // with absent handles is a peer protocol violation, not a short read.
    if handles.len() < handle_count {
        return Err(FrameError::MissingHandles {
            expected: handle_count,
            available: handles.len(),
        });
    }

    src.advance(HEADER_LEN);
    let payload = src.split_to(payload_len).freeze();
    let attached = handles.drain(..handle_count).collect();

    Ok(Some(Frame {
        kind,
        route_id,
        payload,
        handles: attached,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_plain(src: &mut BytesMut) -> Result<Option<Frame>> {
        let mut handles = VecDeque::new();
        decode_frame(src, &mut handles, &FrameConfig::default())
    }

    #[test]
    fn roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Data, 7, b"hello mux", 0, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 9);

        let frame = decode_plain(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.route_id, 7);
        assert_eq!(frame.payload.as_ref(), b"hello mux");
        assert!(frame.handles.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_header_needs_more() {
        let mut buf = BytesMut::from(&[0x20, 0x00, 0x00][..]);
        assert!(decode_plain(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_payload_needs_more() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Data, 1, b"truncated", 0, &mut buf).unwrap();
        buf.truncate(HEADER_LEN + 3);
        assert!(decode_plain(&mut buf).unwrap().is_none());
    }

    #[test]
    fn length_below_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_u32_le(0);
        buf.put_u64_le(1);
        buf.put_u32_le(0);
        assert!(matches!(
            decode_plain(&mut buf),
            Err(FrameError::BadLength { len: 4, .. })
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_LEN as u32);
        buf.put_u32_le(9);
        buf.put_u64_le(1);
        buf.put_u32_le(0);
        assert!(matches!(
            decode_plain(&mut buf),
            Err(FrameError::UnknownType(9))
        ));
    }

    #[test]
    fn oversize_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((HEADER_LEN + 64) as u32);
        buf.put_u32_le(0);
        buf.put_u64_le(1);
        buf.put_u32_le(0);
        let config = FrameConfig {
            max_payload: 16,
            ..FrameConfig::default()
        };
        let mut handles = VecDeque::new();
        assert!(matches!(
            decode_frame(&mut buf, &mut handles, &config),
            Err(FrameError::PayloadTooLarge { size: 64, max: 16 })
        ));
    }

    #[test]
    fn handle_count_above_limit_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_LEN as u32);
        buf.put_u32_le(0);
        buf.put_u64_le(1);
        buf.put_u32_le(1000);
        assert!(matches!(
            decode_plain(&mut buf),
            Err(FrameError::TooManyHandles { count: 1000, .. })
        ));
    }

    #[test]
    fn declared_handles_must_be_present() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Data, 3, b"x", 2, &mut buf).unwrap();
        assert!(matches!(
            decode_plain(&mut buf),
            Err(FrameError::MissingHandles {
                expected: 2,
                available: 0
            })
        ));
    }

    #[test]
    fn handles_attach_in_fifo_order() {
        use std::os::fd::{AsRawFd, OwnedFd};
        use std::os::unix::net::UnixStream;

        let (s1, _k1) = UnixStream::pair().unwrap();
        let (s2, _k2) = UnixStream::pair().unwrap();
        let first = PlatformHandle::from(OwnedFd::from(s1));
        let second = PlatformHandle::from(OwnedFd::from(s2));
        let (first_fd, second_fd) = (first.as_raw_fd(), second.as_raw_fd());

        let mut handles = VecDeque::from([first, second]);
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Data, 5, b"fds", 2, &mut buf).unwrap();

        let frame = decode_frame(&mut buf, &mut handles, &FrameConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(frame.handles.len(), 2);
        assert_eq!(frame.handles[0].as_raw_fd(), first_fd);
        assert_eq!(frame.handles[1].as_raw_fd(), second_fd);
        assert!(handles.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Data, 1, b"first", 0, &mut buf).unwrap();
        encode_frame(FrameKind::Internal, 0, b"second", 0, &mut buf).unwrap();

        let f1 = decode_plain(&mut buf).unwrap().unwrap();
        let f2 = decode_plain(&mut buf).unwrap().unwrap();
        assert_eq!((f1.route_id, f1.payload.as_ref()), (1, b"first".as_ref()));
        assert_eq!(f2.kind, FrameKind::Internal);
        assert_eq!((f2.route_id, f2.payload.as_ref()), (0, b"second".as_ref()));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Internal, 0, b"", 0, &mut buf).unwrap();
        let frame = decode_plain(&mut buf).unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.wire_len(), HEADER_LEN);
    }
}
