use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read};

use bytes::BytesMut;
use pipemux_transport::{IpcStream, PlatformHandle};

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A byte source that may deliver OS handles alongside its bytes.
pub trait RecvChunk {
    fn recv_chunk(
        &mut self,
        buf: &mut [u8],
        handles: &mut Vec<PlatformHandle>,
    ) -> io::Result<usize>;
}

impl RecvChunk for IpcStream {
    fn recv_chunk(
        &mut self,
        buf: &mut [u8],
        handles: &mut Vec<PlatformHandle>,
    ) -> io::Result<usize> {
        self.recv_with_handles(buf, handles)
    }
}

/// Adapter for plain `Read` sources (never carries handles). Test plumbing.
pub struct ByteSource<T>(pub T);

impl<T: Read> RecvChunk for ByteSource<T> {
    fn recv_chunk(
        &mut self,
        buf: &mut [u8],
        _handles: &mut Vec<PlatformHandle>,
    ) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Reads complete frames, with their handles attached, from a chunk source.
///
/// Partial reads are handled internally; callers always get whole frames.
/// Handles received as ancillary data queue up until the frame that declared
/// them decodes.
pub struct FrameReader<S> {
    src: S,
    buf: BytesMut,
    handles: VecDeque<PlatformHandle>,
    config: FrameConfig,
}

impl<S: RecvChunk> FrameReader<S> {
    /// Create a frame reader with default configuration.
    pub fn new(src: S) -> Self {
        Self::with_config(src, FrameConfig::default())
    }

    /// Create a frame reader with explicit configuration.
    pub fn with_config(src: S, config: FrameConfig) -> Self {
        Self {
            src,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            handles: VecDeque::new(),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` at end of stream.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, &mut self.handles, &self.config)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let mut incoming = Vec::new();
            let read = match self.src.recv_chunk(&mut chunk, &mut incoming) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            self.handles.extend(incoming);
            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.src
    }

    pub fn into_inner(self) -> S {
        self.src
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Build a reader over a stream, applying the configured read timeout.
    pub fn for_stream(stream: IpcStream, config: FrameConfig) -> Result<Self> {
        stream
            .set_read_timeout(config.read_timeout)
            .map_err(|err| FrameError::Io(io::Error::other(err)))?;
        Ok(Self::with_config(stream, config))
    }
}
