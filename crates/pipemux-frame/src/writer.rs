use std::io::{self, ErrorKind, Write};

use bytes::BytesMut;
use pipemux_transport::{IpcStream, PlatformHandle};

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// A byte sink that may carry OS handles alongside its bytes.
pub trait SendChunk {
    fn send_chunk(&mut self, buf: &[u8], handles: &[PlatformHandle]) -> io::Result<usize>;
    fn flush_chunks(&mut self) -> io::Result<()>;
}

impl SendChunk for IpcStream {
    fn send_chunk(&mut self, buf: &[u8], handles: &[PlatformHandle]) -> io::Result<usize> {
        self.send_with_handles(buf, handles)
    }

    fn flush_chunks(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Adapter for plain `Write` sinks (cannot carry handles). Test plumbing.
pub struct ByteSink<T>(pub T);

impl<T: Write> SendChunk for ByteSink<T> {
    fn send_chunk(&mut self, buf: &[u8], handles: &[PlatformHandle]) -> io::Result<usize> {
        if !handles.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "byte sink cannot carry handles",
            ));
        }
        self.0.write(buf)
    }

    fn flush_chunks(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Writes complete frames to a chunk sink.
///
/// A frame's handles are attached to the send that carries its first byte;
/// writing a frame consumes them (the kernel owns the receiver's copies once
/// the send succeeds).
pub struct FrameWriter<S> {
    sink: S,
    buf: BytesMut,
    config: FrameConfig,
}

impl<S: SendChunk> FrameWriter<S> {
    /// Create a frame writer with default configuration.
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, FrameConfig::default())
    }

    /// Create a frame writer with explicit configuration.
    pub fn with_config(sink: S, config: FrameConfig) -> Self {
        Self {
            sink,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write one frame (blocking), consuming it and its handles.
    pub fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let Frame {
            kind,
            route_id,
            payload,
            handles,
        } = frame;

        if payload.len() > self.config.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload,
            });
        }
        if handles.len() > self.config.max_handles {
            return Err(FrameError::TooManyHandles {
                count: handles.len(),
                max: self.config.max_handles,
            });
        }

        self.buf.clear();
        encode_frame(kind, route_id, &payload, handles.len(), &mut self.buf)?;

        let mut offset = 0usize;
        let mut pending_handles: &[PlatformHandle] = &handles;
        while offset < self.buf.len() {
            match self.sink.send_chunk(&self.buf[offset..], pending_handles) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    offset += n;
                    pending_handles = &[];
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        // Ownership transferred to the receiving process; close our copies.
        drop(handles);
        self.flush()
    }

    /// Flush the underlying sink.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.sink.flush_chunks() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Build a writer over a stream, applying the configured write timeout.
    pub fn for_stream(stream: IpcStream, config: FrameConfig) -> Result<Self> {
        stream
            .set_write_timeout(config.write_timeout)
            .map_err(|err| FrameError::Io(io::Error::other(err)))?;
        Ok(Self::with_config(stream, config))
    }
}
