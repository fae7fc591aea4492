use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RouterError};
use crate::registry::ProcessId;

/// Broker control message tags.
pub const TAG_HELLO: u8 = 0;
pub const TAG_CONNECT_TO_PROCESS: u8 = 1;
pub const TAG_CONNECT_MESSAGE_PIPE: u8 = 2;

const HELLO_LEN: usize = 1 + 8;
const CONNECT_TO_PROCESS_LEN: usize = 1 + 8;
const CONNECT_MESSAGE_PIPE_LEN: usize = 1 + 8 + 8;

/// Messages exchanged on a broker control channel.
///
/// Fixed little-endian layouts, one tag byte then the fields; any other
/// shape on a control channel is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMessage {
    /// Child → host: announce, with `UNKNOWN` meaning "assign me an id".
    /// Host → child: the accepted/assigned id.
    Hello { process_id: ProcessId },

    /// Host → child: the frame's attached handle is a transport endpoint to
    /// `peer`; stand up a channel on it.
    ConnectToProcess { peer: ProcessId },

    /// Child → host (`peer` = `UNKNOWN`): this process holds one end of
    /// `pipe_id`, introduce me. Host → child: the other end of `pipe_id`
    /// lives in `peer`.
    ConnectMessagePipe { pipe_id: u64, peer: ProcessId },
}

impl BrokerMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONNECT_MESSAGE_PIPE_LEN);
        match *self {
            BrokerMessage::Hello { process_id } => {
                buf.put_u8(TAG_HELLO);
                buf.put_u64_le(process_id.0);
            }
            BrokerMessage::ConnectToProcess { peer } => {
                buf.put_u8(TAG_CONNECT_TO_PROCESS);
                buf.put_u64_le(peer.0);
            }
            BrokerMessage::ConnectMessagePipe { pipe_id, peer } => {
                buf.put_u8(TAG_CONNECT_MESSAGE_PIPE);
                buf.put_u64_le(pipe_id);
                buf.put_u64_le(peer.0);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let Some(&tag) = payload.first() else {
            return Err(RouterError::Protocol("empty broker message".to_string()));
        };
        match tag {
            TAG_HELLO => {
                if payload.len() != HELLO_LEN {
                    return Err(RouterError::Protocol(format!(
                        "HELLO must be {HELLO_LEN} bytes, got {}",
                        payload.len()
                    )));
                }
                Ok(BrokerMessage::Hello {
                    process_id: ProcessId(read_u64(&payload[1..9])),
                })
            }
            TAG_CONNECT_TO_PROCESS => {
                if payload.len() != CONNECT_TO_PROCESS_LEN {
                    return Err(RouterError::Protocol(format!(
                        "CONNECT_TO_PROCESS must be {CONNECT_TO_PROCESS_LEN} bytes, got {}",
                        payload.len()
                    )));
                }
                Ok(BrokerMessage::ConnectToProcess {
                    peer: ProcessId(read_u64(&payload[1..9])),
                })
            }
            TAG_CONNECT_MESSAGE_PIPE => {
                if payload.len() != CONNECT_MESSAGE_PIPE_LEN {
                    return Err(RouterError::Protocol(format!(
                        "CONNECT_MESSAGE_PIPE must be {CONNECT_MESSAGE_PIPE_LEN} bytes, got {}",
                        payload.len()
                    )));
                }
                Ok(BrokerMessage::ConnectMessagePipe {
                    pipe_id: read_u64(&payload[1..9]),
                    peer: ProcessId(read_u64(&payload[9..17])),
                })
            }
            other => Err(RouterError::Protocol(format!(
                "unknown broker message tag {other}"
            ))),
        }
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().expect("slice length is 8"))
}
