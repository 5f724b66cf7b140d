//! Session wire protocol
//!
//! Every frame is a 4-byte big-endian length followed by a JSON document.
//! Session frames decode into exactly one [`Message`] variant; anything else
//! is a [`ProtocolError`] and ends the session. The rendezvous connection
//! carries a single frame holding the dedicated session port.
//!
//! ```text
//! server                         probe
//!   │ ── UrlAssignment{url} ──────▶ │
//!   │ ◀──── MeasurementBatch{..} ── │  (one or more)
//!   │ ◀──────────────── Done ────── │
//!   │ ── UrlAssignment / Exit ────▶ │
//! ```

use std::fmt;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::model::MeasurementSample;

/// Upper bound for one frame; a batch of a few dozen samples is far below it
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Messages exchanged on an established session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Server → probe: measure this URL
    UrlAssignment { url: String },

    /// Probe → server: samples for the current assignment
    MeasurementBatch { samples: Vec<MeasurementSample> },

    /// Probe → server: the current assignment is complete
    Done,

    /// Server → probe: no more work, close the session
    Exit,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::UrlAssignment { .. } => "url_assignment",
            Message::MeasurementBatch { .. } => "measurement_batch",
            Message::Done => "done",
            Message::Exit => "exit",
        }
    }
}

/// Errors raised at the protocol boundary
#[derive(Debug)]
pub enum ProtocolError {
    /// Underlying socket failure
    Io(std::io::Error),

    /// Frame could not be decoded into a known message
    Malformed(String),

    /// A well-formed message arrived where another was required
    Unexpected {
        expected: &'static str,
        received: &'static str,
    },

    /// Peer closed the connection
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Io(err) => write!(f, "session I/O error: {}", err),
            ProtocolError::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            ProtocolError::Unexpected { expected, received } => {
                write!(f, "expected {}, received {}", expected, received)
            }
            ProtocolError::ConnectionClosed => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err)
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Framed, typed channel over any byte stream
pub struct SessionChannel<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> SessionChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();

        Self {
            framed: Framed::new(io, codec),
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let frame = encode(message)?;
        self.framed.send(Bytes::from(frame)).await?;
        Ok(())
    }

    /// Next message, or `None` once the peer has closed the stream
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(frame)) => decode(&frame).map(Some),
        }
    }

    /// Handshake reply: the dedicated session port as a bare JSON integer
    pub async fn send_port(&mut self, port: u16) -> Result<(), ProtocolError> {
        let frame = serde_json::to_vec(&port).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.framed.send(Bytes::from(frame)).await?;
        Ok(())
    }

    pub async fn recv_port(&mut self) -> Result<u16, ProtocolError> {
        match self.framed.next().await {
            None => Err(ProtocolError::ConnectionClosed),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(frame)) => {
                serde_json::from_slice(&frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}
