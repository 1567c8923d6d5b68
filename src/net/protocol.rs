use serde::{Deserialize, Serialize};

use crate::movement::input::QuantizedInput;
use crate::movement::snapshot::KinematicSnapshot;
use crate::net::bitstream::{BitReader, BitWriter};

/// Bits used for the message tag at the start of every datagram
const TAG_BITS: u32 = 2;

const TAG_SERVER_MOVE: u8 = 0;
const TAG_ACK_GOOD: u8 = 1;
const TAG_ACK_BAD: u8 = 2;

/// Messages from the predicting client to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// One simulated move: its timestamp, the input used, and the state the
    /// client arrived at
    ServerMove {
        timestamp: f64,
        input: QuantizedInput,
        end_state: KinematicSnapshot,
    },
}

/// Messages from the authority to the predicting client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The client's move at `timestamp` matched the authority's result
    ClientAckGoodMove { timestamp: f64 },
    /// The client's move at `timestamp` diverged; `state` is authoritative
    ClientAckBadMove {
        timestamp: f64,
        state: KinematicSnapshot,
    },
}

impl ServerMessage {
    pub fn timestamp(&self) -> f64 {
        match self {
            ServerMessage::ClientAckGoodMove { timestamp }
            | ServerMessage::ClientAckBadMove { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_correction(&self) -> bool {
        matches!(self, ServerMessage::ClientAckBadMove { .. })
    }
}

/// A message with a compact bit-level wire form
pub trait WireMessage: Sized {
    /// Write the message. Returns `false` if any value was clamped to fit.
    fn write(&self, writer: &mut BitWriter) -> bool;
    fn read(reader: &mut BitReader<'_>) -> Result<Self, DecodeError>;
}

impl WireMessage for ClientMessage {
    fn write(&self, writer: &mut BitWriter) -> bool {
        match self {
            ClientMessage::ServerMove {
                timestamp,
                input,
                end_state,
            } => {
                writer.write_bits(TAG_SERVER_MOVE as u64, TAG_BITS);
                writer.write_f64(*timestamp);
                input.write(writer);
                end_state.write(writer)
            }
        }
    }

    fn read(reader: &mut BitReader<'_>) -> Result<Self, DecodeError> {
        match read_tag(reader)? {
            TAG_SERVER_MOVE => Ok(ClientMessage::ServerMove {
                timestamp: read_timestamp(reader)?,
                input: QuantizedInput::read(reader)?,
                end_state: KinematicSnapshot::read(reader)?,
            }),
            other => Err(DecodeError::UnknownMessage(other)),
        }
    }
}

impl WireMessage for ServerMessage {
    fn write(&self, writer: &mut BitWriter) -> bool {
        match self {
            ServerMessage::ClientAckGoodMove { timestamp } => {
                writer.write_bits(TAG_ACK_GOOD as u64, TAG_BITS);
                writer.write_f64(*timestamp);
                true
            }
            ServerMessage::ClientAckBadMove { timestamp, state } => {
                writer.write_bits(TAG_ACK_BAD as u64, TAG_BITS);
                writer.write_f64(*timestamp);
                state.write(writer)
            }
        }
    }

    fn read(reader: &mut BitReader<'_>) -> Result<Self, DecodeError> {
        match read_tag(reader)? {
            TAG_ACK_GOOD => Ok(ServerMessage::ClientAckGoodMove {
                timestamp: read_timestamp(reader)?,
            }),
            TAG_ACK_BAD => Ok(ServerMessage::ClientAckBadMove {
                timestamp: read_timestamp(reader)?,
                state: KinematicSnapshot::read(reader)?,
            }),
            other => Err(DecodeError::UnknownMessage(other)),
        }
    }
}

fn read_tag(reader: &mut BitReader<'_>) -> Result<u8, DecodeError> {
    reader.read_bits(TAG_BITS).map(|tag| tag as u8)
}

fn read_timestamp(reader: &mut BitReader<'_>) -> Result<f64, DecodeError> {
    let timestamp = reader.read_f64()?;
    if !timestamp.is_finite() {
        return Err(DecodeError::NonFinite("timestamp"));
    }
    Ok(timestamp)
}

/// Encode a message into a single datagram payload
pub fn encode<T: WireMessage + std::fmt::Debug>(message: &T) -> Vec<u8> {
    let mut writer = BitWriter::with_capacity(64);
    if !message.write(&mut writer) {
        tracing::warn!("Clamped out-of-range values while encoding {:?}", message);
    }
    writer.finish()
}

/// Decode a datagram payload, rejecting any trailing data
pub fn decode<T: WireMessage>(data: &[u8]) -> Result<T, DecodeError> {
    let mut reader = BitReader::new(data);
    let message = T::read(&mut reader)?;
    reader.expect_padding()?;
    Ok(message)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Datagram ended before the message was complete")]
    Truncated,
    #[error("Unknown message tag {0}")]
    UnknownMessage(u8),
    #[error("Non-finite {0}")]
    NonFinite(&'static str),
    #[error("Invalid {0}")]
    InvalidField(&'static str),
    #[error("{0} unexpected trailing bits")]
    TrailingBits(usize),
}
