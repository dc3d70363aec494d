//! Wire encodings for output records.
//!
//! `Text` writes each record's data as-is. `MsgPack` writes one frame per
//! record: a 4-byte big-endian length followed by a MessagePack map
//! `{ data, created_at }` with `created_at` in microseconds since the epoch.

use crate::error::CodecError;
use crate::process_record::{OutputRecord, ProcessId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Text,
    MsgPack,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Text => "text",
            WireFormat::MsgPack => "msgpack",
        }
    }

    pub fn encode(&self, record: &OutputRecord) -> Result<Vec<u8>, CodecError> {
        match self {
            WireFormat::Text => Ok(record.data.as_bytes().to_vec()),
            WireFormat::MsgPack => encode_frame(record),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(WireFormat::Text),
            "msgpack" | "binary" => Ok(WireFormat::MsgPack),
            other => Err(CodecError::UnknownFormat(other.to_string())),
        }
    }
}

/// One record as it travels in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub data: String,
    pub created_at: i64,
}

impl WireRecord {
    pub fn created_at(&self) -> Result<DateTime<Utc>, CodecError> {
        DateTime::<Utc>::from_timestamp_micros(self.created_at)
            .ok_or(CodecError::Timestamp(self.created_at))
    }

    pub fn into_output(self, process_id: ProcessId) -> Result<OutputRecord, CodecError> {
        let created_at = self.created_at()?;
        Ok(OutputRecord {
            process_id,
            data: self.data,
            created_at,
        })
    }
}

impl From<&OutputRecord> for WireRecord {
    fn from(record: &OutputRecord) -> Self {
        Self {
            data: record.data.clone(),
            created_at: record.created_at.timestamp_micros(),
        }
    }
}

pub fn encode_frame(record: &OutputRecord) -> Result<Vec<u8>, CodecError> {
    let payload = rmp_serde::to_vec_named(&WireRecord::from(record))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len(), MAX_FRAME_LEN));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reassembles frames from arbitrarily split input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<WireRecord>, CodecError> {
        let Some(header) = self.buffer.get(..FRAME_HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len, MAX_FRAME_LEN));
        }
        let end = FRAME_HEADER_LEN + len;
        if self.buffer.len() < end {
            return Ok(None);
        }
        let record = rmp_serde::from_slice(&self.buffer[FRAME_HEADER_LEN..end])?;
        self.buffer.drain(..end);
        Ok(Some(record))
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
