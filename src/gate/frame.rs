//! Length-prefixed JSON frames exchanged with a gate process.
//!
//! Wire format: a 4-byte big-endian unsigned length, then that many UTF-8
//! bytes of JSON. This module only handles the encode/decode side; `protocol`
//! owns request/response correlation.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Frames the controller sends to a gate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerFrame {
    Execute {
        id: u64,
        module: String,
        params: Value,
        check_mode: bool,
    },
    Info {
        id: u64,
    },
    ListModules {
        id: u64,
    },
    Shutdown,
}

/// Frames a gate sends to the controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateFrame {
    Result {
        id: u64,
        success: bool,
        changed: bool,
        output: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        id: u64,
        kind: EventKind,
        payload: Value,
    },
    Ready {
        /// Fingerprint of the bundle the gate actually extracted and is
        /// serving, if the entry stub reports one. Lets the controller
        /// detect a stale remote cache and re-stage once instead of running
        /// calls against the wrong module code.
        #[serde(default)]
        fingerprint: Option<String>,
    },
    Error {
        #[serde(default)]
        id: Option<u64>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Log,
    Data,
}

/// Codec that frames outgoing [`ControllerFrame`]s and parses incoming raw
/// bytes into [`GateFrame`]s, length-prefixed per the gate wire format.
#[derive(Debug, Default)]
pub struct GateCodec {
    length: LengthDelimited,
}

/// Thin wrapper so `GateCodec` reuses the same length-delimited framing for
/// both directions without pulling in `tokio_util::codec::LengthDelimitedCodec`'s
/// own `Item = BytesMut` type, which would make the JSON (de)serialization
/// boundary implicit.
#[derive(Debug, Default)]
struct LengthDelimited;

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

impl Decoder for GateCodec {
    type Item = GateFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::ProtocolError(format!("frame length {len} exceeds maximum")));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(len);
        let frame: GateFrame = serde_json::from_slice(&payload)
            .map_err(|e| Error::ProtocolError(format!("malformed frame: {e}")))?;
        Ok(Some(frame))
    }
}

impl Encoder<ControllerFrame> for GateCodec {
    type Error = Error;

    fn encode(&mut self, item: ControllerFrame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::ProtocolError("outgoing frame too large".to_string()));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
