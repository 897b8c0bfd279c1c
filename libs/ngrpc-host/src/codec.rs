//! Wire format of the control socket.
//!
//! One JSON object per line, tagged by `cmd`:
//!
//! ```text
//! {"cmd":"join","name":"user-server","uri":"grpcs://localhost:4001"}
//! {"cmd":"accepted"}
//! {"cmd":"stop","correlation_id":"6c0e..."}
//! {"cmd":"leave","name":"user-server","reason":"stopped","correlation_id":"6c0e..."}
//! ```
//!
//! A controller connection opens with `stop-apps` instead of `join` and reads one
//! `stopped` line per app until the host closes the connection:
//!
//! ```text
//! {"cmd":"stop-apps","app":"user-server"}
//! {"cmd":"stopped","app":"user-server","outcome":"left","reason":"stopped","correlation_id":"6c0e..."}
//! ```

use serde::{Deserialize, Serialize};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound for a single control line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// First message on every guest connection.
    Join { name: String, uri: String },
    /// Host has registered the guest that sent `Join`.
    Accepted,
    /// Guest is going away. Echoes the correlation id of the `Stop` that caused it, if any.
    Leave {
        name: String,
        #[serde(default)]
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    /// Host asks the guest to stop.
    Stop { correlation_id: String },
    /// First message on a controller connection: stop `app`, or every joined app.
    StopApps {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app: Option<String>,
    },
    /// Host reports how one app answered a `StopApps` request.
    Stopped(StopReply),
}

/// How an app answered a remote stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    /// The app sent `Leave`.
    Left,
    /// The app's connection closed without a `Leave`.
    Disconnected,
    /// No app was registered under that name.
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    pub app: String,
    pub outcome: StopOutcome,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control message exceeds {max} bytes")]
    LineTooLong { max: usize },
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => CodecError::LineTooLong {
                max: MAX_LINE_LENGTH,
            },
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }
}

/// Newline-delimited JSON framing for [`ControlMessage`].
#[derive(Debug)]
pub struct ControlCodec {
    lines: LinesCodec,
}

impl ControlCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn parse(line: &str) -> Result<Option<ControlMessage>, CodecError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        while let Some(line) = self.lines.decode(src)? {
            if let Some(msg) = parse(&line)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        while let Some(line) = self.lines.decode_eof(src)? {
            if let Some(msg) = parse(&line)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = serde_json::to_string(&item)?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
