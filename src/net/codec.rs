//! Length-prefixed frame codec.
//!
//! # Wire Format (big-endian)
//! ```text
//! request  = len:u32 | cmd_len:u8 | cmd (UTF-8) | payload
//! response = len:u32 | status:u8 | payload
//! ```
//! Status `3` marks a frame the server pushed on its own, not a reply.
//! `len` counts the bytes after the prefix and must be in `1..=max_frame_len`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

const LEN_PREFIX: usize = 4;

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    HandlerError = 1,
    UnknownCommand = 2,
    Push = 3,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::HandlerError => "handler_error",
            Status::UnknownCommand => "unknown_command",
            Status::Push => "push",
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::HandlerError),
            2 => Ok(Status::UnknownCommand),
            3 => Ok(Status::Push),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub command: String,
    pub payload: Vec<u8>,
}

impl RequestFrame {
    pub fn new(command: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Encode with the length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let cmd = self.command.as_bytes();
        if cmd.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }
        let cmd_len = u8::try_from(cmd.len()).map_err(|_| ProtocolError::CommandTooLong(cmd.len()))?;

        let body_len = 1 + cmd.len() + self.payload.len();
        let mut out = Vec::with_capacity(LEN_PREFIX + body_len);
        out.extend_from_slice(&prefix(body_len)?);
        out.push(cmd_len);
        out.extend_from_slice(cmd);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode a frame body (prefix already stripped).
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&cmd_len, rest) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let cmd_len = cmd_len as usize;
        if cmd_len == 0 {
            return Err(ProtocolError::EmptyCommand);
        }
        if cmd_len > rest.len() {
            return Err(ProtocolError::CommandOverrun {
                cmd_len,
                available: rest.len(),
            });
        }

        let (cmd, payload) = rest.split_at(cmd_len);
        let command = std::str::from_utf8(cmd).map_err(|_| ProtocolError::InvalidCommand)?;
        Ok(Self {
            command: command.to_string(),
            payload: payload.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub status: Status,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    pub fn new(status: Status, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Status::Ok, payload)
    }

    pub fn push(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Status::Push, payload)
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body_len = 1 + self.payload.len();
        let mut out = Vec::with_capacity(LEN_PREFIX + body_len);
        out.extend_from_slice(&prefix(body_len)?);
        out.push(self.status as u8);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&status, payload) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;
        Ok(Self {
            status: Status::try_from(status)?,
            payload: payload.to_vec(),
        })
    }
}

fn prefix(body_len: usize) -> Result<[u8; LEN_PREFIX], ProtocolError> {
    let len = u32::try_from(body_len).map_err(|_| ProtocolError::FrameTooLarge {
        len: body_len,
        max: u32::MAX as usize,
    })?;
    Ok(len.to_be_bytes())
}

/// Read one frame body.
///
/// Returns `Ok(None)` when the peer closed cleanly between frames. The length
/// is validated before the body is allocated.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > max_frame_len {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })?;
    Ok(Some(body))
}

/// Write an already-encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
