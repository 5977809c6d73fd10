//! Framed request/response protocol between the pool and worker processes.
//!
//! Every message is one frame:
//!
//! ```text
//! u32 BE header length | JSON header | u32 BE payload length | payload
//! ```
//!
//! Requests carry the task in the header and no payload. Responses carry a
//! status header and, on success, the encoded image as payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::render::{RenderOptions, RenderTask};
use crate::series::ChartSeries;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Stream closed")]
    Closed,

    #[error("Frame section of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed header: {0}")]
    Json(#[from] serde_json::Error),
}

/// Request sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub task_id: Uuid,
    pub series: ChartSeries,
    pub options: RenderOptions,
    pub width: u32,
    pub height: u32,
}

impl From<&RenderTask> for RenderRequest {
    fn from(task: &RenderTask) -> Self {
        Self {
            task_id: task.id,
            series: task.series.clone(),
            options: task.options.clone(),
            width: task.width,
            height: task.height,
        }
    }
}

/// Failure categories a live worker can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    InvalidPayload,
    Encode,
}

/// Header of a worker response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResponseHeader {
    Ok {
        task_id: Uuid,
    },
    Error {
        task_id: Uuid,
        kind: WorkerErrorKind,
        message: String,
    },
}

impl ResponseHeader {
    pub fn task_id(&self) -> Uuid {
        match self {
            ResponseHeader::Ok { task_id } | ResponseHeader::Error { task_id, .. } => *task_id,
        }
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W, H>(writer: &mut W, header: &H, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    H: Serialize,
{
    let header = serde_json::to_vec(header)?;
    for section in [header.as_slice(), payload] {
        if section.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(section.len()));
        }
        writer.write_u32(section.len() as u32).await?;
        writer.write_all(section).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the first byte yields [`ProtocolError::Closed`].
pub async fn read_frame<R, H>(reader: &mut R) -> Result<(H, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
    H: DeserializeOwned,
{
    let header_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    };
    let header_bytes = read_section(reader, header_len).await?;
    let payload_len = reader.read_u32().await? as usize;
    let payload = read_section(reader, payload_len).await?;
    Ok((serde_json::from_slice(&header_bytes)?, payload))
}

async fn read_section<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProtocolError> {
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
