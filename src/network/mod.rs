//! Network Module
//!
//! Framed request/response messaging between the replicas of a shard.

mod server;
mod client;

pub use server::{MessageHandler, NetworkServer};
pub use client::NetworkClient;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::replication::{FrameHeader, Message};

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Read one frame and decode the message it carries
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header).await?;
    let header = FrameHeader::from_bytes(&header);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "frame of {} bytes exceeds the {} byte limit",
            header.length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("frame checksum mismatch".into()));
    }

    Ok(Message::deserialize(&body)?)
}

/// Encode a message and write it as one frame
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = message.serialize()?;
    let mut frame = Vec::with_capacity(FrameHeader::SIZE + body.len());
    frame.extend_from_slice(&FrameHeader::new(&body).to_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
