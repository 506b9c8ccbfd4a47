//! Length-prefixed frame I/O shared by the link queues and control channels.
//!
//! A frame is a little-endian `u32` length followed by that many payload
//! bytes. A zero-length frame is the explicit close marker: EOF without it
//! is transport loss, EOF after it is an orderly producer shutdown. One
//! credit byte flows the other way per consumed envelope.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Credit byte acknowledging one consumed envelope.
pub const ACK: u8 = 0x06;

/// Upper bound on a single frame; larger lengths indicate a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write one payload frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Write the zero-length close marker.
pub async fn write_close<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32_le(0).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` is the close marker.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").await.unwrap();
        write_close(&mut buf).await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"abc");
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }
}
