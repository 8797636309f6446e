//! Framed message transport
//!
//! The lowest layer of the wire stack: whole messages over a reliable
//! ordered byte pipe. A message is `nonce[24] || length[8] || data`, all
//! lengths big-endian. Nothing is buffered here; callers read and write
//! complete logical messages or get a hard transport error.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the per-message nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of the big-endian message-length prefix in bytes
pub const LEN_PREFIX: usize = 8;

/// Upper bound on a single message body (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Framing layer errors
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(u64),
}

/// Length-prefixed message framing over any reliable byte pipe.
pub struct FramedIo<T> {
    io: T,
}

impl<T> FramedIo<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }

    /// Give back the underlying transport.
    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> FramedIo<T> {
    /// Read one message: its 24-byte nonce and payload.
    ///
    /// A short read, including EOF mid-message, is a transport error.
    pub async fn read_message(&mut self) -> Result<([u8; NONCE_LEN], Bytes), FramingError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.io.read_exact(&mut nonce).await?;
        let len = self.io.read_u64().await?;
        if len > MAX_MESSAGE_SIZE as u64 {
            return Err(FramingError::MessageTooLarge(len));
        }
        let mut data = vec![0u8; len as usize];
        self.io.read_exact(&mut data).await?;
        Ok((nonce, Bytes::from(data)))
    }

    /// Write one message as `nonce || length || data` and flush it.
    pub async fn write_message(
        &mut self,
        nonce: &[u8; NONCE_LEN],
        data: &[u8],
    ) -> Result<(), FramingError> {
        let mut buf = BytesMut::with_capacity(NONCE_LEN + LEN_PREFIX + data.len());
        buf.put_slice(nonce);
        buf.put_u64(data.len() as u64);
        buf.put_slice(data);
        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FramedIo::new(a);
        let mut reader = FramedIo::new(b);

        let nonce = [7u8; NONCE_LEN];
        writer.write_message(&nonce, b"hello frames").await.unwrap();

        let (got_nonce, data) = reader.read_message().await.unwrap();
        assert_eq!(got_nonce, nonce);
        assert_eq!(&data[..], b"hello frames");
    }

    #[tokio::test]
    async fn test_empty_message() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FramedIo::new(a);
        let mut reader = FramedIo::new(b);

        writer.write_message(&[0u8; NONCE_LEN], b"").await.unwrap();
        let (_, data) = reader.read_message().await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_short_read_is_error() {
        let (a, b) = tokio::io::duplex(4096);
        {
            use tokio::io::AsyncWriteExt;
            let mut a = a;
            // Half a nonce, then EOF.
            a.write_all(&[1u8; 12]).await.unwrap();
            a.shutdown().await.unwrap();
        }
        let mut reader = FramedIo::new(b);
        assert!(matches!(
            reader.read_message().await,
            Err(FramingError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        {
            use tokio::io::AsyncWriteExt;
            let mut a = a;
            a.write_all(&[0u8; NONCE_LEN]).await.unwrap();
            a.write_all(&u64::MAX.to_be_bytes()).await.unwrap();
        }
        let mut reader = FramedIo::new(b);
        assert!(matches!(
            reader.read_message().await,
            Err(FramingError::MessageTooLarge(_))
        ));
    }
}
