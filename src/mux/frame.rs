//! Mux frame encoding/decoding
//!
//! Frame format (big-endian):
//! ```text
//! frame := stream_id[24] || code[1] || (code==DATA ? length[8] || payload : ε)
//! code  := 1 (DATA) | 2 (CLOSE)
//! ```

use super::{Sid, MAX_PAYLOAD, SID_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CODE_DATA: u8 = 1;
const CODE_CLOSE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameCode {
    Data,
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub sid: Sid,
    pub code: FrameCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(sid: Sid, payload: Bytes) -> Self {
        Self {
            sid,
            code: FrameCode::Data,
            payload,
        }
    }

    pub fn close(sid: Sid) -> Self {
        Self {
            sid,
            code: FrameCode::Close,
            payload: Bytes::new(),
        }
    }

    /// Read one frame. A bad code or oversized length is `InvalidData` and
    /// terminates the multiplexer that sees it.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Frame> {
        let mut sid = [0u8; SID_LEN];
        r.read_exact(&mut sid).await?;
        let sid = Sid::from_bytes(sid);
        match r.read_u8().await? {
            CODE_DATA => {
                let len = r.read_u64().await?;
                if len > MAX_PAYLOAD {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "oversized mux frame",
                    ));
                }
                let mut payload = vec![0u8; len as usize];
                r.read_exact(&mut payload).await?;
                Ok(Frame::data(sid, Bytes::from(payload)))
            }
            CODE_CLOSE => Ok(Frame::close(sid)),
            code => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame code: {}", code),
            )),
        }
    }

    /// Write this frame as a single contiguous buffer and flush it.
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(SID_LEN + 1 + 8 + self.payload.len());
        buf.put_slice(self.sid.as_bytes());
        match self.code {
            FrameCode::Data => {
                buf.put_u8(CODE_DATA);
                buf.put_u64(self.payload.len() as u64);
                buf.put_slice(&self.payload);
            }
            FrameCode::Close => buf.put_u8(CODE_CLOSE),
        }
        w.write_all(&buf).await?;
        w.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::SystemEntropy;

    #[tokio::test]
    async fn test_data_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sid = Sid::generate(&SystemEntropy);
        Frame::data(sid, Bytes::from_static(b"Hello World"))
            .write(&mut a)
            .await
            .unwrap();

        let frame = Frame::read(&mut b).await.unwrap();
        assert_eq!(frame.sid, sid);
        assert_eq!(frame.code, FrameCode::Data);
        assert_eq!(&frame.payload[..], b"Hello World");
    }

    #[tokio::test]
    async fn test_close_frame_carries_no_payload() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sid = Sid::generate(&SystemEntropy);
        Frame::close(sid).write(&mut a).await.unwrap();
        drop(a);

        let frame = Frame::read(&mut b).await.unwrap();
        assert_eq!(frame.code, FrameCode::Close);
        assert!(frame.payload.is_empty());

        // CLOSE is exactly sid + code on the wire, so the pipe is drained.
        let mut rest = Vec::new();
        use tokio::io::AsyncReadExt;
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_code_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        a.write_all(&[0u8; SID_LEN]).await.unwrap();
        a.write_all(&[9]).await.unwrap();

        let err = Frame::read(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
