//! Byte-stream adapter over an authenticated session
//!
//! Presents a [`Session`](super::Session) as an ordinary `AsyncRead +
//! AsyncWrite` connection. Each `write` seals its buffer as exactly one
//! session frame; callers issuing many small writes pay per-frame overhead,
//! and buffering is theirs to do. Reads deliver plaintext from inbound
//! frames, keeping any tail that does not fit the caller's buffer as
//! residue for the next read.

use super::session::SessionCrypto;
use super::SecureError;
use crate::framing::{LEN_PREFIX, MAX_MESSAGE_SIZE, NONCE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const HEADER_LEN: usize = NONCE_LEN + LEN_PREFIX;

enum ReadState {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Body { nonce: [u8; NONCE_LEN], buf: Vec<u8>, filled: usize },
}

/// Reliable byte stream over a sealed session.
pub struct SecureStream<T> {
    io: T,
    crypto: SessionCrypto,
    read: ReadState,
    residue: Bytes,
    write_buf: BytesMut,
    eof: bool,
}

impl<T> SecureStream<T> {
    pub(crate) fn new(io: T, crypto: SessionCrypto) -> Self {
        Self {
            io,
            crypto,
            read: ReadState::Header {
                buf: [0u8; HEADER_LEN],
                filled: 0,
            },
            residue: Bytes::new(),
            write_buf: BytesMut::new(),
            eof: false,
        }
    }
}

fn crypto_err(err: SecureError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl<T: AsyncRead + Unpin> AsyncRead for SecureStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.residue.is_empty() {
                let n = me.residue.len().min(out.remaining());
                out.put_slice(&me.residue[..n]);
                me.residue.advance(n);
                return Poll::Ready(Ok(()));
            }
            if me.eof {
                return Poll::Ready(Ok(()));
            }
            match &mut me.read {
                ReadState::Header { buf, filled } => {
                    let mut chunk = ReadBuf::new(&mut buf[*filled..]);
                    match Pin::new(&mut me.io).poll_read(cx, &mut chunk) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {
                            let n = chunk.filled().len();
                            if n == 0 {
                                if *filled == 0 {
                                    // Clean EOF between frames.
                                    me.eof = true;
                                    return Poll::Ready(Ok(()));
                                }
                                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                            }
                            *filled += n;
                            if *filled == HEADER_LEN {
                                let mut nonce = [0u8; NONCE_LEN];
                                nonce.copy_from_slice(&buf[..NONCE_LEN]);
                                let len = u64::from_be_bytes(
                                    buf[NONCE_LEN..].try_into().expect("header layout"),
                                );
                                if len > MAX_MESSAGE_SIZE as u64 {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "oversized session frame",
                                    )));
                                }
                                me.read = ReadState::Body {
                                    nonce,
                                    buf: vec![0u8; len as usize],
                                    filled: 0,
                                };
                            }
                        }
                    }
                }
                ReadState::Body { nonce, buf, filled } if *filled == buf.len() => {
                    let nonce = *nonce;
                    let sealed = std::mem::take(buf);
                    me.read = ReadState::Header {
                        buf: [0u8; HEADER_LEN],
                        filled: 0,
                    };
                    let plaintext = me.crypto.open(nonce, &sealed).map_err(crypto_err)?;
                    me.residue = Bytes::from(plaintext);
                    // Loop: deliver the residue, or read on if it was empty.
                }
                ReadState::Body { buf, filled, .. } => {
                    let mut chunk = ReadBuf::new(&mut buf[*filled..]);
                    match Pin::new(&mut me.io).poll_read(cx, &mut chunk) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {
                            let n = chunk.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                            }
                            *filled += n;
                        }
                    }
                }
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> SecureStream<T> {
    fn drive_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.write_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.write_buf.advance(n);
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for SecureStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        // The previous frame must be fully queued out before sealing the
        // next one; otherwise nonces and bytes interleave.
        match me.drive_write(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        let (nonce, sealed) = me.crypto.seal(data).map_err(crypto_err)?;
        me.write_buf.reserve(HEADER_LEN + sealed.len());
        me.write_buf.put_slice(nonce.as_bytes());
        me.write_buf.put_u64(sealed.len() as u64);
        me.write_buf.put_slice(&sealed);
        // Opportunistically push the frame out; completion belongs to flush.
        if let Poll::Ready(Err(e)) = me.drive_write(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match me.drive_write(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut me.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use crate::secure::{KeyPair, Session, SessionConfig, SystemEntropy};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn stream_pair() -> (
        super::SecureStream<DuplexStream>,
        super::SecureStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let left_keys = KeyPair::generate(&SystemEntropy);
        let right_keys = KeyPair::generate(&SystemEntropy);
        let left_config = SessionConfig::new(left_keys.clone(), vec![right_keys.public.clone()]);
        let right_config = SessionConfig::new(right_keys, vec![left_keys.public]);

        let left = tokio::spawn(async move { Session::handshake(a, &left_config).await.unwrap() });
        let right = Session::handshake(b, &right_config).await.unwrap();
        (left.await.unwrap().into_stream(), right.into_stream())
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut left, mut right) = stream_pair().await;
        left.write_all(b"Hello World").await.unwrap();
        left.flush().await.unwrap();

        let mut buf = [0u8; 32];
        let n = right.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello World");
    }

    #[tokio::test]
    async fn test_partial_read_keeps_residue() {
        let (mut left, mut right) = stream_pair().await;
        left.write_all(b"0123456789").await.unwrap();
        left.flush().await.unwrap();

        let mut head = [0u8; 4];
        right.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"0123");

        let mut tail = [0u8; 6];
        right.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"456789");
    }

    #[tokio::test]
    async fn test_eof_propagates() {
        let (mut left, mut right) = stream_pair().await;
        left.write_all(b"bye").await.unwrap();
        left.shutdown().await.unwrap();
        drop(left);

        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}
