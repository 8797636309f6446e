//! One logical byte stream inside a multiplexer

use super::multiplexer::{MuxShared, WireCmd};
use super::Sid;
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

pub(crate) enum StreamMsg {
    Data(Bytes),
    Close,
}

/// A multiplexed stream.
///
/// Implements `AsyncRead`/`AsyncWrite`: every `write` becomes one DATA
/// frame, `shutdown` performs the idempotent local close and emits a single
/// CLOSE frame. Reads return EOF once the peer closes the stream or the
/// multiplexer shuts down. Dropping an unclosed stream unregisters it and
/// sends the CLOSE on a best-effort basis; prefer an explicit shutdown.
pub struct MuxStream {
    sid: Sid,
    in_rx: mpsc::Receiver<StreamMsg>,
    wire: PollSender<WireCmd>,
    shared: Arc<MuxShared>,
    remote_closed: Arc<AtomicBool>,
    residue: Bytes,
    read_eof: bool,
    closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        sid: Sid,
        in_rx: mpsc::Receiver<StreamMsg>,
        shared: Arc<MuxShared>,
        remote_closed: Arc<AtomicBool>,
    ) -> Self {
        let wire = PollSender::new(shared.wire_tx.clone());
        Self {
            sid,
            in_rx,
            wire,
            shared,
            remote_closed,
            residue: Bytes::new(),
            read_eof: false,
            closed: false,
        }
    }

    /// This stream's identifier.
    pub fn sid(&self) -> &Sid {
        &self.sid
    }
}

impl AsyncRead for MuxStream {
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
            if me.read_eof || me.closed {
                return Poll::Ready(Ok(()));
            }
            match me.in_rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) | Poll::Ready(Some(StreamMsg::Close)) => {
                    me.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(StreamMsg::Data(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(out.remaining());
                    out.put_slice(&data[..n]);
                    if n < data.len() {
                        me.residue = data.slice(n..);
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if me.closed || me.remote_closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match me.wire.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Ok(())) => {
                let payload = Bytes::copy_from_slice(data);
                let n = payload.len();
                if me.wire.send_item(WireCmd::Data(me.sid, payload)).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer task flushes the transport after every frame.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.closed {
            return Poll::Ready(Ok(()));
        }
        if me.remote_closed.load(Ordering::Acquire) {
            // The peer closed first; there is nothing to announce.
            me.shared.unregister(me.sid);
            me.closed = true;
            return Poll::Ready(Ok(()));
        }
        match me.wire.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => {
                // Multiplexer already gone.
                me.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(())) => {
                let _ = me.wire.send_item(WireCmd::Close(me.sid));
                me.shared.unregister(me.sid);
                me.closed = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.unregister(self.sid);
            if !self.remote_closed.load(Ordering::Acquire) {
                let _ = self.shared.wire_tx.try_send(WireCmd::Close(self.sid));
            }
        }
    }
}
