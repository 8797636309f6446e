//! Multiplexer core: dispatch, accept queue, and the shared stream table

use super::frame::{Frame, FrameCode};
use super::stream::{MuxStream, StreamMsg};
use super::{MuxError, Sid};
use crate::secure::{EntropySource, SystemEntropy};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outbound wire commands funneled through the writer task, which owns the
/// transport's write half and serializes frames so they never interleave.
pub(crate) enum WireCmd {
    Data(Sid, Bytes),
    Close(Sid),
}

struct StreamSlot {
    tx: mpsc::Sender<StreamMsg>,
    remote_closed: Arc<AtomicBool>,
}

pub(crate) struct MuxState {
    streams: HashMap<Sid, StreamSlot>,
    accept_tx: Option<mpsc::Sender<MuxStream>>,
    closed: bool,
}

pub(crate) struct MuxShared {
    state: Mutex<MuxState>,
    pub(crate) wire_tx: mpsc::Sender<WireCmd>,
    cancel: CancellationToken,
}

impl MuxShared {
    /// Remove a stream from the table. Safe to call at any time, including
    /// while the multiplexer itself is closing; a missing entry is a no-op.
    pub(crate) fn unregister(&self, sid: Sid) {
        let mut state = self.state.lock().unwrap();
        state.streams.remove(&sid);
    }

    /// Tear the multiplexer down: stop dispatch and the writer, close every
    /// registered stream, and wake pending acceptors. Idempotent.
    pub(crate) fn close(&self) {
        let streams = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.accept_tx = None;
            std::mem::take(&mut state.streams)
        };
        for slot in streams.values() {
            slot.remote_closed.store(true, Ordering::Release);
        }
        // Dropping the slots drops the inbound senders; pending stream
        // reads observe EOF once dispatch lets go of its clones.
        drop(streams);
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// Stream multiplexer over a single reliable byte stream.
///
/// Cheap to clone; all clones drive the same underlying transport. One
/// dedicated task dispatches inbound frames, another serializes outbound
/// writes. Closing is idempotent and tears both down.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
    entropy: Arc<dyn EntropySource>,
}

impl Multiplexer {
    /// Start a multiplexer over `io`.
    pub fn new<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_entropy(io, Arc::new(SystemEntropy))
    }

    /// Like [`new`](Multiplexer::new) with an explicit entropy source for
    /// stream id generation.
    pub fn with_entropy<S>(io: S, entropy: Arc<dyn EntropySource>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (wire_tx, wire_rx) = mpsc::channel(1);
        let (accept_tx, accept_rx) = mpsc::channel(1);
        let shared = Arc::new(MuxShared {
            state: Mutex::new(MuxState {
                streams: HashMap::new(),
                accept_tx: Some(accept_tx),
                closed: false,
            }),
            wire_tx,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_dispatch(shared.clone(), read_half));
        tokio::spawn(run_writer(shared.clone(), wire_rx, write_half));
        Self {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
            entropy,
        }
    }

    /// Open a new outbound stream. Nothing is sent on the wire until the
    /// stream's first write; the peer learns the id from that frame.
    pub fn open(&self) -> Result<MuxStream, MuxError> {
        let sid = Sid::generate(&*self.entropy);
        let (tx, rx) = mpsc::channel(1);
        let remote_closed = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(MuxError::Closed);
            }
            state.streams.insert(
                sid,
                StreamSlot {
                    tx,
                    remote_closed: remote_closed.clone(),
                },
            );
        }
        Ok(MuxStream::new(sid, rx, self.shared.clone(), remote_closed))
    }

    /// Wait for the next stream opened by the peer. Returns
    /// [`MuxError::Closed`] once the multiplexer shuts down.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(MuxError::Closed)
    }

    /// Shut down: dispatch stops, all streams observe EOF, pending and
    /// future accepts fail, the transport is released. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

async fn run_dispatch<R>(shared: Arc<MuxShared>, read_half: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = Frame::read(&mut reader) => match res {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("mux dispatch ended: {}", e);
                    break;
                }
            },
        };

        // Look the stream up, creating it on first sight of its id. The
        // fresh stream goes to the accept queue before its first frame is
        // delivered, CLOSE included, so acceptors always see a correctly
        // terminated stream rather than a ghost.
        let (slot_tx, remote_closed, fresh) = {
            let mut state = shared.state.lock().unwrap();
            if state.closed {
                break;
            }
            let existing = state
                .streams
                .get(&frame.sid)
                .map(|slot| (slot.tx.clone(), slot.remote_closed.clone()));
            match existing {
                Some((tx, remote_closed)) => (tx, remote_closed, None),
                None => {
                    let (tx, rx) = mpsc::channel(1);
                    let remote_closed = Arc::new(AtomicBool::new(false));
                    state.streams.insert(
                        frame.sid,
                        StreamSlot {
                            tx: tx.clone(),
                            remote_closed: remote_closed.clone(),
                        },
                    );
                    let stream =
                        MuxStream::new(frame.sid, rx, shared.clone(), remote_closed.clone());
                    let accept_tx = state.accept_tx.clone();
                    (tx, remote_closed, accept_tx.map(|atx| (atx, stream)))
                }
            }
        };

        if let Some((accept_tx, stream)) = fresh {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                res = accept_tx.send(stream) => {
                    // A dropped acceptor drops the stream, which closes it.
                    let _ = res;
                }
            }
        }

        match frame.code {
            FrameCode::Data => {
                // An unbuffered rendezvous: a slow reader blocks dispatch
                // for every stream on this multiplexer.
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    res = slot_tx.send(StreamMsg::Data(frame.payload)) => {
                        // Send failure means the stream closed locally; the
                        // frame is simply dropped.
                        let _ = res;
                    }
                }
            }
            FrameCode::Close => {
                remote_closed.store(true, Ordering::Release);
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    res = slot_tx.send(StreamMsg::Close) => { let _ = res; }
                }
                shared.unregister(frame.sid);
            }
        }
    }
    shared.close();
}

async fn run_writer<W>(shared: Arc<MuxShared>, mut wire_rx: mpsc::Receiver<WireCmd>, mut w: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let cmd = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            cmd = wire_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        let frame = match cmd {
            WireCmd::Data(sid, payload) => Frame::data(sid, payload),
            WireCmd::Close(sid) => Frame::close(sid),
        };
        if let Err(e) = frame.write(&mut w).await {
            debug!("mux writer ended: {}", e);
            break;
        }
    }
    let _ = w.shutdown().await;
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::SID_LEN;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_sends_nothing_until_write() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mux = Multiplexer::new(a);
        let _stream = mux.open().unwrap();

        // Nothing must arrive on the raw side.
        let mut buf = [0u8; 1];
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            b.read(&mut buf),
        )
        .await;
        assert!(res.is_err(), "no frame expected before first write");
        mux.close();
    }

    #[tokio::test]
    async fn test_double_close_emits_one_close_frame() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mux = Multiplexer::new(a);
        let mut stream = mux.open().unwrap();
        stream.write_all(b"x").await.unwrap();
        stream.shutdown().await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        // Raw side: one DATA frame then exactly one CLOSE frame.
        let frame = Frame::read(&mut b).await.unwrap();
        assert_eq!(frame.code, FrameCode::Data);
        let frame = Frame::read(&mut b).await.unwrap();
        assert_eq!(frame.code, FrameCode::Close);

        let mut rest = [0u8; SID_LEN];
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            b.read(&mut rest),
        )
        .await;
        assert!(res.is_err(), "no second CLOSE expected");
        mux.close();
    }

    #[tokio::test]
    async fn test_close_wakes_acceptor() {
        let (a, _b) = tokio::io::duplex(4096);
        let mux = Multiplexer::new(a);
        let waiter = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.accept().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mux.close();
        assert!(matches!(waiter.await.unwrap(), Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (a, _b) = tokio::io::duplex(4096);
        let mux = Multiplexer::new(a);
        mux.close();
        assert!(matches!(mux.open(), Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_zero_data_stream_accepts_as_terminated() {
        let (a, b) = tokio::io::duplex(4096);
        let left = Multiplexer::new(a);
        let right = Multiplexer::new(b);

        // Open and close without writing: the only frame is CLOSE, so the
        // peer sees a fresh stream that immediately EOFs.
        let mut stream = left.open().unwrap();
        stream.shutdown().await.unwrap();

        let mut accepted = right.accept().await.unwrap();
        let mut buf = Vec::new();
        accepted.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        left.close();
        right.close();
    }

    #[tokio::test]
    async fn test_residue_on_short_read() {
        let (a, b) = tokio::io::duplex(4096);
        let left = Multiplexer::new(a);
        let right = Multiplexer::new(b);

        let mut stream = left.open().unwrap();
        stream.write_all(b"abcdefgh").await.unwrap();

        let mut accepted = right.accept().await.unwrap();
        let mut buf = [0u8; 3];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        let mut rest = [0u8; 5];
        accepted.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"defgh");

        left.close();
        right.close();
    }
}
