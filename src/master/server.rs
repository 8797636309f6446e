//! Socket master: downstream registration, upstream listeners, routing

use super::http::{self, HttpRequest};
use super::protocol::{self, HandshakeResponse, SocketDefinition};
use super::tls;
use super::MasterError;
use crate::mux::{Multiplexer, MuxError, MuxStream};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}
type BoxedIo = Box<dyn Io>;

struct Downstream {
    id: u64,
    mux: Multiplexer,
    definition: SocketDefinition,
}

struct Upstream {
    id: u64,
    address: String,
    port: u16,
    downstreams: RwLock<BTreeMap<u64, Arc<Downstream>>>,
    tls: RwLock<Option<TlsAcceptor>>,
    cancel: CancellationToken,
}

struct MasterInner {
    upstreams: Mutex<BTreeMap<u64, Arc<Upstream>>>,
    next_id: AtomicU64,
}

/// The socket master: accepts downstream control connections and publishes
/// their listeners.
pub struct SocketMaster {
    inner: Arc<MasterInner>,
}

impl Default for SocketMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketMaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MasterInner {
                upstreams: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Accept downstream control connections until the listener fails
    /// permanently. Transient accept errors back off exponentially, capped
    /// at one second.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MasterError> {
        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    backoff = ACCEPT_BACKOFF_START;
                    debug!(%peer, "downstream control connection");
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = MasterInner::handle_downstream(inner, conn).await {
                            warn!("downstream setup failed: {}", e);
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close every upstream listener and downstream session.
    pub async fn close(&self) {
        let upstreams = std::mem::take(&mut *self.inner.upstreams.lock().await);
        for upstream in upstreams.values() {
            upstream.shutdown().await;
        }
    }
}

impl MasterInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn remove_upstream(&self, id: u64) {
        self.upstreams.lock().await.remove(&id);
    }

    /// Register one downstream: handshake, multiplex the control
    /// connection, then attach to (or bind) the matching upstream.
    async fn handle_downstream(
        inner: Arc<MasterInner>,
        mut conn: TcpStream,
    ) -> Result<(), MasterError> {
        let request = protocol::read_handshake_request(&mut conn).await?;
        protocol::write_handshake_response(&mut conn, &HandshakeResponse::ok()).await?;

        let definition = request.socket_definition;
        let address = definition.address.clone();
        let port = definition.port;

        // The master is the dialer side: it opens streams, the agent accepts.
        let mux = Multiplexer::new(conn);
        let downstream = Arc::new(Downstream {
            id: inner.next_id(),
            mux,
            definition,
        });

        let mut upstreams = inner.upstreams.lock().await;
        let mut found = None;
        for upstream in upstreams.values() {
            if upstream.address == address && upstream.port == port {
                found = Some(upstream.clone());
                break;
            }
        }
        let upstream = match found {
            Some(upstream) => upstream,
            None => {
                let bind_addr = format!("{}:{}", address, port);
                let listener = match TcpListener::bind(&bind_addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!("failed to bind upstream listener {}: {}", bind_addr, e);
                        downstream.mux.close();
                        return Err(e.into());
                    }
                };
                info!(%bind_addr, "bound upstream listener");
                let upstream = Arc::new(Upstream {
                    id: inner.next_id(),
                    address,
                    port,
                    downstreams: RwLock::new(BTreeMap::new()),
                    tls: RwLock::new(None),
                    cancel: CancellationToken::new(),
                });
                upstreams.insert(upstream.id, upstream.clone());
                let inner = inner.clone();
                let looped = upstream.clone();
                tokio::spawn(async move {
                    looped.clone().accept_loop(listener).await;
                    inner.remove_upstream(looped.id).await;
                });
                upstream
            }
        };
        drop(upstreams);

        upstream
            .downstreams
            .write()
            .await
            .insert(downstream.id, downstream);
        upstream.rebuild_tls().await;
        Ok(())
    }
}

impl Upstream {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            let conn = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((conn, _)) => {
                        backoff = ACCEPT_BACKOFF_START;
                        conn
                    }
                    Err(e) if is_transient(&e) => {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                        continue;
                    }
                    Err(e) => {
                        warn!("upstream {}:{} accept failed: {}", self.address, self.port, e);
                        break;
                    }
                },
            };
            let upstream = self.clone();
            tokio::spawn(async move { upstream.route(conn).await });
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let downstreams = std::mem::take(&mut *self.downstreams.write().await);
        for downstream in downstreams.values() {
            downstream.mux.close();
        }
    }

    /// Detach one downstream; the last departure closes the listener.
    async fn close_downstream(&self, id: u64) {
        let removed = self.downstreams.write().await.remove(&id);
        if let Some(downstream) = removed {
            downstream.mux.close();
        }
        if self.downstreams.read().await.is_empty() {
            self.cancel.cancel();
        } else {
            self.rebuild_tls().await;
        }
    }

    /// Recompute the TLS configuration as the union of every certificate
    /// the current downstream set contributes.
    async fn rebuild_tls(&self) {
        let pairs: Vec<(String, String)> = self
            .downstreams
            .read()
            .await
            .values()
            .filter_map(|d| {
                d.definition
                    .tls
                    .as_ref()
                    .map(|t| (t.cert.clone(), t.key.clone()))
            })
            .collect();
        let acceptor = match tls::build_server_config(&pairs) {
            Ok(Some(config)) => Some(TlsAcceptor::from(Arc::new(config))),
            Ok(None) => None,
            Err(e) => {
                warn!("failed to compose TLS config: {}", e);
                None
            }
        };
        *self.tls.write().await = acceptor;
    }

    async fn route(self: Arc<Self>, conn: TcpStream) {
        let (acceptor, candidates) = {
            let downstreams = self.downstreams.read().await;
            let candidates: Vec<Arc<Downstream>> = downstreams.values().cloned().collect();
            (self.tls.read().await.clone(), candidates)
        };
        if candidates.is_empty() {
            return;
        }

        let conn: BoxedIo = match acceptor {
            Some(acceptor) => match acceptor.accept(conn).await {
                Ok(stream) => Box::new(stream),
                Err(e) => {
                    debug!("tls handshake failed: {}", e);
                    return;
                }
            },
            None => Box::new(conn),
        };

        let use_http = candidates.iter().any(|d| d.definition.http.is_some());
        if use_http {
            if let Err(e) = self.route_http(conn).await {
                debug!("http routing ended: {}", e);
            }
        } else {
            self.route_raw(conn, candidates[0].clone()).await;
        }
    }

    /// HTTP mode: parse requests off the connection one at a time and
    /// proxy each through the first downstream whose rule matches. The
    /// connection stays open across requests; only switching downstreams
    /// closes the previously held stream. Superseded streams to the same
    /// downstream stay open until the connection ends.
    async fn route_http(&self, conn: BoxedIo) -> Result<(), MasterError> {
        let (read_half, mut write_half) = tokio::io::split(conn);
        let mut reader = BufReader::new(read_half);
        let mut last: Option<(u64, MuxStream)> = None;
        let mut superseded: Vec<MuxStream> = Vec::new();

        let result = loop {
            let request = match http::read_request(&mut reader).await {
                Ok(Some(request)) => request,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let Some(downstream) = self.find_downstream(&request).await else {
                let response = http::encode_response(&http::not_found());
                break match write_half.write_all(&response).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.into()),
                };
            };

            if let Some((previous_id, mut previous)) = last.take() {
                if previous_id != downstream.id {
                    let _ = previous.shutdown().await;
                } else {
                    superseded.push(previous);
                }
            }

            let mut stream = match downstream.mux.open() {
                Ok(stream) => stream,
                Err(e) => {
                    self.drop_dead_downstream(downstream.id, &e).await;
                    break Err(e.into());
                }
            };
            if let Err(e) = stream.write_all(&http::encode_request(&request)).await {
                break Err(e.into());
            }
            if let Err(e) = stream.flush().await {
                break Err(e.into());
            }

            let response = {
                let mut stream_reader = BufReader::new(&mut stream);
                match http::read_response(&mut stream_reader, &request.method).await {
                    Ok(response) => response,
                    Err(e) => break Err(e),
                }
            };
            if let Err(e) = write_half
                .write_all(&http::encode_response(&response))
                .await
            {
                break Err(e.into());
            }

            last = Some((downstream.id, stream));
        };

        if let Some((_, mut stream)) = last.take() {
            let _ = stream.shutdown().await;
        }
        for mut stream in superseded {
            let _ = stream.shutdown().await;
        }
        result
    }

    async fn find_downstream(&self, request: &HttpRequest) -> Option<Arc<Downstream>> {
        let downstreams = self.downstreams.read().await;
        for downstream in downstreams.values() {
            if let Some(rule) = &downstream.definition.http {
                if request.host.ends_with(&rule.domain_suffix)
                    && request.path.starts_with(&rule.path_prefix)
                {
                    return Some(downstream.clone());
                }
            }
        }
        None
    }

    /// Raw mode: one fresh stream, bytes copied both ways until either
    /// side finishes, then both ends are torn down.
    // TODO: rotate across downstreams instead of always taking the first
    async fn route_raw(&self, conn: BoxedIo, downstream: Arc<Downstream>) {
        let stream = match downstream.mux.open() {
            Ok(stream) => stream,
            Err(e) => {
                self.drop_dead_downstream(downstream.id, &e).await;
                return;
            }
        };

        let (mut conn_read, mut conn_write) = tokio::io::split(conn);
        let (mut stream_read, mut stream_write) = tokio::io::split(stream);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

        let done = done_tx.clone();
        let inbound = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut conn_read, &mut stream_write).await;
            let _ = stream_write.shutdown().await;
            let _ = done.send(()).await;
        });
        let outbound = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stream_read, &mut conn_write).await;
            let _ = conn_write.shutdown().await;
            let _ = done_tx.send(()).await;
        });

        // First direction to finish tears the whole relay down.
        let _ = done_rx.recv().await;
        inbound.abort();
        outbound.abort();
    }

    async fn drop_dead_downstream(&self, id: u64, err: &MuxError) {
        warn!("failed to open stream on downstream {}: {}", id, err);
        if matches!(err, MuxError::Closed) {
            self.close_downstream(id).await;
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
