//! JSON-RPC client
//!
//! A writer task assigns increasing ids starting at 1 and keeps the table
//! of callers awaiting responses; a reader task decodes responses and
//! delivers them by id. Responses with unknown ids are dropped. A broken
//! transport marks the client permanently failed and every later call gets
//! the transport error immediately.

use super::codec::{JsonReader, JsonWriter};
use super::{Request, Response, RpcError, CODE_TRANSPORT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct Pending {
    method: String,
    params: Vec<Value>,
    done: oneshot::Sender<Result<Response, String>>,
}

/// Handle for issuing calls. Cloneable; calls may be made concurrently.
#[derive(Clone)]
pub struct Client {
    req_tx: mpsc::Sender<Pending>,
}

impl Client {
    /// Build a client on top of an established connection.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (req_tx, req_rx) = mpsc::channel(1);
        let (res_tx, res_rx) = mpsc::channel(1);
        tokio::spawn(run_reader(JsonReader::new(read_half), res_tx));
        tokio::spawn(run_writer(JsonWriter::new(write_half), req_rx, res_rx));
        Self { req_tx }
    }

    /// Connect to an RPC server over TCP.
    pub async fn dial<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }

    /// Call `method` with positional `params`, decoding the result.
    ///
    /// Remote errors surface as [`RpcError::Remote`] with the server's
    /// code; transport failures use code 0.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, RpcError> {
        let (done, wait) = oneshot::channel();
        self.req_tx
            .send(Pending {
                method: method.to_string(),
                params,
                done,
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        let response = wait
            .await
            .map_err(|_| RpcError::Closed)?
            .map_err(|message| RpcError::Remote {
                code: CODE_TRANSPORT,
                message,
            })?;
        if let Some(error) = response.error {
            return Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}

async fn run_reader<R>(mut reader: JsonReader<R>, res_tx: mpsc::Sender<Response>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next::<Response>().await {
            Ok(Some(response)) => {
                if res_tx.send(response).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("rpc client reader ended: {}", e);
                break;
            }
        }
    }
}

async fn run_writer<W>(
    mut writer: JsonWriter<W>,
    mut req_rx: mpsc::Receiver<Pending>,
    mut res_rx: mpsc::Receiver<Response>,
) where
    W: AsyncWrite + Unpin,
{
    let mut next_id: u64 = 1;
    let mut waiting: HashMap<u64, oneshot::Sender<Result<Response, String>>> = HashMap::new();
    let mut broken: Option<String> = None;
    let mut reader_gone = false;
    loop {
        tokio::select! {
            pending = req_rx.recv() => {
                let Some(pending) = pending else { break };
                if let Some(message) = &broken {
                    let _ = pending.done.send(Err(message.clone()));
                    continue;
                }
                let request = Request {
                    method: pending.method,
                    params: pending.params,
                    id: next_id,
                };
                match writer.write(&request).await {
                    Ok(()) => {
                        waiting.insert(next_id, pending.done);
                        next_id += 1;
                    }
                    Err(e) => {
                        let message = e.to_string();
                        let _ = pending.done.send(Err(message.clone()));
                        broken = Some(message);
                    }
                }
            }
            response = res_rx.recv(), if !reader_gone => {
                match response {
                    Some(response) => {
                        // Unknown ids are silently dropped.
                        if let Some(done) = waiting.remove(&response.id) {
                            let _ = done.send(Ok(response));
                        }
                    }
                    None => {
                        reader_gone = true;
                        let message = "connection closed".to_string();
                        for (_, done) in waiting.drain() {
                            let _ = done.send(Err(message.clone()));
                        }
                        broken = Some(message);
                    }
                }
            }
        }
    }
}
