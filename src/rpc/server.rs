//! JSON-RPC server: a handler registry and a pipelined serve loop

use super::codec::{JsonRequestSource, JsonResponseSink, RequestSource, ResponseSink};
use super::{
    ErrorObject, Request, Response, RpcError, CODE_HANDLER_FAILED, CODE_UNKNOWN_METHOD,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::debug;

/// Error a handler reports back to its caller as a 4500 response.
#[derive(Debug)]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// A registered method implementation.
pub type Handler = Arc<dyn Fn(&[Value]) -> Result<Value, HandlerError> + Send + Sync>;

/// Method dispatch table plus the serve loop.
///
/// Handlers may be registered at any time, including while serving.
pub struct Server {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Register `handler` under `method`, replacing any previous one.
    pub fn handle<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(method.into(), Arc::new(handler));
    }

    fn dispatch(&self, request: Request) -> Response {
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&request.method)
            .cloned();
        match handler {
            None => Response {
                result: None,
                error: Some(ErrorObject {
                    code: CODE_UNKNOWN_METHOD,
                    message: "unknown method".into(),
                }),
                id: request.id,
            },
            Some(handler) => match handler(&request.params) {
                Ok(value) => Response {
                    result: Some(value),
                    error: None,
                    id: request.id,
                },
                Err(e) => Response {
                    result: None,
                    error: Some(ErrorObject {
                        code: CODE_HANDLER_FAILED,
                        message: e.0,
                    }),
                    id: request.id,
                },
            },
        }
    }

    /// Serve until the transport ends.
    ///
    /// Decode, dispatch, and encode run as three pipeline stages connected
    /// by bounded queues; the first failing stage ends the loop. A clean
    /// end of stream returns `Ok`.
    pub async fn serve<S, K>(self: Arc<Self>, mut source: S, mut sink: K) -> Result<(), RpcError>
    where
        S: RequestSource + 'static,
        K: ResponseSink + 'static,
    {
        let (req_tx, mut req_rx) = mpsc::channel::<Request>(1);
        let (res_tx, mut res_rx) = mpsc::channel::<Response>(1);
        let (err_tx, mut err_rx) = mpsc::channel::<Option<RpcError>>(3);

        let decode_err = err_tx.clone();
        let decode = tokio::spawn(async move {
            loop {
                match source.read_request().await {
                    Ok(Some(request)) => {
                        if req_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = decode_err.send(None).await;
                        break;
                    }
                    Err(e) => {
                        let _ = decode_err.send(Some(e)).await;
                        break;
                    }
                }
            }
        });

        let server = self.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                let response = server.dispatch(request);
                if res_tx.send(response).await.is_err() {
                    break;
                }
            }
        });

        let encode = tokio::spawn(async move {
            while let Some(response) = res_rx.recv().await {
                if let Err(e) = sink.write_response(response).await {
                    let _ = err_tx.send(Some(e)).await;
                    break;
                }
            }
        });

        let outcome = err_rx.recv().await.flatten();
        decode.abort();
        dispatch.abort();
        encode.abort();
        match outcome {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Serve a raw byte stream with the JSON codec.
    pub async fn serve_stream<T>(self: Arc<Self>, io: T) -> Result<(), RpcError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        self.serve(
            JsonRequestSource::new(read_half),
            JsonResponseSink::new(write_half),
        )
        .await
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), RpcError> {
        loop {
            let (conn, peer) = listener.accept().await?;
            debug!(%peer, "rpc connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_stream(conn).await {
                    debug!("rpc connection ended: {}", e);
                }
            });
        }
    }
}
