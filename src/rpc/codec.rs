//! JSON-over-byte-stream codec and the transport capability traits
//!
//! The server and client do not care where requests come from or where
//! responses go; they only need the two capabilities below. The JSON
//! adapters implement them over any tokio byte stream, and tests can
//! substitute in-memory mocks.

use super::{Request, Response, RpcError};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Capability to produce inbound requests.
#[async_trait]
pub trait RequestSource: Send {
    /// Next request, or `None` on clean end of stream.
    async fn read_request(&mut self) -> Result<Option<Request>, RpcError>;
}

/// Capability to deliver outbound responses.
#[async_trait]
pub trait ResponseSink: Send {
    async fn write_response(&mut self, response: Response) -> Result<(), RpcError>;
}

/// Incremental reader for a stream of JSON values.
pub struct JsonReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> JsonReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Decode the next JSON value, reading more bytes as needed. Returns
    /// `None` on a clean end of stream between values.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        loop {
            while let Some(&b) = self.buf.first() {
                if b.is_ascii_whitespace() {
                    self.buf.advance(1);
                } else {
                    break;
                }
            }
            if !self.buf.is_empty() {
                let outcome = {
                    let mut stream =
                        serde_json::Deserializer::from_slice(&self.buf[..]).into_iter::<T>();
                    match stream.next() {
                        Some(Ok(value)) => Some(Ok((value, stream.byte_offset()))),
                        // An EOF error just means the value is still arriving.
                        Some(Err(e)) if e.is_eof() => None,
                        Some(Err(e)) => Some(Err(e)),
                        None => None,
                    }
                };
                match outcome {
                    Some(Ok((value, consumed))) => {
                        self.buf.advance(consumed);
                        return Ok(Some(value));
                    }
                    Some(Err(e)) => return Err(RpcError::Codec(e)),
                    None => {}
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::Transport(io::ErrorKind::UnexpectedEof.into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Serializes values onto a byte stream, one JSON object per line.
pub struct JsonWriter<W> {
    io: W,
}

impl<W: AsyncWrite + Unpin> JsonWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io }
    }

    pub async fn write<T: Serialize>(&mut self, value: &T) -> Result<(), RpcError> {
        let mut data = serde_json::to_vec(value)?;
        data.push(b'\n');
        self.io.write_all(&data).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// [`RequestSource`] over a byte stream.
pub struct JsonRequestSource<R> {
    reader: JsonReader<R>,
}

impl<R: AsyncRead + Unpin> JsonRequestSource<R> {
    pub fn new(io: R) -> Self {
        Self {
            reader: JsonReader::new(io),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RequestSource for JsonRequestSource<R> {
    async fn read_request(&mut self) -> Result<Option<Request>, RpcError> {
        self.reader.next().await
    }
}

/// [`ResponseSink`] over a byte stream.
pub struct JsonResponseSink<W> {
    writer: JsonWriter<W>,
}

impl<W: AsyncWrite + Unpin> JsonResponseSink<W> {
    pub fn new(io: W) -> Self {
        Self {
            writer: JsonWriter::new(io),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for JsonResponseSink<W> {
    async fn write_response(&mut self, response: Response) -> Result<(), RpcError> {
        self.writer.write(&response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_concatenated_objects() {
        // No newlines at all; the decoder must still split values.
        let data = br#"{"method":"A","params":[],"id":1}{"method":"B","params":[1],"id":2}"#;
        let mut reader = JsonReader::new(&data[..]);
        let first: Request = reader.next().await.unwrap().unwrap();
        let second: Request = reader.next().await.unwrap().unwrap();
        assert_eq!(first.method, "A");
        assert_eq!(second.method, "B");
        assert!(reader.next::<Request>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_value_then_eof_is_error() {
        let data = br#"{"method":"A","par"#;
        let mut reader = JsonReader::new(&data[..]);
        assert!(reader.next::<Request>().await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_is_codec_error() {
        let data = b"not json at all";
        let mut reader = JsonReader::new(&data[..]);
        assert!(matches!(
            reader.next::<Request>().await,
            Err(RpcError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_reader_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = JsonWriter::new(a);
        let mut reader = JsonReader::new(b);

        writer
            .write(&Request {
                method: "Echo".into(),
                params: vec!["hi".into()],
                id: 42,
            })
            .await
            .unwrap();

        let got: Request = reader.next().await.unwrap().unwrap();
        assert_eq!(got.method, "Echo");
        assert_eq!(got.id, 42);
    }
}
