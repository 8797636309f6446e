//! Control-plane handshake
//!
//! Plain framed JSON over the downstream-initiated connection, before
//! multiplexing begins: a big-endian u64 length prefix followed by one
//! JSON document.

use super::MasterError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a control-plane message; PEM blobs ride in here.
const MAX_HANDSHAKE_LEN: u64 = 1024 * 1024;

/// What a downstream wants published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketDefinition {
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpDefinition>,
}

/// PEM certificate chain and private key contributed to the listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsDefinition {
    pub cert: String,
    pub key: String,
}

/// HTTP routing rule: match by host suffix and path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDefinition {
    pub domain_suffix: String,
    pub path_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub socket_definition: SocketDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub status: String,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

async fn read_json<R, T>(io: &mut R) -> Result<T, MasterError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let len = io.read_u64().await?;
    if len > MAX_HANDSHAKE_LEN {
        return Err(MasterError::Protocol(format!(
            "handshake message of {} bytes",
            len
        )));
    }
    let mut raw = vec![0u8; len as usize];
    io.read_exact(&mut raw).await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn write_json<W, T>(io: &mut W, value: &T) -> Result<(), MasterError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let raw = serde_json::to_vec(value)?;
    io.write_u64(raw.len() as u64).await?;
    io.write_all(&raw).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_handshake_request<R: AsyncRead + Unpin>(
    io: &mut R,
) -> Result<HandshakeRequest, MasterError> {
    read_json(io).await
}

pub async fn write_handshake_request<W: AsyncWrite + Unpin>(
    io: &mut W,
    request: &HandshakeRequest,
) -> Result<(), MasterError> {
    write_json(io, request).await
}

pub async fn read_handshake_response<R: AsyncRead + Unpin>(
    io: &mut R,
) -> Result<HandshakeResponse, MasterError> {
    read_json(io).await
}

pub async fn write_handshake_response<W: AsyncWrite + Unpin>(
    io: &mut W,
    response: &HandshakeResponse,
) -> Result<(), MasterError> {
    write_json(io, response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let request = HandshakeRequest {
            socket_definition: SocketDefinition {
                address: "127.0.0.1".into(),
                port: 8443,
                tls: None,
                http: Some(HttpDefinition {
                    domain_suffix: ".a.example".into(),
                    path_prefix: "/".into(),
                }),
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"socketDefinition\""));
        assert!(json.contains("\"domainSuffix\""));
        assert!(json.contains("\"pathPrefix\""));
        assert!(!json.contains("\"tls\""));
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = HandshakeRequest {
            socket_definition: SocketDefinition {
                address: "0.0.0.0".into(),
                port: 443,
                tls: Some(TlsDefinition {
                    cert: "CERT".into(),
                    key: "KEY".into(),
                }),
                http: None,
            },
        };
        write_handshake_request(&mut a, &request).await.unwrap();
        let got = read_handshake_request(&mut b).await.unwrap();
        assert_eq!(got, request);

        write_handshake_response(&mut b, &HandshakeResponse::ok())
            .await
            .unwrap();
        let response = read_handshake_response(&mut a).await.unwrap();
        assert!(response.is_ok());
    }
}
