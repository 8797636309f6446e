//! JSON-RPC client and server
//!
//! Request/response correlation by monotonically increasing integer id,
//! method dispatch by name. The wire format is a plain stream of JSON
//! objects, newline-agnostic; the decoder simply reads one object at a
//! time. Reserved error codes: 4404 (unknown method), 4500 (handler
//! error), 0 (transport or encoding failure).

mod client;
mod codec;
mod server;

pub use client::Client;
pub use codec::{JsonReader, JsonRequestSource, JsonResponseSink, JsonWriter};
pub use codec::{RequestSource, ResponseSink};
pub use server::{Handler, HandlerError, Server};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Transport or encoding failure surfaced to a caller
pub const CODE_TRANSPORT: i64 = 0;

/// No handler registered for the requested method
pub const CODE_UNKNOWN_METHOD: i64 = 4404;

/// The handler ran and reported an error
pub const CODE_HANDLER_FAILED: i64 = 4500;

/// RPC layer errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("client closed")]
    Closed,
}

/// Error object carried inside a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// A single call: method name, positional params, caller-assigned id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub id: u64,
}

/// The answer to a request, correlated by id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = Request {
            method: "Add".into(),
            params: vec![1.into(), 2.into()],
            id: 7,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"method":"Add","params":[1,2],"id":7}"#);
    }

    #[test]
    fn test_response_error_omitted_when_absent() {
        let res = Response {
            result: Some(6.into()),
            error: None,
            id: 7,
        };
        let json = serde_json::to_string(&res).unwrap();
        assert!(!json.contains("error"));

        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        assert!(back.error.is_none());
    }
}
