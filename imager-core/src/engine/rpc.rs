//! aria2 JSON-RPC wire types and the HTTP transport that carries them
//! (§4.D). aria2 is the concrete reference engine; nothing outside this
//! file depends on its wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Serialize)]
pub struct Request {
    jsonrpc: &'static str,
    id: String,
    method: String,
    params: Vec<Value>,
}

/// A JSON-RPC 2.0 response envelope (untagged success/error).
#[derive(Debug, Deserialize)]
pub struct Response {
    /// The call's result, if it succeeded.
    #[serde(default)]
    pub result: Option<Value>,
    /// The call's error, if it failed.
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// A JSON-RPC error object.
#[derive(Debug, Deserialize)]
pub struct RpcError {
    /// aria2's numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

/// Thin HTTP transport for aria2's JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct Transport {
    endpoint: String,
    secret: String,
    client: reqwest::Client,
}

/// Errors raised by a single RPC call.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The HTTP request itself failed.
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The RPC endpoint returned malformed JSON.
    #[error("rpc response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// aria2 reported an RPC-level error.
    #[error("rpc error {code}: {message}")]
    Remote {
        /// aria2's numeric error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
}

impl Transport {
    /// Builds a transport targeting `http://127.0.0.1:<port>/jsonrpc`.
    #[must_use]
    pub fn new(port: u16, secret: String) -> Self {
        Self {
            endpoint: format!("http://127.0.0.1:{port}/jsonrpc"),
            secret,
            client: reqwest::Client::new(),
        }
    }

    /// Issues `method` with `params` (the secret token is prepended
    /// automatically) and returns the decoded result value.
    pub async fn call(&self, method: &str, mut params: Vec<Value>) -> Result<Value, Error> {
        params.insert(0, Value::String(format!("token:{}", self.secret)));
        let request = Request {
            jsonrpc: "2.0",
            id: uuid_like_id(),
            method: method.to_owned(),
            params,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .json::<Response>()
            .await?;

        if let Some(err) = resp.error {
            return Err(Error::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}

/// A locally unique id string; aria2 echoes it back but otherwise ignores
/// its shape, so we avoid pulling in a dedicated uuid dependency for it.
fn uuid_like_id() -> String {
    format!("imager-{:016x}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_without_error_has_no_remote_error() {
        let resp: Response = serde_json::from_str(r#"{"id":"1","jsonrpc":"2.0","result":"gid"}"#)
            .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.result, Some(Value::String("gid".to_owned())));
    }

    #[test]
    fn response_with_error_decodes() {
        let resp: Response = serde_json::from_str(
            r#"{"id":"1","jsonrpc":"2.0","error":{"code":1,"message":"boom"}}"#,
        )
        .unwrap();
        assert_eq!(resp.error.unwrap().code, 1);
    }
}
