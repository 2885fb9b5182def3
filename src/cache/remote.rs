//! REST key-value backend.
//!
//! Each operation is one `POST` of a JSON command array to the configured
//! URL, authenticated with a bearer token:
//!
//! | operation | body                               | `result`          |
//! |-----------|------------------------------------|-------------------|
//! | get       | `["GET", key]`                     | string or `null`  |
//! | set       | `["SET", key, value, "EX", secs]`  | `"OK"`            |
//! | del       | `["DEL", key]`                     | count             |
//! | keys      | `["KEYS", pattern]`                | array of strings  |
//!
//! Failures come back as `{"error": "..."}`. Every failure, including
//! transport errors and non-2xx statuses, is reported as
//! [`Error::CacheBackendUnavailable`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};

use super::CacheBackend;
use crate::config::RemoteCacheConfig;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RemoteBackend {
    client: reqwest::Client,
    url: Url,
    token: String,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend").field("url", &self.url.as_str()).finish_non_exhaustive()
    }
}

impl RemoteBackend {
    /// Resolve the token and build a client with the given request timeout.
    pub fn new(config: &RemoteCacheConfig, request_timeout: Duration) -> Result<Self> {
        let url = Url::parse(&config.url).map_err(|e| Error::InvalidConfig {
            message: format!("cache url '{}': {e}", config.url),
        })?;
        let token = config.token.resolve()?;
        let client = reqwest::Client::builder().timeout(request_timeout).build().map_err(|e| {
            Error::InvalidConfig { message: format!("cannot build cache client: {e}") }
        })?;
        Ok(Self { client, url, token })
    }

    async fn command(&self, command: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let reply: Reply = response.json().await.map_err(unavailable)?;
        if let Some(error) = reply.error {
            return Err(Error::CacheBackendUnavailable { message: error });
        }
        if !status.is_success() {
            return Err(Error::CacheBackendUnavailable { message: format!("HTTP {status}") });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

fn unavailable(err: reqwest::Error) -> Error {
    Error::CacheBackendUnavailable { message: err.to_string() }
}

fn unexpected(operation: &str, value: &Value) -> Error {
    Error::CacheBackendUnavailable { message: format!("unexpected {operation} result: {value}") }
}

#[async_trait]
impl CacheBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(json!(["GET", key])).await? {
            Value::Null => Ok(None),
            Value::String(value) => Ok(Some(value)),
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        // Whole seconds, rounded up; zero would mean "no expiry".
        let secs = u64::try_from(ttl.as_millis().div_ceil(1_000)).unwrap_or(u64::MAX).max(1);
        self.command(json!(["SET", key, value, "EX", secs])).await.map(|_| ())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.command(json!(["DEL", key])).await.map(|_| ())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        match self.command(json!(["KEYS", pattern])).await? {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(key) => Ok(key),
                    other => Err(unexpected("KEYS", &other)),
                })
                .collect(),
            other => Err(unexpected("KEYS", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialRef;
    use httpmock::MockServer;

    fn backend(url: String) -> RemoteBackend {
        std::env::set_var("PRESSPOOL_REMOTE_CACHE_TEST_TOKEN", "cache-token");
        let config = RemoteCacheConfig {
            url,
            token: CredentialRef::Env("PRESSPOOL_REMOTE_CACHE_TEST_TOKEN".into()),
        };
        RemoteBackend::new(&config, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn get_sends_command_with_bearer_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST")
                .path("/")
                .header("authorization", "Bearer cache-token")
                .json_body(json!(["GET", "outline:abc"]));
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"result":"\"cached\""}"#);
        });

        let value = backend(server.base_url()).get("outline:abc").await.unwrap();
        assert_eq!(value.as_deref(), Some("\"cached\""));
        mock.assert();
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST");
            then.status(200).body(r#"{"result":null}"#);
        });
        assert_eq!(backend(server.base_url()).get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_sends_expiry_in_seconds() {
        let server = MockServer::start();
        let hour = server.mock(|when, then| {
            when.method("POST").json_body(json!(["SET", "k", "v", "EX", 3600]));
            then.status(200).body(r#"{"result":"OK"}"#);
        });
        let rounded_up = server.mock(|when, then| {
            when.method("POST").json_body(json!(["SET", "k", "v", "EX", 1]));
            then.status(200).body(r#"{"result":"OK"}"#);
        });

        let backend = backend(server.base_url());
        backend.set("k", "v".into(), Duration::from_secs(3_600)).await.unwrap();
        backend.set("k", "v".into(), Duration::from_millis(10)).await.unwrap();

        hour.assert();
        rounded_up.assert();
    }

    #[tokio::test]
    async fn keys_parses_arrays() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").json_body(json!(["KEYS", "ns:*"]));
            then.status(200).body(r#"{"result":["ns:a","ns:b"]}"#);
        });
        let keys = backend(server.base_url()).keys("ns:*").await.unwrap();
        assert_eq!(keys, vec!["ns:a".to_string(), "ns:b".to_string()]);
    }

    #[tokio::test]
    async fn error_replies_are_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST");
            then.status(400).body(r#"{"error":"WRONGPASS invalid token"}"#);
        });
        let err = backend(server.base_url()).del("k").await.unwrap_err();
        assert!(matches!(err, Error::CacheBackendUnavailable { ref message } if message.contains("WRONGPASS")));
    }

    #[tokio::test]
    async fn unreachable_store_is_unavailable() {
        // Bind then drop a listener so the port is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let err = backend(url).get("k").await.unwrap_err();
        assert!(matches!(err, Error::CacheBackendUnavailable { .. }));
    }
}
