use std::time::Duration;

use async_trait::async_trait;
use ferry_common::{incoming, outgoing};
use ferry_tracing::traced;
use reqwest::StatusCode;

use crate::{MessageStore, Result, StorageKey, StoreError, key::validate_prefix};

/// Objects larger than this are refused unless configured otherwise
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 50 * 1024 * 1024;

/// Reads staged messages over HTTP: `GET {endpoint}/{prefix}{key}`
///
/// Works against any object store or gateway that serves objects at a plain
/// URL, optionally behind a bearer token.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    endpoint: String,
    prefix: String,
    bearer_token: Option<String>,
    max_object_size: u64,
}

impl HttpStore {
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid or the HTTP client cannot be
    /// constructed.
    pub fn new(
        endpoint: impl Into<String>,
        prefix: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Configuration(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            prefix,
            bearer_token,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        })
    }

    #[must_use]
    pub const fn with_max_object_size(mut self, max_object_size: u64) -> Self {
        self.max_object_size = max_object_size;
        self
    }

    fn url_for(&self, key: &StorageKey) -> String {
        let prefix = self.prefix.trim_matches('/');
        let key = encode_segment(key.as_str());
        if prefix.is_empty() {
            format!("{}/{key}", self.endpoint)
        } else {
            format!("{}/{prefix}/{key}", self.endpoint)
        }
    }

    fn too_large(&self, key: &StorageKey) -> StoreError {
        StoreError::TooLarge {
            key: key.clone(),
            limit: self.max_object_size,
        }
    }

    /// Map a non-success status onto the store taxonomy
    fn classify(key: &StorageKey, status: StatusCode) -> StoreError {
        match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(key.clone()),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                StoreError::Transient(format!("store responded {status}"))
            }
            status if status.is_server_error() => {
                StoreError::Transient(format!("store responded {status}"))
            }
            status => StoreError::Rejected {
                key: key.clone(),
                status: status.as_u16(),
            },
        }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self), fields(key = %key)), timing(precision = "ms"))]
    async fn get(&self, key: &StorageKey) -> Result<Vec<u8>> {
        let url = self.url_for(key);
        outgoing!(level = DEBUG, url = %url, "GET staged message");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let mut response = request
            .send()
            .await
            .map_err(|err| StoreError::Transient(err.to_string()))?;

        let status = response.status();
        incoming!(level = DEBUG, status = %status, "Store response");

        if !status.is_success() {
            return Err(Self::classify(key, status));
        }

        if response
            .content_length()
            .is_some_and(|length| length > self.max_object_size)
        {
            return Err(self.too_large(key));
        }

        // Content-Length can be absent or wrong, so count as the body arrives
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| StoreError::Transient(err.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_object_size {
                return Err(self.too_large(key));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn encode_segment(segment: &str) -> String {
    segment.bytes().fold(String::with_capacity(segment.len()), |mut out, b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
        out
    })
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn fetch(&self, key: &StorageKey) -> Result<Vec<u8>> {
        self.get(key).await
    }

    fn describe(&self) -> String {
        format!("http:{}/{}", self.endpoint, self.prefix.trim_matches('/'))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use ferry_common::Classify;
    use mockito::Server;
    use pretty_assertions::assert_eq;

    use super::*;

    fn store(server: &Server, token: Option<&str>) -> HttpStore {
        HttpStore::new(
            server.url(),
            "emails/",
            token.map(ToString::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetches_with_bearer_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/emails/abc")
            .match_header("authorization", "Bearer s3cret")
            .with_status(200)
            .with_body("Subject: hi\r\n\r\nbody")
            .create_async()
            .await;

        let bytes = store(&server, Some("s3cret"))
            .fetch(&StorageKey::parse("abc").unwrap())
            .await
            .unwrap();

        assert_eq!(bytes, b"Subject: hi\r\n\r\nbody".to_vec());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn status_classification() {
        let mut server = Server::new_async().await;
        let _missing = server
            .mock("GET", "/emails/missing")
            .with_status(404)
            .create_async()
            .await;
        let _throttled = server
            .mock("GET", "/emails/throttled")
            .with_status(429)
            .create_async()
            .await;
        let _broken = server
            .mock("GET", "/emails/broken")
            .with_status(503)
            .create_async()
            .await;
        let _denied = server
            .mock("GET", "/emails/denied")
            .with_status(403)
            .create_async()
            .await;

        let store = store(&server, None);
        let fetch = |key: &'static str| {
            let store = store.clone();
            async move { store.fetch(&StorageKey::parse(key).unwrap()).await.unwrap_err() }
        };

        assert!(fetch("missing").await.is_not_found());
        assert!(fetch("throttled").await.is_retryable());
        assert!(fetch("broken").await.is_retryable());

        let denied = fetch("denied").await;
        assert!(denied.is_terminal());
        assert!(matches!(denied, StoreError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn key_is_percent_encoded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/emails/abc%231%3Fx%25")
            .with_status(200)
            .with_body("body")
            .create_async()
            .await;

        let bytes = store(&server, None)
            .fetch(&StorageKey::parse("abc#1?x%").unwrap())
            .await
            .unwrap();

        assert_eq!(bytes, b"body".to_vec());
        mock.assert_async().await;
    }

    #[test]
    fn unreserved_characters_pass_through() {
        assert_eq!(encode_segment("Ab-9._~"), "Ab-9._~");
        assert_eq!(encode_segment("a+b=c&d"), "a%2Bb%3Dc%26d");
    }

    #[tokio::test]
    async fn oversized_objects_are_refused() {
        let mut server = Server::new_async().await;
        let _declared = server
            .mock("GET", "/emails/declared")
            .with_status(200)
            .with_body("x".repeat(64))
            .create_async()
            .await;
        let _streamed = server
            .mock("GET", "/emails/streamed")
            .with_status(200)
            .with_chunked_body(|w| {
                for _ in 0..8 {
                    w.write_all(&[b'x'; 16])?;
                }
                Ok(())
            })
            .create_async()
            .await;
        let _fits = server
            .mock("GET", "/emails/fits")
            .with_status(200)
            .with_body("x".repeat(32))
            .create_async()
            .await;

        let store = store(&server, None).with_max_object_size(32);

        for key in ["declared", "streamed"] {
            let err = store.fetch(&StorageKey::parse(key).unwrap()).await.unwrap_err();
            assert!(matches!(err, StoreError::TooLarge { limit: 32, .. }), "{key}: {err}");
            assert!(err.is_terminal());
        }

        let bytes = store.fetch(&StorageKey::parse("fits").unwrap()).await.unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        let store = HttpStore::new("http://127.0.0.1:1", "", None, Duration::from_secs(1)).unwrap();
        let err = store
            .fetch(&StorageKey::parse("abc").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
