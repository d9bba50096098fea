use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, StatusCode, Url};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};

use super::{DocumentStore, StoredDocument, WriteCondition};
use crate::document::Revision;
use crate::error::StoreError;

/// How long a presigned request URL stays valid.
const PRESIGN_TTL: Duration = Duration::from_secs(60);

/// Where the flag document lives in the remote object store.
#[derive(Debug, Clone, Default)]
pub struct HttpStoreConfig {
    /// Base URL; defaults to the virtual-hosted bucket URL built from
    /// `bucket` and `region`. With access keys set this is the S3 service
    /// endpoint instead, addressed path-style.
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub object_key: String,
    /// Sent as a bearer token on unsigned requests.
    pub token: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl HttpStoreConfig {
    /// Full URL of the document object for unsigned access.
    pub fn object_url(&self) -> Result<String, StoreError> {
        let base = match (&self.endpoint, &self.bucket, &self.region) {
            (Some(endpoint), _, _) => endpoint.trim_end_matches('/').to_string(),
            (None, Some(bucket), Some(region)) => {
                format!("https://{}.s3.{}.amazonaws.com", bucket, region)
            }
            _ => {
                return Err(StoreError::Unavailable(
                    "object store needs either an endpoint or a bucket and region".to_string(),
                ))
            }
        };
        Ok(format!("{}/{}", base, self.key()?))
    }

    fn key(&self) -> Result<&str, StoreError> {
        let key = self.object_key.trim_start_matches('/');
        if key.is_empty() {
            return Err(StoreError::Unavailable(
                "object store needs an object key".to_string(),
            ));
        }
        Ok(key)
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) => Some(Credentials::new(key.clone(), secret.clone())),
            _ => None,
        }
    }

    fn bucket(&self) -> Result<Bucket, StoreError> {
        let (Some(name), Some(region)) = (&self.bucket, &self.region) else {
            return Err(StoreError::Unavailable(
                "signed object store access needs a bucket and region".to_string(),
            ));
        };
        let (endpoint, style) = match &self.endpoint {
            Some(endpoint) => (endpoint.clone(), UrlStyle::Path),
            None => (
                format!("https://s3.{}.amazonaws.com", region),
                UrlStyle::VirtualHost,
            ),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| StoreError::Unavailable(format!("invalid object store endpoint: {}", e)))?;
        Bucket::new(endpoint, style, name.clone(), region.clone())
            .map_err(|e| StoreError::Unavailable(format!("invalid bucket: {:?}", e)))
    }
}

enum Target {
    /// Plain URL, optionally with a bearer token.
    Plain { url: String, token: Option<String> },
    /// S3 bucket; every request is presigned with SigV4.
    Signed {
        bucket: Bucket,
        credentials: Credentials,
        key: String,
    },
}

/// Remote object store reached over HTTP `GET`/`PUT`.
///
/// Revisions are the object's `ETag`; write conditions are sent as
/// `If-Match` / `If-None-Match: *` and a `412` answer becomes a conflict.
pub struct HttpObjectStore {
    client: reqwest::Client,
    target: Target,
    location: String,
}

impl HttpObjectStore {
    pub fn new(config: &HttpStoreConfig) -> Result<Self, StoreError> {
        let (target, location) = match config.credentials() {
            Some(credentials) => {
                let bucket = config.bucket()?;
                let key = config.key()?.to_string();
                let location = format!("s3://{}/{}", bucket.name(), key);
                (
                    Target::Signed {
                        bucket,
                        credentials,
                        key,
                    },
                    location,
                )
            }
            None => {
                let url = config.object_url()?;
                (
                    Target::Plain {
                        url: url.clone(),
                        token: config.token.clone(),
                    },
                    url,
                )
            }
        };
        Ok(Self {
            client: reqwest::Client::new(),
            target,
            location,
        })
    }

    /// Where the document lives, for logs.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.target, Target::Signed { .. })
    }

    fn request(&self, method: Method) -> reqwest::RequestBuilder {
        match &self.target {
            Target::Plain { url, token } => {
                let request = self.client.request(method, url.as_str());
                match token {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            }
            Target::Signed {
                bucket,
                credentials,
                key,
            } => {
                let url = if method == Method::PUT {
                    bucket.put_object(Some(credentials), key).sign(PRESIGN_TTL)
                } else {
                    bucket.get_object(Some(credentials), key).sign(PRESIGN_TTL)
                };
                self.client.request(method, url)
            }
        }
    }
}

fn etag_revision(headers: &reqwest::header::HeaderMap) -> Option<Revision> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .and_then(Revision::from_etag)
}

#[async_trait]
impl DocumentStore for HttpObjectStore {
    async fn get_document(&self) -> Result<Option<StoredDocument>, StoreError> {
        let request = self
            .request(Method::GET)
            .header(CACHE_CONTROL, "no-cache");

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to fetch flags: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "failed to fetch flags: {}",
                status
            )));
        }

        let revision = etag_revision(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to read flags body: {}", e)))?;

        Ok(Some(StoredDocument {
            bytes: bytes.to_vec(),
            revision,
        }))
    }

    async fn put_document(
        &self,
        bytes: &[u8],
        content_type: &str,
        condition: WriteCondition,
    ) -> Result<Option<Revision>, StoreError> {
        let mut request = self
            .request(Method::PUT)
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec());

        request = match &condition {
            WriteCondition::Any => request,
            WriteCondition::Absent => request.header(IF_NONE_MATCH, "*"),
            WriteCondition::Matches(rev) => request.header(IF_MATCH, rev.to_etag()),
        };

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to write flags: {}", e)))?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(StoreError::Conflict);
        }
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "failed to write flags: {}",
                status
            )));
        }

        Ok(etag_revision(response.headers()))
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;

    use super::*;

    /// In-process stand-in for an object store bucket holding one object.
    #[derive(Default)]
    struct Stub {
        object: Option<(Vec<u8>, u32)>,
        version: u32,
        failing: bool,
        /// `METHOD uri if-match if-none-match` per request.
        seen: Vec<String>,
    }

    type Shared = Arc<Mutex<Stub>>;

    fn record(stub: &mut Stub, method: &str, uri: &Uri, headers: &HeaderMap) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        stub.seen.push(format!(
            "{} {} {} {}",
            method,
            uri,
            header("if-match"),
            header("if-none-match")
        ));
    }

    async fn get_object(State(stub): State<Shared>, uri: Uri, headers: HeaderMap) -> Response {
        let mut stub = stub.lock().unwrap();
        record(&mut stub, "GET", &uri, &headers);
        if stub.failing {
            return AxumStatus::SERVICE_UNAVAILABLE.into_response();
        }
        match &stub.object {
            Some((bytes, version)) => {
                ([("etag", format!("\"v{}\"", version))], bytes.clone()).into_response()
            }
            None => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn put_object(
        State(stub): State<Shared>,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let mut stub = stub.lock().unwrap();
        record(&mut stub, "PUT", &uri, &headers);
        if stub.failing {
            return AxumStatus::SERVICE_UNAVAILABLE.into_response();
        }
        let current = stub.object.as_ref().map(|(_, v)| format!("\"v{}\"", v));
        if let Some(expected) = headers.get("if-match").and_then(|v| v.to_str().ok()) {
            if current.as_deref() != Some(expected) {
                return AxumStatus::PRECONDITION_FAILED.into_response();
            }
        }
        if headers.contains_key("if-none-match") && current.is_some() {
            return AxumStatus::PRECONDITION_FAILED.into_response();
        }
        stub.version += 1;
        let version = stub.version;
        stub.object = Some((body.to_vec(), version));
        ([("etag", format!("\"v{}\"", version))], "").into_response()
    }

    async fn spawn_stub(stub: Shared) -> String {
        let app = Router::new()
            .route("/{*path}", get(get_object).put(put_object))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn plain(endpoint: &str) -> HttpObjectStore {
        HttpObjectStore::new(&HttpStoreConfig {
            endpoint: Some(endpoint.to_string()),
            object_key: "flags.json".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn rev(value: &str) -> Revision {
        Revision::new(value)
    }

    #[test]
    fn object_url_from_bucket_and_region() {
        let config = HttpStoreConfig {
            bucket: Some("flags-bucket".to_string()),
            region: Some("eu-west-1".to_string()),
            object_key: "config/flags.json".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.object_url().unwrap(),
            "https://flags-bucket.s3.eu-west-1.amazonaws.com/config/flags.json"
        );
    }

    #[test]
    fn endpoint_takes_precedence() {
        let config = HttpStoreConfig {
            endpoint: Some("http://127.0.0.1:9000/bucket/".to_string()),
            bucket: Some("ignored".to_string()),
            region: Some("ignored".to_string()),
            object_key: "/flags.json".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.object_url().unwrap(),
            "http://127.0.0.1:9000/bucket/flags.json"
        );
    }

    #[test]
    fn incomplete_location_is_rejected() {
        let config = HttpStoreConfig {
            bucket: Some("flags".to_string()),
            object_key: "flags.json".to_string(),
            ..Default::default()
        };
        assert!(config.object_url().is_err());

        let config = HttpStoreConfig {
            endpoint: Some("http://localhost".to_string()),
            ..Default::default()
        };
        assert!(config.object_url().is_err());

        // Access keys without a bucket cannot be signed for.
        let config = HttpStoreConfig {
            endpoint: Some("http://localhost".to_string()),
            object_key: "flags.json".to_string(),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..Default::default()
        };
        assert!(HttpObjectStore::new(&config).is_err());
    }

    #[test]
    fn access_keys_switch_to_signed_requests() {
        let store = HttpObjectStore::new(&HttpStoreConfig {
            bucket: Some("flags-bucket".to_string()),
            region: Some("eu-west-1".to_string()),
            object_key: "feature-flags.json".to_string(),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(store.is_signed());
        assert_eq!(store.location(), "s3://flags-bucket/feature-flags.json");

        let request = store.request(Method::PUT).build().unwrap();
        let url = request.url().as_str();
        assert!(url.starts_with(
            "https://flags-bucket.s3.eu-west-1.amazonaws.com/feature-flags.json?"
        ));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE"));
    }

    #[tokio::test]
    async fn missing_object_reads_as_absent() {
        let stub = Shared::default();
        let store = plain(&spawn_stub(stub.clone()).await);

        assert_eq!(store.get_document().await.unwrap(), None);
        assert_eq!(stub.lock().unwrap().seen, vec!["GET /flags.json - -"]);
    }

    #[tokio::test]
    async fn conditions_travel_as_headers_and_etags_become_revisions() {
        let stub = Shared::default();
        let store = plain(&spawn_stub(stub.clone()).await);

        let created = store
            .put_document(b"{\"a\":true}", "application/json", WriteCondition::Absent)
            .await
            .unwrap();
        assert_eq!(created, Some(rev("v1")));

        let read = store.get_document().await.unwrap().unwrap();
        assert_eq!(read.bytes, b"{\"a\":true}");
        assert_eq!(read.revision, Some(rev("v1")));

        let again = store
            .put_document(b"{}", "application/json", WriteCondition::Absent)
            .await;
        assert_eq!(again, Err(StoreError::Conflict));

        let replaced = store
            .put_document(b"{}", "application/json", WriteCondition::Matches(rev("v1")))
            .await
            .unwrap();
        assert_eq!(replaced, Some(rev("v2")));

        let stale = store
            .put_document(b"{}", "application/json", WriteCondition::Matches(rev("v1")))
            .await;
        assert_eq!(stale, Err(StoreError::Conflict));

        let forced = store
            .put_document(b"{}", "application/json", WriteCondition::Any)
            .await
            .unwrap();
        assert_eq!(forced, Some(rev("v3")));

        let seen = stub.lock().unwrap().seen.clone();
        assert_eq!(
            seen,
            vec![
                "PUT /flags.json - *",
                "GET /flags.json - -",
                "PUT /flags.json - *",
                "PUT /flags.json \"v1\" -",
                "PUT /flags.json \"v1\" -",
                "PUT /flags.json - -",
            ]
        );
    }

    #[tokio::test]
    async fn other_failures_are_unavailable() {
        let stub = Shared::default();
        stub.lock().unwrap().failing = true;
        let store = plain(&spawn_stub(stub.clone()).await);

        assert!(matches!(
            store.get_document().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store
                .put_document(b"{}", "application/json", WriteCondition::Any)
                .await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn bearer_token_is_sent_on_plain_requests() {
        let stub = Shared::default();
        let endpoint = spawn_stub(stub.clone()).await;
        let store = HttpObjectStore::new(&HttpStoreConfig {
            endpoint: Some(endpoint),
            object_key: "flags.json".to_string(),
            token: Some("store-token".to_string()),
            ..Default::default()
        })
        .unwrap();

        let request = store.request(Method::GET).build().unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer store-token"
        );
    }

    #[tokio::test]
    async fn signed_requests_reach_a_path_style_endpoint() {
        let stub = Shared::default();
        let endpoint = spawn_stub(stub.clone()).await;
        let store = HttpObjectStore::new(&HttpStoreConfig {
            endpoint: Some(endpoint),
            bucket: Some("flags-bucket".to_string()),
            region: Some("us-east-1".to_string()),
            object_key: "flags.json".to_string(),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..Default::default()
        })
        .unwrap();

        store
            .put_document(b"{}", "application/json", WriteCondition::Absent)
            .await
            .unwrap();
        let read = store.get_document().await.unwrap().unwrap();
        assert_eq!(read.revision, Some(rev("v1")));

        let seen = stub.lock().unwrap().seen.clone();
        assert_eq!(seen.len(), 2);
        for line in seen {
            assert!(line.contains(" /flags-bucket/flags.json?"), "{}", line);
            assert!(line.contains("X-Amz-Signature="), "{}", line);
        }
    }
}
