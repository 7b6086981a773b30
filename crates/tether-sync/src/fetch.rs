//! # Fetch Pipeline
//!
//! GET → decode → reshape → map to records. Persisting the mapped records is
//! done by the caller (see `operations::fetch`) through the upsert engine.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  FetchRequest { url, parse, persist }                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Transport::fetch_bytes(url)      NetworkError on failure / non-2xx     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Decoder::decode(bytes)           DecodeError on malformed body         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  parse(tree)                      identity when not supplied            │
//! │       │                                                                 │
//! │       ├── FetchRoute::Single      exactly one object → Record           │
//! │       │                                                                 │
//! │       └── FetchRoute::Collection  array → one Record per element;       │
//! │                                   bad elements skipped and reported     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both collaborators are traits so tests can swap the network for an
//! in-process table of canned responses.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use tether_core::record::{expect_object, value_kind};
use tether_core::{EntitySpec, ParseTree, Record};

use crate::config::TetherConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Transport
// =============================================================================

/// Issues a network GET and returns the response body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> SyncResult<Vec<u8>>;
}

/// [`Transport`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl HttpTransport {
    /// Builds a transport.
    ///
    /// ## Arguments
    /// * `user_agent` - sent on every request
    /// * `timeout` - per-request timeout; `None` waits indefinitely
    /// * `base_url` - relative request URLs are joined onto this
    pub fn new(user_agent: &str, timeout: Option<Duration>, base_url: Option<&str>) -> SyncResult<Self> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        let base_url = base_url.map(Url::parse).transpose()?;

        Ok(HttpTransport { client, base_url })
    }

    pub fn from_config(config: &TetherConfig) -> SyncResult<Self> {
        Self::new(
            &config.fetch.user_agent,
            config.request_timeout(),
            config.base_url(),
        )
    }

    /// Absolute URLs pass through; relative ones need a base URL.
    pub fn resolve(&self, url: &str) -> SyncResult<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => Ok(base.join(url)?),
                None => Err(SyncError::InvalidUrl(format!(
                    "relative URL '{}' needs a configured base URL",
                    url
                ))),
            },
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_bytes(&self, url: &str) -> SyncResult<Vec<u8>> {
        let target = self.resolve(url)?;
        debug!(url = %target, "GET");

        let response = self
            .client
            .get(target.clone())
            .send()
            .await
            .map_err(|e| SyncError::network(target.as_str(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Network {
                url: target.to_string(),
                status: Some(status.as_u16()),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::network(target.as_str(), e.to_string()))?;

        debug!(url = %target, bytes = body.len(), "Response received");
        Ok(body.to_vec())
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Turns a response body into a parse tree.
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> SyncResult<ParseTree>;
}

/// [`Decoder`] for JSON bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> SyncResult<ParseTree> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Decode(e.to_string()))
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Reshapes a decoded tree into the field-mapping shape an entity expects.
pub type ParseFn = Arc<dyn Fn(ParseTree) -> ParseTree + Send + Sync>;

/// One network read.
#[derive(Clone)]
pub struct FetchRequest {
    pub url: String,
    pub parse: Option<ParseFn>,
    /// When false, mapped records are returned without touching the store.
    pub persist: bool,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        FetchRequest {
            url: url.into(),
            parse: None,
            persist: true,
        }
    }

    /// Sets the reshaping function applied after decoding.
    ///
    /// ```rust
    /// use tether_sync::FetchRequest;
    ///
    /// // {"data": [...]} → [...]
    /// let request = FetchRequest::new("articles")
    ///     .parse_with(|tree| tree.get("data").cloned().unwrap_or(tree));
    /// assert!(request.parse.is_some());
    /// ```
    pub fn parse_with<F>(mut self, parse: F) -> Self
    where
        F: Fn(ParseTree) -> ParseTree + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(parse));
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    fn apply(&self, tree: ParseTree) -> ParseTree {
        match &self.parse {
            Some(parse) => parse(tree),
            None => tree,
        }
    }
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("url", &self.url)
            .field("parse", &self.parse.as_ref().map(|_| "<fn>"))
            .field("persist", &self.persist)
            .finish()
    }
}

impl From<&str> for FetchRequest {
    fn from(url: &str) -> Self {
        FetchRequest::new(url)
    }
}

impl From<String> for FetchRequest {
    fn from(url: String) -> Self {
        FetchRequest::new(url)
    }
}

/// Expected shape of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRoute {
    /// Exactly one entity (`get`).
    Single,
    /// An array of entities (`get_all`).
    Collection,
}

// =============================================================================
// Mapping
// =============================================================================

/// Records mapped from one response plus the elements that failed.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub records: Vec<Record>,
    pub failures: Vec<SyncError>,
    /// Number of elements in the response.
    pub total: usize,
}

impl FetchReport {
    fn single(record: Record) -> Self {
        FetchReport {
            records: vec![record],
            failures: Vec::new(),
            total: 1,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// `PartialBatch` summary when any element failed.
    pub fn partial_error(&self, entity: &str) -> Option<SyncError> {
        (!self.failures.is_empty()).then(|| SyncError::PartialBatch {
            entity: entity.to_string(),
            failed: self.failures.len(),
            total: self.total,
        })
    }

    /// The single record of a `Single` route fetch.
    pub fn into_single(mut self) -> SyncResult<Record> {
        match self.records.len() {
            1 => self
                .records
                .pop()
                .ok_or_else(|| SyncError::Internal("empty single fetch".into())),
            n => Err(SyncError::Internal(format!(
                "expected one fetched record, got {}",
                n
            ))),
        }
    }
}

fn to_record(spec: &EntitySpec, node: ParseTree) -> Result<Record, String> {
    let fields = expect_object(&spec.name, node).map_err(|e| match e {
        tether_core::CoreError::Mapping { reason, .. } => reason,
        other => other.to_string(),
    })?;
    let record = spec.new_record_with(fields);
    if spec.requires_primary_key && record.primary_key().is_none() {
        return Err(format!("missing primary key field '{}'", spec.primary_key));
    }
    Ok(record)
}

/// Maps a tree that must describe exactly one entity.
///
/// Accepts an object, or an array holding exactly one object.
pub fn map_single(spec: &EntitySpec, tree: ParseTree) -> SyncResult<Record> {
    let node = match tree {
        ParseTree::Array(mut items) if items.len() == 1 => items.remove(0),
        ParseTree::Array(items) => {
            return Err(SyncError::Mapping {
                entity: spec.name.clone(),
                index: None,
                reason: format!("expected exactly one object, got array of {}", items.len()),
            })
        }
        other => other,
    };

    to_record(spec, node).map_err(|reason| SyncError::Mapping {
        entity: spec.name.clone(),
        index: None,
        reason,
    })
}

/// Maps every element of an array independently.
///
/// A non-array tree fails as a whole; a bad element only lands in `failures`.
pub fn map_collection(spec: &EntitySpec, tree: ParseTree) -> SyncResult<FetchReport> {
    let items = match tree {
        ParseTree::Array(items) => items,
        other => {
            return Err(SyncError::Mapping {
                entity: spec.name.clone(),
                index: None,
                reason: format!("expected array, got {}", value_kind(&other)),
            })
        }
    };

    let mut report = FetchReport {
        total: items.len(),
        ..FetchReport::default()
    };

    for (index, node) in items.into_iter().enumerate() {
        match to_record(spec, node) {
            Ok(record) => report.records.push(record),
            Err(reason) => report
                .failures
                .push(SyncError::mapping_at(&spec.name, index, reason)),
        }
    }

    Ok(report)
}

// =============================================================================
// Fetcher
// =============================================================================

/// Transport + decoder pair shared by the queue and the direct path.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn Decoder>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, decoder: Arc<dyn Decoder>) -> Self {
        Fetcher { transport, decoder }
    }

    /// GET, decode and reshape. Never touches the store.
    pub async fn fetch_tree(&self, request: &FetchRequest) -> SyncResult<ParseTree> {
        let bytes = self.transport.fetch_bytes(&request.url).await?;
        let tree = self.decoder.decode(&bytes)?;
        Ok(request.apply(tree))
    }

    /// Fetches and maps without persisting.
    pub async fn fetch_records(
        &self,
        spec: &EntitySpec,
        request: &FetchRequest,
        route: FetchRoute,
    ) -> SyncResult<FetchReport> {
        let tree = self.fetch_tree(request).await?;
        match route {
            FetchRoute::Single => map_single(spec, tree).map(FetchReport::single),
            FetchRoute::Collection => map_collection(spec, tree),
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> EntitySpec {
        EntitySpec::new("Article", "objID")
    }

    struct Canned(&'static str);

    #[async_trait]
    impl Transport for Canned {
        async fn fetch_bytes(&self, _url: &str) -> SyncResult<Vec<u8>> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_map_single_accepts_object_or_singleton() {
        let record = map_single(&spec(), json!({ "objID": 1 })).unwrap();
        assert_eq!(record.primary_key(), Some(&json!(1)));

        let record = map_single(&spec(), json!([{ "objID": 2 }])).unwrap();
        assert_eq!(record.primary_key(), Some(&json!(2)));

        assert!(matches!(
            map_single(&spec(), json!([{ "objID": 1 }, { "objID": 2 }])),
            Err(SyncError::Mapping { .. })
        ));
        assert!(matches!(
            map_single(&spec(), json!("text")),
            Err(SyncError::Mapping { .. })
        ));
    }

    #[test]
    fn test_map_collection_skips_bad_elements() {
        let report = map_collection(
            &spec(),
            json!([{ "objID": 1 }, 42, { "objID": 3 }]),
        )
        .unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.total, 3);
        assert!(matches!(
            report.failures[0],
            SyncError::Mapping { index: Some(1), .. }
        ));
        assert!(matches!(
            report.partial_error("Article"),
            Some(SyncError::PartialBatch { failed: 1, total: 3, .. })
        ));
    }

    #[test]
    fn test_map_collection_requires_array() {
        assert!(map_collection(&spec(), json!({ "objID": 1 })).is_err());
    }

    #[test]
    fn test_required_key_missing_is_element_failure() {
        let strict = spec().requiring_primary_key(true);
        let report = map_collection(&strict, json!([{ "objID": 1 }, { "title": "x" }])).unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_json_decoder() {
        assert_eq!(JsonDecoder.decode(b"[1,2]").unwrap(), json!([1, 2]));
        assert!(matches!(
            JsonDecoder.decode(b"{not json"),
            Err(SyncError::Decode(_))
        ));
    }

    #[test]
    fn test_resolve_urls() {
        let transport = HttpTransport::new("t", None, Some("https://api.example.com/v1/")).unwrap();
        assert_eq!(
            transport.resolve("articles").unwrap().as_str(),
            "https://api.example.com/v1/articles"
        );
        assert_eq!(
            transport.resolve("http://other.dev/x").unwrap().as_str(),
            "http://other.dev/x"
        );

        let bare = HttpTransport::new("t", None, None).unwrap();
        assert!(matches!(bare.resolve("articles"), Err(SyncError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_fetch_tree_applies_parse() {
        let fetcher = Fetcher::new(
            Arc::new(Canned(r#"{"data":[{"objID":1}]}"#)),
            Arc::new(JsonDecoder),
        );
        let request = FetchRequest::new("articles")
            .parse_with(|tree| tree.get("data").cloned().unwrap_or(tree));

        let report = fetcher
            .fetch_records(&spec(), &request, FetchRoute::Collection)
            .await
            .unwrap();
        assert_eq!(report.records.len(), 1);
        assert!(report.is_complete());
    }
}
