//! Recipes: immutable match-and-respond entries. A recipe is snapshotted
//! from a [builder](crate::builder::RecipeBuilder) at registration time;
//! nothing mutates it afterwards except the single-use consumption flag.

use crate::{
    http::{
        DispatchError, HttpMethod, HttpVersion, InterceptedRequest,
        ResponseBody, SynthesizedResponse,
    },
    matcher::RequestMatcher,
};
use bytes::Bytes;
use derive_more::Display;
use futures::{future::BoxFuture, stream::BoxStream};
use reqwest::{
    StatusCode, Url,
    header::{HeaderMap, HeaderName},
};
use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{self, Debug},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use uuid::Uuid;

/// Unique ID for a registered recipe. Used to deregister and to drop a
/// consumed single-use recipe from its scope layer.
#[derive(
    Copy, Clone, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd,
)]
pub struct RecipeId(Uuid);

impl RecipeId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// One component of a canonical key: a concrete value or the "any" sentinel
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyPart<T> {
    Any,
    Exact(T),
}

impl<T> KeyPart<T> {
    /// Apply a predicate to the exact value; `Any` always matches
    pub fn matches_with(&self, f: impl FnOnce(&T) -> bool) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(value) => f(value),
        }
    }
}

impl<T> From<Option<T>> for KeyPart<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Any, Self::Exact)
    }
}

/// How a recipe's query component compares against the request's query
/// string: not at all, byte-for-byte, or as an unordered set of `k=v` pairs
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum QueryKey {
    Any,
    Verbatim(String),
    Params(BTreeSet<(String, String)>),
}

impl QueryKey {
    fn matches(&self, url: &Url) -> bool {
        match self {
            Self::Any => true,
            Self::Verbatim(query) => url.query().unwrap_or_default() == query,
            Self::Params(params) => &query_params(url) == params,
        }
    }
}

/// Decode a URL's query string into an unordered set of `k=v` pairs
pub(crate) fn query_params(url: &Url) -> BTreeSet<(String, String)> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// The identity under which a fluent-built recipe is indexed in the
/// registry. Re-registering the same key in the same scope replaces the
/// prior entry. Recipes registered by free-form predicate have no key.
///
/// Required request headers participate in the identity (the fingerprint):
/// two recipes on the same URI that differ only in a required `Accept`
/// header are distinct registrations, not replacements.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CanonicalKey {
    pub method: KeyPart<HttpMethod>,
    /// Lowercase
    pub scheme: KeyPart<String>,
    /// Lowercase
    pub host: KeyPart<String>,
    /// Defaulted from the scheme when the builder set a scheme but no port
    pub port: KeyPart<u16>,
    /// Canonicalized: leading slash, unreserved octets percent-decoded
    pub path: KeyPart<String>,
    pub query: QueryKey,
    /// Required-header identity: lowercase name to sorted lowercase values
    pub header_fingerprint: BTreeMap<String, Vec<String>>,
}

impl CanonicalKey {
    /// Does the request's canonical tuple satisfy this key? The fingerprint
    /// is identity only; header *matching* is done by the recipe's attached
    /// matchers.
    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        let url = request.url();
        self.method.matches_with(|m| *m == request.method())
            && self.scheme.matches_with(|s| s == url.scheme())
            && self.host.matches_with(|h| {
                url.host_str()
                    .is_some_and(|actual| actual.eq_ignore_ascii_case(h))
            })
            && self
                .port
                .matches_with(|p| url.port_or_known_default() == Some(*p))
            && self
                .path
                .matches_with(|p| canonicalize_path(url.path()) == *p)
            && self.query.matches(url)
    }

    /// Build the header-identity fingerprint from a recipe's header matchers
    pub(crate) fn fingerprint(
        matchers: &[RequestMatcher],
    ) -> BTreeMap<String, Vec<String>> {
        matchers
            .iter()
            .filter_map(|matcher| match matcher {
                RequestMatcher::Header { name, expected } => {
                    let mut values: Vec<String> = expected
                        .iter()
                        .map(|value| value.to_ascii_lowercase())
                        .collect();
                    values.sort();
                    Some((name.as_str().to_owned(), values))
                }
                _ => None,
            })
            .collect()
    }
}

/// Canonicalize a URL path for key comparison: percent-decode octets that
/// didn't need encoding in the first place (unreserved per RFC 3986) and
/// give the empty path its canonical `/` form. Reserved octets stay encoded
/// so `/a%2Fb` and `/a/b` remain distinct.
pub(crate) fn canonicalize_path(path: &str) -> String {
    fn is_unreserved(octet: u8) -> bool {
        octet.is_ascii_alphanumeric() || matches!(octet, b'-' | b'.' | b'_' | b'~')
    }

    fn hex_value(digit: u8) -> Option<u8> {
        match digit {
            b'0'..=b'9' => Some(digit - b'0'),
            b'a'..=b'f' => Some(digit - b'a' + 10),
            b'A'..=b'F' => Some(digit - b'A' + 10),
            _ => None,
        }
    }

    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    if !path.starts_with('/') {
        out.push(b'/');
    }
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) =
                (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            let octet = hi * 16 + lo;
            if is_unreserved(octet) {
                out.push(octet);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    // Only ASCII escape triplets were replaced, with ASCII octets
    String::from_utf8(out).expect("canonicalized path is valid UTF-8")
}

/// Default port for a scheme, used when the builder set a scheme but no port
pub(crate) fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

/// Thunk producing response content at dispatch time
pub type ContentThunk = Arc<dyn Fn() -> anyhow::Result<Bytes> + Send + Sync>;

/// Async thunk producing response content at dispatch time
pub type AsyncContentThunk =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

/// A streamed entity body
pub type ContentStream = BoxStream<'static, io::Result<Bytes>>;

/// Thunk opening a fresh content stream per dispatch. A thunk rather than a
/// handle: memoizing an open stream would break reusable recipes.
pub type StreamThunk = Arc<
    dyn Fn() -> BoxFuture<'static, anyhow::Result<ContentStream>>
        + Send
        + Sync,
>;

/// Thunk producing headers at dispatch time, merged over the static ones
pub type HeaderThunk =
    Arc<dyn Fn() -> anyhow::Result<HeaderMap> + Send + Sync>;

/// Callback invoked with the request before the response is synthesized.
/// Failures propagate to the dispatcher unchanged.
pub type PreDispatchCallback = Arc<
    dyn for<'a> Fn(
            &'a InterceptedRequest,
            &'a UserData,
        ) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// How a recipe produces its entity body
#[derive(Clone, Default)]
pub enum ContentProducer {
    #[default]
    Empty,
    /// Shared by reference across dispatches; `Bytes` clones are refcounts
    Static(Bytes),
    /// Re-evaluated on every dispatch; the produced bytes are never cached
    Thunk(ContentThunk),
    AsyncThunk(AsyncContentThunk),
    /// Opens a fresh stream on every dispatch
    Stream(StreamThunk),
}

impl Debug for ContentProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Static(bytes) => {
                write!(f, "Static(<{} bytes>)", bytes.len())
            }
            Self::Thunk(_) => write!(f, "Thunk(..)"),
            Self::AsyncThunk(_) => write!(f, "AsyncThunk(..)"),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Opaque per-recipe map handed to pre-dispatch callbacks. Values are
/// type-erased; readers downcast.
#[derive(Clone, Default)]
pub struct UserData(Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>);

impl UserData {
    pub(crate) fn new(
        map: HashMap<String, Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self(Arc::new(map))
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.0.get(key)?.downcast_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// A registered match-and-respond entry. Logically immutable: every field is
/// a snapshot taken at registration, so mutating the originating builder
/// afterwards changes nothing here. Callbacks and thunks are user-owned
/// closures; the recipe only holds references to them.
pub struct Recipe {
    pub(crate) id: RecipeId,
    /// `None` for predicate-style recipes, which live in the registry's
    /// predicate list instead of the keyed index
    pub(crate) key: Option<CanonicalKey>,
    pub(crate) matchers: Vec<RequestMatcher>,
    /// Absent sorts below every explicit priority
    pub(crate) priority: Option<u32>,
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) version: Option<HttpVersion>,
    pub(crate) response_headers: HeaderMap,
    pub(crate) response_headers_thunk: Option<HeaderThunk>,
    pub(crate) content_headers: HeaderMap,
    pub(crate) content_headers_thunk: Option<HeaderThunk>,
    pub(crate) content: ContentProducer,
    pub(crate) callback: Option<PreDispatchCallback>,
    pub(crate) reusable: bool,
    pub(crate) consumed: AtomicBool,
    pub(crate) user_data: UserData,
}

impl Recipe {
    pub fn id(&self) -> RecipeId {
        self.id
    }

    pub fn key(&self) -> Option<&CanonicalKey> {
        self.key.as_ref()
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Has a single-use recipe already been claimed by a dispatch?
    pub fn is_consumed(&self) -> bool {
        !self.reusable && self.consumed.load(Ordering::Acquire)
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    pub(crate) fn callback(&self) -> Option<&PreDispatchCallback> {
        self.callback.as_ref()
    }

    /// Does the request satisfy this recipe's canonical key (if keyed) and
    /// every attached matcher?
    pub(crate) fn matches(&self, request: &InterceptedRequest) -> bool {
        self.key
            .as_ref()
            .is_none_or(|key| key.matches(request))
            && RequestMatcher::matches_all(&self.matchers, request)
    }

    /// Claim this recipe for a dispatch. Single-use recipes are claimed
    /// atomically so they dispatch at most once under concurrent lookups;
    /// reusable recipes always succeed.
    pub(crate) fn try_claim(&self) -> bool {
        self.reusable
            || self
                .consumed
                .compare_exchange(
                    false,
                    true,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    /// Materialize the response for one dispatch: evaluate header thunks
    /// over the static headers, produce the entity lazily (fresh stream per
    /// dispatch), and assemble the response object. Thunk failures propagate
    /// as callback failures; the request's cancellation signal is honored at
    /// every await.
    pub(crate) async fn synthesize(
        &self,
        request: &InterceptedRequest,
    ) -> Result<SynthesizedResponse, DispatchError> {
        let cancellation = request.cancellation();

        let mut headers = self.response_headers.clone();
        if let Some(thunk) = &self.response_headers_thunk {
            merge_headers(&mut headers, thunk()?);
        }
        let mut content_headers = self.content_headers.clone();
        if let Some(thunk) = &self.content_headers_thunk {
            merge_headers(&mut content_headers, thunk()?);
        }

        let body = match &self.content {
            ContentProducer::Empty => ResponseBody::default(),
            ContentProducer::Static(bytes) => {
                ResponseBody::Buffered(bytes.clone())
            }
            ContentProducer::Thunk(thunk) => ResponseBody::Buffered(thunk()?),
            ContentProducer::AsyncThunk(thunk) => {
                let bytes = cancellation
                    .run_until_cancelled(thunk())
                    .await
                    .ok_or(DispatchError::Cancelled)??;
                ResponseBody::Buffered(bytes)
            }
            ContentProducer::Stream(open) => {
                let stream = cancellation
                    .run_until_cancelled(open())
                    .await
                    .ok_or(DispatchError::Cancelled)??;
                ResponseBody::Stream(stream)
            }
        };

        Ok(SynthesizedResponse {
            status: self.status,
            reason: self.reason.clone(),
            version: self.version.unwrap_or_default(),
            headers,
            content_headers,
            body,
        })
    }
}

impl Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("matchers", &self.matchers)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("reusable", &self.reusable)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

/// Merge thunk-produced headers over static ones: any name the overlay
/// defines replaces the static values wholesale, preserving multi-values
/// within the overlay
pub(crate) fn merge_headers(base: &mut HeaderMap, overlay: HeaderMap) {
    for name in overlay.keys() {
        base.remove(name);
    }
    let mut last_name: Option<HeaderName> = None;
    for (name, value) in overlay {
        if let Some(name) = name {
            last_name = Some(name);
        }
        if let Some(name) = &last_name {
            base.append(name.clone(), value);
        }
    }
}
