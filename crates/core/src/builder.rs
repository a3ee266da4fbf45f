//! Fluent assembly of recipes. The builder is intentionally mutable so a
//! test can chain several registrations off one builder; the registry
//! defensively snapshots on [RecipeBuilder::register_with], so recipes
//! already registered never observe later mutations.

use crate::{
    http::{HttpMethod, HttpVersion, InterceptedRequest},
    matcher::RequestMatcher,
    recipe::{
        AsyncContentThunk, CanonicalKey, ContentProducer, ContentThunk,
        HeaderThunk, KeyPart, PreDispatchCallback, QueryKey, Recipe,
        RecipeId, StreamThunk, UserData, canonicalize_path, default_port,
    },
    registry::Registry,
};
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use mime::Mime;
use reqwest::{
    StatusCode,
    header::{
        self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderName,
        InvalidHeaderValue,
    },
};
use serde::Serialize;
use std::{
    any::Any,
    collections::HashMap,
    io,
    sync::{Arc, atomic::AtomicBool},
};
use thiserror::Error;

/// Error from registering a builder in an inconsistent state. Reported at
/// registration time, never at dispatch time.
#[derive(Debug, Error)]
pub enum RecipeBuildError {
    #[error("Invalid status code {0}")]
    InvalidStatus(u16),

    #[error("Invalid header name `{name}`")]
    InvalidHeaderName {
        name: String,
        #[source]
        error: InvalidHeaderName,
    },

    #[error("Invalid value for header `{name}`")]
    InvalidHeaderValue {
        name: String,
        #[source]
        error: InvalidHeaderValue,
    },

    #[error("Error serializing JSON content")]
    JsonContent(#[source] serde_json::Error),
}

/// Query precondition as the user expressed it; the last call wins, the two
/// styles never combine
#[derive(Clone, Debug)]
enum BuilderQuery {
    Verbatim(String),
    Params(Vec<(String, String)>),
}

/// Mutable fluent assembler for [Recipe]s.
///
/// Operations fall into two phases: preconditions (what to match) and
/// postconditions (how to respond). The [Self::requests] and
/// [Self::responds] markers separate them in a chain for readability:
///
/// ```
/// # use waylay_core::{builder::RecipeBuilder, http::HttpMethod, registry::Registry};
/// let registry = Registry::new();
/// RecipeBuilder::new()
///     .requests()
///     .method(HttpMethod::Get)
///     .host("api.example")
///     .path("/terms")
///     .responds()
///     .status(200)
///     .json(&serde_json::json!({"id": 1}))
///     .register_with(&registry)
///     .unwrap();
/// ```
#[derive(Default)]
pub struct RecipeBuilder {
    method: Option<HttpMethod>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    query: Option<BuilderQuery>,
    /// Raw header requirements, validated at registration
    header_requirements: Vec<(String, Vec<String>)>,
    /// Content and raw-predicate sub-matchers
    extra_matchers: Vec<RequestMatcher>,
    /// Free-form predicate replacing the canonical key entirely
    matched_by:
        Option<Arc<dyn Fn(&InterceptedRequest) -> bool + Send + Sync>>,
    priority: Option<u32>,
    status: Option<u16>,
    reason: Option<String>,
    version: Option<HttpVersion>,
    response_headers: Vec<(String, String)>,
    response_headers_thunk: Option<HeaderThunk>,
    content_headers: Vec<(String, String)>,
    content_headers_thunk: Option<HeaderThunk>,
    content: ContentProducer,
    callback: Option<PreDispatchCallback>,
    single_use: bool,
    user_data: HashMap<String, Arc<dyn Any + Send + Sync>>,
    /// Deferred misuse (e.g. unserializable JSON), surfaced at registration
    error: Option<RecipeBuildError>,
}

impl std::fmt::Debug for RecipeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeBuilder")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("header_requirements", &self.header_requirements)
            .field("extra_matchers", &self.extra_matchers)
            .field("matched_by", &self.matched_by.as_ref().map(|_| "<closure>"))
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("version", &self.version)
            .field("response_headers", &self.response_headers)
            .field(
                "response_headers_thunk",
                &self.response_headers_thunk.as_ref().map(|_| "<closure>"),
            )
            .field("content_headers", &self.content_headers)
            .field(
                "content_headers_thunk",
                &self.content_headers_thunk.as_ref().map(|_| "<closure>"),
            )
            .field("content", &self.content)
            .field("callback", &self.callback.as_ref().map(|_| "<closure>"))
            .field("single_use", &self.single_use)
            .field("user_data", &self.user_data.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

impl RecipeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase marker opening the precondition phase. Purely cosmetic.
    pub fn requests(self) -> Self {
        self
    }

    /// Phase marker opening the postcondition phase. Purely cosmetic.
    pub fn responds(self) -> Self {
        self
    }

    // ===== Preconditions =====

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into().to_ascii_lowercase());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into().to_ascii_lowercase());
        self
    }

    /// Match any host. This is the default; the switch exists to back out of
    /// an earlier [Self::host] call when reusing a builder.
    pub fn any_host(mut self) -> Self {
        self.host = None;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Require the query string to match byte-for-byte. Overwrites any
    /// earlier [Self::query_params] call.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        let query = query.strip_prefix('?').map(str::to_owned).unwrap_or(query);
        self.query = Some(BuilderQuery::Verbatim(query));
        self
    }

    /// Require the query string to contain exactly these `k=v` pairs,
    /// ignoring order. Overwrites any earlier [Self::query] call.
    pub fn query_params(
        mut self,
        params: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.query = Some(BuilderQuery::Params(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ));
        self
    }

    /// Require a header with exactly this value
    pub fn requires_header(
        self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.requires_header_values(name, [value])
    }

    /// Require a header whose values equal this set (order-insensitive,
    /// case-insensitive)
    pub fn requires_header_values(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.header_requirements.push((
            name.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Require a header to be present, with any value
    pub fn requires_header_present(self, name: impl Into<String>) -> Self {
        self.requires_header_values(name, Vec::<String>::new())
    }

    /// Require the request body to satisfy a predicate. Evaluating it
    /// buffers the body; callbacks replay the same bytes.
    pub fn body_matches(
        mut self,
        predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.extra_matchers
            .push(RequestMatcher::Content(Arc::new(predicate)));
        self
    }

    /// Attach a raw predicate *in addition* to the canonical key. For a
    /// recipe matched *only* by predicate, see [Self::matched_by].
    pub fn matching(
        mut self,
        predicate: impl Fn(&InterceptedRequest) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.extra_matchers
            .push(RequestMatcher::Predicate(Arc::new(predicate)));
        self
    }

    /// Match by free-form predicate instead of canonical key. The recipe
    /// goes to the registry's predicate list, where selection is by
    /// [Self::priority] then recency.
    pub fn matched_by(
        mut self,
        predicate: impl Fn(&InterceptedRequest) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.matched_by = Some(Arc::new(predicate));
        self
    }

    /// Selection priority among predicate recipes. Unset is lowest.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    // ===== Postconditions =====

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn version(mut self, version: HttpVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Respond with static content bytes, shared by reference across
    /// dispatches
    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = ContentProducer::Static(content.into());
        self
    }

    /// Respond with content produced fresh on every dispatch
    pub fn content_thunk(
        mut self,
        thunk: impl Fn() -> anyhow::Result<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.content = ContentProducer::Thunk(Arc::new(thunk) as ContentThunk);
        self
    }

    /// Respond with content produced by an async thunk on every dispatch
    pub fn content_async<F, Fut>(mut self, thunk: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let thunk: AsyncContentThunk = Arc::new(move || thunk().boxed());
        self.content = ContentProducer::AsyncThunk(thunk);
        self
    }

    /// Respond with a streamed body. The opener runs on every dispatch so
    /// each one gets a fresh stream.
    pub fn content_stream<F, S>(mut self, open: F) -> Self
    where
        F: Fn() -> anyhow::Result<S> + Send + Sync + 'static,
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let thunk: StreamThunk = Arc::new(move || {
            let stream = open().map(StreamExt::boxed);
            futures::future::ready(stream).boxed()
        });
        self.content = ContentProducer::Stream(thunk);
        self
    }

    /// Respond with the canonical JSON serialization of a value, and set the
    /// entity `Content-Type` accordingly. Serialization failures surface at
    /// registration.
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.content = ContentProducer::Static(bytes.into());
                self.content_type(mime::APPLICATION_JSON)
            }
            Err(error) => {
                self.error
                    .get_or_insert(RecipeBuildError::JsonContent(error));
                self
            }
        }
    }

    /// Set the entity `Content-Type` header
    pub fn content_type(mut self, mime: Mime) -> Self {
        self.content_headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        self.content_headers
            .push((header::CONTENT_TYPE.to_string(), mime.to_string()));
        self
    }

    /// Add a response message header. Repeat for multi-valued headers.
    pub fn response_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.response_headers.push((name.into(), value.into()));
        self
    }

    /// Produce response message headers at dispatch time, merged over the
    /// static ones
    pub fn response_headers_thunk(
        mut self,
        thunk: impl Fn() -> anyhow::Result<HeaderMap> + Send + Sync + 'static,
    ) -> Self {
        self.response_headers_thunk = Some(Arc::new(thunk));
        self
    }

    /// Add an entity (content) header. Repeat for multi-valued headers.
    pub fn content_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.content_headers.push((name.into(), value.into()));
        self
    }

    /// Produce entity headers at dispatch time, merged over the static ones
    pub fn content_headers_thunk(
        mut self,
        thunk: impl Fn() -> anyhow::Result<HeaderMap> + Send + Sync + 'static,
    ) -> Self {
        self.content_headers_thunk = Some(Arc::new(thunk));
        self
    }

    /// Run a callback with the request before the response is synthesized.
    /// Failures propagate to the dispatcher unchanged.
    pub fn on_request(
        mut self,
        callback: impl Fn(
            &InterceptedRequest,
            &UserData,
        ) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(move |request, user_data| {
            futures::future::ready(callback(request, user_data)).boxed()
        }));
        self
    }

    /// Async form of [Self::on_request]. The returned future can't borrow
    /// the request; clone what it needs up front:
    ///
    /// ```
    /// # use waylay_core::builder::RecipeBuilder;
    /// RecipeBuilder::new().on_request_async(|request, _| {
    ///     let url = request.url().clone();
    ///     async move {
    ///         println!("intercepted {url}");
    ///         Ok(())
    ///     }
    /// });
    /// ```
    pub fn on_request_async<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(&InterceptedRequest, &UserData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callback = Some(Arc::new(move |request, user_data| {
            callback(request, user_data).boxed()
        }));
        self
    }

    /// Consume the recipe after its first successful dispatch; later
    /// matching requests fall through to the next candidate
    pub fn single_use(mut self) -> Self {
        self.single_use = true;
        self
    }

    pub fn reusable(mut self, reusable: bool) -> Self {
        self.single_use = !reusable;
        self
    }

    /// Attach an opaque value handed to pre-dispatch callbacks
    pub fn user_data(
        mut self,
        key: impl Into<String>,
        value: impl Any + Send + Sync,
    ) -> Self {
        self.user_data.insert(key.into(), Arc::new(value));
        self
    }

    /// Snapshot this builder into a recipe and install it in the registry.
    /// Returns the builder unchanged, so a test can keep mutating it for
    /// further registrations; the installed recipe never observes those
    /// mutations.
    pub fn register_with(
        mut self,
        registry: &Registry,
    ) -> Result<Self, RecipeBuildError> {
        let recipe = self.snapshot()?;
        registry.register(Arc::new(recipe));
        Ok(self)
    }

    /// Validate and freeze the current builder state
    fn snapshot(&mut self) -> Result<Recipe, RecipeBuildError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let status = self.status.map_or(Ok(StatusCode::OK), |status| {
            StatusCode::from_u16(status)
                .map_err(|_| RecipeBuildError::InvalidStatus(status))
        })?;

        let mut matchers: Vec<RequestMatcher> = self
            .header_requirements
            .iter()
            .map(|(name, values)| {
                Ok(RequestMatcher::Header {
                    name: parse_header_name(name)?,
                    expected: values.clone(),
                })
            })
            .collect::<Result<_, RecipeBuildError>>()?;
        matchers.extend(self.extra_matchers.iter().cloned());

        let key = if let Some(predicate) = &self.matched_by {
            matchers.push(RequestMatcher::Predicate(Arc::clone(predicate)));
            None
        } else {
            Some(self.canonical_key(&matchers))
        };

        Ok(Recipe {
            id: RecipeId::new(),
            key,
            matchers,
            priority: self.priority,
            status,
            reason: self.reason.clone(),
            version: self.version,
            response_headers: build_headers(&self.response_headers)?,
            response_headers_thunk: self.response_headers_thunk.clone(),
            content_headers: build_headers(&self.content_headers)?,
            content_headers_thunk: self.content_headers_thunk.clone(),
            content: self.content.clone(),
            callback: self.callback.clone(),
            reusable: !self.single_use,
            consumed: AtomicBool::new(false),
            user_data: UserData::new(self.user_data.clone()),
        })
    }

    fn canonical_key(&self, matchers: &[RequestMatcher]) -> CanonicalKey {
        let scheme = self.scheme.clone();
        // Port defaults from the scheme when one was given
        let port = match (self.port, &scheme) {
            (Some(port), _) => KeyPart::Exact(port),
            (None, Some(scheme)) => {
                default_port(scheme).map_or(KeyPart::Any, KeyPart::Exact)
            }
            (None, None) => KeyPart::Any,
        };
        let query = match &self.query {
            None => QueryKey::Any,
            Some(BuilderQuery::Verbatim(query)) => {
                QueryKey::Verbatim(query.clone())
            }
            Some(BuilderQuery::Params(params)) => {
                QueryKey::Params(params.iter().cloned().collect())
            }
        };
        CanonicalKey {
            method: self.method.into(),
            scheme: scheme.into(),
            host: self.host.clone().into(),
            port,
            path: self.path.as_deref().map(canonicalize_path).into(),
            query,
            header_fingerprint: CanonicalKey::fingerprint(matchers),
        }
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName, RecipeBuildError> {
    HeaderName::try_from(name).map_err(|error| {
        RecipeBuildError::InvalidHeaderName {
            name: name.to_owned(),
            error,
        }
    })
}

/// Build a header multimap from raw pairs, validating names and values
fn build_headers(
    pairs: &[(String, String)],
) -> Result<HeaderMap, RecipeBuildError> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = parse_header_name(name)?;
        let value = HeaderValue::try_from(value.as_str()).map_err(|error| {
            RecipeBuildError::InvalidHeaderValue {
                name: name.to_string(),
                error,
            }
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}
