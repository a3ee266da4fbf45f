//! HTTP-related data types. The core deals in two shapes: an
//! [InterceptedRequest], which is the structured outgoing request handed to us
//! by the host's HTTP client, and a [SynthesizedResponse], which is the
//! locally fabricated reply. Neither ever touches a socket.

use bytes::Bytes;
use futures::{TryStreamExt, stream::BoxStream};
use itertools::Itertools;
use reqwest::{
    StatusCode, Url,
    header::{self, HeaderMap, HeaderValue},
};
use std::{
    fmt::{self, Debug, Display},
    io::{self, Read},
    str::FromStr,
    sync::{Mutex, OnceLock},
};
use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// [HTTP request method](https://developer.mozilla.org/en-US/docs/Web/HTTP/Reference/Methods)
// This is duplicated from [reqwest::Method] so the method can participate in
// canonical keys (which need `Eq + Hash`) and parse case-insensitively.
#[derive(Copy, Clone, Debug, Eq, EnumIter, Hash, PartialEq)]
pub enum HttpMethod {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
}

impl HttpMethod {
    pub fn to_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Trace => "TRACE",
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

impl FromStr for HttpMethod {
    type Err = HttpMethodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONNECT" => Ok(Self::Connect),
            "DELETE" => Ok(Self::Delete),
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "PATCH" => Ok(Self::Patch),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "TRACE" => Ok(Self::Trace),
            _ => Err(HttpMethodParseError {
                input: s.to_owned(),
            }),
        }
    }
}

impl TryFrom<&reqwest::Method> for HttpMethod {
    type Error = HttpMethodParseError;

    /// reqwest supports custom methods; those can't be matched by canonical
    /// key, so they're a conversion error at the hook seam
    fn try_from(method: &reqwest::Method) -> Result<Self, Self::Error> {
        method.as_str().parse()
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Connect => reqwest::Method::CONNECT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Trace => reqwest::Method::TRACE,
        }
    }
}

#[derive(Debug, Error)]
#[error(
    "Invalid HTTP method `{input}`. Must be one of: {}",
    HttpMethod::iter().map(HttpMethod::to_str).format(", "),
)]
pub struct HttpMethodParseError {
    input: String,
}

/// HTTP protocol version marker for synthesized responses.
// A domain enum rather than [reqwest::Version] because recipes and bundle
// documents need to fabricate and parse one (`"HTTP/2.0"`), and that type
// only offers opaque constants copied off a live response.
#[derive(Copy, Clone, Debug, Default, EnumIter, Eq, Hash, PartialEq)]
pub enum HttpVersion {
    Http09,
    Http10,
    #[default]
    Http11,
    Http2,
    Http3,
}

impl HttpVersion {
    pub fn to_str(self) -> &'static str {
        match self {
            Self::Http09 => "HTTP/0.9",
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::Http2 => "HTTP/2.0",
            Self::Http3 => "HTTP/3.0",
        }
    }
}

impl Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

impl FromStr for HttpVersion {
    type Err = HttpVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HTTP/0.9" => Ok(Self::Http09),
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            "HTTP/2.0" => Ok(Self::Http2),
            "HTTP/3.0" => Ok(Self::Http3),
            _ => Err(HttpVersionParseError {
                input: s.to_owned(),
            }),
        }
    }
}

impl From<HttpVersion> for http::Version {
    fn from(version: HttpVersion) -> Self {
        match version {
            HttpVersion::Http09 => http::Version::HTTP_09,
            HttpVersion::Http10 => http::Version::HTTP_10,
            HttpVersion::Http11 => http::Version::HTTP_11,
            HttpVersion::Http2 => http::Version::HTTP_2,
            HttpVersion::Http3 => http::Version::HTTP_3,
        }
    }
}

#[derive(Debug, Error)]
#[error(
    "Invalid HTTP version `{input}`. Must be one of: {}",
    HttpVersion::iter().map(HttpVersion::to_str).format(", "),
)]
pub struct HttpVersionParseError {
    input: String,
}

/// An outgoing HTTP request as seen by the interception core. The host's
/// client hands one of these to the [hook](crate::http::InterceptHook)
/// instead of a socket. The core treats it as read-only; the body is the one
/// exception in mechanism (not in content), because reading it buffers the
/// bytes for replay.
#[derive(Debug)]
pub struct InterceptedRequest {
    method: HttpMethod,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
    cancellation: CancellationToken,
}

impl InterceptedRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::empty(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach the cancellation signal that rides with this request. Every
    /// await point during dispatch observes it.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl TryFrom<&reqwest::Request> for InterceptedRequest {
    type Error = HttpMethodParseError;

    /// Convert a request at the reqwest seam. Streaming request bodies can't
    /// be pulled out of [reqwest::Body] by reference, so they convert as
    /// empty; in-memory bodies convert losslessly.
    fn try_from(request: &reqwest::Request) -> Result<Self, Self::Error> {
        let body = request
            .body()
            .and_then(reqwest::Body::as_bytes)
            .map(|bytes| RequestBody::from(Bytes::copy_from_slice(bytes)))
            .unwrap_or_default();
        Ok(Self {
            method: request.method().try_into()?,
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
            cancellation: CancellationToken::new(),
        })
    }
}

/// A request body that buffers once on first read and replays. A content
/// matcher can inspect the bytes and a pre-dispatch callback can read them
/// again; both see identical content. Buffering is unbounded: the body is
/// test traffic, not production payloads.
pub struct RequestBody {
    buffered: OnceLock<Bytes>,
    source: Mutex<Option<Box<dyn Read + Send>>>,
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            buffered: OnceLock::new(),
            source: Mutex::new(None),
        }
    }

    /// A body backed by a reader. Nothing is read until the first call to
    /// [Self::bytes].
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            buffered: OnceLock::new(),
            source: Mutex::new(Some(Box::new(reader))),
        }
    }

    /// Get the body bytes, buffering from the source on first call. Later
    /// calls return the same buffer. An absent source reads as empty.
    pub fn bytes(&self) -> io::Result<&Bytes> {
        if let Some(bytes) = self.buffered.get() {
            return Ok(bytes);
        }
        let mut source = self.source.lock().expect("request body lock poisoned");
        // A concurrent reader may have buffered while we waited on the lock
        if let Some(bytes) = self.buffered.get() {
            return Ok(bytes);
        }
        let bytes = match source.take() {
            Some(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                buf.into()
            }
            None => Bytes::new(),
        };
        Ok(self.buffered.get_or_init(|| bytes))
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self {
            buffered: OnceLock::from(bytes),
            source: Mutex::new(None),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for RequestBody {
    fn from(body: String) -> Self {
        Bytes::from(body).into()
    }
}

#[cfg(any(test, feature = "test"))]
impl From<&str> for RequestBody {
    fn from(body: &str) -> Self {
        body.to_owned().into()
    }
}

impl Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't print the actual body, and don't force a buffering read
        match self.buffered.get() {
            Some(bytes) => f
                .debug_tuple("RequestBody")
                .field(&format!("<{} bytes>", bytes.len()))
                .finish(),
            None => f.debug_tuple("RequestBody").field(&"<unread>").finish(),
        }
    }
}

/// A locally fabricated HTTP response. Headers are split between the message
/// ([Self::headers]) and the entity body ([Self::content_headers]), matching
/// how they'd be produced on the wire; [Self::all_headers] flattens them for
/// hosts that don't make the distinction.
#[derive(Debug)]
pub struct SynthesizedResponse {
    pub status: StatusCode,
    /// Explicit reason phrase; absent means the status's canonical reason
    pub reason: Option<String>,
    pub version: HttpVersion,
    /// Message headers
    pub headers: HeaderMap,
    /// Entity (content) headers
    pub content_headers: HeaderMap,
    pub body: ResponseBody,
}

impl SynthesizedResponse {
    /// The sentinel response returned for unmatched requests in permissive
    /// mode: 200, no headers, no body.
    pub fn empty() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            version: HttpVersion::default(),
            headers: HeaderMap::new(),
            content_headers: HeaderMap::new(),
            body: ResponseBody::default(),
        }
    }

    /// The reason phrase for the status line: the explicit one if set,
    /// otherwise the status's canonical reason
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or_default()
    }

    /// Message and entity headers flattened into a single map, message
    /// headers first
    pub fn all_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        for (name, value) in &self.content_headers {
            headers.append(name, value.clone());
        }
        headers
    }

    /// Convert to an [http::Response], the lingua franca of Rust HTTP stacks.
    /// A buffered body gets a `Content-Length` header and a streamed body a
    /// `Transfer-Encoding: chunked` header, unless the recipe already set
    /// either. The reason phrase has no representation in [http::Response]
    /// and is dropped; read it via [Self::reason_phrase] before converting if
    /// the host cares.
    pub fn into_http(self) -> http::Response<ResponseBody> {
        let mut headers = self.all_headers();
        let framed = headers.contains_key(header::CONTENT_LENGTH)
            || headers.contains_key(header::TRANSFER_ENCODING);
        if !framed {
            match &self.body {
                ResponseBody::Buffered(bytes) => {
                    headers.insert(
                        header::CONTENT_LENGTH,
                        HeaderValue::from(bytes.len()),
                    );
                }
                ResponseBody::Stream(_) => {
                    headers.insert(
                        header::TRANSFER_ENCODING,
                        HeaderValue::from_static("chunked"),
                    );
                }
            }
        }

        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.version_mut() = self.version.into();
        *response.headers_mut() = headers;
        response
    }
}

/// Entity body of a synthesized response: either bytes produced up front, or
/// a stream opened fresh for this dispatch
pub enum ResponseBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl ResponseBody {
    /// Buffered content bytes; `None` for a streaming body
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            Self::Stream(_) => None,
        }
    }

    /// Resolve the body to bytes, draining the stream if necessary
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Self::Buffered(bytes) => Ok(bytes),
            Self::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.try_next().await? {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.into())
            }
        }
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::Buffered(Bytes::new())
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Buffered(bytes)
    }
}

impl Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f
                .debug_tuple("Buffered")
                .field(&format!("<{} bytes>", bytes.len()))
                .finish(),
            Self::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// An error that can occur while dispatching an intercepted request
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request's cancellation signal fired during dispatch. This is
    /// distinct from a timeout; the core never introduces timeouts.
    #[error("request was cancelled during dispatch")]
    Cancelled,

    /// No recipe accepted the request and no fallback produced a response.
    /// Only raised when the registry is in strict mode.
    #[error("no recipe is registered for {method} {url}")]
    Unmatched { method: HttpMethod, url: Url },

    /// A pre-dispatch callback, header thunk, content thunk, or stream
    /// opener failed. The user's original failure is propagated unchanged.
    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}
