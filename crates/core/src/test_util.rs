//! General test utilities, shared between this crate's tests and downstream
//! crates via the `test` feature

use crate::{
    http::{HttpMethod, InterceptedRequest},
    registry::Registry,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rstest::fixture;
use std::sync::Arc;

/// A fresh shared registry
#[fixture]
pub fn registry() -> Arc<Registry> {
    Arc::new(Registry::new())
}

/// Create a header map from a list of `(name, value)` pairs. Repeated names
/// become multi-valued headers.
pub fn header_map<'a>(
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::try_from(name).unwrap(),
            HeaderValue::try_from(value).unwrap(),
        );
    }
    map
}

/// An outgoing request with no headers or body
pub fn request(method: HttpMethod, url: &str) -> InterceptedRequest {
    InterceptedRequest::new(method, url.parse().unwrap())
}

/// An outgoing GET request
pub fn get(url: &str) -> InterceptedRequest {
    request(HttpMethod::Get, url)
}
