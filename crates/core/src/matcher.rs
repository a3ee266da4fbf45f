//! The matcher algebra: predicates deciding whether a request satisfies a
//! recipe's preconditions. A recipe built via the fluent builder carries zero
//! or more of these *in addition* to its canonical key; a predicate-style
//! recipe carries a single free-form [RequestMatcher::Predicate] instead of a
//! key.

use crate::http::InterceptedRequest;
use itertools::Itertools;
use reqwest::header::HeaderName;
use std::{
    fmt::{self, Debug},
    sync::Arc,
};
use tracing::warn;

/// Free-form predicate over the whole request. Must be pure with respect to
/// the request; side effects are undefined behavior.
pub type RequestPredicate =
    Arc<dyn Fn(&InterceptedRequest) -> bool + Send + Sync>;

/// Predicate over the buffered request body bytes
pub type ContentPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A single precondition on a request. All matchers attached to a recipe must
/// accept for the recipe to match.
#[derive(Clone)]
pub enum RequestMatcher {
    /// The named header must be present. A non-empty expected list is
    /// compared against the request's values for that header as a set,
    /// case-insensitively. An empty list means "present with any value".
    Header {
        name: HeaderName,
        expected: Vec<String>,
    },
    /// Predicate over the request body. Reading the body for evaluation
    /// buffers it; the callback and response path replay the same bytes.
    Content(ContentPredicate),
    /// Free-form predicate over the request
    Predicate(RequestPredicate),
}

impl RequestMatcher {
    /// Does the request satisfy this precondition?
    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        match self {
            Self::Header { name, expected } => {
                let actual: Vec<&str> = request
                    .headers()
                    .get_all(name)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .collect();
                if actual.is_empty() {
                    return false;
                }
                if expected.is_empty() {
                    // Presence with any value
                    return true;
                }
                value_set(actual) == value_set(expected.iter().map(String::as_str))
            }
            Self::Content(predicate) => match request.body().bytes() {
                Ok(bytes) => predicate(bytes),
                Err(error) => {
                    // A matcher is a pure bool per its contract, so an
                    // unreadable body is a non-match rather than an error
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "Failed to buffer request body for matching"
                    );
                    false
                }
            },
            Self::Predicate(predicate) => predicate(request),
        }
    }

    /// Do all matchers accept the request? Short-circuits on the first
    /// rejection.
    pub fn matches_all(
        matchers: &[RequestMatcher],
        request: &InterceptedRequest,
    ) -> bool {
        matchers.iter().all(|matcher| matcher.matches(request))
    }
}

impl Debug for RequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header { name, expected } => f
                .debug_struct("Header")
                .field("name", name)
                .field("expected", expected)
                .finish(),
            Self::Content(_) => f.debug_tuple("Content").field(&"..").finish(),
            Self::Predicate(_) => {
                f.debug_tuple("Predicate").field(&"..").finish()
            }
        }
    }
}

/// Normalize a list of header values for set comparison: lowercase, sorted,
/// deduplicated
fn value_set<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    values
        .into_iter()
        .map(str::to_ascii_lowercase)
        .sorted()
        .dedup()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{HttpMethod, RequestBody},
        test_util::header_map,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn request(headers: &[(&str, &str)]) -> InterceptedRequest {
        InterceptedRequest::new(
            HttpMethod::Get,
            "https://api.example/".parse().unwrap(),
        )
        .with_headers(header_map(headers.iter().copied()))
    }

    /// Header names and values are compared case-insensitively, values as a
    /// set
    #[rstest]
    #[case::exact(&[("Accept", "application/json")], true)]
    #[case::case_insensitive(&[("accept", "APPLICATION/JSON")], true)]
    #[case::absent(&[("Content-Type", "application/json")], false)]
    #[case::wrong_value(&[("Accept", "application/xml")], false)]
    #[case::extra_value(
        &[("Accept", "application/json"), ("Accept", "text/html")],
        false
    )]
    fn test_header_matcher(
        #[case] headers: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let matcher = RequestMatcher::Header {
            name: HeaderName::from_static("accept"),
            expected: vec!["application/json".into()],
        };
        assert_eq!(matcher.matches(&request(headers)), expected);
    }

    /// An empty expected list means "present with any value"
    #[rstest]
    #[case::present(&[("Authorization", "Bearer xyz")], true)]
    #[case::absent(&[], false)]
    fn test_header_matcher_any_value(
        #[case] headers: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let matcher = RequestMatcher::Header {
            name: HeaderName::from_static("authorization"),
            expected: Vec::new(),
        };
        assert_eq!(matcher.matches(&request(headers)), expected);
    }

    /// Multi-valued headers compare as sets, ignoring order and duplicates
    #[test]
    fn test_header_matcher_value_set() {
        let matcher = RequestMatcher::Header {
            name: HeaderName::from_static("accept"),
            expected: vec!["text/html".into(), "application/json".into()],
        };
        let request = request(&[
            ("Accept", "application/json"),
            ("Accept", "text/html"),
            ("Accept", "TEXT/HTML"),
        ]);
        assert!(matcher.matches(&request));
    }

    /// Evaluating a content predicate buffers the body; the body stays
    /// readable afterwards with identical bytes
    #[test]
    fn test_content_matcher_replays_body() {
        let matcher = RequestMatcher::Content(Arc::new(|bytes: &[u8]| {
            bytes.starts_with(b"{")
        }));
        let request = InterceptedRequest::new(
            HttpMethod::Post,
            "https://api.example/".parse().unwrap(),
        )
        .with_body(RequestBody::from_reader(std::io::Cursor::new(
            b"{\"id\":1}".to_vec(),
        )));

        assert!(matcher.matches(&request));
        // The matcher consumed nothing: the callback path reads the same
        // bytes
        assert_eq!(request.body().bytes().unwrap().as_ref(), b"{\"id\":1}");
    }

    #[test]
    fn test_matches_all_short_circuits() {
        let request = request(&[]);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counting = {
            let hits = Arc::clone(&hits);
            RequestMatcher::Predicate(Arc::new(move |_| {
                hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                true
            }))
        };
        let matchers = [
            RequestMatcher::Predicate(Arc::new(|_| false)),
            counting,
        ];
        assert!(!RequestMatcher::matches_all(&matchers, &request));
        assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
