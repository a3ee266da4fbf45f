//! Serde model of the bundle document. Field names and defaults follow the
//! published schema; anything unknown is ignored so documents can carry
//! annotations for other tooling.

use http::StatusCode;
use indexmap::IndexMap;
use serde::Deserialize;

/// Root of a bundle document
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Bundle {
    /// Informational
    pub id: Option<String>,
    /// Informational
    pub comment: Option<String>,
    /// Schema version; this loader understands version 1
    pub version: Option<u32>,
    pub items: Vec<BundleItem>,
}

/// One request-response recipe in a bundle
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundleItem {
    /// Informational, but also used to label errors
    pub id: Option<String>,
    /// Informational
    pub comment: Option<String>,
    /// Defaults to `GET`
    pub method: Option<String>,
    /// Absolute URI, decomposed into canonical key components
    pub uri: Option<String>,
    /// HTTP version marker, e.g. `HTTP/2.0`
    pub version: Option<String>,
    /// Defaults to 200
    pub status: Option<StatusField>,
    /// Required request headers; each header matches by value-set equality
    pub request_headers: IndexMap<String, OneOrMany>,
    /// Response message headers
    pub response_headers: IndexMap<String, OneOrMany>,
    /// Entity (content) headers
    pub content_headers: IndexMap<String, OneOrMany>,
    /// One of `string` (the default), `json`, `base64`
    pub content_format: Option<String>,
    pub content_string: Option<String>,
    pub content_json: Option<serde_json::Value>,
    pub content_base64: Option<String>,
    /// Widen the canonical key: match any host
    pub ignore_host: bool,
    /// Widen the canonical key: match any path
    pub ignore_path: bool,
    /// Widen the canonical key: match any query
    pub ignore_query: bool,
    pub priority: Option<u32>,
    /// When true, the item is not registered
    pub skip: bool,
}

impl BundleItem {
    /// Label for error messages: the item's `id` or its position
    pub(crate) fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("#{index}"))
    }
}

/// A status as the document spells it: a code or a standard status name
/// (`404` or `"NotFound"`)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StatusField {
    Code(u16),
    Name(String),
}

/// A header value that may be a single string or an array of strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub(crate) fn values(&self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

/// Resolve a standard status name (`NotFound`, `Not Found`, `ImATeapot`) to
/// its code by comparing against canonical reason phrases, ignoring case and
/// punctuation
pub(crate) fn parse_status_name(name: &str) -> Option<StatusCode> {
    fn normalize(s: &str) -> String {
        s.chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase()
    }

    let normalized = normalize(name);
    (100..=599)
        .filter_map(|code| StatusCode::from_u16(code).ok())
        .find(|status| {
            status
                .canonical_reason()
                .is_some_and(|reason| normalize(reason) == normalized)
        })
}
